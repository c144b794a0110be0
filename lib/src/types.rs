mod block;
mod blockchain;
mod pool;
mod transaction;

pub use block::{Block, BlockHeader};
pub use blockchain::Blockchain;
pub use pool::BetPool;
pub use transaction::{Amount, BetId, ClosedBet, OpenBet, Transaction};
