use serde::{Deserialize, Serialize};
use uint::construct_uint;
construct_uint! {
// consisting of 4 x 64-bit words
#[derive(Serialize, Deserialize)]
pub struct U256(4);
}
pub mod crypto;
pub mod error;
pub mod network;
pub mod sha256;
pub mod types;
pub mod util;

// required leading zero bits of a block header digest, agreed network-wide
// ~20s per block on a laptop
pub const DIFFICULTY_BITS: u32 = 22;
// maximum number of transactions pulled into a freshly mined block
pub const BLOCK_TRANSACTION_CAP: usize = 10;
// every transaction travels as a fixed-size, NUL padded record
pub const TRANSACTION_RECORD_SIZE: usize = 64;
// prev_hash | timestamp | nonce | tx_count
pub const BLOCK_HEADER_SIZE: usize = 32 + 4 + 4 + 4;
// prev_hash | timestamp | nonce, the bytes covered by proof of work
pub const HASHED_HEADER_SIZE: usize = 32 + 4 + 4;
// answer to a zero-length (liveness) frame
pub const PING_MAGIC: u32 = 0x4141_4141;
// nonces are sampled, not enumerated
pub const MAX_NONCE: u32 = 1_000_000_000;

// ===== Rendezvous defaults =====
pub const DEFAULT_REGISTER_PORT: u16 = 60666;
pub const DEFAULT_LOOKUP_PORT: u16 = 60667;
pub const DEFAULT_LIST_PORT: u16 = 60668;
pub const DEFAULT_PEER_PORT: u16 = 60669;
