use crate::transport::Broadcast;
use betlib::error::Result;
use betlib::network::Message;
use betlib::types::{BetId, BetPool, OpenBet, Transaction};
use betlib::util::unix_now;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The node's pending-transaction pool: the bet state machine behind a lock,
/// plus gossip of locally submitted transactions.
pub struct Mempool {
    pool: Mutex<BetPool>,
    outbound: Arc<dyn Broadcast>,
}

impl Mempool {
    pub fn new(outbound: Arc<dyn Broadcast>) -> Self {
        Mempool {
            pool: Mutex::new(BetPool::new()),
            outbound,
        }
    }

    pub async fn submit_open(
        &self,
        originator: &str,
        event: &str,
        win_condition: &str,
        amount: &str,
        expiration_minutes: u64,
    ) -> Result<Transaction> {
        let transaction = self.pool.lock().place_bet(
            originator,
            event,
            win_condition,
            amount,
            expiration_minutes,
            unix_now(),
        )?;
        info!(bet = %transaction.bet_id(), "bet opened");
        self.gossip(&transaction).await;
        Ok(transaction)
    }

    /// Refuses unknown or expired bets without touching the pool.
    pub async fn submit_close(&self, bet_id: BetId, caller: &str) -> Result<Transaction> {
        let transaction = self.pool.lock().call_bet(bet_id, caller, unix_now())?;
        info!(bet = %bet_id, caller, "bet closed");
        self.gossip(&transaction).await;
        Ok(transaction)
    }

    /// Buffers a transaction record from an authenticated peer. The open map
    /// only changes once a block confirms it.
    pub fn receive_remote(&self, record: &[u8], sender: &str) {
        match Transaction::decode(record) {
            Ok(transaction) => {
                if self.pool.lock().enqueue(transaction, unix_now()) {
                    debug!(peer = %sender, "transaction buffered");
                }
            }
            Err(e) => warn!(peer = %sender, error = %e, "bad transaction record dropped"),
        }
    }

    pub fn collect(&self, n: usize) -> Vec<Transaction> {
        self.pool.lock().collect(n, unix_now())
    }

    pub fn reconcile<'a, I>(&self, confirmed: I)
    where
        I: IntoIterator<Item = &'a Transaction>,
    {
        self.pool.lock().reconcile(confirmed, unix_now());
    }

    pub fn list_open(&self) -> Vec<OpenBet> {
        self.pool.lock().list_open(unix_now())
    }

    pub fn list_for(&self, user_id: &str) -> Vec<OpenBet> {
        self.pool.lock().list_for(user_id, unix_now())
    }

    pub fn pending(&self) -> Vec<Transaction> {
        self.pool.lock().pending().cloned().collect()
    }

    async fn gossip(&self, transaction: &Transaction) {
        match Message::NewTransaction(transaction.clone()).encode() {
            Ok(payload) => {
                let delivered = self.outbound.broadcast(payload, None).await;
                debug!(delivered, "transaction gossiped");
            }
            Err(e) => warn!(error = %e, "transaction not gossiped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::Recorder;
    use betlib::network::split_payload;
    use betlib::network::MessageType;

    #[tokio::test]
    async fn submits_are_buffered_and_gossiped() {
        let recorder = Recorder::with_peers(2);
        let mempool = Mempool::new(recorder.clone());
        let open = mempool.submit_open("A", "rain", "yes", "50", 1).await.unwrap();

        assert_eq!(mempool.pending(), vec![open.clone()]);
        // the open map follows the chain, not local submits
        assert!(mempool.list_open().is_empty());

        let sent = recorder.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, None);
        let (message_type, body) = split_payload(&sent[0].0).unwrap();
        assert_eq!(message_type, MessageType::NewTransaction);
        assert_eq!(Transaction::decode(body).unwrap(), open);
    }

    #[tokio::test]
    async fn closing_an_unknown_bet_is_refused_quietly() {
        let recorder = Recorder::with_peers(1);
        let mempool = Mempool::new(recorder.clone());
        assert!(mempool.submit_close(BetId::new(), "B").await.is_err());
        assert!(mempool.pending().is_empty());
        assert!(recorder.sent().is_empty());
    }

    #[tokio::test]
    async fn remote_transactions_wait_for_a_block() {
        let recorder = Recorder::with_peers(1);
        let mempool = Mempool::new(recorder.clone());
        let bet = OpenBet::new("A", "rain", "yes", "50", 5, unix_now()).unwrap();
        let record = Transaction::Open(bet.clone()).encode().unwrap();

        mempool.receive_remote(&record, "127.0.0.3");
        mempool.receive_remote(&record, "127.0.0.3");
        mempool.receive_remote(b"garbage", "127.0.0.3");
        assert_eq!(mempool.pending().len(), 1);
        assert!(mempool.list_open().is_empty());

        let batch = mempool.collect(10);
        assert_eq!(batch, vec![Transaction::Open(bet.clone())]);
        assert_eq!(mempool.list_for("A"), vec![bet]);
        assert!(mempool.list_for("B").is_empty());

        // a close of the confirmed bet can now be submitted
        let close = mempool.submit_close(batch[0].bet_id(), "B").await.unwrap();
        assert!(matches!(close, Transaction::Closed(_)));
        assert!(mempool.list_open().is_empty());
        // nothing is gossiped for remote records, only for the local close
        assert_eq!(recorder.sent().len(), 1);
    }
}
