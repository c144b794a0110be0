use super::{BetId, ClosedBet, OpenBet, Transaction};
use crate::error::{LedgerError, Result};
use std::collections::{HashMap, HashSet, VecDeque};

/// Bet state that has not (or not only) been settled by the chain: the map of
/// callable bets and the buffer of this round's transactions waiting for a
/// block.
///
/// Every mutating method takes the current time and sweeps expired bets
/// before returning, so the open map never holds an expired bet between
/// calls.
#[derive(Debug, Default)]
pub struct BetPool {
    open: HashMap<BetId, OpenBet>,
    // bets whose close is already confirmed (or collected into our own block)
    settled: HashSet<BetId>,
    // bets we closed ourselves, kept until the close is settled or expires
    withdrawn: HashMap<BetId, OpenBet>,
    round: VecDeque<Transaction>,
}

impl BetPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an open bet and queues it for the next block.
    pub fn place_bet(
        &mut self,
        originator: &str,
        event: &str,
        win_condition: &str,
        amount: &str,
        expiration_minutes: u64,
        now: u64,
    ) -> Result<Transaction> {
        let bet = OpenBet::new(originator, event, win_condition, amount, expiration_minutes, now)?;
        let transaction = Transaction::Open(bet);
        // refuse anything that cannot travel
        transaction.encode()?;
        self.round.push_back(transaction.clone());
        self.sweep(now);
        Ok(transaction)
    }

    /// Settles a callable bet. Unknown or expired ids are refused and leave
    /// the pool untouched.
    pub fn call_bet(&mut self, bet_id: BetId, caller: &str, now: u64) -> Result<Transaction> {
        match self.open.get(&bet_id) {
            Some(bet) if !bet.is_expired(now) => {}
            _ => return Err(LedgerError::BetNotOpen(bet_id)),
        }
        let transaction = Transaction::Closed(ClosedBet::new(bet_id, caller)?);
        transaction.encode()?;
        if let Some(bet) = self.open.remove(&bet_id) {
            self.withdrawn.insert(bet_id, bet);
        }
        self.round.push_back(transaction.clone());
        self.sweep(now);
        Ok(transaction)
    }

    /// Queues a transaction heard from the network. Returns false for a
    /// duplicate already waiting in the buffer.
    pub fn enqueue(&mut self, transaction: Transaction, now: u64) -> bool {
        let fresh = !self.round.contains(&transaction);
        if fresh {
            self.round.push_back(transaction);
        }
        self.sweep(now);
        fresh
    }

    /// Takes up to `n` transactions from the front of the round buffer for a
    /// block we just mined and applies them to the open map.
    ///
    /// Opens that already expired or were already confirmed are dropped. A
    /// close is kept only while its bet is callable here (open, or withdrawn
    /// by our own close) and unexpired, so a block never settles an unknown
    /// bet or the same bet twice.
    pub fn collect(&mut self, n: usize, now: u64) -> Vec<Transaction> {
        let mut batch = Vec::with_capacity(n.min(self.round.len()));
        while batch.len() < n {
            let Some(transaction) = self.round.pop_front() else {
                break;
            };
            match &transaction {
                Transaction::Open(bet) => {
                    if bet.is_expired(now)
                        || self.open.contains_key(&bet.id)
                        || self.settled.contains(&bet.id)
                    {
                        continue;
                    }
                    self.open.insert(bet.id, bet.clone());
                }
                Transaction::Closed(close) => {
                    let referent = self
                        .open
                        .get(&close.bet_id)
                        .or_else(|| self.withdrawn.get(&close.bet_id));
                    match referent {
                        Some(bet) if !bet.is_expired(now) => {}
                        _ => continue,
                    }
                    if !self.settled.insert(close.bet_id) {
                        continue;
                    }
                    self.open.remove(&close.bet_id);
                    self.withdrawn.remove(&close.bet_id);
                }
            }
            batch.push(transaction);
        }
        self.sweep(now);
        batch
    }

    /// Rebuilds the open map by replaying every confirmed transaction in
    /// chain order. A close seen before its open is inert. Buffered
    /// transactions the chain already contains are dropped from the round.
    pub fn reconcile<'a, I>(&mut self, confirmed: I, now: u64)
    where
        I: IntoIterator<Item = &'a Transaction>,
    {
        let mut open = HashMap::new();
        let mut settled = HashSet::new();
        let mut included = HashSet::new();
        for transaction in confirmed {
            match transaction {
                Transaction::Open(bet) => {
                    open.insert(bet.id, bet.clone());
                }
                Transaction::Closed(close) => {
                    if open.remove(&close.bet_id).is_some() {
                        settled.insert(close.bet_id);
                    }
                }
            }
            included.insert(transaction);
        }
        self.round.retain(|transaction| {
            if included.contains(transaction) {
                return false;
            }
            match transaction {
                Transaction::Closed(close) => !settled.contains(&close.bet_id),
                Transaction::Open(_) => true,
            }
        });
        self.withdrawn.retain(|id, _| !settled.contains(id));
        self.open = open;
        self.settled = settled;
        self.sweep(now);
    }

    /// Callable bets, soonest expiry first. Expired entries are hidden even
    /// if they have not been swept yet.
    pub fn list_open(&self, now: u64) -> Vec<OpenBet> {
        let mut bets: Vec<OpenBet> = self
            .open
            .values()
            .filter(|bet| !bet.is_expired(now))
            .cloned()
            .collect();
        bets.sort_by(|a, b| a.expiration.cmp(&b.expiration).then(a.id.cmp(&b.id)));
        bets
    }

    pub fn list_for(&self, user_id: &str, now: u64) -> Vec<OpenBet> {
        self.list_open(now)
            .into_iter()
            .filter(|bet| bet.originator == user_id)
            .collect()
    }

    pub fn pending(&self) -> impl Iterator<Item = &Transaction> {
        self.round.iter()
    }

    fn sweep(&mut self, now: u64) {
        self.open.retain(|_, bet| !bet.is_expired(now));
        self.withdrawn.retain(|_, bet| !bet.is_expired(now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u64 = 1_700_000_000;

    fn open_id(transaction: &Transaction) -> BetId {
        match transaction {
            Transaction::Open(bet) => bet.id,
            Transaction::Closed(_) => panic!("expected an open bet"),
        }
    }

    #[test]
    fn placed_bets_wait_for_a_block() {
        let mut pool = BetPool::new();
        let tx = pool.place_bet("A", "rain", "yes", "50", 1, NOW).unwrap();
        assert!(pool.list_open(NOW).is_empty());
        assert_eq!(pool.pending().count(), 1);

        let batch = pool.collect(10, NOW);
        assert_eq!(batch, vec![tx.clone()]);
        assert_eq!(pool.pending().count(), 0);
        assert_eq!(pool.list_open(NOW)[0].id, open_id(&tx));
    }

    #[test]
    fn collect_takes_at_most_n_from_the_front() {
        let mut pool = BetPool::new();
        let placed: Vec<_> = (0..4)
            .map(|i| pool.place_bet("A", &format!("e{i}"), "y", "1", 5, NOW).unwrap())
            .collect();
        let batch = pool.collect(3, NOW);
        assert_eq!(batch, placed[..3].to_vec());
        assert_eq!(pool.pending().cloned().collect::<Vec<_>>(), placed[3..].to_vec());
    }

    #[test]
    fn closing_requires_an_open_unexpired_bet() {
        let mut pool = BetPool::new();
        let tx = pool.place_bet("A", "rain", "yes", "50", 1, NOW).unwrap();
        let id = open_id(&tx);
        assert!(matches!(
            pool.call_bet(id, "B", NOW),
            Err(LedgerError::BetNotOpen(_))
        ));
        pool.reconcile([&tx], NOW);
        assert!(matches!(
            pool.call_bet(id, "B", NOW + 61),
            Err(LedgerError::BetNotOpen(_))
        ));

        pool.reconcile([&tx], NOW);
        let close = pool.call_bet(id, "B", NOW + 10).unwrap();
        assert_eq!(close.bet_id(), id);
        assert!(pool.list_open(NOW + 10).is_empty());
        assert!(matches!(
            pool.call_bet(id, "C", NOW + 10),
            Err(LedgerError::BetNotOpen(_))
        ));
    }

    #[test]
    fn collect_then_apply_matches_direct_replay() {
        let mut pool = BetPool::new();
        let keep = pool.place_bet("A", "rain", "yes", "50", 5, NOW).unwrap();
        let gone = pool.place_bet("A", "snow", "no", "20", 5, NOW).unwrap();
        pool.enqueue(
            Transaction::Closed(ClosedBet::new(open_id(&gone), "B").unwrap()),
            NOW,
        );
        let batch = pool.collect(10, NOW);
        assert_eq!(batch.len(), 3);

        let mut replayed = BetPool::new();
        replayed.reconcile(batch.iter(), NOW);
        assert_eq!(pool.list_open(NOW), replayed.list_open(NOW));
        assert_eq!(pool.list_open(NOW).len(), 1);
        assert_eq!(pool.list_open(NOW)[0].id, open_id(&keep));
    }

    #[test]
    fn settled_bets_are_never_closed_twice() {
        let mut pool = BetPool::new();
        let open = pool.place_bet("A", "rain", "yes", "50", 5, NOW).unwrap();
        let id = open_id(&open);
        let first = Transaction::Closed(ClosedBet::new(id, "B").unwrap());
        let second = Transaction::Closed(ClosedBet::new(id, "C").unwrap());
        pool.enqueue(first.clone(), NOW);
        pool.enqueue(second.clone(), NOW);
        let batch = pool.collect(10, NOW);
        assert_eq!(batch, vec![open.clone(), first.clone()]);

        // a later round with another close of the same bet stays empty
        pool.enqueue(second.clone(), NOW);
        pool.reconcile([&open, &first], NOW);
        assert_eq!(pool.pending().count(), 0);
        assert!(pool.collect(10, NOW).is_empty());
    }

    #[test]
    fn closes_of_unknown_bets_are_never_collected() {
        let mut pool = BetPool::new();
        let stray = Transaction::Closed(ClosedBet::new(BetId::new(), "B").unwrap());
        assert!(pool.enqueue(stray, NOW));
        assert!(pool.collect(10, NOW).is_empty());
        assert_eq!(pool.pending().count(), 0);
    }

    #[test]
    fn closes_of_expired_bets_are_never_collected() {
        let mut pool = BetPool::new();
        let open = pool.place_bet("A", "rain", "yes", "50", 1, NOW).unwrap();
        pool.reconcile([&open], NOW);
        let late = Transaction::Closed(ClosedBet::new(open_id(&open), "B").unwrap());
        pool.enqueue(late, NOW + 30);
        assert!(pool.collect(10, NOW + 61).is_empty());

        // our own close is dropped the same way once its bet lapses
        let mut pool = BetPool::new();
        pool.reconcile([&open], NOW);
        pool.call_bet(open_id(&open), "B", NOW + 30).unwrap();
        assert!(pool.collect(10, NOW + 61).is_empty());
    }

    #[test]
    fn our_own_close_is_collected_after_the_open_left_the_map() {
        let mut pool = BetPool::new();
        let open = pool.place_bet("A", "rain", "yes", "50", 5, NOW).unwrap();
        pool.reconcile([&open], NOW);
        let close = pool.call_bet(open_id(&open), "B", NOW + 1).unwrap();
        assert!(pool.list_open(NOW + 1).is_empty());

        // a block without the close keeps it callable for our next block
        pool.reconcile([&open], NOW + 2);
        assert_eq!(pool.collect(10, NOW + 2), vec![close.clone()]);

        // once settled, a repeat of the close is inert
        pool.reconcile([&open, &close], NOW + 3);
        pool.enqueue(close, NOW + 3);
        assert!(pool.collect(10, NOW + 3).is_empty());
    }

    #[test]
    fn replay_ignores_closes_before_opens() {
        let bet = OpenBet::new("A", "rain", "yes", "1", 5, NOW).unwrap();
        let close = Transaction::Closed(ClosedBet::new(bet.id, "B").unwrap());
        let open = Transaction::Open(bet.clone());
        let mut pool = BetPool::new();
        pool.reconcile([&close, &open], NOW);
        assert_eq!(pool.list_open(NOW), vec![bet]);
    }

    #[test]
    fn reconcile_drops_confirmed_transactions_from_the_round() {
        let mut pool = BetPool::new();
        let bet = OpenBet::new("A", "rain", "yes", "1", 5, NOW).unwrap();
        let remote = Transaction::Open(bet);
        assert!(pool.enqueue(remote.clone(), NOW));
        assert!(!pool.enqueue(remote.clone(), NOW));
        let mine = pool.place_bet("B", "sun", "no", "2", 5, NOW).unwrap();
        pool.reconcile([&remote], NOW);
        assert_eq!(pool.pending().cloned().collect::<Vec<_>>(), vec![mine]);
        assert_eq!(pool.list_open(NOW).len(), 1);
    }

    #[test]
    fn expired_bets_disappear_after_reconcile() {
        let mut pool = BetPool::new();
        let tx = pool.place_bet("A", "rain", "yes", "50", 1, NOW).unwrap();
        let batch = pool.collect(10, NOW);
        assert_eq!(pool.list_open(NOW).len(), 1);
        // listing alone already hides it
        assert!(pool.list_open(NOW + 61).is_empty());
        pool.reconcile(batch.iter(), NOW + 61);
        assert!(pool.list_open(NOW + 61).is_empty());
        assert!(pool.list_for("A", NOW + 61).is_empty());
        assert_eq!(batch, vec![tx]);
    }

    #[test]
    fn closed_bets_stay_closed_on_every_replay() {
        let mut a = BetPool::new();
        let open = a.place_bet("A", "rain", "yes", "50", 5, NOW).unwrap();
        let block_one = a.collect(10, NOW);

        let mut b = BetPool::new();
        b.reconcile(block_one.iter(), NOW);
        let close = b.call_bet(open_id(&open), "B", NOW + 5).unwrap();
        let block_two = b.collect(10, NOW + 5);
        assert_eq!(block_two, vec![close]);

        let chain: Vec<_> = block_one.iter().chain(block_two.iter()).collect();
        for pool in [&mut a, &mut b] {
            pool.reconcile(chain.iter().copied(), NOW + 6);
            assert!(pool.list_open(NOW + 6).is_empty());
        }
    }

    #[test]
    fn user_listing_filters_on_originator() {
        let mut pool = BetPool::new();
        let a = pool.place_bet("A", "rain", "yes", "1", 5, NOW).unwrap();
        let b = pool.place_bet("B", "sun", "no", "1", 5, NOW).unwrap();
        pool.reconcile([&a, &b], NOW);
        let mine = pool.list_for("B", NOW);
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].id, open_id(&b));
    }
}
