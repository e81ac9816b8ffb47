use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingInsertOutcome {
    /// Entry was created; caller should send the request.
    Inserted,
    /// An in-flight entry already uses this correlation id.
    Duplicate,
    /// The table is at capacity.
    TooManyPending,
}

#[derive(Debug)]
pub struct PendingExpired<W> {
    pub request_id: String,
    pub waiter: W,
    pub age: std::time::Duration,
}

#[derive(Debug)]
struct PendingEntry<W> {
    created: Instant,
    deadline: Instant,
    waiter: W,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct DeadlineItem {
    deadline: Instant,
    request_id: String,
}

/// In-flight correlated requests keyed by request id, with a deadline heap for sweeping.
///
/// Every accessor that hands a waiter back removes its entry first, so a waiter is completed at
/// most once no matter which path (response, timeout, disconnect) reaches it.
#[derive(Debug)]
pub struct PendingTable<W> {
    max_pending: usize,
    entries: HashMap<String, PendingEntry<W>>,
    deadlines: BinaryHeap<Reverse<DeadlineItem>>,
}

impl<W> PendingTable<W> {
    pub fn new(max_pending: usize) -> Self {
        Self {
            max_pending,
            entries: HashMap::new(),
            deadlines: BinaryHeap::new(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub fn contains(&self, request_id: &str) -> bool {
        self.entries.contains_key(request_id)
    }

    /// On rejection the waiter is handed back so the caller can complete it.
    pub fn insert(
        &mut self,
        request_id: String,
        deadline: Instant,
        waiter: W,
    ) -> (PendingInsertOutcome, Option<W>) {
        if self.contains(&request_id) {
            return (PendingInsertOutcome::Duplicate, Some(waiter));
        }
        if self.entries.len() >= self.max_pending {
            return (PendingInsertOutcome::TooManyPending, Some(waiter));
        }

        self.deadlines.push(Reverse(DeadlineItem {
            deadline,
            request_id: request_id.clone(),
        }));
        self.entries.insert(
            request_id,
            PendingEntry {
                created: Instant::now(),
                deadline,
                waiter,
            },
        );
        (PendingInsertOutcome::Inserted, None)
    }

    /// Remove an entry and return its waiter.
    pub fn complete(&mut self, request_id: &str) -> Option<W> {
        self.entries.remove(request_id).map(|entry| entry.waiter)
    }

    /// Remove every entry, e.g. when the connection drops.
    pub fn drain(&mut self) -> Vec<(String, W)> {
        self.deadlines.clear();
        self.entries
            .drain()
            .map(|(request_id, entry)| (request_id, entry.waiter))
            .collect()
    }

    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse(item)) = self.deadlines.peek().cloned() {
            match self.entries.get(&item.request_id) {
                Some(entry) if entry.deadline == item.deadline => return Some(item.deadline),
                _ => {
                    // Stale heap item (entry already completed).
                    let _ = self.deadlines.pop();
                }
            }
        }
        None
    }

    pub fn expire_due(&mut self, now: Instant) -> Vec<PendingExpired<W>> {
        let mut out = Vec::new();
        while let Some(Reverse(item)) = self.deadlines.peek().cloned() {
            if item.deadline > now {
                break;
            }
            let _ = self.deadlines.pop();

            let due = matches!(
                self.entries.get(&item.request_id),
                Some(entry) if entry.deadline == item.deadline
            );
            if !due {
                continue;
            }
            if let Some(entry) = self.entries.remove(&item.request_id) {
                out.push(PendingExpired {
                    request_id: item.request_id,
                    waiter: entry.waiter,
                    age: now.saturating_duration_since(entry.created),
                });
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::Duration;

    #[test]
    fn completion_removes_entry_exactly_once() {
        let mut table = PendingTable::<u32>::new(4);
        let d = Instant::now() + Duration::from_secs(30);

        assert_eq!(table.insert("msg_1_a".into(), d, 1), (PendingInsertOutcome::Inserted, None));
        assert_eq!(table.complete("msg_1_a"), Some(1));
        assert_eq!(table.complete("msg_1_a"), None);
        assert!(table.is_empty());
        assert!(table.next_deadline().is_none());
    }

    #[test]
    fn duplicate_and_capacity_hand_the_waiter_back() {
        let mut table = PendingTable::<u32>::new(1);
        let d = Instant::now() + Duration::from_secs(30);

        table.insert("a".into(), d, 1);
        assert_eq!(
            table.insert("a".into(), d, 2),
            (PendingInsertOutcome::Duplicate, Some(2))
        );
        assert_eq!(
            table.insert("b".into(), d, 3),
            (PendingInsertOutcome::TooManyPending, Some(3))
        );
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn expiry_only_returns_due_entries() {
        let mut table = PendingTable::<u32>::new(8);
        let now = Instant::now();
        table.insert("early".into(), now + Duration::from_millis(5), 1);
        table.insert("late".into(), now + Duration::from_secs(60), 2);
        table.insert("done".into(), now + Duration::from_millis(1), 3);
        table.complete("done");

        let expired = table.expire_due(now + Duration::from_secs(1));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].request_id, "early");
        assert_eq!(expired[0].waiter, 1);
        assert_eq!(table.next_deadline(), Some(now + Duration::from_secs(60)));
    }

    #[test]
    fn next_deadline_skips_completed_entries() {
        let mut table = PendingTable::<u32>::new(8);
        let now = Instant::now();
        table.insert("first".into(), now + Duration::from_millis(10), 1);
        table.insert("second".into(), now + Duration::from_millis(20), 2);
        assert!(table.contains("first"));

        table.complete("first");
        assert!(!table.contains("first"));
        assert_eq!(table.next_deadline(), Some(now + Duration::from_millis(20)));
    }

    #[test]
    fn drain_empties_table_and_heap() {
        let mut table = PendingTable::<u32>::new(8);
        let d = Instant::now() + Duration::from_secs(1);
        table.insert("a".into(), d, 1);
        table.insert("b".into(), d, 2);

        let mut drained: Vec<u32> = table.drain().into_iter().map(|(_, w)| w).collect();
        drained.sort_unstable();
        assert_eq!(drained, vec![1, 2]);
        assert!(table.next_deadline().is_none());
        assert!(table.expire_due(d + Duration::from_secs(1)).is_empty());
    }

    proptest! {
        #[test]
        fn every_waiter_surfaces_at_most_once(ops in proptest::collection::vec((0u8..6, 0u8..3), 1..64)) {
            let mut table = PendingTable::<u8>::new(4);
            let start = Instant::now();
            let mut surfaced = Vec::new();
            let mut inserted = 0usize;

            for (key, op) in ops {
                let id = format!("req_{key}");
                match op {
                    0 => {
                        let deadline = start + Duration::from_millis(u64::from(key));
                        if table.insert(id, deadline, key).0 == PendingInsertOutcome::Inserted {
                            inserted += 1;
                        }
                    }
                    1 => surfaced.extend(table.complete(&id)),
                    _ => surfaced.extend(
                        table
                            .expire_due(start + Duration::from_millis(3))
                            .into_iter()
                            .map(|e| e.waiter),
                    ),
                }
                prop_assert!(table.len() <= 4);
            }
            surfaced.extend(table.drain().into_iter().map(|(_, w)| w));

            prop_assert_eq!(surfaced.len(), inserted);
            prop_assert!(table.is_empty());
        }
    }
}
