use crate::prelude::*;

use super::VcpuIdx;

/// Global queue of all non-idle VCPUs, min-ordered by absolute deadline.
/// Insertion is stable: equal deadlines keep arrival order. Keys are
/// copied in at insertion time, so a reservation whose deadline changes
/// must be re-keyed through [`DeadlineQueue::requeue`].
///
/// Backed by a sorted vector: binary-search insert, O(1) peek, linear
/// remove-by-identity. The queue never exceeds [`MAX_VCPUS`] entries.
#[derive(Debug, Default)]
pub struct DeadlineQueue {
    entries: Vec<(Time, VcpuIdx)>,
}

impl DeadlineQueue {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn insert(&mut self, deadline: Time, idx: VcpuIdx) {
        debug_assert!(self.entries.len() < MAX_VCPUS);
        debug_assert!(!self.contains(idx));

        let at = self.entries.partition_point(|&(key, _)| key <= deadline);
        self.entries.insert(at, (deadline, idx));
    }

    pub fn remove(&mut self, idx: VcpuIdx) -> bool {
        match self.entries.iter().position(|&(_, v)| v == idx) {
            Some(pos) => {
                self.entries.remove(pos);
                true
            },
            None => false,
        }
    }

    pub fn requeue(&mut self, deadline: Time, idx: VcpuIdx) {
        self.remove(idx);
        self.insert(deadline, idx);
    }

    pub fn peek(&self) -> Option<VcpuIdx> {
        self.entries.first().map(|&(_, v)| v)
    }

    pub fn peek_second(&self) -> Option<VcpuIdx> {
        self.entries.get(1).map(|&(_, v)| v)
    }

    pub fn contains(&self, idx: VcpuIdx) -> bool {
        self.entries.iter().any(|&(_, v)| v == idx)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Time, VcpuIdx)> + '_ {
        self.entries.iter().copied()
    }
}

// =============================================================================

#[test]
fn keeps_ascending_order() {
    let mut q = DeadlineQueue::new();
    q.insert(Time::millis(30), VcpuIdx(0));
    q.insert(Time::millis(10), VcpuIdx(1));
    q.insert(Time::millis(20), VcpuIdx(2));

    let order: Vec<_> = q.iter().map(|(_, v)| v).collect();
    assert_eq!(order, [VcpuIdx(1), VcpuIdx(2), VcpuIdx(0)]);
    assert_eq!(q.peek(), Some(VcpuIdx(1)));
    assert_eq!(q.peek_second(), Some(VcpuIdx(2)));
}

#[test]
fn equal_deadlines_keep_arrival_order() {
    let mut q = DeadlineQueue::new();
    q.insert(Time::millis(10), VcpuIdx(0));
    q.insert(Time::millis(10), VcpuIdx(1));
    q.insert(Time::millis(10), VcpuIdx(2));

    let order: Vec<_> = q.iter().map(|(_, v)| v).collect();
    assert_eq!(order, [VcpuIdx(0), VcpuIdx(1), VcpuIdx(2)]);
}

#[test]
fn requeue_moves_to_new_position() {
    let mut q = DeadlineQueue::new();
    q.insert(Time::millis(10), VcpuIdx(0));
    q.insert(Time::millis(20), VcpuIdx(1));

    q.requeue(Time::millis(30), VcpuIdx(0));
    assert_eq!(q.peek(), Some(VcpuIdx(1)));
    assert_eq!(q.len(), 2);
}

#[test]
fn remove_by_identity() {
    let mut q = DeadlineQueue::new();
    q.insert(Time::millis(10), VcpuIdx(0));
    q.insert(Time::millis(20), VcpuIdx(1));

    assert!(q.remove(VcpuIdx(0)));
    assert!(!q.remove(VcpuIdx(0)));
    assert_eq!(q.peek(), Some(VcpuIdx(1)));
}

#[cfg(test)]
proptest::proptest! {
    #[test]
    fn always_sorted(deadlines in proptest::collection::vec(0i64..1_000_000, 0..64)) {
        let mut q = DeadlineQueue::new();
        for (i, d) in deadlines.iter().enumerate() {
            q.insert(Time::nanos(*d), VcpuIdx(i));
        }

        let keys: Vec<_> = q.iter().map(|(key, _)| key).collect();
        proptest::prop_assert!(keys.windows(2).all(|w| w[0] <= w[1]));
    }
}
