//! Fixed-capacity ring with an explicit `head`/`count`, plus the
//! [`EntryLog`] trait shared by the in-memory ring and the flash log.

use tracing::warn;

use crate::error::HistoryError;

/// Append-only log of fixed-size entries that overwrites its oldest entry
/// when full. Indices passed to [`get`](EntryLog::get) are oldest-first.
pub trait EntryLog<T>: Send + Sync {
    fn push(&mut self, entry: T) -> Result<(), HistoryError>;
    fn get(&self, index: u16) -> Result<Option<T>, HistoryError>;
    fn len(&self) -> u16;
    fn capacity(&self) -> u16;
    /// Physical slot the next push writes.
    fn head(&self) -> u16;
    fn clear(&mut self) -> Result<(), HistoryError>;
    /// Drop up to `n` oldest entries; returns how many were dropped.
    fn trim_oldest(&mut self, n: u16) -> Result<u16, HistoryError>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
pub struct Ring<T> {
    slots: Vec<T>,
    head: u16,
    count: u16,
}

impl<T: Clone + Default> Ring<T> {
    pub fn new(capacity: u16) -> Self {
        Self {
            slots: vec![T::default(); usize::from(capacity.max(1))],
            head: 0,
            count: 0,
        }
    }

    /// Rebuild from persisted slots. Inconsistent state yields an empty ring.
    pub fn from_slots(slots: Vec<T>, head: u16, count: u16, capacity: u16) -> Self {
        let cap = capacity.max(1);
        if slots.len() != usize::from(cap) || head >= cap || count > cap {
            warn!(
                slots = slots.len(),
                head,
                count,
                capacity = cap,
                "history: ring state corrupt, resetting"
            );
            return Self::new(cap);
        }
        Self { slots, head, count }
    }

    pub fn capacity(&self) -> u16 {
        self.slots.len() as u16
    }

    pub fn len(&self) -> u16 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_full(&self) -> bool {
        self.count == self.capacity()
    }

    pub fn head(&self) -> u16 {
        self.head
    }

    /// Slots in physical order, for persistence.
    pub fn slots(&self) -> &[T] {
        &self.slots
    }

    pub fn push(&mut self, entry: T) {
        let cap = self.capacity();
        self.slots[usize::from(self.head)] = entry;
        self.head = (self.head + 1) % cap;
        if self.count < cap {
            self.count += 1;
        }
    }

    fn physical(&self, index: u16) -> usize {
        let cap = u32::from(self.capacity());
        let oldest = (u32::from(self.head) + cap - u32::from(self.count)) % cap;
        ((oldest + u32::from(index)) % cap) as usize
    }

    /// The `index`-th entry, oldest first.
    pub fn get(&self, index: u16) -> Option<&T> {
        (index < self.count).then(|| &self.slots[self.physical(index)])
    }

    pub fn oldest(&self) -> Option<&T> {
        self.get(0)
    }

    pub fn latest(&self) -> Option<&T> {
        self.count.checked_sub(1).and_then(|i| self.get(i))
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        (0..self.count).filter_map(move |i| self.get(i))
    }

    pub fn clear(&mut self) {
        self.slots.fill(T::default());
        self.head = 0;
        self.count = 0;
    }

    pub fn trim_oldest(&mut self, n: u16) -> u16 {
        let n = n.min(self.count);
        self.count -= n;
        n
    }
}

impl<T: Clone + Default + Send + Sync> EntryLog<T> for Ring<T> {
    fn push(&mut self, entry: T) -> Result<(), HistoryError> {
        Ring::push(self, entry);
        Ok(())
    }

    fn get(&self, index: u16) -> Result<Option<T>, HistoryError> {
        Ok(Ring::get(self, index).cloned())
    }

    fn len(&self) -> u16 {
        self.count
    }

    fn capacity(&self) -> u16 {
        Ring::capacity(self)
    }

    fn head(&self) -> u16 {
        self.head
    }

    fn clear(&mut self) -> Result<(), HistoryError> {
        Ring::clear(self);
        Ok(())
    }

    fn trim_oldest(&mut self, n: u16) -> Result<u16, HistoryError> {
        Ok(Ring::trim_oldest(self, n))
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(cap: u16, pushes: u32) -> Ring<u32> {
        let mut r = Ring::new(cap);
        for v in 0..pushes {
            r.push(v);
        }
        r
    }

    #[test]
    fn partial_ring_is_index_order() {
        let r = filled(5, 3);
        assert_eq!(r.len(), 3);
        assert_eq!(r.head(), 3);
        assert_eq!(r.iter().copied().collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(r.oldest(), Some(&0));
        assert_eq!(r.latest(), Some(&2));
        assert_eq!(r.get(3), None);
    }

    #[test]
    fn overflow_keeps_last_cap_in_fifo_order() {
        let r = filled(4, 7);
        assert!(r.is_full());
        assert_eq!(r.head(), 3);
        assert_eq!(r.iter().copied().collect::<Vec<_>>(), vec![3, 4, 5, 6]);
        assert_eq!(r.get(0), Some(&3));
        assert_eq!(r.latest(), Some(&6));
    }

    #[test]
    fn trim_drops_oldest() {
        let mut r = filled(4, 6);
        assert_eq!(r.trim_oldest(3), 3);
        assert_eq!(r.iter().copied().collect::<Vec<_>>(), vec![5]);
        assert_eq!(r.trim_oldest(9), 1);
        assert!(r.is_empty());
        assert_eq!(r.latest(), None);

        r.push(10);
        assert_eq!(r.oldest(), Some(&10));
    }

    #[test]
    fn clear_resets_everything() {
        let mut r = filled(3, 5);
        r.clear();
        assert_eq!((r.len(), r.head()), (0, 0));
        assert!(r.slots().iter().all(|&v| v == 0));
    }

    #[test]
    fn from_slots_restores_or_resets() {
        let r = filled(4, 6);
        let restored = Ring::from_slots(r.slots().to_vec(), r.head(), r.len(), 4);
        assert_eq!(
            restored.iter().copied().collect::<Vec<_>>(),
            r.iter().copied().collect::<Vec<_>>()
        );

        let bad_head = Ring::from_slots(vec![1u32; 4], 4, 2, 4);
        assert!(bad_head.is_empty());
        let bad_count = Ring::from_slots(vec![1u32; 4], 0, 5, 4);
        assert!(bad_count.is_empty());
        let resized = Ring::from_slots(vec![1u32; 4], 0, 2, 8);
        assert!(resized.is_empty());
        assert_eq!(resized.capacity(), 8);
    }

    #[test]
    fn trait_view_matches_ring() {
        let mut r: Ring<u32> = Ring::new(2);
        let log: &mut dyn EntryLog<u32> = &mut r;
        log.push(1).unwrap();
        log.push(2).unwrap();
        log.push(3).unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log.get(0).unwrap(), Some(2));
        assert_eq!(log.trim_oldest(1).unwrap(), 1);
        assert_eq!(log.get(0).unwrap(), Some(3));
    }
}
