//! Transfer slot arena
//!
//! A fixed-capacity, index-addressable table of in-flight isochronous
//! transfers. A slot is either empty or fully populated (descriptor and
//! buffer together); partial population is unrepresentable. The arena
//! itself is dumb storage; all cross-thread coordination happens
//! through the `Mutex`/`Condvar` pair that wraps it in the shared
//! stream state.

use std::ptr::NonNull;

use rusb::ffi::libusb_transfer;

/// Owned pointer to a libusb transfer descriptor.
///
/// The pool only stores and compares this pointer; it is dereferenced
/// exclusively by the transfer layer on the event-pump thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TransferPtr(NonNull<libusb_transfer>);

// Moved between the submitting thread and the event-pump thread, but
// only ever dereferenced while libusb owns or has completed it.
unsafe impl Send for TransferPtr {}

impl TransferPtr {
    pub(crate) fn new(ptr: NonNull<libusb_transfer>) -> Self {
        Self(ptr)
    }

    pub(crate) fn as_ptr(&self) -> *mut libusb_transfer {
        self.0.as_ptr()
    }
}

/// One occupied slot: the transfer descriptor and its backing buffer.
#[derive(Debug)]
pub(crate) struct SlotEntry {
    pub transfer: TransferPtr,
    pub buffer: Box<[u8]>,
}

/// Fixed-size arena of transfer slots.
#[derive(Debug)]
pub(crate) struct TransferPool {
    slots: Vec<Option<SlotEntry>>,
}

impl TransferPool {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Populate a slot. The slot must be empty.
    pub(crate) fn occupy(&mut self, index: usize, transfer: TransferPtr, buffer: Box<[u8]>) {
        debug_assert!(self.slots[index].is_none(), "slot {} double-occupied", index);
        self.slots[index] = Some(SlotEntry { transfer, buffer });
    }

    /// Empty a slot, returning its entry for the caller to free.
    pub(crate) fn clear(&mut self, index: usize) -> Option<SlotEntry> {
        self.slots.get_mut(index).and_then(Option::take)
    }

    /// Empty a slot only if it still holds `ptr`.
    ///
    /// Guards the release path against a stale completion for a slot
    /// that has already been recycled.
    pub(crate) fn clear_matching(
        &mut self,
        index: usize,
        ptr: *mut libusb_transfer,
    ) -> Option<SlotEntry> {
        match self.slots.get_mut(index) {
            Some(slot) if slot.as_ref().is_some_and(|e| e.transfer.as_ptr() == ptr) => slot.take(),
            _ => None,
        }
    }

    pub(crate) fn is_occupied(&self, index: usize) -> bool {
        self.slots.get(index).is_some_and(Option::is_some)
    }

    pub(crate) fn occupied_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Transfer pointers of every occupied slot, in index order.
    pub(crate) fn occupied_transfers(&self) -> impl Iterator<Item = *mut libusb_transfer> + '_ {
        self.slots
            .iter()
            .filter_map(|s| s.as_ref().map(|e| e.transfer.as_ptr()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_ptr() -> TransferPtr {
        // Never dereferenced by the pool; address identity only.
        TransferPtr::new(NonNull::dangling())
    }

    fn fake_buffer() -> Box<[u8]> {
        vec![0u8; 16].into_boxed_slice()
    }

    #[test]
    fn test_new_pool_is_empty() {
        let pool = TransferPool::new(10);
        assert_eq!(pool.capacity(), 10);
        assert_eq!(pool.occupied_count(), 0);
        assert!(!pool.is_occupied(0));
    }

    #[test]
    fn test_occupy_and_clear() {
        let mut pool = TransferPool::new(4);
        pool.occupy(2, fake_ptr(), fake_buffer());
        assert!(pool.is_occupied(2));
        assert_eq!(pool.occupied_count(), 1);

        let entry = pool.clear(2).unwrap();
        assert_eq!(entry.buffer.len(), 16);
        assert!(!pool.is_occupied(2));
        assert!(pool.clear(2).is_none());
    }

    #[test]
    fn test_clear_matching_rejects_stale_pointer() {
        let mut pool = TransferPool::new(2);
        let ptr = fake_ptr();
        pool.occupy(0, ptr, fake_buffer());

        let stale = NonNull::<rusb::ffi::libusb_transfer>::dangling()
            .as_ptr()
            .wrapping_add(1);
        assert!(pool.clear_matching(0, stale).is_none());
        assert!(pool.is_occupied(0));

        assert!(pool.clear_matching(0, ptr.as_ptr()).is_some());
        assert!(!pool.is_occupied(0));
    }

    #[test]
    fn test_occupied_transfers_in_index_order() {
        let mut pool = TransferPool::new(3);
        pool.occupy(0, fake_ptr(), fake_buffer());
        pool.occupy(2, fake_ptr(), fake_buffer());
        assert_eq!(pool.occupied_transfers().count(), 2);
    }

    #[test]
    fn test_out_of_range_index_is_empty() {
        let mut pool = TransferPool::new(1);
        assert!(!pool.is_occupied(5));
        assert!(pool.clear(5).is_none());
    }
}
