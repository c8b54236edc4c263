use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};

// Node structure with careful memory layout optimization.
//
// The cache-line alignment also guarantees the low bits of every node
// address are zero, which is what lets `Link` pack the deletion mark into
// bit 0 of the successor pointer.
#[repr(C, align(64))] // Align to cache line boundaries
pub struct Node<K> {
    // Immutable after construction; only `next` is ever mutated
    pub(crate) key: K,
    // Successor pointer combined with this node's logical-deletion mark
    pub(crate) next: Link<K>,
}

/// Bit 0 of the packed link word holds the logical-deletion mark.
const MARK_BIT: usize = 1;

/// A successor pointer and a logical-deletion mark packed into one atomic
/// machine word.
///
/// The mark stored in node X's `next` word marks X itself as deleted. The
/// two pieces must live in a single word: marking and re-linking are then
/// indivisible, so no thread can observe a stale mark relative to the
/// pointer it travels through.
pub struct Link<K> {
    word: AtomicUsize,
    _owns: PhantomData<*mut Node<K>>,
}

impl<K> Link<K> {
    pub(crate) fn new(successor: *mut Node<K>) -> Self {
        Link {
            word: AtomicUsize::new(Self::pack(successor, false)),
            _owns: PhantomData,
        }
    }

    fn pack(successor: *mut Node<K>, marked: bool) -> usize {
        let addr = successor as usize;
        debug_assert_eq!(addr & MARK_BIT, 0, "node addresses must be aligned");
        addr | marked as usize
    }

    fn unpack(word: usize) -> (*mut Node<K>, bool) {
        ((word & !MARK_BIT) as *mut Node<K>, word & MARK_BIT != 0)
    }

    /// Load the successor pointer and the mark as one consistent pair.
    pub(crate) fn load(&self, order: Ordering) -> (*mut Node<K>, bool) {
        Self::unpack(self.word.load(order))
    }

    /// Load only the successor pointer, travelling through marked nodes.
    pub(crate) fn successor(&self, order: Ordering) -> *mut Node<K> {
        Self::unpack(self.word.load(order)).0
    }

    pub(crate) fn is_marked(&self, order: Ordering) -> bool {
        Self::unpack(self.word.load(order)).1
    }

    /// CAS the whole (pointer, mark) pair in one shot.
    #[allow(clippy::result_unit_err)]
    pub(crate) fn compare_exchange(
        &self,
        current: (*mut Node<K>, bool),
        new: (*mut Node<K>, bool),
        success: Ordering,
        failure: Ordering,
    ) -> Result<(), (*mut Node<K>, bool)> {
        self.word
            .compare_exchange(
                Self::pack(current.0, current.1),
                Self::pack(new.0, new.1),
                success,
                failure,
            )
            .map(|_| ())
            .map_err(Self::unpack)
    }

    /// Plain store, only sound before the owning node is published.
    pub(crate) fn store(&self, successor: *mut Node<K>, marked: bool, order: Ordering) {
        self.word.store(Self::pack(successor, marked), order);
    }
}
