use std::{
    alloc::{Layout, alloc, dealloc, handle_alloc_error},
    marker::PhantomData,
    ptr,
};

use crate::{
    CACHE_LINE_SIZE,
    node::{Link, Node},
};

/// Memory manager for [`Node`] allocation.
///
/// Every node gets its own cache line so that neighbouring nodes never
/// share one, and so that node addresses always have their low bit free
/// for the deletion mark.
pub struct NodeAllocator<K> {
    _marker: PhantomData<K>,
}

impl<K> Default for NodeAllocator<K> {
    fn default() -> Self {
        NodeAllocator::new()
    }
}

impl<K> NodeAllocator<K> {
    pub fn new() -> Self {
        NodeAllocator {
            _marker: PhantomData,
        }
    }

    fn layout() -> Layout {
        let align = (*CACHE_LINE_SIZE).max(align_of::<Node<K>>());

        // Round the node size up to a whole number of cache lines
        let aligned_size = (size_of::<Node<K>>() + align - 1) & !(align - 1);

        Layout::from_size_align(aligned_size, align).unwrap()
    }

    /// Allocate a node holding `key`, initially pointing at `successor`
    /// and unmarked.
    pub(crate) fn allocate(&self, key: K, successor: *mut Node<K>) -> *mut Node<K> {
        let layout = Self::layout();
        let node = unsafe { alloc(layout) as *mut Node<K> };
        if node.is_null() {
            handle_alloc_error(layout);
        }

        unsafe {
            node.write(Node {
                key,
                next: Link::new(successor),
            });
        }

        node
    }

    /// Drop the node's key and release its memory.
    ///
    /// The caller must guarantee no other thread can still reach `node`,
    /// either because it was never published or because the reclamation
    /// grace period has passed.
    pub(crate) fn deallocate(&self, node: *mut Node<K>) {
        unsafe {
            ptr::drop_in_place(node);
            dealloc(node as *mut u8, Self::layout());
        }
    }
}
