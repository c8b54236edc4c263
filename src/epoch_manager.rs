use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering, fence};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::trace;

use crate::node::Node;
use crate::node_allocator::NodeAllocator;

/// A retired node may be freed once the global epoch has moved more than
/// this many epochs past its retirement epoch.
const GRACE_EPOCHS: usize = 2;

/// Per-thread garbage list length that triggers a collection pass.
const COLLECT_THRESHOLD: usize = 128;

// Global epoch counter
pub struct GlobalEpoch {
    epoch: AtomicUsize,
}

/// Thread-local epoch tracker, one per registered worker thread.
pub struct LocalEpoch {
    local: AtomicUsize,
    active: AtomicUsize, // 0 = inactive, 1 = active
}

// Garbage collection entry
struct GarbageEntry<K> {
    node: *mut Node<K>,
    epoch_retired: usize,
    next: *mut GarbageEntry<K>,
}

// Thread-local garbage collection list
pub(crate) struct GarbageList<K> {
    head: *mut GarbageEntry<K>,
    size: usize,
}

// Holds only raw pointers; cross-thread use is gated by the manager's own
// Send/Sync bounds
unsafe impl<K> Send for GarbageList<K> {}

/// Epoch-based reclamation manager.
///
/// Threads bracket every traversal with [`enter`](EpochManager::enter) and
/// [`exit`](EpochManager::exit). A node unlinked from the chain is retired
/// via [`defer_free`](EpochManager::defer_free) and only freed once every
/// thread that could have held a reference to it has left its critical
/// section, witnessed by the global epoch advancing past the retirement
/// epoch.
pub struct EpochManager<K> {
    global: Arc<GlobalEpoch>,
    registry: Mutex<Vec<Arc<LocalEpoch>>>,
    allocator: NodeAllocator<K>,
    garbage: thread_local::ThreadLocal<UnsafeCell<GarbageList<K>>>,
}

unsafe impl<K: Send> Send for EpochManager<K> {}
unsafe impl<K: Send> Sync for EpochManager<K> {}

impl<K> Default for EpochManager<K> {
    fn default() -> Self {
        EpochManager::new()
    }
}

impl<K> EpochManager<K> {
    pub fn new() -> Self {
        EpochManager {
            global: Arc::new(GlobalEpoch {
                epoch: AtomicUsize::new(0),
            }),
            registry: Mutex::new(Vec::new()),
            allocator: NodeAllocator::new(),
            garbage: thread_local::ThreadLocal::new(),
        }
    }

    /// Current value of the global epoch.
    pub fn epoch(&self) -> usize {
        self.global.epoch.load(Ordering::Acquire)
    }

    /// Register the calling worker with the manager.
    ///
    /// The returned handle must be passed to every set operation issued by
    /// that worker.
    pub fn register_thread(&self) -> Arc<LocalEpoch> {
        let local = Arc::new(LocalEpoch {
            local: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
        });

        self.registry().push(Arc::clone(&local));
        local
    }

    /// Number of registered worker threads.
    pub fn registered_threads(&self) -> usize {
        self.registry().len()
    }

    // Enter a critical section
    pub fn enter(&self, local: &LocalEpoch) {
        let epoch = self.global.epoch.load(Ordering::Relaxed);
        local.active.store(1, Ordering::Relaxed);
        local.local.store(epoch, Ordering::Relaxed);

        // Publish the pin before any chain traversal loads; try_advance
        // must never miss a freshly active thread.
        fence(Ordering::SeqCst);
    }

    // Exit a critical section
    pub fn exit(&self, local: &LocalEpoch) {
        local.active.store(0, Ordering::Release);
    }

    /// Try to advance the global epoch.
    ///
    /// The epoch only moves forward once every active thread has observed
    /// the current one; a thread pinned to an older epoch blocks
    /// advancement and thereby keeps its view of the chain alive.
    pub fn try_advance(&self) -> bool {
        let current_epoch = self.global.epoch.load(Ordering::SeqCst);

        {
            let registry = self.registry();
            for local in registry.iter() {
                if local.active.load(Ordering::SeqCst) == 1
                    && local.local.load(Ordering::SeqCst) != current_epoch
                {
                    return false;
                }
            }
        }

        self.global
            .epoch
            .compare_exchange(
                current_epoch,
                current_epoch + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Retire an unlinked node for later reclamation.
    ///
    /// Must be called exactly once per node, by the thread whose CAS
    /// physically unlinked it.
    pub(crate) fn defer_free(&self, node: *mut Node<K>) {
        let garbage = self.local_garbage();

        let entry = Box::into_raw(Box::new(GarbageEntry {
            node,
            epoch_retired: self.global.epoch.load(Ordering::Acquire),
            next: unsafe { (*garbage.get()).head },
        }));

        unsafe {
            (*garbage.get()).head = entry;
            (*garbage.get()).size += 1;

            // Collect once enough garbage accumulated, nudging the epoch
            // forward first so older entries can leave the grace period
            if (*garbage.get()).size > COLLECT_THRESHOLD {
                self.try_advance();
                self.collect(garbage.get());
            }
        }
    }

    /// Run a collection pass over the calling thread's garbage list.
    pub fn collect_local(&self) {
        self.collect(self.local_garbage().get());
    }

    // Collect garbage that's safe to reclaim
    fn collect(&self, garbage_list: *mut GarbageList<K>) {
        let current_epoch = self.global.epoch.load(Ordering::Acquire);
        let safe_epoch = current_epoch.saturating_sub(GRACE_EPOCHS);

        let mut freed = 0;
        unsafe {
            let mut current = (*garbage_list).head;
            let mut kept_head = ptr::null_mut();
            let mut kept_size = 0;

            while !current.is_null() {
                let next = (*current).next;

                if (*current).epoch_retired < safe_epoch {
                    // Grace period over, no thread can still see this node
                    self.allocator.deallocate((*current).node);
                    drop(Box::from_raw(current));
                    freed += 1;
                } else {
                    (*current).next = kept_head;
                    kept_head = current;
                    kept_size += 1;
                }

                current = next;
            }

            (*garbage_list).head = kept_head;
            (*garbage_list).size = kept_size;
        }

        if freed > 0 {
            trace!("reclaimed {freed} nodes at epoch {current_epoch}");
        }
    }

    /// Length of the calling thread's garbage list.
    pub fn local_garbage_len(&self) -> usize {
        unsafe { (*self.local_garbage().get()).size }
    }

    // Wrapper for allocate
    pub(crate) fn allocate_node(&self, key: K, successor: *mut Node<K>) -> *mut Node<K> {
        self.allocator.allocate(key, successor)
    }

    /// Free a node immediately, bypassing the grace period.
    ///
    /// Only sound when no other thread can reach the node: an insert
    /// candidate that was never published, or teardown with exclusive
    /// access to the whole chain.
    pub(crate) fn free_now(&self, node: *mut Node<K>) {
        self.allocator.deallocate(node);
    }

    fn local_garbage(&self) -> &UnsafeCell<GarbageList<K>> {
        self.garbage.get_or(|| {
            UnsafeCell::new(GarbageList {
                head: ptr::null_mut(),
                size: 0,
            })
        })
    }

    fn registry(&self) -> MutexGuard<'_, Vec<Arc<LocalEpoch>>> {
        // Registration never panics while holding the lock; recover the
        // guard anyway rather than poisoning every later caller
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<K> Drop for EpochManager<K> {
    fn drop(&mut self) {
        // Exclusive access: no thread can be in a critical section anymore,
        // so everything still in the garbage lists can go
        for cell in self.garbage.iter_mut() {
            let list = cell.get_mut();
            let mut current = list.head;

            while !current.is_null() {
                unsafe {
                    let next = (*current).next;
                    self.allocator.deallocate((*current).node);
                    drop(Box::from_raw(current));
                    current = next;
                }
            }

            list.head = ptr::null_mut();
            list.size = 0;
        }
    }
}
