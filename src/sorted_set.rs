use std::ptr;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use crate::epoch_manager::{EpochManager, LocalEpoch};
use crate::error::{Result, SetError};
use crate::node::Node;

/// A lock-free sorted set over an ordered singly-linked chain of nodes,
/// bounded by two permanent sentinels holding the configured minimum and
/// maximum key.
///
/// Deletion is two-phase. A delete first marks its victim by setting the
/// mark bit packed into the victim's `next` word (the logical deletion and
/// the linearization point), then makes one best-effort CAS to unlink it.
/// Traversals unlink any marked node they run into, so the chain never
/// accumulates dead nodes under sustained delete traffic. Unlinked nodes
/// are retired to the epoch manager and freed only after every thread that
/// could still reach them has left its critical section.
///
/// Every operation is a handful of atomic loads plus at most one CAS per
/// structural change; no locks are held at any point. The set is lock-free
/// but not wait-free: an individual call may retry under contention, while
/// some thread always makes progress system-wide.
pub struct LockFreeSortedSet<K> {
    head: *mut Node<K>,
    tail: *mut Node<K>,
    epoch_manager: Arc<EpochManager<K>>,
}

unsafe impl<K: Send> Send for LockFreeSortedSet<K> {}
unsafe impl<K: Send + Sync> Sync for LockFreeSortedSet<K> {}

impl<K: Ord> LockFreeSortedSet<K> {
    /// Create a set whose sentinels hold `min_key` and `max_key`.
    ///
    /// The bounds must satisfy `min_key < max_key` and every stored key
    /// must lie strictly between them; keys equal to either bound are
    /// rejected with [`SetError::InvalidKey`] at the call boundary.
    pub fn new(min_key: K, max_key: K, epoch_manager: Arc<EpochManager<K>>) -> Self {
        assert!(min_key < max_key, "sentinel bounds must be ordered");

        let tail = epoch_manager.allocate_node(max_key, ptr::null_mut());
        let head = epoch_manager.allocate_node(min_key, tail);

        LockFreeSortedSet {
            head,
            tail,
            epoch_manager,
        }
    }

    // Sentinel keys bound all real keys strictly; anything outside can
    // never be stored and is rejected before any traversal
    fn check_key(&self, key: &K) -> Result<()> {
        unsafe {
            if *key <= (*self.head).key || *key >= (*self.tail).key {
                return Err(SetError::InvalidKey);
            }
        }
        Ok(())
    }

    /// Harris search: locate the insertion point for `key`.
    ///
    /// Returns `(pred, curr)` where `pred` is the last live node with
    /// `pred.key < key` and `curr` the first live node with
    /// `curr.key >= key`. Marked nodes encountered on the way are unlinked
    /// on behalf of whichever delete marked them; a failed unlink CAS means
    /// `pred.next` changed concurrently and restarts the traversal from the
    /// head sentinel.
    ///
    /// The caller must be inside an epoch critical section.
    fn search(&self, key: &K) -> (*mut Node<K>, *mut Node<K>) {
        'from_head: loop {
            let mut pred = self.head;
            let mut curr = unsafe { (*pred).next.successor(Ordering::Acquire) };

            loop {
                // curr is never null: the tail sentinel bounds every
                // traversal because keys are validated against it
                let (succ, curr_marked) = unsafe { (*curr).next.load(Ordering::Acquire) };

                if curr_marked {
                    match unsafe {
                        (*pred).next.compare_exchange(
                            (curr, false),
                            (succ, false),
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                    } {
                        Ok(()) => {
                            // The unlink winner retires the node
                            self.epoch_manager.defer_free(curr);
                            curr = succ;
                        }
                        Err(_) => continue 'from_head,
                    }
                } else if unsafe { (*curr).key < *key } {
                    pred = curr;
                    curr = succ;
                } else {
                    return (pred, curr);
                }
            }
        }
    }

    /// Insert `key`, returning `Ok(true)` if it was not already present.
    pub fn insert(&self, key: K, thread_epoch: &LocalEpoch) -> Result<bool> {
        self.check_key(&key)?;
        self.epoch_manager.enter(thread_epoch);

        let candidate = self.epoch_manager.allocate_node(key, ptr::null_mut());

        let inserted = loop {
            let (pred, curr) = self.search(unsafe { &(*candidate).key });

            if unsafe { (*candidate).key == (*curr).key } {
                // Live duplicate; the candidate was never published, so it
                // can be freed without a grace period
                self.epoch_manager.free_now(candidate);
                break false;
            }

            unsafe {
                (*candidate).next.store(curr, false, Ordering::Relaxed);

                let published = (*pred)
                    .next
                    .compare_exchange(
                        (curr, false),
                        (candidate, false),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok();

                if published {
                    break true;
                }
            }

            // pred changed underneath us; find the new insertion point
        };

        self.epoch_manager.exit(thread_epoch);
        Ok(inserted)
    }

    /// Delete `key`, returning `Ok(true)` if this call removed it.
    ///
    /// Concurrent deletes of the same key race on the mark CAS and exactly
    /// one of them wins. A failed best-effort unlink never turns a
    /// successful logical deletion into a `false` result; the node is
    /// cleaned up by a later traversal instead.
    pub fn delete(&self, key: &K, thread_epoch: &LocalEpoch) -> Result<bool> {
        self.check_key(key)?;
        self.epoch_manager.enter(thread_epoch);

        let removed = 'attempt: {
            let (pred, curr) = self.search(key);

            if unsafe { (*curr).key != *key } {
                break 'attempt false;
            }

            loop {
                let (succ, marked) = unsafe { (*curr).next.load(Ordering::Acquire) };

                if marked {
                    // Another delete won the race; the key was already gone
                    // by the time this call linearized
                    break 'attempt false;
                }

                // Logical deletion: pointer and mark move in one CAS
                let logically_deleted = unsafe {
                    (*curr)
                        .next
                        .compare_exchange(
                            (succ, false),
                            (succ, true),
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                };

                if logically_deleted {
                    // Best-effort physical unlink; on failure some later
                    // traversal does the cleanup
                    let unlinked = unsafe {
                        (*pred)
                            .next
                            .compare_exchange(
                                (curr, false),
                                (succ, false),
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            )
                            .is_ok()
                    };

                    if unlinked {
                        self.epoch_manager.defer_free(curr);
                    }

                    break 'attempt true;
                }

                // The successor changed while curr was still live; retry
                // the mark against the new successor
            }
        };

        self.epoch_manager.exit(thread_epoch);
        Ok(removed)
    }

    /// Whether `key` is currently a live member of the set.
    ///
    /// Purely read-only: no unlinking, no retries. A `true` result means
    /// the key was live at some instant during the call, nothing more.
    pub fn contains(&self, key: &K, thread_epoch: &LocalEpoch) -> Result<bool> {
        self.check_key(key)?;
        self.epoch_manager.enter(thread_epoch);

        let found = unsafe {
            let mut curr = (*self.head).next.successor(Ordering::Acquire);

            while (*curr).key < *key {
                curr = (*curr).next.successor(Ordering::Acquire);
            }

            (*curr).key == *key && !(*curr).next.is_marked(Ordering::Acquire)
        };

        self.epoch_manager.exit(thread_epoch);
        Ok(found)
    }

    /// Collect the live keys in ascending order, skipping the sentinels.
    ///
    /// Never mutates the chain. Concurrent inserts and deletes may or may
    /// not be reflected; the result is consistent with some linearization
    /// of the racing operations, not with a single point in time.
    pub fn snapshot(&self, thread_epoch: &LocalEpoch) -> Vec<K>
    where
        K: Clone,
    {
        self.epoch_manager.enter(thread_epoch);

        let mut keys = Vec::new();
        let mut curr = unsafe { (*self.head).next.successor(Ordering::Acquire) };

        while curr != self.tail {
            let (succ, marked) = unsafe { (*curr).next.load(Ordering::Acquire) };
            if !marked {
                keys.push(unsafe { (*curr).key.clone() });
            }
            curr = succ;
        }

        self.epoch_manager.exit(thread_epoch);
        keys
    }
}

impl<K> Drop for LockFreeSortedSet<K> {
    fn drop(&mut self) {
        // Exclusive access: free the remaining chain including both
        // sentinels. Nodes unlinked earlier are no longer on the chain and
        // are reclaimed through the epoch manager's garbage lists instead.
        let mut curr = self.head;
        while !curr.is_null() {
            let succ = unsafe { (*curr).next.successor(Ordering::Relaxed) };
            self.epoch_manager.free_now(curr);
            curr = succ;
        }
    }
}
