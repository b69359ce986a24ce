//! Lock-free stack of [Entry]s with a safe pop
//!
//! This is a Treiber stack. The usual problems with those (ABA on the head
//! CAS, and freeing a node that some other popper is still about to
//! dereference) are handled with two counters instead of hazard pointers:
//!
//! - `readers` on the list counts threads that are somewhere inside [FreeList::pop].
//!   Nothing that was ever reachable from this list gets physically freed
//!   unless either this is zero, or the entry is known to never have been
//!   seen by any of the current readers.
//! - `ref_count` on each entry counts threads that are looking at that particular
//!   entry. A popper bumps it before it re-checks the head and reads `next`.
//!   An entry only goes back onto a list once its count is back down to
//!   [BASELINE_REF], so a popper holding a stale snapshot can never
//!   see the same entry come back with a different `next` (no ABA).
//!
//! The `owned` flag decides who gets an entry when the thread giving it back
//! ([FreeList::push_returned]) and stale poppers race each other.
//! Whoever brings `ref_count` down to exactly [BASELINE_REF] may try to
//! flip `owned` from false to true, and exactly one of them wins.
//!
//! An entry that was popped while other readers were around keeps the
//! popper's extra count ("leftover") until it is given back. That is what
//! routes its return through the slow path.
//!
//! ordering: the reader/ref_count handshake is a store-load (Dekker-style)
//! pattern between different variables, so every access taking part in it
//! is `SeqCst`.

use std::{
    fmt::{self, Debug},
    ptr::{self, NonNull},
    sync::atomic::Ordering,
};

use crate::{
    entry::{Entry, BASELINE_REF},
    loom_testing::*,
    util::SpinWait,
};

pub struct FreeList {
    /// Top of the stack
    head: AtomicPtr<Entry>,
    /// Threads currently inside the pop protocol (or giving an entry back)
    readers: AtomicUsize,
}

impl Debug for FreeList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FreeList")
            .field("@addr", &(self as *const _))
            .field("head", &self.head.load(Ordering::Relaxed))
            .field("readers", &self.readers.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for FreeList {
    fn default() -> Self {
        Self::new()
    }
}

impl FreeList {
    pub fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            readers: AtomicUsize::new(0),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::SeqCst).is_null()
    }

    /// Number of threads currently inside [pop](Self::pop)
    pub fn readers(&self) -> usize {
        self.readers.load(Ordering::SeqCst)
    }

    /// Push an entry
    ///
    /// # Safety
    ///
    /// The caller must exclusively own `entry` (it is on no list and nobody
    /// else can claim it), and it must stay allocated for as long as it is
    /// reachable from this list
    pub unsafe fn push(&self, entry: NonNull<Entry>) {
        let e = entry.as_ref();
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            e.store_next(head);
            // order: release so that the write to next is visible to
            // whoever pops this (SeqCst because pop re-validates head)
            match self.head.compare_exchange_weak(
                head,
                entry.as_ptr(),
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(x) => head = x,
            }
        }
    }

    /// Pop an entry, which the caller then exclusively owns
    ///
    /// Returns `None` if the list was empty at some point during the call.
    pub fn pop(&self) -> Option<NonNull<Entry>> {
        // announce ourselves before touching any entry,
        // which keeps everything we might see from being freed
        self.readers.fetch_add(1, Ordering::SeqCst);

        let mut spin = SpinWait::new();
        let popped = loop {
            let Some(first) = NonNull::new(self.head.load(Ordering::SeqCst)) else {
                break None;
            };
            // safety: we are a registered reader, see module docs
            let e = unsafe { first.as_ref() };

            // "i am looking at this", which keeps it from coming back
            // onto the list with a different next pointer
            e.ref_count.fetch_add(1, Ordering::SeqCst);

            if self.head.load(Ordering::SeqCst) == first.as_ptr() {
                let next = e.load_next();
                if self
                    .head
                    .compare_exchange(first.as_ptr(), next, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    break Some(first);
                }
            }

            // somebody else unlinked it first
            let prev = e.ref_count.fetch_sub(1, Ordering::SeqCst);
            assert!(prev > BASELINE_REF, "entry ref_count underflow in pop");
            if prev - 1 == BASELINE_REF
                && e
                    .owned
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
            {
                // it was given back while we were looking at it,
                // and we were the last one looking, so it is ours now.
                // take the count again so that leaving below stays balanced
                e.ref_count.fetch_add(1, Ordering::SeqCst);
                break Some(first);
            }

            spin.spin();
        };

        let prev_readers = self.readers.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev_readers > 0);
        if let Some(first) = popped {
            if prev_readers == 1 {
                // nobody else can be in the middle of looking at it,
                // so it is safe to go back to the baseline
                unsafe { first.as_ref() }
                    .ref_count
                    .fetch_sub(1, Ordering::SeqCst);
            }
        }
        popped
    }

    /// Give back an entry that came out of [pop](Self::pop) (or was freshly
    /// allocated)
    ///
    /// If other poppers were around when it was popped, one of them may
    /// end up taking it instead. Returns whether this call linked it in.
    /// Either way the caller no longer owns the entry afterwards.
    ///
    /// # Safety
    ///
    /// Same as [push](Self::push)
    pub unsafe fn push_returned(&self, entry: NonNull<Entry>) -> bool {
        let e = entry.as_ref();
        if e.ref_count.load(Ordering::SeqCst) == BASELINE_REF {
            // fast path, nobody has seen this entry since it was handed out
            self.push(entry);
            return true;
        }

        // keep a concurrent drain from completing underneath us
        self.readers.fetch_add(1, Ordering::SeqCst);
        e.owned.store(false, Ordering::SeqCst);
        let prev = e.ref_count.fetch_sub(1, Ordering::SeqCst);
        assert!(prev > BASELINE_REF, "entry ref_count underflow in push");
        let pushed = prev - 1 == BASELINE_REF
            && e
                .owned
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok();
        if pushed {
            self.push(entry);
        }
        self.readers.fetch_sub(1, Ordering::SeqCst);
        pushed
    }

    /// Check whether an entry the caller holds (and which came out of this
    /// list or was freshly allocated) may be handed to the backing
    /// allocator right now
    ///
    /// On success the entry is either claimed (`ref_count` 1 -> 0) or
    /// there are no readers who could still be looking at it.
    pub fn try_claim_release(&self, entry: &Entry) -> bool {
        if entry
            .ref_count
            .compare_exchange(BASELINE_REF, 0, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return true;
        }
        self.readers.load(Ordering::SeqCst) == 0
    }

    /// Detach every entry at once
    ///
    /// Entries in the returned chain may still be looked at by stale
    /// readers of *some* list until the relevant
    /// [wait_quiescent](Self::wait_quiescent) returns.
    pub fn take_all(&self) -> DetachedChain {
        DetachedChain(self.head.swap(ptr::null_mut(), Ordering::SeqCst))
    }

    /// Wait until nobody is inside [pop](Self::pop)
    pub fn wait_quiescent(&self) {
        SpinWait::new().until(|| self.readers.load(Ordering::SeqCst) == 0);
    }

    /// Empty the list, handing every entry to `release` once that is safe
    ///
    /// Returns how many entries there were.
    pub fn drain_all(&self, mut release: impl FnMut(NonNull<Entry>)) -> usize {
        let chain = self.take_all();
        self.wait_quiescent();
        let mut n = 0;
        for entry in chain {
            release(entry);
            n += 1;
        }
        n
    }
}

/// Entries detached from a [FreeList] by [FreeList::take_all]
///
/// Iterating reads each `next` pointer before yielding the entry,
/// so the consumer may free entries as it goes.
#[derive(Debug)]
pub struct DetachedChain(*mut Entry);

impl DetachedChain {
    pub fn is_empty(&self) -> bool {
        self.0.is_null()
    }
}

impl Iterator for DetachedChain {
    type Item = NonNull<Entry>;

    fn next(&mut self) -> Option<NonNull<Entry>> {
        let cur = NonNull::new(self.0)?;
        // safety: nothing in a detached chain is freed before being yielded
        self.0 = unsafe { cur.as_ref() }.load_next();
        Some(cur)
    }
}

/// A registered reader that never touches anything,
/// as if some thread had stalled right after entering [FreeList::pop]
#[cfg(test)]
pub(crate) struct StalledReader<'list>(&'list FreeList);

#[cfg(test)]
impl FreeList {
    pub(crate) fn stall_reader(&self) -> StalledReader<'_> {
        self.readers.fetch_add(1, Ordering::SeqCst);
        StalledReader(self)
    }
}

#[cfg(test)]
impl<'list> Drop for StalledReader<'list> {
    fn drop(&mut self) {
        self.0.readers.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests;
