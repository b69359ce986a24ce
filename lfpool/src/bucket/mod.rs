//! One size class: a list of entries ready for reuse, a list of entries
//! waiting to be released, and the budget that decides between the two

use std::{
    fmt::{self, Debug},
    ptr::NonNull,
    sync::atomic::Ordering,
};

use tracing::Level;

use crate::{
    backing::{Backing, Tag},
    entry::{ClassId, Entry, BASELINE_REF},
    error::PoolError,
    free_list::FreeList,
    loom_testing::*,
    util::UsizePtr,
};

/// What to do with an over-budget entry that somebody might still be looking at
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ContendedRelease {
    /// Park it on the unusable list for the reclaim worker
    #[default]
    Defer,
    /// Spin (then yield) on the freeing thread until it is safe
    Spin,
}

/// What [Bucket::free] ended up doing
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FreeOutcome {
    /// Pushed onto the usable list
    Recycled,
    /// A concurrent popper took it over while it was being given back
    Adopted,
    /// Given back to the backing allocator
    Released,
    /// Pushed onto the unusable list, the reclaim worker needs to run
    Deferred,
}

pub struct Bucket {
    /// Payload capacity of every entry
    block_size: usize,
    /// Recorded in every entry so that free can find us again
    class: ClassId,
    /// Entries ready to be handed out again
    usable: FreeList,
    /// Entries waiting until they can be released safely
    unusable: FreeList,
    /// Entries currently allocated from the backing allocator
    /// (whether linked, parked, or in use)
    live_entries: AtomicUsize,
    /// Maximum bytes this class holds on to
    threshold: usize,
}

impl Debug for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bucket")
            .field("@addr", &(self as *const _))
            .field("block_size", &self.block_size)
            .field("class", &self.class)
            .field("usable", &self.usable)
            .field("unusable", &self.unusable)
            .field("live_entries", &self.live_entries.load(Ordering::Relaxed))
            .field("threshold", &self.threshold)
            .finish()
    }
}

impl Bucket {
    pub fn new(block_size: usize, threshold: usize, class: ClassId) -> Self {
        Self {
            block_size,
            class,
            usable: FreeList::new(),
            unusable: FreeList::new(),
            live_entries: AtomicUsize::new(0),
            threshold,
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn class(&self) -> ClassId {
        self.class
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn live_entries(&self) -> usize {
        // order: diagnostic and budget use only, races are tolerated
        self.live_entries.load(Ordering::Relaxed)
    }

    /// Entries available for reuse, or parked for release, right now
    pub fn has_usable(&self) -> bool {
        !self.usable.is_empty()
    }

    pub fn has_deferred(&self) -> bool {
        !self.unusable.is_empty()
    }

    /// Hand out a block of at least `size` bytes
    pub fn malloc(
        &self,
        size: usize,
        tag: Tag,
        backing: &Backing,
    ) -> Result<NonNull<u8>, PoolError> {
        if size > self.block_size {
            return Err(PoolError::SizeExceedsClass {
                size,
                block_size: self.block_size,
            });
        }

        if let Some(entry) = self.usable.pop() {
            debug_assert_eq!(unsafe { entry.as_ref() }.size(), self.block_size);
            return Ok(Entry::payload(entry));
        }

        let trace_span = tracing::span!(
            Level::TRACE,
            "bucket::malloc_fresh",
            block_size = self.block_size,
            %tag
        );
        let _span_enter = trace_span.enter();

        let entry = Entry::create(backing, self.block_size, self.class, tag).ok_or(
            PoolError::OutOfMemory {
                size: self.block_size,
            },
        )?;
        // order: only a count, the entry itself is not published through it
        self.live_entries.fetch_add(1, Ordering::Relaxed);
        tracing::event!(Level::TRACE, ptr = ?UsizePtr::from(entry));
        Ok(Entry::payload(entry))
    }

    /// Take back an entry, recycling or releasing it depending on the budget
    ///
    /// # Safety
    ///
    /// `entry` must have been handed out by [malloc](Self::malloc) on this
    /// bucket with the same `backing`, and the caller must not use it again
    pub unsafe fn free(
        &self,
        entry: NonNull<Entry>,
        backing: &Backing,
        contended: ContendedRelease,
    ) -> FreeOutcome {
        let e = entry.as_ref();
        debug_assert!(e.ref_count() >= BASELINE_REF);
        debug_assert_eq!(e.size(), self.block_size);

        let live = self.live_entries();
        let over_budget = self.block_size.saturating_mul(live + 1) > self.threshold;

        if over_budget {
            if self.usable.try_claim_release(e) {
                self.release(entry, backing);
                return FreeOutcome::Released;
            }
            match contended {
                ContendedRelease::Defer => {
                    tracing::event!(
                        name: "bucket::defer",
                        Level::TRACE,
                        block_size = self.block_size,
                        ptr = ?UsizePtr::from(entry)
                    );
                    self.unusable.push(entry);
                    FreeOutcome::Deferred
                }
                ContendedRelease::Spin => {
                    self.usable.wait_quiescent();
                    self.release(entry, backing);
                    FreeOutcome::Released
                }
            }
        } else if self.usable.push_returned(entry) {
            FreeOutcome::Recycled
        } else {
            FreeOutcome::Adopted
        }
    }

    /// Release everything parked on the unusable list, once no pop on the
    /// usable list could still be looking at any of it
    ///
    /// Returns how many entries were released.
    pub fn reclaim_deferred(&self, backing: &Backing) -> usize {
        let chain = self.unusable.take_all();
        if chain.is_empty() {
            return 0;
        }
        self.usable.wait_quiescent();
        let mut n = 0;
        for entry in chain {
            // safety: detached and quiescent, so this is the only reference left
            unsafe { self.release(entry, backing) };
            n += 1;
        }
        tracing::event!(
            name: "bucket::reclaim",
            Level::TRACE,
            block_size = self.block_size,
            released = n
        );
        n
    }

    /// Release every entry on both lists
    ///
    /// Entries currently handed out are not touched.
    pub fn clear(&self, backing: &Backing) -> usize {
        // safety: drained entries are unreachable once drain_all hands them over
        let n = self
            .usable
            .drain_all(|entry| unsafe { self.release(entry, backing) });
        n + self.reclaim_deferred(backing)
    }

    /// # Safety
    ///
    /// Nobody may be able to reach `entry` anymore
    unsafe fn release(&self, entry: NonNull<Entry>, backing: &Backing) {
        let prev = self.live_entries.fetch_sub(1, Ordering::Relaxed);
        assert!(prev > 0, "live entry count underflow");
        Entry::destroy(backing, entry);
    }
}

#[cfg(test)]
impl Bucket {
    pub(crate) fn stall_usable_reader(&self) -> crate::free_list::StalledReader<'_> {
        self.usable.stall_reader()
    }
}
