//! Header that sits in front of every pooled block
//!
//! ```text
//! +--------------------+------------------------------+
//! | Entry (rounded up) | payload (block_size bytes)   |
//! +--------------------+------------------------------+
//! ^ backing allocation ^ pointer handed to the caller
//! ```
//!
//! `ref_count` meanings:
//! - 0: claimed for release, nothing else may claim it
//! - 1: freshly allocated, sitting in a list, or popped uniquely
//! - more: some other thread is (or was, without having noticed yet)
//!   looking at this entry in the middle of a pop
//!
//! `next` is only meaningful while the entry is linked into a list,
//! but stale poppers can still read it afterwards, so it is atomic.

use std::{
    alloc::Layout,
    fmt::{self, Debug},
    mem::size_of,
    ptr::{self, NonNull},
    sync::atomic::Ordering,
};

use crate::{
    backing::{Backing, Tag},
    loom_testing::*,
    util::roundto,
};

/// `ref_count` of an entry nobody else is looking at
pub const BASELINE_REF: usize = 1;

/// Alignment of the header, and therefore of every payload
pub const ENTRY_ALIGN: usize = size_of::<usize>() * 4;

/// Bytes between the start of an entry and its payload
pub const HEADER_SIZE: usize = roundto(size_of::<Entry>(), ENTRY_ALIGN);

/// Bit set in a [ClassId] that refers to a registered bucket
const CUSTOM_CLASS_BIT: u32 = 1 << 31;

/// Identifies the bucket an entry belongs to
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClassId(u32);

impl ClassId {
    pub const fn fixed(idx: usize) -> Self {
        debug_assert!((idx as u32) & CUSTOM_CLASS_BIT == 0);
        Self(idx as u32)
    }

    pub const fn custom(ordinal: u32) -> Self {
        debug_assert!(ordinal & CUSTOM_CLASS_BIT == 0);
        Self(ordinal | CUSTOM_CLASS_BIT)
    }

    pub const fn is_custom(self) -> bool {
        self.0 & CUSTOM_CLASS_BIT != 0
    }

    /// Index into the fixed ladder, or registration ordinal
    pub const fn index(self) -> usize {
        (self.0 & !CUSTOM_CLASS_BIT) as usize
    }
}

impl Debug for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_custom() {
            write!(f, "ClassId::custom({})", self.index())
        } else {
            write!(f, "ClassId::fixed({})", self.index())
        }
    }
}

#[repr(C)]
pub struct Entry {
    /// Intrusive free list link
    next: AtomicPtr<Entry>,
    /// See module docs
    pub(crate) ref_count: AtomicUsize,
    /// Single-winner token, see [FreeList::pop](crate::free_list::FreeList::pop)
    pub(crate) owned: AtomicBool,
    /// Block capacity (not the size that was requested)
    size: usize,
    class: ClassId,
    tag: Tag,
}

impl Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("@addr", &(self as *const _))
            .field("next", &self.next.load(Ordering::Relaxed))
            .field("ref_count", &self.ref_count.load(Ordering::Relaxed))
            .field("owned", &self.owned.load(Ordering::Relaxed))
            .field("size", &self.size)
            .field("class", &self.class)
            .field("tag", &self.tag)
            .finish()
    }
}

impl Entry {
    /// Layout of the whole backing allocation for a given block size
    pub fn layout(block_size: usize) -> Option<Layout> {
        let total = HEADER_SIZE.checked_add(block_size)?;
        Layout::from_size_align(total, ENTRY_ALIGN).ok()
    }

    /// Allocate and initialize a fresh entry, already owned by the caller
    pub fn create(
        backing: &Backing,
        size: usize,
        class: ClassId,
        tag: Tag,
    ) -> Option<NonNull<Entry>> {
        let layout = Self::layout(size)?;
        let mem = backing.alloc(layout, tag)?.cast::<Entry>();
        unsafe {
            // safety: fresh allocation, big and aligned enough for a header
            ptr::write(
                mem.as_ptr(),
                Entry {
                    next: AtomicPtr::new(ptr::null_mut()),
                    ref_count: AtomicUsize::new(BASELINE_REF),
                    owned: AtomicBool::new(true),
                    size,
                    class,
                    tag,
                },
            );
        }
        Some(mem)
    }

    /// Give an entry back to the backing allocator
    ///
    /// # Safety
    ///
    /// `entry` must have come from [create](Self::create) with the same
    /// backing, and no thread may touch it ever again
    pub unsafe fn destroy(backing: &Backing, entry: NonNull<Entry>) {
        let (size, tag) = {
            let e = entry.as_ref();
            (e.size, e.tag)
        };
        // layout was valid when the entry was created
        let layout = Self::layout(size).unwrap();
        ptr::drop_in_place(entry.as_ptr());
        backing.free(entry.cast(), layout, tag);
    }

    /// Pointer handed out to the application
    pub fn payload(entry: NonNull<Entry>) -> NonNull<u8> {
        unsafe {
            // safety: every entry is allocated with room for the payload
            NonNull::new_unchecked((entry.as_ptr() as *mut u8).add(HEADER_SIZE))
        }
    }

    /// Recover the header from a payload pointer
    ///
    /// # Safety
    ///
    /// `payload` must have come from [payload](Self::payload)
    pub unsafe fn from_payload(payload: NonNull<u8>) -> NonNull<Entry> {
        NonNull::new_unchecked(payload.as_ptr().sub(HEADER_SIZE) as *mut Entry)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn class(&self) -> ClassId {
        self.class
    }

    pub fn tag(&self) -> Tag {
        self.tag
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::SeqCst)
    }

    /// Load next pointer with an atomic op (relaxed)
    ///
    /// Ordering is provided by the list head
    pub(crate) fn load_next(&self) -> *mut Entry {
        self.next.load(Ordering::Relaxed)
    }

    /// Store next pointer with an atomic op (relaxed)
    pub(crate) fn store_next(&self, next: *mut Entry) {
        self.next.store(next, Ordering::Relaxed);
    }
}
