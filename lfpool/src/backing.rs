//! Everything underneath the pool: the raw allocator that actually owns
//! memory, and the per-tag ledger that counts what went through it

use std::{
    alloc::{self, Layout},
    fmt::{self, Debug, Display},
    ptr::NonNull,
};

use rustc_hash::FxHashMap;

use crate::loom_testing::*;

/// Four character code attached to every raw allocation for leak accounting
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag(pub u32);

impl Tag {
    /// Tag used when the caller doesn't give one
    pub const DEFAULT: Tag = Tag::new(*b"pmfl");

    pub const fn new(code: [u8; 4]) -> Self {
        Self(u32::from_be_bytes(code))
    }

    pub const fn bytes(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }
}

impl Default for Tag {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for c in self.bytes() {
            let c = if c.is_ascii_graphic() || c == b' ' {
                c as char
            } else {
                '?'
            };
            write!(f, "{}", c)?;
        }
        Ok(())
    }
}

impl Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tag({})", self)
    }
}

/// The allocator that pooled blocks ultimately come from
///
/// Must be usable from any thread at any time.
pub trait RawAllocator: Send + Sync {
    /// Returns `None` on failure
    fn raw_alloc(&self, layout: Layout) -> Option<NonNull<u8>>;

    /// # Safety
    ///
    /// `ptr` must have come from [raw_alloc](Self::raw_alloc) on the same
    /// allocator with the same `layout`, and must not be used afterwards
    unsafe fn raw_free(&self, ptr: NonNull<u8>, layout: Layout);
}

/// [RawAllocator] backed by the global Rust allocator
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAllocator;

impl RawAllocator for SystemAllocator {
    fn raw_alloc(&self, layout: Layout) -> Option<NonNull<u8>> {
        debug_assert!(layout.size() != 0);
        // safety: layouts used by the pool always include the entry header
        NonNull::new(unsafe { alloc::alloc(layout) })
    }

    unsafe fn raw_free(&self, ptr: NonNull<u8>, layout: Layout) {
        alloc::dealloc(ptr.as_ptr(), layout)
    }
}

/// Allocation and free counts for one tag
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TagCounts {
    pub allocs: u64,
    pub frees: u64,
}

/// Counts raw allocations and frees per [Tag]
pub struct TagLedger {
    counts: Mutex<FxHashMap<Tag, TagCounts>>,
}

impl Debug for TagLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // only the mismatches are interesting
        f.debug_struct("TagLedger")
            .field("leaks", &self.report().leaks)
            .finish()
    }
}

impl Default for TagLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl TagLedger {
    pub fn new() -> Self {
        Self {
            counts: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn record_alloc(&self, tag: Tag) {
        let mut counts = self.counts.lock().unwrap();
        counts.entry(tag).or_default().allocs += 1;
    }

    pub fn record_free(&self, tag: Tag) {
        let mut counts = self.counts.lock().unwrap();
        counts.entry(tag).or_default().frees += 1;
    }

    pub fn counts(&self, tag: Tag) -> TagCounts {
        let counts = self.counts.lock().unwrap();
        counts.get(&tag).copied().unwrap_or_default()
    }

    /// Every tag whose allocation and free counts disagree
    pub fn report(&self) -> LeakReport {
        let counts = self.counts.lock().unwrap();
        let mut leaks = counts
            .iter()
            .filter(|(_, c)| c.allocs != c.frees)
            .map(|(tag, c)| (*tag, *c))
            .collect::<Vec<_>>();
        leaks.sort_by_key(|(tag, _)| *tag);
        LeakReport { leaks }
    }
}

/// Result of comparing allocation and free counts at teardown
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LeakReport {
    pub leaks: Vec<(Tag, TagCounts)>,
}

impl LeakReport {
    pub fn is_clean(&self) -> bool {
        self.leaks.is_empty()
    }
}

impl Display for LeakReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_clean() {
            return write!(f, "no leaks");
        }
        write!(f, "potential memory leak:")?;
        for (tag, c) in &self.leaks {
            write!(f, " {}({}, {})", tag, c.allocs, c.frees)?;
        }
        Ok(())
    }
}

/// Raw allocator plus ledger, i.e. what buckets allocate from
pub struct Backing {
    raw: Box<dyn RawAllocator>,
    ledger: TagLedger,
}

impl Debug for Backing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backing")
            .field("ledger", &self.ledger)
            .finish_non_exhaustive()
    }
}

impl Backing {
    pub fn new(raw: impl RawAllocator + 'static) -> Self {
        Self {
            raw: Box::new(raw),
            ledger: TagLedger::new(),
        }
    }

    pub fn system() -> Self {
        Self::new(SystemAllocator)
    }

    pub fn ledger(&self) -> &TagLedger {
        &self.ledger
    }

    pub fn alloc(&self, layout: Layout, tag: Tag) -> Option<NonNull<u8>> {
        let ptr = self.raw.raw_alloc(layout)?;
        self.ledger.record_alloc(tag);
        Some(ptr)
    }

    /// # Safety
    ///
    /// Same as [RawAllocator::raw_free]
    pub unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout, tag: Tag) {
        self.ledger.record_free(tag);
        self.raw.raw_free(ptr, layout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_display() {
        assert_eq!(Tag::DEFAULT.to_string(), "pmfl");
        assert_eq!(Tag::new([b'a', 0, b'c', 0xff]).to_string(), "a?c?");
        assert_eq!(format!("{:?}", Tag::new(*b"abcd")), "Tag(abcd)");
    }

    #[cfg(not(loom))]
    #[test]
    fn ledger_report() {
        let ledger = TagLedger::new();
        let a = Tag::new(*b"aaaa");
        let b = Tag::new(*b"bbbb");
        ledger.record_alloc(a);
        ledger.record_alloc(a);
        ledger.record_free(a);
        ledger.record_alloc(b);
        ledger.record_free(b);

        let report = ledger.report();
        assert!(!report.is_clean());
        assert_eq!(
            report.leaks,
            vec![(a, TagCounts { allocs: 2, frees: 1 })]
        );
        assert_eq!(report.to_string(), "potential memory leak: aaaa(2, 1)");

        ledger.record_free(a);
        assert!(ledger.report().is_clean());
        assert_eq!(ledger.report().to_string(), "no leaks");
    }

    #[cfg(not(loom))]
    #[test]
    fn backing_counts_through_ledger() {
        let backing = Backing::system();
        let layout = Layout::from_size_align(64, 8).unwrap();
        let p = backing.alloc(layout, Tag::DEFAULT).unwrap();
        assert_eq!(
            backing.ledger().counts(Tag::DEFAULT),
            TagCounts { allocs: 1, frees: 0 }
        );
        unsafe { backing.free(p, layout, Tag::DEFAULT) };
        assert!(backing.ledger().report().is_clean());
    }
}
