//! The pool: a ladder of power-of-two buckets, any number of registered
//! buckets with arbitrary block sizes, and the worker that releases
//! entries which could not be released on the spot

use std::{
    fmt::{self, Debug, Display},
    io,
    ptr::{self, NonNull},
    sync::{atomic::Ordering, Arc},
    thread::JoinHandle,
    time::Duration,
};

use tracing::Level;

use crate::{
    backing::{Backing, LeakReport, RawAllocator, SystemAllocator, Tag, TagLedger},
    bucket::{Bucket, ContendedRelease, FreeOutcome},
    config::{MemoryBudget, PoolConfig},
    entry::{ClassId, Entry},
    error::PoolError,
    event::Event,
    loom_testing::*,
};

/// Index of the smallest power-of-two class that can hold `size` bytes
///
/// Sizes 0 and 1 both map to class 0.
pub const fn size_class(size: usize) -> usize {
    if size <= 1 {
        0
    } else {
        (usize::BITS - (size - 1).leading_zeros()) as usize
    }
}

/// Most fixed classes a pool can have, class `i` holds `2^i` bytes
pub const MAX_CLASSES: usize = usize::BITS as usize;

/// A registered bucket, linked into the pool's list
struct CustomBucket {
    bucket: Bucket,
    /// Never changes after the node has been published
    next: *mut CustomBucket,
}

/// Everything the worker thread shares with the pool handle
struct PoolShared {
    buckets: Box<[Bucket]>,
    custom: AtomicPtr<CustomBucket>,
    next_custom: AtomicU32,
    needs_reclaim: AtomicBool,
    shutdown: AtomicBool,
    wakeup: Event,
    backing: Backing,
    contended_release: ContendedRelease,
}

impl PoolShared {
    fn custom_buckets(&self) -> impl Iterator<Item = &Bucket> + '_ {
        // order: acquire pairs with the release in register_bucket,
        // so the node contents are visible
        let head = self.custom.load(Ordering::Acquire);
        // safety: nodes are only freed when PoolShared is dropped
        std::iter::successors(unsafe { head.as_ref() }, |node| unsafe {
            node.next.as_ref()
        })
        .map(|node| &node.bucket)
    }

    fn all_buckets(&self) -> impl Iterator<Item = &Bucket> + '_ {
        self.buckets.iter().chain(self.custom_buckets())
    }

    fn bucket(&self, class: ClassId) -> Option<&Bucket> {
        if class.is_custom() {
            self.custom_buckets().find(|b| b.class() == class)
        } else {
            self.buckets.get(class.index())
        }
    }

    /// Registered bucket with the smallest block size that still fits
    fn best_fit_custom(&self, size: usize) -> Option<&Bucket> {
        self.custom_buckets()
            .filter(|b| b.block_size() >= size)
            .min_by_key(|b| b.block_size())
    }

    fn reclaim_all(&self) -> usize {
        let trace_span = tracing::span!(Level::TRACE, "pool::reclaim_all");
        let _span_enter = trace_span.enter();

        let released = self
            .all_buckets()
            .map(|b| b.reclaim_deferred(&self.backing))
            .sum();
        tracing::event!(Level::DEBUG, released, "reclaim pass");
        released
    }
}

impl Drop for PoolShared {
    fn drop(&mut self) {
        let mut cur = self.custom.swap(ptr::null_mut(), Ordering::Acquire);
        while !cur.is_null() {
            // safety: every node came from Box::into_raw and nobody else
            // can reach the list anymore
            let node = unsafe { Box::from_raw(cur) };
            cur = node.next;
        }
    }
}

fn reclaim_worker(shared: Arc<PoolShared>, interval: Duration) {
    tracing::event!(Level::DEBUG, "reclaim worker started");
    loop {
        // order: SeqCst to pair with the store in free, after the entry
        // has been pushed onto the unusable list
        while shared.needs_reclaim.swap(false, Ordering::SeqCst) {
            shared.reclaim_all();
        }
        if shared.shutdown.load(Ordering::SeqCst) {
            break;
        }
        shared.wakeup.wait(interval);
    }
    tracing::event!(Level::DEBUG, "reclaim worker exited");
}

/// Per-bucket numbers, see [Pool::stats]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClassStats {
    pub class: ClassId,
    pub block_size: usize,
    pub threshold: usize,
    pub live_entries: usize,
}

impl ClassStats {
    fn of(bucket: &Bucket) -> Self {
        Self {
            class: bucket.class(),
            block_size: bucket.block_size(),
            threshold: bucket.threshold(),
            live_entries: bucket.live_entries(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolStats {
    pub fixed: Vec<ClassStats>,
    pub custom: Vec<ClassStats>,
}

impl PoolStats {
    pub fn live_entries(&self) -> usize {
        self.fixed
            .iter()
            .chain(self.custom.iter())
            .map(|c| c.live_entries)
            .sum()
    }
}

impl Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "memory pool bucket entries:")?;
        for (i, c) in self.fixed.iter().enumerate() {
            write!(f, "[{:2}] = {:10}, ", i, c.live_entries)?;
            if (i + 1) % 4 == 0 {
                writeln!(f)?;
            }
        }
        if self.fixed.len() % 4 != 0 {
            writeln!(f)?;
        }
        for c in &self.custom {
            writeln!(
                f,
                "[c{}] block_size = {}, entries = {}",
                c.class.index(),
                c.block_size,
                c.live_entries
            )?;
        }
        Ok(())
    }
}

/// Size-classed pool of reusable memory blocks
///
/// All allocation and free operations take `&self` and may be called from
/// any number of threads. A background thread (`lfpool-reclaim`) releases
/// blocks that could not be handed back to the system right away.
pub struct Pool {
    shared: Arc<PoolShared>,
    worker: Option<JoinHandle<()>>,
    torn_down: bool,
}

impl Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("@addr", &(self as *const _))
            .field("classes", &self.shared.buckets.len())
            .field("backing", &self.shared.backing)
            .field("torn_down", &self.torn_down)
            .finish_non_exhaustive()
    }
}

impl Pool {
    /// Set up a pool over the system allocator and start its worker
    pub fn new(config: PoolConfig) -> io::Result<Self> {
        Self::with_allocator(config, SystemAllocator)
    }

    /// Pool allowed to keep at most `budget` bytes (but at least
    /// `min_reserve`), with everything else at the defaults
    pub fn with_budget(budget: u64, min_reserve: u64) -> io::Result<Self> {
        Self::new(
            PoolConfig::default()
                .with_budget(MemoryBudget::Bytes(budget))
                .with_min_usable(min_reserve),
        )
    }

    pub fn with_allocator(
        config: PoolConfig,
        raw: impl RawAllocator + 'static,
    ) -> io::Result<Self> {
        if config.classes > MAX_CLASSES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "{} size classes requested, at most {} are possible",
                    config.classes, MAX_CLASSES
                ),
            ));
        }
        let threshold = config.class_threshold();
        let buckets = (0..config.classes)
            .map(|i| Bucket::new(1 << i, threshold, ClassId::fixed(i)))
            .collect::<Box<[_]>>();

        let shared = Arc::new(PoolShared {
            buckets,
            custom: AtomicPtr::new(ptr::null_mut()),
            next_custom: AtomicU32::new(0),
            needs_reclaim: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            wakeup: Event::new(),
            backing: Backing::new(raw),
            contended_release: config.contended_release,
        });

        let worker = {
            let shared = shared.clone();
            let interval = config.reclaim_interval;
            std::thread::Builder::new()
                .name("lfpool-reclaim".into())
                .spawn(move || reclaim_worker(shared, interval))?
        };

        tracing::event!(
            Level::INFO,
            classes = config.classes,
            threshold,
            budget = ?config.budget,
            "memory pool initialized"
        );

        Ok(Self {
            shared,
            worker: Some(worker),
            torn_down: false,
        })
    }

    /// Number of fixed power-of-two classes
    pub fn classes(&self) -> usize {
        self.shared.buckets.len()
    }

    pub fn ledger(&self) -> &TagLedger {
        self.shared.backing.ledger()
    }

    pub fn malloc(&self, size: usize) -> Result<NonNull<u8>, PoolError> {
        self.malloc_tagged(size, Tag::DEFAULT)
    }

    /// Allocate a block of at least `size` bytes, accounted under `tag`
    pub fn malloc_tagged(&self, size: usize, tag: Tag) -> Result<NonNull<u8>, PoolError> {
        let shared = &*self.shared;
        let bucket = match shared.buckets.get(size_class(size)) {
            Some(bucket) => bucket,
            None => shared
                .best_fit_custom(size)
                .ok_or(PoolError::InvalidSize { size })?,
        };
        let ret = bucket.malloc(size, tag, &shared.backing);
        debug_assert!(!matches!(ret, Err(PoolError::SizeExceedsClass { .. })));
        ret
    }

    /// Allocate from one specific bucket
    pub fn malloc_in(
        &self,
        class: ClassId,
        size: usize,
        tag: Tag,
    ) -> Result<NonNull<u8>, PoolError> {
        let shared = &*self.shared;
        let bucket = shared
            .bucket(class)
            .ok_or(PoolError::UnknownClass { class })?;
        bucket.malloc(size, tag, &shared.backing)
    }

    /// Give a block back to the pool
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by an allocation on this pool and not
    /// freed since, and the caller must not touch it afterwards
    pub unsafe fn free(&self, ptr: NonNull<u8>) {
        let shared = &*self.shared;
        let entry = Entry::from_payload(ptr);
        let class = entry.as_ref().class();
        let Some(bucket) = shared.bucket(class) else {
            panic!("freeing {:?} which belongs to unknown {:?}", ptr, class);
        };

        let outcome = bucket.free(entry, &shared.backing, shared.contended_release);
        if outcome == FreeOutcome::Deferred {
            // order: see reclaim_worker
            shared.needs_reclaim.store(true, Ordering::SeqCst);
            shared.wakeup.signal();
        }
    }

    /// Capacity of the block behind `ptr`, which is at least what was asked for
    ///
    /// # Safety
    ///
    /// `ptr` must currently be allocated from this pool
    pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        Entry::from_payload(ptr).as_ref().size()
    }

    /// Add a bucket with an arbitrary block size
    ///
    /// It is used for sizes beyond the fixed classes (smallest fitting one
    /// wins), or when asked for explicitly with [malloc_in](Self::malloc_in).
    pub fn register_bucket(&self, block_size: usize, threshold: usize) -> ClassId {
        let shared = &*self.shared;
        // order: only needs to be unique
        let class = ClassId::custom(shared.next_custom.fetch_add(1, Ordering::Relaxed));
        let node = Box::into_raw(Box::new(CustomBucket {
            bucket: Bucket::new(block_size, threshold, class),
            next: ptr::null_mut(),
        }));

        let mut head = shared.custom.load(Ordering::Relaxed);
        loop {
            // safety: not published yet, we still own it
            unsafe { (*node).next = head };
            // order: release publishes the node contents
            match shared.custom.compare_exchange_weak(
                head,
                node,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(x) => head = x,
            }
        }

        tracing::event!(Level::DEBUG, ?class, block_size, threshold, "registered bucket");
        class
    }

    /// Snapshot of how many entries every bucket holds
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            fixed: self.shared.buckets.iter().map(ClassStats::of).collect(),
            custom: self.shared.custom_buckets().map(ClassStats::of).collect(),
        }
    }

    /// Stop the worker, release everything held by every bucket,
    /// and report tags whose allocations and frees don't match
    pub fn clear(mut self) -> LeakReport {
        self.teardown()
    }

    fn teardown(&mut self) -> LeakReport {
        self.torn_down = true;
        let shared = &*self.shared;

        shared.shutdown.store(true, Ordering::SeqCst);
        shared.wakeup.signal();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::event!(Level::ERROR, "reclaim worker panicked");
            }
        }

        let released = shared
            .all_buckets()
            .map(|b| b.clear(&shared.backing))
            .sum::<usize>();

        let report = shared.backing.ledger().report();
        if report.is_clean() {
            tracing::event!(Level::INFO, released, "memory pool cleared");
        } else {
            tracing::event!(Level::WARN, released, %report, "memory pool cleared");
        }
        report
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        if !self.torn_down {
            self.teardown();
        }
    }
}
