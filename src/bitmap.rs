//! The bitmap engine: 64-slot chunks with an embedded atomic free
//! bitmap.
//!
//! Same contract as the pool engine, different layout. A chunk holds
//! exactly one machine word of free bits, so finding a slot is one
//! trailing-zero count and freeing one is one atomic XOR; the cells
//! themselves always hold payloads verbatim. Chunks are allocated at
//! the alignment of their slot array, so the owning chunk of a slot is
//! recovered by masking, like pools.
//!
//! Generational policy: every root is created in a chunk on the young
//! ring, whose slots are treated as *possibly* nursery. The minor scan
//! walks the young ring with a fast range check against the nursery
//! and forwards the hits; afterwards the whole ring migrates to the
//! old ring in O(1), since the nursery has been evacuated. Major scans
//! walk both rings.
//!
//! Ring manipulation is serialized by the engine lock; bitmap updates
//! are relaxed atomics, so create and delete racing on different
//! chunks never contend.

use std::cell::{Cell, UnsafeCell};
use std::alloc::Layout;
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use slog::{debug, o, trace, warn, Logger};

use crate::lock::Lock;
use crate::ring::{self, Links, Node, Ring};
use crate::runtime::{GcRuntime, ScanningAction};
use crate::stats::{self, Stats};
use crate::value::Value;

/// Slots per chunk: the width of the free bitmap.
pub const CHUNK_SLOTS: usize = 64;
/// Chunks are aligned to the size of their slot array.
const CHUNK_ALIGNMENT: usize = CHUNK_SLOTS * mem::size_of::<Slot>();
const CHUNK_MASK: usize = CHUNK_ALIGNMENT - 1;

/// Every slot free (bit set = free).
const BITMAP_EMPTY: u64 = !0;

const _: () = assert!(CHUNK_ALIGNMENT.is_power_of_two());

/// One cell of chunk storage. Always a payload; the free/full state
/// lives in the chunk's bitmap.
#[repr(transparent)]
struct Slot(UnsafeCell<usize>);

impl Slot {
    #[inline]
    fn payload(&self) -> Value {
        Value::from_bits(unsafe { *self.0.get() })
    }

    #[inline]
    fn set_payload(&self, v: Value) {
        unsafe { *self.0.get() = v.to_bits() }
    }

    #[inline]
    fn payload_cell(&self) -> NonNull<Value> {
        unsafe { NonNull::new_unchecked(self.0.get() as *mut Value) }
    }
}

/// The slot array must stay first: masking a slot address by the
/// array's alignment recovers the chunk.
#[repr(C)]
pub(crate) struct Chunk {
    slots: [Slot; CHUNK_SLOTS],
    links: Links<Chunk>,
    is_young: Cell<bool>,
    free: AtomicU64,
}

unsafe impl Node for Chunk {
    fn links(&self) -> &Links<Chunk> {
        &self.links
    }
}

#[inline]
fn chunk_layout() -> Layout {
    unsafe { Layout::from_size_align_unchecked(mem::size_of::<Chunk>(), CHUNK_ALIGNMENT) }
}

#[inline]
fn chunk_of_slot(slot: NonNull<Slot>) -> NonNull<Chunk> {
    let base = slot.as_ptr() as usize & !CHUNK_MASK;
    unsafe { NonNull::new_unchecked(base as *mut Chunk) }
}

#[inline]
fn chunk_is_full(chunk: NonNull<Chunk>) -> bool {
    unsafe { chunk.as_ref() }.free.load(Ordering::Relaxed) == 0
}

/// Ring state shared under the engine lock.
struct ChunkRings {
    /// Chunks that may hold nursery payloads. Non-full chunks sit at
    /// the front.
    young: Ring<Chunk>,
    /// Chunks whose payloads are all mature or immediate.
    old: Ring<Chunk>,
}

// Chunk pointers are dereferenced under the engine lock, or through a
// handle whose slot and bitmap bit no ring operation touches.
unsafe impl Send for ChunkRings {}

/// A rooted reference handed out by [`BitmapEngine::create`].
///
/// Not cloneable; returned through [`BitmapEngine::delete`]. Unlike
/// the pool engine, [`BitmapEngine::modify`] may relocate the cell
/// when an old slot takes a nursery payload, so the handle variable is
/// passed by mutable reference and may be rewritten.
#[derive(Debug)]
pub struct BitmapRoot {
    slot: NonNull<Slot>,
}

unsafe impl Send for BitmapRoot {}
unsafe impl Sync for BitmapRoot {}

/// The bitmap-chunk engine.
pub struct BitmapEngine<R: GcRuntime> {
    runtime: R,
    logger: Logger,
    rings: Lock<ChunkRings>,
    stats: Stats,
    setup: AtomicBool,
    warned_before_setup: AtomicBool,
}

impl<R: GcRuntime> BitmapEngine<R> {
    pub fn new(runtime: R, logger: Logger) -> BitmapEngine<R> {
        BitmapEngine {
            runtime,
            logger: logger.new(o!("engine" => "bitmap")),
            rings: Lock::new(ChunkRings { young: None, old: None }),
            stats: Stats::new(),
            setup: AtomicBool::new(false),
            warned_before_setup: AtomicBool::new(false),
        }
    }

    /// Install the engine. Returns `false` if it was already set up.
    pub fn setup(&self) -> bool {
        if self.setup.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.stats.reset();
        debug!(self.logger, "setup");
        true
    }

    /// Release every chunk. Idempotent; legal only once no roots
    /// remain in use.
    pub fn teardown(&self) {
        if !self.setup.swap(false, Ordering::SeqCst) {
            return;
        }
        self.rings.with(|rings| {
            for target in [&mut rings.young, &mut rings.old] {
                while target.is_some() {
                    let chunk = unsafe { ring::pop(target) };
                    self.delete_chunk(chunk);
                }
            }
        });
        debug!(self.logger, "teardown");
    }

    /// Allocate a root tracking `init`. Returns `None` when the engine
    /// is not set up or the page allocator is out of memory.
    #[inline]
    pub fn create(&self, init: Value) -> Option<BitmapRoot> {
        stats::probe(&self.stats.total_create);
        if !self.setup.load(Ordering::Acquire) {
            if !self.warned_before_setup.swap(true, Ordering::Relaxed) {
                warn!(self.logger, "create called before setup");
            }
            return None;
        }
        let young = cfg!(feature = "generational");
        self.rings.with(|rings| {
            let chunk = self.available_chunk(rings, young)?;
            Some(BitmapRoot { slot: self.alloc_from_chunk(rings, chunk, init) })
        })
    }

    /// Read the payload currently kept alive by `root`.
    #[inline]
    pub fn get(&self, root: &BitmapRoot) -> Value {
        unsafe { root.slot.as_ref() }.payload()
    }

    /// A pointer to the cell holding the payload; invalidated by the
    /// next `modify` or `delete` of this root.
    #[inline]
    pub fn get_ref(&self, root: &BitmapRoot) -> NonNull<Value> {
        unsafe { root.slot.as_ref() }.payload_cell()
    }

    /// Release `root`.
    #[inline]
    pub fn delete(&self, root: BitmapRoot) {
        stats::probe(&self.stats.total_delete);
        let chunk = chunk_of_slot(root.slot);
        if self.remove_from_chunk(root.slot, chunk) {
            self.rings.with(|rings| {
                // Heuristic: a chunk parked at the head of its ring
                // stays put, keeping the hot path free of ring traffic.
                if rings.young != Some(chunk) && rings.old != Some(chunk) {
                    self.reclassify_chunk(rings, chunk);
                }
            });
        }
    }

    /// Change the payload kept alive by `root`.
    pub fn modify(&self, root: &mut BitmapRoot, new_value: Value) {
        stats::probe(&self.stats.total_modify);
        let slot = unsafe { root.slot.as_ref() };
        if !self.is_young(new_value) || self.is_young(slot.payload()) {
            slot.set_payload(new_value);
        } else {
            /*
             * An old slot takes a nursery payload: the root moves into
             * a young chunk so the next minor scan sees it. This
             * happens at most once between two minor collections,
             * because the young chunk keeps the root until the ring
             * migrates.
             */
            self.delete(BitmapRoot { slot: root.slot });
            *root = self
                .create(new_value)
                .expect("out of memory while moving a root to a young chunk");
        }
    }

    /// The callback the host invokes at every collection safepoint.
    pub fn scanning_callback(&self, action: ScanningAction<'_>, _only_young: bool) {
        if !self.setup.load(Ordering::Acquire) {
            return;
        }
        let minor = self.runtime.in_minor_collection();
        stats::bump(if minor {
            &self.stats.minor_collections
        } else {
            &self.stats.major_collections
        });
        let start = Instant::now();
        self.rings.with(|rings| self.scan_roots(rings, action, minor));
        self.stats.record_scan_time(minor, start.elapsed());
    }

    /// Number of live roots, summed across every chunk.
    pub fn live_roots(&self) -> usize {
        self.rings.with(|rings| {
            ring::iter(rings.young)
                .chain(ring::iter(rings.old))
                .map(|c| {
                    let free = unsafe { c.as_ref() }.free.load(Ordering::Relaxed);
                    (!free).count_ones() as usize
                })
                .sum()
        })
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Write a statistics report to stdout.
    pub fn print_stats(&self) {
        println!("bitmap engine:");
        println!(
            "CHUNK_SLOTS: {} ({} B/chunk, generational: {})",
            CHUNK_SLOTS,
            mem::size_of::<Chunk>(),
            cfg!(feature = "generational"),
        );
        self.stats.print();
    }

    #[inline]
    fn is_young(&self, v: Value) -> bool {
        stats::probe(&self.stats.young_checks);
        self.runtime.is_young(v)
    }

    // Allocation.

    /// A chunk with at least one free slot on the requested ring: the
    /// ring head if it qualifies, a repurposed old chunk, or a fresh
    /// one.
    fn available_chunk(&self, rings: &mut ChunkRings, young: bool) -> Option<NonNull<Chunk>> {
        let head = if young { rings.young } else { rings.old };
        if let Some(chunk) = head {
            if !chunk_is_full(chunk) {
                return Some(chunk);
            }
        }
        let old_available = rings.old.filter(|&c| !chunk_is_full(c)).is_some();
        let chunk = if young && old_available {
            // Demote an old chunk instead of growing.
            stats::bump(&self.stats.ring_operations);
            unsafe { ring::pop(&mut rings.old) }
        } else {
            self.create_chunk()?
        };
        unsafe { chunk.as_ref() }.is_young.set(young);
        let target = if young { &mut rings.young } else { &mut rings.old };
        unsafe { ring::push_front(chunk, target) };
        stats::bump(&self.stats.ring_operations);
        debug_assert!(!chunk_is_full(chunk));
        Some(chunk)
    }

    /// Claim the lowest free slot of `chunk` and store `init` in it.
    /// A chunk that just filled is reclassified out of the allocation
    /// path.
    fn alloc_from_chunk(
        &self,
        rings: &mut ChunkRings,
        chunk: NonNull<Chunk>,
        init: Value,
    ) -> NonNull<Slot> {
        let c = unsafe { chunk.as_ref() };
        let free = c.free.load(Ordering::Relaxed);
        debug_assert_ne!(free, 0);
        let index = free.trailing_zeros() as usize;
        let slot = &c.slots[index];
        slot.set_payload(init);
        let mask = 1u64 << index;
        let old = c.free.fetch_xor(mask, Ordering::Relaxed);
        debug_assert_ne!(old & mask, 0);
        if old ^ mask == 0 {
            self.reclassify_chunk(rings, chunk);
        }
        NonNull::from(slot)
    }

    /// Clear the slot's bit. Returns whether the chunk crossed a
    /// full/not-full or not-empty/empty boundary and is therefore a
    /// candidate for reclassification.
    fn remove_from_chunk(&self, slot: NonNull<Slot>, chunk: NonNull<Chunk>) -> bool {
        let c = unsafe { chunk.as_ref() };
        let index = (slot.as_ptr() as usize & CHUNK_MASK) / mem::size_of::<Slot>();
        debug_assert!(index < CHUNK_SLOTS);
        let mask = 1u64 << index;
        debug_assert_eq!(c.free.load(Ordering::Relaxed) & mask, 0);
        let old = c.free.fetch_xor(mask, Ordering::Relaxed);
        let was_full = old == 0;
        let is_empty = old ^ mask == BITMAP_EMPTY;
        was_full || is_empty
    }

    /// Re-rank `chunk` on its ring from its current occupancy: free
    /// chunks are released, full ones go to the back, the rest to the
    /// front.
    fn reclassify_chunk(&self, rings: &mut ChunkRings, chunk: NonNull<Chunk>) {
        let free = unsafe { chunk.as_ref() }.free.load(Ordering::Relaxed);
        let rest = unsafe { ring::remove(chunk) };
        stats::bump(&self.stats.ring_operations);
        if rings.young == Some(chunk) {
            rings.young = rest;
        }
        if rings.old == Some(chunk) {
            rings.old = rest;
        }
        if free == BITMAP_EMPTY {
            self.delete_chunk(chunk);
            return;
        }
        let target = if unsafe { chunk.as_ref() }.is_young.get() {
            &mut rings.young
        } else {
            &mut rings.old
        };
        unsafe {
            if free == 0 {
                ring::push_back(chunk, target);
            } else {
                ring::push_front(chunk, target);
            }
        }
        stats::bump(&self.stats.ring_operations);
    }

    #[cold]
    fn create_chunk(&self) -> Option<NonNull<Chunk>> {
        let chunk: NonNull<Chunk> = self.runtime.alloc_pool(chunk_layout())?.cast();
        debug_assert_eq!(chunk.as_ptr() as usize & CHUNK_MASK, 0);
        unsafe {
            let raw = chunk.as_ptr();
            ptr::write_bytes(ptr::addr_of_mut!((*raw).slots) as *mut usize, 0, CHUNK_SLOTS);
            ptr::addr_of_mut!((*raw).links).write(Links::dangling());
            ptr::addr_of_mut!((*raw).is_young).write(Cell::new(false));
            ptr::addr_of_mut!((*raw).free).write(AtomicU64::new(BITMAP_EMPTY));
            ring::link_self(chunk);
        }
        self.stats.note_pool_alloc();
        debug!(self.logger, "allocated chunk";
            "live_chunks" => self.stats.live_pools.load(Ordering::Relaxed));
        Some(chunk)
    }

    fn delete_chunk(&self, chunk: NonNull<Chunk>) {
        trace!(self.logger, "releasing chunk");
        unsafe { self.runtime.free_pool(chunk.cast(), chunk_layout()) };
        self.stats.note_pool_free();
    }

    // Scanning.

    fn scan_roots(&self, rings: &mut ChunkRings, action: ScanningAction<'_>, minor: bool) {
        if cfg!(debug_assertions) {
            self.validate(rings);
        }
        if minor && cfg!(feature = "generational") {
            let work = self.scan_ring_young(rings.young, &mut *action);
            // Survivors are mature now: the whole young ring ages at
            // once and nursery allocation starts over.
            if let Some(head) = rings.young.take() {
                for chunk in ring::iter(Some(head)) {
                    unsafe { chunk.as_ref() }.is_young.set(false);
                }
                unsafe { ring::push_back(head, &mut rings.old) };
                stats::bump(&self.stats.ring_operations);
            }
            stats::add(&self.stats.total_scanning_work_minor, work);
        } else {
            let work = self.scan_ring(rings.young, &mut *action)
                + self.scan_ring(rings.old, &mut *action);
            stats::add(&self.stats.total_scanning_work_major, work);
        }
        if cfg!(debug_assertions) {
            self.validate(rings);
        }
    }

    /// Forward every full slot of every chunk on `ring`.
    fn scan_ring(&self, ring: Ring<Chunk>, action: ScanningAction<'_>) -> u64 {
        let mut work = 0;
        for chunk in ring::iter(ring) {
            let c = unsafe { chunk.as_ref() };
            let allocated = !c.free.load(Ordering::Acquire);
            for index in 0..CHUNK_SLOTS {
                if allocated & (1u64 << index) != 0 {
                    let cell = unsafe { &mut *c.slots[index].payload_cell().as_ptr() };
                    let current = *cell;
                    action(current, cell);
                    work += 1;
                }
            }
        }
        work
    }

    /// Forward the full slots of `ring` that hold nursery pointers,
    /// filtered with one unsigned compare against the nursery range.
    fn scan_ring_young(&self, ring: Ring<Chunk>, action: ScanningAction<'_>) -> u64 {
        let range = self.runtime.young_range();
        let young_start = range.start;
        let young_len = range.end.wrapping_sub(range.start);
        let mut work = 0;
        for chunk in ring::iter(ring) {
            let c = unsafe { chunk.as_ref() };
            let allocated = !c.free.load(Ordering::Acquire);
            for index in 0..CHUNK_SLOTS {
                if allocated & (1u64 << index) != 0 {
                    let cell = unsafe { &mut *c.slots[index].payload_cell().as_ptr() };
                    let current = *cell;
                    if current.to_bits().wrapping_sub(young_start) < young_len
                        && current.is_block()
                    {
                        action(current, cell);
                        work += 1;
                    }
                }
            }
        }
        work
    }

    // Validation, debug builds only. Statistics are snapshotted around
    // the pass so the probe bumps do not perturb them.

    fn validate(&self, rings: &ChunkRings) {
        let saved = self.stats.snapshot();
        for chunk in ring::iter(rings.young) {
            assert!(unsafe { chunk.as_ref() }.is_young.get());
        }
        for chunk in ring::iter(rings.old) {
            let c = unsafe { chunk.as_ref() };
            assert!(!c.is_young.get());
            if cfg!(feature = "generational") {
                // Old chunks only receive payloads through the young
                // ring migration, after the nursery was evacuated.
                let allocated = !c.free.load(Ordering::Relaxed);
                for index in 0..CHUNK_SLOTS {
                    if allocated & (1u64 << index) != 0 {
                        assert!(!self.runtime.is_young(c.slots[index].payload()));
                    }
                }
            }
        }
        self.stats.restore(&saved);
    }
}

impl<R: GcRuntime> Drop for BitmapEngine<R> {
    fn drop(&mut self) {
        self.teardown();
    }
}
