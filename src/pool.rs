//! The pool engine: rooted references backed by aligned pools of slot
//! cells, with a per-pool pair of free lists that piggybacks on the
//! host's remembered set.
//!
//! Roots are allocated out of fixed-size pools, which amortizes calls
//! into the page allocator and keeps scanning memory-local. Pools are
//! allocated at their own size's alignment, so the owning pool of any
//! slot is one mask away; this is what makes `delete` O(1).
//!
//! Each slot is either *full* (it holds a payload verbatim) or *free*
//! (it holds a link to the next free slot, with the low bit set so the
//! link passes the runtime's immediate test if a stray scan ever reads
//! it). A link's high bits always equal the owning pool's base address,
//! which is how the two states are told apart: a pointer into the pool
//! itself is never a valid payload. The empty free list is denoted by
//! the pool's own base address, since null could be a payload.
//!
//! Free slots form two disjoint lists per pool:
//!
//! - the *major* list, whose slots carry no obligations;
//! - the *minor* list, whose slots are already present in the host's
//!   remembered set for the current minor epoch.
//!
//! Every full slot holding a nursery payload is registered in the
//! remembered set, so the collector's own remembered-set traversal
//! forwards it during minor collections. The scan callback therefore
//! does *no slot work at all* on minor collections: it only splices
//! each pool's minor free list onto its major one (the set was just
//! cleared, so those slots carry no obligations any more). Real
//! scanning happens on major collections only.

use std::alloc::Layout;
use std::cell::{Cell, UnsafeCell};
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use slog::{debug, o, trace, warn, Logger};

use crate::lock::Lock;
use crate::ring::{self, Links, Node, Ring};
use crate::runtime::{GcRuntime, ScanningAction};
use crate::stats::{self, Stats};
use crate::value::Value;

/// Log2 of the pool size in bytes.
pub const POOL_LOG_SIZE: u32 = 14;
/// Pool size in bytes. Pools are allocated at this alignment.
pub const POOL_SIZE: usize = 1 << POOL_LOG_SIZE;
/// Number of root slots in one pool.
pub const POOL_CAPACITY: usize = (POOL_SIZE - mem::size_of::<Header>()) / mem::size_of::<Slot>();

const _: () = assert!(POOL_SIZE.is_power_of_two());
const _: () = assert!(mem::size_of::<Pool>() == POOL_SIZE, "bad pool size");

/// One cell of pool storage: either a payload (full) or a free-list
/// link (free). See the module docs for how the two are distinguished.
#[repr(transparent)]
pub(crate) struct Slot(UnsafeCell<usize>);

impl Slot {
    #[inline]
    fn raw(&self) -> usize {
        unsafe { *self.0.get() }
    }

    #[inline]
    fn set_raw(&self, raw: usize) {
        unsafe { *self.0.get() = raw }
    }

    #[inline]
    fn payload(&self) -> Value {
        Value::from_bits(self.raw())
    }

    #[inline]
    fn set_payload(&self, v: Value) {
        self.set_raw(v.to_bits())
    }

    /// The cell as a location the collector can rewrite.
    #[inline]
    fn payload_cell(&self) -> NonNull<Value> {
        // Value is a transparent wrapper around the raw word.
        unsafe { NonNull::new_unchecked(self.0.get() as *mut Value) }
    }
}

#[repr(C)]
struct Header {
    links: Links<Pool>,
    /// Head of the major free list, or the pool base when empty.
    major_free: Cell<NonNull<Slot>>,
    /// Head of the minor free list, or the pool base when empty.
    minor_free: Cell<NonNull<Slot>>,
    /// Last slot of the minor free list; meaningful whenever that list
    /// is non-empty. Lets the minor scan splice in O(1).
    minor_tail: Cell<Option<NonNull<Slot>>>,
    alloc_count: Cell<usize>,
}

#[repr(C)]
pub(crate) struct Pool {
    hd: Header,
    roots: [Slot; POOL_CAPACITY],
}

unsafe impl Node for Pool {
    fn links(&self) -> &Links<Pool> {
        &self.hd.links
    }
}

impl Pool {
    #[inline]
    fn is_full(&self) -> bool {
        self.hd.alloc_count.get() == POOL_CAPACITY
    }

    #[inline]
    fn is_empty(&self) -> bool {
        self.hd.alloc_count.get() == 0
    }
}

/// Deletes crossing this count downward put the pool back on the
/// available ring.
const DEALLOC_THRESHOLD: usize = POOL_CAPACITY * 3 / 4;

#[inline]
fn pool_layout() -> Layout {
    // POOL_SIZE is a power of two.
    unsafe { Layout::from_size_align_unchecked(POOL_SIZE, POOL_SIZE) }
}

/// Recover the owning pool from a slot address.
#[inline]
fn pool_of_slot(slot: NonNull<Slot>) -> NonNull<Pool> {
    let base = slot.as_ptr() as usize & !(POOL_SIZE - 1);
    unsafe { NonNull::new_unchecked(base as *mut Pool) }
}

/// Whether `raw` is a free-list link belonging to `pool`: tagged low
/// bit, and high bits equal to the pool base.
#[inline]
fn is_free_raw(raw: usize, pool: NonNull<Pool>) -> bool {
    (pool.as_ptr() as usize | 1) == (raw & !(POOL_SIZE - 2))
}

/// The sentinel for an empty free list of `pool`: the pool base itself,
/// which is never a valid slot address (and never null).
#[inline]
fn empty_free_list(pool: NonNull<Pool>) -> NonNull<Slot> {
    pool.cast()
}

#[inline]
fn is_empty_list(head: NonNull<Slot>, pool: NonNull<Pool>) -> bool {
    head.cast::<Pool>() == pool
}

#[inline]
fn tag_free(slot: NonNull<Slot>) -> usize {
    slot.as_ptr() as usize | 1
}

#[inline]
unsafe fn untag_free(raw: usize) -> NonNull<Slot> {
    NonNull::new_unchecked(((raw | 1) - 1) as *mut Slot)
}

#[inline]
unsafe fn free_list_push(slot: NonNull<Slot>, head: &Cell<NonNull<Slot>>) {
    slot.as_ref().set_raw(tag_free(head.get()));
    head.set(slot);
}

#[inline]
unsafe fn free_list_pop(head: &Cell<NonNull<Slot>>) -> NonNull<Slot> {
    let slot = head.get();
    debug_assert!(!is_empty_list(slot, pool_of_slot(slot)));
    debug_assert!(is_free_raw(slot.as_ref().raw(), pool_of_slot(slot)));
    head.set(untag_free(slot.as_ref().raw()));
    slot
}

/// Ring state shared under the engine lock.
struct PoolRings {
    /// Pools believed to have free capacity; the front is the
    /// allocation target.
    pools: Ring<Pool>,
    /// Pools the allocation slow path found full.
    full_pools: Ring<Pool>,
}

// The raw pool pointers are only dereferenced while holding the engine
// lock, or through a handle whose slot no ring operation touches.
unsafe impl Send for PoolRings {}

/// A rooted reference handed out by [`PoolEngine::create`].
///
/// The handle is an owner-maintained capability: it cannot be cloned
/// and must be returned through [`PoolEngine::delete`]. Internally it
/// is the address of the slot cell holding the payload; that address is
/// stable for the whole lifetime of the handle ([`PoolEngine::modify`]
/// rewrites the cell in place).
#[derive(Debug)]
pub struct PoolRoot {
    slot: NonNull<Slot>,
}

// A root is an address into engine-owned storage. Concurrent use of
// one root must be externally synchronized; moving it across threads
// is fine.
unsafe impl Send for PoolRoot {}
unsafe impl Sync for PoolRoot {}

/// The pool-with-remembered-set engine.
pub struct PoolEngine<R: GcRuntime> {
    runtime: R,
    logger: Logger,
    rings: Lock<PoolRings>,
    stats: Stats,
    setup: AtomicBool,
    warned_before_setup: AtomicBool,
}

impl<R: GcRuntime> PoolEngine<R> {
    pub fn new(runtime: R, logger: Logger) -> PoolEngine<R> {
        PoolEngine {
            runtime,
            logger: logger.new(o!("engine" => "pool")),
            rings: Lock::new(PoolRings { pools: None, full_pools: None }),
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

    /// Release every pool. Idempotent. Only legal once the runtime is
    /// shutting down and no roots remain in use.
    pub fn teardown(&self) {
        if !self.setup.swap(false, Ordering::SeqCst) {
            return;
        }
        self.rings.with(|rings| {
            // No roots in use means no pool can sit above the
            // three-quarters threshold that keeps it on the full ring.
            debug_assert!(rings.full_pools.is_none());
            for target in [&mut rings.pools, &mut rings.full_pools] {
                while target.is_some() {
                    let p = unsafe { ring::pop(target) };
                    stats::bump(&self.stats.ring_operations);
                    self.release_pool(p);
                }
            }
        });
        debug!(self.logger, "teardown");
    }

    /// Allocate a root tracking `init`.
    ///
    /// Returns `None` when the engine is not set up or the page
    /// allocator is out of memory; this is the only failure surface in
    /// the API.
    #[inline]
    pub fn create(&self, init: Value) -> Option<PoolRoot> {
        stats::probe(&self.stats.total_create);
        let for_young = self.is_young(init);
        let slot = self.rings.with(|rings| self.alloc_slot(rings, for_young))?;
        // No lock for the payload write: the slot is ours alone until
        // the handle escapes.
        unsafe { slot.as_ref() }.set_payload(init);
        Some(PoolRoot { slot })
    }

    /// Read the payload currently kept alive by `root`.
    #[inline]
    pub fn get(&self, root: &PoolRoot) -> Value {
        unsafe { root.slot.as_ref() }.payload()
    }

    /// A pointer to the cell holding the payload. The collector
    /// rewrites the cell in place when the target block moves; the
    /// pointer is invalidated by the next `modify` or `delete` of this
    /// root.
    #[inline]
    pub fn get_ref(&self, root: &PoolRoot) -> NonNull<Value> {
        unsafe { root.slot.as_ref() }.payload_cell()
    }

    /// Release `root`. Its payload is no longer kept alive.
    #[inline]
    pub fn delete(&self, root: PoolRoot) {
        stats::probe(&self.stats.total_delete);
        self.rings.with(|rings| unsafe { self.dealloc_slot(rings, root.slot) });
    }

    /// Change the payload kept alive by `root`.
    ///
    /// Never fails, never reallocates: the slot address is stable
    /// across any sequence of modifies.
    #[inline]
    pub fn modify(&self, root: &mut PoolRoot, new_value: Value) {
        stats::probe(&self.stats.total_modify);
        let slot = unsafe { root.slot.as_ref() };
        // No lock here: the pool structure is untouched.
        if !self.is_young(new_value) {
            slot.set_payload(new_value);
        } else {
            let old_value = slot.payload();
            slot.set_payload(new_value);
            // A young payload over a young payload is already in the
            // remembered set for this epoch.
            if !self.is_young(old_value) {
                self.remember(root.slot);
            }
        }
    }

    /// The callback the host invokes at every collection safepoint.
    ///
    /// The host passes its own notion of `only_young`; the engine asks
    /// the runtime directly which kind of collection is running.
    pub fn scanning_callback(&self, action: ScanningAction<'_>, _only_young: bool) {
        self.rings.with(|rings| {
            if !self.setup.load(Ordering::Acquire) {
                return;
            }
            let minor = self.runtime.in_minor_collection();
            stats::bump(if minor {
                &self.stats.minor_collections
            } else {
                &self.stats.major_collections
            });
            if rings.pools.is_none() && rings.full_pools.is_none() {
                return;
            }
            let start = Instant::now();
            self.scan_roots(rings, action, minor);
            self.stats.record_scan_time(minor, start.elapsed());
        });
    }

    /// Number of live roots, summed across every pool.
    pub fn live_roots(&self) -> usize {
        self.rings.with(|rings| {
            ring::iter(rings.pools)
                .chain(ring::iter(rings.full_pools))
                .map(|p| unsafe { p.as_ref() }.hd.alloc_count.get())
                .sum()
        })
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Write a statistics report to stdout.
    pub fn print_stats(&self) {
        println!("pool engine:");
        println!(
            "POOL_LOG_SIZE: {} ({} KiB, {} roots/pool)",
            POOL_LOG_SIZE,
            POOL_SIZE / 1024,
            POOL_CAPACITY,
        );
        self.stats.print();
    }

    // Hot-path helpers. The probe counters they bump are free outside
    // debug builds.

    #[inline]
    fn is_young(&self, v: Value) -> bool {
        stats::probe(&self.stats.young_checks);
        self.runtime.is_young(v)
    }

    #[inline]
    fn owning_pool(&self, slot: NonNull<Slot>) -> NonNull<Pool> {
        stats::probe(&self.stats.header_recoveries);
        pool_of_slot(slot)
    }

    #[inline]
    fn is_free_slot(&self, raw: usize, pool: NonNull<Pool>) -> bool {
        stats::probe(&self.stats.free_slot_checks);
        is_free_raw(raw, pool)
    }

    #[inline]
    fn is_empty_free_list(&self, head: NonNull<Slot>, pool: NonNull<Pool>) -> bool {
        stats::probe(&self.stats.empty_list_checks);
        is_empty_list(head, pool)
    }

    #[inline]
    fn remember(&self, slot: NonNull<Slot>) {
        stats::probe(&self.stats.remembered);
        self.runtime.remember(unsafe { slot.as_ref() }.payload_cell());
    }

    // Allocation.

    /// Pop a slot from the front pool, falling back to the pool search
    /// when the front pool is missing or full.
    #[inline]
    fn alloc_slot(&self, rings: &mut PoolRings, for_young: bool) -> Option<NonNull<Slot>> {
        let p = match rings.pools {
            Some(p) if !unsafe { p.as_ref() }.is_full() => p,
            _ => {
                // Also lands here when the engine was never set up.
                if !self.setup.load(Ordering::Acquire) {
                    if !self.warned_before_setup.swap(true, Ordering::Relaxed) {
                        warn!(self.logger, "create called before setup");
                    }
                    return None;
                }
                self.find_available_pool(rings)?
            }
        };
        let hd = unsafe { &p.as_ref().hd };
        hd.alloc_count.set(hd.alloc_count.get() + 1);
        let slot = if for_young {
            if !self.is_empty_free_list(hd.minor_free.get(), p) {
                // Already in the remembered set.
                unsafe { free_list_pop(&hd.minor_free) }
            } else {
                let slot = unsafe { free_list_pop(&hd.major_free) };
                self.remember(slot);
                slot
            }
        } else if !self.is_empty_free_list(hd.major_free.get(), p) {
            unsafe { free_list_pop(&hd.major_free) }
        } else {
            /*
             * Major slots ran out but minor ones are available: reuse a
             * minor slot, forgetting that it sits in the remembered
             * set. The stale entry is harmless and the next minor
             * collection discards it. We could search other pools for
             * a major slot instead, but the minor list is a pool-local
             * optimization and a fruitless search over every pool
             * costs more than one wasted remembered-set entry.
             */
            unsafe { free_list_pop(&hd.minor_free) }
        };
        Some(slot)
    }

    /// Find a non-full pool and move it to the front, pushing full
    /// pools onto the full ring on the way; allocates a fresh pool when
    /// none is available.
    #[cold]
    #[inline(never)]
    fn find_available_pool(&self, rings: &mut PoolRings) -> Option<NonNull<Pool>> {
        stats::probe(&self.stats.pool_searches);
        while let Some(head) = rings.pools {
            if !unsafe { head.as_ref() }.is_full() {
                break;
            }
            stats::probe(&self.stats.pool_search_work);
            unsafe {
                let full = ring::pop(&mut rings.pools);
                ring::push_back(full, &mut rings.full_pools);
            }
            stats::add(&self.stats.ring_operations, 2);
        }
        if rings.pools.is_none() {
            rings.pools = Some(self.alloc_pool()?);
            stats::bump(&self.stats.ring_operations);
        }
        let head = rings.pools?;
        debug_assert!(!unsafe { head.as_ref() }.is_full());
        Some(head)
    }

    /// Allocate and initialize one pool, every slot on its major free
    /// list.
    #[cold]
    fn alloc_pool(&self) -> Option<NonNull<Pool>> {
        let p: NonNull<Pool> = self.runtime.alloc_pool(pool_layout())?.cast();
        debug_assert_eq!(p.as_ptr() as usize & (POOL_SIZE - 1), 0);
        unsafe {
            ptr::addr_of_mut!((*p.as_ptr()).hd).write(Header {
                links: Links::dangling(),
                major_free: Cell::new(empty_free_list(p)),
                minor_free: Cell::new(empty_free_list(p)),
                minor_tail: Cell::new(None),
                alloc_count: Cell::new(0),
            });
            ring::link_self(p);
            // Thread the slots onto the major free list, last slot
            // first, so the list runs in address order.
            let roots = ptr::addr_of!((*p.as_ptr()).roots) as *mut Slot;
            for index in (0..POOL_CAPACITY).rev() {
                let slot = NonNull::new_unchecked(roots.add(index));
                free_list_push(slot, &p.as_ref().hd.major_free);
            }
        }
        self.stats.note_pool_alloc();
        debug!(self.logger, "allocated pool";
            "live_pools" => self.stats.live_pools.load(Ordering::Relaxed));
        Some(p)
    }

    fn release_pool(&self, p: NonNull<Pool>) {
        trace!(self.logger, "releasing pool");
        unsafe { self.runtime.free_pool(p.cast(), pool_layout()) };
        self.stats.note_pool_free();
    }

    // Deallocation.

    unsafe fn dealloc_slot(&self, rings: &mut PoolRings, slot: NonNull<Slot>) {
        let p = self.owning_pool(slot);
        let hd = &p.as_ref().hd;
        if !self.is_young(slot.as_ref().payload()) {
            free_list_push(slot, &hd.major_free);
        } else {
            // The slot stays in the remembered set until the next
            // minor collection, so it goes on the minor list.
            if self.is_empty_free_list(hd.minor_free.get(), p) {
                hd.minor_tail.set(Some(slot));
            }
            free_list_push(slot, &hd.minor_free);
        }
        hd.alloc_count.set(hd.alloc_count.get() - 1);
        if hd.alloc_count.get() == DEALLOC_THRESHOLD {
            // The pool is on either ring at this point; make sure it
            // ends up back on the available one.
            let rest = ring::remove(p);
            if rings.pools == Some(p) {
                rings.pools = rest;
            }
            if rings.full_pools == Some(p) {
                rings.full_pools = rest;
            }
            ring::push_back(p, &mut rings.pools);
            stats::add(&self.stats.ring_operations, 2);
        }
    }

    // Scanning.

    fn scan_roots(&self, rings: &mut PoolRings, action: ScanningAction<'_>, minor: bool) {
        if cfg!(debug_assertions) {
            self.validate(rings);
        }
        for list in [rings.pools, rings.full_pools] {
            for p in ring::iter(list) {
                if minor {
                    self.scan_pool_minor(p);
                } else {
                    self.scan_pool_major(p, &mut *action);
                }
            }
        }
        if !minor {
            self.free_empty_pools(rings);
        }
        if cfg!(debug_assertions) {
            self.validate(rings);
        }
    }

    /// Minor collections do no slot work here: the collector's
    /// remembered-set traversal already forwarded every tracked nursery
    /// payload. The set was cleared in the process, so the minor free
    /// list loses its obligations and folds into the major one.
    fn scan_pool_minor(&self, p: NonNull<Pool>) {
        let hd = unsafe { &p.as_ref().hd };
        if is_empty_list(hd.minor_free.get(), p) {
            return;
        }
        let tail = hd.minor_tail.get().expect("minor free list without a tail");
        unsafe {
            debug_assert!(is_free_raw(hd.minor_free.get().as_ref().raw(), p));
            debug_assert!(is_empty_list(untag_free(tail.as_ref().raw()), p));
            tail.as_ref().set_raw(tag_free(hd.major_free.get()));
        }
        hd.major_free.set(hd.minor_free.get());
        hd.minor_free.set(empty_free_list(p));
        hd.minor_tail.set(None);
    }

    /// Walk the pool's slots in address order, forwarding every full
    /// one. The allocation count bounds the walk: once every full slot
    /// has been seen the rest of the pool is all free.
    fn scan_pool_major(&self, p: NonNull<Pool>, action: ScanningAction<'_>) {
        let pool = unsafe { p.as_ref() };
        let mut to_find = pool.hd.alloc_count.get();
        stats::add(&self.stats.useful_scanning_work, to_find as u64);
        for (visited, slot) in pool.roots.iter().enumerate() {
            if to_find == 0 {
                stats::add(&self.stats.total_scanning_work_major, visited as u64);
                return;
            }
            if !self.is_free_slot(slot.raw(), p) {
                // Young payloads were promoted before the major scan.
                debug_assert!(!self.runtime.is_young(slot.payload()));
                to_find -= 1;
                let cell = unsafe { &mut *slot.payload_cell().as_ptr() };
                let current = *cell;
                action(current, cell);
            }
        }
        debug_assert_eq!(to_find, 0);
        stats::add(&self.stats.total_scanning_work_major, POOL_CAPACITY as u64);
    }

    /// Release empty pools from the available ring, keeping one as a
    /// buffer against allocation stutter. The full ring holds no
    /// empties by construction.
    fn free_empty_pools(&self, rings: &mut PoolRings) {
        let head = match rings.pools {
            Some(head) => head,
            None => return,
        };
        let mut keep_empty = 1;
        let mut p = head;
        loop {
            let next = unsafe { p.as_ref() }.hd.links.next();
            if unsafe { p.as_ref() }.is_empty() {
                if keep_empty > 0 {
                    keep_empty -= 1;
                } else {
                    let rest = unsafe { ring::remove(p) };
                    stats::bump(&self.stats.ring_operations);
                    if rings.pools == Some(p) {
                        rings.pools = rest;
                    }
                    self.release_pool(p);
                }
            }
            if next == head {
                break;
            }
            p = next;
        }
    }

    // Validation, debug builds only. Iterating the free lists bumps
    // the probe counters, so the statistics are snapshotted around the
    // whole pass.

    fn validate(&self, rings: &PoolRings) {
        let saved = self.stats.snapshot();
        for p in ring::iter(rings.pools) {
            self.validate_pool(p);
        }
        for p in ring::iter(rings.full_pools) {
            self.validate_pool(p);
            assert!(unsafe { p.as_ref() }.hd.alloc_count.get() > DEALLOC_THRESHOLD);
        }
        self.stats.restore(&saved);
    }

    fn validate_pool(&self, p: NonNull<Pool>) {
        let pool = unsafe { p.as_ref() };
        let mut free_count = 0;
        for slot in pool.roots.iter() {
            if is_free_raw(slot.raw(), p) {
                free_count += 1;
            }
        }
        assert_eq!(pool.hd.alloc_count.get(), POOL_CAPACITY - free_count);
        let mut list_count = 0;
        for head in [&pool.hd.major_free, &pool.hd.minor_free] {
            let mut s = head.get();
            while !is_empty_list(s, p) {
                let raw = unsafe { s.as_ref() }.raw();
                assert!(Value::from_bits(raw).is_immediate());
                assert!(is_free_raw(raw, p));
                s = unsafe { untag_free(raw) };
                list_count += 1;
            }
        }
        assert_eq!(list_count, free_count);
        if !is_empty_list(pool.hd.minor_free.get(), p) {
            let tail = pool.hd.minor_tail.get().expect("minor free list without a tail");
            assert!(is_free_raw(unsafe { tail.as_ref() }.raw(), p));
        }
    }
}

impl<R: GcRuntime> Drop for PoolEngine<R> {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    // A synthetic pool base, aligned to POOL_SIZE. Never dereferenced.
    const BASE: usize = 0x40_0000;

    fn fake_slot(offset: usize) -> NonNull<Slot> {
        NonNull::new((BASE + offset) as *mut Slot).unwrap()
    }

    #[test]
    fn free_link_encoding_round_trip() {
        let pool = NonNull::new(BASE as *mut Pool).unwrap();
        let slot = fake_slot(mem::size_of::<Header>() + 24);
        let raw = tag_free(slot);
        assert!(Value::from_bits(raw).is_immediate());
        assert!(is_free_raw(raw, pool));
        assert_eq!(unsafe { untag_free(raw) }, slot);
    }

    #[test]
    fn payloads_are_not_free_links() {
        let pool = NonNull::new(BASE as *mut Pool).unwrap();
        // An immediate whose high bits do not match the pool base.
        assert!(!is_free_raw(Value::of_int(42).to_bits(), pool));
        // A block pointer outside the pool.
        assert!(!is_free_raw(0x8000_0000, pool));
        // A pointer into a different pool, tagged.
        assert!(!is_free_raw((BASE + 2 * POOL_SIZE + 8) | 1, pool));
    }

    #[test]
    fn empty_list_sentinel_is_the_pool_base() {
        let pool = NonNull::new(BASE as *mut Pool).unwrap();
        let sentinel = empty_free_list(pool);
        assert!(is_empty_list(sentinel, pool));
        assert!(!is_empty_list(fake_slot(mem::size_of::<Header>()), pool));
    }

    #[test]
    fn slot_masking_recovers_the_pool() {
        let pool = NonNull::new(BASE as *mut Pool).unwrap();
        assert_eq!(pool_of_slot(fake_slot(mem::size_of::<Header>())), pool);
        assert_eq!(pool_of_slot(fake_slot(POOL_SIZE - 8)), pool);
    }

    #[test]
    fn capacity_fills_the_pool_exactly() {
        assert_eq!(
            mem::size_of::<Header>() + POOL_CAPACITY * mem::size_of::<Slot>(),
            POOL_SIZE
        );
    }
}
