//! The linked-element engine: one heap cell per root.
//!
//! The correctness baseline. Every root is its own allocation carrying
//! ring links, threaded onto one of three rings: young (payload was a
//! nursery pointer when tracked), old, or the free-element cache.
//! There is no pooling and no locality, which is exactly why the other
//! two engines exist; this one is kept because it is small enough to
//! trust and convenient to compare against.
//!
//! Minor scans visit the young ring and then splice it onto the old
//! ring, since the nursery has been evacuated. Major scans visit both
//! rings and drain the free cache back to the allocator.

use std::alloc::{self, Layout};
use std::cell::UnsafeCell;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use slog::{debug, o, warn, Logger};

use crate::lock::Lock;
use crate::ring::{self, Links, Node, Ring};
use crate::runtime::{GcRuntime, ScanningAction};
use crate::stats::{self, Stats};
use crate::value::Value;

struct Elem {
    slot: UnsafeCell<usize>,
    links: Links<Elem>,
}

unsafe impl Node for Elem {
    fn links(&self) -> &Links<Elem> {
        &self.links
    }
}

impl Elem {
    #[inline]
    fn payload(&self) -> Value {
        Value::from_bits(unsafe { *self.slot.get() })
    }

    #[inline]
    fn set_payload(&self, v: Value) {
        unsafe { *self.slot.get() = v.to_bits() }
    }

    #[inline]
    fn payload_cell(&self) -> NonNull<Value> {
        unsafe { NonNull::new_unchecked(self.slot.get() as *mut Value) }
    }
}

/// Ring state shared under the engine lock.
struct ElemRings {
    young: Ring<Elem>,
    old: Ring<Elem>,
    /// Released elements kept for reuse until the next major scan.
    free: Ring<Elem>,
}

unsafe impl Send for ElemRings {}

/// A rooted reference handed out by [`LinkedEngine::create`].
///
/// Not cloneable; returned through [`LinkedEngine::delete`].
/// [`LinkedEngine::modify`] may rewrite the handle variable when an
/// old root takes a nursery payload; callers must not cache the cell
/// address across modifies. The rewrite happens at most once between
/// two minor collections.
#[derive(Debug)]
pub struct LinkedRoot {
    elem: NonNull<Elem>,
}

unsafe impl Send for LinkedRoot {}
unsafe impl Sync for LinkedRoot {}

/// The doubly-linked-element engine.
pub struct LinkedEngine<R: GcRuntime> {
    runtime: R,
    logger: Logger,
    rings: Lock<ElemRings>,
    stats: Stats,
    setup: AtomicBool,
    warned_before_setup: AtomicBool,
}

impl<R: GcRuntime> LinkedEngine<R> {
    pub fn new(runtime: R, logger: Logger) -> LinkedEngine<R> {
        LinkedEngine {
            runtime,
            logger: logger.new(o!("engine" => "linked")),
            rings: Lock::new(ElemRings { young: None, old: None, free: None }),
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

    /// Release every element. Idempotent; legal only once no roots
    /// remain in use.
    pub fn teardown(&self) {
        if !self.setup.swap(false, Ordering::SeqCst) {
            return;
        }
        self.rings.with(|rings| {
            for target in [&mut rings.young, &mut rings.old, &mut rings.free] {
                while target.is_some() {
                    let elem = unsafe { ring::pop(target) };
                    free_elem(elem);
                }
            }
        });
        debug!(self.logger, "teardown");
    }

    /// Allocate a root tracking `init`. Returns `None` when the engine
    /// is not set up or the allocator is out of memory.
    #[inline]
    pub fn create(&self, init: Value) -> Option<LinkedRoot> {
        stats::probe(&self.stats.total_create);
        if !self.setup.load(Ordering::Acquire) {
            if !self.warned_before_setup.swap(true, Ordering::Relaxed) {
                warn!(self.logger, "create called before setup");
            }
            return None;
        }
        let for_young = self.is_young(init);
        self.rings.with(|rings| {
            let elem = self.create_elem(rings)?;
            unsafe { elem.as_ref() }.set_payload(init);
            self.track_elem(rings, elem, for_young);
            Some(LinkedRoot { elem })
        })
    }

    /// Read the payload currently kept alive by `root`.
    #[inline]
    pub fn get(&self, root: &LinkedRoot) -> Value {
        unsafe { root.elem.as_ref() }.payload()
    }

    /// A pointer to the cell holding the payload; invalidated by the
    /// next `modify` or `delete` of this root.
    #[inline]
    pub fn get_ref(&self, root: &LinkedRoot) -> NonNull<Value> {
        unsafe { root.elem.as_ref() }.payload_cell()
    }

    /// Release `root`.
    #[inline]
    pub fn delete(&self, root: LinkedRoot) {
        stats::probe(&self.stats.total_delete);
        self.rings.with(|rings| unsafe {
            self.detach(rings, root.elem);
            root.elem.as_ref().set_payload(Value::from_bits(0));
            ring::push_back(root.elem, &mut rings.free);
            stats::bump(&self.stats.ring_operations);
        });
    }

    /// Change the payload kept alive by `root`.
    pub fn modify(&self, root: &mut LinkedRoot, new_value: Value) {
        stats::probe(&self.stats.total_modify);
        let elem = root.elem;
        let old_value = unsafe { elem.as_ref() }.payload();
        if self.is_young(old_value) || !self.is_young(new_value) {
            unsafe { elem.as_ref() }.set_payload(new_value);
        } else {
            // Old to young: re-ring the element so the next minor scan
            // sees it, and store it back through the handle variable.
            self.rings.with(|rings| {
                unsafe { self.detach(rings, elem) };
                unsafe { elem.as_ref() }.set_payload(new_value);
                self.track_elem(rings, elem, true);
            });
            root.elem = elem;
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

    /// Number of live roots.
    pub fn live_roots(&self) -> usize {
        self.rings.with(|rings| {
            ring::iter(rings.young).count() + ring::iter(rings.old).count()
        })
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Write a statistics report to stdout.
    pub fn print_stats(&self) {
        println!("linked engine:");
        self.stats.print();
    }

    #[inline]
    fn is_young(&self, v: Value) -> bool {
        stats::probe(&self.stats.young_checks);
        self.runtime.is_young(v)
    }

    /// Pop a cached element or allocate a fresh one.
    fn create_elem(&self, rings: &mut ElemRings) -> Option<NonNull<Elem>> {
        if rings.free.is_some() {
            stats::bump(&self.stats.ring_operations);
            return Some(unsafe { ring::pop(&mut rings.free) });
        }
        let elem: NonNull<Elem> =
            NonNull::new(unsafe { alloc::alloc(Layout::new::<Elem>()) })?.cast();
        unsafe {
            let raw = elem.as_ptr();
            ptr::addr_of_mut!((*raw).slot).write(UnsafeCell::new(0));
            ptr::addr_of_mut!((*raw).links).write(Links::dangling());
            ring::link_self(elem);
        }
        Some(elem)
    }

    fn track_elem(&self, rings: &mut ElemRings, elem: NonNull<Elem>, young: bool) {
        let target = if young { &mut rings.young } else { &mut rings.old };
        unsafe { ring::push_back(elem, target) };
        stats::bump(&self.stats.ring_operations);
    }

    /// Unlink `elem` from the young or old ring, fixing up whichever
    /// head named it.
    unsafe fn detach(&self, rings: &mut ElemRings, elem: NonNull<Elem>) {
        let rest = ring::remove(elem);
        stats::bump(&self.stats.ring_operations);
        if rings.young == Some(elem) {
            rings.young = rest;
        }
        if rings.old == Some(elem) {
            rings.old = rest;
        }
    }

    // Scanning.

    fn scan_roots(&self, rings: &mut ElemRings, action: ScanningAction<'_>, minor: bool) {
        if cfg!(debug_assertions) {
            self.validate(rings);
        }
        let mut work = self.scan_ring(rings.young, &mut *action);
        if minor {
            // Survivors age wholesale; the young ring empties.
            if let Some(head) = rings.young.take() {
                unsafe { ring::push_back(head, &mut rings.old) };
                stats::bump(&self.stats.ring_operations);
            }
            stats::add(&self.stats.total_scanning_work_minor, work);
        } else {
            work += self.scan_ring(rings.old, &mut *action);
            self.drain_free_elems(rings);
            stats::add(&self.stats.total_scanning_work_major, work);
        }
        if cfg!(debug_assertions) {
            self.validate(rings);
        }
    }

    fn scan_ring(&self, ring: Ring<Elem>, action: ScanningAction<'_>) -> u64 {
        let mut work = 0;
        for elem in ring::iter(ring) {
            let cell = unsafe { &mut *elem.as_ref().payload_cell().as_ptr() };
            let current = *cell;
            action(current, cell);
            work += 1;
        }
        work
    }

    fn drain_free_elems(&self, rings: &mut ElemRings) {
        while rings.free.is_some() {
            let elem = unsafe { ring::pop(&mut rings.free) };
            free_elem(elem);
        }
    }

    // Validation, debug builds only.

    fn validate(&self, rings: &ElemRings) {
        let saved = self.stats.snapshot();
        // The young ring may hold anything, including values that have
        // since been promoted; nothing to check there.
        for elem in ring::iter(rings.old) {
            assert!(!self.runtime.is_young(unsafe { elem.as_ref() }.payload()));
        }
        for elem in ring::iter(rings.free) {
            assert_eq!(unsafe { elem.as_ref() }.payload().to_bits(), 0);
        }
        self.stats.restore(&saved);
    }
}

fn free_elem(elem: NonNull<Elem>) {
    unsafe { alloc::dealloc(elem.as_ptr() as *mut u8, Layout::new::<Elem>()) };
}

impl<R: GcRuntime> Drop for LinkedEngine<R> {
    fn drop(&mut self) {
        self.teardown();
    }
}
