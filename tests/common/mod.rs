//! A mock host runtime for exercising the engines.
//!
//! Blocks live at synthetic word-aligned addresses; their one-word
//! contents sit in a side table. That is all the engines ever see of a
//! heap, so nothing needs to be real memory. The mock drives
//! collections the way the host would: a minor collection walks its
//! remembered set first (forwarding nursery pointers in place), then
//! invokes the engine's scan callback, then evacuates the nursery; a
//! major collection moves every mature block and relies on the scan
//! callback to forward every live slot.

#![allow(dead_code)]

use std::collections::HashMap;
use std::ops::Range;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering::SeqCst};
use std::sync::{Arc, Mutex, MutexGuard};

use slog::{o, Logger};

use heaproot::{GcRuntime, ScanningAction, Value};

const YOUNG_BASE: usize = 0x1000_0000;
const YOUNG_BYTES: usize = 1 << 16;
const MATURE_BASE: usize = 0x2000_0000;
const WORD: usize = 8;

pub fn test_logger() -> Logger {
    Logger::root(slog::Discard, o!())
}

#[derive(Clone)]
pub struct MockHeap {
    state: Arc<HeapState>,
}

struct HeapState {
    young_next: AtomicUsize,
    mature_next: AtomicUsize,
    /// Contents of every live block, by address.
    objects: Mutex<HashMap<usize, usize>>,
    /// Addresses of engine cells registered as possibly holding
    /// nursery pointers.
    remembered: Mutex<Vec<usize>>,
    in_minor: AtomicBool,
}

pub struct MinorReport {
    /// Remembered-set entries walked by the collector.
    pub remembered_visits: usize,
    /// Times the engine's scan callback invoked the action.
    pub action_calls: usize,
}

pub struct MajorReport {
    pub action_calls: usize,
}

impl MockHeap {
    pub fn new() -> MockHeap {
        MockHeap {
            state: Arc::new(HeapState {
                young_next: AtomicUsize::new(0),
                mature_next: AtomicUsize::new(0),
                objects: Mutex::new(HashMap::new()),
                remembered: Mutex::new(Vec::new()),
                in_minor: AtomicBool::new(false),
            }),
        }
    }

    /// Allocate a block in the nursery.
    pub fn alloc_young(&self, content: usize) -> Value {
        let offset = self.state.young_next.fetch_add(WORD, SeqCst);
        assert!(offset + WORD <= YOUNG_BYTES, "mock nursery exhausted");
        let addr = YOUNG_BASE + offset;
        self.state.objects.lock().unwrap().insert(addr, content);
        Value::from_bits(addr)
    }

    /// Allocate a block directly in the mature space.
    pub fn alloc_mature(&self, content: usize) -> Value {
        let mut objects = self.state.objects.lock().unwrap();
        let addr = self.alloc_mature_raw(&mut objects, content);
        Value::from_bits(addr)
    }

    /// Read the contents of a live block.
    pub fn read_block(&self, v: Value) -> usize {
        assert!(v.is_block());
        *self
            .state
            .objects
            .lock()
            .unwrap()
            .get(&v.to_bits())
            .expect("reading a dead or unknown block")
    }

    pub fn is_mature(&self, v: Value) -> bool {
        v.is_block() && v.to_bits() >= MATURE_BASE
    }

    pub fn remembered_len(&self) -> usize {
        self.state.remembered.lock().unwrap().len()
    }

    /// Run a minor collection, invoking the engine's scan callback
    /// through `run_scan` the way the host runtime would.
    pub fn minor_collection(&self, run_scan: impl FnOnce(ScanningAction<'_>, bool)) -> MinorReport {
        self.state.in_minor.store(true, SeqCst);
        let mut forwards: HashMap<usize, usize> = HashMap::new();

        // The collector's own remembered-set traversal. Entries whose
        // cell no longer holds a nursery pointer are harmless garbage.
        let entries: Vec<usize> = self.state.remembered.lock().unwrap().drain(..).collect();
        let mut remembered_visits = 0;
        for cell_addr in entries {
            remembered_visits += 1;
            unsafe {
                let cell = cell_addr as *mut Value;
                let v = *cell;
                if self.value_is_young(v) {
                    *cell = Value::from_bits(self.promote(&mut forwards, v.to_bits()));
                }
            }
        }

        let mut action_calls = 0;
        {
            let mut action = |v: Value, cell: &mut Value| {
                action_calls += 1;
                if self.value_is_young(v) {
                    *cell = Value::from_bits(self.promote(&mut forwards, v.to_bits()));
                }
            };
            run_scan(&mut action, true);
        }

        // Evacuate the nursery: unpromoted blocks are dead.
        self.state
            .objects
            .lock()
            .unwrap()
            .retain(|&addr, _| !(YOUNG_BASE..YOUNG_BASE + YOUNG_BYTES).contains(&addr));
        self.state.young_next.store(0, SeqCst);
        self.state.in_minor.store(false, SeqCst);
        MinorReport { remembered_visits, action_calls }
    }

    /// Run a major collection: compact the mature space (every block
    /// moves) and have the engine forward every live slot. Any young
    /// payloads must have been promoted by a prior minor collection.
    pub fn major_collection(&self, run_scan: impl FnOnce(ScanningAction<'_>, bool)) -> MajorReport {
        let mut forwards: HashMap<usize, usize> = HashMap::new();
        {
            let mut objects = self.state.objects.lock().unwrap();
            let mature: Vec<(usize, usize)> = objects
                .iter()
                .filter(|&(&addr, _)| addr >= MATURE_BASE)
                .map(|(&addr, &content)| (addr, content))
                .collect();
            for (addr, content) in mature {
                objects.remove(&addr);
                let to = self.alloc_mature_raw(&mut objects, content);
                forwards.insert(addr, to);
            }
        }

        let mut action_calls = 0;
        {
            let mut action = |v: Value, cell: &mut Value| {
                action_calls += 1;
                if v.is_block() {
                    if let Some(&to) = forwards.get(&v.to_bits()) {
                        *cell = Value::from_bits(to);
                    }
                }
            };
            run_scan(&mut action, false);
        }
        MajorReport { action_calls }
    }

    fn alloc_mature_raw(&self, objects: &mut MutexGuard<'_, HashMap<usize, usize>>, content: usize) -> usize {
        let addr = MATURE_BASE + self.state.mature_next.fetch_add(WORD, SeqCst);
        objects.insert(addr, content);
        addr
    }

    fn value_is_young(&self, v: Value) -> bool {
        v.is_block() && (YOUNG_BASE..YOUNG_BASE + YOUNG_BYTES).contains(&v.to_bits())
    }

    /// Move one nursery block to the mature space, once per block per
    /// collection regardless of how many cells point at it.
    fn promote(&self, forwards: &mut HashMap<usize, usize>, addr: usize) -> usize {
        if let Some(&to) = forwards.get(&addr) {
            return to;
        }
        let mut objects = self.state.objects.lock().unwrap();
        let content = objects.remove(&addr).expect("promoting a dead or unknown block");
        let to = self.alloc_mature_raw(&mut objects, content);
        forwards.insert(addr, to);
        to
    }
}

impl GcRuntime for MockHeap {
    fn young_range(&self) -> Range<usize> {
        YOUNG_BASE..YOUNG_BASE + YOUNG_BYTES
    }

    fn remember(&self, slot: NonNull<Value>) {
        self.state.remembered.lock().unwrap().push(slot.as_ptr() as usize);
    }

    fn in_minor_collection(&self) -> bool {
        self.state.in_minor.load(SeqCst)
    }
}
