//! Rooted references into a moving, generational heap.
//!
//! A foreign caller with manual resource discipline sometimes needs to
//! hold a managed-heap pointer across arbitrary native work, including
//! allocations that can trigger a collection. A plain pointer dies the
//! moment the collector moves its target. This crate hands out *roots*
//! instead: small engine-owned cells whose address the caller keeps,
//! whose contents the collector is told about and rewrites in place
//! when blocks move.
//!
//! The contract, per root:
//!
//! - `create(v)` allocates a root tracking `v` (or returns `None` when
//!   the backing store cannot grow),
//! - `get`/`get_ref` read the tracked payload, freshly forwarded after
//!   any collection,
//! - `modify(&mut root, v)` retargets the root and never fails,
//! - `delete(root)` releases it.
//!
//! Three engines realize this contract, trading structure for speed:
//!
//! - [`pool::PoolEngine`]: aligned pools of slots with per-pool
//!   major/minor free lists. Roots holding nursery pointers are also
//!   registered in the host's remembered set, so minor collections
//!   cost this engine *nothing*: the collector forwards those slots
//!   during its own remembered-set traversal. The primary engine.
//! - [`bitmap::BitmapEngine`]: 64-slot chunks with an atomic free
//!   bitmap, young/old chunk rings and a range-check minor scan.
//! - [`linked::LinkedEngine`]: one heap cell per root on young/old/
//!   free rings. The slow, obviously-correct baseline.
//!
//! The host runtime is not part of this crate. It is consumed through
//! [`runtime::GcRuntime`] (generation test, remembered set, minor
//! query, page allocator) and it must invoke each engine's
//! `scanning_callback` at every collection safepoint. The engines
//! guarantee a consistent view in return: handle operations take the
//! engine lock only around pool structure, and collections are
//! stop-the-world from the mutator's perspective.
//!
//! Concurrent operations on distinct roots are safe with the default
//! `sync` feature; operations on the *same* root must be externally
//! synchronized, as with any owned resource.

pub mod value;
pub mod runtime;
pub mod stats;

mod lock;
mod ring;

pub mod bitmap;
pub mod linked;
pub mod pool;

pub use crate::bitmap::{BitmapEngine, BitmapRoot};
pub use crate::linked::{LinkedEngine, LinkedRoot};
pub use crate::pool::{PoolEngine, PoolRoot, POOL_CAPACITY, POOL_LOG_SIZE, POOL_SIZE};
pub use crate::runtime::{GcRuntime, ScanningAction};
pub use crate::value::Value;
