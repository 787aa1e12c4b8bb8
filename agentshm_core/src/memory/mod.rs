//! # Shared memory pool for AgentShm
//!
//! This module provides the cross-process allocator used by every agent process:
//!
//! - **SharedPool**: named pool handle with alloc, free, realloc and growth
//! - **SegmentLock**: process-shared lock that survives a dying holder
//! - **ShmRegion**: file-backed segment mapping that can be grown and remapped
//! - **recover_orphans**: removal of objects left behind by a crashed instance
//!
//! ## Layout
//!
//! The segment starts with a pool header followed by a chain of chunks. Links
//! inside the segment are offsets from its base (see [`offset`]), so every
//! process can map it at a different address.
//!
//! ## Memory Safety
//!
//! Shared state is only read through a bounds-checked [`layout::Arena`]; a
//! corrupted offset surfaces as [`crate::error::ShmError::Corrupted`].

pub mod freelist;
pub mod heap;
pub mod layout;
pub mod lock;
pub mod offset;
pub mod platform;
pub mod pool;
pub mod recovery;
pub mod shm_region;

pub use heap::{ChunkInfo, PoolStats};
pub use lock::{open_lock, LockState, SegmentLock};
pub use platform::*;
pub use pool::{SharedPool, ShmPtr, ShutdownOutcome};
pub use recovery::{recover_orphans, OrphanStatus, WELL_KNOWN_REGIONS};
pub use shm_region::{SharedSize, ShmRegion};
