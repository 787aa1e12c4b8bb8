//! # AgentShm Core
//!
//! Cross-process shared memory pool for a multi-process security agent.
//!
//! Several cooperating processes attach to named pools by logical name and
//! allocate variable-size blocks inside them. Blocks are addressed by offset,
//! so structures stored in a pool are valid in every attached process even
//! though each maps the segment at a different address.
//!
//! - **Memory**: pool allocator, offset lists, platform segment and lock layer
//! - **Config**: pool limits and the agent's region table
//! - **Recovery**: cleanup after a crashed agent instance
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use agentshm_core::SharedPool;
//!
//! let pool = SharedPool::create("cache_1", 64 * 1024)?;
//! let entry = pool.alloc(128)?;
//! pool.write(entry, 0, b"cached")?;
//! pool.set_user_root(Some(entry))?;
//! # Ok::<(), agentshm_core::ShmError>(())
//! ```

pub mod config;
pub mod error;
pub mod memory;

// Re-export commonly used types for easy access
pub use config::{AgentShmConfig, PoolConfig, RegionConfig};
pub use error::{ShmError, ShmErrorKind, ShmResult};
pub use memory::{recover_orphans, OrphanStatus, PoolStats, SharedPool, ShmPtr, ShutdownOutcome};
