//! Lease-based leader election over an external lock
//!
//! - `lock`: the lease record, the `DistributedLock` contract and two
//!   backends (in-process and shared-file)
//! - `elector`: the acquire/renew state machine

pub mod elector;
pub mod lock;

pub use elector::{
    validate_timing, ElectionState, LeaderCallbacks, LeaderElectionConfig, LeaderElector,
};
pub use lock::{
    DistributedLock, FileLock, LeaseRecord, LockBackend, MemoryLock, MemoryLockStore,
};
