//! This module controls autoalloc (automatic allocation): two background processes that submit
//! Slurm jobs with ephemeral GitHub Actions runners for queued CI jobs and that track those Slurm
//! jobs until they finish.
//!
//! The term `allocation` represents a Slurm job in this module, to distinguish itself from
//! CI jobs.
pub mod config;
pub mod process;
pub mod queue;
pub mod reconcile;
pub mod resources;
pub mod state;

pub type AutoAllocResult<T> = anyhow::Result<T>;

pub use process::{
    AllocationOutcome, Allocator, AllocatorConfig, RejectReason, RepositorySession,
    discovery_process,
};
pub use reconcile::{Reconciler, reconciliation_process};
pub use state::{AllocationRecord, AllocationRegistry, AllocationState, BatchJobId, JobIdentity};
