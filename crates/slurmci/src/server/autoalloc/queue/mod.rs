mod common;
pub mod slurm;

use std::future::Future;
use std::pin::Pin;

use crate::github::{RunId, RunnerCredential};
use crate::server::autoalloc::AutoAllocResult;
use crate::server::autoalloc::resources::ResourceRequest;
use crate::server::autoalloc::state::BatchJobId;

pub use common::check_command_output;

pub type BatchFuture<'a, T> = Pin<Box<dyn Future<Output = AutoAllocResult<T>> + 'a>>;

/// Captured result of an external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` if the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Everything that is needed to start an ephemeral runner for a single CI job.
#[derive(Debug, Clone)]
pub struct SubmissionRequest {
    pub job_name: String,
    pub resources: ResourceRequest,
    pub repo_url: String,
    pub registration_credential: RunnerCredential,
    pub removal_credential: RunnerCredential,
    pub labels: Vec<String>,
    pub run_id: RunId,
}

/// Handler that can submit allocations into a batch scheduler (e.g. Slurm).
pub trait BatchSubmitter {
    /// Submits an allocation that starts an ephemeral runner.
    ///
    /// An error is returned only if the command could not be executed at all (or timed out).
    /// A command that ran and failed is returned as a [`CommandOutput`] with a nonzero exit code.
    fn submit<'a>(&'a self, request: &'a SubmissionRequest) -> BatchFuture<'a, CommandOutput>;
}

/// Handler that can read accounting information of submitted allocations.
pub trait BatchAccounting {
    fn query(&self, batch_job_id: BatchJobId) -> BatchFuture<'_, CommandOutput>;
}
