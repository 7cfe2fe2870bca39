use std::fmt::{Debug, Formatter};

use serde::Deserialize;

pub type RunId = u64;
pub type JobId = u64;

#[derive(Debug, Clone, Deserialize)]
pub(super) struct WorkflowRunList {
    #[serde(default)]
    pub workflow_runs: Vec<RunSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RunSummary {
    pub id: RunId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub head_branch: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub(super) struct JobList {
    #[serde(default)]
    pub jobs: Vec<JobSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct JobSummary {
    pub id: JobId,
    pub run_id: RunId,
    pub name: String,
    pub status: String,
}

impl JobSummary {
    pub fn is_queued(&self) -> bool {
        self.status == "queued"
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct JobDetail {
    pub id: JobId,
    pub run_id: RunId,
    pub name: String,
    #[serde(default)]
    pub workflow_name: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
}

#[derive(Deserialize)]
pub(super) struct TokenResponse {
    pub token: String,
}

/// One-shot token used by an ephemeral runner to register itself or to remove itself.
/// The value is never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct RunnerCredential(String);

impl RunnerCredential {
    pub fn new(token: String) -> Self {
        Self(token)
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl Debug for RunnerCredential {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("RunnerCredential(***)")
    }
}
