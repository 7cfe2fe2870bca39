//! Access to the GitHub Actions REST API, which is the source of queued CI jobs.
//!
//! The controller only talks to GitHub through the [`JobSource`] trait, so that the
//! allocation logic can be tested without a network.
mod client;
mod error;
mod types;

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

pub use client::{GithubClient, rate_limit_wait};
pub use error::RemoteSourceError;
pub use types::{JobDetail, JobId, JobSummary, RunId, RunSummary, RunnerCredential};

pub type SourceResult<T> = Result<T, RemoteSourceError>;

pub type SourceFuture<'a, T> = Pin<Box<dyn Future<Output = SourceResult<T>> + 'a>>;

/// Repository whose queued workflow runs are monitored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    /// `owner/name`
    pub name: String,
    /// Base of the REST API for this repository, e.g. `https://api.github.com/repos/owner/name`
    pub api_base_url: String,
    /// URL the ephemeral runner registers against, e.g. `https://github.com/owner/name`
    pub repo_url: String,
}

impl Repository {
    /// Derives API and clone URLs of a repository hosted on github.com.
    pub fn from_name(name: &str) -> Self {
        Self {
            name: name.to_string(),
            api_base_url: format!("https://api.github.com/repos/{name}"),
            repo_url: format!("https://github.com/{name}"),
        }
    }
}

/// Result of a conditional GET request.
#[derive(Debug)]
pub enum Fetched<T> {
    Modified { data: T, etag: Option<String> },
    NotModified,
}

impl<T> Fetched<T> {
    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Fetched<U> {
        match self {
            Fetched::Modified { data, etag } => Fetched::Modified {
                data: f(data),
                etag,
            },
            Fetched::NotModified => Fetched::NotModified,
        }
    }
}

/// Source of queued CI work and of one-shot runner credentials.
pub trait JobSource {
    /// Lists queued workflow runs. If `etag` is provided and nothing changed since it was
    /// returned, [`Fetched::NotModified`] is returned.
    fn list_queued_runs<'a>(
        &'a self,
        repository: &'a Repository,
        etag: Option<&'a str>,
    ) -> SourceFuture<'a, Fetched<Vec<RunSummary>>>;

    /// Lists all jobs of a workflow run, across all pages.
    fn list_jobs_for_run<'a>(
        &'a self,
        repository: &'a Repository,
        run_id: RunId,
    ) -> SourceFuture<'a, Vec<JobSummary>>;

    /// Returns `None` if the job does not exist (anymore).
    fn get_job_detail<'a>(
        &'a self,
        repository: &'a Repository,
        job_id: JobId,
    ) -> SourceFuture<'a, Option<JobDetail>>;

    fn issue_registration_credential<'a>(
        &'a self,
        repository: &'a Repository,
    ) -> SourceFuture<'a, RunnerCredential>;

    fn issue_removal_credential<'a>(
        &'a self,
        repository: &'a Repository,
    ) -> SourceFuture<'a, RunnerCredential>;
}
