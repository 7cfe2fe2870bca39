use std::time::{Duration, SystemTime, UNIX_EPOCH};

use reqwest::header::{ACCEPT, ETAG, HeaderMap, IF_NONE_MATCH, RETRY_AFTER};
use reqwest::{Method, Response, StatusCode};
use serde::de::DeserializeOwned;

use crate::github::types::{JobList, TokenResponse, WorkflowRunList};
use crate::github::{
    Fetched, JobDetail, JobId, JobSource, JobSummary, RemoteSourceError, Repository, RunId,
    RunSummary, RunnerCredential, SourceFuture, SourceResult,
};

const GITHUB_ACCEPT: &str = "application/vnd.github+json";
const GITHUB_API_VERSION_HEADER: &str = "X-GitHub-Api-Version";
const GITHUB_API_VERSION: &str = "2022-11-28";

const RATE_LIMIT_REMAINING_HEADER: &str = "x-ratelimit-remaining";
const RATE_LIMIT_RESET_HEADER: &str = "x-ratelimit-reset";

/// Number of jobs requested per page of a job listing.
pub const JOBS_PAGE_SIZE: usize = 100;

/// Added on top of the server-provided reset time, to avoid hitting the limit again because of
/// clock skew.
const DEFAULT_RATE_LIMIT_MARGIN: Duration = Duration::from_secs(5);

/// Used when the rate limit is exhausted, but the server did not say when it resets.
const DEFAULT_RATE_LIMIT_WAIT: Duration = Duration::from_secs(60);

pub struct GithubClient {
    http: reqwest::Client,
    token: String,
    rate_limit_margin: Duration,
}

impl GithubClient {
    pub fn new(token: String, timeout: Duration) -> Result<Self, RemoteSourceError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("slurmci/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(RemoteSourceError::Client)?;
        Ok(Self {
            http,
            token,
            rate_limit_margin: DEFAULT_RATE_LIMIT_MARGIN,
        })
    }

    pub fn with_rate_limit_margin(mut self, margin: Duration) -> Self {
        self.rate_limit_margin = margin;
        self
    }

    /// Sends a request, transparently waiting out exhausted rate limits.
    async fn send(&self, method: Method, url: &str, etag: Option<&str>) -> SourceResult<Response> {
        loop {
            let mut request = self
                .http
                .request(method.clone(), url)
                .bearer_auth(&self.token)
                .header(ACCEPT, GITHUB_ACCEPT)
                .header(GITHUB_API_VERSION_HEADER, GITHUB_API_VERSION);
            if let Some(etag) = etag {
                request = request.header(IF_NONE_MATCH, etag);
            }

            log::debug!("Sending {method} {url}");
            let response = request
                .send()
                .await
                .map_err(|source| RemoteSourceError::Network {
                    url: url.to_string(),
                    source,
                })?;

            match rate_limit_wait(response.status(), response.headers(), SystemTime::now()) {
                Some(wait) => {
                    let wait = wait + self.rate_limit_margin;
                    log::warn!(
                        "GitHub API rate limit exhausted ({method} {url}), retrying in {}",
                        humantime::format_duration(wait)
                    );
                    tokio::time::sleep(wait).await;
                }
                None => return Ok(response),
            }
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        etag: Option<&str>,
    ) -> SourceResult<Fetched<T>> {
        let response = self.send(Method::GET, url, etag).await?;
        if response.status() == StatusCode::NOT_MODIFIED {
            return Ok(Fetched::NotModified);
        }
        let response = check_status(response, url).await?;
        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_string());
        let data = decode(response, url).await?;
        Ok(Fetched::Modified { data, etag })
    }

    async fn issue_token(&self, url: &str) -> SourceResult<RunnerCredential> {
        let response = self.send(Method::POST, url, None).await?;
        let response = check_status(response, url).await?;
        let token: TokenResponse = decode(response, url).await?;
        Ok(RunnerCredential::new(token.token))
    }
}

/// Computes how long to wait before retrying a request, if the response says that the rate
/// limit was exhausted.
pub fn rate_limit_wait(status: StatusCode, headers: &HeaderMap, now: SystemTime) -> Option<Duration> {
    if status != StatusCode::FORBIDDEN && status != StatusCode::TOO_MANY_REQUESTS {
        return None;
    }
    if let Some(seconds) = header_u64(headers, RETRY_AFTER.as_str()) {
        return Some(Duration::from_secs(seconds));
    }
    if header_u64(headers, RATE_LIMIT_REMAINING_HEADER) != Some(0) {
        return None;
    }
    let Some(reset) = header_u64(headers, RATE_LIMIT_RESET_HEADER) else {
        return Some(DEFAULT_RATE_LIMIT_WAIT);
    };
    let now = now
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    Some(Duration::from_secs(reset.saturating_sub(now)))
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
}

async fn check_status(response: Response, url: &str) -> SourceResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(RemoteSourceError::Status {
        url: url.to_string(),
        status: status.as_u16(),
        message: message.trim().to_string(),
    })
}

async fn decode<T: DeserializeOwned>(response: Response, url: &str) -> SourceResult<T> {
    let body = response
        .bytes()
        .await
        .map_err(|source| RemoteSourceError::Network {
            url: url.to_string(),
            source,
        })?;
    serde_json::from_slice(&body).map_err(|source| RemoteSourceError::Decode {
        url: url.to_string(),
        source,
    })
}

impl JobSource for GithubClient {
    fn list_queued_runs<'a>(
        &'a self,
        repository: &'a Repository,
        etag: Option<&'a str>,
    ) -> SourceFuture<'a, Fetched<Vec<RunSummary>>> {
        Box::pin(async move {
            let url = format!("{}/actions/runs?status=queued", repository.api_base_url);
            let runs = self.get_json::<WorkflowRunList>(&url, etag).await?;
            Ok(runs.map(|runs| runs.workflow_runs))
        })
    }

    fn list_jobs_for_run<'a>(
        &'a self,
        repository: &'a Repository,
        run_id: RunId,
    ) -> SourceFuture<'a, Vec<JobSummary>> {
        Box::pin(async move {
            let mut jobs = Vec::new();
            let mut page = 1;
            loop {
                let url = format!(
                    "{}/actions/runs/{run_id}/jobs?per_page={JOBS_PAGE_SIZE}&page={page}",
                    repository.api_base_url
                );
                let Fetched::Modified { data, .. } = self.get_json::<JobList>(&url, None).await?
                else {
                    break;
                };
                let count = data.jobs.len();
                jobs.extend(data.jobs);
                if count < JOBS_PAGE_SIZE {
                    break;
                }
                page += 1;
            }
            Ok(jobs)
        })
    }

    fn get_job_detail<'a>(
        &'a self,
        repository: &'a Repository,
        job_id: JobId,
    ) -> SourceFuture<'a, Option<JobDetail>> {
        Box::pin(async move {
            let url = format!("{}/actions/jobs/{job_id}", repository.api_base_url);
            match self.get_json::<JobDetail>(&url, None).await {
                Ok(Fetched::Modified { data, .. }) => Ok(Some(data)),
                Ok(Fetched::NotModified) => Ok(None),
                Err(error) if error.is_not_found() => Ok(None),
                Err(error) => Err(error),
            }
        })
    }

    fn issue_registration_credential<'a>(
        &'a self,
        repository: &'a Repository,
    ) -> SourceFuture<'a, RunnerCredential> {
        Box::pin(async move {
            let url = format!(
                "{}/actions/runners/registration-token",
                repository.api_base_url
            );
            self.issue_token(&url).await
        })
    }

    fn issue_removal_credential<'a>(
        &'a self,
        repository: &'a Repository,
    ) -> SourceFuture<'a, RunnerCredential> {
        Box::pin(async move {
            let url = format!("{}/actions/runners/remove-token", repository.api_base_url);
            self.issue_token(&url).await
        })
    }
}
