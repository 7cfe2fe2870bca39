use std::fmt::{Display, Formatter};
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Context;

use crate::github::{Fetched, JobId, JobSource, Repository, SourceResult};
use crate::server::autoalloc::config::{
    ALLOCATION_DUMP_TICKS, ALLOCATION_RETRY_DELAYS, DEFAULT_MAX_ALLOCATION_ATTEMPTS,
    ETAG_RESET_TICKS, get_credential_delay, retry_delay,
};
use crate::server::autoalloc::queue::slurm::parse_sbatch_output;
use crate::server::autoalloc::queue::{BatchSubmitter, SubmissionRequest, check_command_output};
use crate::server::autoalloc::resources::{is_runner_label, resolve, tier_name};
use crate::server::autoalloc::state::{
    AllocationRecord, AllocationRegistry, AllocationState, BatchJobId, JobIdentity,
};
use crate::server::metrics::Metrics;

#[derive(Debug, Clone)]
pub struct AllocatorConfig {
    /// Maximum number of attempts of a single allocation.
    pub max_attempts: u32,
    /// Delays between successive attempts of the same allocation.
    pub retry_delays: Vec<Duration>,
    /// Delay between issuing the registration and the removal credential.
    pub credential_delay: Duration,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ALLOCATION_ATTEMPTS,
            retry_delays: ALLOCATION_RETRY_DELAYS.to_vec(),
            credential_delay: get_credential_delay(),
        }
    }
}

/// Reason why a job will not be allocated. Rejected allocations are not retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    MissingDetail,
    MissingLabels,
    Ineligible { label: String },
    UnknownTier { label: String },
}

impl Display for RejectReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::MissingDetail => f.write_str("job detail is not available"),
            RejectReason::MissingLabels => f.write_str("job has no labels"),
            RejectReason::Ineligible { label } => {
                write!(f, "label `{label}` is not meant for Slurm runners")
            }
            RejectReason::UnknownTier { label } => write!(f, "unknown resource tier `{label}`"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocationOutcome {
    /// The job is already being allocated (or it was allocated before).
    AlreadyAllocated,
    Submitted { batch_job_id: BatchJobId },
    Rejected(RejectReason),
    /// All attempts have failed. The job is left unclaimed, so that it can be discovered again.
    Abandoned { attempts: u32 },
}

enum AttemptError {
    Rejected(RejectReason),
    Failed(anyhow::Error),
}

impl From<anyhow::Error> for AttemptError {
    fn from(error: anyhow::Error) -> Self {
        Self::Failed(error)
    }
}

/// Submits Slurm allocations with ephemeral runners for queued CI jobs.
pub struct Allocator {
    source: Rc<dyn JobSource>,
    submitter: Rc<dyn BatchSubmitter>,
    registry: Arc<AllocationRegistry>,
    metrics: Metrics,
    config: AllocatorConfig,
}

impl Allocator {
    pub fn new(
        source: Rc<dyn JobSource>,
        submitter: Rc<dyn BatchSubmitter>,
        registry: Arc<AllocationRegistry>,
        metrics: Metrics,
        config: AllocatorConfig,
    ) -> Self {
        Self {
            source,
            submitter,
            registry,
            metrics,
            config,
        }
    }

    /// Allocates a runner for the given job, unless it is already being allocated.
    ///
    /// Failures of remote calls and of the submission are retried up to
    /// [`AllocatorConfig::max_attempts`] times. The job is claimed in the registry for the
    /// duration of each attempt; a failed attempt removes the claim.
    pub async fn allocate(&self, repository: &Repository, job_id: JobId) -> AllocationOutcome {
        let identity = JobIdentity::new(&repository.name, job_id);
        let max_attempts = self.config.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            let delay = retry_delay(attempt, &self.config.retry_delays);
            if !delay.is_zero() {
                log::debug!(
                    "Waiting {} before allocation attempt {attempt} of job {identity}",
                    humantime::format_duration(delay)
                );
                tokio::time::sleep(delay).await;
            }

            if !self.registry.try_claim(&identity) {
                log::info!("Runner already allocated for job {identity}");
                return AllocationOutcome::AlreadyAllocated;
            }
            log::info!("Allocating runner for job {identity} (attempt {attempt}/{max_attempts})");

            match self.try_allocate(repository, &identity).await {
                Ok(batch_job_id) => return AllocationOutcome::Submitted { batch_job_id },
                Err(AttemptError::Rejected(reason)) => {
                    self.registry.remove(&identity);
                    log::warn!("Skipping job {identity}: {reason}");
                    return AllocationOutcome::Rejected(reason);
                }
                Err(AttemptError::Failed(error)) => {
                    self.registry.remove(&identity);
                    log::error!(
                        "Allocation attempt {attempt}/{max_attempts} of job {identity} failed: {error:?}"
                    );
                }
            }
        }

        log::error!("Giving up allocation of job {identity} after {max_attempts} attempt(s)");
        AllocationOutcome::Abandoned {
            attempts: max_attempts,
        }
    }

    async fn try_allocate(
        &self,
        repository: &Repository,
        identity: &JobIdentity,
    ) -> Result<BatchJobId, AttemptError> {
        let start_time = self
            .registry
            .get(identity)
            .map(|record| record.start_time)
            .unwrap_or_else(SystemTime::now);

        let registration_credential = self
            .source
            .issue_registration_credential(repository)
            .await
            .context("Cannot issue runner registration credential")?;
        if !self.config.credential_delay.is_zero() {
            tokio::time::sleep(self.config.credential_delay).await;
        }
        let removal_credential = self
            .source
            .issue_removal_credential(repository)
            .await
            .context("Cannot issue runner removal credential")?;

        let detail = self
            .source
            .get_job_detail(repository, identity.job_id)
            .await
            .context("Cannot fetch job detail")?
            .ok_or(AttemptError::Rejected(RejectReason::MissingDetail))?;
        let label = detail
            .labels
            .first()
            .cloned()
            .ok_or(AttemptError::Rejected(RejectReason::MissingLabels))?;

        let mut record = AllocationRecord {
            job_id: identity.job_id,
            run_id: Some(detail.run_id),
            workflow_name: detail.workflow_name.clone(),
            job_name: Some(detail.name.clone()),
            labels: detail.labels.clone(),
            tier: None,
            start_time,
            execution_node: None,
            state: AllocationState::Claimed,
        };
        self.registry.set(identity.clone(), record.clone());

        if !is_runner_label(&label) {
            return Err(AttemptError::Rejected(RejectReason::Ineligible { label }));
        }
        let resources = resolve(&label)
            .map_err(|error| AttemptError::Rejected(RejectReason::UnknownTier { label: error.label }))?;
        record.tier = Some(tier_name(&label).to_string());

        let request = SubmissionRequest {
            job_name: format!("slurmci-{}", identity.job_id),
            resources,
            repo_url: repository.repo_url.clone(),
            registration_credential,
            removal_credential,
            labels: detail.labels,
            run_id: detail.run_id,
        };
        log::info!(
            "Submitting allocation for job {identity} ({})",
            request.resources
        );
        let output = self
            .submitter
            .submit(&request)
            .await
            .context("sbatch start failed")?;
        check_command_output(&output).context("sbatch execution failed")?;
        let batch_job_id = parse_sbatch_output(&output.stdout)?;

        record.state = AllocationState::Submitted { batch_job_id };
        self.registry.set(identity.clone(), record.clone());
        self.metrics.on_allocation_submitted(record.tier.as_deref());
        log::info!("Allocated runner for job {identity} with Slurm job {batch_job_id}: {record}");
        Ok(batch_job_id)
    }

    /// Looks for queued jobs of the session's repository and allocates runners for them.
    /// Returns the number of queued jobs that were found.
    ///
    /// The ETag of the session is updated only if all runs were processed.
    pub async fn discover(&self, session: &mut RepositorySession) -> SourceResult<usize> {
        let repository = &session.repository;
        let (runs, etag) = match self
            .source
            .list_queued_runs(repository, session.etag.as_deref())
            .await?
        {
            Fetched::NotModified => {
                log::debug!("No changes in queued runs of {}", repository.name);
                return Ok(0);
            }
            Fetched::Modified { data, etag } => (data, etag),
        };
        log::info!(
            "Changes detected in {}: {} queued run(s)",
            repository.name,
            runs.len()
        );

        let mut queued = 0;
        for run in runs {
            let jobs = self.source.list_jobs_for_run(repository, run.id).await?;
            for job in jobs {
                if job.is_queued() {
                    log::info!("Job {} {} of run {} is queued", job.name, job.id, run.id);
                    queued += 1;
                    self.allocate(repository, job.id).await;
                } else {
                    log::debug!("Job {} {} is not queued ({})", job.name, job.id, job.status);
                }
            }
        }

        session.etag = etag;
        Ok(queued)
    }

    /// Runs a single discovery pass. Errors are logged and make the next pass refetch
    /// everything.
    pub async fn discovery_tick(&self, session: &mut RepositorySession) {
        if let Err(error) = self.discover(session).await {
            log::error!(
                "Discovery of queued jobs in {} failed: {error}",
                session.repository.name
            );
            session.reset_etag();
        }
    }
}

/// Discovery state of a single repository, threaded through successive discovery ticks.
#[derive(Debug)]
pub struct RepositorySession {
    repository: Repository,
    etag: Option<String>,
}

impl RepositorySession {
    pub fn new(repository: Repository) -> Self {
        Self {
            repository,
            etag: None,
        }
    }

    pub fn etag(&self) -> Option<&str> {
        self.etag.as_deref()
    }

    pub fn reset_etag(&mut self) {
        self.etag = None;
    }
}

fn log_allocations(registry: &AllocationRegistry) {
    let records = registry.snapshot();
    if records.is_empty() {
        return;
    }
    log::info!("Currently {} allocated job(s):", records.len());
    for (identity, record) in records {
        log::info!("{identity}: {record}");
    }
}

/// Periodically discovers queued jobs in all repositories. Never returns.
pub async fn discovery_process(
    allocator: &Allocator,
    repositories: Vec<Repository>,
    interval: Duration,
) {
    let mut sessions: Vec<RepositorySession> = repositories
        .into_iter()
        .map(RepositorySession::new)
        .collect();
    let mut tick: u64 = 0;

    loop {
        if tick > 0 && tick % ETAG_RESET_TICKS == 0 {
            log::debug!("Resetting cached ETags of queued runs");
            sessions.iter_mut().for_each(RepositorySession::reset_etag);
        }
        for session in sessions.iter_mut() {
            allocator.discovery_tick(session).await;
        }
        if tick % ALLOCATION_DUMP_TICKS == 0 {
            log_allocations(&allocator.registry);
        }
        tick += 1;
        tokio::time::sleep(interval).await;
    }
}
