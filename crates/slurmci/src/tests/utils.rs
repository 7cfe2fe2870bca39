use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::{Duration, Instant};

use log::LevelFilter;

use crate::Map;
use crate::github::{
    Fetched, JobDetail, JobId, JobSource, JobSummary, RemoteSourceError, Repository, RunId,
    RunSummary, RunnerCredential, SourceFuture,
};
use crate::server::autoalloc::AutoAllocResult;
use crate::server::autoalloc::queue::{
    BatchAccounting, BatchFuture, BatchSubmitter, CommandOutput, SubmissionRequest,
};
use crate::server::autoalloc::state::BatchJobId;

pub fn init_test_logging() {
    let _ = env_logger::Builder::default()
        .filter(None, LevelFilter::Debug)
        .is_test(true)
        .try_init();
}

pub fn test_repository() -> Repository {
    Repository::from_name("owner/repo")
}

pub fn command_output(exit_code: i32, stdout: &str) -> CommandOutput {
    CommandOutput {
        exit_code: Some(exit_code),
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

fn mock_error(message: &str) -> RemoteSourceError {
    RemoteSourceError::Status {
        url: "mock".to_string(),
        status: 500,
        message: message.to_string(),
    }
}

#[derive(Default)]
pub struct SourceState {
    pub runs: Vec<RunSummary>,
    pub jobs: Map<RunId, Vec<JobSummary>>,
    pub details: Map<JobId, JobDetail>,
    /// ETag returned with the run listing.
    pub etag: Option<String>,
    pub fail_listing: bool,
    pub fail_detail: bool,
    /// Registration credentials take this long to be issued.
    pub credential_latency: Duration,

    pub listing_calls: usize,
    pub registration_calls: usize,
    pub removal_calls: usize,
    pub detail_calls: usize,
    /// When each registration credential was issued.
    pub registration_issued: Vec<Instant>,
    /// When each removal credential was issued.
    pub removal_issued: Vec<Instant>,
}

/// In-memory [`JobSource`] with call counters.
#[derive(Clone, Default)]
pub struct MockSource(Rc<RefCell<SourceState>>);

impl MockSource {
    pub fn state(&self) -> std::cell::RefMut<'_, SourceState> {
        self.0.borrow_mut()
    }

    pub fn add_job(&self, summary: JobSummary, detail: Option<JobDetail>) {
        let mut state = self.0.borrow_mut();
        let run_id = summary.run_id;
        if !state.runs.iter().any(|run| run.id == run_id) {
            state.runs.push(RunSummary {
                id: run_id,
                name: Some("CI".to_string()),
                head_branch: Some("main".to_string()),
            });
        }
        if let Some(detail) = detail {
            state.details.insert(summary.id, detail);
        }
        state.jobs.entry(run_id).or_default().push(summary);
    }
}

impl JobSource for MockSource {
    fn list_queued_runs<'a>(
        &'a self,
        _repository: &'a Repository,
        etag: Option<&'a str>,
    ) -> SourceFuture<'a, Fetched<Vec<RunSummary>>> {
        Box::pin(async move {
            let mut state = self.0.borrow_mut();
            state.listing_calls += 1;
            if state.fail_listing {
                return Err(mock_error("listing failed"));
            }
            if etag.is_some() && etag == state.etag.as_deref() {
                return Ok(Fetched::NotModified);
            }
            Ok(Fetched::Modified {
                data: state.runs.clone(),
                etag: state.etag.clone(),
            })
        })
    }

    fn list_jobs_for_run<'a>(
        &'a self,
        _repository: &'a Repository,
        run_id: RunId,
    ) -> SourceFuture<'a, Vec<JobSummary>> {
        Box::pin(async move {
            Ok(self
                .0
                .borrow()
                .jobs
                .get(&run_id)
                .cloned()
                .unwrap_or_default())
        })
    }

    fn get_job_detail<'a>(
        &'a self,
        _repository: &'a Repository,
        job_id: JobId,
    ) -> SourceFuture<'a, Option<JobDetail>> {
        Box::pin(async move {
            let mut state = self.0.borrow_mut();
            state.detail_calls += 1;
            if state.fail_detail {
                return Err(mock_error("detail failed"));
            }
            Ok(state.details.get(&job_id).cloned())
        })
    }

    fn issue_registration_credential<'a>(
        &'a self,
        _repository: &'a Repository,
    ) -> SourceFuture<'a, RunnerCredential> {
        Box::pin(async move {
            let (count, latency) = {
                let mut state = self.0.borrow_mut();
                state.registration_calls += 1;
                (state.registration_calls, state.credential_latency)
            };
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            self.0.borrow_mut().registration_issued.push(Instant::now());
            Ok(RunnerCredential::new(format!("REG{count}")))
        })
    }

    fn issue_removal_credential<'a>(
        &'a self,
        _repository: &'a Repository,
    ) -> SourceFuture<'a, RunnerCredential> {
        Box::pin(async move {
            let mut state = self.0.borrow_mut();
            state.removal_calls += 1;
            state.removal_issued.push(Instant::now());
            Ok(RunnerCredential::new(format!("REM{}", state.removal_calls)))
        })
    }
}

pub struct BatchState {
    /// Outputs of successive `submit` calls. When empty, submissions succeed with
    /// sequentially increasing job ids.
    pub submit_outputs: VecDeque<AutoAllocResult<CommandOutput>>,
    pub next_batch_id: BatchJobId,
    pub submissions: Vec<SubmissionRequest>,
    /// Accounting output per job. Jobs without an entry fail the query.
    pub accounting: Map<BatchJobId, CommandOutput>,
    pub queries: Vec<BatchJobId>,
}

impl Default for BatchState {
    fn default() -> Self {
        Self {
            submit_outputs: Default::default(),
            next_batch_id: 3828,
            submissions: vec![],
            accounting: Default::default(),
            queries: vec![],
        }
    }
}

/// In-memory batch scheduler that records submissions and answers accounting queries.
#[derive(Clone, Default)]
pub struct MockBatch(Rc<RefCell<BatchState>>);

impl MockBatch {
    pub fn state(&self) -> std::cell::RefMut<'_, BatchState> {
        self.0.borrow_mut()
    }
}

impl BatchSubmitter for MockBatch {
    fn submit<'a>(&'a self, request: &'a SubmissionRequest) -> BatchFuture<'a, CommandOutput> {
        Box::pin(async move {
            let mut state = self.0.borrow_mut();
            state.submissions.push(request.clone());
            if let Some(output) = state.submit_outputs.pop_front() {
                return output;
            }
            let id = state.next_batch_id;
            state.next_batch_id += 1;
            Ok(command_output(0, &format!("Submitted batch job {id}\n")))
        })
    }
}

impl BatchAccounting for MockBatch {
    fn query(&self, batch_job_id: BatchJobId) -> BatchFuture<'_, CommandOutput> {
        Box::pin(async move {
            let mut state = self.0.borrow_mut();
            state.queries.push(batch_job_id);
            state
                .accounting
                .get(&batch_job_id)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("sacct did not finish in 1m"))
        })
    }
}
