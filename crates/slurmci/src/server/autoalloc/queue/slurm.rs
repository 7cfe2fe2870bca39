use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;

use crate::server::autoalloc::AutoAllocResult;
use crate::server::autoalloc::queue::common::{create_command, run_command};
use crate::server::autoalloc::queue::{
    BatchAccounting, BatchFuture, BatchSubmitter, CommandOutput, SubmissionRequest,
};
use crate::server::autoalloc::state::BatchJobId;

/// Fields requested from `sacct`, in the order expected by
/// [`crate::common::manager::slurm::parse_sacct_output`].
const SACCT_FIELDS: &str = "JobID,State,Start,End,NodeList";

pub struct SlurmHandler {
    sbatch_path: PathBuf,
    sacct_path: PathBuf,
    allocation_script: PathBuf,
    command_timeout: Duration,
}

impl SlurmHandler {
    pub fn new(
        allocation_script: PathBuf,
        sbatch_path: PathBuf,
        sacct_path: PathBuf,
        command_timeout: Duration,
    ) -> Self {
        Self {
            sbatch_path,
            sacct_path,
            allocation_script,
            command_timeout,
        }
    }
}

impl BatchSubmitter for SlurmHandler {
    fn submit<'a>(&'a self, request: &'a SubmissionRequest) -> BatchFuture<'a, CommandOutput> {
        Box::pin(async move {
            let arguments = build_sbatch_arguments(&self.allocation_script, request, false);
            log::debug!(
                "Running Slurm command `{} {}`",
                self.sbatch_path.display(),
                build_sbatch_arguments(&self.allocation_script, request, true).join(" ")
            );
            let command = create_command(&self.sbatch_path, &arguments);
            run_command(command, "sbatch", self.command_timeout).await
        })
    }
}

impl BatchAccounting for SlurmHandler {
    fn query(&self, batch_job_id: BatchJobId) -> BatchFuture<'_, CommandOutput> {
        Box::pin(async move {
            let arguments = build_sacct_arguments(batch_job_id);
            log::debug!(
                "Running Slurm command `{} {}`",
                self.sacct_path.display(),
                arguments.join(" ")
            );
            let command = create_command(&self.sacct_path, &arguments);
            run_command(command, "sacct", self.command_timeout).await
        })
    }
}

/// Arguments of `sbatch`. The allocation script receives the repository URL, both runner
/// credentials, comma-joined labels and the run id as positional arguments.
///
/// With `redact_credentials`, credentials are replaced by a placeholder, so that the result can
/// be logged.
pub fn build_sbatch_arguments(
    allocation_script: &Path,
    request: &SubmissionRequest,
    redact_credentials: bool,
) -> Vec<String> {
    let resources = &request.resources;
    let (registration, removal) = if redact_credentials {
        ("<registration-token>", "<removal-token>")
    } else {
        (
            request.registration_credential.expose(),
            request.removal_credential.expose(),
        )
    };
    vec![
        format!("--job-name={}", request.job_name),
        format!("--mem-per-cpu={}", resources.mem_per_cpu_arg()),
        format!("--cpus-per-task={}", resources.cpus),
        format!("--gres=tmpdisk:{}", resources.tmpdisk),
        format!("--time={}", resources.time_limit_arg()),
        allocation_script.display().to_string(),
        request.repo_url.clone(),
        registration.to_string(),
        removal.to_string(),
        request.labels.join(","),
        request.run_id.to_string(),
    ]
}

pub fn build_sacct_arguments(batch_job_id: BatchJobId) -> Vec<String> {
    vec![
        "-n".to_string(),
        "-P".to_string(),
        "-o".to_string(),
        SACCT_FIELDS.to_string(),
        "--jobs".to_string(),
        batch_job_id.to_string(),
    ]
}

/// The job id is the last token of the output, e.g. `Submitted batch job 3828`.
pub fn parse_sbatch_output(stdout: &str) -> AutoAllocResult<BatchJobId> {
    let token = stdout
        .split_whitespace()
        .last()
        .ok_or_else(|| anyhow::anyhow!("Missing job id in empty sbatch output"))?;
    token
        .parse::<BatchJobId>()
        .with_context(|| format!("Invalid job id `{token}` in sbatch output\n{stdout}"))
}
