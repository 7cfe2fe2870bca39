use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use crate::Set;
use crate::common::manager::slurm::{SacctEntry, SlurmJobState, parse_sacct_output};
use crate::server::autoalloc::AutoAllocResult;
use crate::server::autoalloc::queue::{BatchAccounting, check_command_output};
use crate::server::autoalloc::state::{AllocationRegistry, BatchJobId, JobIdentity};
use crate::server::metrics::Metrics;

/// Result of a single reconciliation pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileSummary {
    /// Number of Slurm jobs whose accounting was queried.
    pub queried: usize,
    pub failed_queries: usize,
    /// Number of records removed because their Slurm job has finished.
    pub finished: usize,
}

/// Tracks submitted allocations in Slurm accounting and removes finished ones from the registry.
pub struct Reconciler {
    accounting: Rc<dyn BatchAccounting>,
    registry: Arc<AllocationRegistry>,
    metrics: Metrics,
    /// Slurm jobs whose unrecognized state was already reported.
    unrecognized: RefCell<Set<BatchJobId>>,
}

impl Reconciler {
    pub fn new(
        accounting: Rc<dyn BatchAccounting>,
        registry: Arc<AllocationRegistry>,
        metrics: Metrics,
    ) -> Self {
        Self {
            accounting,
            registry,
            metrics,
            unrecognized: Default::default(),
        }
    }

    /// Queries the state of every submitted allocation.
    ///
    /// Finished allocations are only marked during the pass over the snapshot and they are removed
    /// from the registry after the pass ends. Records whose query fails are kept and queried again
    /// in the next pass.
    pub async fn reconcile(&self) -> ReconcileSummary {
        let mut summary = ReconcileSummary::default();
        let mut finished: Vec<JobIdentity> = vec![];

        for (identity, mut record) in self.registry.snapshot() {
            let Some(batch_job_id) = record.batch_job_id() else {
                continue;
            };
            summary.queried += 1;

            let entry = match self.query(batch_job_id).await {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    log::debug!(
                        "Slurm job {batch_job_id} of job {identity} is not in accounting yet"
                    );
                    continue;
                }
                Err(error) => {
                    summary.failed_queries += 1;
                    log::error!(
                        "Cannot query Slurm job {batch_job_id} of job {identity}: {error:?}"
                    );
                    continue;
                }
            };

            if record.execution_node.is_none() {
                if let Some(node) = entry.node.as_deref() {
                    if self.registry.set_execution_node(&identity, node) {
                        log::info!("Slurm job {batch_job_id} of job {identity} runs on {node}");
                        self.metrics.on_node_assigned(record.tier.as_deref(), node);
                        record.execution_node = Some(node.to_string());
                    }
                }
            }

            if let SlurmJobState::Other(state) = &entry.state {
                if self.unrecognized.borrow_mut().insert(batch_job_id) {
                    log::warn!(
                        "Slurm job {batch_job_id} of job {identity} is in unrecognized state {state}, it stays tracked"
                    );
                }
            }

            if entry.state.is_terminal() {
                let duration = finished_duration(&entry);
                let duration_text = duration
                    .map(|duration| humantime::format_duration(duration).to_string())
                    .unwrap_or_else(|| "[unknown duration]".to_string());
                log::info!(
                    "Slurm job {} {} in {duration_text}. Running job info: {record}",
                    entry.job_id,
                    entry.state
                );
                self.metrics.on_allocation_finished(
                    record.tier.as_deref(),
                    record.execution_node.as_deref(),
                    duration,
                );
                self.unrecognized.borrow_mut().remove(&batch_job_id);
                finished.push(identity);
            }
        }

        for identity in &finished {
            self.registry.remove(identity);
        }
        summary.finished = finished.len();
        summary
    }

    async fn query(&self, batch_job_id: BatchJobId) -> AutoAllocResult<Option<SacctEntry>> {
        let output = self.accounting.query(batch_job_id).await?;
        check_command_output(&output).context("sacct execution failed")?;
        Ok(parse_sacct_output(&output.stdout))
    }
}

fn finished_duration(entry: &SacctEntry) -> Option<Duration> {
    match entry.duration() {
        Ok(Some(duration)) => match duration.to_std() {
            Ok(duration) => Some(duration),
            Err(_) => {
                log::warn!(
                    "Slurm job {} reports end time before its start time ({duration})",
                    entry.job_id
                );
                None
            }
        },
        Ok(None) => None,
        Err(error) => {
            log::warn!(
                "Cannot compute duration of Slurm job {}: {error:?}",
                entry.job_id
            );
            None
        }
    }
}

/// Periodically reconciles submitted allocations. Never returns.
pub async fn reconciliation_process(reconciler: &Reconciler, interval: Duration) {
    loop {
        if !reconciler.registry.is_empty() {
            let summary = reconciler.reconcile().await;
            log::debug!("Reconciliation finished: {summary:?}");
        }
        tokio::time::sleep(interval).await;
    }
}
