use std::fmt::{Display, Formatter};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use hashbrown::hash_map::Entry;

use crate::Map;
use crate::github::{JobId, RunId};

/// Identifier of a Slurm job.
pub type BatchJobId = u64;

/// Identifies a CI job across all monitored repositories.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobIdentity {
    pub repository: String,
    pub job_id: JobId,
}

impl JobIdentity {
    pub fn new(repository: &str, job_id: JobId) -> Self {
        Self {
            repository: repository.to_string(),
            job_id,
        }
    }
}

impl Display for JobIdentity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.repository, self.job_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationState {
    /// The job was claimed, but its allocation was not submitted (yet).
    Claimed,
    /// The allocation was submitted into Slurm.
    Submitted { batch_job_id: BatchJobId },
}

/// A single CI job that is (being) provisioned with a Slurm allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationRecord {
    pub job_id: JobId,
    pub run_id: Option<RunId>,
    pub workflow_name: Option<String>,
    pub job_name: Option<String>,
    /// The first label decides the resource tier.
    pub labels: Vec<String>,
    pub tier: Option<String>,
    pub start_time: SystemTime,
    /// Node where the allocation runs. Set at most once.
    pub execution_node: Option<String>,
    pub state: AllocationState,
}

impl AllocationRecord {
    pub fn claimed(job_id: JobId) -> Self {
        Self {
            job_id,
            run_id: None,
            workflow_name: None,
            job_name: None,
            labels: vec![],
            tier: None,
            start_time: SystemTime::now(),
            execution_node: None,
            state: AllocationState::Claimed,
        }
    }

    pub fn batch_job_id(&self) -> Option<BatchJobId> {
        match self.state {
            AllocationState::Claimed => None,
            AllocationState::Submitted { batch_job_id } => Some(batch_job_id),
        }
    }
}

impl Display for AllocationRecord {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let batch_job = self
            .batch_job_id()
            .map(|id| id.to_string())
            .unwrap_or_else(|| "<none>".to_string());
        write!(
            f,
            "job_id = {}, slurm_job_id = {}, workflow = {}, job = {}, labels = [{}], node = {}",
            self.job_id,
            batch_job,
            self.workflow_name.as_deref().unwrap_or("<unknown>"),
            self.job_name.as_deref().unwrap_or("<unknown>"),
            self.labels.join(","),
            self.execution_node.as_deref().unwrap_or("<none>"),
        )
    }
}

/// In-memory map of CI jobs that are being allocated or that run in Slurm.
///
/// The registry is shared between the discovery and the reconciliation loop. Every operation
/// takes the lock only for its own duration, so the lock is never held across an await point.
#[derive(Default)]
pub struct AllocationRegistry {
    records: Mutex<Map<JobIdentity, AllocationRecord>>,
}

impl AllocationRegistry {
    fn records(&self) -> MutexGuard<'_, Map<JobIdentity, AllocationRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Atomically reserves the identity with a [`AllocationState::Claimed`] placeholder.
    /// Returns false if a record for the identity already exists.
    pub fn try_claim(&self, identity: &JobIdentity) -> bool {
        match self.records().entry(identity.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(AllocationRecord::claimed(identity.job_id));
                true
            }
        }
    }

    pub fn set(&self, identity: JobIdentity, record: AllocationRecord) {
        self.records().insert(identity, record);
    }

    pub fn get(&self, identity: &JobIdentity) -> Option<AllocationRecord> {
        self.records().get(identity).cloned()
    }

    pub fn remove(&self, identity: &JobIdentity) -> Option<AllocationRecord> {
        self.records().remove(identity)
    }

    /// Sets the execution node of the record, unless it is already known.
    /// Returns true if the node was stored.
    pub fn set_execution_node(&self, identity: &JobIdentity, node: &str) -> bool {
        match self.records().get_mut(identity) {
            Some(record) if record.execution_node.is_none() => {
                record.execution_node = Some(node.to_string());
                true
            }
            _ => false,
        }
    }

    /// Copy of all records, sorted by identity.
    pub fn snapshot(&self) -> Vec<(JobIdentity, AllocationRecord)> {
        let mut records: Vec<_> = self
            .records()
            .iter()
            .map(|(identity, record)| (identity.clone(), record.clone()))
            .collect();
        records.sort_by(|(a, _), (b, _)| {
            (a.repository.as_str(), a.job_id).cmp(&(b.repository.as_str(), b.job_id))
        });
        records
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{AllocationRecord, AllocationRegistry, AllocationState, JobIdentity};

    fn identity(job_id: u64) -> JobIdentity {
        JobIdentity::new("owner/repo", job_id)
    }

    #[test]
    fn claim_is_exclusive() {
        let registry = AllocationRegistry::default();
        assert!(registry.try_claim(&identity(1)));
        assert!(!registry.try_claim(&identity(1)));
        assert!(registry.try_claim(&identity(2)));
        assert!(registry.try_claim(&JobIdentity::new("owner/other", 1)));
        assert_eq!(registry.len(), 3);
        assert_eq!(
            registry.get(&identity(1)).unwrap().state,
            AllocationState::Claimed
        );
    }

    #[test]
    fn concurrent_claims_have_single_winner() {
        let registry = Arc::new(AllocationRegistry::default());
        let winners: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let registry = registry.clone();
                    scope.spawn(move || registry.try_claim(&identity(42)))
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap() as usize)
                .sum()
        });
        assert_eq!(winners, 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn removed_identity_can_be_claimed_again() {
        let registry = AllocationRegistry::default();
        assert!(registry.try_claim(&identity(1)));
        assert!(registry.remove(&identity(1)).is_some());
        assert!(registry.is_empty());
        assert!(registry.try_claim(&identity(1)));
    }

    #[test]
    fn execution_node_is_set_once() {
        let registry = AllocationRegistry::default();
        assert!(!registry.set_execution_node(&identity(1), "node01"));

        registry.set(identity(1), AllocationRecord::claimed(1));
        assert!(registry.set_execution_node(&identity(1), "node07"));
        assert!(!registry.set_execution_node(&identity(1), "node08"));
        assert_eq!(
            registry.get(&identity(1)).unwrap().execution_node.as_deref(),
            Some("node07")
        );
    }

    #[test]
    fn snapshot_is_detached() {
        let registry = AllocationRegistry::default();
        let mut record = AllocationRecord::claimed(2);
        record.state = AllocationState::Submitted { batch_job_id: 3828 };
        registry.set(identity(2), record);
        registry.set(identity(1), AllocationRecord::claimed(1));

        let snapshot = registry.snapshot();
        registry.remove(&identity(2));

        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].0, identity(1));
        assert_eq!(snapshot[1].1.batch_job_id(), Some(3828));
        assert_eq!(registry.len(), 1);
    }
}
