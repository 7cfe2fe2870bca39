use std::fmt::{Display, Formatter};
use std::time::Duration;

use crate::common::timeutils::format_hms_duration;

/// Value reported by `sacct` for timestamps that are not known (yet).
const UNKNOWN_TIME: &str = "Unknown";

/// Value reported by `sacct` in the node list of jobs that were not placed yet.
const NO_NODE_ASSIGNED: &str = "None assigned";

/// Format a duration as a SLURM time string, e.g. 01:05:02
pub fn format_slurm_duration(duration: &Duration) -> String {
    format_hms_duration(duration)
}

pub fn parse_slurm_datetime(datetime: &str) -> anyhow::Result<chrono::NaiveDateTime> {
    Ok(chrono::NaiveDateTime::parse_from_str(
        datetime,
        "%Y-%m-%dT%H:%M:%S",
    )?)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlurmJobState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
    OutOfMemory,
    NodeFail,
    BootFail,
    Deadline,
    Other(String),
}

impl SlurmJobState {
    /// Slurm may append details to the state, e.g. `CANCELLED by 1000`, so the state is
    /// recognized by its prefix.
    pub fn parse(state: &str) -> Self {
        let state = state.trim();
        if state.starts_with("COMPLETED") {
            Self::Completed
        } else if state.starts_with("FAILED") {
            Self::Failed
        } else if state.starts_with("CANCELLED") {
            Self::Cancelled
        } else if state.starts_with("TIMEOUT") {
            Self::Timeout
        } else if state.starts_with("OUT_OF_MEMORY") {
            Self::OutOfMemory
        } else if state.starts_with("NODE_FAIL") {
            Self::NodeFail
        } else if state.starts_with("BOOT_FAIL") {
            Self::BootFail
        } else if state.starts_with("DEADLINE") {
            Self::Deadline
        } else if state.starts_with("PENDING") {
            Self::Pending
        } else if state.starts_with("RUNNING") || state.starts_with("COMPLETING") {
            Self::Running
        } else {
            Self::Other(state.to_string())
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed
                | Self::Failed
                | Self::Cancelled
                | Self::Timeout
                | Self::OutOfMemory
                | Self::NodeFail
                | Self::BootFail
                | Self::Deadline
        )
    }
}

impl Display for SlurmJobState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => f.write_str("PENDING"),
            Self::Running => f.write_str("RUNNING"),
            Self::Completed => f.write_str("COMPLETED"),
            Self::Failed => f.write_str("FAILED"),
            Self::Cancelled => f.write_str("CANCELLED"),
            Self::Timeout => f.write_str("TIMEOUT"),
            Self::OutOfMemory => f.write_str("OUT_OF_MEMORY"),
            Self::NodeFail => f.write_str("NODE_FAIL"),
            Self::BootFail => f.write_str("BOOT_FAIL"),
            Self::Deadline => f.write_str("DEADLINE"),
            Self::Other(state) => f.write_str(state),
        }
    }
}

/// Primary line of `sacct -n -P -o JobID,State,Start,End,NodeList` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SacctEntry {
    pub job_id: String,
    pub state: SlurmJobState,
    pub start: Option<String>,
    pub end: Option<String>,
    pub node: Option<String>,
}

impl SacctEntry {
    /// Wall-clock time between start and end, if both are known and parseable.
    pub fn duration(&self) -> anyhow::Result<Option<chrono::Duration>> {
        match (&self.start, &self.end) {
            (Some(start), Some(end)) => {
                let start = parse_slurm_datetime(start)
                    .map_err(|e| anyhow::anyhow!("Cannot parse start time {start}: {e}"))?;
                let end = parse_slurm_datetime(end)
                    .map_err(|e| anyhow::anyhow!("Cannot parse end time {end}: {e}"))?;
                Ok(Some(end - start))
            }
            _ => Ok(None),
        }
    }
}

fn parse_optional_field(value: &str, missing: &str) -> Option<String> {
    let value = value.trim();
    if value.is_empty() || value == missing {
        None
    } else {
        Some(value.to_string())
    }
}

/// Parses pipe-delimited `sacct` output and returns the line that belongs to the job itself.
///
/// Job steps (e.g. `3840.batch` or `3840.extern`) are ignored, as are empty or truncated
/// lines, which appear when the job has not reached the accounting database yet.
pub fn parse_sacct_output(output: &str) -> Option<SacctEntry> {
    output.lines().find_map(|line| {
        let parts: Vec<&str> = line.trim().split('|').collect();
        if parts.len() < 5 {
            return None;
        }
        let job_id = parts[0].trim();
        if job_id.is_empty() || job_id.contains('.') {
            return None;
        }
        Some(SacctEntry {
            job_id: job_id.to_string(),
            state: SlurmJobState::parse(parts[1]),
            start: parse_optional_field(parts[2], UNKNOWN_TIME),
            end: parse_optional_field(parts[3], UNKNOWN_TIME),
            node: parse_optional_field(parts[4], NO_NODE_ASSIGNED),
        })
    })
}

#[cfg(test)]
mod test {
    use crate::common::manager::slurm::{
        SlurmJobState, format_slurm_duration, parse_sacct_output, parse_slurm_datetime,
    };
    use std::time::Duration;

    #[test]
    fn test_parse_slurm_datetime() {
        let date = parse_slurm_datetime("2021-09-29T09:36:56").unwrap();
        assert_eq!(
            date.format("%d.%m.%Y %H:%M:%S").to_string(),
            "29.09.2021 09:36:56"
        );
        assert!(parse_slurm_datetime("2021-09-29 09:36:56").is_err());
    }

    #[test]
    fn test_format_slurm_duration() {
        assert_eq!(format_slurm_duration(&Duration::from_secs(45 * 60)), "00:45:00");
    }

    #[test]
    fn test_parse_state_prefix() {
        assert_eq!(SlurmJobState::parse("COMPLETED"), SlurmJobState::Completed);
        assert_eq!(
            SlurmJobState::parse("CANCELLED by 1000"),
            SlurmJobState::Cancelled
        );
        assert_eq!(SlurmJobState::parse("TIMEOUT"), SlurmJobState::Timeout);
        assert_eq!(SlurmJobState::parse("RUNNING"), SlurmJobState::Running);
        assert_eq!(
            SlurmJobState::parse("OUT_OF_MEMORY"),
            SlurmJobState::OutOfMemory
        );
        assert_eq!(
            SlurmJobState::parse("PREEMPTED"),
            SlurmJobState::Other("PREEMPTED".to_string())
        );
        for state in ["OUT_OF_MEMORY", "NODE_FAIL", "BOOT_FAIL", "DEADLINE"] {
            assert!(SlurmJobState::parse(state).is_terminal(), "state {state}");
        }
        assert!(!SlurmJobState::parse("PREEMPTED").is_terminal());
        assert!(SlurmJobState::parse("FAILED").is_terminal());
        assert!(!SlurmJobState::parse("PENDING").is_terminal());
        // Matching is case-sensitive
        assert!(!SlurmJobState::parse("completed").is_terminal());
    }

    #[test]
    fn test_parse_sacct_ignores_steps() {
        let output = "3840.batch|COMPLETED|2025-01-22T10:11:12|2025-01-22T10:16:30|node07
3840.extern|COMPLETED|2025-01-22T10:11:12|2025-01-22T10:16:30|node07
3840|COMPLETED|2025-01-22T10:11:12|2025-01-22T10:16:30|node07";
        let entry = parse_sacct_output(output).unwrap();
        assert_eq!(entry.job_id, "3840");
        assert_eq!(entry.state, SlurmJobState::Completed);
        assert_eq!(entry.node.as_deref(), Some("node07"));
        assert_eq!(entry.duration().unwrap().unwrap().num_seconds(), 318);
    }

    #[test]
    fn test_parse_sacct_pending_job() {
        let entry = parse_sacct_output("3841|PENDING|Unknown|Unknown|None assigned\n").unwrap();
        assert_eq!(entry.state, SlurmJobState::Pending);
        assert_eq!(entry.start, None);
        assert_eq!(entry.end, None);
        assert_eq!(entry.node, None);
        assert_eq!(entry.duration().unwrap(), None);
    }

    #[test]
    fn test_parse_sacct_empty_or_truncated() {
        assert_eq!(parse_sacct_output(""), None);
        assert_eq!(parse_sacct_output("\n\n"), None);
        assert_eq!(parse_sacct_output("3842|RUNNING"), None);
    }

    #[test]
    fn test_sacct_duration_invalid_time() {
        let entry = parse_sacct_output("3843|FAILED|garbage|2025-01-22T10:16:30|node01").unwrap();
        assert!(entry.duration().is_err());
    }
}
