//! Mapping of runner labels to the resources requested from Slurm.
//!
//! A label is either one of the fixed tiers (`slurm-runner-small`, ...) or a custom tier
//! with explicit values: `slurm-runner-<cpu>cpu-<mem>mempercpu[-<time>time][-<tmpdisk>tmpdisk]`.
//!
//! Units: memory is always in GiB (rendered as `<n>G` for Slurm), scratch disk is always
//! in MiB.
use std::fmt::{Display, Formatter};
use std::time::Duration;

use nom::Parser;
use nom::bytes::complete::tag;
use nom::character::complete::char;
use nom::combinator::{map, opt};
use nom::sequence::{preceded, terminated, tuple};
use thiserror::Error;

use crate::common::manager::slurm::format_slurm_duration;
use crate::common::parser::{NomResult, consume_all, p_u32, p_u64};
use crate::common::timeutils::p_slurm_time;

/// Prefix that marks labels of jobs that should be executed on Slurm.
pub const RUNNER_LABEL_PREFIX: &str = "slurm-runner";

/// Scratch disk size (MiB) of custom tiers that do not specify it.
pub const DEFAULT_TMPDISK_MIB: u64 = 4096;

/// Time limit of custom tiers that do not specify it.
pub const DEFAULT_TIME_LIMIT: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRequest {
    pub cpus: u32,
    /// GiB
    pub mem_per_cpu: u32,
    /// MiB
    pub tmpdisk: u64,
    pub time_limit: Duration,
}

impl ResourceRequest {
    const fn new(cpus: u32, mem_per_cpu: u32, tmpdisk: u64, time_limit_secs: u64) -> Self {
        Self {
            cpus,
            mem_per_cpu,
            tmpdisk,
            time_limit: Duration::from_secs(time_limit_secs),
        }
    }

    /// Value of the `--mem-per-cpu` Slurm option.
    pub fn mem_per_cpu_arg(&self) -> String {
        format!("{}G", self.mem_per_cpu)
    }

    /// Value of the `--time` Slurm option.
    pub fn time_limit_arg(&self) -> String {
        format_slurm_duration(&self.time_limit)
    }
}

impl Display for ResourceRequest {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "cpus={}, mem-per-cpu={}, tmpdisk={}MiB, time={}",
            self.cpus,
            self.mem_per_cpu_arg(),
            self.tmpdisk,
            self.time_limit_arg()
        )
    }
}

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;

const FIXED_TIERS: [(&str, ResourceRequest); 5] = [
    ("small", ResourceRequest::new(1, 2, 4096, 30 * MINUTE)),
    ("medium", ResourceRequest::new(2, 2, 8192, 30 * MINUTE)),
    ("large", ResourceRequest::new(4, 2, 16384, 30 * MINUTE)),
    ("xlarge", ResourceRequest::new(8, 2, 32768, 30 * MINUTE)),
    ("xlarge-long", ResourceRequest::new(8, 2, 32768, 8 * HOUR)),
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown resource tier `{label}`")]
pub struct UnknownTierError {
    pub label: String,
}

/// Returns true if the label is meant for runners provisioned by this service.
pub fn is_runner_label(label: &str) -> bool {
    label.starts_with(RUNNER_LABEL_PREFIX)
}

/// Name of the tier encoded in the label, i.e. the label without the runner prefix.
pub fn tier_name(label: &str) -> &str {
    label
        .strip_prefix(RUNNER_LABEL_PREFIX)
        .and_then(|rest| rest.strip_prefix('-'))
        .unwrap_or(label)
}

pub fn resolve(label: &str) -> Result<ResourceRequest, UnknownTierError> {
    let tier = tier_name(label);
    if let Some((_, request)) = FIXED_TIERS.iter().find(|(name, _)| *name == tier) {
        return Ok(request.clone());
    }
    match consume_all(p_custom_tier, tier) {
        Ok(request) if request.cpus > 0 && request.mem_per_cpu > 0 => Ok(request),
        Ok(_) => Err(UnknownTierError {
            label: label.to_string(),
        }),
        Err(error) => {
            log::debug!("Label {label} is not a custom tier: {error:?}");
            Err(UnknownTierError {
                label: label.to_string(),
            })
        }
    }
}

/// `<cpu>cpu-<mem>mempercpu[-<time>time][-<tmpdisk>tmpdisk]`
fn p_custom_tier(input: &str) -> NomResult<ResourceRequest> {
    map(
        tuple((
            terminated(p_u32, tag("cpu")),
            preceded(char('-'), terminated(p_u32, tag("mempercpu"))),
            opt(preceded(char('-'), terminated(p_slurm_time, tag("time")))),
            opt(preceded(char('-'), terminated(p_u64, tag("tmpdisk")))),
        )),
        |(cpus, mem_per_cpu, time_limit, tmpdisk)| ResourceRequest {
            cpus,
            mem_per_cpu,
            tmpdisk: tmpdisk.unwrap_or(DEFAULT_TMPDISK_MIB),
            time_limit: time_limit.unwrap_or(DEFAULT_TIME_LIMIT),
        },
    )
    .parse(input)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{ResourceRequest, UnknownTierError, is_runner_label, resolve, tier_name};

    fn request(cpus: u32, mem_per_cpu: u32, tmpdisk: u64, minutes: u64) -> ResourceRequest {
        ResourceRequest {
            cpus,
            mem_per_cpu,
            tmpdisk,
            time_limit: Duration::from_secs(minutes * 60),
        }
    }

    #[test]
    fn fixed_tiers() {
        let table = [
            ("slurm-runner-small", request(1, 2, 4096, 30)),
            ("slurm-runner-medium", request(2, 2, 8192, 30)),
            ("slurm-runner-large", request(4, 2, 16384, 30)),
            ("slurm-runner-xlarge", request(8, 2, 32768, 30)),
            ("slurm-runner-xlarge-long", request(8, 2, 32768, 8 * 60)),
            ("small", request(1, 2, 4096, 30)),
        ];
        for (label, expected) in table {
            assert_eq!(resolve(label).unwrap(), expected, "label {label}");
        }
    }

    #[test]
    fn small_tier_arguments() {
        let small = resolve("slurm-runner-small").unwrap();
        assert_eq!(small.mem_per_cpu_arg(), "2G");
        assert_eq!(small.time_limit_arg(), "00:30:00");
        assert_eq!(small.tmpdisk, 4096);
    }

    #[test]
    fn custom_tier_all_fields() {
        let resolved = resolve("slurm-runner-4cpu-2mempercpu-45:00time-8192tmpdisk").unwrap();
        assert_eq!(resolved, request(4, 2, 8192, 45));
        assert_eq!(resolved.mem_per_cpu_arg(), "2G");
        assert_eq!(resolved.time_limit_arg(), "00:45:00");
    }

    #[test]
    fn custom_tier_defaults() {
        assert_eq!(
            resolve("slurm-runner-2cpu-4mempercpu").unwrap(),
            request(2, 4, 4096, 30)
        );
        assert_eq!(
            resolve("slurm-runner-2cpu-4mempercpu-1:30:00time").unwrap(),
            request(2, 4, 4096, 90)
        );
        let resolved = resolve("slurm-runner-2cpu-2mempercpu-90time").unwrap();
        assert_eq!(resolved, request(2, 2, 4096, 90));
        assert_eq!(resolved.time_limit_arg(), "01:30:00");
        assert_eq!(
            resolve("slurm-runner-16cpu-1mempercpu-20000tmpdisk").unwrap(),
            request(16, 1, 20000, 30)
        );
    }

    #[test]
    fn unknown_tiers() {
        for label in [
            "slurm-runner-huge",
            "slurm-runner-",
            "slurm-runner-4cpu",
            "slurm-runner-4cpu-2mempercpu-",
            "slurm-runner-4cpu-2mempercpu-8192tmpdisk-45:00time",
            "slurm-runner-0cpu-2mempercpu",
            "slurm-runner-xcpu-2mempercpu",
            "ubuntu-latest",
        ] {
            assert_eq!(
                resolve(label),
                Err(UnknownTierError {
                    label: label.to_string()
                }),
                "label {label}"
            );
        }
    }

    #[test]
    fn runner_label_prefix() {
        assert!(is_runner_label("slurm-runner-small"));
        assert!(!is_runner_label("other-runner"));
        assert!(!is_runner_label("ubuntu-latest"));
        assert_eq!(tier_name("slurm-runner-small"), "small");
        assert_eq!(tier_name("medium"), "medium");
    }
}
