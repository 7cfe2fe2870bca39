use std::path::PathBuf;

use clap::Parser;

use crate::common::setup::LogFormat;
use crate::common::timeutils::ArgDuration;
use crate::server::autoalloc::config::DEFAULT_MAX_ALLOCATION_ATTEMPTS;

// Common CLI options
#[derive(Parser)]
pub struct CommonOpts {
    /// Enables more detailed log output
    #[arg(
        long,
        env = "SLURMCI_DEBUG",
        global = true,
        help_heading("GLOBAL OPTIONS"),
        hide_short_help(true)
    )]
    pub debug: bool,

    /// Sets log output formatting
    #[arg(
        long,
        env = "SLURMCI_LOG_FORMAT",
        default_value_t = LogFormat::Text,
        value_enum,
        global = true,
        help_heading("GLOBAL OPTIONS"),
        hide_short_help(true)
    )]
    pub log_format: LogFormat,
}

// Root CLI options
#[derive(Parser)]
#[command(
    author,
    about,
    version(crate::SLURMCI_VERSION),
    disable_help_subcommand(true),
    help_expected(true)
)]
pub struct RootOptions {
    #[clap(flatten)]
    pub common: CommonOpts,

    #[clap(subcommand)]
    pub subcmd: SubCommand,
}

#[allow(clippy::large_enum_variant)]
#[derive(Parser)]
pub enum SubCommand {
    /// Start the controller that provisions runners for queued CI jobs
    Run(RunOpts),
    /// Show Slurm resources requested for runner labels
    Resolve(ResolveOpts),
}

#[derive(Parser)]
pub struct RunOpts {
    /// Path to a TOML file with monitored repositories
    #[arg(long, env = "SLURMCI_CONFIG", value_hint = clap::ValueHint::FilePath)]
    pub config: Option<PathBuf>,

    /// Monitored GitHub repository (`owner/name`), can be used multiple times
    #[arg(long = "repository", value_name = "OWNER/NAME")]
    pub repositories: Vec<String>,

    /// Token used to access the GitHub API
    #[arg(long, env = "GITHUB_ACCESS_TOKEN", hide_env_values = true)]
    pub github_token: String,

    /// Script submitted to Slurm that starts an ephemeral runner
    #[arg(
        long,
        env = "SLURMCI_ALLOCATION_SCRIPT",
        default_value = "/allocation_script/apptainer.sh",
        value_hint = clap::ValueHint::FilePath
    )]
    pub allocation_script: PathBuf,

    /// How often should queued jobs be discovered
    #[arg(long, default_value = "5s")]
    pub discovery_interval: ArgDuration,

    /// How often should submitted allocations be checked in Slurm accounting
    #[arg(long, default_value = "5s")]
    pub reconcile_interval: ArgDuration,

    /// Timeout of a single GitHub API request
    #[arg(long, default_value = "30s")]
    pub network_timeout: ArgDuration,

    /// Timeout of a single `sbatch` or `sacct` invocation
    #[arg(long, default_value = "60s")]
    pub command_timeout: ArgDuration,

    /// How many times is the allocation of a single job attempted before it is abandoned
    #[arg(
        long,
        default_value_t = DEFAULT_MAX_ALLOCATION_ATTEMPTS,
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    pub max_allocation_attempts: u32,

    /// Port where Prometheus metrics are served (`/metrics`)
    #[arg(long)]
    pub metrics_port: Option<u16>,

    /// Path to the `sbatch` binary
    #[arg(long, default_value = "sbatch")]
    pub sbatch_path: PathBuf,

    /// Path to the `sacct` binary
    #[arg(long, default_value = "sacct")]
    pub sacct_path: PathBuf,
}

#[derive(Parser)]
pub struct ResolveOpts {
    /// Runner labels, e.g. `slurm-runner-small` or `slurm-runner-4cpu-2mempercpu-45:00time`
    #[arg(required = true)]
    pub labels: Vec<String>,
}
