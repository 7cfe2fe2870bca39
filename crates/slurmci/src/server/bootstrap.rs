use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use tokio::net::TcpListener;

use crate::SLURMCI_VERSION;
use crate::common::cli::RunOpts;
use crate::common::error::SlurmCiError;
use crate::github::{GithubClient, Repository};
use crate::server::autoalloc::queue::slurm::SlurmHandler;
use crate::server::autoalloc::{
    AllocationRegistry, Allocator, AllocatorConfig, Reconciler, discovery_process,
    reconciliation_process,
};
use crate::server::metrics::{Metrics, serve_metrics};

/// Contents of the configuration file.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(default)]
    repositories: Vec<RepositoryEntry>,
}

/// Repository in the configuration file. URLs default to the ones of github.com.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RepositoryEntry {
    name: String,
    api_base_url: Option<String>,
    repo_url: Option<String>,
}

impl From<RepositoryEntry> for Repository {
    fn from(entry: RepositoryEntry) -> Self {
        let defaults = Repository::from_name(&entry.name);
        Repository {
            name: entry.name,
            api_base_url: entry.api_base_url.unwrap_or(defaults.api_base_url),
            repo_url: entry.repo_url.unwrap_or(defaults.repo_url),
        }
    }
}

pub struct ControllerConfig {
    pub repositories: Vec<Repository>,
    pub github_token: String,
    pub allocation_script: PathBuf,
    pub sbatch_path: PathBuf,
    pub sacct_path: PathBuf,
    pub discovery_interval: Duration,
    pub reconcile_interval: Duration,
    pub network_timeout: Duration,
    pub command_timeout: Duration,
    pub metrics_port: Option<u16>,
    pub allocator: AllocatorConfig,
}

impl ControllerConfig {
    pub fn from_opts(opts: RunOpts) -> crate::Result<Self> {
        let mut repositories = match &opts.config {
            Some(path) => load_repositories(path)?,
            None => vec![],
        };
        repositories.extend(
            opts.repositories
                .iter()
                .map(|name| Repository::from_name(name)),
        );
        check_repositories(&repositories)?;

        if opts.github_token.trim().is_empty() {
            return Err(SlurmCiError::ConfigError(
                "GitHub access token must not be empty".to_string(),
            ));
        }

        Ok(Self {
            repositories,
            github_token: opts.github_token,
            allocation_script: opts.allocation_script,
            sbatch_path: opts.sbatch_path,
            sacct_path: opts.sacct_path,
            discovery_interval: opts.discovery_interval.unpack(),
            reconcile_interval: opts.reconcile_interval.unpack(),
            network_timeout: opts.network_timeout.unpack(),
            command_timeout: opts.command_timeout.unpack(),
            metrics_port: opts.metrics_port,
            allocator: AllocatorConfig {
                max_attempts: opts.max_allocation_attempts,
                ..Default::default()
            },
        })
    }
}

/// Loads monitored repositories from a TOML file:
///
/// ```toml
/// [[repositories]]
/// name = "owner/repo"
/// api_base_url = "https://github.example.com/api/v3/repos/owner/repo" # optional
/// repo_url = "https://github.example.com/owner/repo"                 # optional
/// ```
pub fn load_repositories(path: &Path) -> crate::Result<Vec<Repository>> {
    let content = std::fs::read_to_string(path).map_err(|error| {
        SlurmCiError::ConfigError(format!(
            "Cannot read configuration file {}: {error}",
            path.display()
        ))
    })?;
    let config: ConfigFile = toml::from_str(&content)?;
    Ok(config.repositories.into_iter().map(Repository::from).collect())
}

fn check_repositories(repositories: &[Repository]) -> crate::Result<()> {
    if repositories.is_empty() {
        return Err(SlurmCiError::ConfigError(
            "At least one repository has to be configured (use --repository or --config)"
                .to_string(),
        ));
    }
    for (index, repository) in repositories.iter().enumerate() {
        if repositories[..index]
            .iter()
            .any(|other| other.name == repository.name)
        {
            return Err(SlurmCiError::ConfigError(format!(
                "Repository {} is configured multiple times",
                repository.name
            )));
        }
    }
    Ok(())
}

/// Starts the discovery and the reconciliation loop (and optionally the metrics server).
/// Returns only if the controller cannot be started.
pub async fn run_controller(config: ControllerConfig) -> anyhow::Result<()> {
    let names: Vec<&str> = config
        .repositories
        .iter()
        .map(|repository| repository.name.as_str())
        .collect();
    log::info!(
        "Starting slurmci {SLURMCI_VERSION}, monitoring {}",
        names.join(", ")
    );

    let client = GithubClient::new(config.github_token, config.network_timeout)
        .context("Cannot create GitHub client")?;
    let handler = Rc::new(SlurmHandler::new(
        config.allocation_script,
        config.sbatch_path,
        config.sacct_path,
        config.command_timeout,
    ));
    let registry = Arc::new(AllocationRegistry::default());
    let metrics = Metrics::new()?;

    if let Some(port) = config.metrics_port {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))
            .await
            .with_context(|| format!("Cannot bind metrics port {port}"))?;
        let metrics = metrics.clone();
        tokio::spawn(async move {
            if let Err(error) = serve_metrics(metrics, listener).await {
                log::error!("{error:?}");
            }
        });
    }

    let allocator = Allocator::new(
        Rc::new(client),
        handler.clone(),
        registry.clone(),
        metrics.clone(),
        config.allocator,
    );
    let reconciler = Reconciler::new(handler, registry, metrics);

    tokio::join!(
        discovery_process(&allocator, config.repositories, config.discovery_interval),
        reconciliation_process(&reconciler, config.reconcile_interval),
    );
    Ok(())
}
