use clap::Parser;

use slurmci::common::cli::{ResolveOpts, RootOptions, RunOpts, SubCommand};
use slurmci::common::setup::setup_logging;
use slurmci::server::autoalloc::resources::{resolve, tier_name};
use slurmci::server::bootstrap::{ControllerConfig, run_controller};

async fn command_run(opts: RunOpts) -> anyhow::Result<()> {
    let config = ControllerConfig::from_opts(opts)?;
    run_controller(config).await
}

fn command_resolve(opts: ResolveOpts) -> anyhow::Result<()> {
    for label in &opts.labels {
        let resources = resolve(label)?;
        println!("{}: {resources}", tier_name(label));
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> slurmci::Result<()> {
    let opts = RootOptions::parse();

    setup_logging(opts.common.debug, opts.common.log_format);

    let result = match opts.subcmd {
        SubCommand::Run(opts) => command_run(opts).await,
        SubCommand::Resolve(opts) => command_resolve(opts),
    };

    if let Err(e) = result {
        log::error!("{e:?}");
        std::process::exit(1);
    }

    Ok(())
}
