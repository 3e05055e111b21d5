use anyhow::Context;
use clap::Parser;
use sue_sim::{Cli, PerfLogger, SueSimConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = SueSimConfig::from_cli(cli)?;
    let params = cfg.resolve()?;
    info!(
        xpus = params.n_xpus,
        ports_per_xpu = params.ports_per_xpu,
        sues_per_xpu = params.sues_per_xpu,
        llr = params.enable_llr,
        cbfc = params.enable_link_cbfc,
        "configuration validated"
    );

    let logger = PerfLogger::new(&params.output_dir, params.stat_logging_enabled)
        .context("cannot create statistics sinks")?;
    let mut world = sue_sim::topology::build(params, logger);
    world.start_apps();
    let summary = world.run();
    world.report(&summary);
    Ok(())
}
