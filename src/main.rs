use anyhow::{ensure, Context, Result};
use config::NodeStatusConfig;

mod config;
mod logging;
mod run;
mod runtime;

fn main() -> Result<()> {
    let config = NodeStatusConfig::new().context("parsing configuration")?;

    logging::init(config.log_level).context("initializing logging")?;

    log::info!("nodestatus version {}", env!("CARGO_PKG_VERSION"));

    let outcomes = runtime::prepare_tokio_runtime(config.threads)?.block_on(run::run(&config))?;

    for outcome in &outcomes {
        if let Some(output) = &outcome.output {
            println!("{}\t{}", outcome.node, output);
        }
    }

    logging::generate_summary(&config, &outcomes)?;

    let failures = outcomes.iter().filter(|outcome| outcome.error.is_some()).count();
    ensure!(failures == 0, "{} of {} node(s) failed", failures, outcomes.len());

    Ok(())
}
