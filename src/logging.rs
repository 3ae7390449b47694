use crate::{config::NodeStatusConfig, run::NodeOutcome};
use anyhow::{bail, Context, Result};
use fn_error_context::context;
use lazy_static::lazy_static;
use log::{LevelFilter, Metadata, Record};
use std::sync::{Arc, Mutex};

struct NodeStatusLogger;

static LOGGER: NodeStatusLogger = NodeStatusLogger;

pub(crate) fn init(level: LevelFilter) -> Result<()> {
    match log::set_logger(&LOGGER) {
        Ok(_) => log::set_max_level(level),
        Err(_) => bail!("Logger initalization failed"),
    };

    Ok(())
}

lazy_static! {
    pub(crate) static ref LOG_RECORDS: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
}

impl log::Log for NodeStatusLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let log_string = format!(
                "{} - {} - {}:{}: {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                record.args()
            );

            {
                let mut log_records = match LOG_RECORDS.lock() {
                    Ok(log_records) => log_records,
                    Err(err) => {
                        eprintln!("Failed to lock log records: {}", err);
                        return;
                    }
                };
                log_records.push(log_string.clone());
            }

            // stdout is reserved for command results
            eprintln!("{}", log_string);
        }
    }

    fn flush(&self) {}
}

#[derive(serde::Serialize)]
struct Summary<'a> {
    config: &'a NodeStatusConfig,
    outcomes: &'a [NodeOutcome],
    logs: Vec<String>,
}

#[context("generating summary")]
pub(crate) fn generate_summary(config: &NodeStatusConfig, outcomes: &[NodeOutcome]) -> Result<()> {
    let summary_file = match &config.summary_file {
        Some(summary_file) => summary_file,
        None => return Ok(()),
    };

    let logs = match LOG_RECORDS.lock() {
        Ok(logs) => logs.clone(),
        Err(err) => {
            vec![format!("Failed to lock log records: {}", err)]
        }
    };

    let summary = Summary { config, outcomes, logs };

    let summary_file = std::fs::File::create(summary_file).context(format!("opening summary file {} for writing", summary_file.display()))?;
    serde_yaml::to_writer(summary_file, &summary).context("serializing summary")?;

    Ok(())
}
