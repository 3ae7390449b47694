use self::cli::{Cli, CliAction};
use anyhow::{bail, ensure, Context, Result};
use clap::Parser;
use log::LevelFilter;
use nodestatus::{ConditionStatus, NodeAddressType, NodeCondition};
use serde::Serialize;
use serde_json::Value;
use std::{env, path::PathBuf, str::FromStr};

mod cli;

const CONFIG_ENV_VAR: &str = "NODESTATUS_CONFIG";

/// What to do with each node
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum NodeAction {
    PreferredAddress(Vec<NodeAddressType>),
    HostIp,
    SetCondition(NodeCondition),
    PatchCidr(String),
}

impl From<CliAction> for NodeAction {
    fn from(action: CliAction) -> Self {
        match action {
            CliAction::PreferredAddress { preferences } => NodeAction::PreferredAddress(preferences),
            CliAction::HostIp => NodeAction::HostIp,
            CliAction::SetCondition {
                condition_type,
                status,
                reason,
                message,
            } => NodeAction::SetCondition(NodeCondition {
                reason,
                message,
                ..NodeCondition::new(&condition_type, status)
            }),
            CliAction::PatchCidr { cidr } => NodeAction::PatchCidr(cidr),
        }
    }
}

fn serialize_display<T: std::fmt::Display, S: serde::Serializer>(value: &T, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&value.to_string())
}

/// All parsed CLI arguments or config file entries, coalesced into a single struct for convenience
#[derive(Debug, Serialize)]
pub(crate) struct NodeStatusConfig {
    pub(crate) etcd_endpoint: String,
    pub(crate) nodes: Vec<String>,
    pub(crate) action: NodeAction,
    pub(crate) dry_run: bool,
    pub(crate) threads: Option<usize>,
    #[serde(serialize_with = "serialize_display")]
    pub(crate) log_level: LevelFilter,
    pub(crate) timeout_seconds: u64,
    pub(crate) max_conflict_retries: u32,
    pub(crate) summary_file: Option<PathBuf>,

    pub(crate) config_file_raw: Option<String>,
    pub(crate) cli_raw: Option<String>,
}

fn optional_string(value: &mut serde_json::Map<String, Value>, key: &str) -> Result<Option<String>> {
    Ok(match value.remove(key) {
        Some(value) => Some(value.as_str().context(format!("{key} must be a string"))?.to_string()),
        None => None,
    })
}

fn parse_action(value: Value) -> Result<NodeAction> {
    let action = value.as_object().context("action must be a YAML object")?;
    ensure!(action.len() == 1, "action must have exactly one entry, found {}", action.len());

    let (name, value) = action.iter().next().context("action is empty")?;

    Ok(match name.as_str() {
        "preferred_address" => NodeAction::PreferredAddress(
            value
                .as_array()
                .context("preferred_address must be an array")?
                .iter()
                .map(|value| {
                    let value = value.as_str().context("preferred_address must be an array of strings")?;
                    NodeAddressType::from_str(value).context(format!("unknown address type {value}"))
                })
                .collect::<Result<Vec<_>>>()?,
        ),
        "host_ip" => NodeAction::HostIp,
        "set_condition" => {
            let mut condition = value.as_object().context("set_condition must be a YAML object")?.clone();

            let condition_type = optional_string(&mut condition, "type")?.context("set_condition requires a type")?;
            let status = optional_string(&mut condition, "status")?.context("set_condition requires a status")?;
            let status = ConditionStatus::from_str(&status).context(format!("unknown condition status {status}"))?;
            let reason = optional_string(&mut condition, "reason")?;
            let message = optional_string(&mut condition, "message")?;

            ensure!(
                condition.is_empty(),
                "unknown keys {:?} in set_condition",
                condition.keys().map(|key| key.to_string()).collect::<Vec<String>>().join(", ")
            );

            NodeAction::SetCondition(NodeCondition {
                reason,
                message,
                ..NodeCondition::new(&condition_type, status)
            })
        }
        "patch_cidr" => NodeAction::PatchCidr(value.as_str().context("patch_cidr must be a string")?.to_string()),
        other => bail!("unknown action {other}"),
    })
}

impl NodeStatusConfig {
    pub(crate) fn parse_from_config_file(config_bytes: &[u8]) -> Result<Self> {
        let value: Value = serde_yaml::from_slice(config_bytes)?;

        let mut value = value.as_object().context("config file must be a YAML object")?.clone();

        let etcd_endpoint = optional_string(&mut value, "etcd_endpoint")?.context("etcd_endpoint is required")?;

        let nodes = match value.remove("nodes") {
            Some(value) => value
                .as_array()
                .context("nodes must be an array")?
                .iter()
                .map(|value| Ok(value.as_str().context("nodes must be an array of strings")?.to_string()))
                .collect::<Result<Vec<String>>>()?,
            None => vec![],
        };

        let action = parse_action(value.remove("action").context("action is required")?).context("parsing action")?;

        let dry_run = value
            .remove("dry_run")
            .unwrap_or(Value::Bool(false))
            .as_bool()
            .context("dry_run must be a boolean")?;

        let threads = match value.remove("threads") {
            Some(value) => Some(
                value
                    .as_u64()
                    .context("threads must be an integer")?
                    .try_into()
                    .context("threads must be an integer")?,
            ),
            None => None,
        };

        let log_level = match optional_string(&mut value, "log_level")? {
            Some(log_level) => LevelFilter::from_str(&log_level).context(format!("unknown log_level {log_level}"))?,
            None => LevelFilter::Info,
        };

        let timeout_seconds = value
            .remove("timeout_seconds")
            .unwrap_or(Value::from(30))
            .as_u64()
            .context("timeout_seconds must be an integer")?;

        let max_conflict_retries = value
            .remove("max_conflict_retries")
            .unwrap_or(Value::from(5))
            .as_u64()
            .context("max_conflict_retries must be an integer")?
            .try_into()
            .context("max_conflict_retries is too large")?;

        let summary_file = optional_string(&mut value, "summary_file")?.map(PathBuf::from);

        ensure!(
            value.is_empty(),
            "unknown keys {:?} in config file",
            value.keys().map(|key| key.to_string()).collect::<Vec<String>>().join(", ")
        );

        let config = Self {
            etcd_endpoint,
            nodes,
            action,
            dry_run,
            threads,
            log_level,
            timeout_seconds,
            max_conflict_retries,
            summary_file,

            cli_raw: None,
            config_file_raw: Some(String::from_utf8_lossy(config_bytes).to_string()),
        };

        config.validate()?;

        Ok(config)
    }

    pub(crate) fn parse_from_cli(cli: Cli) -> Result<Self> {
        let config = Self {
            etcd_endpoint: cli.etcd_endpoint.context("--etcd-endpoint is required")?,
            nodes: cli.nodes,
            action: NodeAction::from(cli.action),
            dry_run: cli.dry_run,
            threads: cli.threads,
            log_level: cli.log_level,
            timeout_seconds: cli.timeout_seconds,
            max_conflict_retries: cli.max_conflict_retries,
            summary_file: cli.summary_file,

            config_file_raw: None,
            cli_raw: Some(serde_json::to_string(&env::args().collect::<Vec<String>>())?),
        };

        config.validate()?;

        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        ensure!(!self.nodes.is_empty(), "at least one node is required");
        ensure!(self.nodes.iter().all(|node| !node.is_empty()), "node names must not be empty");
        ensure!(self.timeout_seconds > 0, "timeout_seconds must be positive");
        ensure!(self.threads != Some(0), "threads must be positive");

        if let NodeAction::PreferredAddress(preferences) = &self.action {
            ensure!(!preferences.is_empty(), "preferred_address needs at least one address type");
        }

        Ok(())
    }

    pub(crate) fn from_config_path(path: &str) -> Result<Self> {
        NodeStatusConfig::parse_from_config_file(&std::fs::read(path).context(format!("reading {CONFIG_ENV_VAR} file {path}"))?)
            .context(format!("parsing {CONFIG_ENV_VAR} file {path}"))
    }

    pub(crate) fn new() -> Result<NodeStatusConfig> {
        Ok(match env::var(CONFIG_ENV_VAR) {
            Ok(var) => {
                let num_args = env::args().len();

                ensure!(
                    num_args == 1,
                    "{CONFIG_ENV_VAR} is set, but there are {num_args} CLI arguments. {CONFIG_ENV_VAR} is meant to be used with no arguments."
                );

                NodeStatusConfig::from_config_path(&var)?
            }
            Err(_) => NodeStatusConfig::parse_from_cli(Cli::parse()).context("CLI parsing")?,
        })
    }
}
