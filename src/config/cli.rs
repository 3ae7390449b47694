use clap::{Parser, Subcommand};
use log::LevelFilter;
use nodestatus::{ConditionStatus, NodeAddressType};
use std::path::PathBuf;

/// A program to inspect and patch the status of cluster nodes stored in etcd
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub(crate) struct Cli {
    /// etcd endpoint of the cluster's etcd instance
    #[clap(long)]
    pub(crate) etcd_endpoint: Option<String>,

    /// Name of a node to operate on. Can specify multiple, they are processed concurrently
    #[clap(long = "node", required = true)]
    pub(crate) nodes: Vec<String>,

    /// Read from etcd but keep every write in memory
    #[clap(long)]
    pub(crate) dry_run: bool,

    /// Number of tokio worker threads, defaults to one per core
    #[clap(long)]
    pub(crate) threads: Option<usize>,

    /// Maximum level of log messages to print (off, error, warn, info, debug, trace)
    #[clap(long, default_value = "info")]
    pub(crate) log_level: LevelFilter,

    /// Give up on a node if a single attempt takes longer than this
    #[clap(long, default_value_t = 30)]
    pub(crate) timeout_seconds: u64,

    /// How many times to re-read and retry a node after another writer got there first
    #[clap(long, default_value_t = 5)]
    pub(crate) max_conflict_retries: u32,

    /// Write a YAML summary of the run, including the logs, to this file
    #[clap(long)]
    pub(crate) summary_file: Option<PathBuf>,

    #[command(subcommand)]
    pub(crate) action: CliAction,
}

#[derive(Subcommand)]
pub(crate) enum CliAction {
    /// Print the node address of the most preferred type
    PreferredAddress {
        /// Address types in order of preference, e.g. --preference Hostname,InternalIP
        #[clap(long = "preference", value_delimiter = ',', required = true)]
        preferences: Vec<NodeAddressType>,
    },

    /// Print the IP the node is reachable on
    HostIp,

    /// Insert or update a status condition
    SetCondition {
        #[clap(long = "type")]
        condition_type: String,

        #[clap(long)]
        status: ConditionStatus,

        #[clap(long)]
        reason: Option<String>,

        #[clap(long)]
        message: Option<String>,
    },

    /// Set spec.podCIDR
    PatchCidr { cidr: String },
}
