use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tailhub::config::Config;
use tailhub::identity::AuthMode;
use tailhub::session::Query;
use tailhub::types::{ResourceSpec, TailFrom};

#[derive(Parser)]
#[command(name = "tailhub")]
#[command(about = "Tail and aggregate logs from Kubernetes pods with continuous discovery")]
pub struct Cli {
    /// Configuration file (YAML)
    #[arg(long, global = true, env = "TAILHUB_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Stream logs from pods, workloads or a label selector
    Logs(LogsArgs),
    /// Watch container log files on this node
    Files(FilesArgs),
}

#[derive(Args)]
pub struct LogsArgs {
    /// Resources to tail (pod name, or kind/name such as deployment/web)
    pub resources: Vec<String>,

    /// Namespaces (repeatable or comma separated)
    #[arg(short = 'n', long = "namespace", value_delimiter = ',')]
    pub namespaces: Vec<String>,

    /// Label selector
    #[arg(short = 'l', long)]
    pub selector: Option<String>,

    /// Container name (if multi-container pod)
    #[arg(short = 'c', long)]
    pub container: Option<String>,

    /// Kubeconfig context
    #[arg(long)]
    pub context: Option<String>,

    /// Number of lines to show from the end of the logs
    #[arg(long)]
    pub tail: Option<i64>,

    /// Stop once existing logs have been read
    #[arg(long)]
    pub no_follow: bool,

    /// Only print lines matching this regex
    #[arg(long)]
    pub grep: Option<String>,

    /// Bearer token to act as (token auth mode)
    #[arg(long, env = "TAILHUB_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// How callers are authenticated
    #[arg(long, value_enum)]
    pub auth_mode: Option<AuthMode>,

    /// End the whole stream when any source fails
    #[arg(long)]
    pub all_or_nothing: bool,

    /// Output buffer size
    #[arg(long)]
    pub buffer_size: Option<usize>,

    /// Read container log files on this node instead of the cluster API
    #[arg(long)]
    pub node_files: bool,

    /// Container log directory (with --node-files)
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Node name reported for local files
    #[arg(long)]
    pub node: Option<String>,
}

impl LogsArgs {
    /// Command line flags win over the config file.
    pub fn apply_to(&self, config: &mut Config) {
        if let Some(mode) = self.auth_mode {
            config.auth_mode = mode;
        }
        if let Some(size) = self.buffer_size {
            config.buffer_size = size.max(1);
        }
        if let Some(dir) = &self.log_dir {
            config.log_dir = dir.clone();
        }
        if let Some(node) = &self.node {
            config.node_name = Some(node.clone());
        }
    }

    pub fn query(&self) -> anyhow::Result<Query> {
        let mut targets = Vec::new();
        for res in &self.resources {
            let spec = ResourceSpec::parse(res)
                .map_err(|e| anyhow::anyhow!("Failed to parse resource '{}': {}", res, e))?;
            targets.push(spec);
        }
        if targets.is_empty() && self.selector.is_none() && !self.node_files {
            anyhow::bail!("Must specify at least one resource or a label selector (--selector)");
        }

        let namespaces = if self.namespaces.is_empty() {
            vec!["default".to_string()]
        } else {
            self.namespaces.clone()
        };
        Ok(Query {
            namespaces,
            targets,
            selector: self.selector.clone(),
            container: self.container.clone(),
            from: TailFrom::from_tail_lines(self.tail),
            follow: !self.no_follow,
        })
    }
}

#[derive(Args)]
pub struct FilesArgs {
    /// Namespaces (repeatable or comma separated)
    #[arg(short = 'n', long = "namespace", value_delimiter = ',', default_value = "default")]
    pub namespaces: Vec<String>,

    /// Container log directory
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Node name reported for local files
    #[arg(long)]
    pub node: Option<String>,

    /// Quiet window for modification events, in milliseconds
    #[arg(long)]
    pub debounce_ms: Option<u64>,

    /// Bearer token to act as (token auth mode)
    #[arg(long, env = "TAILHUB_TOKEN", hide_env_values = true)]
    pub token: Option<String>,
}

impl FilesArgs {
    pub fn apply_to(&self, config: &mut Config) {
        if let Some(dir) = &self.log_dir {
            config.log_dir = dir.clone();
        }
        if let Some(node) = &self.node {
            config.node_name = Some(node.clone());
        }
        if let Some(ms) = self.debounce_ms {
            config.debounce_ms = ms;
        }
    }
}
