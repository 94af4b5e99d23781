//! CLI arguments and the resource-config file.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::fs;
use std::path::{Path, PathBuf};

/// Command line options for the scheduler daemon.
#[derive(Parser, Debug, Clone)]
#[command(about = "Per-GPU quota scheduler daemon", version)]
pub struct DaemonArgs {
    #[arg(
        short = 'P',
        long,
        env = "VGPU_SCHED_PORT",
        default_value = "50051",
        help = "TCP port to listen on"
    )]
    pub port: u16,

    #[arg(
        short = 'q',
        long,
        default_value = "250.0",
        help = "Default time quota in ms, used when a client reports no burst"
    )]
    pub quota: f64,

    #[arg(
        short = 'm',
        long = "min_quota",
        alias = "min-quota",
        default_value = "100.0",
        help = "Lower bound for adaptively computed quotas, in ms"
    )]
    pub min_quota: f64,

    #[arg(
        short = 'w',
        long,
        default_value = "1000.0",
        help = "Sliding usage window size in ms"
    )]
    pub window: f64,

    #[arg(
        short = 'f',
        long = "limit_file",
        alias = "limit-file",
        default_value = "resource-config.txt",
        help = "Name of the resource-config file inside the watched directory"
    )]
    pub limit_file: String,

    #[arg(
        short = 'p',
        long = "limit_file_dir",
        alias = "limit-file-dir",
        env = "VGPU_SCHED_LIMIT_FILE_DIR",
        default_value = ".",
        value_hint = clap::ValueHint::DirPath,
        help = "Directory watched for resource-config updates"
    )]
    pub limit_file_dir: PathBuf,

    #[arg(
        long = "log_file",
        alias = "log-file",
        env = "VGPU_SCHED_LOG_FILE",
        default_value = "vgpu-scheduler.log",
        value_hint = clap::ValueHint::FilePath,
        help = "Path of the appended log file"
    )]
    pub log_file: PathBuf,

    #[arg(short = 'v', long, default_value = "0", help = "Verbosity level (0-2)")]
    pub verbose: u8,
}

impl DaemonArgs {
    /// Full path of the resource-config file.
    pub fn limit_file_path(&self) -> PathBuf {
        self.limit_file_dir.join(&self.limit_file)
    }
}

/// Process-wide scheduling parameters fixed at startup.
#[derive(Debug, Clone, Copy)]
pub struct SchedParams {
    /// Default per-grant quota in ms.
    pub quota: f64,
    /// Lower bound for adaptive quotas in ms.
    pub min_quota: f64,
    /// Sliding window size in ms.
    pub window: f64,
}

impl From<&DaemonArgs> for SchedParams {
    fn from(args: &DaemonArgs) -> Self {
        Self {
            quota: args.quota,
            min_quota: args.min_quota,
            window: args.window,
        }
    }
}

/// One record of the resource-config file.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientLimits {
    pub name: String,
    /// Required share of the window (0..1).
    pub min_fraction: f64,
    /// Permitted share of the window (0..1).
    pub max_fraction: f64,
    /// SM percentage consumed while holding a token (0..100).
    pub sm_partition: u32,
    /// Memory limit in bytes.
    pub mem_limit: u64,
}

/// Parse the resource-config file: an integer N followed by N whitespace
/// delimited records of `name min_frac max_frac sm_partition mem_bytes`.
pub fn load_resource_config(path: &Path) -> Result<Vec<ClientLimits>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to open resource config {}", path.display()))?;
    parse_resource_config(&text)
        .with_context(|| format!("malformed resource config {}", path.display()))
}

fn parse_resource_config(text: &str) -> Result<Vec<ClientLimits>> {
    let mut fields = text.split_whitespace();

    let count: usize = fields
        .next()
        .context("missing client count")?
        .parse()
        .context("client count is not an integer")?;

    let mut limits = Vec::with_capacity(count);
    for i in 0..count {
        let mut field = |what: &str| {
            fields
                .next()
                .with_context(|| format!("record {i}: missing {what}"))
        };

        let name = field("name")?.to_string();
        let min_fraction: f64 = field("min fraction")?
            .parse()
            .with_context(|| format!("record {i}: bad min fraction"))?;
        let max_fraction: f64 = field("max fraction")?
            .parse()
            .with_context(|| format!("record {i}: bad max fraction"))?;
        let sm_partition: u32 = field("sm partition")?
            .parse()
            .with_context(|| format!("record {i}: bad sm partition"))?;
        let mem_limit: u64 = field("memory limit")?
            .parse()
            .with_context(|| format!("record {i}: bad memory limit"))?;

        if !(0.0..=1.0).contains(&min_fraction) || !(0.0..=1.0).contains(&max_fraction) {
            bail!("record {i} ({name}): fractions must lie in 0..1");
        }
        if sm_partition > 100 {
            bail!("record {i} ({name}): sm partition must lie in 0..100");
        }

        limits.push(ClientLimits {
            name,
            min_fraction,
            max_fraction,
            sm_partition,
            mem_limit,
        });
    }

    Ok(limits)
}
