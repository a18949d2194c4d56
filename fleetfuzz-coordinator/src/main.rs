// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#[macro_use]
extern crate anyhow;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::{Parser, ValueEnum};
use fleetfuzz::config::FuzzerConfig;
use fleetfuzz::layout::FleetDirs;
use log::info;
use tokio::fs;

mod admin;
mod archive;
mod crashes;
mod metrics_poller;
mod reaper;
mod registry;
mod server;
mod util;

use archive::{Archiver, DiskArchiver, NullArchiver, S3Archiver, S3Options};
use registry::NodeRegistry;
use server::ServerContext;

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
enum ArchiveKind {
    Disk,
    S3,
}

#[derive(Debug, Parser)]
#[command(name = "fleetfuzz-coordinator", about = "Coordinator for a fleet of AFL workers")]
struct Opt {
    /// Port to listen on
    #[arg(long, default_value_t = 1414)]
    port: u16,

    /// The AFL workdir to store inputs and outputs in
    #[arg(long)]
    workdir: PathBuf,

    /// Path of the target binary to distribute to workers
    #[arg(long)]
    binary_path: Option<PathBuf>,

    /// Interval at which to publish node gauges; 0 disables
    #[arg(long, default_value_t = 0)]
    metrics_report_interval_secs: u64,

    /// Interval at which workers sync their work with the coordinator
    #[arg(long, default_value_t = 300)]
    fuzzer_sync_interval_secs: u64,

    /// The AFL memory limit, in MB; 0 leaves the engine default
    #[arg(long, default_value_t = 0)]
    mem_limit_mb: u64,

    /// The AFL timeout period, in ms; 0 leaves the engine default
    #[arg(long, default_value_t = 0)]
    timeout_ms: u64,

    /// Distribute dict.txt (stored alongside input/ and output/) to workers
    #[arg(long)]
    use_dict: bool,

    /// Kind of work archival to run
    #[arg(long, value_enum)]
    archive_type: Option<ArchiveKind>,

    /// Interval at which to archive work; 0 disables the scheduled runs
    #[arg(long, default_value_t = 0)]
    archive_interval_secs: u64,

    /// Root folder for disk archival
    #[arg(long)]
    archive_disk_root: Option<PathBuf>,

    /// Root key for S3 archival
    #[arg(long)]
    archive_s3_root_key: Option<String>,

    /// Bucket for S3 archival
    #[arg(long)]
    archive_s3_bucket: Option<String>,

    /// AWS region for S3 archival
    #[arg(long)]
    archive_s3_aws_region: Option<String>,

    /// S3 endpoint is a local development stand-in; requires credentials
    /// in the environment
    #[arg(long)]
    archive_s3_is_local: bool,

    /// Target command tokens, used when --binary-path is not given
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

impl Opt {
    fn validate(&mut self) -> Result<()> {
        self.workdir = absolutize(&self.workdir)?;

        if self.binary_path.is_some() && !self.command.is_empty() {
            bail!("a target command can only be given when --binary-path is not set");
        }

        match self.archive_type {
            Some(ArchiveKind::Disk) => {
                let root = self
                    .archive_disk_root
                    .as_ref()
                    .context("--archive-disk-root is required when archiving to disk")?;
                self.archive_disk_root = Some(absolutize(root)?);
            }
            Some(ArchiveKind::S3) => {
                for (value, flag) in [
                    (&self.archive_s3_root_key, "--archive-s3-root-key"),
                    (&self.archive_s3_bucket, "--archive-s3-bucket"),
                    (&self.archive_s3_aws_region, "--archive-s3-aws-region"),
                ] {
                    if value.is_none() {
                        bail!("{flag} is required when archiving to S3");
                    }
                }
            }
            None => {}
        }

        Ok(())
    }

    fn fuzzer_config(&self) -> FuzzerConfig {
        FuzzerConfig {
            use_binary: self.binary_path.is_some(),
            use_dict: self.use_dict,
            sync_interval_secs: self.fuzzer_sync_interval_secs,
            command: self.command.clone(),
            mem_limit_mb: self.mem_limit_mb,
            timeout_ms: self.timeout_ms,
        }
    }
}

/// Resolves a possibly-relative path against the current working dir,
/// without requiring the path to exist yet.
fn absolutize(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()
            .context("unable to read current dir")?
            .join(path))
    }
}

async fn build_archiver(opt: &Opt) -> Result<Arc<dyn Archiver>> {
    let archiver: Arc<dyn Archiver> = match opt.archive_type {
        None => Arc::new(NullArchiver),
        Some(ArchiveKind::Disk) => {
            // validate() guarantees the root is present.
            let root = opt.archive_disk_root.clone().unwrap_or_default();
            Arc::new(DiskArchiver::new(root).await?)
        }
        Some(ArchiveKind::S3) => Arc::new(
            S3Archiver::new(S3Options {
                root_key: opt.archive_s3_root_key.clone().unwrap_or_default(),
                bucket: opt.archive_s3_bucket.clone().unwrap_or_default(),
                region: opt.archive_s3_aws_region.clone().unwrap_or_default(),
                is_local: opt.archive_s3_is_local,
            })
            .await?,
        ),
    };
    Ok(archiver)
}

fn log_banner(opt: &Opt, config: &FuzzerConfig, target_len: usize) {
    info!("---- target details ----");
    info!("use binary?:\t{}", config.use_binary);
    info!("binary size:\t{}", target_len);
    info!("target command:\t{:?}", config.command);
    info!("sync interval:\t{}s", config.sync_interval_secs);
    info!("workdir:\t{}", opt.workdir.display());
    info!("dictionary:\t{}", config.use_dict);
    match opt.archive_type {
        Some(kind) => {
            info!("archive type:\t{:?}", kind);
            info!("archive interval:\t{}s", opt.archive_interval_secs);
        }
        None => info!("output archiving disabled"),
    }
    info!("--------");
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut opt = Opt::parse();
    opt.validate()?;

    let dirs = FleetDirs::new(&opt.workdir);
    dirs.create_input_dir().await?;
    dirs.create_output_dir().await?;

    let target = match &opt.binary_path {
        Some(path) => Bytes::from(
            fs::read(path)
                .await
                .with_context(|| format!("unable to load target binary: {}", path.display()))?,
        ),
        None => Bytes::new(),
    };

    let dict = if opt.use_dict {
        info!("reading dict path={}", dirs.dict_path().display());
        let dict = dirs.read_dict().await?;
        if dict.is_empty() {
            bail!("dict was empty: {}", dirs.dict_path().display());
        }
        info!("successfully read dict bytes={}", dict.len());
        Bytes::from(dict)
    } else {
        Bytes::new()
    };

    let fuzzer_config = opt.fuzzer_config();
    log_banner(&opt, &fuzzer_config, target.len());

    let archiver = build_archiver(&opt).await?;
    if opt.archive_type.is_some() && opt.archive_interval_secs > 0 {
        tokio::spawn(archive::archive_timestamped_forever(
            archiver.clone(),
            opt.workdir.clone(),
            Duration::from_secs(opt.archive_interval_secs),
        ));
    }

    let registry = Arc::new(NodeRegistry::new());
    tokio::spawn(reaper::run(registry.clone(), reaper::NODE_TTL));

    if opt.metrics_report_interval_secs > 0 {
        tokio::spawn(metrics_poller::run(
            registry.clone(),
            Duration::from_secs(opt.metrics_report_interval_secs),
        ));
    }

    let ctx = Arc::new(ServerContext {
        dirs,
        registry,
        archiver,
        fuzzer_config,
        target,
        dict,
    });

    server::serve(opt.port, ctx).await
}
