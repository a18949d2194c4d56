// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Fleet runner: fetches the run's configuration and materials from the
//! coordinator, then keeps N supervised fuzzers and their sync machinery
//! going.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use fleetfuzz::config::FuzzerConfig;
use fleetfuzz::layout::FleetDirs;
use log::{info, warn};
use tokio::task::JoinSet;

use crate::client::CoordinatorClient;
use crate::downloader::QueueDownloader;
use crate::fuzzer::FuzzerCommand;
use crate::uploader::StateUploader;

pub struct WorkerOptions {
    pub server_address: String,
    pub parallelism: usize,
}

/// The wire protocol is plain HTTP; accept bare `host:port` addresses.
pub fn canonicalize_server_address(address: &str) -> String {
    if address.starts_with("http://") || address.starts_with("https://") {
        address.to_owned()
    } else {
        format!("http://{address}")
    }
}

/// `-1` means one fuzzer per CPU.
pub fn effective_parallelism(requested: i64) -> usize {
    match requested {
        -1 => {
            let cpus = num_cpus::get();
            info!("parallelism not set - defaulting to {cpus} (num CPUs)");
            cpus
        }
        n if n >= 1 => n as usize,
        _ => 1,
    }
}

pub async fn run_fleet(opts: WorkerOptions, workdir: PathBuf, is_new_run: bool) -> Result<()> {
    let client = Arc::new(CoordinatorClient::new(opts.server_address)?);

    let mut fuzzer_config = client
        .fetch_fuzzer_config()
        .await
        .context("unable to fetch fuzzer config")?;

    if let Ok(secs) = std::env::var("SHORT_INTERVAL") {
        let secs: u64 = secs
            .parse()
            .context("SHORT_INTERVAL must be a number of seconds")?;
        warn!("SHORT_INTERVAL set - overriding sync interval secs={secs}");
        fuzzer_config.sync_interval_secs = secs;
    }

    let dirs = FleetDirs::new(&workdir);

    let target_command = fetch_target_command(&client, &dirs, &fuzzer_config, is_new_run).await?;
    if target_command.is_empty() {
        bail!("coordinator supplied no target command");
    }

    let dict_path = fetch_dict(&client, &dirs, &fuzzer_config).await?;

    dirs.create_input_dir().await?;
    match client.fetch_inputs().await {
        Ok(inputs) => {
            info!("downloaded seed inputs n_inputs={}", inputs.len());
            dirs.write_inputs(&inputs).await?;
        }
        Err(err) if is_new_run => {
            return Err(err.context("unable to fetch seed inputs"));
        }
        Err(err) => {
            warn!("unable to fetch seed inputs; trusting the existing tree err={:#}", err);
        }
    }

    let sync_interval = fuzzer_config.sync_interval();
    info!(
        "target command:\t{:?}",
        target_command
    );
    info!("parallelism:\t{}", opts.parallelism);
    info!("uploading work to the coordinator every {:?}", sync_interval);

    // Fill the local tree with the fleet's queues before the first engine
    // starts, then keep pulling in the background. One downloader serves
    // every fuzzer on this machine.
    let downloader = QueueDownloader::new(client.clone(), dirs.clone(), sync_interval);
    downloader.download_queues().await;
    tokio::spawn(async move { downloader.run().await });

    let mut fuzzers = JoinSet::new();
    for n in 0..opts.parallelism {
        fuzzers.spawn(run_one_fuzzer(
            n,
            client.clone(),
            workdir.clone(),
            target_command.clone(),
            dict_path.clone(),
            fuzzer_config.clone(),
            sync_interval,
        ));
    }

    while let Some(joined) = fuzzers.join_next().await {
        joined.context("fuzzer task panicked")??;
    }

    Ok(())
}

async fn fetch_target_command(
    client: &CoordinatorClient,
    dirs: &FleetDirs,
    config: &FuzzerConfig,
    is_new_run: bool,
) -> Result<Vec<String>> {
    if !config.use_binary {
        info!("not downloading target binary from coordinator");
        return Ok(config.command.clone());
    }

    let target_path = dirs.base().join("target");
    info!("downloading target binary from coordinator");
    match client.fetch_target_binary(&target_path).await {
        Ok(()) => {}
        Err(err) if is_new_run => {
            return Err(err.context("unable to fetch target binary"));
        }
        Err(err) => {
            // A rejoining worker takes the tree it already has as
            // authoritative.
            warn!("unable to fetch target binary; trusting the existing tree err={:#}", err);
        }
    }

    Ok(vec![target_path.display().to_string()])
}

async fn fetch_dict(
    client: &CoordinatorClient,
    dirs: &FleetDirs,
    config: &FuzzerConfig,
) -> Result<Option<PathBuf>> {
    if !config.use_dict {
        info!("not downloading dict from coordinator because use_dict is false");
        return Ok(None);
    }

    info!("downloading dict from coordinator");
    let dict = client.fetch_dict().await.context("unable to fetch dict")?;
    if dict.is_empty() {
        bail!("coordinator returned an empty dict");
    }

    dirs.write_dict(&dict).await?;
    info!(
        "wrote dict path={} bytes={}",
        dirs.dict_path().display(),
        dict.len()
    );

    Ok(Some(dirs.dict_path()))
}

async fn run_one_fuzzer(
    n: usize,
    client: Arc<CoordinatorClient>,
    workdir: PathBuf,
    target_command: Vec<String>,
    dict_path: Option<PathBuf>,
    config: FuzzerConfig,
    sync_interval: Duration,
) -> Result<()> {
    let command = FuzzerCommand::new(
        &workdir,
        &target_command,
        dict_path.as_deref(),
        config.timeout_ms,
        config.mem_limit_mb,
    )?;
    info!("initialized fuzzer n={} id={}", n, command.id());

    command.dirs().create_input_dir().await?;
    command.dirs().create_output_dirs().await?;

    let fuzzer = Arc::new(command.spawn().await?);

    let uploader = Arc::new(StateUploader::new(
        fuzzer.clone(),
        client,
        sync_interval,
    ));
    let upload_task = tokio::spawn({
        let uploader = uploader.clone();
        async move { uploader.run().await }
    });

    let status = fuzzer.wait().await?;
    upload_task.abort();

    // Ship whatever the engine managed to produce before it went away.
    info!("fuzzer exited id={} status={}", fuzzer.id(), status);
    uploader.upload_state().await;

    if !status.success() {
        bail!("fuzzer {} exited with {}", fuzzer.id(), status);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_canonicalize_server_address() {
        assert_eq!(
            canonicalize_server_address("coordinator:1414"),
            "http://coordinator:1414"
        );
        assert_eq!(
            canonicalize_server_address("http://coordinator:1414"),
            "http://coordinator:1414"
        );
        assert_eq!(
            canonicalize_server_address("https://coordinator:1414"),
            "https://coordinator:1414"
        );
    }

    #[test]
    fn test_effective_parallelism() {
        assert_eq!(effective_parallelism(4), 4);
        assert_eq!(effective_parallelism(1), 1);
        assert_eq!(effective_parallelism(0), 1);
        assert_eq!(effective_parallelism(-1), num_cpus::get());
    }
}
