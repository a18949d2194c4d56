// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#[macro_use]
extern crate anyhow;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

mod client;
mod downloader;
mod fuzzer;
mod run;
mod uploader;

use run::WorkerOptions;

#[derive(Debug, Parser)]
#[command(name = "fleetfuzz-worker", about = "Runs a fleet of AFL fuzzers against a coordinator")]
struct Opt {
    /// The host:port address of the coordinator
    #[arg(long)]
    server_address: String,

    /// The number of fuzzers to run in parallel; -1 uses the CPU count
    #[arg(long, default_value_t = 1, allow_negative_numbers = true)]
    parallelism: i64,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let opt = Opt::parse();

    let opts = WorkerOptions {
        server_address: run::canonicalize_server_address(&opt.server_address),
        parallelism: run::effective_parallelism(opt.parallelism),
    };
    info!("coordinator address {}", opts.server_address);

    let workdir = std::env::current_dir().context("unable to read current dir")?;

    // A tree with an output/ dir is a run we are rejoining; its on-disk
    // state is authoritative if the coordinator proves unreachable.
    let is_new_run = !workdir.join("output").exists();
    if is_new_run {
        info!("starting a new run in {}", workdir.display());
    } else {
        info!("output dir already exists, assuming we're rejoining an existing run");
    }

    run::run_fleet(opts, workdir, is_new_run).await
}
