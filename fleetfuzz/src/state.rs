// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::corpus::InputCorpus;
use crate::id::FuzzerId;
use crate::layout::FuzzerDirs;
use crate::stats::FuzzerStats;

/// A fuzzer's output directory at one instant: its working queue plus the
/// crashes and hangs it has found so far.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct AflOutput {
    pub queue: InputCorpus,
    pub crashes: InputCorpus,
    pub hangs: InputCorpus,
}

/// The unit of worker-to-coordinator reporting: who we are, how we are
/// doing, and everything we have produced.
///
/// States are ephemeral on the worker (read, serialized, discarded) and
/// long-lived on the coordinator, where writing one to disk recreates the
/// fuzzer's directory tree exactly.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct FuzzerState {
    pub id: FuzzerId,
    pub stats: FuzzerStats,
    pub output: AflOutput,
}

impl FuzzerState {
    /// Reads a state off disk. The result is only a coherent snapshot if
    /// the owning fuzzer process is paused (or gone) for the duration of
    /// the read; that is the caller's job, which keeps this usable against
    /// synthetic directories in tests.
    pub async fn read(dirs: &FuzzerDirs) -> Result<Self> {
        let id = dirs
            .fuzzer_id()
            .ok_or_else(|| format_err!("cannot read fuzzer state without a fuzzer id"))?
            .clone();

        let output = dirs.read_output().await?;
        let stats = dirs.read_stats().await?;

        Ok(FuzzerState { id, stats, output })
    }
}
