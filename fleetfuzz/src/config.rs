// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Fuzzer options the coordinator assembles from its own flags and serves
/// at `/config`; workers fetch this before spawning anything.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct FuzzerConfig {
    /// Download the target binary from the coordinator instead of running
    /// `command` from the local filesystem.
    pub use_binary: bool,
    /// Download `dict.txt` from the coordinator and pass it to `-x`.
    pub use_dict: bool,
    pub sync_interval_secs: u64,
    /// Target command tokens; only meaningful when `use_binary` is false.
    pub command: Vec<String>,
    /// Engine `-m` value; 0 leaves the engine default in place.
    pub mem_limit_mb: u64,
    /// Engine `-t` value; 0 leaves the engine default in place.
    pub timeout_ms: u64,
}

impl FuzzerConfig {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }
}
