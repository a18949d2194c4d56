// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Parsing for the line-oriented `fuzzer_stats` file that afl-fuzz drops in
//! its output directory. The format is `key<spaces>: value`, one pair per
//! line. Newer engine versions add keys (`stability`, ...); those are
//! ignored so the parser keeps working across engine upgrades. Missing any
//! of the required keys is an error so dashboards never show half-filled
//! records.

use std::fmt::Write;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum StatsError {
    #[error("stats file is missing required fields")]
    Incomplete,

    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

/// One snapshot of a fuzzer's self-reported progress.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct FuzzerStats {
    pub start_time: u64,
    pub last_update: u64,
    pub fuzzer_pid: u64,
    pub cycles_done: u64,
    pub execs_done: u64,
    pub execs_per_sec: f64,
    pub paths_total: u64,
    pub paths_favored: u64,
    pub paths_found: u64,
    pub paths_imported: u64,
    pub max_depth: u64,
    pub cur_path: u64,
    pub pending_favs: u64,
    pub pending_total: u64,
    pub variable_paths: u64,
    pub bitmap_cvg: f64,
    pub unique_crashes: u64,
    pub unique_hangs: u64,
    pub last_path: u64,
    pub last_crash: u64,
    pub last_hang: u64,
    pub exec_timeout: u64,
    pub afl_banner: String,
    pub afl_version: String,
    pub command_line: String,
}

const FIELD_COUNT: u32 = 25;
const ALL_FIELDS: u32 = (1 << FIELD_COUNT) - 1;

impl FuzzerStats {
    /// Parses the full text of a `fuzzer_stats` file.
    pub fn parse(text: &str) -> Result<Self, StatsError> {
        let mut stats = FuzzerStats::default();
        let mut covered = 0u32;

        for line in text.lines() {
            if line.is_empty() {
                continue;
            }
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let key = key.trim();
            let value = value.trim();

            match key {
                "start_time" => {
                    stats.start_time = parse_u64(key, value)?;
                    covered |= 1 << 0;
                }
                "last_update" => {
                    stats.last_update = parse_u64(key, value)?;
                    covered |= 1 << 1;
                }
                "fuzzer_pid" => {
                    stats.fuzzer_pid = parse_u64(key, value)?;
                    covered |= 1 << 2;
                }
                "cycles_done" => {
                    stats.cycles_done = parse_u64(key, value)?;
                    covered |= 1 << 3;
                }
                "execs_done" => {
                    stats.execs_done = parse_u64(key, value)?;
                    covered |= 1 << 4;
                }
                "execs_per_sec" => {
                    stats.execs_per_sec = parse_f64(key, value)?;
                    covered |= 1 << 5;
                }
                "paths_total" => {
                    stats.paths_total = parse_u64(key, value)?;
                    covered |= 1 << 6;
                }
                "paths_favored" => {
                    stats.paths_favored = parse_u64(key, value)?;
                    covered |= 1 << 7;
                }
                "paths_found" => {
                    stats.paths_found = parse_u64(key, value)?;
                    covered |= 1 << 8;
                }
                "paths_imported" => {
                    stats.paths_imported = parse_u64(key, value)?;
                    covered |= 1 << 9;
                }
                "max_depth" => {
                    stats.max_depth = parse_u64(key, value)?;
                    covered |= 1 << 10;
                }
                "cur_path" => {
                    stats.cur_path = parse_u64(key, value)?;
                    covered |= 1 << 11;
                }
                "pending_favs" => {
                    stats.pending_favs = parse_u64(key, value)?;
                    covered |= 1 << 12;
                }
                "pending_total" => {
                    stats.pending_total = parse_u64(key, value)?;
                    covered |= 1 << 13;
                }
                "variable_paths" => {
                    stats.variable_paths = parse_u64(key, value)?;
                    covered |= 1 << 14;
                }
                "bitmap_cvg" => {
                    let value = value.strip_suffix('%').unwrap_or(value);
                    stats.bitmap_cvg = parse_f64(key, value)?;
                    covered |= 1 << 15;
                }
                "unique_crashes" => {
                    stats.unique_crashes = parse_u64(key, value)?;
                    covered |= 1 << 16;
                }
                "unique_hangs" => {
                    stats.unique_hangs = parse_u64(key, value)?;
                    covered |= 1 << 17;
                }
                "last_path" => {
                    stats.last_path = parse_u64(key, value)?;
                    covered |= 1 << 18;
                }
                "last_crash" => {
                    stats.last_crash = parse_u64(key, value)?;
                    covered |= 1 << 19;
                }
                "last_hang" => {
                    stats.last_hang = parse_u64(key, value)?;
                    covered |= 1 << 20;
                }
                "exec_timeout" => {
                    stats.exec_timeout = parse_u64(key, value)?;
                    covered |= 1 << 21;
                }
                "afl_banner" => {
                    stats.afl_banner = value.to_owned();
                    covered |= 1 << 22;
                }
                "afl_version" => {
                    stats.afl_version = value.to_owned();
                    covered |= 1 << 23;
                }
                "command_line" => {
                    stats.command_line = value.to_owned();
                    covered |= 1 << 24;
                }
                // Unknown keys come from newer engine versions.
                _ => {}
            }
        }

        if covered != ALL_FIELDS {
            return Err(StatsError::Incomplete);
        }

        Ok(stats)
    }

    /// Re-emits the engine's own line format. Useful for seeding synthetic
    /// workdirs and for checking that parsing is lossless.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let mut line = |key: &str, value: String| {
            let _ = writeln!(out, "{:<15}: {}", key, value);
        };

        line("start_time", self.start_time.to_string());
        line("last_update", self.last_update.to_string());
        line("fuzzer_pid", self.fuzzer_pid.to_string());
        line("cycles_done", self.cycles_done.to_string());
        line("execs_done", self.execs_done.to_string());
        line("execs_per_sec", self.execs_per_sec.to_string());
        line("paths_total", self.paths_total.to_string());
        line("paths_favored", self.paths_favored.to_string());
        line("paths_found", self.paths_found.to_string());
        line("paths_imported", self.paths_imported.to_string());
        line("max_depth", self.max_depth.to_string());
        line("cur_path", self.cur_path.to_string());
        line("pending_favs", self.pending_favs.to_string());
        line("pending_total", self.pending_total.to_string());
        line("variable_paths", self.variable_paths.to_string());
        line("bitmap_cvg", format!("{}%", self.bitmap_cvg));
        line("unique_crashes", self.unique_crashes.to_string());
        line("unique_hangs", self.unique_hangs.to_string());
        line("last_path", self.last_path.to_string());
        line("last_crash", self.last_crash.to_string());
        line("last_hang", self.last_hang.to_string());
        line("exec_timeout", self.exec_timeout.to_string());
        line("afl_banner", self.afl_banner.clone());
        line("afl_version", self.afl_version.clone());
        line("command_line", self.command_line.clone());

        out
    }
}

fn parse_u64(key: &str, value: &str) -> Result<u64, StatsError> {
    value.parse().map_err(|_| StatsError::InvalidValue {
        key: key.to_owned(),
        value: value.to_owned(),
    })
}

fn parse_f64(key: &str, value: &str) -> Result<f64, StatsError> {
    value.parse().map_err(|_| StatsError::InvalidValue {
        key: key.to_owned(),
        value: value.to_owned(),
    })
}

#[cfg(test)]
pub mod fixture {
    use super::FuzzerStats;

    pub const STATS: &str = "\
start_time     : 1457551917
last_update    : 1457570256
fuzzer_pid     : 93363
cycles_done    : 0
execs_done     : 174753
execs_per_sec  : 9.31
paths_total    : 1464
paths_favored  : 141
paths_found    : 1463
paths_imported : 90
max_depth      : 3
cur_path       : 98
pending_favs   : 142
pending_total  : 1462
variable_paths : 49
bitmap_cvg     : 4.04%
unique_crashes : 59
unique_hangs   : 10
last_path      : 1457566053
last_crash     : 10
last_hang      : 1457567010
exec_timeout   : 160
afl_banner     : fuzz
afl_version    : 1.96b
command_line   : afl-fuzz -i input -o output -- ./fuzz
";

    pub fn stats() -> FuzzerStats {
        FuzzerStats::parse(STATS).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::fixture::STATS;
    use super::*;

    #[test]
    fn test_parse_complete_stats() {
        let stats = FuzzerStats::parse(STATS).unwrap();

        assert_eq!(stats.start_time, 1457551917);
        assert_eq!(stats.last_update, 1457570256);
        assert_eq!(stats.fuzzer_pid, 93363);
        assert_eq!(stats.cycles_done, 0);
        assert_eq!(stats.execs_done, 174753);
        assert_eq!(stats.execs_per_sec, 9.31);
        assert_eq!(stats.paths_total, 1464);
        assert_eq!(stats.paths_favored, 141);
        assert_eq!(stats.paths_found, 1463);
        assert_eq!(stats.paths_imported, 90);
        assert_eq!(stats.max_depth, 3);
        assert_eq!(stats.cur_path, 98);
        assert_eq!(stats.pending_favs, 142);
        assert_eq!(stats.pending_total, 1462);
        assert_eq!(stats.variable_paths, 49);
        assert_eq!(stats.bitmap_cvg, 4.04);
        assert_eq!(stats.unique_crashes, 59);
        assert_eq!(stats.unique_hangs, 10);
        assert_eq!(stats.last_path, 1457566053);
        assert_eq!(stats.last_crash, 10);
        assert_eq!(stats.last_hang, 1457567010);
        assert_eq!(stats.exec_timeout, 160);
        assert_eq!(stats.afl_banner, "fuzz");
        assert_eq!(stats.afl_version, "1.96b");
        assert_eq!(stats.command_line, "afl-fuzz -i input -o output -- ./fuzz");
    }

    #[test]
    fn test_extraneous_keys_are_ignored() {
        let text = format!("{}stability      : 99.9\nbutts_lol      : 9.31\n", STATS);

        let stats = FuzzerStats::parse(&text).unwrap();

        assert_eq!(stats, FuzzerStats::parse(STATS).unwrap());
    }

    #[test]
    fn test_missing_field_is_incomplete() {
        for required in ["max_depth", "command_line", "bitmap_cvg"] {
            let text: String = STATS
                .lines()
                .filter(|line| !line.starts_with(required))
                .map(|line| format!("{}\n", line))
                .collect();

            let err = FuzzerStats::parse(&text).unwrap_err();

            assert_eq!(err, StatsError::Incomplete);
        }
    }

    #[test]
    fn test_invalid_value_names_the_field() {
        let text = STATS.replace("execs_done     : 174753", "execs_done     : lots");

        let err = FuzzerStats::parse(&text).unwrap_err();

        assert_eq!(
            err,
            StatsError::InvalidValue {
                key: "execs_done".into(),
                value: "lots".into(),
            }
        );
    }

    #[test]
    fn test_empty_input_is_incomplete() {
        assert_eq!(FuzzerStats::parse("").unwrap_err(), StatsError::Incomplete);
    }

    #[test]
    fn test_render_round_trips() {
        let stats = FuzzerStats::parse(STATS).unwrap();

        let rendered = stats.render();
        let reparsed = FuzzerStats::parse(&rendered).unwrap();

        assert_eq!(stats, reparsed);
    }
}
