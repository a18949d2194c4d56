// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Supervision of one afl-fuzz child process: spawning it with the right
//! workdir wiring, watching for the moment it actually begins fuzzing, and
//! pausing it for consistent snapshots of its output directory.
//!
//! Pausing matters: the engine writes new queue entries whenever it likes,
//! so reading a live output directory can observe files that appear mid
//! enumeration. SIGSTOP for the whole read window is the only way to get a
//! coherent (stats, queue, crashes, hangs) quadruple.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use anyhow::{Context, Result};
use fleetfuzz::id::FuzzerId;
use fleetfuzz::layout::FuzzerDirs;
use fleetfuzz::state::FuzzerState;
use log::{info, warn};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

/// Where the engine lives: `$AFL/afl-fuzz` if the env var is set,
/// otherwise whatever `afl-fuzz` resolves to on PATH.
fn afl_fuzz_path() -> PathBuf {
    match std::env::var_os("AFL") {
        Some(root) => Path::new(&root).join("afl-fuzz"),
        None => PathBuf::from("afl-fuzz"),
    }
}

fn afl_fuzz_args(
    id: &FuzzerId,
    dirs: &FuzzerDirs,
    target_command: &[String],
    dict_path: Option<&Path>,
    timeout_ms: u64,
    mem_limit_mb: u64,
) -> Vec<String> {
    let mut args = vec![
        "-S".to_owned(),
        id.to_string(),
        // The engine gets the parent output dir and fans out into its own
        // id-suffixed subdirectory.
        "-o".to_owned(),
        dirs.output_parent_dir().display().to_string(),
        "-i".to_owned(),
        dirs.input_dir().display().to_string(),
    ];

    if timeout_ms != 0 {
        args.push("-t".to_owned());
        args.push(timeout_ms.to_string());
    }
    if mem_limit_mb != 0 {
        args.push("-m".to_owned());
        args.push(mem_limit_mb.to_string());
    }
    if let Some(dict_path) = dict_path {
        args.push("-x".to_owned());
        args.push(dict_path.display().to_string());
    }

    args.extend(target_command.iter().cloned());
    args
}

/// A fully prepared but not yet spawned fuzzer.
pub struct FuzzerCommand {
    id: FuzzerId,
    dirs: FuzzerDirs,
    program: PathBuf,
    args: Vec<String>,
}

impl FuzzerCommand {
    pub fn new(
        workdir: &Path,
        target_command: &[String],
        dict_path: Option<&Path>,
        timeout_ms: u64,
        mem_limit_mb: u64,
    ) -> Result<Self> {
        let id = FuzzerId::generate()?;
        let dirs = FuzzerDirs::new(workdir, id.clone());
        let args = afl_fuzz_args(&id, &dirs, target_command, dict_path, timeout_ms, mem_limit_mb);

        Ok(Self {
            id,
            dirs,
            program: afl_fuzz_path(),
            args,
        })
    }

    pub fn id(&self) -> &FuzzerId {
        &self.id
    }

    pub fn dirs(&self) -> &FuzzerDirs {
        &self.dirs
    }

    pub async fn spawn(self) -> Result<AflFuzzer> {
        info!(
            "starting fuzzer id={} cmd={} {}",
            self.id,
            self.program.display(),
            self.args.join(" ")
        );

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("fuzzer failed to start: {}", self.program.display()))?;

        let pid = child
            .id()
            .context("fuzzer exited before it could be supervised")?;

        // Mirror the engine's chatter onto our own stdio so operators keep
        // their visibility into each fuzzer.
        if let Some(mut stdout) = child.stdout.take() {
            tokio::spawn(async move {
                let _ = io::copy(&mut stdout, &mut io::stdout()).await;
            });
        }
        if let Some(mut stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let _ = io::copy(&mut stderr, &mut io::stderr()).await;
            });
        }

        Ok(AflFuzzer {
            id: self.id,
            dirs: self.dirs,
            pid: Pid::from_raw(pid as i32),
            child: Mutex::new(child),
            phase: Mutex::new(Phase::Starting),
        })
    }
}

/// Lifecycle of a spawned engine process. A [`FuzzerCommand`] that has not
/// been spawned yet sits logically before `Starting`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Phase {
    /// Process is up but still initializing (no stats file yet).
    Starting,
    /// The stats file has appeared; the engine is doing real work.
    Fuzzing,
    /// SIGSTOPped for a snapshot read.
    Paused,
    Exited,
}

/// A running, supervised afl-fuzz process.
pub struct AflFuzzer {
    id: FuzzerId,
    dirs: FuzzerDirs,
    pid: Pid,
    child: Mutex<Child>,
    phase: Mutex<Phase>,
}

impl AflFuzzer {
    pub fn id(&self) -> &FuzzerId {
        &self.id
    }

    pub fn dirs(&self) -> &FuzzerDirs {
        &self.dirs
    }

    pub async fn phase(&self) -> Phase {
        *self.phase.lock().await
    }

    /// Whether the engine has made it past initialization and begun the
    /// actual task of fuzzing. Distinct from liveness: probed as the
    /// existence of the stats file, not by parsing it.
    pub async fn has_begun_fuzzing(&self) -> bool {
        let begun = tokio::fs::metadata(self.dirs.stats_path()).await.is_ok();
        if begun {
            let mut phase = self.phase.lock().await;
            if *phase == Phase::Starting {
                *phase = Phase::Fuzzing;
            }
        }
        begun
    }

    /// Stops the engine with SIGSTOP. Signal failures are logged, not
    /// fatal: the only process that can be missing is one that already
    /// exited, and its directory is stable without the pause.
    pub async fn pause(&self) {
        if let Err(err) = signal::kill(self.pid, Signal::SIGSTOP) {
            warn!("unable to pause fuzzer id={} err={}", self.id, err);
            return;
        }
        let mut phase = self.phase.lock().await;
        if *phase == Phase::Fuzzing {
            *phase = Phase::Paused;
        }
    }

    /// Restarts a paused engine with SIGCONT.
    pub async fn resume(&self) {
        if let Err(err) = signal::kill(self.pid, Signal::SIGCONT) {
            warn!("unable to resume fuzzer id={} err={}", self.id, err);
            return;
        }
        let mut phase = self.phase.lock().await;
        if *phase == Phase::Paused {
            *phase = Phase::Fuzzing;
        }
    }

    /// Reads (stats, queue, crashes, hangs) off disk. Only coherent while
    /// the engine is paused or gone; the caller owns that, which keeps the
    /// primitive usable against synthetic directories in tests.
    pub async fn read_state(&self) -> Result<FuzzerState> {
        FuzzerState::read(&self.dirs).await
    }

    /// Waits for the engine to exit and surfaces its exit status.
    pub async fn wait(&self) -> Result<ExitStatus> {
        let status = {
            let mut child = self.child.lock().await;
            child.wait().await.context("unable to wait for fuzzer")?
        };
        *self.phase.lock().await = Phase::Exited;
        Ok(status)
    }
}
