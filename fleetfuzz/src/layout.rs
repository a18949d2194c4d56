// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The one authoritative mapping between logical (fuzzer id, corpus kind,
//! input name) triples and absolute paths, shared by workers and the
//! coordinator. Both sides use the engine's own directory convention, plus
//! a couple of conventions of our own:
//!
//! ```text
//! <base>/
//!   input/<seed>...
//!   output/<fuzzer_id>/
//!     fuzzer_stats
//!     queue/<input>...
//!     crashes/<input>...
//!     hangs/<input>...
//!   dict.txt
//! ```
//!
//! A coordinator workdir built this way is itself a valid fuzzer workdir,
//! which is what lets the whole fleet exchange corpora by moving plain
//! files around.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use thiserror::Error;
use tokio::fs;

use crate::corpus::{Input, InputCorpus};
use crate::id::FuzzerId;
use crate::state::AflOutput;
use crate::stats::FuzzerStats;

pub const QUEUE_DIR: &str = "queue";
pub const CRASHES_DIR: &str = "crashes";
pub const HANGS_DIR: &str = "hangs";

const INPUT_DIR: &str = "input";
const OUTPUT_DIR: &str = "output";
const STATS_FILE: &str = "fuzzer_stats";
const DICT_FILE: &str = "dict.txt";
const README_FILE: &str = "README.txt";

/// The three corpora the engine maintains in its output directory.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CorpusKind {
    Queue,
    Crashes,
    Hangs,
}

impl CorpusKind {
    pub fn dir_name(self) -> &'static str {
        match self {
            CorpusKind::Queue => QUEUE_DIR,
            CorpusKind::Crashes => CRASHES_DIR,
            CorpusKind::Hangs => HANGS_DIR,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
#[error("input name escapes its corpus directory: {0}")]
pub struct InvalidInputName(pub String);

/// Input names come off the wire from peers, so they are the one place a
/// malicious fleet member could smuggle a path. A name must be exactly its
/// own basename.
pub fn validate_input_name(name: &str) -> Result<(), InvalidInputName> {
    let safe = !name.is_empty()
        && !name.contains('/')
        && !name.contains('\\')
        && name != "."
        && name != "..";

    if safe {
        Ok(())
    } else {
        Err(InvalidInputName(name.to_owned()))
    }
}

/// Reads every regular file in `dir` into a corpus. The engine's
/// `README.txt` and any subdirectory (notably `queue/.state`) are skipped.
pub async fn read_corpus(dir: &Path) -> Result<InputCorpus> {
    let mut corpus = InputCorpus::default();

    let mut entries = fs::read_dir(dir)
        .await
        .with_context(|| format!("unable to read corpus dir: {}", dir.display()))?;

    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("unable to list corpus dir: {}", dir.display()))?
    {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == README_FILE {
            continue;
        }

        let metadata = entry.metadata().await?;
        if !metadata.is_file() {
            continue;
        }

        let path = entry.path();
        let body = fs::read(&path)
            .await
            .with_context(|| format!("unable to read input: {}", path.display()))?;

        corpus.add(Input { name, body });
    }

    corpus.inputs.sort_by(|a, b| a.name.cmp(&b.name));

    Ok(corpus)
}

/// Writes every input in `corpus` to `dir/<name>`, creating `dir` if
/// needed. Writes are whole-file and never delete anything already at the
/// destination; since the engine keeps input names stable, re-writing a
/// corpus is idempotent and a failed write is repaired by the next sync.
pub async fn write_corpus(corpus: &InputCorpus, dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("unable to create corpus dir: {}", dir.display()))?;

    for input in &corpus.inputs {
        validate_input_name(&input.name)?;
        let path = dir.join(&input.name);
        fs::write(&path, &input.body)
            .await
            .with_context(|| format!("unable to write input: {}", path.display()))?;
    }

    Ok(())
}

/// Per-fuzzer view of a workdir.
///
/// The engine accepts a `-o` option naming its output directory. When it
/// also gets `-S <id>` it writes to `<output>/<id>/...`; without an id it
/// writes to `<output>/...` directly. Reads therefore go through
/// [`output_dir`](Self::output_dir) while the value handed to `-o` comes
/// from [`output_parent_dir`](Self::output_parent_dir).
#[derive(Clone, Debug)]
pub struct FuzzerDirs {
    base: PathBuf,
    fuzzer_id: Option<FuzzerId>,
}

impl FuzzerDirs {
    pub fn new(base: impl Into<PathBuf>, fuzzer_id: FuzzerId) -> Self {
        Self {
            base: base.into(),
            fuzzer_id: Some(fuzzer_id),
        }
    }

    pub fn without_id(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            fuzzer_id: None,
        }
    }

    pub fn fuzzer_id(&self) -> Option<&FuzzerId> {
        self.fuzzer_id.as_ref()
    }

    pub fn input_dir(&self) -> PathBuf {
        self.base.join(INPUT_DIR)
    }

    /// The directory to pass to the engine's `-o` option.
    pub fn output_parent_dir(&self) -> PathBuf {
        self.base.join(OUTPUT_DIR)
    }

    /// The directory the engine actually writes into.
    pub fn output_dir(&self) -> PathBuf {
        match &self.fuzzer_id {
            Some(id) => self.output_parent_dir().join(id.as_str()),
            None => self.output_parent_dir(),
        }
    }

    pub fn corpus_dir(&self, kind: CorpusKind) -> PathBuf {
        self.output_dir().join(kind.dir_name())
    }

    pub fn queue_dir(&self) -> PathBuf {
        self.corpus_dir(CorpusKind::Queue)
    }

    pub fn crashes_dir(&self) -> PathBuf {
        self.corpus_dir(CorpusKind::Crashes)
    }

    pub fn hangs_dir(&self) -> PathBuf {
        self.corpus_dir(CorpusKind::Hangs)
    }

    pub fn stats_path(&self) -> PathBuf {
        self.output_dir().join(STATS_FILE)
    }

    /// Absolute path of one named input, with the name validated against
    /// directory traversal.
    pub fn input_path(&self, kind: CorpusKind, name: &str) -> Result<PathBuf, InvalidInputName> {
        validate_input_name(name)?;
        Ok(self.corpus_dir(kind).join(name))
    }

    pub async fn create_input_dir(&self) -> Result<()> {
        fs::create_dir_all(self.input_dir())
            .await
            .context("unable to create input dir")
    }

    pub async fn create_output_dirs(&self) -> Result<()> {
        for kind in [CorpusKind::Queue, CorpusKind::Crashes, CorpusKind::Hangs] {
            fs::create_dir_all(self.corpus_dir(kind))
                .await
                .with_context(|| format!("unable to create {} dir", kind.dir_name()))?;
        }
        Ok(())
    }

    pub async fn read_output(&self) -> Result<AflOutput> {
        Ok(AflOutput {
            queue: self.read_queue().await?,
            crashes: read_corpus(&self.crashes_dir()).await?,
            hangs: read_corpus(&self.hangs_dir()).await?,
        })
    }

    pub async fn write_output(&self, output: &AflOutput) -> Result<()> {
        self.write_queue(&output.queue).await?;
        write_corpus(&output.crashes, &self.crashes_dir()).await?;
        write_corpus(&output.hangs, &self.hangs_dir()).await?;
        Ok(())
    }

    pub async fn read_queue(&self) -> Result<InputCorpus> {
        read_corpus(&self.queue_dir()).await
    }

    pub async fn write_queue(&self, queue: &InputCorpus) -> Result<()> {
        write_corpus(queue, &self.queue_dir()).await
    }

    pub async fn read_inputs(&self) -> Result<InputCorpus> {
        read_corpus(&self.input_dir()).await
    }

    pub async fn write_inputs(&self, inputs: &InputCorpus) -> Result<()> {
        write_corpus(inputs, &self.input_dir()).await
    }

    pub async fn read_stats(&self) -> Result<FuzzerStats> {
        let path = self.stats_path();
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("unable to read stats file: {}", path.display()))?;
        let stats = FuzzerStats::parse(&text)
            .with_context(|| format!("unable to parse stats file: {}", path.display()))?;
        Ok(stats)
    }
}

/// Fleet-wide view of a workdir: the same directory structure, addressed
/// across every fuzzer that has output on disk. Runs on both sides, since
/// worker and coordinator trees are laid out identically.
#[derive(Clone, Debug)]
pub struct FleetDirs {
    base: PathBuf,
}

impl FleetDirs {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn fuzzer(&self, fuzzer_id: &FuzzerId) -> FuzzerDirs {
        FuzzerDirs::new(&self.base, fuzzer_id.clone())
    }

    pub fn input_dir(&self) -> PathBuf {
        self.base.join(INPUT_DIR)
    }

    pub fn output_dir(&self) -> PathBuf {
        self.base.join(OUTPUT_DIR)
    }

    pub fn dict_path(&self) -> PathBuf {
        self.base.join(DICT_FILE)
    }

    pub async fn create_output_dir(&self) -> Result<()> {
        fs::create_dir_all(self.output_dir())
            .await
            .context("unable to create output dir")
    }

    pub async fn create_input_dir(&self) -> Result<()> {
        fs::create_dir_all(self.input_dir())
            .await
            .context("unable to create input dir")
    }

    /// Every subdirectory name under `output/` is a fuzzer id.
    pub async fn fuzzer_ids(&self) -> Result<Vec<FuzzerId>> {
        let dir = self.output_dir();
        let mut entries = fs::read_dir(&dir)
            .await
            .with_context(|| format!("unable to list output dir: {}", dir.display()))?;

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.metadata().await?.is_dir() {
                ids.push(FuzzerId::from(
                    entry.file_name().to_string_lossy().into_owned(),
                ));
            }
        }
        ids.sort();

        Ok(ids)
    }

    pub async fn read_outputs(&self) -> Result<HashMap<FuzzerId, AflOutput>> {
        let mut outputs = HashMap::new();
        for id in self.fuzzer_ids().await? {
            let output = self.fuzzer(&id).read_output().await?;
            outputs.insert(id, output);
        }
        Ok(outputs)
    }

    pub async fn write_output(&self, fuzzer_id: &FuzzerId, output: &AflOutput) -> Result<()> {
        self.fuzzer(fuzzer_id).write_output(output).await
    }

    pub async fn read_queues(&self) -> Result<HashMap<FuzzerId, InputCorpus>> {
        let mut queues = HashMap::new();
        for id in self.fuzzer_ids().await? {
            let queue = self.fuzzer(&id).read_queue().await?;
            queues.insert(id, queue);
        }
        Ok(queues)
    }

    /// Materializes every peer queue on local disk, where the engine's
    /// sibling-queue discovery will find them.
    pub async fn write_queues(&self, queues: &HashMap<FuzzerId, InputCorpus>) -> Result<()> {
        for (fuzzer_id, queue) in queues {
            self.fuzzer(fuzzer_id).write_queue(queue).await?;
        }
        Ok(())
    }

    pub async fn read_inputs(&self) -> Result<InputCorpus> {
        read_corpus(&self.input_dir()).await
    }

    pub async fn write_inputs(&self, inputs: &InputCorpus) -> Result<()> {
        write_corpus(inputs, &self.input_dir()).await
    }

    pub fn crash_path(&self, fuzzer_id: &FuzzerId, name: &str) -> Result<PathBuf, InvalidInputName> {
        self.fuzzer(fuzzer_id).input_path(CorpusKind::Crashes, name)
    }

    pub async fn read_dict(&self) -> Result<Vec<u8>> {
        let path = self.dict_path();
        fs::read(&path)
            .await
            .with_context(|| format!("unable to read dict: {}", path.display()))
    }

    pub async fn write_dict(&self, dict: &[u8]) -> Result<()> {
        let path = self.dict_path();
        fs::write(&path, dict)
            .await
            .with_context(|| format!("unable to write dict: {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    use super::*;
    use crate::stats::fixture;

    fn corpus(pairs: &[(&str, &[u8])]) -> InputCorpus {
        InputCorpus {
            inputs: pairs
                .iter()
                .map(|(name, body)| Input {
                    name: (*name).to_owned(),
                    body: body.to_vec(),
                })
                .collect(),
        }
    }

    fn one(name: String, body: &[u8]) -> InputCorpus {
        InputCorpus {
            inputs: vec![Input {
                name,
                body: body.to_vec(),
            }],
        }
    }

    fn output(tag: &str) -> AflOutput {
        AflOutput {
            queue: one(format!("queue-{tag}"), b"q"),
            crashes: one(format!("crash-{tag}"), b"c"),
            hangs: one(format!("hang-{tag}"), b"h"),
        }
    }

    #[test]
    fn test_validate_input_name() {
        assert!(validate_input_name("id:000000,orig:1").is_ok());

        for bad in [
            "../../../etc/shadow",
            "a/b",
            "..\\windows",
            "..",
            ".",
            "",
            "/etc/passwd",
        ] {
            assert_eq!(
                validate_input_name(bad).unwrap_err(),
                InvalidInputName(bad.to_owned()),
            );
        }
    }

    #[test]
    fn test_input_path_refuses_traversal() {
        let dirs = FuzzerDirs::new("/work", FuzzerId::from("box-0001"));

        let err = dirs
            .input_path(CorpusKind::Crashes, "../../../etc/shadow")
            .unwrap_err();

        assert_eq!(err, InvalidInputName("../../../etc/shadow".into()));
    }

    #[test]
    fn test_output_dir_follows_engine_convention() {
        let with_id = FuzzerDirs::new("/work", FuzzerId::from("box-0001"));
        let without_id = FuzzerDirs::without_id("/work");

        assert_eq!(with_id.output_parent_dir(), Path::new("/work/output"));
        assert_eq!(with_id.output_dir(), Path::new("/work/output/box-0001"));
        assert_eq!(without_id.output_dir(), Path::new("/work/output"));
        assert_eq!(
            with_id.stats_path(),
            Path::new("/work/output/box-0001/fuzzer_stats")
        );
    }

    #[tokio::test]
    async fn test_corpus_round_trip() {
        let base = tempdir().unwrap();
        let dir = base.path().join("queue");
        let written = corpus(&[("a", b"aa"), ("b", b"bb")]);

        write_corpus(&written, &dir).await.unwrap();
        let read = read_corpus(&dir).await.unwrap();

        assert_eq!(written, read);
    }

    #[tokio::test]
    async fn test_read_corpus_skips_readme_and_subdirs() {
        let base = tempdir().unwrap();
        let dir = base.path().join("queue");
        fs::create_dir_all(dir.join(".state")).await.unwrap();
        fs::write(dir.join(".state").join("auto"), b"internal")
            .await
            .unwrap();
        fs::write(dir.join("README.txt"), b"engine docs").await.unwrap();
        fs::write(dir.join("case"), b"payload").await.unwrap();

        let read = read_corpus(&dir).await.unwrap();

        assert_eq!(read, corpus(&[("case", b"payload")]));
    }

    #[tokio::test]
    async fn test_write_corpus_is_idempotent() {
        let base = tempdir().unwrap();
        let dir = base.path().join("queue");
        let written = corpus(&[("a", b"aa")]);

        write_corpus(&written, &dir).await.unwrap();
        write_corpus(&written, &dir).await.unwrap();

        assert_eq!(read_corpus(&dir).await.unwrap(), written);
    }

    #[tokio::test]
    async fn test_write_corpus_refuses_traversal() {
        let base = tempdir().unwrap();
        let dir = base.path().join("queue");
        let hostile = corpus(&[("../escape", b"gotcha")]);

        let err = write_corpus(&hostile, &dir).await.unwrap_err();

        assert!(err.to_string().contains("escapes"));
        assert!(!base.path().join("escape").exists());
    }

    #[tokio::test]
    async fn test_output_round_trip() {
        let base = tempdir().unwrap();
        let id = FuzzerId::from("box-0001");
        let dirs = FuzzerDirs::new(base.path(), id);
        let written = output("1");

        dirs.create_output_dirs().await.unwrap();
        dirs.write_output(&written).await.unwrap();
        let read = dirs.read_output().await.unwrap();

        assert_eq!(written, read);
    }

    #[tokio::test]
    async fn test_read_stats_delegates_to_parser() {
        let base = tempdir().unwrap();
        let dirs = FuzzerDirs::new(base.path(), FuzzerId::from("box-0001"));
        dirs.create_output_dirs().await.unwrap();
        fs::write(dirs.stats_path(), fixture::STATS).await.unwrap();

        let stats = dirs.read_stats().await.unwrap();

        assert_eq!(stats, fixture::stats());
    }

    #[tokio::test]
    async fn test_fleet_outputs_round_trip() {
        let base = tempdir().unwrap();
        let fleet = FleetDirs::new(base.path());
        let id1 = FuzzerId::from("box-0001");
        let id2 = FuzzerId::from("box-0002");

        fleet.write_output(&id1, &output("1")).await.unwrap();
        fleet.write_output(&id2, &output("2")).await.unwrap();

        let ids = fleet.fuzzer_ids().await.unwrap();
        assert_eq!(ids, vec![id1.clone(), id2.clone()]);

        let outputs = fleet.read_outputs().await.unwrap();
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[&id1], output("1"));
        assert_eq!(outputs[&id2], output("2"));
    }

    #[tokio::test]
    async fn test_fleet_queues_round_trip() {
        let base = tempdir().unwrap();
        let fleet = FleetDirs::new(base.path());
        let mut queues = HashMap::new();
        queues.insert(FuzzerId::from("box-0001"), corpus(&[("q1", b"one")]));
        queues.insert(FuzzerId::from("box-0002"), corpus(&[("q2", b"two")]));

        fleet.write_queues(&queues).await.unwrap();
        let read = fleet.read_queues().await.unwrap();

        assert_eq!(read, queues);
    }

    #[tokio::test]
    async fn test_dict_round_trip() {
        let base = tempdir().unwrap();
        let fleet = FleetDirs::new(base.path());

        fleet.write_dict(b"token=\"GET\"").await.unwrap();

        assert_eq!(fleet.read_dict().await.unwrap(), b"token=\"GET\"");
        assert_eq!(fleet.dict_path(), base.path().join("dict.txt"));
    }
}
