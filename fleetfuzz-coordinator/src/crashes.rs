// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Realtime crash archival. The scheduled archiver runs on a timer, which
//! leaves a window where a coordinator crash loses findings; this pipeline
//! closes it by running inside every `/state` post, after the output has
//! hit coordinator disk and before the worker gets its 200.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use fleetfuzz::layout::FleetDirs;
use log::info;

use crate::archive::{archive_manifest, Archiver, Manifest};

pub const REALTIME_CRASHES_ROOT: &str = "realtime-crashes";

/// Diffs the crashes on coordinator disk against the archive's
/// `realtime-crashes/` namespace and archives the additions. A crash is
/// addressed by its path relative to the coordinator base dir, so
/// re-posting a state with known crashes adds nothing to the manifest.
pub async fn archive_new_crashes(dirs: &FleetDirs, archiver: &dyn Archiver) -> Result<()> {
    let archived: HashSet<String> = archiver
        .list_dst(Path::new(REALTIME_CRASHES_ROOT))
        .await
        .context("unable to list archived realtime crashes")?
        .into_iter()
        .collect();

    let outputs = dirs.read_outputs().await?;

    let mut manifest = Manifest::new(dirs.base());
    for (fuzzer_id, output) in &outputs {
        for crash in &output.crashes.inputs {
            let abs = dirs.crash_path(fuzzer_id, &crash.name)?;
            let rel = abs
                .strip_prefix(dirs.base())
                .context("crash path outside the work tree")?;

            if archived.contains(rel.to_string_lossy().as_ref()) {
                continue;
            }
            manifest.push(rel.to_path_buf(), Path::new(REALTIME_CRASHES_ROOT).join(rel));
        }
    }

    if manifest.is_empty() {
        return Ok(());
    }

    info!("archiving new crashes n_crashes={}", manifest.len());
    archive_manifest(archiver, &manifest).await;

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use fleetfuzz::corpus::{Input, InputCorpus};
    use fleetfuzz::id::FuzzerId;
    use fleetfuzz::layout::read_corpus;
    use fleetfuzz::state::AflOutput;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    use super::*;
    use crate::archive::DiskArchiver;

    fn crashes(names: &[(&str, u8)]) -> AflOutput {
        AflOutput {
            queue: InputCorpus::default(),
            crashes: InputCorpus {
                inputs: names
                    .iter()
                    .map(|(name, byte)| Input {
                        name: (*name).to_owned(),
                        body: vec![*byte],
                    })
                    .collect(),
            },
            hangs: InputCorpus::default(),
        }
    }

    /// Archiver double that remembers every file it was asked to copy and
    /// answers `list_dst` from that memory, the way the S3 backend answers
    /// from bucket contents.
    #[derive(Default)]
    struct RecordingArchiver {
        archived: Mutex<Vec<PathBuf>>,
    }

    #[async_trait]
    impl Archiver for RecordingArchiver {
        async fn archive_one(&self, _abs_src: &Path, rel_dst: &Path) -> Result<()> {
            self.archived.lock().unwrap().push(rel_dst.to_path_buf());
            Ok(())
        }

        async fn list_dst(&self, rel_dst_root: &Path) -> Result<Vec<String>> {
            let names = self
                .archived
                .lock()
                .unwrap()
                .iter()
                .filter_map(|dst| {
                    dst.strip_prefix(rel_dst_root)
                        .ok()
                        .map(|rel| rel.to_string_lossy().into_owned())
                })
                .collect();
            Ok(names)
        }

        fn describe_root(&self) -> String {
            "recording".into()
        }

        fn describe_loc(&self, rel_dst: &Path) -> String {
            rel_dst.display().to_string()
        }
    }

    #[tokio::test]
    async fn test_crashes_from_both_workers_are_archived() {
        let base = tempdir().unwrap();
        let dirs = FleetDirs::new(base.path());
        let archiver = RecordingArchiver::default();
        dirs.write_output(&"fuzzer-123".into(), &crashes(&[("c1", 1)]))
            .await
            .unwrap();

        archive_new_crashes(&dirs, &archiver).await.unwrap();

        dirs.write_output(&"fuzzer-456".into(), &crashes(&[("c2", 2)]))
            .await
            .unwrap();

        archive_new_crashes(&dirs, &archiver).await.unwrap();

        let archived = archiver.archived.lock().unwrap().clone();
        assert_eq!(
            archived,
            vec![
                Path::new(REALTIME_CRASHES_ROOT).join("output/fuzzer-123/crashes/c1"),
                Path::new(REALTIME_CRASHES_ROOT).join("output/fuzzer-456/crashes/c2"),
            ]
        );
    }

    #[tokio::test]
    async fn test_already_archived_crashes_are_skipped() {
        let base = tempdir().unwrap();
        let dirs = FleetDirs::new(base.path());
        let archiver = RecordingArchiver::default();
        dirs.write_output(&"fuzzer-123".into(), &crashes(&[("c1", 1), ("c2", 2)]))
            .await
            .unwrap();

        archive_new_crashes(&dirs, &archiver).await.unwrap();
        archive_new_crashes(&dirs, &archiver).await.unwrap();

        assert_eq!(archiver.archived.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_disk_backend_recreates_the_crash_tree() {
        let base = tempdir().unwrap();
        let dst = tempdir().unwrap();
        let dirs = FleetDirs::new(base.path());
        let archiver = DiskArchiver::new(dst.path()).await.unwrap();
        let output = crashes(&[("crash1", 1), ("crash2", 2), ("crash3", 3)]);
        dirs.write_output(&"fuzzer-123".into(), &output)
            .await
            .unwrap();

        archive_new_crashes(&dirs, &archiver).await.unwrap();

        let archived_dirs = FleetDirs::new(dst.path().join(REALTIME_CRASHES_ROOT));
        let archived = read_corpus(
            &archived_dirs
                .fuzzer(&FuzzerId::from("fuzzer-123"))
                .crashes_dir(),
        )
        .await
        .unwrap();
        let names: Vec<_> = archived.names().collect();
        assert_eq!(names, vec!["crash1", "crash2", "crash3"]);
    }
}
