// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Best-effort replication of the coordinator's work tree to durable
//! storage, so a dead coordinator never takes the fleet's findings with
//! it. Backends are pluggable: local disk for development and tests, S3
//! for production, and a null backend when archival is disabled.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::primitives::ByteStream;
use log::{error, info, warn};
use metrics::counter;
use tokio::fs;
use tokio::time::sleep;
use walkdir::WalkDir;

use crate::util::unix_time;

#[async_trait]
pub trait Archiver: Send + Sync {
    /// Copies the local file at `abs_src` to `rel_dst` under the
    /// archiver's destination root.
    async fn archive_one(&self, abs_src: &Path, rel_dst: &Path) -> Result<()>;

    /// Lists file names currently present under `rel_dst_root`.
    async fn list_dst(&self, rel_dst_root: &Path) -> Result<Vec<String>>;

    /// Describes the destination root. Display only.
    fn describe_root(&self) -> String;

    /// Describes a relative destination path. Display only.
    fn describe_loc(&self, rel_dst: &Path) -> String;
}

/// Conforms to the interface, does nothing. Used when archival is off.
pub struct NullArchiver;

#[async_trait]
impl Archiver for NullArchiver {
    async fn archive_one(&self, _abs_src: &Path, _rel_dst: &Path) -> Result<()> {
        Ok(())
    }

    async fn list_dst(&self, _rel_dst_root: &Path) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    fn describe_root(&self) -> String {
        String::new()
    }

    fn describe_loc(&self, _rel_dst: &Path) -> String {
        String::new()
    }
}

/// Copies archives to another location on local disk.
pub struct DiskArchiver {
    dst_root: PathBuf,
}

impl DiskArchiver {
    pub async fn new(dst_root: impl Into<PathBuf>) -> Result<Self> {
        let dst_root = dst_root.into();
        fs::create_dir_all(&dst_root)
            .await
            .with_context(|| format!("unable to create archive root: {}", dst_root.display()))?;
        Ok(Self { dst_root })
    }
}

#[async_trait]
impl Archiver for DiskArchiver {
    async fn archive_one(&self, abs_src: &Path, rel_dst: &Path) -> Result<()> {
        let abs_dst = self.dst_root.join(rel_dst);

        if let Some(parent) = abs_dst.parent() {
            fs::create_dir_all(parent).await.with_context(|| {
                format!("unable to create archive dirs: {}", parent.display())
            })?;
        }

        fs::copy(abs_src, &abs_dst).await.with_context(|| {
            format!(
                "unable to archive {} to {}",
                abs_src.display(),
                abs_dst.display()
            )
        })?;

        Ok(())
    }

    /// Base names of the regular files directly under `rel_dst_root`.
    /// Subdirectories are neither listed nor walked; a missing root is an
    /// empty archive, not an error.
    async fn list_dst(&self, rel_dst_root: &Path) -> Result<Vec<String>> {
        let root = self.dst_root.join(rel_dst_root);

        if fs::metadata(&root).await.is_err() {
            return Ok(Vec::new());
        }

        let mut names = Vec::new();
        let mut entries = fs::read_dir(&root)
            .await
            .with_context(|| format!("unable to list archive dir: {}", root.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.metadata().await?.is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();

        Ok(names)
    }

    fn describe_root(&self) -> String {
        self.dst_root.display().to_string()
    }

    fn describe_loc(&self, rel_dst: &Path) -> String {
        self.dst_root.join(rel_dst).display().to_string()
    }
}

/// Streams archives into an S3 bucket under a fixed root key.
pub struct S3Archiver {
    bucket: String,
    root_key: String,
    client: aws_sdk_s3::Client,
}

#[derive(Clone, Debug)]
pub struct S3Options {
    pub root_key: String,
    pub bucket: String,
    pub region: String,
    pub is_local: bool,
}

impl S3Archiver {
    pub async fn new(options: S3Options) -> Result<Self> {
        if options.is_local && std::env::var_os("AWS_ACCESS_KEY_ID").is_none() {
            bail!(
                "no AWS access key found; configure credentials with \
                 AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY"
            );
        }

        let config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(options.region))
            .load()
            .await;
        let client = aws_sdk_s3::Client::new(&config);

        Ok(Self {
            bucket: options.bucket,
            root_key: options.root_key,
            client,
        })
    }

    fn dst_key(&self, rel_dst: &Path) -> String {
        object_key(&self.root_key, rel_dst)
    }
}

fn object_key(root_key: &str, rel_dst: &Path) -> String {
    let mut key = root_key.trim_end_matches('/').to_owned();
    for component in rel_dst.components() {
        let part = component.as_os_str().to_string_lossy();
        if part == "." {
            continue;
        }
        if !key.is_empty() {
            key.push('/');
        }
        key.push_str(&part);
    }
    key
}

#[async_trait]
impl Archiver for S3Archiver {
    async fn archive_one(&self, abs_src: &Path, rel_dst: &Path) -> Result<()> {
        let key = self.dst_key(rel_dst);
        let body = ByteStream::from_path(abs_src)
            .await
            .with_context(|| format!("unable to open archive source: {}", abs_src.display()))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(body)
            .send()
            .await
            .with_context(|| format!("unable to put archive object: {key}"))?;

        info!("archived object bucket={} key={}", self.bucket, key);
        Ok(())
    }

    async fn list_dst(&self, rel_dst_root: &Path) -> Result<Vec<String>> {
        let prefix = self.dst_key(rel_dst_root);

        let mut names = Vec::new();
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(&prefix)
            .into_paginator()
            .send();

        while let Some(page) = pages.next().await {
            let page = page.with_context(|| format!("unable to list archive prefix: {prefix}"))?;
            for object in page.contents() {
                let Some(key) = object.key() else { continue };
                let name = key
                    .strip_prefix(&prefix)
                    .unwrap_or(key)
                    .trim_start_matches('/');
                names.push(name.to_owned());
            }
        }
        names.sort();

        Ok(names)
    }

    fn describe_root(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.root_key)
    }

    fn describe_loc(&self, rel_dst: &Path) -> String {
        format!("s3://{}/{}", self.bucket, self.dst_key(rel_dst))
    }
}

/// An archival work-list, frozen before any I/O begins. Freezing first
/// bounds the file set a single run copies: files that land mid-run are
/// picked up by the next run instead of turning the copy into a chase of a
/// moving target.
#[derive(Debug)]
pub struct Manifest {
    src_root: PathBuf,
    entries: Vec<ManifestEntry>,
}

#[derive(Debug)]
struct ManifestEntry {
    /// Relative to the manifest's `src_root`.
    src: PathBuf,
    /// Relative to the archiver's destination root.
    dst: PathBuf,
}

impl Manifest {
    pub fn new(src_root: impl Into<PathBuf>) -> Self {
        Self {
            src_root: src_root.into(),
            entries: Vec::new(),
        }
    }

    pub fn push(&mut self, src: PathBuf, dst: PathBuf) {
        self.entries.push(ManifestEntry { src, dst });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshots every file under `src_root`, destined for the same
    /// relative path under `dst_sub_root`.
    pub fn snapshot(src_root: &Path, dst_sub_root: &Path) -> Result<Self> {
        let mut manifest = Manifest::new(src_root);

        for entry in WalkDir::new(src_root) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!("skipping unreadable path during manifest walk err={err}");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let rel_src = entry
                .path()
                .strip_prefix(src_root)
                .context("walked path outside manifest root")?
                .to_path_buf();
            let dst = dst_sub_root.join(&rel_src);
            manifest.push(rel_src, dst);
        }

        Ok(manifest)
    }
}

/// Archives a manifest, entry by entry. A failed entry is logged and
/// counted but never aborts the rest; subsequent syncs re-offer anything
/// that was missed.
pub async fn archive_manifest(archiver: &dyn Archiver, manifest: &Manifest) {
    counter!("archive_manifest.entries").increment(manifest.len() as u64);

    for entry in &manifest.entries {
        let abs_src = manifest.src_root.join(&entry.src);
        match archiver.archive_one(&abs_src, &entry.dst).await {
            Ok(()) => {
                counter!("archive_one.success").increment(1);
            }
            Err(err) => {
                error!(
                    "failed to archive src={} dst={} err={:#}",
                    abs_src.display(),
                    archiver.describe_loc(&entry.dst),
                    err
                );
                counter!("archive_one.fail").increment(1);
            }
        }
    }
}

/// Archives everything under `abs_src_root` once, rooted at
/// `dst_sub_root`, preserving the source directory structure.
pub async fn archive_named(
    archiver: &dyn Archiver,
    abs_src_root: &Path,
    dst_sub_root: &Path,
) -> Result<()> {
    let manifest = Manifest::snapshot(abs_src_root, dst_sub_root)?;
    archive_manifest(archiver, &manifest).await;
    Ok(())
}

async fn archive_timestamped(
    archiver: &dyn Archiver,
    abs_src_root: &Path,
    timestamp: u64,
) -> Result<()> {
    archive_named(archiver, abs_src_root, Path::new(&timestamp.to_string())).await
}

/// Repeatedly archives `abs_src_root` every `interval`, each run into a
/// subpath named for the current Unix time. Never returns.
pub async fn archive_timestamped_forever(
    archiver: Arc<dyn Archiver>,
    abs_src_root: PathBuf,
    interval: Duration,
) {
    loop {
        sleep(interval).await;
        info!(
            "archiving work tree src={} dst={}",
            abs_src_root.display(),
            archiver.describe_root()
        );
        if let Err(err) = archive_timestamped(archiver.as_ref(), &abs_src_root, unix_time()).await {
            error!("scheduled archive failed err={:#}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    use super::*;

    async fn write_file(path: &Path, contents: &str) {
        fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        fs::write(path, contents).await.unwrap();
    }

    async fn read_file(path: &Path) -> String {
        String::from_utf8(fs::read(path).await.unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_disk_archive_to_named_dir() {
        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();
        write_file(&src.path().join("hi").join("there"), "hi there\n").await;
        write_file(&src.path().join("goodbye"), "goodbye\n").await;
        let archiver = DiskArchiver::new(dst.path()).await.unwrap();

        archive_named(&archiver, src.path(), Path::new("run-1"))
            .await
            .unwrap();

        let archived = dst.path().join("run-1");
        assert_eq!(read_file(&archived.join("hi").join("there")).await, "hi there\n");
        assert_eq!(read_file(&archived.join("goodbye")).await, "goodbye\n");
    }

    #[tokio::test]
    async fn test_disk_list_dst_is_shallow_and_files_only() {
        let dst = tempdir().unwrap();
        let archiver = DiskArchiver::new(dst.path()).await.unwrap();
        write_file(&dst.path().join("backups").join("bonjour"), "bonjour\n").await;
        write_file(&dst.path().join("backups").join("sub").join("deep"), "deep\n").await;

        let names = archiver.list_dst(Path::new("backups")).await.unwrap();

        assert_eq!(names, vec!["bonjour".to_owned()]);
    }

    #[tokio::test]
    async fn test_disk_list_dst_missing_root_is_empty() {
        let dst = tempdir().unwrap();
        let archiver = DiskArchiver::new(dst.path()).await.unwrap();

        let names = archiver.list_dst(Path::new("never-archived")).await.unwrap();

        assert_eq!(names, Vec::<String>::new());
    }

    #[tokio::test]
    async fn test_timestamped_archive_names_the_run_dir() {
        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();
        write_file(&src.path().join("goodbye"), "goodbye\n").await;
        let archiver = DiskArchiver::new(dst.path()).await.unwrap();

        archive_timestamped(&archiver, src.path(), 4815162342)
            .await
            .unwrap();

        let archived = dst.path().join("4815162342").join("goodbye");
        assert_eq!(read_file(&archived).await, "goodbye\n");
    }

    #[tokio::test]
    async fn test_manifest_snapshot_covers_all_files() {
        let src = tempdir().unwrap();
        write_file(&src.path().join("a"), "a").await;
        write_file(&src.path().join("nested").join("b"), "b").await;

        let manifest = Manifest::snapshot(src.path(), Path::new("sub")).unwrap();

        assert_eq!(manifest.len(), 2);
        let mut dsts: Vec<_> = manifest.entries.iter().map(|e| e.dst.clone()).collect();
        dsts.sort();
        assert_eq!(
            dsts,
            vec![
                Path::new("sub").join("a"),
                Path::new("sub").join("nested").join("b"),
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_entry_does_not_abort_the_manifest() {
        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();
        write_file(&src.path().join("present"), "present\n").await;
        let archiver = DiskArchiver::new(dst.path()).await.unwrap();

        let mut manifest = Manifest::new(src.path());
        manifest.push(PathBuf::from("missing"), PathBuf::from("missing"));
        manifest.push(PathBuf::from("present"), PathBuf::from("present"));

        archive_manifest(&archiver, &manifest).await;

        assert_eq!(read_file(&dst.path().join("present")).await, "present\n");
    }

    #[test]
    fn test_object_key_joins_root_and_path() {
        assert_eq!(
            object_key("data/more-data", Path::new("goodbye")),
            "data/more-data/goodbye"
        );
        assert_eq!(
            object_key("data/more-data", &Path::new("4815162342").join("hi").join("there")),
            "data/more-data/4815162342/hi/there"
        );
        assert_eq!(object_key("", Path::new("goodbye")), "goodbye");
        assert_eq!(object_key("root", Path::new(".")), "root");
    }
}
