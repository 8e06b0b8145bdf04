//! Bundling Job
//!
//! Every tick recomputes, per watched directory, the bytes of unbundled
//! source files still on disk. Once a directory crosses the minimum its files
//! are staged into `<deal_root>/<dir>/<timestamp>/src`, packed into
//! `.../car`, and the bundle plus its file maps are stored in one
//! transaction. A bundle whose files were all paid for before bundling is
//! promoted right away. A failing directory is logged and retried next tick.

use super::{JobKind, PeriodicJob, SingleFlight};
use crate::archiver::{ArchiveError, Archiver};
use crate::common::{now_millis, Result};
use crate::config::BundlingConfig;
use crate::payment::promote_if_paid;
use crate::storage::{BundleMember, DealBundle, LockPaymentStatus, SourceFile, StateStore};
use async_trait::async_trait;
use chrono::Utc;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BundlingReport {
    pub directories_scanned: usize,
    pub bundles_created: usize,
    pub below_threshold: usize,
    /// New bundles already paid for by earlier deposits.
    pub bundles_paid: usize,
    pub failed: usize,
}

impl fmt::Display for BundlingReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "scanned={} created={} paid={} below_threshold={} failed={}",
            self.directories_scanned, self.bundles_created, self.bundles_paid, self.below_threshold, self.failed
        )
    }
}

pub struct BundlingJob {
    store: Arc<dyn StateStore>,
    archiver: Arc<dyn Archiver>,
    config: BundlingConfig,
    deal_duration: u64,
    flight: SingleFlight,
}

/// Staging directories of one bundling attempt
struct Staging {
    root: PathBuf,
    src: PathBuf,
    car: PathBuf,
}

impl Staging {
    async fn discard(&self) {
        if let Err(e) = tokio::fs::remove_dir_all(&self.root).await {
            warn!("Could not remove staging directory {:?}: {}", self.root, e);
        }
    }
}

impl BundlingJob {
    pub fn new(
        store: Arc<dyn StateStore>,
        archiver: Arc<dyn Archiver>,
        config: BundlingConfig,
        deal_duration: u64,
    ) -> Self {
        Self {
            store,
            archiver,
            config,
            deal_duration,
            flight: SingleFlight::new(),
        }
    }

    /// Run one tick, waiting for a tick already in progress.
    pub async fn run_once(&self) -> Result<BundlingReport> {
        self.flight.run(self.tick()).await
    }

    async fn tick(&self) -> Result<BundlingReport> {
        info!("Bundling tick started for {} directories", self.config.source_dirs.len());
        tokio::fs::create_dir_all(&self.config.deal_root).await?;

        let mut report = BundlingReport::default();
        for dir in &self.config.source_dirs {
            report.directories_scanned += 1;
            match self.bundle_directory(dir).await {
                Ok(Some(bundle)) => {
                    report.bundles_created += 1;
                    if bundle.lock_payment_status == LockPaymentStatus::Success {
                        report.bundles_paid += 1;
                    }
                    info!(
                        "Bundle {} created from {:?}: {} ({} bytes)",
                        bundle.id, dir, bundle.archive_name, bundle.archive_size
                    );
                }
                Ok(None) => report.below_threshold += 1,
                Err(e) => {
                    report.failed += 1;
                    error!("Bundling {:?} failed, retrying next tick: {}", dir, e);
                }
            }
        }

        info!("Bundling tick finished: {}", report);
        Ok(report)
    }

    /// Unbundled files of `dir` that are still on disk, with their total size.
    async fn pending_files(&self, dir: &Path) -> Result<(Vec<SourceFile>, u64)> {
        let mut present = Vec::new();
        let mut total = 0u64;
        for file in self.store.unbundled_source_files(dir).await? {
            match tokio::fs::metadata(&file.file_path).await {
                Ok(meta) if meta.is_file() => {
                    total += meta.len();
                    present.push(file);
                }
                _ => warn!("Source file {} missing at {:?}, not bundled", file.id, file.file_path),
            }
        }
        Ok((present, total))
    }

    fn staging_for(&self, dir: &Path) -> Staging {
        let dir_name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "root".to_string());
        let root = self
            .config
            .deal_root
            .join(dir_name)
            .join(Utc::now().format("%Y%m%d_%H%M%S_%3f").to_string());
        Staging {
            src: root.join("src"),
            car: root.join("car"),
            root,
        }
    }

    async fn bundle_directory(&self, dir: &Path) -> Result<Option<DealBundle>> {
        let (files, total) = self.pending_files(dir).await?;
        if files.is_empty() || total < self.config.min_source_bytes {
            debug!(
                "{:?} holds {} pending bytes, below minimum {}",
                dir, total, self.config.min_source_bytes
            );
            return Ok(None);
        }

        let staging = self.staging_for(dir);
        match self.pack_and_store(&staging, &files).await {
            Ok(bundle) => Ok(Some(bundle)),
            Err(e) => {
                staging.discard().await;
                Err(e)
            }
        }
    }

    async fn pack_and_store(&self, staging: &Staging, files: &[SourceFile]) -> Result<DealBundle> {
        tokio::fs::create_dir_all(&staging.src).await?;

        // Staged names carry the file id so equal upload names cannot collide.
        let mut staged: HashMap<String, u64> = HashMap::with_capacity(files.len());
        for file in files {
            let name = format!("{}_{}", file.id, file.file_name);
            tokio::fs::copy(&file.file_path, staging.src.join(&name)).await?;
            staged.insert(name, file.id);
        }

        let archive = self.archiver.bundle(&staging.src, &staging.car).await?;
        if archive.archive_size < self.config.min_archive_bytes {
            return Err(ArchiveError::TooSmall {
                size: archive.archive_size,
                minimum: self.config.min_archive_bytes,
            }
            .into());
        }

        let mut members = Vec::with_capacity(files.len());
        for entry in &archive.entries {
            if let Some(id) = staged.remove(&entry.file_name) {
                members.push(BundleMember {
                    source_file_id: id,
                    content_id: Some(entry.content_id.clone()),
                });
            }
        }
        if members.len() != files.len() || archive.entries.len() != files.len() {
            return Err(ArchiveError::UnmatchedEntries {
                expected: files.len(),
                matched: members.len(),
            }
            .into());
        }

        let bundle = DealBundle::from_archive(&archive, self.deal_duration, now_millis());
        let mut bundle = self.store.create_bundle(bundle, &members).await?;

        // Deposits made before the files were bundled.
        match promote_if_paid(self.store.as_ref(), bundle.id).await {
            Ok(Some(_)) => bundle.lock_payment_status = LockPaymentStatus::Success,
            Ok(None) => {}
            Err(e) => warn!("Payment check for new bundle {} failed, left WAITING: {}", bundle.id, e),
        }
        Ok(bundle)
    }
}

#[async_trait]
impl PeriodicJob for BundlingJob {
    fn kind(&self) -> JobKind {
        JobKind::Bundling
    }

    async fn try_tick(&self) -> Option<Result<()>> {
        self.flight.try_run(self.tick()).await.map(|r| r.map(|_| ()))
    }
}
