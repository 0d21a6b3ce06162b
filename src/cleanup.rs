// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Cleanup worker — bounds on-disk storage to the retention horizon.
//!
//! Images older than `IMAGE_RETENTION_DAYS` are deleted file-first: if the
//! unlink succeeds (or the file is already gone) the row follows; if the
//! unlink fails the row stays and the pair is retried next cycle. No
//! transaction is held across an unlink.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::Result;
use crate::settings::Settings;
use crate::stats::CleanupStats;
use crate::store::ImageStore;

#[derive(Debug, Default, Clone, Serialize)]
pub struct CleanupReport {
    pub examined: u64,
    pub deleted: u64,
    pub bytes_reclaimed: u64,
    /// Rows kept because their file could not be removed.
    pub skipped: u64,
}

/// One retention pass. Also reachable on demand via the HTTP facade and
/// the `cleanup` subcommand.
pub async fn run_once(
    store: &ImageStore,
    settings: &Settings,
    stats: &CleanupStats,
) -> Result<CleanupReport> {
    let snap = settings.current();
    let threshold =
        Utc::now().timestamp() - i64::from(snap.storage.retention_days) * 86_400;

    let rows = store.older_than(threshold).await?;
    let mut report = CleanupReport {
        examined: rows.len() as u64,
        ..CleanupReport::default()
    };

    for row in rows {
        match tokio::fs::remove_file(&row.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(id = row.id, path = %row.path, error = %e, "Cannot remove expired image, keeping row");
                report.skipped += 1;
                continue;
            }
        }
        store.delete(row.id).await?;
        report.deleted += 1;
        report.bytes_reclaimed += row.size_bytes.max(0) as u64;
    }

    if report.deleted > 0 || report.skipped > 0 {
        info!(
            deleted = report.deleted,
            bytes_reclaimed = report.bytes_reclaimed,
            skipped = report.skipped,
            "Cleanup pass finished"
        );
    }
    stats.record_run(report.deleted, report.bytes_reclaimed);
    Ok(report)
}

pub struct CleanupWorker {
    settings: Arc<Settings>,
    store: Arc<ImageStore>,
    stats: Arc<CleanupStats>,
}

impl CleanupWorker {
    pub fn new(
        settings: Arc<Settings>,
        store: Arc<ImageStore>,
        stats: Arc<CleanupStats>,
    ) -> Self {
        CleanupWorker {
            settings,
            store,
            stats,
        }
    }

    pub async fn run(self) {
        info!("Cleanup worker started");
        loop {
            let hours = self.settings.current().storage.cleanup_interval_hours.max(1);
            tokio::time::sleep(Duration::from_secs(hours * 3600)).await;
            if let Err(e) = run_once(&self.store, &self.settings, &self.stats).await {
                warn!(error = %e, "Cleanup pass failed");
            }
        }
    }
}
