// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Capture service — drives one still capture per request.
//!
//! A capture resolves the camera from the live settings snapshot, grabs one
//! frame into `<storage>/<source>_<epoch>.jpg`, then inserts the image row.
//! The row insert is the authoritative event: a failed grab leaves no row,
//! and an insert failure removes the orphan file so row⇔file stays in sync.
//!
//! `spawn()` schedules a capture and returns immediately; it is what the
//! GPIO dispatcher calls, so a press never waits on camera I/O. Concurrent
//! grabs are capped at the number of configured cameras.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::error::{CameraError, Result, StillpostError};
use crate::grabber::{FrameGrabber, GRAB_TIMEOUT, JPEG_QUALITY};
use crate::settings::Settings;
use crate::stats::CaptureStats;
use crate::store::{ImageRecord, ImageStore};

pub struct CaptureService {
    settings: Arc<Settings>,
    store: Arc<ImageStore>,
    stats: Arc<CaptureStats>,
    grabber: FrameGrabber,
    permits: Semaphore,
}

impl CaptureService {
    pub fn new(
        settings: Arc<Settings>,
        store: Arc<ImageStore>,
        stats: Arc<CaptureStats>,
    ) -> Self {
        let cameras = settings.current().cameras.len().max(1);
        CaptureService {
            settings,
            store,
            stats,
            grabber: FrameGrabber::new(),
            permits: Semaphore::new(cameras),
        }
    }

    /// Swap the codec binary (tests use a stub tool).
    pub fn with_grabber(mut self, grabber: FrameGrabber) -> Self {
        self.grabber = grabber;
        self
    }

    /// Schedule a capture and return immediately. Failures are logged and
    /// counted by the capture itself; the press has no result channel.
    pub fn spawn(self: &Arc<Self>, source: &str) {
        let service = self.clone();
        let source = source.to_string();
        tokio::spawn(async move {
            let _ = service.capture(&source).await;
        });
    }

    /// Perform one capture and return the inserted row.
    pub async fn capture(&self, source: &str) -> Result<ImageRecord> {
        let snap = self.settings.current();
        let cam = snap
            .camera(source)
            .ok_or_else(|| StillpostError::Config(format!("Unknown capture source '{source}'")))?
            .clone();
        if !cam.enabled {
            return Err(CameraError::Disabled {
                name: source.to_string(),
            }
            .into());
        }
        let url = snap.camera_url(&cam).ok_or_else(|| {
            StillpostError::Config(format!("Camera '{source}' has no IP or RTSP URL configured"))
        })?;

        let captured_at = Utc::now().timestamp();
        let filename = format!("{source}_{captured_at}.jpg");
        ensure_storage_dir(&snap.storage.image_path)?;
        let path = snap.storage.image_path.join(&filename);

        let _permit = self
            .permits
            .acquire()
            .await
            .expect("capture semaphore is never closed");

        match self
            .grabber
            .grab(&url, &path, GRAB_TIMEOUT, JPEG_QUALITY)
            .await
        {
            Ok(size_bytes) => {
                let inserted = self
                    .store
                    .insert(
                        source,
                        &filename,
                        &path.to_string_lossy(),
                        captured_at,
                        size_bytes as i64,
                    )
                    .await;
                match inserted {
                    Ok(record) => {
                        self.stats.record_success(source, captured_at);
                        info!(source, filename = %record.filename, size_bytes, "Frame captured");
                        Ok(record)
                    }
                    Err(e) => {
                        // Keep row⇔file consistent: no row, no file.
                        let _ = tokio::fs::remove_file(&path).await;
                        self.stats.record_failure(source, &e.to_string());
                        warn!(source, error = %e, "Captured frame could not be recorded");
                        Err(e)
                    }
                }
            }
            Err(e) => {
                self.stats.record_failure(source, &e.to_string());
                warn!(source, error = %e, "Capture failed");
                Err(e.into())
            }
        }
    }
}

/// Create the storage directory on demand, world-readable.
pub fn ensure_storage_dir(dir: &Path) -> Result<()> {
    if dir.is_dir() {
        return Ok(());
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o755)
            .create(dir)?;
    }
    #[cfg(not(unix))]
    std::fs::create_dir_all(dir)?;
    Ok(())
}
