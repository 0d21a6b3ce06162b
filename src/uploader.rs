// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Uploader — delivers every pending image row to the remote intake at
//! least once.
//!
//! A single worker drains `uploaded = 0` rows in id order. Each drain pass
//! first consults a cached reachability flag (refreshed at most once per
//! `CONNECTIVITY_CHECK_INTERVAL`); while offline the queue just grows.
//! Per item the worker performs a bounded retry loop (`MAX_RETRIES`
//! attempts, fixed `RETRY_DELAY`); items that still fail stay queued for
//! the next pass. Delivery is at-least-once: a crash between the remote
//! 200 and the local `uploaded = 1` write re-sends the item, and the
//! intake deduplicates on filename.
//!
//! Terminal items leave the queue as `abandoned`: a missing backing file
//! (`last_error = "file_missing"`) or an oversize payload is never POSTed.

use std::sync::Arc;
use std::time::Duration;

use reqwest::multipart;
use tracing::{error, info, warn};

use crate::error::{Result, StillpostError, UploadError};
use crate::settings::Settings;
use crate::stats::UploadState;
use crate::store::{ImageRecord, ImageStore};

/// Hard cap per item; larger files are terminally failed, never POSTed.
pub const MAX_UPLOAD_BYTES: u64 = 15 * 1024 * 1024;

/// Well-known endpoint for the reachability probe.
const CONNECTIVITY_PROBE_URL: &str = "http://connectivitycheck.gstatic.com/generate_204";

const UPLOAD_TIMEOUT: Duration = Duration::from_secs(30);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const BATCH_SIZE: i64 = 10;

/// Pause after a pass with nothing to do or with every item delivered.
const IDLE_PAUSE: Duration = Duration::from_secs(5);
/// Pause while offline, unconfigured, failing, or the database is down.
const HOLD_PAUSE: Duration = Duration::from_secs(15);

enum ItemOutcome {
    Uploaded,
    /// Retriable failure; the row stays in the queue.
    Failed,
    /// Terminal; the row left the queue.
    Abandoned,
}

pub struct Uploader {
    settings: Arc<Settings>,
    store: Arc<ImageStore>,
    state: Arc<UploadState>,
    client: reqwest::Client,
    probe_url: String,
}

impl Uploader {
    pub fn new(
        settings: Arc<Settings>,
        store: Arc<ImageStore>,
        state: Arc<UploadState>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(UPLOAD_TIMEOUT)
            .build()
            .map_err(|e| StillpostError::Config(format!("HTTP client: {e}")))?;
        Ok(Uploader {
            settings,
            store,
            state,
            client,
            probe_url: CONNECTIVITY_PROBE_URL.to_string(),
        })
    }

    /// Point the reachability probe somewhere else (tests, air-gapped
    /// deployments probing the intake host itself).
    pub fn with_probe_url(mut self, url: impl Into<String>) -> Self {
        self.probe_url = url.into();
        self
    }

    /// Drain forever. Never returns; errors back the loop off instead of
    /// unwinding.
    pub async fn run(self) {
        info!("Uploader started");
        loop {
            let pause = self.drain_pass().await;
            tokio::time::sleep(pause).await;
        }
    }

    /// One drain pass over the queue. Returns the pause before the next.
    pub async fn drain_pass(&self) -> Duration {
        let snap = self.settings.current();
        if !snap.upload.enabled {
            return HOLD_PAUSE;
        }

        let (endpoint, field_name) = match (
            snap.upload.endpoint.clone(),
            snap.upload.field_name.clone(),
        ) {
            (Some(endpoint), Some(field)) => {
                if self.state.set_config_error(None).is_some() {
                    info!("Upload configuration complete, resuming queue");
                }
                (endpoint, field)
            }
            (endpoint, field) => {
                let missing = match (endpoint, field) {
                    (None, None) => "UPLOAD_ENDPOINT and UPLOAD_FIELD_NAME are not set",
                    (None, _) => "UPLOAD_ENDPOINT is not set",
                    _ => "UPLOAD_FIELD_NAME is not set (it has no default)",
                };
                if self.state.set_config_error(Some(missing.to_string())).as_deref()
                    != Some(missing)
                {
                    warn!(missing, "Uploader idle: incomplete configuration");
                }
                return HOLD_PAUSE;
            }
        };

        if !self.check_reachability(snap.upload.connectivity_check_secs).await {
            match self.store.counts().await {
                Ok(counts) => {
                    info!(pending = counts.pending, "Intake offline, holding queue")
                }
                Err(e) => error!(error = %e, "Queue unavailable while offline"),
            }
            return HOLD_PAUSE;
        }

        let batch = match self.store.pending(BATCH_SIZE).await {
            Ok(batch) => batch,
            Err(e) => {
                error!(error = %e, "Queue fetch failed, backing off");
                return HOLD_PAUSE;
            }
        };
        if batch.is_empty() {
            return IDLE_PAUSE;
        }

        let mut any_failed = false;
        for row in batch {
            let outcome = self
                .upload_item(
                    &row,
                    &endpoint,
                    &field_name,
                    snap.upload.auth_bearer.as_deref(),
                    snap.upload.max_retries.max(1),
                    Duration::from_secs(snap.upload.retry_delay_secs),
                )
                .await;
            if matches!(outcome, ItemOutcome::Failed) {
                any_failed = true;
            }
        }

        if any_failed {
            HOLD_PAUSE
        } else {
            IDLE_PAUSE
        }
    }

    /// Bounded retry delivery of one row.
    async fn upload_item(
        &self,
        row: &ImageRecord,
        endpoint: &str,
        field_name: &str,
        bearer: Option<&str>,
        max_retries: u32,
        retry_delay: Duration,
    ) -> ItemOutcome {
        let bytes = match tokio::fs::read(&row.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(id = row.id, filename = %row.filename, "Backing file missing, dropping from queue");
                if let Err(e) = self.store.abandon(row.id, "file_missing").await {
                    error!(id = row.id, error = %e, "Could not abandon row");
                    return ItemOutcome::Failed;
                }
                self.state.note_abandoned();
                return ItemOutcome::Abandoned;
            }
            Err(e) => {
                let msg = format!("read: {e}");
                warn!(id = row.id, error = %msg, "Cannot read image for upload");
                if let Err(e) = self.store.record_failure(row.id, &msg).await {
                    error!(id = row.id, error = %e, "Could not record failure");
                }
                self.state.note_attempt_failed(&msg);
                return ItemOutcome::Failed;
            }
        };

        if bytes.len() as u64 > MAX_UPLOAD_BYTES {
            let err = UploadError::Oversize(bytes.len() as u64);
            warn!(id = row.id, size = bytes.len(), "Oversize image, dropping from queue");
            if let Err(e) = self.store.abandon(row.id, &err.to_string()).await {
                error!(id = row.id, error = %e, "Could not abandon row");
                return ItemOutcome::Failed;
            }
            self.state.note_abandoned();
            return ItemOutcome::Abandoned;
        }

        for attempt in 1..=max_retries {
            match self
                .post(&bytes, &row.filename, endpoint, field_name, bearer)
                .await
            {
                Ok(()) => {
                    if let Err(e) = self.store.mark_uploaded(row.id).await {
                        // The intake has the file; at-least-once means the
                        // re-send after restart is acceptable.
                        error!(id = row.id, error = %e, "Uploaded but could not mark row");
                        return ItemOutcome::Failed;
                    }
                    self.state.note_uploaded();
                    info!(id = row.id, filename = %row.filename, attempt, "Image uploaded");
                    return ItemOutcome::Uploaded;
                }
                Err(err) => {
                    let msg = err.to_string();
                    warn!(id = row.id, attempt, max_retries, error = %msg, "Upload attempt failed");
                    if let Err(e) = self.store.record_failure(row.id, &msg).await {
                        error!(id = row.id, error = %e, "Could not record failure");
                    }
                    self.state.note_attempt_failed(&msg);
                    if attempt < max_retries {
                        tokio::time::sleep(retry_delay).await;
                    }
                }
            }
        }
        ItemOutcome::Failed
    }

    async fn post(
        &self,
        bytes: &[u8],
        filename: &str,
        endpoint: &str,
        field_name: &str,
        bearer: Option<&str>,
    ) -> std::result::Result<(), UploadError> {
        let part = multipart::Part::bytes(bytes.to_vec())
            .file_name(filename.to_string())
            .mime_str("image/jpeg")
            .map_err(|e| UploadError::Transport(e.to_string()))?;
        let form = multipart::Form::new().part(field_name.to_string(), part);

        let mut request = self.client.post(endpoint).multipart(form);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }

        match request.send().await {
            Ok(response) if response.status() == reqwest::StatusCode::OK => Ok(()),
            Ok(response) => Err(UploadError::Http(response.status().as_u16())),
            Err(e) => Err(UploadError::Transport(
                e.to_string().chars().take(200).collect(),
            )),
        }
    }

    /// Cached reachability flag; refreshed at most once per `interval`.
    /// Transitions are logged once, not per check.
    async fn check_reachability(&self, interval_secs: u64) -> bool {
        if let Some(flag) = self
            .state
            .cached_online(Duration::from_secs(interval_secs.max(1)))
        {
            return flag;
        }

        let online = self
            .client
            .get(&self.probe_url)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .is_ok();

        let previous = self.state.set_online(online);
        if previous != Some(online) {
            if online {
                info!("Network reachability restored");
            } else {
                warn!("Network unreachable, uploads paused");
            }
        }
        online
    }
}
