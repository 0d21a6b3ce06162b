// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Shared telemetry counters, read by `/api/stats` and `/api/status`.
//!
//! Everything here is a small snapshot-style struct behind a short-held
//! lock; workers record, the HTTP surface reads.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;

// ──────────────── capture counters ────────────────────────────────────────

#[derive(Debug, Default, Clone, Serialize)]
pub struct SourceStats {
    pub ok: u64,
    pub failed: u64,
    pub last_capture_at: Option<i64>,
    pub last_error: Option<String>,
}

#[derive(Default)]
pub struct CaptureStats {
    inner: Mutex<HashMap<String, SourceStats>>,
}

impl CaptureStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, source: &str, captured_at: i64) {
        let mut inner = self.inner.lock();
        let entry = inner.entry(source.to_string()).or_default();
        entry.ok += 1;
        entry.last_capture_at = Some(captured_at);
        entry.last_error = None;
    }

    pub fn record_failure(&self, source: &str, error: &str) {
        let mut inner = self.inner.lock();
        let entry = inner.entry(source.to_string()).or_default();
        entry.failed += 1;
        entry.last_error = Some(error.chars().take(200).collect());
    }

    pub fn snapshot(&self) -> HashMap<String, SourceStats> {
        self.inner.lock().clone()
    }
}

// ──────────────── uploader state ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct UploadSummary {
    /// None until the first reachability probe completes.
    pub online: Option<bool>,
    pub uploaded_total: u64,
    pub failed_attempts: u64,
    pub abandoned: u64,
    pub last_upload_at: Option<i64>,
    pub last_error: Option<String>,
    /// Set while the uploader is idled by missing configuration.
    pub config_error: Option<String>,
}

#[derive(Default)]
struct UploadInner {
    online: Option<bool>,
    last_check: Option<Instant>,
    uploaded_total: u64,
    failed_attempts: u64,
    abandoned: u64,
    last_upload_at: Option<i64>,
    last_error: Option<String>,
    config_error: Option<String>,
}

#[derive(Default)]
pub struct UploadState {
    inner: Mutex<UploadInner>,
}

impl UploadState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached reachability flag, if it is still fresh.
    pub fn cached_online(&self, max_age: Duration) -> Option<bool> {
        let inner = self.inner.lock();
        match (inner.online, inner.last_check) {
            (Some(flag), Some(at)) if at.elapsed() < max_age => Some(flag),
            _ => None,
        }
    }

    /// Store a probe result. Returns the previous flag so the caller can
    /// log state transitions exactly once.
    pub fn set_online(&self, online: bool) -> Option<bool> {
        let mut inner = self.inner.lock();
        let previous = inner.online;
        inner.online = Some(online);
        inner.last_check = Some(Instant::now());
        previous
    }

    /// Returns the previous value so the caller can log changes once.
    pub fn set_config_error(&self, error: Option<String>) -> Option<String> {
        let mut inner = self.inner.lock();
        std::mem::replace(&mut inner.config_error, error)
    }

    pub fn note_uploaded(&self) {
        let mut inner = self.inner.lock();
        inner.uploaded_total += 1;
        inner.last_upload_at = Some(Utc::now().timestamp());
        inner.last_error = None;
    }

    pub fn note_attempt_failed(&self, error: &str) {
        let mut inner = self.inner.lock();
        inner.failed_attempts += 1;
        inner.last_error = Some(error.chars().take(200).collect());
    }

    pub fn note_abandoned(&self) {
        self.inner.lock().abandoned += 1;
    }

    pub fn summary(&self) -> UploadSummary {
        let inner = self.inner.lock();
        UploadSummary {
            online: inner.online,
            uploaded_total: inner.uploaded_total,
            failed_attempts: inner.failed_attempts,
            abandoned: inner.abandoned,
            last_upload_at: inner.last_upload_at,
            last_error: inner.last_error.clone(),
            config_error: inner.config_error.clone(),
        }
    }
}

// ──────────────── cleanup counters ────────────────────────────────────────

#[derive(Debug, Default, Clone, Serialize)]
pub struct CleanupSummary {
    pub runs: u64,
    pub deleted_total: u64,
    pub bytes_reclaimed_total: u64,
    pub last_run_at: Option<i64>,
    pub last_deleted: u64,
}

#[derive(Default)]
pub struct CleanupStats {
    inner: Mutex<CleanupSummary>,
}

impl CleanupStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_run(&self, deleted: u64, bytes_reclaimed: u64) {
        let mut inner = self.inner.lock();
        inner.runs += 1;
        inner.deleted_total += deleted;
        inner.bytes_reclaimed_total += bytes_reclaimed;
        inner.last_run_at = Some(Utc::now().timestamp());
        inner.last_deleted = deleted;
    }

    pub fn summary(&self) -> CleanupSummary {
        self.inner.lock().clone()
    }
}
