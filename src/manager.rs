// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Capture manager: wires the services together and owns the worker set
//! (uploader, health monitor, cleanup, GPIO dispatcher).
//!
//! Worker loops run under a small panic supervisor: a panic is logged at
//! the task boundary and the worker respawns after a short back-off, so no
//! single failure takes the daemon down.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::capture::CaptureService;
use crate::cleanup::CleanupWorker;
use crate::gpio::{default_edge_source, GpioService};
use crate::health::{HealthMonitor, HealthState};
use crate::settings::Settings;
use crate::stats::{CaptureStats, CleanupStats, UploadState};
use crate::store::ImageStore;
use crate::uploader::Uploader;

const RESPAWN_BACKOFF: Duration = Duration::from_secs(5);

pub struct CaptureManager {
    pub settings: Arc<Settings>,
    pub store: Arc<ImageStore>,
    pub capture: Arc<CaptureService>,
    pub capture_stats: Arc<CaptureStats>,
    pub gpio: Arc<GpioService>,
    pub upload_state: Arc<UploadState>,
    pub cleanup_stats: Arc<CleanupStats>,
    pub health: Arc<HealthState>,
    workers: Vec<JoinHandle<()>>,
}

impl CaptureManager {
    pub fn new(settings: Arc<Settings>, store: Arc<ImageStore>) -> Self {
        let capture_stats = Arc::new(CaptureStats::new());
        let capture = Arc::new(CaptureService::new(
            settings.clone(),
            store.clone(),
            capture_stats.clone(),
        ));
        let gpio = GpioService::new(settings.clone(), capture.clone(), default_edge_source());

        CaptureManager {
            settings,
            store,
            capture,
            capture_stats,
            gpio,
            upload_state: Arc::new(UploadState::new()),
            cleanup_stats: Arc::new(CleanupStats::new()),
            health: Arc::new(HealthState::new()),
            workers: Vec::new(),
        }
    }

    /// Spawn the worker set. Components that cannot start (GPIO with no
    /// claimable lines) are disabled individually; the rest run on.
    pub fn start(&mut self) {
        let settings = self.settings.clone();
        let store = self.store.clone();
        let upload_state = self.upload_state.clone();
        self.workers.push(supervise("uploader", move || {
            let settings = settings.clone();
            let store = store.clone();
            let upload_state = upload_state.clone();
            async move {
                match Uploader::new(settings, store, upload_state) {
                    Ok(uploader) => uploader.run().await,
                    Err(e) => error!(error = %e, "Uploader could not start"),
                }
            }
        }));

        let settings = self.settings.clone();
        let health = self.health.clone();
        self.workers.push(supervise("health-monitor", move || {
            let monitor = HealthMonitor::new(settings.clone(), health.clone());
            async move { monitor.run().await }
        }));

        let settings = self.settings.clone();
        let store = self.store.clone();
        let cleanup_stats = self.cleanup_stats.clone();
        self.workers.push(supervise("cleanup", move || {
            let worker = CleanupWorker::new(settings.clone(), store.clone(), cleanup_stats.clone());
            async move { worker.run().await }
        }));

        if let Some(handle) = self.gpio.start() {
            self.workers.push(handle);
        }

        info!(workers = self.workers.len(), "Capture manager started");
    }

    /// Abort the workers and release the GPIO lines. Called on shutdown.
    pub fn shutdown(self) {
        info!("stillpost shutting down…");
        for handle in self.workers {
            handle.abort();
        }
        self.gpio.shutdown();
        info!("Workers stopped");
    }
}

/// Run `factory()` to completion, restarting it after a back-off when it
/// panics. A clean exit or a cancellation ends the supervisor.
fn supervise<F, Fut>(name: &'static str, factory: F) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let worker = tokio::spawn(factory());
            match worker.await {
                Ok(()) => {
                    info!(worker = name, "Worker exited");
                    break;
                }
                Err(e) if e.is_panic() => {
                    error!(worker = name, "Worker panicked, restarting after back-off");
                    tokio::time::sleep(RESPAWN_BACKOFF).await;
                }
                Err(_) => break,
            }
        }
    })
}
