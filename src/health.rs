//! Health monitor — camera liveness probes and host telemetry.
//!
//! Every cycle, each enabled camera gets a short bounded probe against its
//! RTSP URL, and the CPU temperature is read from sysfs. Results are
//! snapshot-style: the dashboard always sees the last observed value,
//! never a stream. The monitor runs on its own task and never blocks
//! capture or upload.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info};

use crate::grabber::FrameGrabber;
use crate::settings::Settings;

/// How often cameras are probed.
pub const CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Budget for one camera probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

const CPU_TEMP_PATH: &str = "/sys/class/thermal/thermal_zone0/temp";

#[derive(Debug, Clone, Serialize)]
pub struct CameraHealth {
    pub source: String,
    pub name: String,
    pub enabled: bool,
    /// `None` until the first probe (or while the camera is disabled).
    pub reachable: Option<bool>,
    pub checked_at: Option<i64>,
    pub last_error: Option<String>,
}

#[derive(Default)]
pub struct HealthState {
    cameras: RwLock<HashMap<String, CameraHealth>>,
    cpu_temp_c: RwLock<Option<f64>>,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cameras(&self) -> Vec<CameraHealth> {
        let mut list: Vec<CameraHealth> = self.cameras.read().values().cloned().collect();
        list.sort_by(|a, b| a.source.cmp(&b.source));
        list
    }

    pub fn cpu_temp_c(&self) -> Option<f64> {
        *self.cpu_temp_c.read()
    }

    fn record_camera(&self, health: CameraHealth) {
        self.cameras.write().insert(health.source.clone(), health);
    }

    fn set_cpu_temp(&self, temp: Option<f64>) {
        *self.cpu_temp_c.write() = temp;
    }
}

pub struct HealthMonitor {
    settings: Arc<Settings>,
    state: Arc<HealthState>,
    grabber: FrameGrabber,
}

impl HealthMonitor {
    pub fn new(settings: Arc<Settings>, state: Arc<HealthState>) -> Self {
        HealthMonitor {
            settings,
            state,
            grabber: FrameGrabber::new(),
        }
    }

    pub async fn run(self) {
        info!("Health monitor started");
        loop {
            self.sweep().await;
            tokio::time::sleep(CHECK_INTERVAL).await;
        }
    }

    async fn sweep(&self) {
        let snap = self.settings.current();
        for cam in &snap.cameras {
            if !cam.enabled {
                self.state.record_camera(CameraHealth {
                    source: cam.source.clone(),
                    name: cam.name.clone(),
                    enabled: false,
                    reachable: None,
                    checked_at: None,
                    last_error: None,
                });
                continue;
            }

            let result = match snap.camera_url(cam) {
                Some(url) => self.grabber.probe(&url, PROBE_TIMEOUT).await,
                None => Err(crate::error::CameraError::Unreachable(
                    "no IP or RTSP URL configured".to_string(),
                )),
            };
            let checked_at = Utc::now().timestamp();
            let health = match result {
                Ok(()) => CameraHealth {
                    source: cam.source.clone(),
                    name: cam.name.clone(),
                    enabled: true,
                    reachable: Some(true),
                    checked_at: Some(checked_at),
                    last_error: None,
                },
                Err(e) => CameraHealth {
                    source: cam.source.clone(),
                    name: cam.name.clone(),
                    enabled: true,
                    reachable: Some(false),
                    checked_at: Some(checked_at),
                    last_error: Some(e.to_string()),
                },
            };
            debug!(source = %cam.source, reachable = ?health.reachable, "Camera probed");
            self.state.record_camera(health);
        }

        self.state.set_cpu_temp(read_cpu_temp().await);
    }
}

/// CPU temperature in °C from the well-known sysfs path; `None` when the
/// platform does not expose it.
async fn read_cpu_temp() -> Option<f64> {
    let raw = tokio::fs::read_to_string(CPU_TEMP_PATH).await.ok()?;
    let millidegrees: f64 = raw.trim().parse().ok()?;
    Some(millidegrees / 1000.0)
}
