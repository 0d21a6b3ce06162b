//! Runtime settings store.
//!
//! Configuration lives in a flat `KEY=VALUE` environment file. The file is
//! parsed into an immutable [`Snapshot`] which is published behind an atomic
//! swap: readers grab an `Arc` and never observe a torn value. Edits go
//! through [`Settings::update`], which rewrites the file atomically
//! (temp file + rename) before swapping the snapshot, so the file write is
//! the durability boundary.
//!
//! Hot keys take effect on the next read; cold keys (bind address, GPIO
//! pins, storage directory, auth) require a restart.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{Result, StillpostError};

/// Highest camera index probed when deriving descriptors from the key set.
const MAX_CAMERAS: u8 = 8;

const DEFAULT_BOUNCE_MS: u64 = 300;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_DELAY_SECS: u64 = 5;
const DEFAULT_CONNECTIVITY_CHECK_SECS: u64 = 60;
const DEFAULT_RETENTION_DAYS: u32 = 120;
const DEFAULT_CLEANUP_INTERVAL_HOURS: u64 = 24;
const DEFAULT_BIND_IP: &str = "0.0.0.0";
const DEFAULT_BIND_PORT: u16 = 8080;
const DEFAULT_IMAGE_PATH: &str = "images";

/// Keys whose edits apply without a restart.
pub const HOT_KEYS: &[&str] = &[
    "CAMERA_USERNAME",
    "CAMERA_PASSWORD",
    "CAMERA_<N>_IP",
    "CAMERA_<N>_RTSP",
    "CAMERA_<N>_ENABLED",
    "CAMERA_<N>_NAME",
    "GPIO_TRIGGER_ENABLED",
    "GPIO_BOUNCE_TIME",
    "UPLOAD_ENABLED",
    "UPLOAD_ENDPOINT",
    "UPLOAD_FIELD_NAME",
    "UPLOAD_AUTH_BEARER",
    "MAX_RETRIES",
    "RETRY_DELAY",
    "CONNECTIVITY_CHECK_INTERVAL",
    "IMAGE_RETENTION_DAYS",
    "CLEANUP_INTERVAL_HOURS",
];

/// Keys that are read once at startup.
pub const COLD_KEYS: &[&str] = &[
    "BIND_IP",
    "BIND_PORT",
    "GPIO_ENABLED",
    "GPIO_PIN_<N>",
    "IMAGE_STORAGE_PATH",
    "WEB_AUTH_ENABLED",
    "PASSWORD_HASH",
    "SECRET_KEY",
];

/// Keys whose values are masked in the config API.
const SECRET_KEYS: &[&str] = &[
    "CAMERA_PASSWORD",
    "UPLOAD_AUTH_BEARER",
    "PASSWORD_HASH",
    "SECRET_KEY",
];

/// One camera position, derived from the key set. Not persisted.
#[derive(Debug, Clone, Serialize)]
pub struct CameraSettings {
    pub index: u8,
    /// Short tag used in filenames and the API (`r1`, `r2`, …).
    pub source: String,
    pub name: String,
    pub enabled: bool,
    pub ip: Option<String>,
    /// Explicit RTSP URL; wins over the constructed form when non-empty.
    pub rtsp_override: Option<String>,
    /// Input line wired to this camera's button, if any.
    pub gpio_pin: Option<u8>,
}

impl CameraSettings {
    /// RTSP URL used at capture time: the override if non-empty, else the
    /// well-known constructed form from IP + shared credentials.
    pub fn rtsp_url(&self, username: &str, password: &str) -> Option<String> {
        if let Some(url) = &self.rtsp_override {
            if !url.is_empty() {
                return Some(url.clone());
            }
        }
        self.ip.as_ref().map(|ip| {
            format!("rtsp://{username}:{password}@{ip}:554/Streaming/Channels/101")
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GpioSettings {
    pub enabled: bool,
    pub trigger_enabled: bool,
    pub bounce_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadSettings {
    pub enabled: bool,
    pub endpoint: Option<String>,
    /// Multipart form field name. Required configuration: there is no safe
    /// default, the intake variants disagree on it.
    pub field_name: Option<String>,
    #[serde(skip_serializing)]
    pub auth_bearer: Option<String>,
    pub max_retries: u32,
    pub retry_delay_secs: u64,
    pub connectivity_check_secs: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StorageSettings {
    pub image_path: PathBuf,
    pub retention_days: u32,
    pub cleanup_interval_hours: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuthSettings {
    pub web_auth_enabled: bool,
    #[serde(skip_serializing)]
    pub password_hash: Option<String>,
    #[serde(skip_serializing)]
    pub secret_key: Option<String>,
}

/// Immutable view of the full configuration. Replaced wholesale on reload.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    #[serde(skip_serializing)]
    pub camera_username: String,
    #[serde(skip_serializing)]
    pub camera_password: String,
    pub cameras: Vec<CameraSettings>,
    pub gpio: GpioSettings,
    pub upload: UploadSettings,
    pub storage: StorageSettings,
    pub bind_ip: String,
    pub bind_port: u16,
    pub auth: AuthSettings,
}

impl Snapshot {
    pub fn camera(&self, source: &str) -> Option<&CameraSettings> {
        self.cameras.iter().find(|c| c.source == source)
    }

    pub fn camera_url(&self, cam: &CameraSettings) -> Option<String> {
        cam.rtsp_url(&self.camera_username, &self.camera_password)
    }

    fn from_map(map: &BTreeMap<String, String>) -> Result<Self> {
        let mut cameras = Vec::new();
        for index in 1..=MAX_CAMERAS {
            let ip = non_empty(map.get(&format!("CAMERA_{index}_IP")));
            let rtsp = non_empty(map.get(&format!("CAMERA_{index}_RTSP")));
            if ip.is_none() && rtsp.is_none() {
                continue;
            }
            cameras.push(CameraSettings {
                index,
                source: format!("r{index}"),
                name: non_empty(map.get(&format!("CAMERA_{index}_NAME")))
                    .unwrap_or_else(|| format!("Camera {index}")),
                enabled: get_bool(map, &format!("CAMERA_{index}_ENABLED"), true)?,
                ip,
                rtsp_override: rtsp,
                gpio_pin: get_opt_u8(map, &format!("GPIO_PIN_{index}"))?,
            });
        }

        Ok(Snapshot {
            camera_username: map.get("CAMERA_USERNAME").cloned().unwrap_or_default(),
            camera_password: map.get("CAMERA_PASSWORD").cloned().unwrap_or_default(),
            cameras,
            gpio: GpioSettings {
                enabled: get_bool(map, "GPIO_ENABLED", false)?,
                trigger_enabled: get_bool(map, "GPIO_TRIGGER_ENABLED", true)?,
                bounce_ms: get_u64(map, "GPIO_BOUNCE_TIME", DEFAULT_BOUNCE_MS)?,
            },
            upload: UploadSettings {
                enabled: get_bool(map, "UPLOAD_ENABLED", false)?,
                endpoint: non_empty(map.get("UPLOAD_ENDPOINT")),
                field_name: non_empty(map.get("UPLOAD_FIELD_NAME")),
                auth_bearer: non_empty(map.get("UPLOAD_AUTH_BEARER")),
                max_retries: get_u64(map, "MAX_RETRIES", DEFAULT_MAX_RETRIES as u64)? as u32,
                retry_delay_secs: get_u64(map, "RETRY_DELAY", DEFAULT_RETRY_DELAY_SECS)?,
                connectivity_check_secs: get_u64(
                    map,
                    "CONNECTIVITY_CHECK_INTERVAL",
                    DEFAULT_CONNECTIVITY_CHECK_SECS,
                )?,
            },
            storage: StorageSettings {
                image_path: PathBuf::from(
                    non_empty(map.get("IMAGE_STORAGE_PATH"))
                        .unwrap_or_else(|| DEFAULT_IMAGE_PATH.to_string()),
                ),
                retention_days: get_u64(map, "IMAGE_RETENTION_DAYS", DEFAULT_RETENTION_DAYS as u64)?
                    as u32,
                cleanup_interval_hours: get_u64(
                    map,
                    "CLEANUP_INTERVAL_HOURS",
                    DEFAULT_CLEANUP_INTERVAL_HOURS,
                )?,
            },
            bind_ip: non_empty(map.get("BIND_IP")).unwrap_or_else(|| DEFAULT_BIND_IP.to_string()),
            bind_port: get_u64(map, "BIND_PORT", DEFAULT_BIND_PORT as u64)? as u16,
            auth: AuthSettings {
                web_auth_enabled: get_bool(map, "WEB_AUTH_ENABLED", false)?,
                password_hash: non_empty(map.get("PASSWORD_HASH")),
                secret_key: non_empty(map.get("SECRET_KEY")),
            },
        })
    }
}

/// Process-wide settings handle. `current()` is read on every use by the
/// other components, so edits take effect without a restart.
pub struct Settings {
    path: PathBuf,
    raw: RwLock<BTreeMap<String, String>>,
    snapshot: RwLock<Arc<Snapshot>>,
}

impl Settings {
    /// Load the settings file. A missing file starts the daemon on defaults
    /// (no cameras, everything disabled); any other read error is fatal.
    pub fn load(path: &Path) -> Result<Self> {
        let map = match std::fs::read_to_string(path) {
            Ok(text) => parse_env(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "Settings file not found, starting with defaults");
                BTreeMap::new()
            }
            Err(e) => {
                return Err(StillpostError::Config(format!(
                    "Cannot read settings file {}: {e}",
                    path.display()
                )))
            }
        };
        let snapshot = Snapshot::from_map(&map)?;
        Ok(Settings {
            path: path.to_path_buf(),
            raw: RwLock::new(map),
            snapshot: RwLock::new(Arc::new(snapshot)),
        })
    }

    /// The active snapshot. Cheap; clone of an `Arc`.
    pub fn current(&self) -> Arc<Snapshot> {
        self.snapshot.read().clone()
    }

    /// Re-parse the file and swap the snapshot.
    pub fn reload(&self) -> Result<Arc<Snapshot>> {
        let text = std::fs::read_to_string(&self.path).map_err(|e| {
            StillpostError::Config(format!(
                "Cannot read settings file {}: {e}",
                self.path.display()
            ))
        })?;
        let map = parse_env(&text);
        let snapshot = Arc::new(Snapshot::from_map(&map)?);
        *self.raw.write() = map;
        *self.snapshot.write() = snapshot.clone();
        info!("Settings reloaded from file");
        Ok(snapshot)
    }

    /// Merge `patch` into the current key set, persist atomically, then
    /// publish the new snapshot. Rejects unrecognized keys and values that
    /// fail validation, leaving both file and snapshot untouched.
    pub fn update(&self, patch: BTreeMap<String, String>) -> Result<Arc<Snapshot>> {
        for key in patch.keys() {
            if !recognized_key(key) {
                return Err(StillpostError::Config(format!(
                    "Unrecognized settings key '{key}'"
                )));
            }
        }

        let mut merged = self.raw.read().clone();
        for (key, value) in &patch {
            merged.insert(key.clone(), value.clone());
        }
        // Validate before touching the file.
        let snapshot = Arc::new(Snapshot::from_map(&merged)?);

        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, render_env(&merged))?;
        std::fs::rename(&tmp, &self.path)?;

        *self.raw.write() = merged;
        *self.snapshot.write() = snapshot.clone();
        info!(keys = ?patch.keys().collect::<Vec<_>>(), "Settings updated");
        Ok(snapshot)
    }

    /// Raw key set with secret values masked, for the config API.
    pub fn redacted(&self) -> BTreeMap<String, String> {
        self.raw
            .read()
            .iter()
            .map(|(k, v)| {
                if SECRET_KEYS.contains(&k.as_str()) && !v.is_empty() {
                    (k.clone(), "<redacted>".to_string())
                } else {
                    (k.clone(), v.clone())
                }
            })
            .collect()
    }
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value.filter(|v| !v.is_empty()).cloned()
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn get_bool(map: &BTreeMap<String, String>, key: &str, default: bool) -> Result<bool> {
    match map.get(key) {
        None => Ok(default),
        Some(v) if v.is_empty() => Ok(default),
        Some(v) => parse_bool(v).ok_or_else(|| {
            StillpostError::Config(format!("{key}: expected a boolean, got '{v}'"))
        }),
    }
}

fn get_u64(map: &BTreeMap<String, String>, key: &str, default: u64) -> Result<u64> {
    match map.get(key) {
        None => Ok(default),
        Some(v) if v.is_empty() => Ok(default),
        Some(v) => v.parse().map_err(|_| {
            StillpostError::Config(format!("{key}: expected an integer, got '{v}'"))
        }),
    }
}

fn get_opt_u8(map: &BTreeMap<String, String>, key: &str) -> Result<Option<u8>> {
    match map.get(key) {
        None => Ok(None),
        Some(v) if v.is_empty() => Ok(None),
        Some(v) => v.parse().map(Some).map_err(|_| {
            StillpostError::Config(format!("{key}: expected a pin number, got '{v}'"))
        }),
    }
}

/// Matches `CAMERA_<N>_IP|RTSP|ENABLED|NAME` and `GPIO_PIN_<N>`.
fn per_camera_key(key: &str) -> bool {
    if let Some(rest) = key.strip_prefix("CAMERA_") {
        if let Some((n, field)) = rest.split_once('_') {
            return n.parse::<u8>().is_ok()
                && matches!(field, "IP" | "RTSP" | "ENABLED" | "NAME");
        }
    }
    if let Some(n) = key.strip_prefix("GPIO_PIN_") {
        return n.parse::<u8>().is_ok();
    }
    false
}

fn recognized_key(key: &str) -> bool {
    matches!(
        key,
        "CAMERA_USERNAME"
            | "CAMERA_PASSWORD"
            | "GPIO_ENABLED"
            | "GPIO_TRIGGER_ENABLED"
            | "GPIO_BOUNCE_TIME"
            | "UPLOAD_ENABLED"
            | "UPLOAD_ENDPOINT"
            | "UPLOAD_FIELD_NAME"
            | "UPLOAD_AUTH_BEARER"
            | "MAX_RETRIES"
            | "RETRY_DELAY"
            | "CONNECTIVITY_CHECK_INTERVAL"
            | "IMAGE_STORAGE_PATH"
            | "IMAGE_RETENTION_DAYS"
            | "CLEANUP_INTERVAL_HOURS"
            | "BIND_IP"
            | "BIND_PORT"
            | "WEB_AUTH_ENABLED"
            | "PASSWORD_HASH"
            | "SECRET_KEY"
    ) || per_camera_key(key)
}

fn parse_env(text: &str) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            map.insert(
                key.trim().to_string(),
                value.trim().trim_matches('"').to_string(),
            );
        }
    }
    map
}

fn render_env(map: &BTreeMap<String, String>) -> String {
    let mut out = String::from("# stillpost settings — edited via the dashboard, one KEY=VALUE per line\n");
    for (key, value) in map {
        out.push_str(key);
        out.push('=');
        out.push_str(value);
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings_from(text: &str) -> (Settings, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("stillpost.env");
        std::fs::write(&path, text).expect("write env");
        let settings = Settings::load(&path).expect("load");
        (settings, dir)
    }

    #[test]
    fn parses_cameras_from_key_set() {
        let (settings, _dir) = settings_from(
            "CAMERA_USERNAME=admin\n\
             CAMERA_PASSWORD=pw\n\
             CAMERA_1_IP=10.0.0.11\n\
             CAMERA_1_NAME=Gate\n\
             GPIO_PIN_1=17\n\
             CAMERA_2_IP=10.0.0.12\n\
             CAMERA_2_ENABLED=false\n",
        );
        let snap = settings.current();
        assert_eq!(snap.cameras.len(), 2);

        let r1 = snap.camera("r1").expect("r1");
        assert_eq!(r1.name, "Gate");
        assert!(r1.enabled);
        assert_eq!(r1.gpio_pin, Some(17));
        assert_eq!(
            snap.camera_url(r1).as_deref(),
            Some("rtsp://admin:pw@10.0.0.11:554/Streaming/Channels/101")
        );

        let r2 = snap.camera("r2").expect("r2");
        assert!(!r2.enabled);
        assert_eq!(r2.name, "Camera 2");
    }

    #[test]
    fn rtsp_override_wins_over_constructed_url() {
        let (settings, _dir) = settings_from(
            "CAMERA_1_IP=10.0.0.11\nCAMERA_1_RTSP=rtsp://other/stream\n",
        );
        let snap = settings.current();
        let cam = snap.camera("r1").expect("r1");
        assert_eq!(snap.camera_url(cam).as_deref(), Some("rtsp://other/stream"));
    }

    #[test]
    fn comments_and_blank_lines_are_ignored() {
        let map = parse_env("# comment\n\nBIND_PORT=9000\nBIND_IP=\"127.0.0.1\"\n");
        assert_eq!(map.get("BIND_PORT").map(String::as_str), Some("9000"));
        assert_eq!(map.get("BIND_IP").map(String::as_str), Some("127.0.0.1"));
    }

    #[test]
    fn update_rejects_unknown_keys() {
        let (settings, _dir) = settings_from("BIND_PORT=9000\n");
        let mut patch = BTreeMap::new();
        patch.insert("NOT_A_KEY".to_string(), "1".to_string());
        assert!(settings.update(patch).is_err());
    }

    #[test]
    fn update_rejects_bad_values_without_touching_state() {
        let (settings, _dir) = settings_from("BIND_PORT=9000\n");
        let mut patch = BTreeMap::new();
        patch.insert("MAX_RETRIES".to_string(), "lots".to_string());
        assert!(settings.update(patch).is_err());
        assert_eq!(settings.current().upload.max_retries, 3);
    }

    #[test]
    fn update_persists_and_swaps_snapshot() {
        let (settings, _dir) = settings_from("UPLOAD_ENABLED=false\n");
        let mut patch = BTreeMap::new();
        patch.insert("UPLOAD_ENABLED".to_string(), "true".to_string());
        patch.insert(
            "UPLOAD_ENDPOINT".to_string(),
            "http://intake.example/upload".to_string(),
        );
        patch.insert("UPLOAD_FIELD_NAME".to_string(), "singleFile".to_string());
        settings.update(patch).expect("update");

        let snap = settings.current();
        assert!(snap.upload.enabled);
        assert_eq!(
            snap.upload.endpoint.as_deref(),
            Some("http://intake.example/upload")
        );

        // The file was rewritten; a reload sees the same values.
        let reloaded = settings.reload().expect("reload");
        assert!(reloaded.upload.enabled);
        assert_eq!(reloaded.upload.field_name.as_deref(), Some("singleFile"));
    }

    #[test]
    fn secrets_are_redacted() {
        let (settings, _dir) = settings_from("CAMERA_PASSWORD=hunter2\nBIND_PORT=9000\n");
        let redacted = settings.redacted();
        assert_eq!(
            redacted.get("CAMERA_PASSWORD").map(String::as_str),
            Some("<redacted>")
        );
        assert_eq!(redacted.get("BIND_PORT").map(String::as_str), Some("9000"));
    }

    #[test]
    fn bool_parsing_accepts_common_spellings() {
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool("on"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn defaults_apply_when_file_is_minimal() {
        let (settings, _dir) = settings_from("");
        let snap = settings.current();
        assert!(snap.cameras.is_empty());
        assert_eq!(snap.bind_port, 8080);
        assert_eq!(snap.storage.retention_days, 120);
        assert_eq!(snap.upload.max_retries, 3);
        assert!(snap.upload.field_name.is_none());
        assert!(!snap.gpio.enabled);
    }
}
