// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Capture service integration tests.
//!
//! The codec subprocess is replaced by a small shell stub so the full
//! grab→verify→insert path runs without cameras or ffmpeg.

#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;

use stillpost::capture::CaptureService;
use stillpost::error::{CameraError, StillpostError};
use stillpost::grabber::FrameGrabber;
use stillpost::settings::Settings;
use stillpost::stats::CaptureStats;
use stillpost::store::ImageStore;

/// Writes a JPEG header plus filler to its last argument, like a grab that
/// succeeded.
const OK_TOOL: &str = "#!/bin/sh\nfor last; do :; done\nprintf '\\377\\330fake-frame' > \"$last\"\n";

/// Fails the way ffmpeg does when the camera is down.
const REFUSED_TOOL: &str = "#!/bin/sh\necho 'rtsp://10.0.0.11: Connection refused' >&2\nexit 1\n";

/// Exits cleanly without producing a file.
const SILENT_TOOL: &str = "#!/bin/sh\nexit 0\n";

fn tmp_dir() -> TempDir {
    tempfile::tempdir().expect("create tempdir")
}

fn stub_tool(dir: &Path, script: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join("fake-ffmpeg");
    std::fs::write(&path, script).expect("write stub tool");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod");
    path
}

fn load_settings(dir: &Path) -> Arc<Settings> {
    let path = dir.join("stillpost.env");
    let text = format!(
        "CAMERA_USERNAME=admin\n\
         CAMERA_PASSWORD=pw\n\
         CAMERA_1_IP=10.0.0.11\n\
         CAMERA_2_IP=10.0.0.12\n\
         CAMERA_2_ENABLED=false\n\
         IMAGE_STORAGE_PATH={}\n",
        dir.join("images").display()
    );
    std::fs::write(&path, text).expect("write settings");
    Arc::new(Settings::load(&path).expect("load settings"))
}

async fn service_with_tool(dir: &Path, script: &str) -> (CaptureService, Arc<ImageStore>, Arc<CaptureStats>) {
    let settings = load_settings(dir);
    let store = Arc::new(ImageStore::open(&dir.join("images.db")).await.expect("open store"));
    let stats = Arc::new(CaptureStats::new());
    let tool = stub_tool(dir, script);
    let service = CaptureService::new(settings, store.clone(), stats.clone())
        .with_grabber(FrameGrabber::with_tool(tool.to_string_lossy()));
    (service, store, stats)
}

#[tokio::test]
async fn capture_writes_the_file_and_the_row_together() {
    let dir = tmp_dir();
    let (service, store, stats) = service_with_tool(dir.path(), OK_TOOL).await;

    let record = service.capture("r1").await.expect("capture");

    assert!(record.filename.starts_with("r1_"));
    assert!(record.filename.ends_with(".jpg"));
    assert_eq!(record.source, "r1");
    assert!(record.size_bytes > 0);
    assert!(!record.uploaded);
    assert_eq!(record.attempts, 0);

    // File and row exist as a pair.
    assert!(Path::new(&record.path).exists());
    let row = store
        .by_filename(&record.filename)
        .await
        .expect("fetch")
        .expect("row exists");
    assert_eq!(row.captured_at, record.captured_at);

    // The filename embeds the capture epoch.
    let embedded: i64 = record
        .filename
        .trim_start_matches("r1_")
        .trim_end_matches(".jpg")
        .parse()
        .expect("epoch in filename");
    assert_eq!(embedded, record.captured_at);

    let snapshot = stats.snapshot();
    assert_eq!(snapshot.get("r1").map(|s| s.ok), Some(1));
}

#[tokio::test]
async fn disabled_camera_is_refused_without_side_effects() {
    let dir = tmp_dir();
    let (service, store, stats) = service_with_tool(dir.path(), OK_TOOL).await;

    let result = service.capture("r2").await;
    assert!(matches!(
        result,
        Err(StillpostError::Camera(CameraError::Disabled { .. }))
    ));
    assert_eq!(store.count(None).await.expect("count"), 0);
    assert!(stats.snapshot().is_empty());
}

#[tokio::test]
async fn unknown_source_is_a_config_error() {
    let dir = tmp_dir();
    let (service, store, _stats) = service_with_tool(dir.path(), OK_TOOL).await;

    let result = service.capture("r9").await;
    assert!(matches!(result, Err(StillpostError::Config(_))));
    assert_eq!(store.count(None).await.expect("count"), 0);
}

#[tokio::test]
async fn unreachable_camera_leaves_no_row() {
    let dir = tmp_dir();
    let (service, store, stats) = service_with_tool(dir.path(), REFUSED_TOOL).await;

    let result = service.capture("r1").await;
    assert!(matches!(
        result,
        Err(StillpostError::Camera(CameraError::Unreachable(_)))
    ));
    assert_eq!(store.count(None).await.expect("count"), 0);

    let snapshot = stats.snapshot();
    let r1 = snapshot.get("r1").expect("failure counted");
    assert_eq!(r1.failed, 1);
    assert_eq!(r1.ok, 0);
    assert!(r1.last_error.is_some());
}

#[tokio::test]
async fn a_grab_that_produces_nothing_is_a_decode_failure() {
    let dir = tmp_dir();
    let (service, store, _stats) = service_with_tool(dir.path(), SILENT_TOOL).await;

    let result = service.capture("r1").await;
    assert!(matches!(
        result,
        Err(StillpostError::Camera(CameraError::DecodeFailed(_)))
    ));
    assert_eq!(store.count(None).await.expect("count"), 0);
}

#[tokio::test]
async fn missing_tool_is_reported_as_such() {
    let dir = tmp_dir();
    let settings = load_settings(dir.path());
    let store = Arc::new(ImageStore::open(&dir.path().join("images.db")).await.expect("open"));
    let service = CaptureService::new(settings, store, Arc::new(CaptureStats::new()))
        .with_grabber(FrameGrabber::with_tool("/nonexistent/ffmpeg"));

    let result = service.capture("r1").await;
    assert!(matches!(
        result,
        Err(StillpostError::Camera(CameraError::ToolMissing(_)))
    ));
}
