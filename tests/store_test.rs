// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Queue store integration tests: invariants of the `images` table and the
//! retention cleanup pass.
//!
//! Run with: `cargo test`

use std::path::Path;

use chrono::Utc;
use tempfile::TempDir;

use stillpost::cleanup;
use stillpost::settings::Settings;
use stillpost::stats::CleanupStats;
use stillpost::store::ImageStore;

fn tmp_dir() -> TempDir {
    tempfile::tempdir().expect("create tempdir")
}

async fn open_store(dir: &Path) -> ImageStore {
    ImageStore::open(&dir.join("images.db")).await.expect("open store")
}

fn load_settings(dir: &Path, extra: &str) -> Settings {
    let path = dir.join("stillpost.env");
    let text = format!(
        "IMAGE_STORAGE_PATH={}\n{extra}",
        dir.join("images").display()
    );
    std::fs::write(&path, text).expect("write settings");
    Settings::load(&path).expect("load settings")
}

/// Write a fake JPEG and insert its row, the way a capture would.
async fn seed_image(store: &ImageStore, images_dir: &Path, source: &str, epoch: i64) -> i64 {
    std::fs::create_dir_all(images_dir).expect("images dir");
    let filename = format!("{source}_{epoch}.jpg");
    let path = images_dir.join(&filename);
    let mut bytes = vec![0xFF, 0xD8];
    bytes.extend_from_slice(b"fake-jpeg-payload");
    std::fs::write(&path, &bytes).expect("write jpeg");
    store
        .insert(source, &filename, &path.to_string_lossy(), epoch, bytes.len() as i64)
        .await
        .expect("insert")
        .id
}

#[tokio::test]
async fn pending_returns_rows_in_id_order() {
    let dir = tmp_dir();
    let store = open_store(dir.path()).await;
    let images = dir.path().join("images");

    let a = seed_image(&store, &images, "r1", 1_700_000_000).await;
    let b = seed_image(&store, &images, "r2", 1_700_000_001).await;
    let c = seed_image(&store, &images, "r1", 1_700_000_002).await;

    let pending = store.pending(10).await.expect("pending");
    let ids: Vec<i64> = pending.iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![a, b, c]);
    assert!(pending.iter().all(|r| !r.uploaded && r.attempts == 0));
}

#[tokio::test]
async fn mark_uploaded_counts_the_attempt_and_clears_the_error() {
    let dir = tmp_dir();
    let store = open_store(dir.path()).await;
    let id = seed_image(&store, &dir.path().join("images"), "r1", 1_700_000_000).await;

    store.record_failure(id, "http 500").await.expect("failure");
    store.mark_uploaded(id).await.expect("mark");

    let row = store
        .by_filename("r1_1700000000.jpg")
        .await
        .expect("fetch")
        .expect("row exists");
    assert!(row.uploaded);
    assert_eq!(row.attempts, 2);
    // uploaded=true implies last_error is null.
    assert!(row.last_error.is_none());
}

#[tokio::test]
async fn attempts_grow_monotonically() {
    let dir = tmp_dir();
    let store = open_store(dir.path()).await;
    let id = seed_image(&store, &dir.path().join("images"), "r1", 1_700_000_000).await;

    let mut previous = 0;
    for n in 1..=3 {
        store.record_failure(id, &format!("http 50{n}")).await.expect("failure");
        let row = store
            .by_filename("r1_1700000000.jpg")
            .await
            .expect("fetch")
            .expect("row");
        assert!(row.attempts > previous);
        previous = row.attempts;
    }
    assert_eq!(previous, 3);
}

#[tokio::test]
async fn abandoned_rows_leave_the_queue_but_stay_listed() {
    let dir = tmp_dir();
    let store = open_store(dir.path()).await;
    let id = seed_image(&store, &dir.path().join("images"), "r1", 1_700_000_000).await;

    store.abandon(id, "file_missing").await.expect("abandon");

    assert!(store.pending(10).await.expect("pending").is_empty());
    let counts = store.counts().await.expect("counts");
    assert_eq!(counts.total, 1);
    assert_eq!(counts.pending, 0);
    assert_eq!(counts.abandoned, 1);

    // Still visible in the listing API.
    let listed = store.list(Some("r1"), 10, 0).await.expect("list");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].last_error.as_deref(), Some("file_missing"));
}

#[tokio::test]
async fn filenames_are_unique() {
    let dir = tmp_dir();
    let store = open_store(dir.path()).await;
    seed_image(&store, &dir.path().join("images"), "r1", 1_700_000_000).await;

    let duplicate = store
        .insert("r1", "r1_1700000000.jpg", "/elsewhere/r1_1700000000.jpg", 1_700_000_000, 10)
        .await;
    assert!(duplicate.is_err());
    assert_eq!(store.count(None).await.expect("count"), 1);
}

#[tokio::test]
async fn by_date_listing_selects_the_calendar_window() {
    let dir = tmp_dir();
    let store = open_store(dir.path()).await;
    let images = dir.path().join("images");

    // 2023-11-14 22:13:20 UTC.
    let inside = 1_700_000_000;
    seed_image(&store, &images, "r1", inside).await;
    seed_image(&store, &images, "r2", inside + 60).await;
    // Two days later.
    seed_image(&store, &images, "r1", inside + 2 * 86_400).await;

    let day_start = inside - (inside % 86_400);
    let rows = store
        .list_between(day_start, day_start + 86_400, None)
        .await
        .expect("list_between");
    assert_eq!(rows.len(), 2);

    let r1_only = store
        .list_between(day_start, day_start + 86_400, Some("r1"))
        .await
        .expect("filtered");
    assert_eq!(r1_only.len(), 1);
    assert_eq!(r1_only[0].source, "r1");
}

#[tokio::test]
async fn retention_cutoff_removes_file_then_row() {
    let dir = tmp_dir();
    let store = open_store(dir.path()).await;
    let settings = load_settings(dir.path(), "IMAGE_RETENTION_DAYS=120\n");
    let images = dir.path().join("images");

    let now = Utc::now().timestamp();
    let expired_epoch = now - 121 * 86_400;
    seed_image(&store, &images, "r1", expired_epoch).await;
    seed_image(&store, &images, "r1", now).await;

    let stats = CleanupStats::new();
    let report = cleanup::run_once(&store, &settings, &stats).await.expect("cleanup");

    assert_eq!(report.deleted, 1);
    assert!(report.bytes_reclaimed > 0);
    assert!(!images.join(format!("r1_{expired_epoch}.jpg")).exists());
    // The fresh capture is untouched.
    assert_eq!(store.count(None).await.expect("count"), 1);
    assert!(images.join(format!("r1_{now}.jpg")).exists());
    assert_eq!(stats.summary().runs, 1);
    assert_eq!(stats.summary().deleted_total, 1);
}

#[tokio::test]
async fn cleanup_twice_is_a_no_op_the_second_time() {
    let dir = tmp_dir();
    let store = open_store(dir.path()).await;
    let settings = load_settings(dir.path(), "IMAGE_RETENTION_DAYS=120\n");
    let images = dir.path().join("images");

    let expired_epoch = Utc::now().timestamp() - 200 * 86_400;
    seed_image(&store, &images, "r2", expired_epoch).await;

    let stats = CleanupStats::new();
    let first = cleanup::run_once(&store, &settings, &stats).await.expect("first");
    assert_eq!(first.deleted, 1);

    let second = cleanup::run_once(&store, &settings, &stats).await.expect("second");
    assert_eq!(second.examined, 0);
    assert_eq!(second.deleted, 0);
    assert_eq!(second.bytes_reclaimed, 0);
}

#[tokio::test]
async fn cleanup_tolerates_an_already_missing_file() {
    let dir = tmp_dir();
    let store = open_store(dir.path()).await;
    let settings = load_settings(dir.path(), "IMAGE_RETENTION_DAYS=30\n");

    let expired_epoch = Utc::now().timestamp() - 40 * 86_400;
    // Row without a backing file: the unit of cleanup is the pair, and a
    // missing file half just means the row goes too.
    store
        .insert(
            "r1",
            &format!("r1_{expired_epoch}.jpg"),
            &dir.path().join("images").join(format!("r1_{expired_epoch}.jpg")).to_string_lossy(),
            expired_epoch,
            0,
        )
        .await
        .expect("insert");

    let report = cleanup::run_once(&store, &settings, &CleanupStats::new())
        .await
        .expect("cleanup");
    assert_eq!(report.deleted, 1);
    assert_eq!(report.skipped, 0);
    assert_eq!(store.count(None).await.expect("count"), 0);
}
