// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! stillpost — button-triggered still capture daemon
//!
//! Usage:
//!   stillpost run           --config stillpost.env
//!   stillpost status        --config stillpost.env
//!   stillpost capture       --config stillpost.env --source r1
//!   stillpost cleanup       --config stillpost.env
//!   stillpost hash-password <password>

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use stillpost::api;
use stillpost::auth;
use stillpost::capture::{ensure_storage_dir, CaptureService};
use stillpost::cleanup;
use stillpost::manager::CaptureManager;
use stillpost::settings::Settings;
use stillpost::stats::{CaptureStats, CleanupStats};
use stillpost::store::ImageStore;

/// Queue database path, fixed relative to the working directory.
const DB_PATH: &str = "images.db";

#[derive(Parser)]
#[command(name = "stillpost", about = "Button-triggered still capture daemon", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the capture daemon.
    Run {
        #[arg(short, long, default_value = "stillpost.env")]
        config: PathBuf,
    },
    /// Print a brief queue/status snapshot and exit.
    Status {
        #[arg(short, long, default_value = "stillpost.env")]
        config: PathBuf,
    },
    /// Grab one frame from a camera and exit.
    Capture {
        #[arg(short, long, default_value = "stillpost.env")]
        config: PathBuf,
        /// Camera tag, e.g. r1.
        #[arg(long)]
        source: String,
    },
    /// Run one retention cleanup pass and exit.
    Cleanup {
        #[arg(short, long, default_value = "stillpost.env")]
        config: PathBuf,
    },
    /// Hash a dashboard password for PASSWORD_HASH.
    HashPassword { password: String },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run { config } => run_daemon(config).await,
        Command::Status { config } => run_status(config).await,
        Command::Capture { config, source } => run_capture(config, &source).await,
        Command::Cleanup { config } => run_cleanup(config).await,
        Command::HashPassword { password } => run_hash_password(&password),
    }
}

fn load_settings(config_path: &Path) -> Arc<Settings> {
    match Settings::load(config_path) {
        Ok(settings) => Arc::new(settings),
        Err(e) => {
            error!(error = %e, "Failed to load settings");
            std::process::exit(1);
        }
    }
}

async fn open_store() -> Arc<ImageStore> {
    match ImageStore::open(Path::new(DB_PATH)).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(error = %e, "Failed to open image database");
            std::process::exit(1);
        }
    }
}

async fn run_daemon(config_path: PathBuf) {
    let settings = load_settings(&config_path);
    let snap = settings.current();

    info!(
        cameras = snap.cameras.len(),
        storage = ?snap.storage.image_path,
        upload_enabled = snap.upload.enabled,
        gpio_enabled = snap.gpio.enabled,
        "Starting stillpost"
    );

    if let Err(e) = ensure_storage_dir(&snap.storage.image_path) {
        error!(error = %e, path = ?snap.storage.image_path, "Cannot create storage directory");
        std::process::exit(1);
    }

    let store = open_store().await;

    let mut manager = CaptureManager::new(settings.clone(), store.clone());
    manager.start();

    let state = Arc::new(api::AppState {
        settings: settings.clone(),
        store: store.clone(),
        capture: manager.capture.clone(),
        capture_stats: manager.capture_stats.clone(),
        upload_state: manager.upload_state.clone(),
        cleanup_stats: manager.cleanup_stats.clone(),
        health: manager.health.clone(),
        gpio: manager.gpio.clone(),
        started_at: Instant::now(),
    });

    let addr = format!("{}:{}", snap.bind_ip, snap.bind_port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, addr, "Failed to bind HTTP server");
            std::process::exit(1);
        }
    };
    info!(addr, "Dashboard listening on http://{}", addr);
    tokio::spawn(async move {
        api::start_server(state, listener).await;
    });

    // Wait for CTRL+C.
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received CTRL+C, shutting down…"),
        Err(e) => error!(error = %e, "Signal error"),
    }

    manager.shutdown();
}

async fn run_status(config_path: PathBuf) {
    let settings = load_settings(&config_path);
    let snap = settings.current();
    let store = open_store().await;

    let counts = match store.counts().await {
        Ok(counts) => counts,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };
    let per_source = store.source_counts().await.unwrap_or_default();

    let enabled = snap.cameras.iter().filter(|c| c.enabled).count();
    println!("=== stillpost status ===");
    println!("Cameras : {} configured, {} enabled", snap.cameras.len(), enabled);
    println!("Storage : {}", snap.storage.image_path.display());
    println!(
        "Queue   : {} pending / {} uploaded / {} abandoned ({} total)",
        counts.pending, counts.uploaded, counts.abandoned, counts.total
    );
    for row in per_source {
        println!("  {}: {} images ({} uploaded)", row.source, row.total, row.uploaded);
    }
}

async fn run_capture(config_path: PathBuf, source: &str) {
    let settings = load_settings(&config_path);
    let store = open_store().await;
    let service = CaptureService::new(settings, store, Arc::new(CaptureStats::new()));

    match service.capture(source).await {
        Ok(record) => {
            println!(
                "Captured {} ({} bytes) → {}",
                record.filename, record.size_bytes, record.path
            );
        }
        Err(e) => {
            eprintln!("Capture failed: {e}");
            std::process::exit(1);
        }
    }
}

async fn run_cleanup(config_path: PathBuf) {
    let settings = load_settings(&config_path);
    let store = open_store().await;

    match cleanup::run_once(&store, &settings, &CleanupStats::new()).await {
        Ok(report) => {
            println!(
                "Cleanup: {} examined, {} deleted, {} bytes reclaimed, {} skipped",
                report.examined, report.deleted, report.bytes_reclaimed, report.skipped
            );
        }
        Err(e) => {
            eprintln!("Cleanup failed: {e}");
            std::process::exit(1);
        }
    }
}

fn run_hash_password(password: &str) {
    match auth::hash_password(password) {
        Ok(hash) => println!("{hash}"),
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    }
}
