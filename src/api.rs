// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! HTTP facade — runs alongside the capture pipeline.
//!
//! Endpoints:
//!   GET  /login, POST /login, /logout          → session-cookie auth
//!   GET  /api/status                           → system + component status
//!   GET  /api/stats                            → counters
//!   GET  /api/health                           → camera liveness + host telemetry
//!   GET  /api/images?source=&page=&per_page=   → paginated capture list
//!   GET  /api/images/{filename}                → JPEG bytes
//!   GET  /api/images/by-date?date=&source=     → one calendar day
//!   POST /api/capture/{source}                 → synchronous manual capture
//!   POST /api/cleanup/run                      → one-shot retention pass
//!   GET  /api/gpio/status                      → pin states + recent triggers
//!   GET  /api/config/get                       → settings snapshot (redacted)
//!   POST /api/config/update                    → patch settings (hot keys apply live)
//!   POST /api/config/reload                    → re-read the settings file

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::middleware;
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Form, Router};
use axum_extra::extract::cookie::{Cookie, CookieJar};
use chrono::NaiveDate;
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing::{error, info};

use crate::auth;
use crate::capture::CaptureService;
use crate::cleanup;
use crate::error::{CameraError, StillpostError};
use crate::gpio::GpioService;
use crate::health::HealthState;
use crate::settings::{Settings, COLD_KEYS, HOT_KEYS};
use crate::stats::{CaptureStats, CleanupStats, UploadState};
use crate::store::ImageStore;

/// Shared state passed to all handlers.
pub struct AppState {
    pub settings: Arc<Settings>,
    pub store: Arc<ImageStore>,
    pub capture: Arc<CaptureService>,
    pub capture_stats: Arc<CaptureStats>,
    pub upload_state: Arc<UploadState>,
    pub cleanup_stats: Arc<CleanupStats>,
    pub health: Arc<HealthState>,
    pub gpio: Arc<GpioService>,
    pub started_at: Instant,
}

// ──────────────── request types ───────────────────────────────────────────

#[derive(Deserialize)]
pub struct ImagesParams {
    source: Option<String>,
    page: Option<i64>,
    per_page: Option<i64>,
}

#[derive(Deserialize)]
pub struct ByDateParams {
    date: String,
    source: Option<String>,
}

#[derive(Deserialize)]
pub struct LoginForm {
    password: String,
}

// ──────────────── router ──────────────────────────────────────────────────

/// Build the axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    let protected = Router::new()
        .route("/api/status", get(handle_status))
        .route("/api/stats", get(handle_stats))
        .route("/api/health", get(handle_health))
        .route("/api/images", get(handle_images))
        .route("/api/images/by-date", get(handle_images_by_date))
        .route("/api/images/{filename}", get(handle_image_file))
        .route("/api/capture/{source}", post(handle_capture))
        .route("/api/cleanup/run", post(handle_cleanup_run))
        .route("/api/gpio/status", get(handle_gpio_status))
        .route("/api/config/get", get(handle_config_get))
        .route("/api/config/update", post(handle_config_update))
        .route("/api/config/reload", post(handle_config_reload))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_session,
        ));

    Router::new()
        .merge(protected)
        .route("/login", get(handle_login_page).post(handle_login))
        .route("/logout", get(handle_logout).post(handle_logout))
        // Serve the dashboard files when present.
        .fallback_service(ServeDir::new("frontend"))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the HTTP server on an already-bound listener.
pub async fn start_server(state: Arc<AppState>, listener: tokio::net::TcpListener) {
    let app = build_router(state);
    if let Err(e) = axum::serve(listener, app).await {
        error!(error = %e, "HTTP server error");
    }
}

// ──────────────── auth handlers ───────────────────────────────────────────

async fn handle_login_page() -> impl IntoResponse {
    let html = r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width,initial-scale=1">
<title>stillpost — login</title>
<style>
  body { background:#111; color:#eee; font-family:system-ui,sans-serif;
         display:flex; align-items:center; justify-content:center; min-height:100vh; }
  form { display:flex; flex-direction:column; gap:12px; width:260px; }
  input, button { padding:10px; border-radius:6px; border:1px solid #333;
                  background:#1c1c1c; color:#eee; font-size:1rem; }
  button { cursor:pointer; background:#2d5; color:#111; border:none; }
</style>
</head>
<body>
<form method="post" action="/login">
  <h1>stillpost</h1>
  <input type="password" name="password" placeholder="Password" autofocus>
  <button type="submit">Sign in</button>
</form>
</body>
</html>"#;

    (StatusCode::OK, [("content-type", "text/html; charset=utf-8")], html)
}

async fn handle_login(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Form(form): Form<LoginForm>,
) -> Response {
    let snap = state.settings.current();
    if !snap.auth.web_auth_enabled {
        return Redirect::to("/").into_response();
    }
    let (Some(hash), Some(secret)) = (
        snap.auth.password_hash.clone(),
        snap.auth.secret_key.clone(),
    ) else {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            axum::Json(serde_json::json!({
                "error": "auth is enabled but PASSWORD_HASH or SECRET_KEY is not set"
            })),
        )
            .into_response();
    };

    if auth::verify_password(&hash, &form.password) {
        info!("Dashboard login");
        let jar = jar.add(auth::session_cookie(auth::issue_token(&secret)));
        (jar, Redirect::to("/")).into_response()
    } else {
        (
            StatusCode::UNAUTHORIZED,
            axum::Json(serde_json::json!({ "error": "invalid password" })),
        )
            .into_response()
    }
}

async fn handle_logout(jar: CookieJar) -> impl IntoResponse {
    let jar = jar.remove(Cookie::from(auth::SESSION_COOKIE));
    (jar, Redirect::to("/login"))
}

// ──────────────── status / stats / health ─────────────────────────────────

async fn handle_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snap = state.settings.current();
    let (database, queue) = match state.store.counts().await {
        Ok(counts) => ("ok", Some(counts)),
        Err(_) => ("unavailable", None),
    };

    let cameras: Vec<serde_json::Value> = snap
        .cameras
        .iter()
        .map(|cam| {
            serde_json::json!({
                "source": cam.source,
                "name": cam.name,
                "enabled": cam.enabled,
                "gpio_pin": cam.gpio_pin,
            })
        })
        .collect();

    let resp = serde_json::json!({
        "service": "stillpost",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "database": database,
        "queue": queue,
        "storage_path": snap.storage.image_path,
        "cameras": cameras,
        "gpio": {
            "enabled": snap.gpio.enabled,
            "trigger_enabled": snap.gpio.trigger_enabled,
            "claimed": state.gpio.claimed(),
            "error": state.gpio.error(),
        },
        "uploader": state.upload_state.summary(),
    });

    (StatusCode::OK, axum::Json(resp))
}

async fn handle_stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let queue = state.store.counts().await.ok();
    let resp = serde_json::json!({
        "captures": state.capture_stats.snapshot(),
        "triggers": state.gpio.triggers.counters(),
        "queue": queue,
        "uploads": state.upload_state.summary(),
        "cleanup": state.cleanup_stats.summary(),
    });
    (StatusCode::OK, axum::Json(resp))
}

async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let resp = serde_json::json!({
        "cameras": state.health.cameras(),
        "cpu_temp_c": state.health.cpu_temp_c(),
    });
    (StatusCode::OK, axum::Json(resp))
}

// ──────────────── image listings ──────────────────────────────────────────

async fn handle_images(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ImagesParams>,
) -> Response {
    let page = params.page.unwrap_or(1).max(1);
    let per_page = params.per_page.unwrap_or(50).clamp(1, 200);
    let offset = (page - 1) * per_page;
    let source = params.source.as_deref();

    let images = match state.store.list(source, per_page, offset).await {
        Ok(rows) => rows,
        Err(e) => return internal_error(e),
    };
    let total = match state.store.count(source).await {
        Ok(n) => n,
        Err(e) => return internal_error(e),
    };

    (
        StatusCode::OK,
        axum::Json(serde_json::json!({
            "images": images,
            "total": total,
            "page": page,
            "per_page": per_page,
        })),
    )
        .into_response()
}

async fn handle_images_by_date(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ByDateParams>,
) -> Response {
    let date = match NaiveDate::parse_from_str(&params.date, "%Y-%m-%d") {
        Ok(d) => d,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                axum::Json(serde_json::json!({
                    "error": format!("Invalid 'date': {e}. Use format: 2026-02-19")
                })),
            )
                .into_response();
        }
    };
    let from = date.and_time(chrono::NaiveTime::MIN).and_utc().timestamp();
    let to = from + 86_400;

    match state
        .store
        .list_between(from, to, params.source.as_deref())
        .await
    {
        Ok(images) => {
            let total = images.len();
            (
                StatusCode::OK,
                axum::Json(serde_json::json!({
                    "date": params.date,
                    "images": images,
                    "total": total,
                })),
            )
                .into_response()
        }
        Err(e) => internal_error(e),
    }
}

async fn handle_image_file(
    State(state): State<Arc<AppState>>,
    Path(filename): Path<String>,
) -> Response {
    // The filename is a DB key, never a path fragment.
    if filename.contains('/') || filename.contains("..") {
        return (
            StatusCode::BAD_REQUEST,
            axum::Json(serde_json::json!({ "error": "invalid filename" })),
        )
            .into_response();
    }

    let record = match state.store.by_filename(&filename).await {
        Ok(Some(record)) => record,
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                axum::Json(serde_json::json!({ "error": "no such image" })),
            )
                .into_response();
        }
        Err(e) => return internal_error(e),
    };

    match tokio::fs::read(&record.path).await {
        Ok(bytes) => (
            StatusCode::OK,
            [
                ("content-type", "image/jpeg".to_string()),
                (
                    "content-disposition",
                    format!("inline; filename=\"{}\"", record.filename),
                ),
            ],
            bytes,
        )
            .into_response(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => (
            StatusCode::NOT_FOUND,
            axum::Json(serde_json::json!({ "error": "backing file missing" })),
        )
            .into_response(),
        Err(e) => internal_error(StillpostError::Io(e)),
    }
}

// ──────────────── actions ─────────────────────────────────────────────────

async fn handle_capture(
    State(state): State<Arc<AppState>>,
    Path(source): Path<String>,
) -> Response {
    match state.capture.capture(&source).await {
        Ok(record) => (
            StatusCode::OK,
            axum::Json(serde_json::json!({ "status": "captured", "image": record })),
        )
            .into_response(),
        Err(StillpostError::Camera(CameraError::Disabled { name })) => (
            StatusCode::CONFLICT,
            axum::Json(serde_json::json!({
                "error": format!("camera '{name}' is disabled")
            })),
        )
            .into_response(),
        Err(StillpostError::Config(msg)) => (
            StatusCode::NOT_FOUND,
            axum::Json(serde_json::json!({ "error": msg })),
        )
            .into_response(),
        Err(StillpostError::Camera(e)) => (
            StatusCode::BAD_GATEWAY,
            axum::Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
        Err(e) => internal_error(e),
    }
}

async fn handle_cleanup_run(State(state): State<Arc<AppState>>) -> Response {
    match cleanup::run_once(&state.store, &state.settings, &state.cleanup_stats).await {
        Ok(report) => (
            StatusCode::OK,
            axum::Json(serde_json::json!({ "status": "done", "report": report })),
        )
            .into_response(),
        Err(e) => internal_error(e),
    }
}

async fn handle_gpio_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snap = state.settings.current();
    let resp = serde_json::json!({
        "enabled": snap.gpio.enabled,
        "trigger_enabled": snap.gpio.trigger_enabled,
        "claimed": state.gpio.claimed(),
        "pins": state.gpio.pin_levels(),
        "counters": state.gpio.triggers.counters(),
        "recent_triggers": state.gpio.triggers.recent_events(),
        "error": state.gpio.error(),
    });
    (StatusCode::OK, axum::Json(resp))
}

// ──────────────── config handlers ─────────────────────────────────────────

async fn handle_config_get(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snap = state.settings.current();
    let resp = serde_json::json!({
        "values": state.settings.redacted(),
        "effective": &*snap,
        "hot_keys": HOT_KEYS,
        "cold_keys": COLD_KEYS,
    });
    (StatusCode::OK, axum::Json(resp))
}

async fn handle_config_update(
    State(state): State<Arc<AppState>>,
    axum::Json(patch): axum::Json<BTreeMap<String, String>>,
) -> Response {
    let keys: Vec<String> = patch.keys().cloned().collect();
    match state.settings.update(patch) {
        Ok(_) => (
            StatusCode::OK,
            axum::Json(serde_json::json!({
                "status": "updated",
                "applied": keys,
                "note": "hot keys take effect immediately; cold keys require a restart",
            })),
        )
            .into_response(),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            axum::Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

async fn handle_config_reload(State(state): State<Arc<AppState>>) -> Response {
    match state.settings.reload() {
        Ok(_) => (
            StatusCode::OK,
            axum::Json(serde_json::json!({ "status": "reloaded" })),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            axum::Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

fn internal_error(e: StillpostError) -> Response {
    error!(error = %e, "Request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        axum::Json(serde_json::json!({ "error": e.to_string() })),
    )
        .into_response()
}
