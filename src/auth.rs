//! Session-cookie auth for the operator dashboard.
//!
//! One shared password, stored as an argon2 hash in `PASSWORD_HASH`.
//! Sessions are stateless: the cookie carries `nonce.tag` where `tag` is
//! HMAC-SHA256 over the nonce keyed by `SECRET_KEY`, so sessions survive a
//! daemon restart without server-side storage. This is middleware around
//! the HTTP facade only; the capture and queue paths never touch it.

use std::sync::Arc;

use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand_core::{OsRng, RngCore};
use sha2::Sha256;

use crate::api::AppState;
use crate::error::{Result, StillpostError};

type HmacSha256 = Hmac<Sha256>;

pub const SESSION_COOKIE: &str = "stillpost_session";

/// Produce an argon2 hash suitable for `PASSWORD_HASH`.
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| StillpostError::Config(format!("Password hashing failed: {e}")))
}

pub fn verify_password(hash: &str, password: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

fn mac(secret: &str) -> HmacSha256 {
    HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any length")
}

/// Mint a signed session token.
pub fn issue_token(secret: &str) -> String {
    let mut nonce = [0u8; 16];
    OsRng.fill_bytes(&mut nonce);
    let mut m = mac(secret);
    m.update(&nonce);
    let tag = m.finalize().into_bytes();
    format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(nonce),
        URL_SAFE_NO_PAD.encode(tag)
    )
}

pub fn verify_token(secret: &str, token: &str) -> bool {
    let Some((nonce_b64, tag_b64)) = token.split_once('.') else {
        return false;
    };
    let (Ok(nonce), Ok(tag)) = (URL_SAFE_NO_PAD.decode(nonce_b64), URL_SAFE_NO_PAD.decode(tag_b64))
    else {
        return false;
    };
    let mut m = mac(secret);
    m.update(&nonce);
    m.verify_slice(&tag).is_ok()
}

pub fn session_cookie(token: String) -> Cookie<'static> {
    let mut cookie = Cookie::new(SESSION_COOKIE, token);
    cookie.set_path("/");
    cookie.set_http_only(true);
    cookie.set_same_site(SameSite::Lax);
    cookie
}

/// Gate for the protected API routes. A no-op while `WEB_AUTH_ENABLED` is
/// off; with auth on but no `SECRET_KEY` configured it refuses rather than
/// failing open.
pub async fn require_session(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    request: Request,
    next: Next,
) -> Response {
    let snap = state.settings.current();
    if !snap.auth.web_auth_enabled {
        return next.run(request).await;
    }
    let Some(secret) = snap.auth.secret_key.clone() else {
        return (
            StatusCode::UNAUTHORIZED,
            axum::Json(serde_json::json!({
                "error": "auth is enabled but SECRET_KEY is not set"
            })),
        )
            .into_response();
    };

    let authenticated = jar
        .get(SESSION_COOKIE)
        .map(|cookie| verify_token(&secret, cookie.value()))
        .unwrap_or(false);

    if authenticated {
        next.run(request).await
    } else {
        (
            StatusCode::UNAUTHORIZED,
            axum::Json(serde_json::json!({ "error": "authentication required" })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_hash_round_trip() {
        let hash = hash_password("orchard gate").expect("hash");
        assert!(verify_password(&hash, "orchard gate"));
        assert!(!verify_password(&hash, "orchard gates"));
        assert!(!verify_password("not-a-phc-string", "orchard gate"));
    }

    #[test]
    fn session_token_round_trip() {
        let token = issue_token("key-one");
        assert!(verify_token("key-one", &token));
        // Wrong key, truncated token, malformed token all fail.
        assert!(!verify_token("key-two", &token));
        assert!(!verify_token("key-one", &token[..token.len() - 2]));
        assert!(!verify_token("key-one", "no-dot-here"));
    }

    #[test]
    fn tokens_are_unique_per_issue() {
        assert_ne!(issue_token("key"), issue_token("key"));
    }
}
