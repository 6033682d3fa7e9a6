// =============================================================================
// SESSION MODULE
// =============================================================================
// Works out who is shopping: a logged-in user (session token) or a guest
// (long random key kept by the browser).
//
// LEARNING NOTES:
// - Resolution never fails. A bad, expired or unknown token simply means
//   "guest", because checkout has to work without an account
// - `Shopper` is an Axum extractor, so handlers just list it as an argument
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::FromRequestParts,
    http::{header, request::Parts, HeaderMap, HeaderValue},
};
use rand::RngCore;

use crate::error::{AppError, AppResult};
use crate::models::CartOwner;
use crate::AppState;

/// Cookie carrying a logged-in user's session token
pub const SESSION_COOKIE: &str = "bloomspace_session";

/// Cookie carrying a guest's cart key
pub const GUEST_COOKIE: &str = "bloomspace_session_id";

/// Header alternative to the guest cookie; also used to hand out new keys
pub const GUEST_HEADER: &str = "x-guest-session";

/// `user_sessions.token` is VARCHAR(191)
pub const MAX_TOKEN_LEN: usize = 191;

/// Random bytes in a guest key (hex encoded to twice the length)
const GUEST_KEY_BYTES: usize = 32;

// -----------------------------------------------------------------------------
// SESSION LOOKUP
// -----------------------------------------------------------------------------
/// Storage side of session resolution. Implemented by `Database`.
#[async_trait]
pub trait SessionLookup: Send + Sync {
    /// User id behind an unexpired session of an active user.
    async fn user_for_token(&self, token: &str) -> Result<Option<i64>, sqlx::Error>;

    /// Delete sessions past their expiry, returning how many went.
    async fn delete_expired_sessions(&self) -> Result<u64, sqlx::Error>;
}

// -----------------------------------------------------------------------------
// CREDENTIALS
// -----------------------------------------------------------------------------
/// What the request presented, before any lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub token: Option<String>,
    pub guest_key: Option<String>,
}

impl Credentials {
    /// Read the bearer token (header first, then cookie) and guest key
    /// (header first, then cookie).
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let bearer = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string);

        let token = bearer.or_else(|| cookie_value(headers, SESSION_COOKIE));

        // A key the cart and order columns can't hold is ignored, so the
        // shopper gets a fresh one instead of failing every write
        let guest_key = headers
            .get(GUEST_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string)
            .or_else(|| cookie_value(headers, GUEST_COOKIE))
            .filter(|k| is_valid_guest_key(k));

        Self { token, guest_key }
    }
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Guest keys are stored verbatim in VARCHAR(191) columns and echoed back in
/// a response header: short, and limited to URL-safe characters.
pub fn is_valid_guest_key(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= MAX_TOKEN_LEN
        && key
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// Clip a token to the column width, respecting char boundaries.
pub fn truncate_token(token: &str) -> &str {
    match token.char_indices().nth(MAX_TOKEN_LEN) {
        Some((idx, _)) => &token[..idx],
        None => token,
    }
}

/// A fresh 64-character hex guest key.
pub fn generate_guest_key() -> String {
    let mut bytes = [0u8; GUEST_KEY_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

// -----------------------------------------------------------------------------
// RESOLUTION
// -----------------------------------------------------------------------------
/// The resolved shopper for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shopper {
    pub owner: CartOwner,

    /// Set when this request minted a new guest key the client must keep
    pub issued_guest_key: Option<String>,
}

impl Shopper {
    pub fn user_id(&self) -> Option<i64> {
        self.owner.user_id()
    }

    /// For account-only operations such as order history.
    pub fn require_user(&self) -> AppResult<i64> {
        self.owner.user_id().ok_or(AppError::Unauthorized)
    }

    /// Headers to attach to the response (the new guest key, if any).
    pub fn response_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(key) = &self.issued_guest_key {
            if let Ok(value) = HeaderValue::from_str(key) {
                headers.insert(GUEST_HEADER, value);
            }
        }
        headers
    }
}

/// Map credentials to a shopper. Never fails.
pub async fn resolve<L: SessionLookup + ?Sized>(lookup: &L, credentials: &Credentials) -> Shopper {
    if let Some(token) = credentials.token.as_deref() {
        match lookup.user_for_token(truncate_token(token)).await {
            Ok(Some(user_id)) => {
                return Shopper {
                    owner: CartOwner::User(user_id),
                    issued_guest_key: None,
                }
            }
            Ok(None) => tracing::debug!("Session token unknown or expired, treating as guest"),
            Err(e) => tracing::warn!(error = %e, "Session lookup failed, treating as guest"),
        }
    }

    match &credentials.guest_key {
        Some(key) => Shopper {
            owner: CartOwner::Guest(key.clone()),
            issued_guest_key: None,
        },
        None => {
            let key = generate_guest_key();
            Shopper {
                owner: CartOwner::Guest(key.clone()),
                issued_guest_key: Some(key),
            }
        }
    }
}

/// Delete expired sessions without holding up the request.
pub fn spawn_session_cleanup<L: SessionLookup + Clone + 'static>(lookup: L) {
    tokio::spawn(async move {
        match lookup.delete_expired_sessions().await {
            Ok(0) => {}
            Ok(removed) => tracing::debug!(removed, "Expired sessions removed"),
            Err(e) => tracing::warn!(error = %e, "Session cleanup failed"),
        }
    });
}

// -----------------------------------------------------------------------------
// AXUM EXTRACTOR
// -----------------------------------------------------------------------------
#[async_trait]
impl FromRequestParts<Arc<AppState>> for Shopper {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let credentials = Credentials::from_headers(&parts.headers);
        let shopper = resolve(&state.db, &credentials).await;

        if state.config.session_cleanup {
            spawn_session_cleanup(state.db.clone());
        }

        Ok(shopper)
    }
}
