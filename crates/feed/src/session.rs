//! Session credential storage and claims decoding.
//!
//! The client holds no signing key, so decoding checks token structure and expiry
//! only; the server remains the authority and reports rejection as a 401 or a
//! connect error, both of which surface as [crate::FeedError::Auth].

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::Deserialize;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("no token stored")]
    Missing,
    #[error("malformed token: {0}")]
    Malformed(String),
    #[error("token expired at {0}")]
    Expired(i64),
    #[error("token carries no subject id")]
    MissingSubject,
}

impl From<TokenError> for crate::FeedError {
    fn from(e: TokenError) -> Self {
        crate::FeedError::Auth(e.to_string())
    }
}

/// Storage for the bearer credential. Persists across feeds until cleared.
pub trait TokenStore: Send + Sync {
    fn get(&self) -> Option<String>;
    fn set(&self, token: &str);
    fn clear(&self);
}

/// In-memory store for one process.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    token: RwLock<Option<String>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TokenStore for MemoryTokenStore {
    fn get(&self) -> Option<String> {
        self.token.read().ok().and_then(|t| t.clone())
    }

    fn set(&self, token: &str) {
        if let Ok(mut guard) = self.token.write() {
            *guard = Some(token.to_string());
        }
    }

    fn clear(&self) {
        if let Ok(mut guard) = self.token.write() {
            *guard = None;
        }
    }
}

/// File-backed store: the token survives restarts, one file per credential.
#[derive(Debug, Clone)]
pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl TokenStore for FileTokenStore {
    fn get(&self) -> Option<String> {
        let raw = std::fs::read_to_string(&self.path).ok()?;
        let token = raw.trim();
        (!token.is_empty()).then(|| token.to_string())
    }

    fn set(&self, token: &str) {
        if let Err(e) = std::fs::write(&self.path, token) {
            tracing::warn!(reason = %e, path = %self.path.display(), "failed to store token");
        }
    }

    fn clear(&self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(reason = %e, path = %self.path.display(), "failed to remove token"),
        }
    }
}

/// Identity decoded from the token payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claims {
    /// Subject id, used for room joins and as `adminId` in emits.
    pub id: String,
    pub role: Option<String>,
    /// Expiry (seconds since epoch), if the token carries one.
    pub exp: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct RawClaims {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default, rename = "adminId")]
    admin_id: Option<Value>,
    #[serde(default, rename = "userId")]
    user_id: Option<Value>,
    #[serde(default)]
    sub: Option<Value>,
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    exp: Option<i64>,
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Decode the payload segment of a JWT into [Claims].
///
/// The subject is taken from the first present field of `id`, `adminId`,
/// `userId`, `sub`. A token without any of them is rejected rather than
/// defaulted. Expiry is checked against `now` (seconds since epoch).
pub fn decode_claims(token: &str, now: i64) -> Result<Claims, TokenError> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return Err(TokenError::Malformed(format!(
            "expected 3 segments, found {}",
            parts.len()
        )));
    }
    let payload = URL_SAFE_NO_PAD
        .decode(parts[1].trim_end_matches('='))
        .map_err(|e| TokenError::Malformed(e.to_string()))?;
    let raw: RawClaims =
        serde_json::from_slice(&payload).map_err(|e| TokenError::Malformed(e.to_string()))?;
    if let Some(exp) = raw.exp {
        if exp <= now {
            return Err(TokenError::Expired(exp));
        }
    }
    let id = [&raw.id, &raw.admin_id, &raw.user_id, &raw.sub]
        .into_iter()
        .flatten()
        .find_map(id_string)
        .ok_or(TokenError::MissingSubject)?;
    Ok(Claims {
        id,
        role: raw.role,
        exp: raw.exp,
    })
}

/// A decoded credential, shared read-only by every feed of one sign-in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    inner: Arc<SessionInner>,
}

#[derive(Debug, PartialEq, Eq)]
struct SessionInner {
    token: String,
    claims: Claims,
}

impl Session {
    /// Decode `token` against the current time.
    pub fn from_token(token: impl Into<String>) -> Result<Self, TokenError> {
        let token = token.into();
        let claims = decode_claims(&token, chrono::Utc::now().timestamp())?;
        Ok(Self::with_claims(token, claims))
    }

    pub fn with_claims(token: impl Into<String>, claims: Claims) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                token: token.into(),
                claims,
            }),
        }
    }

    /// Restore the session from a store; an undecodable token is cleared from it.
    pub fn restore(store: &dyn TokenStore) -> Result<Self, TokenError> {
        let token = store.get().ok_or(TokenError::Missing)?;
        Self::from_token(token).map_err(|e| {
            tracing::warn!(reason = %e, "stored token rejected, clearing");
            store.clear();
            e
        })
    }

    pub fn token(&self) -> &str {
        &self.inner.token
    }

    pub fn claims(&self) -> &Claims {
        &self.inner.claims
    }

    pub fn subject(&self) -> &str {
        &self.inner.claims.id
    }
}

/// Build an unsigned token with the given payload. Test fixtures only.
#[doc(hidden)]
pub fn unsigned_token(payload: &Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let body = URL_SAFE_NO_PAD.encode(payload.to_string().as_bytes());
    format!("{header}.{body}.sig")
}
