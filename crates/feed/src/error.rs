//! Error taxonomy shared by the transport, the HTTP client and the reconciler.

use crate::item::ItemId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FeedError {
    /// Expired or invalid credential. Terminal for the feed that sees it.
    #[error("session rejected: {0}")]
    Auth(String),
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("decode error: {0}")]
    Decode(String),
    /// The server refused a user-initiated mutation.
    #[error("action rejected: {message}")]
    Action {
        id: Option<ItemId>,
        message: String,
    },
    #[error("connection lost after {attempts} reconnection attempts")]
    ConnectionLost { attempts: u32 },
    #[error("not connected to server")]
    NotConnected,
}

impl FeedError {
    pub fn is_auth(&self) -> bool {
        matches!(self, FeedError::Auth(_))
    }

    /// Transport or parse failure; the caller decides whether to retry.
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            FeedError::Http(_) | FeedError::Status { .. } | FeedError::Decode(_)
        )
    }
}

impl From<serde_json::Error> for FeedError {
    fn from(e: serde_json::Error) -> Self {
        FeedError::Decode(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(FeedError::Auth("expired".into()).is_auth());
        assert!(!FeedError::Auth("expired".into()).is_network());
        assert!(FeedError::Decode("bad".into()).is_network());
        assert!(FeedError::Status {
            status: 500,
            message: "boom".into()
        }
        .is_network());
        assert!(!FeedError::NotConnected.is_network());
    }
}
