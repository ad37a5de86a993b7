//! Realtime feed client for the admin console: snapshot + push reconciliation.
//!
//! - **FeedTransport**: one-shot HTTP snapshot, Socket.IO push stream with bounded
//!   reconnection, fire-and-forget actions ([SocketTransport]).
//! - **FeedReconciler**: merges snapshot, push events and optimistic actions into one
//!   ordered, id-deduplicated view; two-phase optimistic changes with rollback.
//! - **FeedHandle**: runs a reconciler on its own task; commands in, [FeedView] out.
//!
//! Feed-specific policy (ordering, event names, action wiring) lives in [FeedKind]
//! implementations: [Chat], [Notifications], [SignupRequests].

pub mod api;
pub mod channel;
pub mod config;
pub mod error;
pub mod handle;
pub mod item;
pub mod kind;
pub mod packet;
pub mod reconciler;
pub mod session;
pub mod state;
pub mod transport;

pub use api::{ApiClient, ApiRequest, Product, SignInResponse, User};
pub use config::{ClientConfig, ReconnectionConfig};
pub use error::FeedError;
pub use handle::{Command, FeedHandle};
pub use item::{ConnectionStatus, FeedItem, ItemId, ItemStatus, TransportEvent};
pub use kind::{
    Chat, ChatAction, ChatMessage, FeedKind, Notification, NotificationAction, Notifications,
    Placement, SignupAction, SignupRequest, SignupRequests,
};
pub use reconciler::{FeedReconciler, FeedSignal, FeedView, Notice, NoticeLevel};
pub use session::{Claims, FileTokenStore, MemoryTokenStore, Session, TokenError, TokenStore};
pub use transport::{FeedTransport, SocketTransport};
