//! FeedTransport: snapshot fetch, push stream, action emit and teardown for one feed.

use crate::api::ApiClient;
use crate::channel::{run_stream, Outgoing, StreamParams};
use crate::config::ClientConfig;
use crate::error::FeedError;
use crate::item::{FeedItem, TransportEvent};
use crate::kind::{FeedKind, Outbound};
use crate::session::Session;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Event buffer between the connection task and the reconciler.
const EVENT_BUFFER: usize = 256;

/// Transport seam the reconciler is written against.
#[async_trait]
pub trait FeedTransport<K: FeedKind>: Send + Sync {
    /// One-shot fetch of the current feed contents.
    async fn open_snapshot(&self, session: &Session) -> Result<Vec<FeedItem<K::Payload>>, FeedError>;

    /// Open (or re-open) the push stream. Any previous stream is closed first.
    fn open_stream(&mut self, session: &Session) -> mpsc::Receiver<TransportEvent<K::Payload>>;

    /// Fire-and-forget; the outcome arrives later on the event stream.
    fn emit(&mut self, session: &Session, action: &K::Action);

    /// Stop the stream and every in-flight action. Idempotent.
    fn close(&mut self);
}

/// Socket.IO push channel plus HTTP snapshot/actions against the admin backend.
pub struct SocketTransport<K: FeedKind> {
    kind: Arc<K>,
    api: ApiClient,
    config: ClientConfig,
    events_tx: Option<mpsc::Sender<TransportEvent<K::Payload>>>,
    outgoing_tx: Option<mpsc::UnboundedSender<Outgoing>>,
    stream_task: Option<JoinHandle<()>>,
    action_tasks: Vec<JoinHandle<()>>,
}

impl<K: FeedKind> SocketTransport<K> {
    pub fn new(kind: Arc<K>, config: ClientConfig) -> Result<Self, FeedError> {
        let api = ApiClient::new(&config.api_url, config.request_timeout)?;
        Ok(Self {
            kind,
            api,
            config,
            events_tx: None,
            outgoing_tx: None,
            stream_task: None,
            action_tasks: Vec::new(),
        })
    }

    fn report(&self, event: TransportEvent<K::Payload>) {
        if let Some(tx) = &self.events_tx {
            if tx.try_send(event).is_err() {
                tracing::warn!(feed = self.kind.name(), "event buffer full or closed, dropping report");
            }
        }
    }

    fn spawn_http(&mut self, session: &Session, action: &K::Action, request: crate::api::ApiRequest) {
        let Some(events) = self.events_tx.clone() else {
            tracing::warn!(feed = self.kind.name(), "action issued before stream was opened");
            return;
        };
        let api = self.api.clone();
        let token = session.token().to_string();
        let target = self.kind.target(action);
        let confirmation = self.kind.confirmation(action);
        let feed = self.kind.name();
        let task = tokio::spawn(async move {
            let event = match api.send(Some(&token), &request).await {
                Ok(_) => match confirmation {
                    Some(ev) => ev,
                    None => return,
                },
                Err(FeedError::Auth(reason)) => TransportEvent::SessionRejected { reason },
                Err(e) => {
                    tracing::warn!(reason = %e, feed, path = %request.path, "action request failed");
                    TransportEvent::ActionError {
                        id: target,
                        message: e.to_string(),
                    }
                }
            };
            let _ = events.send(event).await;
        });
        self.action_tasks.retain(|t| !t.is_finished());
        self.action_tasks.push(task);
    }
}

#[async_trait]
impl<K: FeedKind> FeedTransport<K> for SocketTransport<K> {
    async fn open_snapshot(&self, session: &Session) -> Result<Vec<FeedItem<K::Payload>>, FeedError> {
        let body = self
            .api
            .send(Some(session.token()), &self.kind.snapshot_request())
            .await?;
        let items = self.kind.parse_snapshot(body)?;
        tracing::info!(feed = self.kind.name(), count = items.len(), "snapshot loaded");
        Ok(items)
    }

    fn open_stream(&mut self, session: &Session) -> mpsc::Receiver<TransportEvent<K::Payload>> {
        self.close_stream();
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let params = StreamParams {
            socket_url: self.config.socket_url.clone(),
            token: session.token().to_string(),
            join: self.kind.join(session),
            reconnection: self.config.reconnection.clone(),
        };
        self.stream_task = Some(tokio::spawn(run_stream(
            Arc::clone(&self.kind),
            params,
            events_tx.clone(),
            outgoing_rx,
        )));
        self.events_tx = Some(events_tx);
        self.outgoing_tx = Some(outgoing_tx);
        events_rx
    }

    fn emit(&mut self, session: &Session, action: &K::Action) {
        match self.kind.outbound(action, session) {
            Outbound::Emit(packet) => {
                let out = Outgoing {
                    packet,
                    target: self.kind.target(action),
                };
                let sent = self
                    .outgoing_tx
                    .as_ref()
                    .map(|tx| tx.send(out).is_ok())
                    .unwrap_or(false);
                if !sent {
                    self.report(TransportEvent::ActionError {
                        id: self.kind.target(action),
                        message: FeedError::NotConnected.to_string(),
                    });
                }
            }
            Outbound::Http(request) => self.spawn_http(session, action, request),
        }
    }

    fn close(&mut self) {
        self.close_stream();
        for task in self.action_tasks.drain(..) {
            task.abort();
        }
        self.events_tx = None;
    }
}

impl<K: FeedKind> SocketTransport<K> {
    fn close_stream(&mut self) {
        self.outgoing_tx = None;
        if let Some(task) = self.stream_task.take() {
            task.abort();
        }
    }
}

impl<K: FeedKind> Drop for SocketTransport<K> {
    fn drop(&mut self) {
        self.close();
    }
}
