//! FeedReconciler: merges snapshot, push events and optimistic user actions
//! into one ordered, id-deduplicated view.
//!
//! The reconciler is single-owner: every mutation runs to completion on the
//! task that owns it (see [crate::FeedHandle]). Errors other than session
//! rejection are reported as [Notice]s in the view, never returned.

use crate::error::FeedError;
use crate::item::{ConnectionStatus, FeedItem, TransportEvent};
use crate::kind::{FeedKind, Optimistic};
use crate::session::Session;
use crate::state::{FeedState, Merge};
use crate::transport::FeedTransport;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Duration, Instant};

const SIGNAL_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum NoticeLevel {
    Info,
    Error,
}

/// Transient user-visible message (toast).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

impl Notice {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Error,
            message: message.into(),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Info,
            message: message.into(),
        }
    }
}

/// Out-of-band signals for the view layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedSignal {
    /// The credential is no longer valid; clear it and navigate to sign-in. Sent once.
    SessionInvalid { reason: String },
    /// A merge strictly increased the visible count.
    NewItem,
    Notice(Notice),
}

/// Rendered projection of the feed state.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedView<P> {
    pub items: Vec<FeedItem<P>>,
    pub connection_status: ConnectionStatus,
    pub loading: bool,
    pub session_valid: bool,
    pub notice: Option<Notice>,
}

impl<P> Default for FeedView<P> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            connection_status: ConnectionStatus::Disconnected,
            loading: false,
            session_valid: true,
            notice: None,
        }
    }
}

/// Token for one in-flight snapshot fetch. A result presented with a stale
/// ticket (superseded or torn down) is discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadTicket {
    generation: u64,
    visible_before: usize,
    play_sound: bool,
}

pub struct FeedReconciler<K: FeedKind, T: FeedTransport<K>> {
    kind: Arc<K>,
    transport: T,
    session: Session,
    state: FeedState<K::Payload>,
    events: Option<mpsc::Receiver<TransportEvent<K::Payload>>>,
    /// Item events received before the first snapshot landed.
    deferred: Vec<TransportEvent<K::Payload>>,
    loaded: bool,
    signals: broadcast::Sender<FeedSignal>,
    notice: Option<Notice>,
    /// Notice posted by the last failed load; cleared by the next successful one.
    load_notice: Option<Notice>,
    generation: u64,
    closed: bool,
    session_invalid: bool,
    pending_timeout: Option<Duration>,
}

impl<K: FeedKind, T: FeedTransport<K>> FeedReconciler<K, T> {
    pub fn new(kind: Arc<K>, transport: T, session: Session) -> Self {
        let (signals, _) = broadcast::channel(SIGNAL_BUFFER);
        let state = FeedState::new(kind.placement());
        Self {
            kind,
            transport,
            session,
            state,
            events: None,
            deferred: Vec::new(),
            loaded: false,
            signals,
            notice: None,
            load_notice: None,
            generation: 0,
            closed: false,
            session_invalid: false,
            pending_timeout: None,
        }
    }

    pub fn with_pending_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.pending_timeout = timeout;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FeedSignal> {
        self.signals.subscribe()
    }

    pub(crate) fn signal_sender(&self) -> broadcast::Sender<FeedSignal> {
        self.signals.clone()
    }

    pub fn state(&self) -> &FeedState<K::Payload> {
        &self.state
    }

    pub fn pending_timeout(&self) -> Option<Duration> {
        self.pending_timeout
    }

    pub fn view(&self) -> FeedView<K::Payload> {
        FeedView {
            items: self.state.visible().cloned().collect(),
            connection_status: self.state.connection_status,
            loading: self.state.loading,
            session_valid: !self.session_invalid,
            notice: self.notice.clone(),
        }
    }

    fn active(&self) -> bool {
        !self.closed && !self.session_invalid
    }

    /// Open the push stream and load the first snapshot.
    pub async fn initialize(&mut self) {
        self.load(false).await;
    }

    /// Manual re-fetch. With `play_sound`, a strictly larger snapshot raises [FeedSignal::NewItem].
    pub async fn refresh(&mut self, play_sound: bool) {
        self.load(play_sound).await;
    }

    async fn load(&mut self, play_sound: bool) {
        let Some(ticket) = self.begin_load(play_sound) else {
            return;
        };
        let result = self.fetch_snapshot().await;
        self.finish_load(ticket, result);
    }

    /// Snapshot fetch without touching state; pair with [Self::begin_load] and [Self::finish_load].
    pub async fn fetch_snapshot(&self) -> Result<Vec<FeedItem<K::Payload>>, FeedError> {
        self.transport.open_snapshot(&self.session).await
    }

    /// First half of a snapshot load: marks the feed loading and opens the
    /// stream if it is not open yet. Returns `None` once torn down or invalidated.
    pub fn begin_load(&mut self, play_sound: bool) -> Option<LoadTicket> {
        if !self.active() {
            return None;
        }
        self.state.loading = true;
        if self.events.is_none() {
            self.state.connection_status = ConnectionStatus::Connecting;
            self.events = Some(self.transport.open_stream(&self.session));
        }
        self.generation += 1;
        Some(LoadTicket {
            generation: self.generation,
            visible_before: self.state.visible_len(),
            play_sound,
        })
    }

    /// Second half of a snapshot load. Stale results are dropped.
    pub fn finish_load(
        &mut self,
        ticket: LoadTicket,
        result: Result<Vec<FeedItem<K::Payload>>, FeedError>,
    ) {
        if !self.active() || ticket.generation != self.generation {
            tracing::debug!(feed = self.kind.name(), "stale snapshot discarded");
            return;
        }
        self.state.loading = false;
        match result {
            Ok(items) => {
                let kind = &self.kind;
                self.state
                    .replace_all(items, |local, stored| kind.is_echo(local, stored));
                self.loaded = true;
                if let Some(stale) = self.load_notice.take() {
                    if self.notice.as_ref() == Some(&stale) {
                        self.notice = None;
                    }
                }
                for event in std::mem::take(&mut self.deferred) {
                    self.on_transport_event(event);
                }
                if ticket.play_sound
                    && self.kind.alerts_on_arrival()
                    && self.state.visible_len() > ticket.visible_before
                {
                    let _ = self.signals.send(FeedSignal::NewItem);
                }
            }
            Err(FeedError::Auth(reason)) => self.invalidate_session(reason),
            Err(e) => {
                tracing::warn!(reason = %e, feed = self.kind.name(), "snapshot fetch failed");
                let notice = Notice::error(format!("failed to load {}: {e}", self.kind.name()));
                self.load_notice = Some(notice.clone());
                self.post_notice(notice);
            }
        }
    }

    /// Next event from the push stream; pends forever when no stream is open.
    pub async fn next_event(&mut self) -> Option<TransportEvent<K::Payload>> {
        let Some(rx) = self.events.as_mut() else {
            return std::future::pending().await;
        };
        let event = rx.recv().await;
        if event.is_none() {
            self.events = None;
        }
        event
    }

    /// Detach the push stream receiver, e.g. to drain it while a snapshot is in flight.
    pub(crate) fn take_events(&mut self) -> Option<mpsc::Receiver<TransportEvent<K::Payload>>> {
        self.events.take()
    }

    pub(crate) fn restore_events(&mut self, events: Option<mpsc::Receiver<TransportEvent<K::Payload>>>) {
        if self.active() {
            self.events = events;
        }
    }

    /// Apply one transport event in arrival order.
    pub fn on_transport_event(&mut self, event: TransportEvent<K::Payload>) {
        if !self.active() {
            return;
        }
        let merge = match event {
            TransportEvent::Status(status) => {
                self.state.connection_status = status;
                Merge::default()
            }
            TransportEvent::GaveUp { attempts } => {
                self.state.connection_status = ConnectionStatus::Disconnected;
                self.post_notice(Notice::error(
                    FeedError::ConnectionLost { attempts }.to_string(),
                ));
                Merge::default()
            }
            TransportEvent::SessionRejected { reason } => {
                self.invalidate_session(reason);
                Merge::default()
            }
            event if !self.loaded => {
                self.deferred.push(event);
                Merge::default()
            }
            TransportEvent::ItemAdded(item) => {
                let kind = &self.kind;
                let local = match self.state.get(&item.id) {
                    Some(_) => None,
                    None => self
                        .state
                        .pending_local_match(|local| kind.is_echo(local, &item.payload)),
                };
                match local {
                    Some(local) => {
                        tracing::debug!(%local, id = %item.id, feed = self.kind.name(), "local item confirmed by echo");
                        self.state.adopt(&local, item)
                    }
                    None => self.state.add(item),
                }
            }
            TransportEvent::ItemUpdated { id, patch } => match self.state.update(&id, &patch) {
                Ok(merge) => merge,
                Err(e) => {
                    tracing::warn!(reason = %e, %id, "update patch rejected");
                    Merge::default()
                }
            },
            TransportEvent::ItemRemoved { id } => self.state.remove(&id),
            TransportEvent::ActionError { id, message } => {
                if let Some(id) = &id {
                    if self.state.rollback(id) {
                        tracing::info!(%id, feed = self.kind.name(), "optimistic change rolled back");
                    }
                }
                let error = FeedError::Action { id, message };
                tracing::warn!(reason = %error, feed = self.kind.name(), "action failed");
                self.post_notice(Notice::error(error.to_string()));
                Merge::default()
            }
        };
        if merge.arrived && self.kind.alerts_on_arrival() {
            let _ = self.signals.send(FeedSignal::NewItem);
        }
    }

    /// Apply the action's local effect and hand it to the transport.
    ///
    /// Socket-backed actions are refused while disconnected; nothing changes locally.
    pub fn apply_optimistic(&mut self, action: K::Action) {
        if !self.active() {
            return;
        }
        let outbound = self.kind.outbound(&action, &self.session);
        if outbound.needs_stream() && self.state.connection_status != ConnectionStatus::Connected {
            self.post_notice(Notice::error(FeedError::NotConnected.to_string()));
            return;
        }
        let now = Instant::now();
        match self.kind.optimistic(&action) {
            Optimistic::None => {}
            Optimistic::Insert(item) => {
                self.state.insert_pending(item, now);
            }
            Optimistic::Remove(id) => {
                if !self.state.mark_pending_removal(&id, now) {
                    tracing::debug!(%id, "optimistic removal target not visible");
                }
            }
        }
        self.transport.emit(&self.session, &action);
    }

    /// Roll back optimistic changes older than the configured timeout.
    pub fn expire_pending(&mut self, now: Instant) {
        let Some(timeout) = self.pending_timeout else {
            return;
        };
        let expired = self.state.expire_pending(now, timeout);
        if !expired.is_empty() {
            tracing::warn!(count = expired.len(), feed = self.kind.name(), "unconfirmed actions rolled back");
            self.post_notice(Notice::error("action not confirmed by server"));
        }
    }

    /// Caller-triggered re-open of the push stream, e.g. after reconnection gave up.
    pub fn reconnect(&mut self) {
        if !self.active() {
            return;
        }
        self.state.connection_status = ConnectionStatus::Connecting;
        self.events = Some(self.transport.open_stream(&self.session));
        self.post_notice(Notice::info("reconnecting"));
    }

    /// Release the transport and discard state. Safe to call at any point, any number of times.
    pub fn teardown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.generation += 1;
        self.transport.close();
        self.events = None;
        self.deferred.clear();
        self.state.clear();
        self.state.loading = false;
        self.state.connection_status = ConnectionStatus::Disconnected;
    }

    fn invalidate_session(&mut self, reason: String) {
        if self.session_invalid {
            return;
        }
        tracing::warn!(%reason, feed = self.kind.name(), "session invalid");
        self.session_invalid = true;
        self.transport.close();
        self.events = None;
        self.deferred.clear();
        self.state.clear();
        self.state.loading = false;
        self.state.connection_status = ConnectionStatus::Disconnected;
        self.notice = Some(Notice::error(format!("session expired: {reason}")));
        let _ = self.signals.send(FeedSignal::SessionInvalid { reason });
    }

    fn post_notice(&mut self, notice: Notice) {
        self.notice = Some(notice.clone());
        let _ = self.signals.send(FeedSignal::Notice(notice));
    }
}
