//! FeedHandle: runs one reconciler on its own task and exposes it through channels.
//!
//! Commands go in over an mpsc queue, the rendered [FeedView] comes out over a
//! watch channel, and [FeedSignal]s are broadcast. All mutation happens on the
//! owning task, one step at a time.

use crate::config::ClientConfig;
use crate::error::FeedError;
use crate::item::TransportEvent;
use crate::kind::FeedKind;
use crate::reconciler::{FeedReconciler, FeedSignal, FeedView};
use crate::session::Session;
use crate::transport::{FeedTransport, SocketTransport};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, MissedTickBehavior};

#[derive(Debug, Clone)]
pub enum Command<A> {
    Send(A),
    Refresh { play_sound: bool },
    Reconnect,
    Shutdown,
}

enum Flow {
    Continue,
    Stop,
}

pub struct FeedHandle<K: FeedKind> {
    commands: mpsc::UnboundedSender<Command<K::Action>>,
    view: watch::Receiver<FeedView<K::Payload>>,
    signals: broadcast::Sender<FeedSignal>,
    /// Subscribed before the task started, so it sees every signal.
    first_signals: Option<broadcast::Receiver<FeedSignal>>,
    task: Option<JoinHandle<()>>,
}

impl<K: FeedKind> FeedHandle<K> {
    /// Open `kind` against the backend in `config` and start loading.
    pub fn open(kind: K, session: Session, config: &ClientConfig) -> Result<Self, FeedError> {
        let kind = Arc::new(kind);
        let transport = SocketTransport::new(Arc::clone(&kind), config.clone())?;
        let reconciler = FeedReconciler::new(kind, transport, session)
            .with_pending_timeout(config.pending_timeout);
        Ok(Self::spawn(reconciler))
    }

    pub fn spawn<T: FeedTransport<K> + 'static>(reconciler: FeedReconciler<K, T>) -> Self {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (view_tx, view) = watch::channel(reconciler.view());
        let signals = reconciler.signal_sender();
        let first_signals = Some(signals.subscribe());
        let task = tokio::spawn(run(reconciler, commands_rx, view_tx));
        Self {
            commands,
            view,
            signals,
            first_signals,
            task: Some(task),
        }
    }

    fn command(&self, command: Command<K::Action>) -> Result<(), FeedError> {
        self.commands.send(command).map_err(|_| FeedError::NotConnected)
    }

    pub fn send_action(&self, action: K::Action) -> Result<(), FeedError> {
        self.command(Command::Send(action))
    }

    pub fn refresh(&self, play_sound: bool) -> Result<(), FeedError> {
        self.command(Command::Refresh { play_sound })
    }

    pub fn reconnect(&self) -> Result<(), FeedError> {
        self.command(Command::Reconnect)
    }

    pub fn view(&self) -> FeedView<K::Payload> {
        self.view.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<FeedView<K::Payload>> {
        self.view.clone()
    }

    /// Signal stream. The first call returns a receiver that has seen everything
    /// since the feed was spawned.
    pub fn signals(&mut self) -> broadcast::Receiver<FeedSignal> {
        self.first_signals
            .take()
            .unwrap_or_else(|| self.signals.subscribe())
    }

    /// Tear the feed down and wait for its task to finish.
    pub async fn shutdown(mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!(reason = %e, "feed task ended abnormally");
            }
        }
    }
}

impl<K: FeedKind> Drop for FeedHandle<K> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

fn publish<K: FeedKind, T: FeedTransport<K>>(
    r: &FeedReconciler<K, T>,
    view_tx: &watch::Sender<FeedView<K::Payload>>,
) {
    let next = r.view();
    view_tx.send_if_modified(|current| {
        if *current == next {
            return false;
        }
        *current = next;
        true
    });
}

/// Next event from a detached stream receiver; pends when there is none.
async fn recv_event<P>(events: &mut Option<mpsc::Receiver<TransportEvent<P>>>) -> Option<TransportEvent<P>> {
    match events.as_mut() {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Fetch a snapshot while still accepting commands and draining the push
/// stream, so the connection task never stalls on a full buffer. Commands
/// are queued and events buffered; both apply once the snapshot has landed.
async fn load<K: FeedKind, T: FeedTransport<K>>(
    r: &mut FeedReconciler<K, T>,
    play_sound: bool,
    commands: &mut mpsc::UnboundedReceiver<Command<K::Action>>,
    queued: &mut VecDeque<Command<K::Action>>,
    view_tx: &watch::Sender<FeedView<K::Payload>>,
) -> Flow {
    let Some(ticket) = r.begin_load(play_sound) else {
        return Flow::Continue;
    };
    publish(r, view_tx);
    let mut events = r.take_events();
    let mut buffered = Vec::new();
    let result = {
        let fetch = r.fetch_snapshot();
        tokio::pin!(fetch);
        loop {
            tokio::select! {
                result = &mut fetch => break Some(result),
                cmd = commands.recv() => match cmd {
                    Some(Command::Shutdown) | None => break None,
                    Some(cmd) => queued.push_back(cmd),
                },
                event = recv_event(&mut events) => match event {
                    Some(event) => buffered.push(event),
                    None => {
                        tracing::debug!("push stream ended during load");
                        events = None;
                    }
                },
            }
        }
    };
    r.restore_events(events);
    match result {
        Some(result) => {
            r.finish_load(ticket, result);
            for event in buffered {
                r.on_transport_event(event);
            }
            Flow::Continue
        }
        None => Flow::Stop,
    }
}

async fn run<K: FeedKind, T: FeedTransport<K>>(
    mut r: FeedReconciler<K, T>,
    mut commands: mpsc::UnboundedReceiver<Command<K::Action>>,
    view_tx: watch::Sender<FeedView<K::Payload>>,
) {
    let mut queued = VecDeque::new();
    let sweep_every = r
        .pending_timeout()
        .map(|t| (t / 4).max(Duration::from_millis(100)));
    let mut sweep = tokio::time::interval(sweep_every.unwrap_or(Duration::from_secs(3600)));
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut flow = load(&mut r, false, &mut commands, &mut queued, &view_tx).await;
    publish(&r, &view_tx);

    while let Flow::Continue = flow {
        let command = match queued.pop_front() {
            Some(cmd) => Some(cmd),
            None => tokio::select! {
                cmd = commands.recv() => Some(cmd.unwrap_or(Command::Shutdown)),
                event = r.next_event() => {
                    match event {
                        Some(event) => r.on_transport_event(event),
                        None => tracing::debug!("push stream ended"),
                    }
                    None
                }
                _ = sweep.tick(), if sweep_every.is_some() => {
                    r.expire_pending(Instant::now());
                    None
                }
            },
        };
        flow = match command {
            None => Flow::Continue,
            Some(Command::Send(action)) => {
                r.apply_optimistic(action);
                Flow::Continue
            }
            Some(Command::Refresh { play_sound }) => {
                load(&mut r, play_sound, &mut commands, &mut queued, &view_tx).await
            }
            Some(Command::Reconnect) => {
                r.reconnect();
                Flow::Continue
            }
            Some(Command::Shutdown) => Flow::Stop,
        };
        publish(&r, &view_tx);
    }

    r.teardown();
    publish(&r, &view_tx);
}
