//! Push channel: one Socket.IO connection loop for one feed.
//!
//! Connects over websocket, authenticates with the session token, joins the
//! feed's room, forwards decoded events, answers pings, and reconnects with the
//! configured bounded policy. Session rejection during the handshake is
//! terminal and never retried.

use crate::config::ReconnectionConfig;
use crate::item::{ConnectionStatus, ItemId, TransportEvent};
use crate::kind::FeedKind;
use crate::packet::Packet;
use anyhow::{Context, Result};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep, sleep_until, timeout, Duration, Instant};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Marker error: the server refused the credential. Never retried.
#[derive(Debug, Error)]
#[error("session rejected by push channel: {0}")]
pub struct SessionRejected(pub String);

/// Parameters for one stream, fixed for its lifetime.
#[derive(Debug, Clone)]
pub struct StreamParams {
    pub socket_url: String,
    pub token: String,
    pub join: Option<Packet>,
    pub reconnection: ReconnectionConfig,
}

/// A user action bound for the push channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Outgoing {
    pub packet: Packet,
    /// Item the action refers to, rolled back if the packet is never delivered.
    pub target: Option<ItemId>,
}

impl Outgoing {
    fn undelivered<P>(self, reason: &str) -> TransportEvent<P> {
        TransportEvent::ActionError {
            id: self.target,
            message: format!("action not delivered: {reason}"),
        }
    }
}

/// Engine.IO websocket endpoint under a base URL.
pub fn socket_endpoint(base: &str) -> String {
    format!(
        "{}/socket.io/?EIO=4&transport=websocket",
        base.trim_end_matches('/')
    )
}

struct Connection {
    sink: WsSink,
    source: WsSource,
    liveness: Duration,
}

enum SessionEnd {
    /// Our side is done: the feed closed the outgoing queue or dropped its event receiver.
    Shutdown,
    Lost(anyhow::Error),
}

/// Run the connection loop until shutdown, session rejection, or reconnection exhaustion.
pub async fn run_stream<K: FeedKind>(
    kind: Arc<K>,
    params: StreamParams,
    events: mpsc::Sender<TransportEvent<K::Payload>>,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
) {
    let reconnection = &params.reconnection;
    let mut reconnects = 0u32;
    loop {
        if events
            .send(TransportEvent::Status(ConnectionStatus::Connecting))
            .await
            .is_err()
        {
            return;
        }
        match timeout(reconnection.attempt_timeout, connect(&params)).await {
            Ok(Ok(conn)) => {
                reconnects = 0;
                tracing::info!(feed = kind.name(), "push channel connected");
                if events
                    .send(TransportEvent::Status(ConnectionStatus::Connected))
                    .await
                    .is_err()
                {
                    return;
                }
                match drive(&*kind, conn, &events, &mut outgoing).await {
                    SessionEnd::Shutdown => {
                        tracing::debug!(feed = kind.name(), "push channel closed");
                        return;
                    }
                    SessionEnd::Lost(e) => {
                        tracing::warn!(reason = %e, feed = kind.name(), "push channel dropped, reconnecting...");
                    }
                }
            }
            Ok(Err(e)) => {
                if let Some(rejected) = e.downcast_ref::<SessionRejected>() {
                    tracing::warn!(reason = %rejected.0, feed = kind.name(), "push channel refused session");
                    let _ = events
                        .send(TransportEvent::SessionRejected {
                            reason: rejected.0.clone(),
                        })
                        .await;
                    let _ = events
                        .send(TransportEvent::Status(ConnectionStatus::Disconnected))
                        .await;
                    return;
                }
                tracing::warn!(reason = %e, feed = kind.name(), attempt = reconnects, "push channel connect failed");
            }
            Err(_) => {
                tracing::warn!(feed = kind.name(), attempt = reconnects, "push channel handshake timed out");
            }
        }
        if events
            .send(TransportEvent::Status(ConnectionStatus::Disconnected))
            .await
            .is_err()
        {
            return;
        }
        if reconnects >= reconnection.max_attempts {
            tracing::warn!(feed = kind.name(), attempts = reconnects, "reconnection attempts exhausted");
            let _ = events
                .send(TransportEvent::GaveUp {
                    attempts: reconnects,
                })
                .await;
            // Actions queued for a connection that will not come back.
            outgoing.close();
            while let Ok(out) = outgoing.try_recv() {
                let _ = events.send(out.undelivered("connection lost")).await;
            }
            return;
        }
        reconnects += 1;
        sleep(reconnection.delay_for(reconnects)).await;
    }
}

async fn connect(params: &StreamParams) -> Result<Connection> {
    let url = socket_endpoint(&params.socket_url);
    let (ws, _) = match connect_async(&url).await {
        Ok(ok) => ok,
        Err(tungstenite::Error::Http(resp)) if resp.status().as_u16() == 401 => {
            return Err(SessionRejected("websocket upgrade refused with 401".into()).into());
        }
        Err(e) => return Err(e).context("WS connect"),
    };
    let (mut sink, mut source) = ws.split();

    let open = match next_packet(&mut source).await? {
        Packet::Open(info) => info,
        other => anyhow::bail!("expected open packet, got {other:?}"),
    };
    send_packet(&mut sink, &Packet::Connect(Some(json!({ "token": params.token }))))
        .await
        .context("send connect")?;
    loop {
        match next_packet(&mut source).await? {
            Packet::Connect(_) => break,
            Packet::ConnectError(message) => return Err(SessionRejected(message).into()),
            Packet::Ping => send_packet(&mut sink, &Packet::Pong).await.context("send pong")?,
            other => tracing::debug!(packet = ?other, "packet before connect ack skipped"),
        }
    }
    if let Some(join) = &params.join {
        send_packet(&mut sink, join).await.context("send join")?;
    }
    Ok(Connection {
        sink,
        source,
        liveness: open.liveness_window(),
    })
}

async fn send_packet(sink: &mut WsSink, packet: &Packet) -> Result<()> {
    sink.send(Message::Text(packet.encode()))
        .await
        .map_err(|e| anyhow::anyhow!("ws send: {}", e))
}

async fn next_packet(source: &mut WsSource) -> Result<Packet> {
    loop {
        match source.next().await {
            Some(Ok(Message::Text(text))) => {
                return Packet::decode(&text).map_err(|e| anyhow::anyhow!("packet: {}", e));
            }
            Some(Ok(Message::Close(_))) | None => anyhow::bail!("ws closed"),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(anyhow::anyhow!("ws: {}", e)),
        }
    }
}

async fn drive<K: FeedKind>(
    kind: &K,
    conn: Connection,
    events: &mpsc::Sender<TransportEvent<K::Payload>>,
    outgoing: &mut mpsc::UnboundedReceiver<Outgoing>,
) -> SessionEnd {
    let Connection {
        mut sink,
        mut source,
        liveness,
    } = conn;
    let mut deadline = Instant::now() + liveness;
    loop {
        tokio::select! {
            msg = source.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => {
                        return SessionEnd::Lost(anyhow::anyhow!("ws closed"));
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return SessionEnd::Lost(anyhow::anyhow!("ws: {}", e)),
                };
                deadline = Instant::now() + liveness;
                let packet = match Packet::decode(&text) {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::debug!(%e, "packet skipped");
                        continue;
                    }
                };
                match packet {
                    Packet::Ping => {
                        if let Err(e) = send_packet(&mut sink, &Packet::Pong).await {
                            return SessionEnd::Lost(e);
                        }
                    }
                    Packet::Event { name, data } => match kind.decode_event(&name, data) {
                        Ok(Some(ev)) => {
                            if events.send(ev).await.is_err() {
                                return SessionEnd::Shutdown;
                            }
                        }
                        Ok(None) => tracing::debug!(event = %name, feed = kind.name(), "event ignored"),
                        Err(e) => tracing::warn!(reason = %e, event = %name, "event decode failed"),
                    },
                    Packet::Disconnect | Packet::Close => {
                        return SessionEnd::Lost(anyhow::anyhow!("server closed the session"));
                    }
                    _ => {}
                }
            }
            out = outgoing.recv() => match out {
                Some(out) => {
                    if let Err(e) = send_packet(&mut sink, &out.packet).await {
                        tracing::warn!(reason = %e, feed = kind.name(), "emit failed");
                        let _ = events.send(out.undelivered("connection lost")).await;
                        return SessionEnd::Lost(e);
                    }
                }
                None => {
                    let _ = send_packet(&mut sink, &Packet::Disconnect).await;
                    let _ = sink.close().await;
                    return SessionEnd::Shutdown;
                }
            },
            _ = sleep_until(deadline) => {
                return SessionEnd::Lost(anyhow::anyhow!("ping timeout"));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kind::Notifications;
    use serde_json::json;

    #[test]
    fn endpoint_url() {
        assert_eq!(
            socket_endpoint("ws://h:3001/"),
            "ws://h:3001/socket.io/?EIO=4&transport=websocket"
        );
    }

    #[tokio::test]
    async fn gives_up_after_bounded_attempts() {
        // Bind then drop to get a port that refuses connections.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let params = StreamParams {
            socket_url: format!("ws://127.0.0.1:{port}"),
            token: "t".into(),
            join: None,
            reconnection: ReconnectionConfig {
                max_attempts: 5,
                initial_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(5),
                attempt_timeout: Duration::from_secs(2),
                jitter_ms: 0,
            },
        };
        let (tx, mut rx) = mpsc::channel(256);
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        out_tx
            .send(Outgoing {
                packet: Packet::event("accept-signup-request", json!({"requestId": 7})),
                target: Some(ItemId::Num(7)),
            })
            .unwrap();
        run_stream(Arc::new(Notifications), params, tx, out_rx).await;

        let mut connecting = 0;
        let mut last_status = None;
        let mut gave_up = None;
        let mut undelivered = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            match ev {
                TransportEvent::Status(s) => {
                    if s == ConnectionStatus::Connecting {
                        connecting += 1;
                    }
                    last_status = Some(s);
                }
                TransportEvent::GaveUp { attempts } => gave_up = Some(attempts),
                TransportEvent::ActionError { id, message } => {
                    assert!(gave_up.is_some(), "reported before giving up");
                    assert!(message.contains("not delivered"));
                    undelivered.push(id);
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        // Initial attempt plus five reconnection attempts.
        assert_eq!(connecting, 6);
        assert_eq!(last_status, Some(ConnectionStatus::Disconnected));
        assert_eq!(gave_up, Some(5));
        // The queued accept is handed back so its optimistic removal can roll back.
        assert_eq!(undelivered, vec![Some(ItemId::Num(7))]);
        assert!(out_tx.is_closed());
    }
}
