//! One WebSocket session per relay.
//!
//! ## Lifecycle
//!
//! `Disconnected → Connecting → Connected → Subscribed → Closing →
//! Disconnected`. Connects with a per-attempt timeout, installs the current
//! subscription filters, then pumps frames until the socket drops or a
//! close is requested. Reconnects after `base · 2^attempt` (capped) with
//! ±20% jitter; the attempt counter resets on a clean open. Filters are
//! re-sent on every reconnect. Close is idempotent.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use pulse_types::event::{Event, Filter};

use crate::frames::{ClientFrame, RelayFrame};
use crate::pool::{lock_health, now_ms, SharedHealth};
use crate::{RelayError, Result};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Per-attempt WebSocket connect budget.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-publish acknowledgement budget.
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// First reconnect delay.
const RECONNECT_BASE: Duration = Duration::from_secs(1);

/// Reconnect delay ceiling.
const RECONNECT_CAP: Duration = Duration::from_secs(60);

/// Multiplicative jitter applied to reconnect delays.
const JITTER_FRACTION: f64 = 0.2;

/// Session lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Subscribed = 3,
    Closing = 4,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => SessionState::Connecting,
            2 => SessionState::Connected,
            3 => SessionState::Subscribed,
            4 => SessionState::Closing,
            _ => SessionState::Disconnected,
        }
    }
}

/// Session settings.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub url: String,
    pub connect_timeout: Duration,
}

impl SessionConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// A verified-later event arriving from one relay.
#[derive(Clone, Debug)]
pub struct IncomingEvent {
    pub relay: String,
    pub event: Event,
}

type PublishAck = std::result::Result<String, String>;

enum Command {
    Publish {
        event_id: String,
        frame: String,
        ack: oneshot::Sender<PublishAck>,
    },
    Subscribe {
        sub_id: String,
        filter: Filter,
    },
    Unsubscribe {
        sub_id: String,
    },
    Close,
}

/// Handle to a running relay session task.
pub struct RelaySession {
    url: String,
    cmd_tx: mpsc::UnboundedSender<Command>,
    state: Arc<AtomicU8>,
    task: JoinHandle<()>,
}

impl RelaySession {
    /// Spawn the session task with the current subscription set.
    pub fn spawn(
        config: SessionConfig,
        filters: Vec<(String, Filter)>,
        events: mpsc::Sender<IncomingEvent>,
        health: SharedHealth,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let state = Arc::new(AtomicU8::new(SessionState::Disconnected as u8));
        let url = config.url.clone();

        let task = tokio::spawn(run_session(SessionCtx {
            config,
            filters: filters.into_iter().collect(),
            events,
            health,
            cmd_rx,
            state: state.clone(),
            pending: HashMap::new(),
        }));

        Self {
            url,
            cmd_tx,
            state,
            task,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Whether the session has an installed subscription right now.
    pub fn is_subscribed(&self) -> bool {
        self.state() == SessionState::Subscribed
    }

    /// Publish a pre-serialized event frame and await the relay's verdict.
    pub async fn publish(&self, event_id: &str, frame: String, timeout: Duration) -> Result<String> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Publish {
                event_id: event_id.to_string(),
                frame,
                ack: ack_tx,
            })
            .map_err(|_| RelayError::Closed)?;

        match tokio::time::timeout(timeout, ack_rx).await {
            Ok(Ok(Ok(message))) => Ok(message),
            Ok(Ok(Err(reason))) => Err(RelayError::Connect {
                url: self.url.clone(),
                reason,
            }),
            Ok(Err(_)) => Err(RelayError::Closed),
            Err(_) => Err(RelayError::Timeout),
        }
    }

    /// Install (or replace) a subscription. Applied on the live socket and
    /// re-sent after every reconnect.
    pub fn subscribe(&self, sub_id: impl Into<String>, filter: Filter) {
        let _ = self.cmd_tx.send(Command::Subscribe {
            sub_id: sub_id.into(),
            filter,
        });
    }

    /// Drop a subscription.
    pub fn unsubscribe(&self, sub_id: impl Into<String>) {
        let _ = self.cmd_tx.send(Command::Unsubscribe {
            sub_id: sub_id.into(),
        });
    }

    /// Request close. Safe to call repeatedly.
    pub fn close(&self) {
        let _ = self.cmd_tx.send(Command::Close);
    }

    /// Wait for the session task to finish after [`close`](Self::close).
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

struct SessionCtx {
    config: SessionConfig,
    filters: HashMap<String, Filter>,
    events: mpsc::Sender<IncomingEvent>,
    health: SharedHealth,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    state: Arc<AtomicU8>,
    pending: HashMap<String, oneshot::Sender<PublishAck>>,
}

enum ConnectedExit {
    /// Close was requested; do not reconnect.
    Close,
    /// The socket dropped; reconnect.
    Lost,
}

impl SessionCtx {
    fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn fail_pending(&mut self, reason: &str) {
        for (_, ack) in self.pending.drain() {
            let _ = ack.send(Err(reason.to_string()));
        }
    }
}

async fn run_session(mut ctx: SessionCtx) {
    let url = ctx.config.url.clone();
    let mut attempt: u32 = 0;

    loop {
        ctx.set_state(SessionState::Connecting);
        let started = Instant::now();

        match tokio::time::timeout(ctx.config.connect_timeout, connect_async(&url)).await {
            Ok(Ok((ws, _response))) => {
                let latency = started.elapsed().as_millis() as u64;
                lock_health(&ctx.health).record_success(&url, latency, now_ms());
                attempt = 0;
                ctx.set_state(SessionState::Connected);
                info!(%url, latency_ms = latency, "relay connected");

                let exit = run_connected(&mut ctx, ws).await;
                ctx.fail_pending("connection lost");
                match exit {
                    ConnectedExit::Close => break,
                    ConnectedExit::Lost => {
                        lock_health(&ctx.health).record_failure(&url, now_ms());
                    }
                }
            }
            Ok(Err(e)) => {
                debug!(%url, error = %e, "relay connect failed");
                lock_health(&ctx.health).record_failure(&url, now_ms());
            }
            Err(_) => {
                debug!(%url, "relay connect timed out");
                lock_health(&ctx.health).record_failure(&url, now_ms());
            }
        }

        let delay = backoff_delay(attempt);
        attempt = attempt.saturating_add(1);
        if wait_reconnect(&mut ctx, delay).await {
            break;
        }
    }

    ctx.set_state(SessionState::Closing);
    ctx.fail_pending("session closed");
    ctx.set_state(SessionState::Disconnected);
    debug!(%url, "relay session finished");
}

/// Sleep out the backoff, servicing commands meanwhile. Returns true when
/// the session should stop.
async fn wait_reconnect(ctx: &mut SessionCtx, delay: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + delay;
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => return false,
            cmd = ctx.cmd_rx.recv() => match cmd {
                None | Some(Command::Close) => return true,
                Some(Command::Publish { ack, .. }) => {
                    let _ = ack.send(Err("disconnected".to_string()));
                }
                Some(Command::Subscribe { sub_id, filter }) => {
                    ctx.filters.insert(sub_id, filter);
                }
                Some(Command::Unsubscribe { sub_id }) => {
                    ctx.filters.remove(&sub_id);
                }
            },
        }
    }
}

async fn run_connected(ctx: &mut SessionCtx, ws: WsStream) -> ConnectedExit {
    let (mut sink, mut source) = ws.split();

    // Reinstall every filter on each (re)connect.
    for (sub_id, filter) in ctx.filters.clone() {
        if send_frame(
            &mut sink,
            &ClientFrame::Req {
                sub_id: sub_id.clone(),
                filter,
            },
        )
        .await
        .is_err()
        {
            return ConnectedExit::Lost;
        }
    }
    ctx.set_state(SessionState::Subscribed);

    loop {
        tokio::select! {
            cmd = ctx.cmd_rx.recv() => match cmd {
                None | Some(Command::Close) => {
                    let _ = sink.send(Message::Close(None)).await;
                    return ConnectedExit::Close;
                }
                Some(Command::Subscribe { sub_id, filter }) => {
                    ctx.filters.insert(sub_id.clone(), filter.clone());
                    if send_frame(&mut sink, &ClientFrame::Req { sub_id, filter }).await.is_err() {
                        return ConnectedExit::Lost;
                    }
                }
                Some(Command::Unsubscribe { sub_id }) => {
                    if ctx.filters.remove(&sub_id).is_some() {
                        let _ = send_frame(&mut sink, &ClientFrame::Close { sub_id }).await;
                    }
                }
                Some(Command::Publish { event_id, frame, ack }) => {
                    match sink.send(Message::Text(frame)).await {
                        Ok(()) => {
                            ctx.pending.insert(event_id, ack);
                        }
                        Err(e) => {
                            let _ = ack.send(Err(e.to_string()));
                            return ConnectedExit::Lost;
                        }
                    }
                }
            },
            msg = source.next() => match msg {
                Some(Ok(Message::Text(text))) => handle_frame(ctx, &text).await,
                Some(Ok(Message::Ping(data))) => {
                    let _ = sink.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) | None => return ConnectedExit::Lost,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(url = %ctx.config.url, error = %e, "relay socket error");
                    return ConnectedExit::Lost;
                }
            },
        }
    }
}

async fn send_frame(sink: &mut WsSink, frame: &ClientFrame) -> Result<()> {
    let wire = frame.to_wire()?;
    sink.send(Message::Text(wire))
        .await
        .map_err(|e| RelayError::Frame(e.to_string()))
}

async fn handle_frame(ctx: &mut SessionCtx, text: &str) {
    match RelayFrame::parse(text) {
        Ok(RelayFrame::Event { event, .. }) => {
            let incoming = IncomingEvent {
                relay: ctx.config.url.clone(),
                event,
            };
            if ctx.events.send(incoming).await.is_err() {
                debug!("event channel closed; dropping event");
            }
        }
        Ok(RelayFrame::Eose { sub_id }) => {
            debug!(url = %ctx.config.url, %sub_id, "end of stored events");
        }
        Ok(RelayFrame::Notice { text }) => {
            warn!(url = %ctx.config.url, notice = %text, "relay notice");
        }
        Ok(RelayFrame::Ok {
            event_id,
            accepted,
            message,
        }) => {
            if let Some(ack) = ctx.pending.remove(&event_id) {
                let verdict = if accepted { Ok(message) } else { Err(message) };
                let _ = ack.send(verdict);
            }
        }
        Err(e) => {
            debug!(url = %ctx.config.url, error = %e, "unparsable relay frame");
        }
    }
}

/// `base · 2^attempt`, capped, with ±20% multiplicative jitter.
fn backoff_delay(attempt: u32) -> Duration {
    let exp = RECONNECT_BASE
        .as_millis()
        .saturating_mul(1u128 << attempt.min(16)) as u64;
    let capped = exp.min(RECONNECT_CAP.as_millis() as u64);
    let jitter = 1.0 - JITTER_FRACTION + rand::random::<f64>() * 2.0 * JITTER_FRACTION;
    Duration::from_millis(((capped as f64) * jitter) as u64)
}
