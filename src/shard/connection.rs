//! Shard connection driver
//!
//! One `Shard` owns one gateway socket at a time. While connected it runs
//! three tasks: the receive loop (which also arms the zombie timer), the
//! heartbeat loop, and the command-window clock. Teardown always goes
//! through the receive loop so the manager hears about it exactly once.

use crate::codec::{self, ConnectionProperties, GatewayPayload, Identify, Inflater, OpCode, Resume};
use crate::error::GatewayError;
use crate::events::EventRouter;
use crate::metrics::GatewayMetrics;
use crate::ratelimit::CommandThrottle;
use crate::shard::session::{
    Action, Handshake, Phase, SessionState, NORMAL_CLOSE, SESSION_TIMED_OUT,
};
use crate::shard::state::{ShardHealth, ShardState};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::borrow::Cow;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch::error::RecvError;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Close codes after which the server will not accept this identity again
const FATAL_CLOSE_CODES: &[u16] = &[4004, 4010, 4011, 4012, 4013, 4014];

/// Per-shard settings
#[derive(Debug, Clone)]
pub struct ShardConfig {
    pub token: String,
    pub intents: u64,
    /// Base gateway URL; version and encoding are appended
    pub gateway_url: String,
    pub version: u8,
    pub heartbeat_timeout: Duration,
    pub command_limit: u32,
    /// Whether the owning connection state is allowed to use the gateway
    pub gateway_enabled: bool,
}

impl ShardConfig {
    pub fn url(&self) -> String {
        format!(
            "{}/?v={}&encoding=json&compress=zlib-stream",
            self.gateway_url.trim_end_matches('/'),
            self.version
        )
    }
}

/// Sent to the manager once per socket teardown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardNotice {
    pub shard_id: u32,
    /// False when the shard was told to stay down
    pub reconnect: bool,
    /// The socket reached READY or RESUMED before it went away
    pub established: bool,
}

#[derive(Debug, Clone, Copy)]
struct StopRequest {
    code: u16,
    reconnect: bool,
}

/// A running socket: its stop signal and its receive task
struct Link {
    stop: watch::Sender<Option<StopRequest>>,
    task: JoinHandle<()>,
}

impl StopRequest {
    fn from_signal(changed: Result<(), RecvError>, stop: &watch::Receiver<Option<StopRequest>>) -> Self {
        let request = match changed {
            Ok(()) => *stop.borrow(),
            Err(_) => None,
        };
        request.unwrap_or(StopRequest { code: NORMAL_CLOSE, reconnect: false })
    }
}

/// What the receive loop does after applying a message
#[derive(Debug, Clone, Copy)]
enum Step {
    Continue,
    /// Send the handshake without holding up the loop
    Handshake(Handshake),
    Stop(Outcome),
}

/// Resolves at the zombie deadline, never without one
async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// How a receive loop ended
#[derive(Debug, Clone, Copy)]
enum Outcome {
    /// `disconnect` was called
    Requested(StopRequest),
    /// Server asked us to reconnect (op 7 / op 9)
    Reconnect { code: u16 },
    /// No heartbeat ack within the liveness window
    Zombie,
    /// Server sent a close frame
    Closed { code: Option<u16> },
    /// Stream errored or ended without a close frame
    Lost,
}

impl Outcome {
    fn close_code(self) -> u16 {
        match self {
            Self::Requested(req) => req.code,
            Self::Reconnect { code } => code,
            Self::Zombie => SESSION_TIMED_OUT,
            Self::Closed { .. } | Self::Lost => NORMAL_CLOSE,
        }
    }

    fn reconnect(self) -> bool {
        match self {
            Self::Requested(req) => req.reconnect,
            Self::Closed { code: Some(code) } => !FATAL_CLOSE_CODES.contains(&code),
            _ => true,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Requested(_) => "requested",
            Self::Reconnect { .. } => "server_reconnect",
            Self::Zombie => "zombie",
            Self::Closed { .. } => "closed",
            Self::Lost => "lost",
        }
    }
}

/// One gateway shard
pub struct Shard {
    id: u32,
    count: u32,
    config: Arc<ShardConfig>,
    router: Arc<EventRouter>,
    notices: mpsc::UnboundedSender<ShardNotice>,
    health: ShardState,
    metrics: Arc<GatewayMetrics>,
    session: Mutex<SessionState>,
    throttle: CommandThrottle,
    sink: tokio::sync::Mutex<Option<WsSink>>,
    link: tokio::sync::Mutex<Option<Link>>,
    /// Set by `disconnect(_, false)`; manager reconnects leave the shard down
    halted: AtomicBool,
}

impl Shard {
    /// Create a shard. Fails when the configuration does not allow gateway use.
    pub fn new(
        id: u32,
        count: u32,
        config: Arc<ShardConfig>,
        router: Arc<EventRouter>,
        notices: mpsc::UnboundedSender<ShardNotice>,
        health: ShardState,
        metrics: Arc<GatewayMetrics>,
    ) -> Result<Arc<Self>, GatewayError> {
        if !config.gateway_enabled {
            return Err(GatewayError::Config(
                "connection state is not gateway enabled; use the REST executor alone".to_string(),
            ));
        }
        if id >= count {
            return Err(GatewayError::Config(format!(
                "shard id {id} out of range for shard count {count}"
            )));
        }

        Ok(Arc::new(Self {
            id,
            count,
            throttle: CommandThrottle::new(config.command_limit),
            config,
            router,
            notices,
            health,
            metrics,
            session: Mutex::new(SessionState::new(id)),
            sink: tokio::sync::Mutex::new(None),
            link: tokio::sync::Mutex::new(None),
            halted: AtomicBool::new(false),
        }))
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn phase(&self) -> Phase {
        self.session().phase()
    }

    pub fn sequence(&self) -> Option<u64> {
        self.session().sequence()
    }

    pub fn session_id(&self) -> Option<String> {
        self.session().session_id().map(str::to_string)
    }

    pub fn throttle(&self) -> &CommandThrottle {
        &self.throttle
    }

    fn session(&self) -> MutexGuard<'_, SessionState> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a socket and start the receive loop. The handshake is sent once
    /// the server's Hello arrives. Clears an earlier stop.
    pub async fn connect(self: &Arc<Self>) -> Result<(), GatewayError> {
        self.halted.store(false, Ordering::Release);
        self.open(true).await
    }

    /// Reconnect on behalf of the manager. A shard that was told to stay down
    /// is left alone.
    pub(crate) async fn reconnect(self: &Arc<Self>) -> Result<(), GatewayError> {
        self.open(false).await
    }

    async fn open(self: &Arc<Self>, requested: bool) -> Result<(), GatewayError> {
        let mut link = self.link.lock().await;
        if !requested && self.halted.load(Ordering::Acquire) {
            debug!(shard_id = self.id, "Shard was stopped, not reconnecting");
            return Ok(());
        }
        if let Some(previous) = link.take() {
            // a finished loop from the last socket, or a live one being replaced
            let _ = previous.stop.send(Some(StopRequest { code: NORMAL_CLOSE, reconnect: false }));
            let _ = previous.task.await;
        }

        self.session().begin_connect();
        self.health.set_health(self.id, ShardHealth::Connecting);

        let url = self.config.url();
        debug!(shard_id = self.id, %url, "Connecting to the Gateway");
        let stream = match connect_async(url.as_str()).await {
            Ok((stream, _)) => stream,
            Err(source) => {
                self.session().socket_closed(false);
                self.health.set_health(self.id, ShardHealth::Disconnected);
                return Err(GatewayError::WebSocket { shard_id: self.id, source });
            }
        };
        let (sink, source) = stream.split();

        *self.sink.lock().await = Some(sink);
        self.session().socket_open();

        let (stop, stop_rx) = watch::channel(None);
        let task = tokio::spawn(Arc::clone(self).receive(source, stop_rx));
        *link = Some(Link { stop, task });

        Ok(())
    }

    /// Close the socket and stop all background tasks. Idempotent; only the
    /// call that actually tears the socket down waits for it.
    ///
    /// With `reconnect == false` the shard stays down even if its socket had
    /// already closed on its own and a reconnect was queued.
    pub async fn disconnect(&self, code: u16, reconnect: bool) {
        if !reconnect {
            self.halted.store(true, Ordering::Release);
        }

        let Some(link) = self.link.lock().await.take() else {
            debug!(shard_id = self.id, "Disconnect requested but shard is not connected");
            return;
        };

        let _ = link.stop.send(Some(StopRequest { code, reconnect }));
        if let Err(e) = link.task.await {
            error!(shard_id = self.id, error = %e, "Receive task ended abnormally");
        }

        // the loop ended before the request reached it and asked for a reconnect
        if !reconnect && self.phase() == Phase::Reconnecting {
            self.session().socket_closed(true);
            self.health.set_health(self.id, ShardHealth::Dead);
            info!(shard_id = self.id, "Shard stopped while waiting to reconnect");
            let _ = self.notices.send(ShardNotice {
                shard_id: self.id,
                reconnect: false,
                established: false,
            });
        }
    }

    /// Send a gateway command. Everything but heartbeats is throttled.
    pub async fn send(&self, payload: &GatewayPayload) -> Result<(), GatewayError> {
        if !payload.is_heartbeat() && self.throttle.acquire().await {
            self.metrics.record_command_throttled(self.id);
        }

        let text = codec::encode(payload)?;
        debug!(shard_id = self.id, op = payload.op, "Sending gateway command");

        let mut sink = self.sink.lock().await;
        let sink = sink
            .as_mut()
            .ok_or(GatewayError::NotConnected { shard_id: self.id })?;
        sink.send(Message::Text(text))
            .await
            .map_err(|source| GatewayError::WebSocket { shard_id: self.id, source })?;

        self.metrics.record_command(self.id, payload.op);
        Ok(())
    }

    async fn identify(&self) -> Result<(), GatewayError> {
        let identify = Identify {
            token: self.config.token.clone(),
            intents: self.config.intents,
            properties: ConnectionProperties::default(),
            shard: [self.id, self.count],
            compress: false,
        };
        let payload = GatewayPayload::command(OpCode::Identify, serde_json::to_value(identify)?);
        self.send(&payload).await
    }

    async fn resume(&self) -> Result<(), GatewayError> {
        let resume = {
            let session = self.session();
            Resume {
                token: self.config.token.clone(),
                session_id: session.session_id().unwrap_or_default().to_string(),
                seq: session.sequence(),
            }
        };
        debug!(shard_id = self.id, seq = ?resume.seq, "Resuming gateway session");
        let payload = GatewayPayload::command(OpCode::Resume, serde_json::to_value(resume)?);
        self.send(&payload).await
    }

    async fn handshake(&self, handshake: Handshake) -> Result<(), GatewayError> {
        match handshake {
            Handshake::Identify => self.identify().await,
            Handshake::Resume => {
                self.health.set_health(self.id, ShardHealth::Resuming);
                self.resume().await
            }
        }
    }

    async fn heartbeat(self: Arc<Self>, interval: Duration) {
        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        loop {
            ticker.tick().await;
            let payload = GatewayPayload::heartbeat(self.sequence());
            if let Err(e) = self.send(&payload).await {
                warn!(shard_id = self.id, error = %e, "Heartbeat failed");
            }
        }
    }

    async fn receive(self: Arc<Self>, mut source: WsSource, mut stop: watch::Receiver<Option<StopRequest>>) {
        let mut inflater = Inflater::new();
        let mut heartbeat: Option<JoinHandle<()>> = None;
        let clock = tokio::spawn({
            let shard = Arc::clone(&self);
            async move { shard.throttle.run_clock().await }
        });

        let mut established = false;
        // handshake waiting on the command throttle; frames keep flowing meanwhile
        let mut handshake: Option<Pin<Box<dyn Future<Output = Result<(), GatewayError>> + Send + '_>>> = None;

        let outcome = loop {
            let deadline = self.session().liveness_deadline(self.config.heartbeat_timeout);

            tokio::select! {
                changed = stop.changed() => {
                    break Outcome::Requested(StopRequest::from_signal(changed, &stop));
                }
                () = expire(deadline) => {
                    warn!(shard_id = self.id, "No heartbeat ack within liveness window, session timed out");
                    break Outcome::Zombie;
                }
                sent = async {
                    match handshake.as_mut() {
                        Some(pending) => pending.await,
                        None => std::future::pending().await,
                    }
                }, if handshake.is_some() => {
                    handshake = None;
                    if let Err(e) = sent {
                        warn!(shard_id = self.id, error = %e, "Handshake failed");
                        break Outcome::Lost;
                    }
                }
                message = source.next() => {
                    let text = match message {
                        Some(Ok(Message::Binary(bytes))) => match inflater.push(&bytes) {
                            Ok(Some(text)) => text,
                            Ok(None) => continue,
                            Err(e) => {
                                let err = GatewayError::Protocol { shard_id: self.id, reason: e.to_string() };
                                warn!(shard_id = self.id, error = %err, "Dropping corrupted message");
                                self.metrics.record_error(self.id, err.error_type_label());
                                continue;
                            }
                        },
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Close(frame))) => {
                            let code = frame.map(|f| u16::from(f.code));
                            info!(shard_id = self.id, ?code, "Gateway closed the connection");
                            break Outcome::Closed { code };
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            let err = GatewayError::WebSocket { shard_id: self.id, source: e };
                            warn!(shard_id = self.id, error = %err, "Gateway connection lost");
                            break Outcome::Lost;
                        }
                        None => {
                            let err = GatewayError::ConnectionLost { shard_id: self.id };
                            warn!(shard_id = self.id, error = %err, "Gateway stream ended");
                            break Outcome::Lost;
                        }
                    };

                    let step = self.handle_message(&text, &mut heartbeat).await;
                    established |= self.phase() == Phase::Steady;

                    match step {
                        Step::Continue => {}
                        Step::Stop(outcome) => break outcome,
                        // a newer Hello replaces a handshake still waiting
                        Step::Handshake(kind) => handshake = Some(Box::pin(self.handshake(kind))),
                    }
                }
            }
        };

        if let Some(task) = heartbeat.take() {
            task.abort();
            let _ = task.await;
        }
        clock.abort();
        let _ = clock.await;

        self.close_socket(outcome.close_code()).await;

        let reconnect = outcome.reconnect();
        self.session().socket_closed(!reconnect);
        self.health.set_health(
            self.id,
            if reconnect { ShardHealth::Disconnected } else { ShardHealth::Dead },
        );
        if reconnect {
            self.metrics.record_reconnect(self.id, outcome.label());
        }

        info!(shard_id = self.id, reason = outcome.label(), reconnect, established, "Shard disconnected");
        let _ = self.notices.send(ShardNotice { shard_id: self.id, reconnect, established });
    }

    /// Decode and apply one complete message
    async fn handle_message(
        self: &Arc<Self>,
        text: &str,
        heartbeat: &mut Option<JoinHandle<()>>,
    ) -> Step {
        let payload = match codec::decode(text) {
            Ok(payload) => payload,
            Err(e) => {
                let err = GatewayError::Protocol { shard_id: self.id, reason: e.to_string() };
                warn!(shard_id = self.id, error = %err, "Dropping undecodable message");
                return Step::Continue;
            }
        };

        debug!(shard_id = self.id, op = payload.op, s = ?payload.s, t = ?payload.t, "Received gateway message");
        self.router.frame(&payload);

        let action = self.session().handle(&payload);
        match action {
            Action::None => {
                if payload.opcode() == Some(OpCode::HeartbeatAck) {
                    self.health.record_heartbeat_ack(self.id);
                    self.metrics.record_heartbeat_ack(self.id);
                }
            }
            Action::Hello { interval, handshake } => {
                if let Some(previous) = heartbeat.replace(tokio::spawn(Arc::clone(self).heartbeat(interval))) {
                    previous.abort();
                }
                return Step::Handshake(handshake);
            }
            Action::Dispatch { event } => {
                match event.as_str() {
                    "READY" => {
                        let guilds = payload.d.get("guilds").and_then(|g| g.as_array()).map_or(0, Vec::len);
                        self.health.set_guilds(self.id, guilds as u64);
                        self.health.set_health(self.id, ShardHealth::Ready);
                    }
                    "RESUMED" => self.health.set_health(self.id, ShardHealth::Ready),
                    _ => {}
                }
                self.health.record_event(self.id);
                self.metrics.record_event(self.id, &event);
                self.router.dispatch(&event, &payload.d);
            }
            Action::Heartbeat => {
                if let Err(e) = self.send(&GatewayPayload::heartbeat(self.sequence())).await {
                    warn!(shard_id = self.id, error = %e, "Requested heartbeat failed");
                }
            }
            Action::Reconnect { code } => {
                if payload.opcode() == Some(OpCode::InvalidSession) {
                    let err = GatewayError::SessionInvalidated {
                        shard_id: self.id,
                        resumable: payload.d.as_bool().unwrap_or(false),
                    };
                    self.metrics.record_error(self.id, err.error_type_label());
                    info!(shard_id = self.id, error = %err, "Reconnecting after invalid session");
                }
                return Step::Stop(Outcome::Reconnect { code });
            }
        }

        Step::Continue
    }

    async fn close_socket(&self, code: u16) {
        let Some(mut sink) = self.sink.lock().await.take() else {
            return;
        };
        let frame = CloseFrame { code: CloseCode::from(code), reason: Cow::Borrowed("") };
        if let Err(e) = sink.send(Message::Close(Some(frame))).await {
            debug!(shard_id = self.id, error = %e, "Close frame not delivered");
        }
        let _ = sink.close().await;
    }
}

impl std::fmt::Debug for Shard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shard")
            .field("id", &self.id)
            .field("count", &self.count)
            .field("phase", &self.phase())
            .field("sequence", &self.sequence())
            .finish()
    }
}
