//! Gateway session state machine
//!
//! Pure bookkeeping: feeds on decoded frames and tells the connection what
//! to do next. Nothing here touches the socket, which keeps the protocol
//! rules testable without a server.

use crate::codec::{GatewayPayload, Hello, OpCode};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Close code we send when the server stopped acknowledging heartbeats
pub const SESSION_TIMED_OUT: u16 = 4009;

/// Close code that keeps the session resumable on the server side
pub const RESUMABLE_CLOSE: u16 = 4000;

/// Normal closure; the server drops the session
pub const NORMAL_CLOSE: u16 = 1000;

/// Connection phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Disconnected,
    Connecting,
    AwaitingHello,
    Identifying,
    Resuming,
    Steady,
    Reconnecting,
}

/// Which handshake to send after Hello
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handshake {
    Identify,
    Resume,
}

/// What the connection must do in response to a frame
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Nothing beyond bookkeeping
    None,
    /// Start heartbeating and send the handshake
    Hello { interval: Duration, handshake: Handshake },
    /// Forward a dispatch event
    Dispatch { event: String },
    /// Server asked for an immediate heartbeat
    Heartbeat,
    /// Close the socket with `code` and reconnect
    Reconnect { code: u16 },
}

#[derive(Debug)]
pub struct SessionState {
    shard_id: u32,
    phase: Phase,
    sequence: Option<u64>,
    session_id: Option<String>,
    resumable: Option<bool>,
    heartbeat_interval: Option<Duration>,
    hello_at: Option<Instant>,
    last_heartbeat_ack: Option<Instant>,
}

impl SessionState {
    pub fn new(shard_id: u32) -> Self {
        Self {
            shard_id,
            phase: Phase::Disconnected,
            sequence: None,
            session_id: None,
            resumable: None,
            heartbeat_interval: None,
            hello_at: None,
            last_heartbeat_ack: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn sequence(&self) -> Option<u64> {
        self.sequence
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn resumable(&self) -> Option<bool> {
        self.resumable
    }

    pub fn last_heartbeat_ack(&self) -> Option<Instant> {
        self.last_heartbeat_ack
    }

    /// Handshake the next Hello will trigger
    pub fn next_handshake(&self) -> Handshake {
        match self.resumable {
            Some(true) => Handshake::Resume,
            Some(false) => Handshake::Identify,
            None if self.session_id.is_some() => Handshake::Resume,
            None => Handshake::Identify,
        }
    }

    /// A new socket is being opened. Liveness is per socket.
    pub fn begin_connect(&mut self) {
        self.phase = Phase::Connecting;
        self.hello_at = None;
        self.last_heartbeat_ack = None;
    }

    pub fn socket_open(&mut self) {
        self.phase = Phase::AwaitingHello;
    }

    /// The socket is gone; `terminal` when no reconnect will follow.
    pub fn socket_closed(&mut self, terminal: bool) {
        self.phase = if terminal { Phase::Disconnected } else { Phase::Reconnecting };
        self.hello_at = None;
        self.last_heartbeat_ack = None;
    }

    /// Instant after which the connection counts as a zombie.
    ///
    /// The window never drops below one and a half heartbeat intervals, so a
    /// short timeout cannot fire between two healthy acks.
    pub fn liveness_deadline(&self, timeout: Duration) -> Option<Instant> {
        let since = self.last_heartbeat_ack.or(self.hello_at)?;
        let window = match self.heartbeat_interval {
            Some(interval) => timeout.max(interval + interval / 2),
            None => timeout,
        };
        Some(since + window)
    }

    /// Apply one inbound frame
    pub fn handle(&mut self, payload: &GatewayPayload) -> Action {
        let Some(op) = payload.opcode() else {
            debug!(shard_id = self.shard_id, op = payload.op, "Ignoring unknown opcode");
            return Action::None;
        };

        match op {
            OpCode::Dispatch => self.on_dispatch(payload),
            OpCode::Hello => self.on_hello(payload),
            OpCode::HeartbeatAck => {
                self.last_heartbeat_ack = Some(Instant::now());
                Action::None
            }
            OpCode::Heartbeat => Action::Heartbeat,
            OpCode::Reconnect => {
                info!(shard_id = self.shard_id, "Gateway requested reconnect");
                self.resumable = Some(true);
                self.phase = Phase::Reconnecting;
                Action::Reconnect { code: RESUMABLE_CLOSE }
            }
            OpCode::InvalidSession => {
                let resumable = payload.d.as_bool().unwrap_or(false);
                warn!(shard_id = self.shard_id, resumable, "Gateway invalidated session");
                self.resumable = Some(resumable);
                self.phase = Phase::Reconnecting;
                if resumable {
                    Action::Reconnect { code: RESUMABLE_CLOSE }
                } else {
                    self.session_id = None;
                    self.sequence = None;
                    Action::Reconnect { code: NORMAL_CLOSE }
                }
            }
            OpCode::Identify | OpCode::Resume => {
                debug!(shard_id = self.shard_id, op = payload.op, "Ignoring client-only opcode");
                Action::None
            }
        }
    }

    fn on_hello(&mut self, payload: &GatewayPayload) -> Action {
        let interval = match serde_json::from_value::<Hello>(payload.d.clone()) {
            Ok(hello) => Duration::from_millis(hello.heartbeat_interval),
            Err(e) => {
                warn!(shard_id = self.shard_id, error = %e, "Malformed Hello payload");
                return Action::None;
            }
        };

        self.heartbeat_interval = Some(interval);
        self.hello_at = Some(Instant::now());

        let handshake = self.next_handshake();
        match handshake {
            Handshake::Identify => {
                // fresh session: nothing from the previous one carries over
                self.session_id = None;
                self.sequence = None;
                self.phase = Phase::Identifying;
            }
            Handshake::Resume => self.phase = Phase::Resuming,
        }

        Action::Hello { interval, handshake }
    }

    fn on_dispatch(&mut self, payload: &GatewayPayload) -> Action {
        if let Some(seq) = payload.s {
            match self.sequence {
                Some(prev) if seq < prev => {
                    warn!(shard_id = self.shard_id, prev, seq, "Sequence went backwards");
                }
                _ => self.sequence = Some(seq),
            }
        }

        let Some(event) = payload.t.clone() else {
            return Action::None;
        };

        match event.as_str() {
            "READY" => {
                self.session_id = payload
                    .d
                    .get("session_id")
                    .and_then(|v| v.as_str())
                    .map(str::to_string);
                self.resumable = None;
                self.phase = Phase::Steady;
                info!(shard_id = self.shard_id, session_id = ?self.session_id, "Connected to Gateway");
            }
            "RESUMED" => {
                self.resumable = None;
                self.phase = Phase::Steady;
                info!(shard_id = self.shard_id, sequence = ?self.sequence, "Session resumed");
            }
            _ => {}
        }

        Action::Dispatch { event }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(value: serde_json::Value) -> GatewayPayload {
        serde_json::from_value(value).unwrap()
    }

    fn hello() -> GatewayPayload {
        frame(json!({"op": 10, "d": {"heartbeat_interval": 41250}}))
    }

    fn dispatch(t: &str, s: u64, d: serde_json::Value) -> GatewayPayload {
        frame(json!({"op": 0, "t": t, "s": s, "d": d}))
    }

    #[test]
    fn test_first_hello_identifies() {
        let mut session = SessionState::new(0);
        session.begin_connect();
        session.socket_open();

        let action = session.handle(&hello());
        assert_eq!(
            action,
            Action::Hello { interval: Duration::from_millis(41250), handshake: Handshake::Identify }
        );
        assert_eq!(session.phase(), Phase::Identifying);
    }

    #[test]
    fn test_ready_assigns_session() {
        let mut session = SessionState::new(0);
        session.handle(&hello());
        let action = session.handle(&dispatch("READY", 1, json!({"session_id": "abc"})));

        assert_eq!(action, Action::Dispatch { event: "READY".to_string() });
        assert_eq!(session.session_id(), Some("abc"));
        assert_eq!(session.phase(), Phase::Steady);
        assert_eq!(session.next_handshake(), Handshake::Resume);
    }

    #[test]
    fn test_sequence_tracks_maximum() {
        let mut session = SessionState::new(0);
        for s in [1, 2, 5, 3, 7] {
            session.handle(&dispatch("MESSAGE_CREATE", s, json!({})));
        }
        assert_eq!(session.sequence(), Some(7));

        // null sequence on non-dispatch frames leaves it alone
        session.handle(&frame(json!({"op": 11, "d": null, "s": null})));
        assert_eq!(session.sequence(), Some(7));
    }

    #[test]
    fn test_reconnect_before_ready_resumes() {
        let mut session = SessionState::new(0);
        session.handle(&hello());
        let action = session.handle(&frame(json!({"op": 7, "d": null})));

        assert_eq!(action, Action::Reconnect { code: RESUMABLE_CLOSE });
        assert_eq!(session.resumable(), Some(true));
        assert_eq!(session.phase(), Phase::Reconnecting);

        session.socket_closed(false);
        session.begin_connect();
        session.socket_open();
        match session.handle(&hello()) {
            Action::Hello { handshake, .. } => assert_eq!(handshake, Handshake::Resume),
            other => panic!("unexpected action {other:?}"),
        }
        assert_eq!(session.phase(), Phase::Resuming);
    }

    #[test]
    fn test_invalid_session_not_resumable_clears_state() {
        let mut session = SessionState::new(0);
        session.handle(&hello());
        session.handle(&dispatch("READY", 4, json!({"session_id": "abc"})));

        let action = session.handle(&frame(json!({"op": 9, "d": false})));
        assert_eq!(action, Action::Reconnect { code: NORMAL_CLOSE });
        assert!(session.session_id().is_none());
        assert!(session.sequence().is_none());
        assert_eq!(session.next_handshake(), Handshake::Identify);
    }

    #[test]
    fn test_invalid_session_resumable_keeps_state() {
        let mut session = SessionState::new(0);
        session.handle(&dispatch("READY", 4, json!({"session_id": "abc"})));

        let action = session.handle(&frame(json!({"op": 9, "d": true})));
        assert_eq!(action, Action::Reconnect { code: RESUMABLE_CLOSE });
        assert_eq!(session.session_id(), Some("abc"));
        assert_eq!(session.sequence(), Some(4));
        assert_eq!(session.next_handshake(), Handshake::Resume);
    }

    #[test]
    fn test_server_heartbeat_request() {
        let mut session = SessionState::new(0);
        assert_eq!(session.handle(&frame(json!({"op": 1, "d": null}))), Action::Heartbeat);
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_deadline_follows_acks() {
        let mut session = SessionState::new(0);
        assert!(session.liveness_deadline(Duration::from_secs(60)).is_none());

        session.handle(&hello());
        let first = session.liveness_deadline(Duration::from_secs(60)).unwrap();

        tokio::time::advance(Duration::from_secs(40)).await;
        session.handle(&frame(json!({"op": 11})));
        let second = session.liveness_deadline(Duration::from_secs(60)).unwrap();
        assert_eq!(second - first, Duration::from_secs(40));
    }

    #[test]
    fn test_liveness_window_never_shorter_than_interval() {
        let mut session = SessionState::new(0);
        session.handle(&hello());
        let deadline = session.liveness_deadline(Duration::from_secs(5)).unwrap();
        let window = deadline - session.hello_at.unwrap();
        assert!(window >= Duration::from_millis(41250));
    }
}
