//! Gateway wire codec
//!
//! JSON frame model plus the zlib-stream inflater. Discord compresses the
//! whole connection as one continuous deflate stream and terminates each
//! logical message with a sync flush, so the inflate context must live as
//! long as the socket and a message may span several websocket frames.

use flate2::{Decompress, DecompressError, FlushDecompress, Status};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Sync-flush marker terminating every compressed gateway message
pub const ZLIB_SUFFIX: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// Gateway operation codes used by this client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    /// Server dispatches an event
    Dispatch = 0,
    /// Keepalive, sent by us (and occasionally requested by the server)
    Heartbeat = 1,
    /// Start a new session
    Identify = 2,
    /// Replay a dropped session
    Resume = 6,
    /// Server asks us to reconnect and resume
    Reconnect = 7,
    /// Session is invalid; `d` says whether it can be resumed
    InvalidSession = 9,
    /// First frame on a socket, carries the heartbeat interval
    Hello = 10,
    /// Heartbeat acknowledged
    HeartbeatAck = 11,
}

impl OpCode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Dispatch),
            1 => Some(Self::Heartbeat),
            2 => Some(Self::Identify),
            6 => Some(Self::Resume),
            7 => Some(Self::Reconnect),
            9 => Some(Self::InvalidSession),
            10 => Some(Self::Hello),
            11 => Some(Self::HeartbeatAck),
            _ => None,
        }
    }

    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

/// One gateway frame: `{op, d, s, t}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayPayload {
    pub op: u8,
    #[serde(default)]
    pub d: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

impl GatewayPayload {
    /// Build an outbound command frame
    pub fn command(op: OpCode, d: Value) -> Self {
        Self { op: op.as_u8(), d, s: None, t: None }
    }

    pub fn heartbeat(sequence: Option<u64>) -> Self {
        Self::command(OpCode::Heartbeat, sequence.map_or(Value::Null, Value::from))
    }

    pub fn opcode(&self) -> Option<OpCode> {
        OpCode::from_u8(self.op)
    }

    pub fn is_heartbeat(&self) -> bool {
        self.op == OpCode::Heartbeat.as_u8()
    }
}

/// `d` of a Hello frame
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Hello {
    /// Milliseconds
    pub heartbeat_interval: u64,
}

/// Client properties sent with Identify
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionProperties {
    pub os: String,
    pub browser: String,
    pub device: String,
}

impl Default for ConnectionProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            browser: env!("CARGO_PKG_NAME").to_string(),
            device: env!("CARGO_PKG_NAME").to_string(),
        }
    }
}

/// `d` of an Identify command
#[derive(Debug, Clone, Serialize)]
pub struct Identify {
    pub token: String,
    pub intents: u64,
    pub properties: ConnectionProperties,
    pub shard: [u32; 2],
    pub compress: bool,
}

/// `d` of a Resume command
#[derive(Debug, Clone, Serialize)]
pub struct Resume {
    pub token: String,
    pub session_id: String,
    pub seq: Option<u64>,
}

/// Codec failures. All of them are recoverable: the frame is dropped.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("inflate failed: {0}")]
    Inflate(#[from] DecompressError),
    #[error("inflated message is not UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("invalid gateway JSON: {0}")]
    Json(#[from] serde_json::Error),
}

pub fn encode(payload: &GatewayPayload) -> Result<String, serde_json::Error> {
    serde_json::to_string(payload)
}

pub fn decode(text: &str) -> Result<GatewayPayload, serde_json::Error> {
    serde_json::from_str(text)
}

/// Accumulates binary frames and inflates complete messages through one
/// persistent zlib context.
///
/// Create one per socket; a new socket is a new compressed stream.
pub struct Inflater {
    buffer: Vec<u8>,
    context: Decompress,
}

impl Inflater {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            context: Decompress::new(true),
        }
    }

    /// Bytes waiting for the sync-flush marker
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Feed one binary frame.
    ///
    /// Returns `Ok(None)` while the message is still incomplete. On error the
    /// accumulated buffer is discarded so the next message starts clean.
    pub fn push(&mut self, frame: &[u8]) -> Result<Option<String>, CodecError> {
        self.buffer.extend_from_slice(frame);

        if !self.buffer.ends_with(&ZLIB_SUFFIX) {
            return Ok(None);
        }

        let inflated = self.inflate();
        self.buffer.clear();

        let text = String::from_utf8(inflated?)?;
        Ok(Some(text))
    }

    fn inflate(&mut self) -> Result<Vec<u8>, DecompressError> {
        let input = &self.buffer;
        let mut out = Vec::with_capacity(input.len().saturating_mul(4).max(1024));
        let mut consumed = 0usize;

        loop {
            if out.len() == out.capacity() {
                out.reserve(out.capacity());
            }

            let in_before = self.context.total_in();
            let out_before = self.context.total_out();
            let status =
                self.context
                    .decompress_vec(&input[consumed..], &mut out, FlushDecompress::Sync)?;
            let read = (self.context.total_in() - in_before) as usize;
            let written = self.context.total_out() - out_before;
            consumed += read;

            if status == Status::StreamEnd {
                break;
            }
            // all input consumed and zlib had room left: message fully flushed
            if consumed >= input.len() && out.len() < out.capacity() {
                break;
            }
            if read == 0 && written == 0 && out.len() < out.capacity() {
                break;
            }
        }

        Ok(out)
    }
}

impl Default for Inflater {
    fn default() -> Self {
        Self::new()
    }
}
