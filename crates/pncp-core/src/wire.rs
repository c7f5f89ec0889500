//! Wire codec: newline-delimited JSON frames over an ordered byte stream.
//!
//! Each frame is one JSON object followed by `\n`. serde_json escapes any
//! newline inside string values, so the terminator is unambiguous and a
//! partial read can always resume mid-frame. Unlike a lossy event bus, a
//! malformed frame here is fatal to the owning connection: [`FrameDecoder`]
//! poisons itself on the first error and the session is expected to tear
//! down.

use crate::command::CommandKey;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use uuid::Uuid;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;

const READ_CHUNK_BYTES: usize = 4096;

/// The only structure ever placed on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Message {
    AuthChallenge(AuthChallenge),
    AuthResponse(AuthResponse),
    Command(CommandRequest),
    Result(CommandResult),
    Metric(MetricUpdate),
    Heartbeat(Heartbeat),
    Error(ErrorNotice),
}

impl Message {
    /// Wire tag, for logs and audit records.
    pub fn tag(&self) -> &'static str {
        match self {
            Message::AuthChallenge(_) => "auth_challenge",
            Message::AuthResponse(_) => "auth_response",
            Message::Command(_) => "command",
            Message::Result(_) => "result",
            Message::Metric(_) => "metric",
            Message::Heartbeat(_) => "heartbeat",
            Message::Error(_) => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthChallenge {
    /// Random nonce, hex lowercase.
    pub nonce: String,
    /// Controller clock at challenge time, unix seconds.
    pub issued_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthResponse {
    pub agent_id: String,
    /// HMAC-SHA256 over the canonical challenge encoding, hex lowercase.
    pub mac: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandRequest {
    pub correlation_id: Uuid,
    pub command: CommandKey,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandResult {
    pub correlation_id: Uuid,
    /// 0 on success; -124 marks an agent-side execution timeout.
    pub exit_code: i32,
    pub output: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricUpdate {
    pub agent_id: String,
    /// Collection time on the agent, unix seconds.
    pub collected_at: i64,
    pub report: MetricsReport,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Heartbeat {
    pub agent_id: String,
    pub sent_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorNotice {
    pub code: String,
    pub message: String,
}

/// Host telemetry snapshot. A closed schema: unknown shapes are a decode
/// error, not data.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsReport {
    /// Load-normalized CPU usage estimate, percent.
    pub cpu_percent: f64,
    pub memory: MemoryStats,
    pub load_avg: LoadAvg,
    pub disk: DiskStats,
    /// Per-interface byte counters; empty where the platform exposes none.
    #[serde(default)]
    pub net: BTreeMap<String, InterfaceCounters>,
}

/// All sizes in bytes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryStats {
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub percent: f64,
    pub swap_total: u64,
    pub swap_used: u64,
    pub swap_free: u64,
    pub swap_percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoadAvg {
    pub one: f64,
    pub five: f64,
    pub fifteen: f64,
}

/// All sizes in bytes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiskStats {
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InterfaceCounters {
    pub bytes_sent: u64,
    pub bytes_recv: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("buffer exceeds max size without a frame terminator: {size} > {max}")]
    OversizedBuffer { size: usize, max: usize },
    #[error("stream ended mid-frame with {pending} buffered bytes")]
    TruncatedFrame { pending: usize },
    #[error("frame decoder already failed")]
    Poisoned,
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

/// Encode one message as a complete frame. Callers must hand the returned
/// buffer to a single `write_all` so frame boundaries stay atomic.
pub fn encode_frame(message: &Message, max_frame_bytes: usize) -> Result<Vec<u8>, FrameError> {
    let mut encoded =
        serde_json::to_vec(message).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    encoded.push(b'\n');
    Ok(encoded)
}

/// Incremental frame decoder. Feed it raw chunks in arrival order; it yields
/// every complete message and buffers the tail. The first error poisons the
/// decoder: the byte stream can no longer be trusted and must be abandoned.
pub struct FrameDecoder {
    max_frame_bytes: usize,
    pending: Vec<u8>,
    poisoned: bool,
}

impl FrameDecoder {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes,
            pending: Vec::new(),
            poisoned: false,
        }
    }

    pub fn has_partial(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Message>, FrameError> {
        if self.poisoned {
            return Err(FrameError::Poisoned);
        }
        self.pending.extend_from_slice(chunk);

        let mut messages = Vec::new();
        while let Some(newline_idx) = self.pending.iter().position(|byte| *byte == b'\n') {
            let mut frame = self.pending.drain(..=newline_idx).collect::<Vec<u8>>();
            frame.pop();
            if frame.ends_with(b"\r") {
                frame.pop();
            }
            if frame.is_empty() {
                continue;
            }
            if frame.len() > self.max_frame_bytes {
                self.poisoned = true;
                return Err(FrameError::OversizedFrame {
                    size: frame.len(),
                    max: self.max_frame_bytes,
                });
            }
            match serde_json::from_slice(&frame) {
                Ok(message) => messages.push(message),
                Err(err) => {
                    self.poisoned = true;
                    return Err(FrameError::Decode(err.to_string()));
                }
            }
        }

        if self.pending.len() > self.max_frame_bytes {
            self.poisoned = true;
            return Err(FrameError::OversizedBuffer {
                size: self.pending.len(),
                max: self.max_frame_bytes,
            });
        }

        Ok(messages)
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

#[derive(Debug, Error)]
pub enum ReadError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Pulls complete messages off an async byte stream through a
/// [`FrameDecoder`]. EOF with buffered partial bytes is a frame error, not a
/// clean close.
pub struct FrameReader<R> {
    io: R,
    decoder: FrameDecoder,
    queued: VecDeque<Message>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(io: R) -> Self {
        Self::with_max(io, DEFAULT_MAX_FRAME_BYTES)
    }

    pub fn with_max(io: R, max_frame_bytes: usize) -> Self {
        Self {
            io,
            decoder: FrameDecoder::new(max_frame_bytes),
            queued: VecDeque::new(),
        }
    }

    /// Next message, `Ok(None)` on clean EOF.
    pub async fn next(&mut self) -> Result<Option<Message>, ReadError> {
        loop {
            if let Some(message) = self.queued.pop_front() {
                return Ok(Some(message));
            }
            let mut chunk = [0u8; READ_CHUNK_BYTES];
            let n = self.io.read(&mut chunk).await?;
            if n == 0 {
                if self.decoder.has_partial() {
                    return Err(ReadError::Frame(FrameError::TruncatedFrame {
                        pending: self.decoder.pending.len(),
                    }));
                }
                return Ok(None);
            }
            self.queued.extend(self.decoder.push(&chunk[..n])?);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command_frame() -> Message {
        Message::Command(CommandRequest {
            correlation_id: Uuid::from_u128(7),
            command: CommandKey::Uptime,
            args: Vec::new(),
        })
    }

    #[test]
    fn frame_shape_is_tagged_with_payload() {
        let frame = encode_frame(&command_frame(), DEFAULT_MAX_FRAME_BYTES).expect("encode");
        assert_eq!(*frame.last().expect("terminator"), b'\n');
        let value: serde_json::Value =
            serde_json::from_slice(&frame[..frame.len() - 1]).expect("json");
        assert_eq!(value["type"], "command");
        assert_eq!(value["payload"]["command"], "uptime");
        assert_eq!(
            value["payload"]["correlation_id"],
            "00000000-0000-0000-0000-000000000007"
        );
    }

    #[test]
    fn decoder_resumes_across_arbitrary_chunk_boundaries() {
        let frame = encode_frame(&command_frame(), DEFAULT_MAX_FRAME_BYTES).expect("encode");
        for split in 1..frame.len() - 1 {
            let mut decoder = FrameDecoder::default();
            assert!(decoder.push(&frame[..split]).expect("first chunk").is_empty());
            assert!(decoder.has_partial());
            let messages = decoder.push(&frame[split..]).expect("second chunk");
            assert_eq!(messages, vec![command_frame()]);
        }
    }

    #[test]
    fn malformed_line_poisons_the_decoder() {
        let mut decoder = FrameDecoder::default();
        assert!(matches!(
            decoder.push(b"{\"type\":\"not-a-tag\"}\n"),
            Err(FrameError::Decode(_))
        ));
        // A poisoned decoder refuses further input, even valid frames.
        let frame = encode_frame(&command_frame(), DEFAULT_MAX_FRAME_BYTES).expect("encode");
        assert_eq!(decoder.push(&frame), Err(FrameError::Poisoned));
    }

    #[test]
    fn unterminated_input_past_the_limit_fails() {
        let mut decoder = FrameDecoder::new(64);
        assert!(matches!(
            decoder.push(&[b'x'; 65]),
            Err(FrameError::OversizedBuffer { size: 65, max: 64 })
        ));
    }

    #[test]
    fn oversized_payload_is_rejected_at_encode_time() {
        let message = Message::Result(CommandResult {
            correlation_id: Uuid::from_u128(1),
            exit_code: 0,
            output: "x".repeat(128),
        });
        assert!(matches!(
            encode_frame(&message, 64),
            Err(FrameError::OversizedFrame { .. })
        ));
    }

    #[test]
    fn metrics_report_tolerates_missing_net_section() {
        let raw = r#"{
            "type": "metric",
            "payload": {
                "agent_id": "pi-1",
                "collected_at": 1700000000,
                "report": {
                    "cpu_percent": 12.5,
                    "memory": {"total": 1024, "used": 512, "free": 512, "percent": 50.0,
                               "swap_total": 0, "swap_used": 0, "swap_free": 0, "swap_percent": 0.0},
                    "load_avg": {"one": 0.5, "five": 0.4, "fifteen": 0.3},
                    "disk": {"total": 2048, "used": 1024, "free": 1024, "percent": 50.0}
                }
            }
        }"#;
        let message: Message = serde_json::from_str(raw).expect("parse");
        match message {
            Message::Metric(update) => assert!(update.report.net.is_empty()),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn open_ended_metric_blobs_are_not_accepted() {
        let raw = r#"{
            "type": "metric",
            "payload": {
                "agent_id": "pi-1",
                "collected_at": 1700000000,
                "report": {"whatever": true}
            }
        }"#;
        assert!(serde_json::from_str::<Message>(raw).is_err());
    }
}
