//! Envelope types for the agent/controller channel.
//!
//! Every frame on the connection carries one JSON object tagged by its `type`
//! field. Inbound frames are validated against the shape of their kind at
//! decode time; a frame that names a known kind but carries the wrong fields is
//! rejected as a whole rather than partially applied.

use crate::host::{Metrics, SystemInfo};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Every `type` tag the protocol knows about, in both directions.
pub const KINDS: [&str; 14] = [
    "handshake",
    "handshake_ack",
    "heartbeat_ping",
    "heartbeat_pong",
    "exec",
    "exec_result",
    "pty_start",
    "pty_started",
    "pty_input",
    "pty_output",
    "pty_resize",
    "pty_end",
    "pty_ended",
    "error",
];

/// Features the agent announces at handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    /// One-shot command execution.
    Shell,
    /// Interactive terminal proxying.
    Pty,
    /// Host metrics in heartbeats.
    Metrics,
}

impl Capability {
    /// The full set this agent supports.
    pub const ALL: [Self; 3] = [Self::Shell, Self::Pty, Self::Metrics];
}

/// Why a terminal session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// The shell exited on its own.
    Exited,
    /// The controller asked for the session to end.
    Terminated,
}

/// Machine-readable error codes carried by `error` envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Terminal allocation or shell spawn failed.
    PtyStartFailed,
    /// Any code this agent does not recognise.
    #[serde(other)]
    Unknown,
}

/// Payload of an `error` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
}

/// One message on the connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    /// First frame sent by the agent on every connection.
    Handshake {
        agent_id: String,
        token: String,
        version: String,
        name: String,
        system: SystemInfo,
        capabilities: Vec<Capability>,
        tags: Vec<String>,
    },

    /// Controller's answer to `handshake`. A missing `success` means rejected.
    HandshakeAck {
        #[serde(default)]
        success: bool,
        /// Identity assigned by the controller.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        server_time: Option<String>,
        /// Heartbeat period the controller would like, in seconds.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        heartbeat_interval: Option<u64>,
    },

    /// Liveness probe from the controller.
    HeartbeatPing {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<String>,
    },

    /// Periodic liveness report from the agent.
    HeartbeatPong {
        /// RFC 3339 timestamp.
        timestamp: String,
        metrics: Metrics,
    },

    /// Run a command through the platform shell.
    Exec {
        request_id: String,
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_seconds: Option<f64>,
    },

    /// Outcome of an `exec`.
    ExecResult {
        request_id: String,
        success: bool,
        exit_code: i32,
        stdout: String,
        stderr: String,
        duration_ms: u64,
        truncated: bool,
    },

    /// Open an interactive terminal session.
    PtyStart {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        shell: Option<String>,
        /// Zero, negative or out-of-range sizes decode as absent.
        #[serde(
            default,
            skip_serializing_if = "Option::is_none",
            deserialize_with = "dimension::deserialize"
        )]
        cols: Option<u16>,
        #[serde(
            default,
            skip_serializing_if = "Option::is_none",
            deserialize_with = "dimension::deserialize"
        )]
        rows: Option<u16>,
    },

    /// A terminal session is running.
    PtyStarted {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        session_id: String,
        success: bool,
        pid: u32,
    },

    /// Keystrokes for a session (base64 encoded in JSON).
    PtyInput {
        session_id: String,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },

    /// Terminal output from a session (base64 encoded in JSON).
    PtyOutput {
        session_id: String,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },

    /// New terminal dimensions for a session.
    PtyResize { session_id: String, cols: u16, rows: u16 },

    /// Ask for a session to be terminated.
    PtyEnd { session_id: String },

    /// A session is gone.
    PtyEnded {
        session_id: String,
        exit_code: i32,
        reason: EndReason,
    },

    /// A request failed in a way that has no dedicated result envelope.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        error: ErrorBody,
    },
}

impl Envelope {
    /// Create an `error` envelope.
    pub fn error(
        code: ErrorCode,
        message: impl Into<String>,
        request_id: Option<String>,
        session_id: Option<String>,
    ) -> Self {
        Self::Error {
            request_id,
            session_id,
            error: ErrorBody {
                code,
                message: message.into(),
            },
        }
    }

    /// The wire tag of this envelope.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Handshake { .. } => "handshake",
            Self::HandshakeAck { .. } => "handshake_ack",
            Self::HeartbeatPing { .. } => "heartbeat_ping",
            Self::HeartbeatPong { .. } => "heartbeat_pong",
            Self::Exec { .. } => "exec",
            Self::ExecResult { .. } => "exec_result",
            Self::PtyStart { .. } => "pty_start",
            Self::PtyStarted { .. } => "pty_started",
            Self::PtyInput { .. } => "pty_input",
            Self::PtyOutput { .. } => "pty_output",
            Self::PtyResize { .. } => "pty_resize",
            Self::PtyEnd { .. } => "pty_end",
            Self::PtyEnded { .. } => "pty_ended",
            Self::Error { .. } => "error",
        }
    }

    /// Serialize to the JSON text sent in one frame.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Reasons an inbound frame could not be turned into an [`Envelope`].
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame is not valid JSON: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("frame is not a JSON object")]
    NotObject,

    #[error("frame has no string `type` field")]
    MissingKind,

    #[error("unknown envelope kind: {0}")]
    UnknownKind(String),

    #[error("invalid {kind} envelope: {source}")]
    Invalid {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

impl DecodeError {
    /// Whether the frame is so broken that the stream itself can no longer be
    /// trusted. Everything else is a single bad message that gets dropped.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Malformed(_) | Self::NotObject)
    }
}

/// Decode one frame of JSON text.
pub fn decode(text: &str) -> Result<Envelope, DecodeError> {
    decode_bytes(text.as_bytes())
}

/// Decode one frame of JSON carried as raw bytes.
pub fn decode_bytes(bytes: &[u8]) -> Result<Envelope, DecodeError> {
    let value: Value = serde_json::from_slice(bytes).map_err(DecodeError::Malformed)?;
    if !value.is_object() {
        return Err(DecodeError::NotObject);
    }

    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(DecodeError::MissingKind)?
        .to_owned();
    if !KINDS.contains(&kind.as_str()) {
        return Err(DecodeError::UnknownKind(kind));
    }

    serde_json::from_value(value).map_err(|source| DecodeError::Invalid { kind, source })
}

/// Lenient terminal dimension: any JSON number, kept only if it is a positive
/// `u16`.
mod dimension {
    use serde::{Deserialize, Deserializer};

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<u16>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Option::<f64>::deserialize(deserializer)?;
        Ok(value
            .filter(|v| *v >= 1.0 && *v <= f64::from(u16::MAX))
            .map(|v| v as u16))
    }
}

/// Module for base64 encoding/decoding of byte vectors in serde.
mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        STANDARD.encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_exec_with_and_without_timeout() {
        let env = decode(r#"{"type":"exec","request_id":"r1","command":"ls","timeout_seconds":5}"#)
            .unwrap();
        assert_eq!(
            env,
            Envelope::Exec {
                request_id: "r1".into(),
                command: "ls".into(),
                timeout_seconds: Some(5.0),
            }
        );

        let env = decode(r#"{"type":"exec","request_id":"r2","command":"ls"}"#).unwrap();
        assert!(matches!(env, Envelope::Exec { timeout_seconds: None, .. }));
    }

    #[test]
    fn test_decode_pty_input_base64() {
        // "ls\n"
        let env = decode(r#"{"type":"pty_input","session_id":"s1","data":"bHMK"}"#).unwrap();
        match env {
            Envelope::PtyInput { session_id, data } => {
                assert_eq!(session_id, "s1");
                assert_eq!(data, b"ls\n");
            }
            other => panic!("expected PtyInput, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_pty_start_optional_fields() {
        let env = decode(r#"{"type":"pty_start","session_id":"s1","request_id":"r1"}"#).unwrap();
        assert_eq!(
            env,
            Envelope::PtyStart {
                session_id: "s1".into(),
                request_id: Some("r1".into()),
                shell: None,
                cols: None,
                rows: None,
            }
        );
    }

    #[test]
    fn test_decode_pty_start_drops_unusable_dimensions() {
        let env = decode(r#"{"type":"pty_start","session_id":"s","request_id":"r","cols":-1,"rows":24}"#)
            .unwrap();
        assert!(matches!(
            env,
            Envelope::PtyStart {
                cols: None,
                rows: Some(24),
                ..
            }
        ));

        let env = decode(r#"{"type":"pty_start","session_id":"s","cols":0,"rows":70000}"#).unwrap();
        assert!(matches!(
            env,
            Envelope::PtyStart {
                cols: None,
                rows: None,
                ..
            }
        ));

        let env = decode(r#"{"type":"pty_start","session_id":"s","cols":132.0,"rows":null}"#).unwrap();
        assert!(matches!(
            env,
            Envelope::PtyStart {
                cols: Some(132),
                rows: None,
                ..
            }
        ));
    }

    #[test]
    fn test_handshake_ack_without_success_is_rejection() {
        let env = decode(r#"{"type":"handshake_ack"}"#).unwrap();
        assert!(matches!(env, Envelope::HandshakeAck { success: false, .. }));

        let env = decode(
            r#"{"type":"handshake_ack","success":true,"agent_id":"sat-1","heartbeat_interval":15}"#,
        )
        .unwrap();
        match env {
            Envelope::HandshakeAck {
                success,
                agent_id,
                heartbeat_interval,
                ..
            } => {
                assert!(success);
                assert_eq!(agent_id.as_deref(), Some("sat-1"));
                assert_eq!(heartbeat_interval, Some(15));
            }
            other => panic!("expected HandshakeAck, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_errors_classified() {
        let err = decode("not json").unwrap_err();
        assert!(err.is_fatal());

        let err = decode("[1, 2]").unwrap_err();
        assert!(matches!(err, DecodeError::NotObject));
        assert!(err.is_fatal());

        let err = decode(r#"{"type":"reboot_now"}"#).unwrap_err();
        assert!(matches!(err, DecodeError::UnknownKind(ref k) if k == "reboot_now"));
        assert!(!err.is_fatal());

        let err = decode(r#"{"session_id":"s1"}"#).unwrap_err();
        assert!(matches!(err, DecodeError::MissingKind));
        assert!(!err.is_fatal());

        // Known kind, wrong shape.
        let err = decode(r#"{"type":"pty_resize","session_id":"s1","cols":"wide"}"#).unwrap_err();
        assert!(matches!(err, DecodeError::Invalid { ref kind, .. } if kind == "pty_resize"));
        assert!(!err.is_fatal());

        // Bad base64 is a shape error too.
        let err = decode(r#"{"type":"pty_input","session_id":"s1","data":"!!!"}"#).unwrap_err();
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_exec_result_wire_shape() {
        let env = Envelope::ExecResult {
            request_id: "r1".into(),
            success: false,
            exit_code: -1,
            stdout: String::new(),
            stderr: "boom".into(),
            duration_ms: 1200,
            truncated: false,
        };
        let value: Value = serde_json::from_str(&env.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "exec_result",
                "request_id": "r1",
                "success": false,
                "exit_code": -1,
                "stdout": "",
                "stderr": "boom",
                "duration_ms": 1200,
                "truncated": false,
            })
        );
    }

    #[test]
    fn test_error_envelope_wire_shape() {
        let env = Envelope::error(
            ErrorCode::PtyStartFailed,
            "no such file",
            Some("r9".into()),
            Some("s9".into()),
        );
        let value: Value = serde_json::from_str(&env.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["request_id"], "r9");
        assert_eq!(value["session_id"], "s9");
        assert_eq!(value["error"]["code"], "PTY_START_FAILED");
        assert_eq!(value["error"]["message"], "no such file");
    }

    #[test]
    fn test_pty_output_is_base64_on_the_wire() {
        let env = Envelope::PtyOutput {
            session_id: "s1".into(),
            data: vec![0x1b, 0x5b, 0x41],
        };
        let json = env.encode().unwrap();
        assert!(json.contains("G1tB")); // base64 of [0x1b, 0x5b, 0x41]
        assert_eq!(env.kind(), "pty_output");
    }

    #[test]
    fn test_pty_ended_reason_tags() {
        let env = Envelope::PtyEnded {
            session_id: "s1".into(),
            exit_code: 0,
            reason: EndReason::Terminated,
        };
        let value: Value = serde_json::from_str(&env.encode().unwrap()).unwrap();
        assert_eq!(value["reason"], "terminated");
    }

    #[test]
    fn test_every_kind_is_listed() {
        let samples = [
            Envelope::HeartbeatPing { timestamp: None },
            Envelope::PtyEnd {
                session_id: "s".into(),
            },
            Envelope::PtyResize {
                session_id: "s".into(),
                cols: 1,
                rows: 1,
            },
        ];
        for env in samples {
            assert!(KINDS.contains(&env.kind()));
        }
    }
}
