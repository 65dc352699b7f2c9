//! Protocol (§4.1): message schema, validation, and encoding/decoding.
//!
//! Frames are length-delimited UTF-8 JSON objects with two required
//! fields, `type` and `payload`. Decoding is two-stage: first into a raw
//! [`Envelope`] (so an unknown `type` can be rejected with `ERROR` without
//! failing to parse the rest of the frame), then the `payload` is decoded
//! into a typed [`ClientMessage`] variant.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorKind;

/// Hard size cap on a single frame (§4.1). Anything larger is dropped and
/// the connection closed by the `ConnectionServer`.
pub const MAX_FRAME_BYTES: usize = 5 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Coordinator,
    Participant,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

/// A fully parsed inbound message, ready for `SessionManager` dispatch.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    Auth {
        session_id: String,
        auth_token: String,
        role: Role,
        label: Option<String>,
        public_key: Option<String>,
    },
    ParticipantReady {
        public_key: String,
    },
    SignatureSubmit {
        public_key: String,
        signature_base64: String,
    },
    TransactionRejected {
        reason: Option<String>,
    },
    /// Coordinator-only: freeze the transaction bytes into the session.
    /// Rejected by the manager if the sender authenticated as a
    /// participant rather than a coordinator.
    InjectTransaction {
        transaction_base64: String,
        tx_summary: String,
        metadata: Option<Value>,
        contract_abi: Option<Value>,
    },
    Ping,
    Pong,
}

/// Result of decoding one inbound frame.
pub enum DecodeOutcome {
    Message(ClientMessage),
    /// Well-formed JSON object with a recognized shape problem: reject with
    /// `ERROR`, keep the connection open.
    Reject(String),
    /// `type` was not one of the known variants.
    UnknownType(String),
}

/// Decode one inbound text frame. Callers must have already rejected frames
/// over [`MAX_FRAME_BYTES`] (by byte length, before even attempting UTF-8/
/// JSON decode) and empty frames.
pub fn decode_client_message(raw: &str) -> DecodeOutcome {
    if raw.is_empty() {
        return DecodeOutcome::Reject("empty frame".into());
    }

    let envelope: Envelope = match serde_json::from_str(raw) {
        Ok(e) => e,
        Err(_) => return DecodeOutcome::Reject("frame is not a well-formed JSON object with a `type` field".into()),
    };

    if !envelope.payload.is_object() && !envelope.payload.is_null() {
        return DecodeOutcome::Reject("`payload` must be an object".into());
    }

    let payload = envelope.payload;

    match envelope.kind.as_str() {
        "AUTH" => decode_auth(payload),
        "PARTICIPANT_READY" => decode_participant_ready(payload),
        "SIGNATURE_SUBMIT" => decode_signature_submit(payload),
        "TRANSACTION_REJECTED" => DecodeOutcome::Message(ClientMessage::TransactionRejected {
            reason: payload.get("reason").and_then(|v| v.as_str()).map(str::to_string),
        }),
        "INJECT_TRANSACTION" => decode_inject_transaction(payload),
        "PING" => DecodeOutcome::Message(ClientMessage::Ping),
        "PONG" => DecodeOutcome::Message(ClientMessage::Pong),
        other => DecodeOutcome::UnknownType(other.to_string()),
    }
}

fn field_str(payload: &Value, name: &str) -> Option<String> {
    payload.get(name).and_then(|v| v.as_str()).map(str::to_string)
}

fn decode_auth(payload: Value) -> DecodeOutcome {
    let (Some(session_id), Some(auth_token)) = (field_str(&payload, "session_id"), field_str(&payload, "auth_token")) else {
        return DecodeOutcome::Reject("AUTH requires `session_id` and `auth_token`".into());
    };
    let role = match payload.get("role").and_then(|v| v.as_str()) {
        Some("coordinator") => Role::Coordinator,
        Some("participant") | None => Role::Participant,
        Some(other) => return DecodeOutcome::Reject(format!("unknown role `{other}`")),
    };
    DecodeOutcome::Message(ClientMessage::Auth {
        session_id,
        auth_token,
        role,
        label: field_str(&payload, "label"),
        public_key: field_str(&payload, "public_key"),
    })
}

fn decode_participant_ready(payload: Value) -> DecodeOutcome {
    match field_str(&payload, "public_key") {
        Some(public_key) => DecodeOutcome::Message(ClientMessage::ParticipantReady { public_key }),
        None => DecodeOutcome::Reject("PARTICIPANT_READY requires `public_key`".into()),
    }
}

fn decode_signature_submit(payload: Value) -> DecodeOutcome {
    let (Some(public_key), Some(signature_base64)) = (field_str(&payload, "public_key"), field_str(&payload, "signature")) else {
        return DecodeOutcome::Reject("SIGNATURE_SUBMIT requires `public_key` and `signature`".into());
    };
    DecodeOutcome::Message(ClientMessage::SignatureSubmit { public_key, signature_base64 })
}

fn decode_inject_transaction(payload: Value) -> DecodeOutcome {
    let (Some(transaction_base64), Some(tx_summary)) = (field_str(&payload, "transaction_base64"), field_str(&payload, "tx_summary")) else {
        return DecodeOutcome::Reject("INJECT_TRANSACTION requires `transaction_base64` and `tx_summary`".into());
    };
    DecodeOutcome::Message(ClientMessage::InjectTransaction {
        transaction_base64,
        tx_summary,
        metadata: payload.get("metadata").cloned(),
        contract_abi: payload.get("contract_abi").cloned(),
    })
}

/// Outbound server-pushed or response frames (§4.1).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload")]
pub enum ServerMessage {
    #[serde(rename = "AUTH_SUCCESS")]
    AuthSuccess { participant_id: String, session_info: SessionInfo },
    #[serde(rename = "AUTH_FAILED")]
    AuthFailed { reason: String },
    #[serde(rename = "PARTICIPANT_READY")]
    ParticipantReady { participant_id: String, all_ready: bool },
    #[serde(rename = "PARTICIPANT_CONNECTED")]
    ParticipantConnected { participant_id: String },
    #[serde(rename = "PARTICIPANT_DISCONNECTED")]
    ParticipantDisconnected { participant_id: String },
    #[serde(rename = "SIGNATURE_ACCEPTED")]
    SignatureAccepted { public_key: String },
    #[serde(rename = "SIGNATURE_REJECTED")]
    SignatureRejected { reason: String },
    #[serde(rename = "THRESHOLD_MET")]
    ThresholdMet { threshold: u32 },
    #[serde(rename = "TRANSACTION_RECEIVED")]
    TransactionReceived {
        frozen_transaction_base64: String,
        tx_summary: String,
        metadata: Option<Value>,
        contract_abi: Option<Value>,
    },
    #[serde(rename = "TRANSACTION_EXECUTED")]
    TransactionExecuted { transaction_id: String, status: String },
    #[serde(rename = "SESSION_EXPIRED")]
    SessionExpired { reason: String },
    #[serde(rename = "ERROR")]
    Error { message: String, code: Option<String> },
    #[serde(rename = "PING")]
    Ping,
    #[serde(rename = "PONG")]
    Pong,
}

impl ServerMessage {
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        ServerMessage::Error { message: message.into(), code: Some(kind.as_str().to_string()) }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("ServerMessage always serializes")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub threshold: u32,
    pub eligible_key_count: usize,
    pub expected_participants: u32,
    pub status: String,
}

/// The `hmsc:` share string (§6): a base64 blob decoding to
/// `{"s": server_url, "i": session_id, "p": auth_token}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareString {
    #[serde(rename = "s")]
    pub server_url: String,
    #[serde(rename = "i")]
    pub session_id: String,
    #[serde(rename = "p")]
    pub auth_token: String,
}

impl ShareString {
    pub const PREFIX: &'static str = "hmsc:";

    pub fn encode(&self) -> String {
        let json = serde_json::to_vec(self).expect("ShareString always serializes");
        format!("{}{}", Self::PREFIX, BASE64.encode(json))
    }

    pub fn parse(input: &str) -> Result<Self, String> {
        let body = input.strip_prefix(Self::PREFIX).ok_or_else(|| "missing hmsc: prefix".to_string())?;
        let bytes = BASE64.decode(body).map_err(|e| format!("invalid base64: {e}"))?;
        serde_json::from_slice(&bytes).map_err(|e| format!("invalid share payload: {e}"))
    }
}
