//! Data model for sessions, participants, and signatures (§3).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::Serialize;

/// One instance of the signing protocol, addressed by `session_id`.
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub auth_token: String,
    pub threshold: u32,
    pub eligible_keys: Vec<String>,
    pub expected_participants: u32,
    pub frozen_transaction: Option<FrozenTransaction>,
    pub participants: HashMap<u64, Participant>,
    pub signatures: HashMap<String, CollectedSignature>,
    pub status: SessionStatus,
    pub created_at: Instant,
    pub expires_at: Instant,
    /// Execution deadline: `injected_at + 120s - 10s` safety margin (§5).
    /// `None` until a transaction is injected.
    pub execution_deadline: Option<Instant>,
    pub last_terminal_reason: Option<String>,
    pub stats: SessionStats,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionStats {
    pub participants_connected: u32,
    pub participants_ready: u32,
    pub signatures_accepted: u32,
    pub signatures_rejected: u32,
}

impl Session {
    pub fn new(config: NewSessionConfig, now: Instant) -> Self {
        let status = if config.frozen_transaction.is_some() {
            SessionStatus::TransactionReceived
        } else {
            SessionStatus::Waiting
        };
        let execution_deadline = config.frozen_transaction.is_some().then(|| execution_deadline_from(now));
        Session {
            session_id: config.session_id,
            auth_token: config.auth_token,
            threshold: config.threshold,
            eligible_keys: config.eligible_keys,
            expected_participants: config.expected_participants,
            frozen_transaction: config.frozen_transaction,
            participants: HashMap::new(),
            signatures: HashMap::new(),
            status,
            created_at: now,
            expires_at: now + config.timeout,
            execution_deadline,
            last_terminal_reason: None,
            stats: SessionStats::default(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Expired)
    }

    pub fn is_eligible(&self, public_key: &str) -> bool {
        self.eligible_keys.iter().any(|k| k == public_key)
    }

    pub fn all_ready(&self) -> bool {
        let ready = self.participants.values().filter(|p| matches!(p.status, ParticipantStatus::Ready | ParticipantStatus::Reviewing | ParticipantStatus::Signed)).count();
        ready as u32 >= self.expected_participants
    }

    pub fn unique_valid_signature_count(&self) -> u32 {
        self.signatures.len() as u32
    }
}

/// Execution deadline: the ledger's 120s validity window minus a 10s
/// safety margin (§5).
pub fn execution_deadline_from(injected_at: Instant) -> Instant {
    injected_at + Duration::from_secs(120) - Duration::from_secs(10)
}

pub struct NewSessionConfig {
    pub session_id: String,
    pub auth_token: String,
    pub threshold: u32,
    pub eligible_keys: Vec<String>,
    pub expected_participants: u32,
    pub frozen_transaction: Option<FrozenTransaction>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct FrozenTransaction {
    pub bytes: Vec<u8>,
    pub summary: String,
    pub metadata: Option<serde_json::Value>,
    pub contract_abi: Option<serde_json::Value>,
    pub injected_at: Instant,
}

impl FrozenTransaction {
    pub fn digest_hex(&self) -> String {
        crate::crypto::digest_hex(&self.bytes)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Waiting,
    TransactionReceived,
    Signing,
    ThresholdMet,
    Executing,
    Completed,
    Failed,
    Expired,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Waiting => "waiting",
            SessionStatus::TransactionReceived => "transaction_received",
            SessionStatus::Signing => "signing",
            SessionStatus::ThresholdMet => "threshold_met",
            SessionStatus::Executing => "executing",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Expired => "expired",
        }
    }
}

/// A remote endpoint authenticated into a session.
#[derive(Debug, Clone)]
pub struct Participant {
    pub participant_id: u64,
    pub label: Option<String>,
    pub public_key: Option<String>,
    pub status: ParticipantStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantStatus {
    Connected,
    Ready,
    Reviewing,
    Signed,
    Rejected,
    Disconnected,
}

#[derive(Debug, Clone)]
pub struct CollectedSignature {
    pub signature_bytes: Vec<u8>,
    pub participant_id: u64,
    pub submitted_at: Instant,
}

/// Generate a random 128-bit session id, hex-encoded.
pub fn generate_session_id() -> String {
    let mut bytes = [0u8; 16];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut bytes);
    hex::encode(bytes)
}

/// Generate a random 64-bit participant id, unique within its session by
/// construction (birthday-bound collision probability is negligible for
/// any single session's lifetime).
pub fn generate_participant_id() -> u64 {
    rand::RngCore::next_u64(&mut rand::thread_rng())
}

/// Generate a random auth token when the operator does not supply one.
pub fn generate_auth_token() -> String {
    let mut bytes = [0u8; 24];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut bytes);
    hex::encode(bytes)
}
