//! SessionStore (§4.4): owns all live sessions — creation, lookup,
//! authentication, participant and signature bookkeeping, status
//! transitions, and periodic cleanup of expired sessions.
//!
//! The sessions map is protected by a read-mostly lock; each session
//! further carries its own mutex that serializes all writes to that
//! session (§5). Lookups take the outer lock briefly and clone a handle
//! (`Arc<Mutex<Session>>`) to the per-session lock, so two different
//! sessions never contend with each other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use crate::crypto;
use crate::error::ErrorKind;
use crate::session::model::*;

pub type SessionHandle = Arc<Mutex<Session>>;

pub struct CreateSessionConfig {
    pub threshold: u32,
    pub eligible_keys: Vec<String>,
    pub expected_participants: u32,
    pub auth_token: Option<String>,
    pub timeout: Duration,
    pub frozen_transaction: Option<FrozenTransaction>,
}

pub enum AuthOutcome {
    Success { participant_id: u64, is_reconnect: bool },
    Failure(ErrorKind),
}

pub enum SignatureOutcome {
    /// Accepted; `threshold_just_met` is true at most once per session —
    /// this is the exactly-once `threshold_met` transition signal.
    Accepted { threshold_just_met: bool },
    /// The identical `(public_key, signature_bytes)` pair was already
    /// accepted; idempotent no-op past the first acceptance.
    AlreadyAccepted,
    Rejected(ErrorKind),
}

pub enum InjectOutcome {
    Ok,
    AlreadyInjected,
}

/// Owns every live session. Construction takes a shared `TimerRegistry`
/// so the periodic cleanup sweep is itself a registered, cancellable timer
/// rather than a bare spawned loop (§4.7 applies uniformly).
pub struct SessionStore {
    sessions: RwLock<HashMap<String, SessionHandle>>,
}

impl SessionStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { sessions: RwLock::new(HashMap::new()) })
    }

    pub fn create_session(&self, config: CreateSessionConfig) -> SessionHandle {
        assert!(config.threshold >= 1, "threshold must be >= 1");
        assert!(config.threshold as usize <= config.eligible_keys.len(), "threshold must not exceed eligible_keys");
        assert!(config.expected_participants as usize <= config.eligible_keys.len(), "expected_participants must not exceed eligible_keys");

        let session_id = generate_session_id();
        let auth_token = config.auth_token.unwrap_or_else(generate_auth_token);
        let now = Instant::now();

        let session = Session::new(
            NewSessionConfig {
                session_id: session_id.clone(),
                auth_token,
                threshold: config.threshold,
                eligible_keys: config.eligible_keys,
                expected_participants: config.expected_participants,
                frozen_transaction: config.frozen_transaction,
                timeout: config.timeout,
            },
            now,
        );

        let handle = Arc::new(Mutex::new(session));
        self.sessions.write().expect("session map poisoned").insert(session_id, handle.clone());
        metrics::counter!("sessions_created_total").increment(1);
        handle
    }

    pub fn get_session(&self, session_id: &str) -> Option<SessionHandle> {
        self.sessions.read().expect("session map poisoned").get(session_id).cloned()
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.read().expect("session map poisoned").keys().cloned().collect()
    }

    /// Non-mutating peek at a session's current status, so callers can
    /// decide which guard applies (e.g. `already_injected` vs. validation)
    /// before committing to a mutation.
    pub fn session_status(&self, session_id: &str) -> Option<SessionStatus> {
        self.get_session(session_id).map(|handle| handle.lock().expect("session poisoned").status.clone())
    }

    /// Authenticate an incoming `AUTH` and, on success, register a fresh
    /// participant. Always-fresh participant ids on reconnect (open
    /// question in §9, resolved in DESIGN.md).
    pub fn authenticate(
        &self,
        session_id: &str,
        auth_token: &str,
        label: Option<String>,
        public_key: Option<String>,
    ) -> AuthOutcome {
        metrics::counter!("auth_attempts_total").increment(1);

        let Some(handle) = self.get_session(session_id) else {
            metrics::counter!("auth_failures_total").increment(1);
            return AuthOutcome::Failure(ErrorKind::Authentication);
        };
        let mut session = handle.lock().expect("session poisoned");

        if session.is_terminal() {
            metrics::counter!("auth_failures_total").increment(1);
            return AuthOutcome::Failure(ErrorKind::Authentication);
        }
        if session.auth_token != auth_token {
            metrics::counter!("auth_failures_total").increment(1);
            return AuthOutcome::Failure(ErrorKind::Authentication);
        }
        if let Some(ref pk) = public_key {
            if !session.is_eligible(pk) {
                metrics::counter!("auth_failures_total").increment(1);
                return AuthOutcome::Failure(ErrorKind::Validation);
            }
        }

        let participant_id = generate_participant_id();
        session.participants.insert(
            participant_id,
            Participant { participant_id, label, public_key, status: ParticipantStatus::Connected },
        );
        session.stats.participants_connected += 1;

        AuthOutcome::Success { participant_id, is_reconnect: false }
    }

    pub fn set_participant_ready(&self, session_id: &str, participant_id: u64, public_key: String) -> Result<bool, ErrorKind> {
        let Some(handle) = self.get_session(session_id) else { return Err(ErrorKind::Validation) };
        let mut session = handle.lock().expect("session poisoned");

        if !session.is_eligible(&public_key) {
            return Err(ErrorKind::IneligibleSigner);
        }
        let Some(participant) = session.participants.get_mut(&participant_id) else {
            return Err(ErrorKind::Validation);
        };
        participant.public_key = Some(public_key);
        participant.status = ParticipantStatus::Ready;
        session.stats.participants_ready += 1;

        Ok(session.all_ready())
    }

    pub fn update_participant_status(&self, session_id: &str, participant_id: u64, status: ParticipantStatus) {
        if let Some(handle) = self.get_session(session_id) {
            let mut session = handle.lock().expect("session poisoned");
            if let Some(participant) = session.participants.get_mut(&participant_id) {
                participant.status = status;
            }
        }
    }

    /// A missed heartbeat marks the participant disconnected without
    /// removing it (§5 — the session is preserved; reconnect is permitted).
    ///
    /// Only decrements `participants_ready` if the participant had actually
    /// reached `Ready`/`Reviewing`/`Signed` — one disconnecting while still
    /// `Connected` never contributed to that counter, so unconditionally
    /// decrementing would corrupt it downward.
    pub fn mark_disconnected(&self, session_id: &str, participant_id: u64) {
        let Some(handle) = self.get_session(session_id) else { return };
        let mut session = handle.lock().expect("session poisoned");
        let Some(participant) = session.participants.get_mut(&participant_id) else { return };

        let was_ready = matches!(participant.status, ParticipantStatus::Ready | ParticipantStatus::Reviewing | ParticipantStatus::Signed);
        participant.status = ParticipantStatus::Disconnected;
        if was_ready {
            session.stats.participants_ready = session.stats.participants_ready.saturating_sub(1);
        }
    }

    pub fn remove_participant(&self, session_id: &str, participant_id: u64) {
        if let Some(handle) = self.get_session(session_id) {
            let mut session = handle.lock().expect("session poisoned");
            session.participants.remove(&participant_id);
        }
    }

    /// Inject the frozen transaction exactly once per session (§4.4, §4.5).
    pub fn inject_transaction(&self, session_id: &str, bytes: Vec<u8>, summary: String, metadata: Option<serde_json::Value>, contract_abi: Option<serde_json::Value>) -> Result<InjectOutcome, ErrorKind> {
        let Some(handle) = self.get_session(session_id) else { return Err(ErrorKind::Validation) };
        let mut session = handle.lock().expect("session poisoned");

        if session.status != SessionStatus::Waiting {
            return Ok(InjectOutcome::AlreadyInjected);
        }

        let now = Instant::now();
        session.frozen_transaction = Some(FrozenTransaction { bytes, summary, metadata, contract_abi, injected_at: now });
        session.execution_deadline = Some(execution_deadline_from(now));
        session.status = SessionStatus::TransactionReceived;

        Ok(InjectOutcome::Ok)
    }

    /// Accept or reject a signature submission, applying the exactly-once
    /// threshold-met transition via a single critical section guarded by
    /// the session's own mutex — that lock *is* the atomic compare-and-set
    /// the spec calls for: two concurrent submissions serialize here, so
    /// only the one that observes `count == threshold` first flips status.
    ///
    /// Records `signatures_accepted_total`/`signatures_rejected_total`; an
    /// idempotent resubmission (`AlreadyAccepted`) is neither, since it
    /// changes no state.
    pub fn add_signature(&self, session_id: &str, participant_id: u64, public_key: &str, signature: Vec<u8>) -> SignatureOutcome {
        let outcome = self.add_signature_locked(session_id, participant_id, public_key, signature);
        match outcome {
            SignatureOutcome::Accepted { .. } => metrics::counter!("signatures_accepted_total").increment(1),
            SignatureOutcome::Rejected(_) => metrics::counter!("signatures_rejected_total").increment(1),
            SignatureOutcome::AlreadyAccepted => {}
        }
        outcome
    }

    fn add_signature_locked(&self, session_id: &str, participant_id: u64, public_key: &str, signature: Vec<u8>) -> SignatureOutcome {
        let Some(handle) = self.get_session(session_id) else { return SignatureOutcome::Rejected(ErrorKind::Validation) };
        let mut session = handle.lock().expect("session poisoned");

        if !matches!(session.status, SessionStatus::TransactionReceived | SessionStatus::Signing) {
            return SignatureOutcome::Rejected(ErrorKind::NotReady);
        }
        if !session.is_eligible(public_key) {
            session.stats.signatures_rejected += 1;
            return SignatureOutcome::Rejected(ErrorKind::IneligibleSigner);
        }

        let Some(tx) = session.frozen_transaction.clone() else {
            return SignatureOutcome::Rejected(ErrorKind::NotReady);
        };

        if let Some(existing) = session.signatures.get(public_key) {
            if existing.signature_bytes == signature {
                return SignatureOutcome::AlreadyAccepted;
            }
            session.stats.signatures_rejected += 1;
            return SignatureOutcome::Rejected(ErrorKind::DuplicateSigner);
        }

        if crypto::verify(public_key, &tx.bytes, &signature).is_err() {
            session.stats.signatures_rejected += 1;
            return SignatureOutcome::Rejected(ErrorKind::InvalidSignature);
        }

        session.signatures.insert(
            public_key.to_string(),
            CollectedSignature { signature_bytes: signature, participant_id, submitted_at: Instant::now() },
        );
        session.stats.signatures_accepted += 1;
        if let Some(p) = session.participants.get_mut(&participant_id) {
            p.status = ParticipantStatus::Signed;
        }

        if session.status == SessionStatus::TransactionReceived {
            session.status = SessionStatus::Signing;
        }

        let threshold_just_met = session.status == SessionStatus::Signing
            && session.unique_valid_signature_count() >= session.threshold;

        if threshold_just_met {
            session.status = SessionStatus::ThresholdMet;
        }

        SignatureOutcome::Accepted { threshold_just_met }
    }

    pub fn update_status(&self, session_id: &str, new_status: SessionStatus, reason: Option<String>) {
        if let Some(handle) = self.get_session(session_id) {
            let completed = new_status == SessionStatus::Completed;
            let mut session = handle.lock().expect("session poisoned");
            session.status = new_status;
            if reason.is_some() {
                session.last_terminal_reason = reason;
            }
            if completed {
                metrics::counter!("sessions_completed_total").increment(1);
            }
        }
    }

    pub fn delete_session(&self, session_id: &str) {
        self.sessions.write().expect("session map poisoned").remove(session_id);
    }

    /// Scan for sessions past `expires_at` that are not in a state the
    /// spec exempts from reaping, transition them to `expired`, and return
    /// their ids so the caller can broadcast `SESSION_EXPIRED` and cancel
    /// their timers before `delete_session`.
    pub fn sweep_expired(&self) -> Vec<String> {
        let now = Instant::now();
        let ids = self.session_ids();
        let mut expired = Vec::new();
        for id in ids {
            if let Some(handle) = self.get_session(&id) {
                let mut session = handle.lock().expect("session poisoned");
                let exempt = matches!(session.status, SessionStatus::Completed | SessionStatus::Executing);
                if !exempt && now >= session.expires_at {
                    session.status = SessionStatus::Expired;
                    session.last_terminal_reason = Some("expired".to_string());
                    expired.push(id);
                }
            }
        }
        if !expired.is_empty() {
            metrics::counter!("sessions_expired_total").increment(expired.len() as u64);
        }
        expired
    }

    /// Scan for sessions whose execution deadline has passed without
    /// completing (§5's 120s-minus-10s window). Returns ids transitioned
    /// to `failed { transaction_window_exceeded }`.
    pub fn sweep_execution_deadlines(&self) -> Vec<String> {
        let now = Instant::now();
        let ids = self.session_ids();
        let mut failed = Vec::new();
        for id in ids {
            if let Some(handle) = self.get_session(&id) {
                let mut session = handle.lock().expect("session poisoned");
                if session.is_terminal() {
                    continue;
                }
                if let Some(deadline) = session.execution_deadline {
                    if now >= deadline {
                        session.status = SessionStatus::Failed;
                        session.last_terminal_reason = Some(ErrorKind::TransactionWindowExceeded.as_str().to_string());
                        failed.push(id);
                    }
                }
            }
        }
        failed
    }

    pub fn len(&self) -> usize {
        self.sessions.read().expect("session map poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
