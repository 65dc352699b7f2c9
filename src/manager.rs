//! SessionManager (§4.5): thin orchestration layer over `SessionStore`.
//!
//! For each inbound protocol event it resolves the session, applies the
//! store mutation, and publishes a small set of typed `ManagerEvent`s that
//! the `ConnectionServer` translates into actual frame delivery — the
//! Rust-native form of the "callback-style event hooks" pattern called out
//! in §9 design notes.

use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use tokio::sync::mpsc;

use crate::error::ErrorKind;
use crate::ledger::{ExecutionError, LedgerClient};
use crate::protocol::{Role, ServerMessage, SessionInfo};
use crate::session::{AuthOutcome, InjectOutcome, ParticipantStatus, SessionStatus, SessionStore, SignatureOutcome};
use crate::timer::TimerRegistry;

/// Event published by the manager for the `ConnectionServer` to turn into
/// actual frame delivery. The manager never touches a socket directly.
#[derive(Debug, Clone)]
pub enum ManagerEvent {
    Unicast { session_id: String, participant_id: u64, message: ServerMessage },
    Broadcast { session_id: String, message: ServerMessage },
    CloseConnection { session_id: String, participant_id: u64 },
}

pub struct SessionManager {
    store: Arc<SessionStore>,
    timers: Arc<TimerRegistry>,
    ledger: Arc<dyn LedgerClient>,
    events_tx: mpsc::UnboundedSender<ManagerEvent>,
}

impl SessionManager {
    pub fn new(store: Arc<SessionStore>, timers: Arc<TimerRegistry>, ledger: Arc<dyn LedgerClient>) -> (Arc<Self>, mpsc::UnboundedReceiver<ManagerEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (Arc::new(Self { store, timers, ledger, events_tx }), events_rx)
    }

    fn emit(&self, event: ManagerEvent) {
        let _ = self.events_tx.send(event);
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn timers(&self) -> &Arc<TimerRegistry> {
        &self.timers
    }

    /// Broadcast `SESSION_EXPIRED` and tear down every non-terminal session,
    /// used on graceful shutdown (§6).
    pub fn expire_all_sessions(&self, reason: &str) {
        for session_id in self.store.session_ids() {
            if let Some(handle) = self.store.get_session(&session_id) {
                let terminal = handle.lock().expect("session poisoned").is_terminal();
                if terminal {
                    continue;
                }
            }
            self.store.update_status(&session_id, SessionStatus::Expired, Some(reason.to_string()));
            self.emit(ManagerEvent::Broadcast {
                session_id,
                message: ServerMessage::SessionExpired { reason: reason.to_string() },
            });
        }
    }

    /// Handle an `AUTH` frame already past the `ConnectionServer`'s rate
    /// limiter. Returns the reply to unicast to the originating connection.
    pub fn handle_auth(
        &self,
        session_id: &str,
        auth_token: &str,
        _role: Role,
        label: Option<String>,
        public_key: Option<String>,
    ) -> (Option<u64>, ServerMessage) {
        match self.store.authenticate(session_id, auth_token, label, public_key) {
            AuthOutcome::Success { participant_id, .. } => {
                let Some(handle) = self.store.get_session(session_id) else {
                    return (None, ServerMessage::error(ErrorKind::Internal, "session vanished"));
                };
                let session = handle.lock().expect("session poisoned");
                let session_info = SessionInfo {
                    session_id: session.session_id.clone(),
                    threshold: session.threshold,
                    eligible_key_count: session.eligible_keys.len(),
                    expected_participants: session.expected_participants,
                    status: session.status.as_str().to_string(),
                };
                let frozen = session.frozen_transaction.clone();
                drop(session);

                self.emit(ManagerEvent::Broadcast {
                    session_id: session_id.to_string(),
                    message: ServerMessage::ParticipantConnected { participant_id: participant_id.to_string() },
                });

                // Replay the last TRANSACTION_RECEIVED to a late-arriving
                // participant so it never misses the frozen transaction (§4.5).
                if let Some(tx) = frozen {
                    self.emit(ManagerEvent::Unicast {
                        session_id: session_id.to_string(),
                        participant_id,
                        message: ServerMessage::TransactionReceived {
                            frozen_transaction_base64: BASE64.encode(&tx.bytes),
                            tx_summary: tx.summary,
                            metadata: tx.metadata,
                            contract_abi: tx.contract_abi,
                        },
                    });
                }

                (Some(participant_id), ServerMessage::AuthSuccess { participant_id: participant_id.to_string(), session_info })
            }
            AuthOutcome::Failure(kind) => (None, ServerMessage::error(kind, format!("authentication failed: {kind}"))),
        }
    }

    pub fn handle_participant_ready(&self, session_id: &str, participant_id: u64, public_key: String) {
        match self.store.set_participant_ready(session_id, participant_id, public_key) {
            Ok(all_ready) => {
                self.emit(ManagerEvent::Broadcast {
                    session_id: session_id.to_string(),
                    message: ServerMessage::ParticipantReady { participant_id: participant_id.to_string(), all_ready },
                });
            }
            Err(kind) => {
                self.emit(ManagerEvent::Unicast {
                    session_id: session_id.to_string(),
                    participant_id,
                    message: ServerMessage::error(kind, format!("PARTICIPANT_READY rejected: {kind}")),
                });
            }
        }
    }

    /// A connection dropped (client close, transport error, or missed
    /// heartbeats). The participant is marked disconnected, not removed —
    /// reconnect under a fresh participant id is always permitted.
    pub fn handle_disconnect(&self, session_id: &str, participant_id: u64) {
        self.store.mark_disconnected(session_id, participant_id);
        self.emit(ManagerEvent::Broadcast {
            session_id: session_id.to_string(),
            message: ServerMessage::ParticipantDisconnected { participant_id: participant_id.to_string() },
        });
    }

    pub fn handle_transaction_rejected(&self, session_id: &str, participant_id: u64, reason: Option<String>) {
        self.store.update_participant_status(session_id, participant_id, ParticipantStatus::Rejected);
        tracing::info!(session_id, participant_id, reason = reason.as_deref().unwrap_or(""), "participant rejected the transaction");
    }

    pub fn handle_signature_submit(self: &Arc<Self>, session_id: &str, participant_id: u64, public_key: String, signature_base64: String) {
        let Ok(signature) = BASE64.decode(signature_base64.as_bytes()) else {
            self.emit(ManagerEvent::Broadcast {
                session_id: session_id.to_string(),
                message: ServerMessage::error(ErrorKind::Validation, "signature is not valid base64"),
            });
            return;
        };

        let outcome = self.store.add_signature(session_id, participant_id, &public_key, signature);
        match outcome {
            SignatureOutcome::Accepted { threshold_just_met } => {
                self.emit(ManagerEvent::Broadcast {
                    session_id: session_id.to_string(),
                    message: ServerMessage::SignatureAccepted { public_key: public_key.clone() },
                });
                if threshold_just_met {
                    self.on_threshold_met(session_id);
                }
            }
            SignatureOutcome::AlreadyAccepted => {
                self.emit(ManagerEvent::Broadcast {
                    session_id: session_id.to_string(),
                    message: ServerMessage::SignatureAccepted { public_key },
                });
            }
            SignatureOutcome::Rejected(kind) => {
                self.emit(ManagerEvent::Broadcast {
                    session_id: session_id.to_string(),
                    message: ServerMessage::SignatureRejected { reason: kind.as_str().to_string() },
                });
            }
        }
    }

    fn on_threshold_met(self: &Arc<Self>, session_id: &str) {
        let Some(handle) = self.store.get_session(session_id) else { return };
        let threshold = handle.lock().expect("session poisoned").threshold;

        self.emit(ManagerEvent::Broadcast {
            session_id: session_id.to_string(),
            message: ServerMessage::ThresholdMet { threshold },
        });

        self.store.update_status(session_id, SessionStatus::Executing, None);

        let this = Arc::clone(self);
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            this.execute(&session_id).await;
        });
    }

    async fn execute(self: Arc<Self>, session_id: &str) {
        let Some(handle) = self.store.get_session(session_id) else { return };
        let (raw_tx, signatures) = {
            let session = handle.lock().expect("session poisoned");
            let Some(tx) = session.frozen_transaction.clone() else { return };
            let sigs: Vec<(String, Vec<u8>)> = session
                .signatures
                .iter()
                .take(session.threshold as usize)
                .map(|(pk, sig)| (pk.clone(), sig.signature_bytes.clone()))
                .collect();
            (tx.bytes, sigs)
        };

        let result: Result<crate::ledger::ExecutionReceipt, ExecutionError> = async {
            let signed = self.ledger.attach_signatures(&raw_tx, &signatures).await?;
            self.ledger.submit(&signed).await
        }
        .await;

        match result {
            Ok(receipt) => {
                self.store.update_status(session_id, SessionStatus::Completed, None);
                self.emit(ManagerEvent::Broadcast {
                    session_id: session_id.to_string(),
                    message: ServerMessage::TransactionExecuted { transaction_id: receipt.transaction_id, status: receipt.status },
                });
            }
            Err(e) => {
                self.store.update_status(session_id, SessionStatus::Failed, Some(ErrorKind::ExecutionFailed.as_str().to_string()));
                tracing::error!(session_id, error = %e, "ledger execution failed");
                self.emit(ManagerEvent::Broadcast {
                    session_id: session_id.to_string(),
                    message: ServerMessage::error(ErrorKind::ExecutionFailed, e.to_string()),
                });
            }
        }
    }

    /// Inject the frozen transaction into a session. Fails with
    /// `already_injected` if the session is not `waiting` (§4.5) — checked
    /// first, ahead of byte-length validation, so a malformed injection
    /// attempt against an already-injected session is still reported as
    /// `already_injected` rather than `validation`.
    pub fn inject_transaction(
        &self,
        session_id: &str,
        raw: Vec<u8>,
        summary: String,
        metadata: Option<serde_json::Value>,
        contract_abi: Option<serde_json::Value>,
    ) -> Result<(), ErrorKind> {
        match self.store.session_status(session_id) {
            None => return Err(ErrorKind::Validation),
            Some(status) if status != SessionStatus::Waiting => return Err(ErrorKind::AlreadyInjected),
            Some(_) => {}
        }
        if raw.is_empty() {
            return Err(ErrorKind::Validation);
        }
        match self.store.inject_transaction(session_id, raw.clone(), summary.clone(), metadata.clone(), contract_abi.clone()) {
            Ok(InjectOutcome::Ok) => {
                self.emit(ManagerEvent::Broadcast {
                    session_id: session_id.to_string(),
                    message: ServerMessage::TransactionReceived {
                        frozen_transaction_base64: BASE64.encode(&raw),
                        tx_summary: summary,
                        metadata,
                        contract_abi,
                    },
                });
                self.schedule_execution_deadline(session_id);
                Ok(())
            }
            Ok(InjectOutcome::AlreadyInjected) => Err(ErrorKind::AlreadyInjected),
            Err(kind) => Err(kind),
        }
    }

    /// Start the periodic sweep for expired and deadline-exceeded sessions
    /// (§4.4, §4.7). Registered with the `TimerRegistry` itself, so
    /// `TimerRegistry::shutdown` stops it along with every other timer.
    ///
    /// Both reap loops broadcast `SESSION_EXPIRED` *and* delete the session
    /// from the store — per spec.md's cleanup clause the sweep "emits
    /// SESSION_EXPIRED on all their connections, removes them, and cancels
    /// any session-scoped timers." Leaving a reaped session in the store
    /// would grow `SessionStore`'s map without bound over a long-running
    /// process.
    pub fn spawn_cleanup_loop(self: &Arc<Self>, interval: Duration) {
        let this = Arc::clone(self);
        self.timers.register_periodic("manager.cleanup", "session_manager", interval, move || {
            let this = Arc::clone(&this);
            async move {
                for session_id in this.store.sweep_expired() {
                    this.timers.cancel_by_prefix(&format!("session.{session_id}."));
                    this.emit(ManagerEvent::Broadcast {
                        session_id: session_id.clone(),
                        message: ServerMessage::SessionExpired { reason: ErrorKind::Expired.as_str().to_string() },
                    });
                    this.store.delete_session(&session_id);
                }
                for session_id in this.store.sweep_execution_deadlines() {
                    this.timers.cancel_by_prefix(&format!("session.{session_id}."));
                    this.emit(ManagerEvent::Broadcast {
                        session_id: session_id.clone(),
                        message: ServerMessage::SessionExpired { reason: ErrorKind::TransactionWindowExceeded.as_str().to_string() },
                    });
                    this.store.delete_session(&session_id);
                }
            }
        });
    }

    /// Register the 120s-minus-10s execution deadline as a timer-registry
    /// one-shot, so `TimerRegistry::shutdown` cancels it like any other
    /// scheduled callback.
    ///
    /// `sweep_execution_deadlines` is global, not scoped to `session_id`: by
    /// the time this one-shot fires, another session's deadline may have
    /// also elapsed (timer firing order across sessions is not guaranteed).
    /// Broadcasting only for `session_id` would silently flip that other
    /// session to `failed` here while its own later one-shot finds it
    /// already terminal and skips it — orphaning it with no
    /// `SESSION_EXPIRED` ever sent. Broadcast for every id the sweep
    /// actually returns.
    fn schedule_execution_deadline(&self, session_id: &str) {
        let store = Arc::clone(&self.store);
        let events_tx = self.events_tx.clone();
        let delay = Duration::from_secs(110); // 120s ledger window minus 10s safety margin
        self.timers.register_once(&format!("session.{session_id}.execution_deadline"), "session_manager", delay, async move {
            for id in store.sweep_execution_deadlines() {
                let _ = events_tx.send(ManagerEvent::Broadcast {
                    session_id: id,
                    message: ServerMessage::SessionExpired { reason: ErrorKind::TransactionWindowExceeded.as_str().to_string() },
                });
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::NoopLedgerClient;
    use crate::session::CreateSessionConfig;
    use ed25519_dalek::{Signer, SigningKey};
    use rand::rngs::OsRng;
    use std::time::Duration as StdDuration;

    fn keypair() -> (SigningKey, String) {
        let sk = SigningKey::generate(&mut OsRng);
        (sk.clone(), hex::encode(sk.verifying_key().to_bytes()))
    }

    fn new_manager() -> (Arc<SessionManager>, mpsc::UnboundedReceiver<ManagerEvent>, Arc<SessionStore>) {
        let store = SessionStore::new();
        let timers = TimerRegistry::new();
        let (manager, rx) = SessionManager::new(store.clone(), timers, Arc::new(NoopLedgerClient));
        (manager, rx, store)
    }

    #[tokio::test]
    async fn full_two_of_three_flow_executes_once() {
        let (manager, mut rx, store) = new_manager();
        let (sk1, pk1) = keypair();
        let (sk2, pk2) = keypair();
        let (_sk3, pk3) = keypair();

        let handle = store.create_session(CreateSessionConfig {
            threshold: 2,
            eligible_keys: vec![pk1.clone(), pk2.clone(), pk3.clone()],
            expected_participants: 3,
            auth_token: Some("secret".into()),
            timeout: StdDuration::from_secs(1800),
            frozen_transaction: None,
        });
        let session_id = handle.lock().unwrap().session_id.clone();

        let (p1, _) = manager.handle_auth(&session_id, "secret", Role::Participant, None, None);
        let (p2, _) = manager.handle_auth(&session_id, "secret", Role::Participant, None, None);
        let p1 = p1.unwrap();
        let p2 = p2.unwrap();

        manager.inject_transaction(&session_id, b"withdraw".to_vec(), "withdraw funds".into(), None, None).unwrap();

        let sig1 = sk1.sign(b"withdraw").to_bytes().to_vec();
        let sig2 = sk2.sign(b"withdraw").to_bytes().to_vec();
        manager.handle_signature_submit(&session_id, p1, pk1, BASE64.encode(sig1));
        manager.handle_signature_submit(&session_id, p2, pk2, BASE64.encode(sig2));

        // Drain events until TRANSACTION_EXECUTED shows up (execution is spawned).
        let mut saw_threshold_met = false;
        let mut saw_executed = false;
        for _ in 0..50 {
            match tokio::time::timeout(StdDuration::from_millis(200), rx.recv()).await {
                Ok(Some(ManagerEvent::Broadcast { message: ServerMessage::ThresholdMet { .. }, .. })) => saw_threshold_met = true,
                Ok(Some(ManagerEvent::Broadcast { message: ServerMessage::TransactionExecuted { .. }, .. })) => {
                    saw_executed = true;
                    break;
                }
                Ok(Some(_)) => continue,
                _ => break,
            }
        }
        assert!(saw_threshold_met);
        assert!(saw_executed);

        let final_status = store.get_session(&session_id).unwrap().lock().unwrap().status.clone();
        assert_eq!(final_status, SessionStatus::Completed);
    }
}
