//! Shared fixtures for integration tests: keypair generation and a
//! store+manager harness wired with the no-op ledger.

use std::sync::Arc;
use std::time::Duration;

use ed25519_dalek::{Signer, SigningKey};
use rand::rngs::OsRng;
use signing_coordinator::ledger::NoopLedgerClient;
use signing_coordinator::manager::{ManagerEvent, SessionManager};
use signing_coordinator::session::{CreateSessionConfig, SessionHandle, SessionStore};
use signing_coordinator::timer::TimerRegistry;
use tokio::sync::mpsc;

pub struct Signer1 {
    pub signing_key: SigningKey,
    pub public_key_hex: String,
}

pub fn new_keypair() -> Signer1 {
    let signing_key = SigningKey::generate(&mut OsRng);
    let public_key_hex = hex::encode(signing_key.verifying_key().to_bytes());
    Signer1 { signing_key, public_key_hex }
}

pub fn sign(signer: &Signer1, message: &[u8]) -> Vec<u8> {
    signer.signing_key.sign(message).to_bytes().to_vec()
}

pub struct Harness {
    pub manager: Arc<SessionManager>,
    pub events: mpsc::UnboundedReceiver<ManagerEvent>,
    pub store: Arc<SessionStore>,
}

pub fn new_harness() -> Harness {
    let store = SessionStore::new();
    let timers = TimerRegistry::new();
    let (manager, events) = SessionManager::new(Arc::clone(&store), timers, Arc::new(NoopLedgerClient));
    Harness { manager, events, store }
}

pub fn new_session(store: &SessionStore, threshold: u32, eligible_keys: Vec<String>, expected_participants: u32) -> SessionHandle {
    store.create_session(CreateSessionConfig {
        threshold,
        eligible_keys,
        expected_participants,
        auth_token: Some("shared-secret".into()),
        timeout: Duration::from_secs(1800),
        frozen_transaction: None,
    })
}
