mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use common::{new_harness, new_keypair, new_session, sign};
use signing_coordinator::manager::ManagerEvent;
use signing_coordinator::protocol::{Role, ServerMessage};
use signing_coordinator::rate_limit::RateLimiter;
use signing_coordinator::session::SessionStatus;

async fn drain_until<F>(events: &mut tokio::sync::mpsc::UnboundedReceiver<ManagerEvent>, mut predicate: F) -> bool
where
    F: FnMut(&ManagerEvent) -> bool,
{
    for _ in 0..100 {
        match tokio::time::timeout(Duration::from_millis(200), events.recv()).await {
            Ok(Some(event)) if predicate(&event) => return true,
            Ok(Some(_)) => continue,
            _ => return false,
        }
    }
    false
}

#[tokio::test]
async fn two_of_three_happy_path_executes_the_transaction() {
    let mut harness = new_harness();
    let a = new_keypair();
    let b = new_keypair();
    let c = new_keypair();
    let session = new_session(&harness.store, 2, vec![a.public_key_hex.clone(), b.public_key_hex.clone(), c.public_key_hex.clone()], 3);
    let session_id = session.lock().unwrap().session_id.clone();

    let (p_a, _) = harness.manager.handle_auth(&session_id, "shared-secret", Role::Participant, None, None);
    let (p_b, _) = harness.manager.handle_auth(&session_id, "shared-secret", Role::Participant, None, None);
    let p_a = p_a.expect("auth a");
    let p_b = p_b.expect("auth b");

    harness.manager.inject_transaction(&session_id, b"transfer 10 BTC".to_vec(), "transfer 10 BTC".into(), None, None).unwrap();

    let sig_a = sign(&a, b"transfer 10 BTC");
    let sig_b = sign(&b, b"transfer 10 BTC");
    harness.manager.handle_signature_submit(&session_id, p_a, a.public_key_hex.clone(), BASE64.encode(sig_a));
    harness.manager.handle_signature_submit(&session_id, p_b, b.public_key_hex.clone(), BASE64.encode(sig_b));

    let executed = drain_until(&mut harness.events, |e| matches!(e, ManagerEvent::Broadcast { message: ServerMessage::TransactionExecuted { .. }, .. })).await;
    assert!(executed, "expected TRANSACTION_EXECUTED after the second of two required signatures");

    let status = harness.store.get_session(&session_id).unwrap().lock().unwrap().status.clone();
    assert_eq!(status, SessionStatus::Completed);
}

#[tokio::test]
async fn duplicate_signer_does_not_double_count_toward_threshold() {
    let mut harness = new_harness();
    let a = new_keypair();
    let b = new_keypair();
    let session = new_session(&harness.store, 2, vec![a.public_key_hex.clone(), b.public_key_hex.clone()], 2);
    let session_id = session.lock().unwrap().session_id.clone();

    let (p_a, _) = harness.manager.handle_auth(&session_id, "shared-secret", Role::Participant, None, None);
    let p_a = p_a.unwrap();
    harness.manager.inject_transaction(&session_id, b"tx".to_vec(), "s".into(), None, None).unwrap();

    let sig_a = sign(&a, b"tx");
    harness.manager.handle_signature_submit(&session_id, p_a, a.public_key_hex.clone(), BASE64.encode(sig_a.clone()));
    harness.manager.handle_signature_submit(&session_id, p_a, a.public_key_hex.clone(), BASE64.encode(sig_a));

    // Only one unique signature recorded; threshold of 2 is still unmet.
    let status = harness.store.get_session(&session_id).unwrap().lock().unwrap().status.clone();
    assert_eq!(status, SessionStatus::Signing);

    let rejected = drain_until(&mut harness.events, |e| matches!(e, ManagerEvent::Broadcast { message: ServerMessage::SignatureRejected { .. }, .. })).await;
    assert!(!rejected, "an identical resubmission is idempotent, not a rejection");
}

#[tokio::test]
async fn ineligible_signer_is_rejected_and_signatures_are_unchanged() {
    let mut harness = new_harness();
    let a = new_keypair();
    let outsider = new_keypair();
    let session = new_session(&harness.store, 1, vec![a.public_key_hex.clone()], 1);
    let session_id = session.lock().unwrap().session_id.clone();

    let (p_a, _) = harness.manager.handle_auth(&session_id, "shared-secret", Role::Participant, None, None);
    let p_a = p_a.unwrap();
    harness.manager.inject_transaction(&session_id, b"tx".to_vec(), "s".into(), None, None).unwrap();

    let forged = sign(&outsider, b"tx");
    harness.manager.handle_signature_submit(&session_id, p_a, outsider.public_key_hex.clone(), BASE64.encode(forged));

    let rejected = drain_until(&mut harness.events, |e| {
        matches!(e, ManagerEvent::Broadcast { message: ServerMessage::SignatureRejected { reason }, .. } if reason == "ineligible_signer")
    })
    .await;
    assert!(rejected);

    let signatures_len = harness.store.get_session(&session_id).unwrap().lock().unwrap().signatures.len();
    assert_eq!(signatures_len, 0);
}

#[tokio::test]
async fn brute_force_auth_attempts_trip_the_rate_limiter() {
    let limiter = RateLimiter::new();
    let peer = "203.0.113.7";
    for _ in 0..5 {
        assert!(limiter.record_attempt(peer));
    }
    assert!(!limiter.record_attempt(peer), "the 6th attempt within the window must be blocked");
    assert!(limiter.is_blocked(peer));
}

#[tokio::test]
async fn session_fails_once_the_execution_deadline_has_passed() {
    let harness = new_harness();
    let a = new_keypair();
    let session = new_session(&harness.store, 1, vec![a.public_key_hex.clone()], 1);
    let session_id = session.lock().unwrap().session_id.clone();

    harness.manager.inject_transaction(&session_id, b"tx".to_vec(), "s".into(), None, None).unwrap();
    // Force the deadline into the past instead of sleeping ~110s in a test.
    session.lock().unwrap().execution_deadline = Some(Instant::now() - Duration::from_secs(1));

    let failed = harness.store.sweep_execution_deadlines();
    assert_eq!(failed, vec![session_id.clone()]);

    let session = harness.store.get_session(&session_id).unwrap();
    let guard = session.lock().unwrap();
    assert_eq!(guard.status, SessionStatus::Failed);
    assert_eq!(guard.last_terminal_reason.as_deref(), Some("transaction_window_exceeded"));
}

#[tokio::test]
async fn threshold_of_one_executes_on_the_first_valid_signature() {
    let mut harness = new_harness();
    let a = new_keypair();
    let session = new_session(&harness.store, 1, vec![a.public_key_hex.clone()], 1);
    let session_id = session.lock().unwrap().session_id.clone();

    let (p_a, _) = harness.manager.handle_auth(&session_id, "shared-secret", Role::Participant, None, None);
    let p_a = p_a.unwrap();
    harness.manager.inject_transaction(&session_id, b"tx".to_vec(), "s".into(), None, None).unwrap();

    let sig_a = sign(&a, b"tx");
    harness.manager.handle_signature_submit(&session_id, p_a, a.public_key_hex.clone(), BASE64.encode(sig_a));

    let executed = drain_until(&mut harness.events, |e| matches!(e, ManagerEvent::Broadcast { message: ServerMessage::TransactionExecuted { .. }, .. })).await;
    assert!(executed, "a threshold of 1 must execute on the very first valid signature");
}

#[tokio::test]
async fn concurrent_submissions_meet_the_threshold_exactly_once() {
    let mut harness = new_harness();
    let a = new_keypair();
    let b = new_keypair();
    let c = new_keypair();
    let session = new_session(&harness.store, 2, vec![a.public_key_hex.clone(), b.public_key_hex.clone(), c.public_key_hex.clone()], 3);
    let session_id = session.lock().unwrap().session_id.clone();

    let (p_a, _) = harness.manager.handle_auth(&session_id, "shared-secret", Role::Participant, None, None);
    let (p_b, _) = harness.manager.handle_auth(&session_id, "shared-secret", Role::Participant, None, None);
    let (p_c, _) = harness.manager.handle_auth(&session_id, "shared-secret", Role::Participant, None, None);
    let (p_a, p_b, p_c) = (p_a.unwrap(), p_b.unwrap(), p_c.unwrap());

    harness.manager.inject_transaction(&session_id, b"tx".to_vec(), "s".into(), None, None).unwrap();

    let sig_a = BASE64.encode(sign(&a, b"tx"));
    let sig_b = BASE64.encode(sign(&b, b"tx"));
    let sig_c = BASE64.encode(sign(&c, b"tx"));

    let store = Arc::clone(&harness.store);
    let manager_a = Arc::clone(&harness.manager);
    let manager_b = Arc::clone(&harness.manager);
    let manager_c = Arc::clone(&harness.manager);
    let (sid_a, sid_b, sid_c) = (session_id.clone(), session_id.clone(), session_id.clone());

    let (ra, rb, rc) = tokio::join!(
        tokio::spawn(async move { manager_a.handle_signature_submit(&sid_a, p_a, a.public_key_hex.clone(), sig_a) }),
        tokio::spawn(async move { manager_b.handle_signature_submit(&sid_b, p_b, b.public_key_hex.clone(), sig_b) }),
        tokio::spawn(async move { manager_c.handle_signature_submit(&sid_c, p_c, c.public_key_hex.clone(), sig_c) }),
    );
    ra.unwrap();
    rb.unwrap();
    rc.unwrap();

    let mut threshold_met_count = 0;
    for _ in 0..200 {
        match tokio::time::timeout(Duration::from_millis(50), harness.events.recv()).await {
            Ok(Some(ManagerEvent::Broadcast { message: ServerMessage::ThresholdMet { .. }, .. })) => threshold_met_count += 1,
            Ok(Some(_)) => continue,
            _ => break,
        }
    }

    assert_eq!(threshold_met_count, 1, "THRESHOLD_MET must fire exactly once even with three concurrent submissions");
    let status = store.get_session(&session_id).unwrap().lock().unwrap().status.clone();
    assert!(matches!(status, SessionStatus::ThresholdMet | SessionStatus::Executing | SessionStatus::Completed));
}
