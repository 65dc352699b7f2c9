//! Property tests for the invariants enumerated in the specification's
//! testable-properties section: collected signatures never carry an
//! ineligible public key, every accepted signature verifies, resubmitting
//! an identical `(public_key, signature)` pair is a no-op, and the
//! threshold-met transition fires at most once regardless of submission
//! order.

mod common;

use common::{new_keypair, new_session, sign, Signer1};
use proptest::collection::vec as prop_vec;
use proptest::prelude::*;
use signing_coordinator::session::{SessionStatus, SessionStore, SignatureOutcome};

const TX_BODY: &[u8] = b"frozen transaction body for invariant testing";

/// One attempt in a generated submission sequence: which of the `K`
/// keypairs to sign under, and whether to submit a byte-flipped (invalid)
/// signature instead of a genuine one.
#[derive(Debug, Clone, Copy)]
struct Attempt {
    signer_index: usize,
    tamper: bool,
}

fn attempt_strategy(pool_size: usize) -> impl Strategy<Value = Attempt> {
    (0..pool_size, any::<bool>()).prop_map(|(signer_index, tamper)| Attempt { signer_index, tamper })
}

fn attempts_strategy(pool_size: usize, max_len: usize) -> impl Strategy<Value = Vec<Attempt>> {
    prop_vec(attempt_strategy(pool_size), 0..max_len)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// For any sequence of submissions mixing valid, tampered, and
    /// repeated signatures: every signature the store retains is under an
    /// eligible key and verifies against the frozen transaction, and the
    /// threshold-met status is entered at most once.
    #[test]
    fn signatures_are_always_eligible_and_verified(attempts in attempts_strategy(4, 12)) {
        let pool: Vec<Signer1> = (0..4).map(|_| new_keypair()).collect();
        let eligible_keys: Vec<String> = pool.iter().map(|s| s.public_key_hex.clone()).collect();
        let threshold = 2u32;

        let store = SessionStore::new();
        let session_handle = new_session(&store, threshold, eligible_keys.clone(), pool.len() as u32);
        let session_id = session_handle.lock().unwrap().session_id.clone();
        store.inject_transaction(&session_id, TX_BODY.to_vec(), "invariant check".into(), None, None).unwrap();

        let mut threshold_met_count = 0;
        for attempt in &attempts {
            let signer = &pool[attempt.signer_index % pool.len()];
            let mut sig = sign(signer, TX_BODY);
            if attempt.tamper {
                sig[0] ^= 0xFF;
            }
            let outcome = store.add_signature(&session_id, attempt.signer_index as u64, &signer.public_key_hex, sig);
            if let SignatureOutcome::Accepted { threshold_just_met } = outcome {
                if threshold_just_met {
                    threshold_met_count += 1;
                }
            }
        }

        let guard = session_handle.lock().unwrap();
        for (public_key, collected) in guard.signatures.iter() {
            prop_assert!(eligible_keys.contains(public_key));
            prop_assert!(signing_coordinator::crypto::verify_bool(public_key, TX_BODY, &collected.signature_bytes));
        }
        prop_assert!(guard.signatures.len() as u32 <= pool.len() as u32);
        prop_assert!(threshold_met_count <= 1, "threshold_met must fire at most once");
        if threshold_met_count == 1 {
            prop_assert_eq!(guard.status.clone(), SessionStatus::ThresholdMet);
        }
    }

    /// Resubmitting the byte-identical `(public_key, signature)` pair any
    /// number of times past the first acceptance never changes the
    /// collected signature count.
    #[test]
    fn identical_resubmission_is_idempotent(repeats in 1usize..8) {
        let signer = new_keypair();
        let eligible_keys = vec![signer.public_key_hex.clone()];

        let store = SessionStore::new();
        let session_handle = new_session(&store, 1, eligible_keys, 1);
        let session_id = session_handle.lock().unwrap().session_id.clone();
        store.inject_transaction(&session_id, TX_BODY.to_vec(), "idempotence check".into(), None, None).unwrap();

        let sig = sign(&signer, TX_BODY);
        for i in 0..repeats {
            let outcome = store.add_signature(&session_id, 1, &signer.public_key_hex, sig.clone());
            if i == 0 {
                prop_assert!(matches!(outcome, SignatureOutcome::Accepted { .. }));
            } else {
                prop_assert!(matches!(outcome, SignatureOutcome::AlreadyAccepted));
            }
        }
        prop_assert_eq!(session_handle.lock().unwrap().signatures.len(), 1);
    }
}

#[test]
fn expiry_sweep_never_reaps_a_session_with_time_remaining() {
    let signer = new_keypair();
    let store = SessionStore::new();
    let handle = new_session(&store, 1, vec![signer.public_key_hex.clone()], 1);
    let id = handle.lock().unwrap().session_id.clone();

    let expired = store.sweep_expired();
    assert!(expired.is_empty(), "a freshly created session with its full timeout ahead must not be reaped");
    assert_eq!(store.get_session(&id).unwrap().lock().unwrap().status, SessionStatus::Waiting);
}
