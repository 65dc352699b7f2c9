//! CryptoVerifier (§4.3): stateless SHA-256 digesting of transaction bytes
//! and signature verification against public keys for both Ed25519 and
//! ECDSA-secp256k1.
//!
//! Keys are self-describing by their decoded byte length: 32 bytes is an
//! Ed25519 verifying key, 33 bytes is a compressed secp256k1 public key.
//! Signatures are always 64 raw bytes (`r || s`) regardless of curve.

use ed25519_dalek::{Signature as EdSignature, Verifier, VerifyingKey as EdVerifyingKey};
use k256::ecdsa::signature::Verifier as _;
use k256::ecdsa::{Signature as K256Signature, VerifyingKey as K256VerifyingKey};
use sha2::{Digest, Sha256};

/// Reason a signature or key failed to verify, for logging only — callers
/// translate any `Err` into `SIGNATURE_REJECTED { reason: invalid_signature }`
/// without leaking this detail to the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyFailure {
    KeyDecodeError,
    UnsupportedKeyLength,
    SignatureDecodeError,
    SignatureMismatch,
}

impl std::fmt::Display for VerifyFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VerifyFailure::KeyDecodeError => "key did not decode to valid hex/bytes",
            VerifyFailure::UnsupportedKeyLength => "key length matches neither Ed25519 nor secp256k1",
            VerifyFailure::SignatureDecodeError => "signature bytes malformed for the key's curve",
            VerifyFailure::SignatureMismatch => "signature did not verify",
        };
        f.write_str(s)
    }
}

/// SHA-256 digest of the opaque transaction bytes. Recomputed on every use
/// rather than cached, per §3 — `transaction_digest` is never stored stale.
pub fn digest(transaction_bytes: &[u8]) -> [u8; 32] {
    Sha256::digest(transaction_bytes).into()
}

pub fn digest_hex(transaction_bytes: &[u8]) -> String {
    hex::encode(digest(transaction_bytes))
}

/// Parse a hex-encoded public key and report which curve it decodes to.
fn decode_key(public_key_hex: &str) -> Result<KeyKind, VerifyFailure> {
    let bytes = hex::decode(public_key_hex.trim()).map_err(|_| VerifyFailure::KeyDecodeError)?;
    match bytes.len() {
        32 => {
            let arr: [u8; 32] = bytes.try_into().unwrap();
            let vk = EdVerifyingKey::from_bytes(&arr).map_err(|_| VerifyFailure::KeyDecodeError)?;
            Ok(KeyKind::Ed25519(vk))
        }
        33 => {
            let vk = K256VerifyingKey::from_sec1_bytes(&bytes).map_err(|_| VerifyFailure::KeyDecodeError)?;
            Ok(KeyKind::Secp256k1(vk))
        }
        _ => Err(VerifyFailure::UnsupportedKeyLength),
    }
}

enum KeyKind {
    Ed25519(EdVerifyingKey),
    Secp256k1(K256VerifyingKey),
}

/// Verify a 64-byte signature against the raw transaction bytes (not the
/// digest — the ledger verifies over the serialized transaction body, so
/// the coordinator mirrors that exactly).
///
/// `public_key_hex` and `signature_hex` are hex-encoded on the wire
/// internally; the protocol layer carries them as base64/text and converts
/// before calling here (see [`crate::protocol`]).
pub fn verify(public_key_hex: &str, transaction_bytes: &[u8], signature: &[u8]) -> Result<(), VerifyFailure> {
    if signature.len() != 64 {
        return Err(VerifyFailure::SignatureDecodeError);
    }

    match decode_key(public_key_hex)? {
        KeyKind::Ed25519(vk) => {
            let sig = EdSignature::from_slice(signature).map_err(|_| VerifyFailure::SignatureDecodeError)?;
            vk.verify(transaction_bytes, &sig)
                .map_err(|_| VerifyFailure::SignatureMismatch)
        }
        KeyKind::Secp256k1(vk) => {
            let sig = K256Signature::from_slice(signature).map_err(|_| VerifyFailure::SignatureDecodeError)?;
            vk.verify(transaction_bytes, &sig)
                .map_err(|_| VerifyFailure::SignatureMismatch)
        }
    }
}

/// Convenience boolean form, matching the §4.3 signature exactly.
pub fn verify_bool(public_key_hex: &str, transaction_bytes: &[u8], signature: &[u8]) -> bool {
    verify(public_key_hex, transaction_bytes, signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey as EdSigningKey;
    use k256::ecdsa::{signature::Signer, SigningKey as K256SigningKey};
    use rand::rngs::OsRng;

    #[test]
    fn digest_is_sha256() {
        let d = digest(b"hello");
        assert_eq!(hex::encode(d), hex::encode(Sha256::digest(b"hello")));
    }

    #[test]
    fn verifies_ed25519_signature() {
        let signing_key = EdSigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();
        let msg = b"frozen transaction bytes";
        let sig: EdSignature = ed25519_dalek::Signer::sign(&signing_key, msg);

        let pk_hex = hex::encode(verifying_key.to_bytes());
        assert!(verify_bool(&pk_hex, msg, &sig.to_bytes()));
    }

    #[test]
    fn rejects_ed25519_signature_over_wrong_message() {
        let signing_key = EdSigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();
        let sig: EdSignature = ed25519_dalek::Signer::sign(&signing_key, b"original");

        let pk_hex = hex::encode(verifying_key.to_bytes());
        assert!(!verify_bool(&pk_hex, b"tampered", &sig.to_bytes()));
    }

    #[test]
    fn verifies_secp256k1_signature() {
        let signing_key = K256SigningKey::random(&mut OsRng);
        let verifying_key = K256VerifyingKey::from(&signing_key);
        let msg = b"frozen transaction bytes";
        let sig: K256Signature = signing_key.sign(msg);

        let pk_hex = hex::encode(verifying_key.to_encoded_point(true).as_bytes());
        assert!(verify_bool(&pk_hex, msg, &sig.to_bytes()));
    }

    #[test]
    fn rejects_malformed_key() {
        assert_eq!(decode_key("not-hex").unwrap_err(), VerifyFailure::KeyDecodeError);
        assert_eq!(decode_key("aabb").unwrap_err(), VerifyFailure::UnsupportedKeyLength);
    }

    #[test]
    fn rejects_wrong_length_signature() {
        let signing_key = EdSigningKey::generate(&mut OsRng);
        let pk_hex = hex::encode(signing_key.verifying_key().to_bytes());
        assert_eq!(
            verify(&pk_hex, b"x", &[0u8; 10]).unwrap_err(),
            VerifyFailure::SignatureDecodeError
        );
    }
}
