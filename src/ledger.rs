//! Ledger client interface (§6): consumed, not implemented. The coordinator
//! never parses the transaction beyond digesting it — attaching signatures
//! and submitting the signed bytes is delegated entirely to whatever
//! ledger-specific client is wired in at the entry point.

use async_trait::async_trait;

#[derive(Debug, Clone)]
pub struct ExecutionReceipt {
    pub transaction_id: String,
    pub status: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("ledger rejected the transaction: {0}")]
    Rejected(String),
    #[error("ledger request failed: {0}")]
    Transport(String),
}

#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Attach collected `(public_key, signature_bytes)` pairs to the raw
    /// transaction bytes, producing the ledger's signed wire format.
    async fn attach_signatures(&self, raw_tx_bytes: &[u8], signatures: &[(String, Vec<u8>)]) -> Result<Vec<u8>, ExecutionError>;

    /// Submit the signed transaction and await the ledger's response.
    async fn submit(&self, signed_tx_bytes: &[u8]) -> Result<ExecutionReceipt, ExecutionError>;
}

/// Test/dev double: attaches signatures as a simple length-prefixed
/// concatenation and always reports success. Never used in production —
/// an operator wires a real ledger-specific client at the entry point.
pub struct NoopLedgerClient;

#[async_trait]
impl LedgerClient for NoopLedgerClient {
    async fn attach_signatures(&self, raw_tx_bytes: &[u8], signatures: &[(String, Vec<u8>)]) -> Result<Vec<u8>, ExecutionError> {
        let mut out = raw_tx_bytes.to_vec();
        for (_, sig) in signatures {
            out.extend_from_slice(sig);
        }
        Ok(out)
    }

    async fn submit(&self, signed_tx_bytes: &[u8]) -> Result<ExecutionReceipt, ExecutionError> {
        Ok(ExecutionReceipt {
            transaction_id: crate::crypto::digest_hex(signed_tx_bytes),
            status: "success".to_string(),
        })
    }
}
