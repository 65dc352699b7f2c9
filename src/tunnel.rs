//! Public-URL tunneling provider (§6): out of scope to implement, but the
//! `ConnectionServer`/entry point need an interface to request one at
//! startup and surface it alongside the bind address.

use async_trait::async_trait;
use std::net::SocketAddr;
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("tunnel provider request failed: {0}")]
    Request(String),
}

#[async_trait]
pub trait TunnelProvider: Send + Sync {
    async fn public_url(&self, local: SocketAddr) -> Result<Url, TunnelError>;
}

/// Default when no `tunnel_provider` is configured.
pub struct NoTunnel;

#[async_trait]
impl TunnelProvider for NoTunnel {
    async fn public_url(&self, _local: SocketAddr) -> Result<Url, TunnelError> {
        Err(TunnelError::Request("no tunnel provider configured".into()))
    }
}
