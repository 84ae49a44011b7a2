use crate::error::{BenchError, Result};
use crate::transport::tls::{MeshIdentity, SERVER_NAME, client_config};
use std::net::SocketAddr;

/// A QUIC endpoint that accepts incoming connections and can dial peers.
pub struct TransportListener {
    endpoint: quinn::Endpoint,
    local_addr: SocketAddr,
}

impl TransportListener {
    /// Bind the mesh endpoint of this process on `addr`.
    pub fn bind(addr: SocketAddr) -> Result<Self> {
        let server_config = MeshIdentity::generate()?.server_config()?;
        let mut endpoint = quinn::Endpoint::server(server_config, addr)
            .map_err(|e| BenchError::transport_with_source(format!("bind {addr}"), e))?;
        endpoint.set_default_client_config(client_config()?);

        let local_addr = endpoint
            .local_addr()
            .map_err(|e| BenchError::transport_with_source("local_addr", e))?;

        Ok(Self {
            endpoint,
            local_addr,
        })
    }

    /// Accept the next incoming QUIC connection.
    pub async fn accept(&self) -> Result<quinn::Connection> {
        let incoming = self
            .endpoint
            .accept()
            .await
            .ok_or_else(|| BenchError::transport("endpoint closed"))?;

        incoming
            .await
            .map_err(|e| BenchError::transport_with_source("accept", e))
    }

    /// Dial `addr` from this endpoint.
    pub async fn connect(&self, addr: SocketAddr) -> Result<quinn::Connection> {
        self.endpoint
            .connect(addr, SERVER_NAME)
            .map_err(|e| BenchError::transport_with_source(format!("connect to {addr}"), e))?
            .await
            .map_err(|e| BenchError::transport_with_source(format!("handshake with {addr}"), e))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}
