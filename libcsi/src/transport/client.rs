//! QUIC client used by orchestrator-side tooling to issue CSI requests.

use std::net::SocketAddr;
use std::sync::Arc;

use quinn::crypto::rustls::QuicClientConfig;
use rustls::pki_types::CertificateDer;
use tracing::{debug, instrument};

use crate::error::CsiError;
use crate::message::CsiMessage;

/// Upper bound on a single response payload.
const MAX_MESSAGE_BYTES: usize = 16 * 1024 * 1024;

/// A lightweight CSI client that sends [`CsiMessage`] requests over a single
/// QUIC connection and returns the server's response.
pub struct CsiClient {
    connection: quinn::Connection,
}

impl CsiClient {
    /// Establish a QUIC connection to the CSI server at `addr`, trusting
    /// exactly the given DER-encoded certificate.
    ///
    /// Daemons mint a self-signed certificate at startup and hand its DER
    /// bytes to co-located clients, so the trust anchor is pinned rather
    /// than resolved through a CA hierarchy.
    pub async fn connect_pinned(
        addr: SocketAddr,
        server_name: &str,
        server_cert: CertificateDer<'static>,
    ) -> Result<Self, CsiError> {
        let mut roots = rustls::RootCertStore::empty();
        roots
            .add(server_cert)
            .map_err(|e| CsiError::InvalidArgument(format!("bad server certificate: {e}")))?;
        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Self::connect(addr, server_name, tls_config).await
    }

    /// Establish a QUIC connection using a caller-supplied TLS config.
    ///
    /// * `addr` — socket address of the remote CSI server
    /// * `server_name` — TLS SNI name that must match a SAN in the server's
    ///   certificate
    pub async fn connect(
        addr: SocketAddr,
        server_name: &str,
        tls_config: rustls::ClientConfig,
    ) -> Result<Self, CsiError> {
        let quic_client_config = QuicClientConfig::try_from(tls_config)
            .map_err(|e| CsiError::Internal(format!("invalid TLS config: {e}")))?;
        let client_config = quinn::ClientConfig::new(Arc::new(quic_client_config));

        let bind_addr: SocketAddr = if addr.is_ipv4() {
            "0.0.0.0:0".parse().map_err(CsiError::internal)?
        } else {
            "[::]:0".parse().map_err(CsiError::internal)?
        };
        let mut endpoint = quinn::Endpoint::client(bind_addr).map_err(CsiError::internal)?;
        endpoint.set_default_client_config(client_config);

        let connection = endpoint
            .connect(addr, server_name)
            .map_err(CsiError::internal)?
            .await
            .map_err(CsiError::unavailable)?;

        debug!(%addr, %server_name, "CSI QUIC connection established");
        Ok(Self { connection })
    }

    /// Send a request and wait for the corresponding response.
    ///
    /// Each call opens a new bi-directional QUIC stream, writes the
    /// JSON-serialized request, finishes the send side, then reads the
    /// full response and deserializes it.
    #[instrument(skip(self), fields(msg = %msg))]
    pub async fn request(&self, msg: &CsiMessage) -> Result<CsiMessage, CsiError> {
        let (mut send, mut recv) = self
            .connection
            .open_bi()
            .await
            .map_err(CsiError::unavailable)?;

        let payload = serde_json::to_vec(msg).map_err(CsiError::internal)?;
        send.write_all(&payload)
            .await
            .map_err(CsiError::unavailable)?;
        send.finish().map_err(CsiError::internal)?;

        let buf = recv
            .read_to_end(MAX_MESSAGE_BYTES)
            .await
            .map_err(CsiError::unavailable)?;

        let response: CsiMessage = serde_json::from_slice(&buf).map_err(CsiError::internal)?;
        debug!(%response, "CSI response received");
        Ok(response)
    }

    /// Close the underlying QUIC connection gracefully.
    pub fn close(&self) {
        self.connection
            .close(quinn::VarInt::from_u32(0), b"client shutdown");
    }
}
