//! QUIC transport for the client.
//!
//! Provides [`ConnectedClient`], which moves frames between channels and the
//! single bidirectional QUIC stream a skein connection uses. Protocol logic
//! stays in the Sans-IO [`Client`](crate::Client).

use std::{net::SocketAddr, sync::Arc, time::Duration};

use quinn::{ClientConfig, Endpoint};
use skein_proto::{ALPN_PROTOCOL, Frame};
use thiserror::Error;
use tokio::sync::mpsc;

/// Idle timeout before QUIC gives up on a silent server.
const MAX_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection failed.
    #[error("connection failed: {0}")]
    Connection(String),

    /// Stream error.
    #[error("stream error: {0}")]
    Stream(String),
}

/// Handle to a live QUIC connection.
///
/// `from_server` yields `None` once the connection is gone; feed
/// `ClientEvent::Disconnected` and reconnect.
pub struct ConnectedClient {
    /// Send frames to the server.
    pub to_server: mpsc::Sender<Frame>,
    /// Receive frames from the server.
    pub from_server: mpsc::Receiver<Frame>,
    connection: quinn::Connection,
    endpoint: Endpoint,
}

impl ConnectedClient {
    /// Close the connection.
    pub fn stop(&self) {
        self.connection.close(0u32.into(), b"client closed");
    }

    /// Local UDP address of the endpoint.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Connection` if the socket is gone.
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        self.endpoint.local_addr().map_err(|e| TransportError::Connection(e.to_string()))
    }
}

/// Connect to a skein worker via QUIC.
///
/// Opens the connection's one bidirectional stream; the first frame written
/// to `to_server` should be `Hello`.
///
/// # Errors
///
/// - `TransportError::Connection` if the address is invalid or the handshake
///   fails
/// - `TransportError::Stream` if the stream cannot be opened
pub async fn connect(server_addr: &str) -> Result<ConnectedClient, TransportError> {
    let addr: SocketAddr = server_addr
        .parse()
        .map_err(|e| TransportError::Connection(format!("invalid address: {e}")))?;

    let client_config = insecure_client_config()?;
    let bind = SocketAddr::from(([0, 0, 0, 0], 0));
    let mut endpoint = Endpoint::client(bind)
        .map_err(|e| TransportError::Connection(format!("endpoint creation failed: {e}")))?;
    endpoint.set_default_client_config(client_config);

    let connection = endpoint
        .connect(addr, "localhost")
        .map_err(|e| TransportError::Connection(format!("connect failed: {e}")))?
        .await
        .map_err(|e| TransportError::Connection(format!("connection failed: {e}")))?;

    let (send, recv) = connection
        .open_bi()
        .await
        .map_err(|e| TransportError::Stream(format!("open stream failed: {e}")))?;

    let (to_server_tx, to_server_rx) = mpsc::channel::<Frame>(32);
    let (from_server_tx, from_server_rx) = mpsc::channel::<Frame>(256);

    tokio::spawn(write_loop(send, to_server_rx));
    tokio::spawn(read_loop(recv, from_server_tx));

    Ok(ConnectedClient { to_server: to_server_tx, from_server: from_server_rx, connection, endpoint })
}

async fn write_loop(mut send: quinn::SendStream, mut frames: mpsc::Receiver<Frame>) {
    while let Some(frame) = frames.recv().await {
        if skein_core::write_frame(&mut send, &frame).await.is_err() {
            return;
        }
    }
    let _ = send.finish();
}

async fn read_loop(mut recv: quinn::RecvStream, frames: mpsc::Sender<Frame>) {
    while let Ok(Some(frame)) = skein_core::read_frame(&mut recv).await {
        if frames.send(frame).await.is_err() {
            return;
        }
    }
}

/// Client config that accepts any certificate.
///
/// Workers run with self-signed certificates by default. Development only.
fn insecure_client_config() -> Result<ClientConfig, TransportError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut crypto = rustls::ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| TransportError::Connection(format!("tls config: {e}")))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(InsecureCertVerifier))
        .with_no_client_auth();
    crypto.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];

    let quic = quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
        .map_err(|e| TransportError::Connection(format!("quic tls config: {e}")))?;
    let mut config = ClientConfig::new(Arc::new(quic));

    let mut transport = quinn::TransportConfig::default();
    let idle = MAX_IDLE_TIMEOUT
        .try_into()
        .map_err(|e| TransportError::Connection(format!("idle timeout: {e}")))?;
    transport.max_idle_timeout(Some(idle));
    config.transport_config(Arc::new(transport));

    Ok(config)
}

#[derive(Debug)]
struct InsecureCertVerifier;

impl rustls::client::danger::ServerCertVerifier for InsecureCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider().signature_verification_algorithms.supported_schemes()
    }
}
