use crate::error::NodeError;
use crate::token::TokenManager;
use async_trait::async_trait;
use common::{CertBundle, ControlReply, ControlRequest, EnableRequest, KeepAliveRequest,
    PortCheckRequest};
use quinn::crypto::rustls::QuicClientConfig;
use quinn::{ClientConfig as QuinnClientConfig, Connection, Endpoint};
use rustls::DigitallySignedStruct;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig as RustlsClientConfig, RootCertStore, SignatureScheme};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::time;
use tracing::{info, warn};

const CONNECT_RETRIES: usize = 3;
const CONNECT_BACKOFF: Duration = Duration::from_secs(2);
const RPC_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_REPLY_BYTES: usize = 1024 * 1024;

/// Emitted when the channel re-establishes a dropped connection; the
/// controller re-issues its enable on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelEvent {
    Reconnected,
}

/// RPC surface of the control plane as seen by the node. Implemented over
/// QUIC in production and mocked in tests.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Establish the transport and authenticate. Optional: every RPC does
    /// this lazily, but calling it up front surfaces failures early.
    async fn connect(&self) -> Result<(), NodeError> {
        Ok(())
    }

    async fn enable(&self, request: EnableRequest) -> Result<(), NodeError>;

    async fn disable(&self) -> Result<(), NodeError>;

    /// Tear down any live transport so the next RPC performs a fresh
    /// handshake instead of reusing a possibly stale session.
    async fn reset(&self) {}

    async fn port_check(&self, request: PortCheckRequest) -> Result<(), NodeError>;

    async fn request_cert(&self) -> Result<CertBundle, NodeError>;

    /// `Ok(None)` means the control plane no longer knows this node and the
    /// caller must re-register.
    async fn keep_alive(
        &self,
        request: KeepAliveRequest,
        timeout: Duration,
    ) -> Result<Option<i64>, NodeError>;

    async fn close(&self);
}

/// Skip certificate verification
#[derive(Debug)]
struct SkipServerVerification;

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::RSA_PSS_SHA256,
        ]
    }
}

pub fn init_crypto() {
    // idempotent: a second install just reports the existing provider
    let _ = CryptoProvider::install_default(rustls::crypto::ring::default_provider());
}

/// QUIC control channel. Every RPC runs on its own bidirectional stream;
/// the connection itself is lazy and rebuilt on demand after transport
/// failures, announcing each rebuild via [`ChannelEvent::Reconnected`].
pub struct QuicChannel {
    endpoint: Endpoint,
    server_addr: SocketAddr,
    server_name: String,
    tokens: Arc<TokenManager>,
    conn: Mutex<Option<Connection>>,
    events: mpsc::Sender<ChannelEvent>,
    ever_connected: std::sync::atomic::AtomicBool,
}

impl QuicChannel {
    pub fn new(
        server_addr: SocketAddr,
        server_name: String,
        tokens: Arc<TokenManager>,
    ) -> Result<(Self, mpsc::Receiver<ChannelEvent>), NodeError> {
        init_crypto();
        let mut tls = RustlsClientConfig::builder()
            .with_root_certificates(RootCertStore::empty())
            .with_no_client_auth();
        tls.dangerous()
            .set_certificate_verifier(Arc::new(SkipServerVerification));

        let quic_crypto = QuicClientConfig::try_from(tls)
            .map_err(|e| NodeError::Transport(e.to_string()))?;
        let client_cfg = QuinnClientConfig::new(Arc::new(quic_crypto));
        let mut endpoint = Endpoint::client(
            "0.0.0.0:0"
                .parse()
                .map_err(|e: std::net::AddrParseError| NodeError::Transport(e.to_string()))?,
        )?;
        endpoint.set_default_client_config(client_cfg);

        let (tx, rx) = mpsc::channel(8);
        Ok((
            Self {
                endpoint,
                server_addr,
                server_name,
                tokens,
                conn: Mutex::new(None),
                events: tx,
                ever_connected: std::sync::atomic::AtomicBool::new(false),
            },
            rx,
        ))
    }

    /// Return the live connection, establishing one if needed. The first
    /// request on any fresh connection is the token handshake.
    async fn ensure_connected(&self) -> Result<Connection, NodeError> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            if conn.close_reason().is_none() {
                return Ok(conn.clone());
            }
            *guard = None;
        }

        let conn = self.connect_with_retry().await?;
        self.hello(&conn).await?;

        let reconnect = self
            .ever_connected
            .swap(true, std::sync::atomic::Ordering::SeqCst);
        if reconnect {
            info!("control channel re-established");
            let _ = self.events.send(ChannelEvent::Reconnected).await;
        } else {
            info!("control channel established to {}", self.server_addr);
        }
        *guard = Some(conn.clone());
        Ok(conn)
    }

    async fn connect_with_retry(&self) -> Result<Connection, NodeError> {
        let mut last = String::new();
        for attempt in 1..=CONNECT_RETRIES {
            match self.endpoint.connect(self.server_addr, &self.server_name) {
                Ok(connecting) => match connecting.await {
                    Ok(conn) => return Ok(conn),
                    Err(e) => last = e.to_string(),
                },
                Err(e) => last = e.to_string(),
            }
            warn!(
                "connect to {} failed (attempt {attempt}/{CONNECT_RETRIES}): {last}",
                self.server_addr
            );
            if attempt < CONNECT_RETRIES {
                time::sleep(CONNECT_BACKOFF).await;
            }
        }
        Err(NodeError::Transport(format!(
            "could not reach control plane at {}: {last}",
            self.server_addr
        )))
    }

    async fn hello(&self, conn: &Connection) -> Result<(), NodeError> {
        let token = self.tokens.get_token().await?;
        let reply = exchange(conn, &ControlRequest::Hello { token }, RPC_TIMEOUT).await?;
        match reply {
            ControlReply::Ack(true) => Ok(()),
            ControlReply::Ack(false) => Err(NodeError::Auth("handshake refused".into())),
            ControlReply::Err(msg) => Err(NodeError::Auth(msg)),
            other => Err(NodeError::Transport(format!(
                "unexpected handshake reply: {other:?}"
            ))),
        }
    }

    /// One request/reply round trip. Transport failures drop the cached
    /// connection so the next call reconnects.
    async fn call(
        &self,
        request: &ControlRequest,
        timeout: Duration,
    ) -> Result<ControlReply, NodeError> {
        let conn = self.ensure_connected().await?;
        match exchange(&conn, request, timeout).await {
            Ok(reply) => Ok(reply),
            Err(e) => {
                self.conn.lock().await.take();
                Err(e)
            }
        }
    }
}

/// Serialize the request onto a fresh bidirectional stream and read the
/// whole reply, all under one deadline.
async fn exchange(
    conn: &Connection,
    request: &ControlRequest,
    timeout: Duration,
) -> Result<ControlReply, NodeError> {
    let fut = async {
        let (mut send, mut recv) = conn
            .open_bi()
            .await
            .map_err(|e| NodeError::Transport(e.to_string()))?;
        let data = bincode::serialize(request)?;
        send.write_all(&data)
            .await
            .map_err(|e| NodeError::Transport(e.to_string()))?;
        send.finish()
            .map_err(|e| NodeError::Transport(e.to_string()))?;
        let buf = recv
            .read_to_end(MAX_REPLY_BYTES)
            .await
            .map_err(|e| NodeError::Transport(e.to_string()))?;
        Ok::<_, NodeError>(bincode::deserialize::<ControlReply>(&buf)?)
    };
    time::timeout(timeout, fut)
        .await
        .map_err(|_| NodeError::Timeout(timeout))?
}

#[async_trait]
impl ControlPlane for QuicChannel {
    async fn connect(&self) -> Result<(), NodeError> {
        self.ensure_connected().await.map(|_| ())
    }

    /// A deliberate reset is not an unexpected drop: the re-established
    /// connection must not announce `Reconnected`, the caller drives the
    /// re-registration itself.
    async fn reset(&self) {
        if let Some(conn) = self.conn.lock().await.take() {
            conn.close(0u32.into(), b"restart");
        }
        self.ever_connected
            .store(false, std::sync::atomic::Ordering::SeqCst);
    }

    async fn enable(&self, request: EnableRequest) -> Result<(), NodeError> {
        match self.call(&ControlRequest::Enable(request), RPC_TIMEOUT).await? {
            ControlReply::Ack(true) => Ok(()),
            ControlReply::Ack(false) => {
                Err(NodeError::Registration("enable refused".into()))
            }
            ControlReply::Err(msg) => Err(NodeError::Registration(msg)),
            other => Err(NodeError::Transport(format!(
                "unexpected enable reply: {other:?}"
            ))),
        }
    }

    async fn disable(&self) -> Result<(), NodeError> {
        match self.call(&ControlRequest::Disable, RPC_TIMEOUT).await? {
            ControlReply::Ack(_) => Ok(()),
            ControlReply::Err(msg) => Err(NodeError::Transport(msg)),
            other => Err(NodeError::Transport(format!(
                "unexpected disable reply: {other:?}"
            ))),
        }
    }

    async fn port_check(&self, request: PortCheckRequest) -> Result<(), NodeError> {
        match self
            .call(&ControlRequest::PortCheck(request), RPC_TIMEOUT)
            .await?
        {
            ControlReply::Ack(true) => Ok(()),
            ControlReply::Ack(false) => Err(NodeError::Registration(
                "port unreachable from control plane".into(),
            )),
            ControlReply::Err(msg) => Err(NodeError::Registration(msg)),
            other => Err(NodeError::Transport(format!(
                "unexpected port check reply: {other:?}"
            ))),
        }
    }

    async fn request_cert(&self) -> Result<CertBundle, NodeError> {
        match self.call(&ControlRequest::RequestCert, RPC_TIMEOUT).await? {
            ControlReply::Cert(bundle) => Ok(bundle),
            ControlReply::Err(msg) => Err(NodeError::Registration(msg)),
            other => Err(NodeError::Transport(format!(
                "unexpected certificate reply: {other:?}"
            ))),
        }
    }

    async fn keep_alive(
        &self,
        request: KeepAliveRequest,
        timeout: Duration,
    ) -> Result<Option<i64>, NodeError> {
        match self
            .call(&ControlRequest::KeepAlive(request), timeout)
            .await?
        {
            ControlReply::KeepAliveAck { server_time } => Ok(server_time),
            ControlReply::Err(msg) => Err(NodeError::Keepalive(msg)),
            other => Err(NodeError::Transport(format!(
                "unexpected keepalive reply: {other:?}"
            ))),
        }
    }

    async fn close(&self) {
        if let Some(conn) = self.conn.lock().await.take() {
            conn.close(0u32.into(), b"shutdown");
        }
        self.endpoint.wait_idle().await;
    }
}
