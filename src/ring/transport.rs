//! Mutual TLS over TCP.
//!
//! Both directions are authenticated against the ring CA: a node accepts
//! inbound hops with its server certificate and requires a client
//! certificate, and sends outbound hops with its client certificate. The
//! handshake always runs to completion before any payload byte moves.

use crate::ring::codec::{self, DecodeError};
use crate::ring::config::TimingConfig;
use crate::ring::types::{PkiPaths, RoundMessage};
use rustls::server::AllowAnyAuthenticatedClient;
use rustls::{
    Certificate, ClientConfig, ClientConnection, PrivateKey, RootCertStore, ServerConfig,
    ServerConnection, ServerName, StreamOwned,
};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, BufReader, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub type ServerStream = StreamOwned<ServerConnection, TcpStream>;
pub type ClientStream = StreamOwned<ClientConnection, TcpStream>;

/// Problems with local trust material. Fatal at start-up.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to read {}: {source}", .path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("no certificates found in {}", .0.display())]
    NoCertificates(PathBuf),
    #[error("no private key found in {}", .0.display())]
    NoPrivateKey(PathBuf),
    #[error("CA certificate in {} rejected: {reason}", .path.display())]
    BadCa { path: PathBuf, reason: String },
    #[error("invalid server name {0:?}")]
    ServerName(String),
    #[error("tls configuration rejected: {0}")]
    Config(#[from] rustls::Error),
}

/// A hop could not be authenticated. The connection is closed and nothing
/// read from it is used.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("tcp connect to {addr} failed: {source}")]
    Connect { addr: SocketAddr, source: io::Error },
    #[error("peer presented no certificate")]
    MissingCertificate,
    #[error("peer certificate rejected: {0}")]
    UntrustedCertificate(String),
    #[error("peer aborted the handshake: {0}")]
    PeerRejected(String),
    #[error("tls failure: {0}")]
    Tls(String),
    #[error("handshake i/o failed: {0}")]
    Io(#[source] io::Error),
}

impl HandshakeError {
    fn from_io(err: io::Error) -> Self {
        let classified = match err
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<rustls::Error>())
        {
            Some(rustls::Error::NoCertificatesPresented) => {
                Some(HandshakeError::MissingCertificate)
            }
            Some(rustls::Error::InvalidCertificate(reason)) => Some(
                HandshakeError::UntrustedCertificate(format!("{:?}", reason)),
            ),
            Some(rustls::Error::AlertReceived(alert)) => {
                Some(HandshakeError::PeerRejected(format!("{:?}", alert)))
            }
            Some(other) => Some(HandshakeError::Tls(other.to_string())),
            None => None,
        };
        classified.unwrap_or_else(|| HandshakeError::Io(err))
    }
}

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("cannot resolve successor address {0}")]
    Resolve(String),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error("send failed: {0}")]
    Send(#[source] io::Error),
    #[error("successor did not acknowledge: {0}")]
    NotAcknowledged(#[source] DecodeError),
}

impl ForwardError {
    fn from_io(err: io::Error) -> Self {
        match HandshakeError::from_io(err) {
            HandshakeError::Io(err) => ForwardError::Send(err),
            other => ForwardError::Handshake(other),
        }
    }
}

pub struct TlsIdentity {
    pub cert_chain: Vec<Certificate>,
    pub key: PrivateKey,
}

pub fn load_certs(path: &Path) -> Result<Vec<Certificate>, TransportError> {
    let mut reader = open(path)?;
    let certs = rustls_pemfile::certs(&mut reader).map_err(|source| TransportError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    if certs.is_empty() {
        return Err(TransportError::NoCertificates(path.to_path_buf()));
    }
    Ok(certs.into_iter().map(Certificate).collect())
}

/// First PKCS#8, SEC1 or PKCS#1 key in the file.
pub fn load_private_key(path: &Path) -> Result<PrivateKey, TransportError> {
    let mut reader = open(path)?;
    let items = rustls_pemfile::read_all(&mut reader).map_err(|source| TransportError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    for item in items {
        match item {
            rustls_pemfile::Item::PKCS8Key(key)
            | rustls_pemfile::Item::ECKey(key)
            | rustls_pemfile::Item::RSAKey(key) => return Ok(PrivateKey(key)),
            _ => {}
        }
    }
    Err(TransportError::NoPrivateKey(path.to_path_buf()))
}

pub fn load_identity(cert_path: &Path, key_path: &Path) -> Result<TlsIdentity, TransportError> {
    Ok(TlsIdentity {
        cert_chain: load_certs(cert_path)?,
        key: load_private_key(key_path)?,
    })
}

pub fn load_roots(ca_path: &Path) -> Result<RootCertStore, TransportError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(ca_path)? {
        roots.add(&cert).map_err(|e| TransportError::BadCa {
            path: ca_path.to_path_buf(),
            reason: format!("{:?}", e),
        })?;
    }
    Ok(roots)
}

fn open(path: &Path) -> Result<BufReader<File>, TransportError> {
    let file = File::open(path).map_err(|source| TransportError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(BufReader::new(file))
}

/// Inbound side: presents the server certificate, demands a client one.
#[derive(Clone)]
pub struct ServerTls {
    config: Arc<ServerConfig>,
}

impl ServerTls {
    pub fn new(roots: RootCertStore, identity: TlsIdentity) -> Result<Self, TransportError> {
        let config = ServerConfig::builder()
            .with_safe_defaults()
            .with_client_cert_verifier(Arc::new(AllowAnyAuthenticatedClient::new(roots)))
            .with_single_cert(identity.cert_chain, identity.key)?;
        Ok(Self {
            config: Arc::new(config),
        })
    }

    pub fn accept(
        &self,
        mut tcp: TcpStream,
        io_timeout: Duration,
    ) -> Result<ServerStream, HandshakeError> {
        // accepted sockets inherit non-blocking mode on some platforms
        tcp.set_nonblocking(false).map_err(HandshakeError::Io)?;
        set_io_timeouts(&tcp, io_timeout)?;
        let mut conn = ServerConnection::new(Arc::clone(&self.config))
            .map_err(|e| HandshakeError::Tls(e.to_string()))?;
        while conn.is_handshaking() {
            conn.complete_io(&mut tcp).map_err(HandshakeError::from_io)?;
        }
        if conn.peer_certificates().map_or(true, |certs| certs.is_empty()) {
            return Err(HandshakeError::MissingCertificate);
        }
        Ok(StreamOwned::new(conn, tcp))
    }
}

/// Outbound side: verifies the server against the ring CA.
#[derive(Clone)]
pub struct ClientTls {
    config: Arc<ClientConfig>,
    server_name: ServerName,
}

impl ClientTls {
    /// `identity` is the node's client certificate. `None` yields an
    /// anonymous client, which every ring node refuses.
    pub fn new(
        roots: RootCertStore,
        identity: Option<TlsIdentity>,
        server_name: &str,
    ) -> Result<Self, TransportError> {
        let builder = ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(roots);
        let config = match identity {
            Some(id) => builder.with_client_auth_cert(id.cert_chain, id.key)?,
            None => builder.with_no_client_auth(),
        };
        let server_name = ServerName::try_from(server_name)
            .map_err(|_| TransportError::ServerName(server_name.to_string()))?;
        Ok(Self {
            config: Arc::new(config),
            server_name,
        })
    }

    pub fn connect(
        &self,
        addr: SocketAddr,
        timing: &TimingConfig,
    ) -> Result<ClientStream, HandshakeError> {
        let mut tcp = TcpStream::connect_timeout(&addr, timing.connect_timeout())
            .map_err(|source| HandshakeError::Connect { addr, source })?;
        set_io_timeouts(&tcp, timing.io_timeout())?;
        let mut conn = ClientConnection::new(Arc::clone(&self.config), self.server_name.clone())
            .map_err(|e| HandshakeError::Tls(e.to_string()))?;
        while conn.is_handshaking() {
            conn.complete_io(&mut tcp).map_err(HandshakeError::from_io)?;
        }
        Ok(StreamOwned::new(conn, tcp))
    }
}

/// Both halves of a node's transport.
#[derive(Clone)]
pub struct TlsContext {
    pub server: ServerTls,
    pub client: ClientTls,
}

impl TlsContext {
    pub fn from_pki(paths: &PkiPaths, server_name: &str) -> Result<Self, TransportError> {
        let roots = load_roots(&paths.ca_cert)?;
        let server = ServerTls::new(
            roots.clone(),
            load_identity(&paths.server_cert, &paths.server_key)?,
        )?;
        let client = ClientTls::new(
            roots,
            Some(load_identity(&paths.client_cert, &paths.client_key)?),
            server_name,
        )?;
        Ok(Self { server, client })
    }
}

/// Sends one message and waits for the receiver's acknowledgement. Only an
/// acknowledged hop counts as delivered.
pub fn deliver(
    client: &ClientTls,
    address: &str,
    msg: &RoundMessage,
    timing: &TimingConfig,
) -> Result<(), ForwardError> {
    let addr = address
        .to_socket_addrs()
        .map_err(|_| ForwardError::Resolve(address.to_string()))?
        .next()
        .ok_or_else(|| ForwardError::Resolve(address.to_string()))?;
    let mut stream = client.connect(addr, timing)?;
    codec::write_message(&mut stream, msg).map_err(ForwardError::from_io)?;
    match codec::read_ack(&mut stream) {
        Ok(_) => {}
        Err(DecodeError::Io(err)) => return Err(ForwardError::from_io(err)),
        Err(other) => return Err(ForwardError::NotAcknowledged(other)),
    }
    stream.conn.send_close_notify();
    let _ = stream.flush();
    Ok(())
}

/// Hex SHA-256 of the authenticated client's leaf certificate.
pub fn peer_fingerprint(stream: &ServerStream) -> Option<String> {
    let leaf = stream.conn.peer_certificates()?.first()?;
    Some(hex::encode(Sha256::digest(&leaf.0)))
}

fn set_io_timeouts(tcp: &TcpStream, timeout: Duration) -> Result<(), HandshakeError> {
    tcp.set_read_timeout(Some(timeout)).map_err(HandshakeError::Io)?;
    tcp.set_write_timeout(Some(timeout)).map_err(HandshakeError::Io)?;
    Ok(())
}
