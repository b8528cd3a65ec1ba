// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! QUIC server helpers for the coordinator engine.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use quinn::{Endpoint, Incoming, RecvStream, SendStream, ServerConfig, TransportConfig};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, instrument, warn};

use crate::frame::{Frame, FrameError, read_frame, write_frame};

/// Errors that can occur in the QUIC server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("bind error: {0}")]
    Bind(#[from] std::io::Error),

    #[error("connection error: {0}")]
    Connection(#[from] quinn::ConnectionError),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("invalid transport setting: {0}")]
    Transport(String),
}

/// Configuration for the QUIC server
#[derive(Debug, Clone)]
pub struct EngineServerConfig {
    pub bind_addr: SocketAddr,
    /// TLS certificate chain (PEM)
    pub cert_pem: Vec<u8>,
    /// TLS private key (PEM)
    pub key_pem: Vec<u8>,
    /// Maximum pending handshakes
    pub max_incoming: u32,
    /// Maximum concurrent bidirectional streams per connection.
    /// Each attached agent holds one stream open for its whole session.
    pub max_bi_streams: u32,
    pub idle_timeout_ms: u64,
    /// Server-side keep-alive interval (0 to disable)
    pub keep_alive_interval_ms: u64,
    /// UDP buffer sizes in bytes (0 for OS default)
    pub udp_receive_buffer_size: usize,
    pub udp_send_buffer_size: usize,
    /// Maximum concurrent connection handlers (0 for unlimited)
    pub max_concurrent_handlers: u32,
}

impl Default for EngineServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8001)),
            cert_pem: Vec::new(),
            key_pem: Vec::new(),
            max_incoming: 10_000,
            max_bi_streams: 1_000,
            idle_timeout_ms: 120_000,
            keep_alive_interval_ms: 15_000,
            udp_receive_buffer_size: 2 * 1024 * 1024,
            udp_send_buffer_size: 2 * 1024 * 1024,
            max_concurrent_handlers: 0,
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl EngineServerConfig {
    /// Transport tuning from environment variables, falling back to defaults.
    ///
    /// - `TCC_QUIC_MAX_INCOMING` (10000)
    /// - `TCC_QUIC_MAX_BI_STREAMS` (1000)
    /// - `TCC_QUIC_IDLE_TIMEOUT_MS` (120000)
    /// - `TCC_QUIC_KEEP_ALIVE_MS` (15000, 0 disables)
    /// - `TCC_QUIC_UDP_RECV_BUFFER` / `TCC_QUIC_UDP_SEND_BUFFER` (2097152)
    /// - `TCC_QUIC_MAX_HANDLERS` (0, unlimited)
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_incoming: env_or("TCC_QUIC_MAX_INCOMING", d.max_incoming),
            max_bi_streams: env_or("TCC_QUIC_MAX_BI_STREAMS", d.max_bi_streams),
            idle_timeout_ms: env_or("TCC_QUIC_IDLE_TIMEOUT_MS", d.idle_timeout_ms),
            keep_alive_interval_ms: env_or("TCC_QUIC_KEEP_ALIVE_MS", d.keep_alive_interval_ms),
            udp_receive_buffer_size: env_or("TCC_QUIC_UDP_RECV_BUFFER", d.udp_receive_buffer_size),
            udp_send_buffer_size: env_or("TCC_QUIC_UDP_SEND_BUFFER", d.udp_send_buffer_size),
            max_concurrent_handlers: env_or("TCC_QUIC_MAX_HANDLERS", d.max_concurrent_handlers),
            ..d
        }
    }
}

/// QUIC endpoint accepting agent and caller connections.
pub struct EngineServer {
    endpoint: Endpoint,
    config: EngineServerConfig,
}

impl EngineServer {
    pub fn new(config: EngineServerConfig) -> Result<Self, ServerError> {
        use socket2::{Domain, Protocol, Socket, Type};

        let server_config = Self::build_server_config(&config)?;

        let domain = if config.bind_addr.is_ipv6() {
            Domain::IPV6
        } else {
            Domain::IPV4
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

        if config.udp_receive_buffer_size > 0 {
            if let Err(e) = socket.set_recv_buffer_size(config.udp_receive_buffer_size) {
                warn!(size = config.udp_receive_buffer_size, error = %e, "Failed to set UDP receive buffer size");
            }
        }
        if config.udp_send_buffer_size > 0 {
            if let Err(e) = socket.set_send_buffer_size(config.udp_send_buffer_size) {
                warn!(size = config.udp_send_buffer_size, error = %e, "Failed to set UDP send buffer size");
            }
        }

        socket.bind(&config.bind_addr.into())?;
        let std_socket: std::net::UdpSocket = socket.into();

        let runtime = quinn::default_runtime()
            .ok_or_else(|| ServerError::Bind(std::io::Error::other("no async runtime found")))?;
        let endpoint = Endpoint::new_with_abstract_socket(
            quinn::EndpointConfig::default(),
            Some(server_config),
            runtime.wrap_udp_socket(std_socket)?,
            runtime,
        )?;

        info!(
            addr = %config.bind_addr,
            max_bi_streams = config.max_bi_streams,
            idle_timeout_ms = config.idle_timeout_ms,
            max_handlers = config.max_concurrent_handlers,
            "QUIC server bound"
        );

        Ok(Self { endpoint, config })
    }

    /// Server with a self-signed certificate for `localhost`.
    pub fn localhost(bind_addr: SocketAddr) -> Result<Self, ServerError> {
        Self::localhost_with_config(bind_addr, EngineServerConfig::from_env())
    }

    pub fn localhost_with_config(
        bind_addr: SocketAddr,
        mut config: EngineServerConfig,
    ) -> Result<Self, ServerError> {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
            .map_err(|e| ServerError::Tls(e.to_string()))?;

        config.bind_addr = bind_addr;
        config.cert_pem = cert.cert.pem().into_bytes();
        config.key_pem = cert.key_pair.serialize_pem().into_bytes();

        Self::new(config)
    }

    pub fn config(&self) -> &EngineServerConfig {
        &self.config
    }

    fn build_server_config(config: &EngineServerConfig) -> Result<ServerConfig, ServerError> {
        let certs = rustls_pemfile::certs(&mut config.cert_pem.as_slice())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ServerError::Tls(format!("failed to parse certificates: {}", e)))?;

        let key = rustls_pemfile::private_key(&mut config.key_pem.as_slice())
            .map_err(|e| ServerError::Tls(format!("failed to parse private key: {}", e)))?
            .ok_or_else(|| ServerError::Tls("no private key found".to_string()))?;

        let crypto = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| ServerError::Tls(e.to_string()))?;

        let idle: quinn::IdleTimeout = Duration::from_millis(config.idle_timeout_ms)
            .try_into()
            .map_err(|_| ServerError::Transport(format!("idle timeout {}ms", config.idle_timeout_ms)))?;

        let mut transport = TransportConfig::default();
        transport.max_idle_timeout(Some(idle));
        transport.max_concurrent_bidi_streams(config.max_bi_streams.into());
        transport.max_concurrent_uni_streams(0u32.into());
        if config.keep_alive_interval_ms > 0 {
            transport.keep_alive_interval(Some(Duration::from_millis(
                config.keep_alive_interval_ms,
            )));
        }

        let mut server_config = ServerConfig::with_crypto(Arc::new(
            quinn::crypto::rustls::QuicServerConfig::try_from(crypto)
                .map_err(|e| ServerError::Tls(e.to_string()))?,
        ));
        server_config.transport_config(Arc::new(transport));
        server_config.max_incoming(config.max_incoming as usize);

        Ok(server_config)
    }

    pub async fn accept(&self) -> Option<Incoming> {
        self.endpoint.accept().await
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.endpoint.local_addr()?)
    }

    pub fn close(&self) {
        self.endpoint.close(0u32.into(), b"server closing");
    }

    /// Accept connections until the endpoint is closed, spawning `handler`
    /// for each one.
    #[instrument(skip(self, handler))]
    pub async fn run<H, Fut>(&self, handler: H) -> Result<(), ServerError>
    where
        H: Fn(ConnectionHandler) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        info!("QUIC server running");

        let semaphore = (self.config.max_concurrent_handlers > 0)
            .then(|| Arc::new(Semaphore::new(self.config.max_concurrent_handlers as usize)));

        while let Some(incoming) = self.accept().await {
            let handler = handler.clone();
            let semaphore = semaphore.clone();

            tokio::spawn(async move {
                let _permit = match semaphore {
                    Some(sem) => match sem.acquire_owned().await {
                        Ok(permit) => Some(permit),
                        Err(_) => {
                            warn!("semaphore closed, dropping connection");
                            return;
                        }
                    },
                    None => None,
                };

                match incoming.await {
                    Ok(connection) => {
                        debug!(remote_addr = %connection.remote_address(), "accepted connection");
                        handler(ConnectionHandler::new(connection)).await;
                    }
                    Err(e) => warn!("failed to accept connection: {}", e),
                }
            });
        }

        Ok(())
    }
}

/// Handler for an individual QUIC connection
pub struct ConnectionHandler {
    connection: quinn::Connection,
}

impl ConnectionHandler {
    pub fn new(connection: quinn::Connection) -> Self {
        Self { connection }
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.connection.remote_address()
    }

    pub async fn accept_bi(&self) -> Result<(SendStream, RecvStream), ServerError> {
        Ok(self.connection.accept_bi().await?)
    }

    /// Accept bidirectional streams until the connection closes, spawning
    /// `handler` for each.
    #[instrument(skip(self, handler), fields(remote = %self.remote_address()))]
    pub async fn run<H, Fut>(&self, handler: H)
    where
        H: Fn(StreamHandler) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        loop {
            match self.accept_bi().await {
                Ok((send, recv)) => {
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        handler(StreamHandler::new(send, recv)).await;
                    });
                }
                Err(ServerError::Connection(
                    quinn::ConnectionError::ApplicationClosed(_)
                    | quinn::ConnectionError::LocallyClosed,
                )) => {
                    debug!("connection closed");
                    break;
                }
                Err(e) => {
                    error!("error accepting stream: {}", e);
                    break;
                }
            }
        }
    }

    pub fn is_open(&self) -> bool {
        self.connection.close_reason().is_none()
    }

    pub fn close(&self, code: u32, reason: &[u8]) {
        self.connection.close(code.into(), reason);
    }
}

/// One bidirectional stream: one unary call or one agent push session.
pub struct StreamHandler {
    send: SendStream,
    recv: RecvStream,
}

impl StreamHandler {
    pub fn new(send: SendStream, recv: RecvStream) -> Self {
        Self { send, recv }
    }

    pub async fn read_frame(&mut self) -> Result<Frame, ServerError> {
        Ok(read_frame(&mut self.recv).await?)
    }

    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), ServerError> {
        Ok(write_frame(&mut self.send, frame).await?)
    }

    /// Signal that no more frames will be written.
    pub fn finish(&mut self) -> Result<(), ServerError> {
        self.send
            .finish()
            .map_err(|e| ServerError::Frame(FrameError::Io(std::io::Error::other(e))))
    }

    /// Split into raw halves for long-lived push sessions.
    pub fn into_parts(self) -> (SendStream, RecvStream) {
        (self.send, self.recv)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineServerConfig::default();
        assert_eq!(config.bind_addr.port(), 8001);
        assert!(config.cert_pem.is_empty());
        assert_eq!(config.max_bi_streams, 1_000);
        assert_eq!(config.keep_alive_interval_ms, 15_000);
        assert_eq!(config.max_concurrent_handlers, 0);
    }

    #[tokio::test]
    async fn test_server_localhost_assigns_port() {
        let server = EngineServer::localhost("127.0.0.1:0".parse().unwrap()).unwrap();
        assert!(server.local_addr().unwrap().port() > 0);
    }

    #[tokio::test]
    async fn test_server_accept_after_close() {
        let server = EngineServer::localhost("127.0.0.1:0".parse().unwrap()).unwrap();
        server.close();
        assert!(server.accept().await.is_none());
    }

    #[test]
    fn test_build_server_config_requires_key() {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let config = EngineServerConfig {
            cert_pem: cert.cert.pem().into_bytes(),
            key_pem: Vec::new(),
            ..Default::default()
        };
        assert!(matches!(
            EngineServer::build_server_config(&config),
            Err(ServerError::Tls(_))
        ));
    }

    #[test]
    fn test_build_server_config_valid() {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let config = EngineServerConfig {
            cert_pem: cert.cert.pem().into_bytes(),
            key_pem: cert.key_pair.serialize_pem().into_bytes(),
            keep_alive_interval_ms: 0,
            ..Default::default()
        };
        assert!(EngineServer::build_server_config(&config).is_ok());
    }

    #[test]
    fn test_server_with_invalid_cert() {
        let config = EngineServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            cert_pem: b"invalid-cert".to_vec(),
            key_pem: b"invalid-key".to_vec(),
            ..Default::default()
        };
        assert!(EngineServer::new(config).is_err());
    }
}
