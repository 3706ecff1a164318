//! Outbound connection establishment
//!
//! A [`Transport`] is a TLS stream to one `(host, port)`, either connected
//! directly or tunneled through an HTTP proxy with `CONNECT`. Transports are
//! owned by exactly one request driver invocation and never shared.

pub mod tls;
pub mod tunnel;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, lookup_host};
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tracing::{info, warn};

use crate::config::NetworkConfig;
use crate::error::{BridgeError, ConnectStage, Result};
use crate::metrics::BRIDGE_METRICS;
use crate::proxy::ProxySpec;

/// Established, TLS-wrapped byte stream
pub type Transport = TlsStream<TcpStream>;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Something that can hand out fresh transports for one target
///
/// The request driver asks for a new transport for every attempt, which is
/// what makes the one-shot reconnect possible.
pub trait Connector: Send + Sync {
    type Transport: AsyncRead + AsyncWrite + Unpin + Send;

    fn connect(&self) -> impl Future<Output = Result<Self::Transport>> + Send;
}

/// Opens transports, optionally through an HTTP proxy
#[derive(Clone)]
pub struct Establisher {
    tls: TlsConnector,
    proxy: Option<ProxySpec>,
    connect_timeout: Duration,
}

impl Establisher {
    pub fn new(proxy: Option<ProxySpec>) -> Result<Self> {
        Ok(Self {
            tls: tls::insecure_connector()?,
            proxy,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        })
    }

    pub fn from_config(config: &NetworkConfig) -> Result<Self> {
        Ok(Self::new(config.proxy()?)?.with_connect_timeout(config.connect_timeout()))
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn proxy(&self) -> Option<&ProxySpec> {
        self.proxy.as_ref()
    }

    /// Bind this establisher to a target, producing a [`Connector`]
    pub fn endpoint(self: &Arc<Self>, host: impl Into<String>, port: u16) -> Endpoint {
        Endpoint {
            establisher: Arc::clone(self),
            host: host.into(),
            port,
        }
    }

    /// Open a TLS transport to `host:port`. No retries happen here.
    pub async fn establish(&self, host: &str, port: u16) -> Result<Transport> {
        let result = match &self.proxy {
            None => self.establish_direct(host, port).await,
            Some(proxy) => self.establish_tunneled(proxy, host, port).await,
        };

        match &result {
            Ok(_) => BRIDGE_METRICS.record_connection(),
            Err(e) => {
                BRIDGE_METRICS.record_connection_failure();
                warn!(host, port, error = %e, "failed to establish transport");
            }
        }
        result
    }

    async fn establish_direct(&self, host: &str, port: u16) -> Result<Transport> {
        let addrs = resolve(host, port).await?;
        info!(host, port, endpoints = ?addrs, "resolved target");

        // the deadline only covers connecting; an open stream may idle freely
        let tcp = tokio::time::timeout(self.connect_timeout, connect_any(&addrs))
            .await
            .map_err(|_| {
                BridgeError::connection(
                    ConnectStage::Connect,
                    format!(
                        "connect to {}:{} timed out after {:?}",
                        host, port, self.connect_timeout
                    ),
                )
            })??;

        self.handshake(host, tcp).await
    }

    async fn establish_tunneled(
        &self,
        proxy: &ProxySpec,
        host: &str,
        port: u16,
    ) -> Result<Transport> {
        info!(proxy = %proxy, host, port, "CONNECT through http proxy");

        let addrs = resolve(&proxy.host, proxy.port).await?;
        let mut tcp = connect_any(&addrs).await?;

        let authorization = proxy.authorization();
        tunnel::open_tunnel(&mut tcp, host, port, authorization.as_deref()).await?;

        self.handshake(host, tcp).await
    }

    async fn handshake(&self, host: &str, tcp: TcpStream) -> Result<Transport> {
        let name = tls::server_name(host)?;
        self.tls
            .connect(name, tcp)
            .await
            .map_err(|e| BridgeError::connection(ConnectStage::Handshake, e))
    }
}

/// Establish a transport with default settings
pub async fn establish(host: &str, port: u16, proxy: Option<ProxySpec>) -> Result<Transport> {
    Establisher::new(proxy)?.establish(host, port).await
}

async fn resolve(host: &str, port: u16) -> Result<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = lookup_host((host, port))
        .await
        .map_err(|e| BridgeError::connection(ConnectStage::Resolve, format!("{}: {}", host, e)))?
        .collect();

    if addrs.is_empty() {
        return Err(BridgeError::connection(
            ConnectStage::Resolve,
            format!("{} resolved to no addresses", host),
        ));
    }
    Ok(addrs)
}

/// Try each resolved address in order, keeping the last failure
async fn connect_any(addrs: &[SocketAddr]) -> Result<TcpStream> {
    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                return Ok(stream);
            }
            Err(e) => last_error = Some(format!("{}: {}", addr, e)),
        }
    }
    Err(BridgeError::connection(
        ConnectStage::Connect,
        last_error.unwrap_or_else(|| "no address to connect to".to_string()),
    ))
}

/// An establisher bound to one target
#[derive(Clone)]
pub struct Endpoint {
    establisher: Arc<Establisher>,
    host: String,
    port: u16,
}

impl Endpoint {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Connector for Endpoint {
    type Transport = Transport;

    fn connect(&self) -> impl Future<Output = Result<Transport>> + Send {
        self.establisher.establish(&self.host, self.port)
    }
}
