//! Dialing the gateway over TCP or TLS

use crate::config::TlsClientConfig;
use crate::{TransportError, TransportResult};
use std::fmt;
use std::str::FromStr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, info};

const DEFAULT_TLS_PORT: u16 = 443;

/// Byte stream the mux can run over
pub trait AsyncIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncIo for T {}

pub type BoxedIo = Box<dyn AsyncIo>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayScheme {
    Tcp,
    Tls,
}

/// `tcp://host:port` or `tls://host[:port]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayAddress {
    pub scheme: GatewayScheme,
    pub host: String,
    pub port: u16,
}

impl GatewayAddress {
    pub fn parse(raw: &str) -> TransportResult<Self> {
        let url = url::Url::parse(raw)
            .map_err(|e| TransportError::InvalidAddress(format!("{}: {}", raw, e)))?;

        let scheme = match url.scheme() {
            "tcp" => GatewayScheme::Tcp,
            "tls" => GatewayScheme::Tls,
            other => {
                return Err(TransportError::InvalidAddress(format!(
                    "unsupported scheme {:?}, expected tcp or tls",
                    other
                )))
            }
        };

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| TransportError::InvalidAddress(format!("{}: missing host", raw)))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();

        let port = match (scheme, url.port()) {
            (_, Some(port)) => port,
            (GatewayScheme::Tls, None) => DEFAULT_TLS_PORT,
            (GatewayScheme::Tcp, None) => {
                return Err(TransportError::InvalidAddress(format!(
                    "{}: tcp addresses need a port",
                    raw
                )))
            }
        };

        Ok(Self { scheme, host, port })
    }

    pub fn socket_addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for GatewayAddress {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for GatewayAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = match self.scheme {
            GatewayScheme::Tcp => "tcp",
            GatewayScheme::Tls => "tls",
        };
        write!(f, "{}://{}", scheme, self.socket_addr())
    }
}

/// An established byte stream to the gateway
pub struct Connected {
    pub io: BoxedIo,
    /// The gateway identity was already verified by the transport (TLS with
    /// certificate verification), so host-key pinning may be skipped.
    pub transport_authenticated: bool,
    pub peer: String,
}

impl fmt::Debug for Connected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connected")
            .field("transport_authenticated", &self.transport_authenticated)
            .field("peer", &self.peer)
            .finish()
    }
}

/// Open a byte stream to the gateway
pub async fn connect(address: &GatewayAddress, tls: &TlsClientConfig) -> TransportResult<Connected> {
    debug!("Connecting to gateway at {}", address);

    let tcp = TcpStream::connect(address.socket_addr()).await?;
    tcp.set_nodelay(true)?;
    let peer = tcp
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| address.socket_addr());

    match address.scheme {
        GatewayScheme::Tcp => {
            info!("Connected to gateway at {} (plain TCP)", peer);
            Ok(Connected {
                io: Box::new(tcp),
                transport_authenticated: false,
                peer,
            })
        }
        GatewayScheme::Tls => {
            let connector = tls.build_connector()?;
            let sni = tls.server_name.clone().unwrap_or_else(|| address.host.clone());
            let server_name = rustls::pki_types::ServerName::try_from(sni.clone())
                .map_err(|e| TransportError::Tls(format!("Invalid server name {}: {}", sni, e)))?;

            let stream = connector
                .connect(server_name, tcp)
                .await
                .map_err(|e| TransportError::Tls(format!("TLS handshake failed: {}", e)))?;

            info!("Connected to gateway at {} (TLS)", peer);
            Ok(Connected {
                io: Box::new(stream),
                transport_authenticated: tls.verify_server_cert,
                peer,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tcp_requires_port() {
        let addr = GatewayAddress::parse("tcp://127.0.0.1:4443").unwrap();
        assert_eq!(addr.scheme, GatewayScheme::Tcp);
        assert_eq!(addr.socket_addr(), "127.0.0.1:4443");
        assert!(GatewayAddress::parse("tcp://gw.example.com").is_err());
    }

    #[test]
    fn test_parse_tls_default_port() {
        let addr: GatewayAddress = "tls://gw.example.com".parse().unwrap();
        assert_eq!(addr.scheme, GatewayScheme::Tls);
        assert_eq!(addr.port, 443);
        assert_eq!(addr.to_string(), "tls://gw.example.com:443");
    }

    #[test]
    fn test_parse_rejects_other_schemes() {
        assert!(matches!(
            GatewayAddress::parse("http://gw.example.com"),
            Err(TransportError::InvalidAddress(_))
        ));
        assert!(GatewayAddress::parse("not a url").is_err());
    }

    #[tokio::test]
    async fn test_connect_plain_tcp() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });

        let addr = GatewayAddress::parse(&format!("tcp://127.0.0.1:{}", port)).unwrap();
        let connected = connect(&addr, &TlsClientConfig::default()).await.unwrap();
        assert!(!connected.transport_authenticated);
        accept.await.unwrap();
    }
}
