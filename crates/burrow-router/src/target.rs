//! Where a tunnel's traffic goes

use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Byte stream to a tunnel target
pub trait TargetIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> TargetIo for T {}

pub type TargetStream = Box<dyn TargetIo>;

/// Opens connections to the service behind a tunnel
#[async_trait]
pub trait TunnelTarget: Send + Sync {
    async fn connect(&self) -> io::Result<TargetStream>;

    /// Short description for logs
    fn describe(&self) -> String;
}

/// A directly reachable TCP service
#[derive(Debug, Clone)]
pub struct TcpTarget {
    addr: String,
}

impl TcpTarget {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl TunnelTarget for TcpTarget {
    async fn connect(&self) -> io::Result<TargetStream> {
        let stream = TcpStream::connect(&self.addr).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.addr)
    }
}
