//! Tunnel target reached through the owning control connection

use async_trait::async_trait;
use burrow_router::{TargetStream, TunnelTarget};
use burrow_transport::MuxConnection;
use std::io;
use std::sync::{Arc, Weak};

/// Opens a sub-connection to the agent for each proxied request
pub struct ForwardTarget {
    connection: Weak<MuxConnection>,
    path: String,
    remote: String,
}

impl ForwardTarget {
    pub fn new(connection: &Arc<MuxConnection>, path: impl Into<String>) -> Self {
        Self {
            connection: Arc::downgrade(connection),
            path: path.into(),
            remote: connection.remote().to_string(),
        }
    }
}

#[async_trait]
impl TunnelTarget for ForwardTarget {
    async fn connect(&self) -> io::Result<TargetStream> {
        let connection = self
            .connection
            .upgrade()
            .filter(|c| !c.is_closed())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "agent disconnected"))?;

        let stream = connection
            .open_stream(&self.path)
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e))?;
        Ok(Box::new(stream))
    }

    fn describe(&self) -> String {
        format!("agent {}{}", self.remote, self.path)
    }
}
