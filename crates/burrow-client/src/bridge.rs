//! Bridging gateway sub-connections to local services

use burrow_transport::{IncomingStream, MuxConnection, MuxStream};
use std::sync::{Arc, RwLock};
use tokio::net::TcpStream;
use tracing::{debug, error, warn};

use crate::forward::{Forward, ForwardSet};

/// Accept sub-connections until the control connection closes
pub async fn accept_loop(connection: Arc<MuxConnection>, forwards: Arc<RwLock<ForwardSet>>) {
    while let Some(IncomingStream { path, stream }) = connection.accept_stream().await {
        let forward = forwards
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&path)
            .cloned();

        match forward {
            Some(forward) if !forward.sockets().is_draining() => {
                tokio::spawn(bridge(stream, forward));
            }
            Some(_) => {
                debug!(
                    "[{}] Rejecting sub-connection {} for forward {} being removed",
                    connection.connection_id(),
                    stream.stream_id(),
                    path
                );
                tokio::spawn(stream.reset("forward removed"));
            }
            None => {
                warn!(
                    "[{}] Rejecting sub-connection {} for unknown forward {}",
                    connection.connection_id(),
                    stream.stream_id(),
                    path
                );
                tokio::spawn(stream.reset("unknown forward"));
            }
        }
    }
    debug!("[{}] Accept loop exiting", connection.connection_id());
}

/// Splice one sub-connection with a fresh connection to the forward's service
pub async fn bridge(mut stream: MuxStream, forward: Arc<Forward>) {
    let stream_id = stream.stream_id();
    let address = forward.service.address();

    // Registered before dialing so a concurrent tear-down also covers the dial
    let Some((socket_id, token)) = forward.sockets().register() else {
        stream.reset("forward removed").await;
        return;
    };

    let connected = tokio::select! {
        connected = TcpStream::connect(&address) => connected,
        _ = token.cancelled() => {
            debug!("Stream {} cancelled while connecting to {}", stream_id, forward.service);
            stream.reset("forward removed").await;
            forward.sockets().remove(socket_id);
            return;
        }
    };

    let mut local = match connected {
        Ok(socket) => socket,
        Err(e) => {
            error!(
                "Failed to connect to {} for stream {}: {}",
                forward.service, stream_id, e
            );
            stream
                .reset(&format!("failed to connect to {}: {}", address, e))
                .await;
            forward.sockets().remove(socket_id);
            return;
        }
    };
    let _ = local.set_nodelay(true);

    debug!(
        "Bridging stream {} to {} ({} active)",
        stream_id,
        forward.service,
        forward.sockets().len()
    );

    let terminated = tokio::select! {
        result = tokio::io::copy_bidirectional(&mut stream, &mut local) => {
            match result {
                Ok((to_service, from_service)) => debug!(
                    "Stream {} closed ({} bytes in, {} bytes out)",
                    stream_id, to_service, from_service
                ),
                Err(e) => debug!("Stream {} ended with error: {}", stream_id, e),
            }
            false
        }
        _ = token.cancelled() => true,
    };

    drop(local);
    if terminated {
        debug!("Stream {} terminated with forward {}", stream_id, forward.request_id);
        stream.reset("forward removed").await;
    }
    forward.sockets().remove(socket_id);
}
