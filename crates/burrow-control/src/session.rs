//! One authenticated agent connection

use burrow_inject::RuleSet;
use burrow_proto::{ControlMessage, ForwardRequestId, HelloResponse, RequestId, HELLO_COMMAND};
use burrow_router::{ActiveTunnel, TunnelRegistry, TxToken};
use burrow_transport::MuxConnection;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::ControlServerConfig;
use crate::handshake::AgentIdentity;
use crate::target::ForwardTarget;
use crate::ControlError;

/// Exit status for exec commands the gateway does not know
const EXIT_UNKNOWN_COMMAND: i32 = 127;

/// Longest hostname label DNS allows
pub const MAX_LABEL_LEN: usize = 63;

/// Hostname label of a forward: `<sanitized id>-<client id>`
///
/// Ids too long for one DNS label are truncated and tagged with a hash of
/// the full id, so distinct long ids keep distinct labels.
pub fn tunnel_label(forward: &ForwardRequestId, client_id: &str) -> String {
    let mut label: String = forward
        .key()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();

    if label.len() + 1 + client_id.len() > MAX_LABEL_LEN {
        let digest = Sha256::digest(forward.key().as_bytes());
        let tag = hex::encode(&digest[..4]);
        let keep = MAX_LABEL_LEN.saturating_sub(client_id.len() + tag.len() + 2);
        // Sanitized labels are ASCII, any byte offset is a char boundary
        label.truncate(keep);
        label.push('-');
        label.push_str(&tag);
    }
    label.push('-');
    label.push_str(client_id);
    label
}

struct OwnedTunnel {
    tx_token: TxToken,
    forward: ForwardRequestId,
}

pub(crate) struct AgentSession {
    connection: Arc<MuxConnection>,
    agent: AgentIdentity,
    registry: Arc<TunnelRegistry>,
    config: Arc<ControlServerConfig>,
    /// Registry entries created by this connection, by label
    owned: HashMap<String, OwnedTunnel>,
}

impl AgentSession {
    pub(crate) fn new(
        connection: Arc<MuxConnection>,
        agent: AgentIdentity,
        registry: Arc<TunnelRegistry>,
        config: Arc<ControlServerConfig>,
    ) -> Self {
        Self {
            connection,
            agent,
            registry,
            config,
            owned: HashMap::new(),
        }
    }

    /// Serve requests until the agent goes away, then remove its tunnels
    pub(crate) async fn run(mut self) {
        let client_id = self.agent.client_id.clone();
        let connection = self.connection.clone();

        // Agents never open streams towards the gateway
        let rejector = tokio::spawn({
            let connection = connection.clone();
            async move {
                while let Some(incoming) = connection.accept_stream().await {
                    warn!(
                        "Agent opened unexpected stream to {}, resetting",
                        incoming.path
                    );
                    incoming.stream.reset("gateway does not accept streams").await;
                }
            }
        });

        let mut interval = tokio::time::interval(self.config.ping_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut waiting_for_pong = false;
        let mut pong_deadline = Instant::now();

        let reason = loop {
            tokio::select! {
                _ = interval.tick(), if !waiting_for_pong => {
                    let timestamp = chrono::Utc::now().timestamp_millis().max(0) as u64;
                    if let Err(e) = connection.send_control(&ControlMessage::Ping { timestamp }).await {
                        break format!("failed to send ping: {}", e);
                    }
                    waiting_for_pong = true;
                    pong_deadline = Instant::now() + self.config.pong_timeout;
                }

                _ = tokio::time::sleep_until(pong_deadline), if waiting_for_pong => {
                    warn!(client_id = %client_id, "Pong timeout, assuming agent is gone");
                    break "pong timeout".to_string();
                }

                message = connection.recv_control() => {
                    let Some(message) = message else {
                        break "connection closed".to_string();
                    };
                    match message {
                        ControlMessage::Pong { .. } => {
                            waiting_for_pong = false;
                        }
                        ControlMessage::Disconnect { reason } => {
                            break format!("agent disconnected: {}", reason);
                        }
                        message => {
                            if let Err(e) = self.handle_request(message).await {
                                break format!("failed to respond: {}", e);
                            }
                        }
                    }
                }
            }
        };

        info!(client_id = %client_id, "Agent {} disconnected: {}", connection.remote(), reason);
        connection.close(&reason);
        rejector.abort();
        self.cleanup();
    }

    async fn handle_request(&mut self, message: ControlMessage) -> Result<(), ControlError> {
        match message {
            ControlMessage::ForwardRequest {
                request_id,
                path,
                inject,
            } => {
                let response = match self.forward_request(&path, inject) {
                    Ok(()) => ControlMessage::RequestSuccess { request_id },
                    Err(reason) => {
                        warn!("Rejecting forward {}: {}", path, reason);
                        ControlMessage::RequestFailure { request_id, reason }
                    }
                };
                self.connection.send_control(&response).await?;
            }
            ControlMessage::ForwardCancel { request_id, path } => {
                let response = match self.forward_cancel(&path) {
                    Ok(()) => ControlMessage::RequestSuccess { request_id },
                    Err(reason) => ControlMessage::RequestFailure { request_id, reason },
                };
                self.connection.send_control(&response).await?;
            }
            ControlMessage::Exec {
                request_id,
                command,
            } => self.exec(request_id, &command).await?,
            ControlMessage::Ping { timestamp } => {
                self.connection
                    .send_control(&ControlMessage::Pong { timestamp })
                    .await?;
            }
            other => warn!("Unexpected {} from agent", other.kind()),
        }
        Ok(())
    }

    fn forward_request(
        &mut self,
        path: &str,
        inject: Vec<burrow_proto::ScriptInjection>,
    ) -> Result<(), String> {
        let forward = ForwardRequestId::parse(path);
        if forward.key().is_empty() {
            return Err("empty forward id".to_string());
        }
        let inject = RuleSet::compile(inject).map_err(|e| e.to_string())?;

        let label = tunnel_label(&forward, &self.agent.client_id);
        if let Some(existing) = self.owned.get(&label) {
            if existing.forward.key() != forward.key() {
                return Err(format!(
                    "forward {} maps to hostname {} already used by {}",
                    forward.key(),
                    label,
                    existing.forward.key()
                ));
            }
        }
        let tunnel = ActiveTunnel {
            hostname: label.clone(),
            public_key: self.agent.public_key.clone(),
            public_key_thumbprint: self.agent.thumbprint.clone(),
            access: forward.access(),
            client_id: self.agent.client_id.clone(),
            forward_request_id: forward.clone(),
            inject,
            target: Arc::new(ForwardTarget::new(&self.connection, forward.path())),
        };

        let (tx_token, _) = self.registry.set(&label, tunnel);
        info!(
            client_id = %self.agent.client_id,
            "Tunnel {} ({}) -> {}",
            label,
            forward.access(),
            self.config.tunnel_url(&label)
        );
        self.owned.insert(label, OwnedTunnel { tx_token, forward });
        Ok(())
    }

    fn forward_cancel(&mut self, path: &str) -> Result<(), String> {
        let forward = ForwardRequestId::parse(path);
        let label = tunnel_label(&forward, &self.agent.client_id);
        let owned = self
            .owned
            .remove(&label)
            .ok_or_else(|| format!("unknown forward {}", forward.key()))?;

        self.registry.delete(&label, Some(owned.tx_token));
        debug!("Tunnel {} removed by agent", label);
        Ok(())
    }

    fn hello_response(&self) -> HelloResponse {
        let tunnels: BTreeMap<String, String> = self
            .owned
            .iter()
            .map(|(label, owned)| {
                (
                    owned.forward.key().to_string(),
                    self.config.tunnel_url(label),
                )
            })
            .collect();

        HelloResponse {
            client_id: self.agent.client_id.clone(),
            tunnels,
            root_url: Some(self.config.root_url()),
        }
    }

    async fn exec(&self, request_id: RequestId, command: &str) -> Result<(), ControlError> {
        let (output, code) = if command.trim() == HELLO_COMMAND {
            (format!("{}\n", self.hello_response().to_json()), 0)
        } else {
            warn!("Agent requested unknown command {:?}", command);
            (
                format!("unknown command: {}\n", command),
                EXIT_UNKNOWN_COMMAND,
            )
        };

        self.connection
            .send_control(&ControlMessage::ExecOutput {
                request_id,
                data: output.into_bytes(),
            })
            .await?;
        self.connection
            .send_control(&ControlMessage::ExecExit { request_id, code })
            .await?;
        Ok(())
    }

    fn cleanup(&mut self) {
        let mut removed = 0;
        for (label, owned) in self.owned.drain() {
            if self.registry.delete(&label, Some(owned.tx_token)) {
                removed += 1;
            }
        }
        debug!(
            client_id = %self.agent.client_id,
            "Removed {} tunnel(s) of closed connection",
            removed
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_proto::Access;

    #[test]
    fn test_tunnel_label() {
        let forward = ForwardRequestId::parse("/My_App-8080#access=private");
        assert_eq!(tunnel_label(&forward, "c0ffee1234"), "my-app-8080-c0ffee1234");

        let forward = ForwardRequestId::new("web-80", Access::Public);
        assert_eq!(tunnel_label(&forward, "abc"), "web-80-abc");
    }

    #[test]
    fn test_long_tunnel_label_fits_dns() {
        let long = format!("{}-8080", "service".repeat(12));
        let label = tunnel_label(&ForwardRequestId::new(&long, Access::Public), "c0ffee1234");
        assert!(label.len() <= MAX_LABEL_LEN, "{} is {} bytes", label, label.len());
        assert!(label.ends_with("-c0ffee1234"));
        assert!(label.starts_with("serviceservice"));

        // Same prefix, different tail: still distinct
        let other = format!("{}-9090", "service".repeat(12));
        let other = tunnel_label(&ForwardRequestId::new(&other, Access::Public), "c0ffee1234");
        assert!(other.len() <= MAX_LABEL_LEN);
        assert_ne!(label, other);

        // Stable across calls
        assert_eq!(
            label,
            tunnel_label(&ForwardRequestId::new(&long, Access::Private), "c0ffee1234")
        );
    }
}
