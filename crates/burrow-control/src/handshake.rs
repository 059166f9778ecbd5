//! Gateway half of the challenge/response handshake

use burrow_auth::{
    client_id_for, generate_nonce, thumbprint, verify_transcript, Identity,
    CLIENT_SIGNATURE_LABEL, HOST_SIGNATURE_LABEL,
};
use burrow_proto::{ControlMessage, PROTOCOL_VERSION};
use burrow_transport::MuxConnection;
use tracing::{debug, warn};

use crate::config::ControlServerConfig;
use crate::ControlError;

/// An authenticated agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentIdentity {
    pub public_key: Vec<u8>,
    pub thumbprint: String,
    pub client_id: String,
}

async fn reject(connection: &MuxConnection, reason: &str) -> ControlError {
    let _ = connection
        .send_control(&ControlMessage::Rejected {
            reason: reason.to_string(),
        })
        .await;
    ControlError::Rejected(reason.to_string())
}

/// Prove the host key to the agent and verify the agent's key
pub async fn accept_handshake(
    connection: &MuxConnection,
    host: &Identity,
    config: &ControlServerConfig,
) -> Result<AgentIdentity, ControlError> {
    let (version, public_key, agent_nonce) = match connection.recv_control().await {
        Some(ControlMessage::Hello {
            version,
            public_key,
            nonce,
        }) => (version, public_key, nonce),
        Some(other) => {
            return Err(ControlError::Handshake(format!(
                "expected hello, got {}",
                other.kind()
            )))
        }
        None => return Err(ControlError::Handshake("connection closed".to_string())),
    };

    if version != PROTOCOL_VERSION {
        return Err(reject(
            connection,
            &format!("unsupported protocol version {}", version),
        )
        .await);
    }
    if public_key.len() != 32 {
        return Err(reject(connection, "invalid public key").await);
    }

    let gateway_nonce = generate_nonce();
    connection
        .send_control(&ControlMessage::Challenge {
            host_key: host.public_key().to_vec(),
            nonce: gateway_nonce.clone(),
            signature: host.sign_transcript(HOST_SIGNATURE_LABEL, &agent_nonce, &gateway_nonce),
        })
        .await?;

    let signature = match connection.recv_control().await {
        Some(ControlMessage::Authenticate { signature }) => signature,
        Some(other) => {
            return Err(ControlError::Handshake(format!(
                "expected authenticate, got {}",
                other.kind()
            )))
        }
        None => {
            // Agents that do not trust the host key hang up here
            return Err(ControlError::Handshake(
                "connection closed after challenge".to_string(),
            ));
        }
    };

    if !verify_transcript(
        &public_key,
        CLIENT_SIGNATURE_LABEL,
        &agent_nonce,
        &gateway_nonce,
        &signature,
    ) {
        return Err(reject(connection, "bad signature").await);
    }

    let thumbprint = thumbprint(&public_key);
    if !config.is_authorized(&thumbprint) {
        warn!("Rejecting unauthorized agent key {}", thumbprint);
        return Err(reject(connection, "key not authorized").await);
    }

    let client_id = client_id_for(&public_key);
    connection
        .send_control(&ControlMessage::Authenticated {
            client_id: client_id.clone(),
        })
        .await?;
    debug!("Agent {} authenticated with key {}", client_id, thumbprint);

    Ok(AgentIdentity {
        public_key,
        thumbprint,
        client_id,
    })
}
