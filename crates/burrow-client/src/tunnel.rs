//! Tunnel client: control connection lifecycle

use burrow_auth::{
    generate_nonce, verify_transcript, AuthError, HostKeyReport, Identity,
    CLIENT_SIGNATURE_LABEL, HOST_SIGNATURE_LABEL,
};
use burrow_proto::{ControlMessage, HelloResponse, RequestId, HELLO_COMMAND, PROTOCOL_VERSION};
use burrow_transport::{
    connect, Connected, GatewayAddress, MuxConnection, Role, TlsClientConfig, TransportError,
};
use dashmap::DashMap;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::bridge::accept_loop;
use crate::config::TunnelClientConfig;
use crate::error::{ClientError, ForwardFailure, ForwardOp};
use crate::forward::{Forward, ForwardSet};
use crate::reconcile::reconcile;

/// Public view of the established forwards
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TunnelState {
    pub client_id: String,
    pub root_url: Option<String>,
    /// Service name -> service port -> public URL
    pub services: BTreeMap<String, BTreeMap<u16, String>>,
}

impl TunnelState {
    pub fn url(&self, service: &str, port: u16) -> Option<&str> {
        self.services.get(service)?.get(&port).map(String::as_str)
    }
}

type ErrorCallback = Box<dyn FnOnce(ClientError) + Send>;

/// Responses routed back to a waiting request
type PendingMap = DashMap<RequestId, mpsc::UnboundedSender<ControlMessage>>;

/// Removes a pending request when its waiter goes away
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    request_id: RequestId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.request_id);
    }
}

struct Inner {
    connection: Arc<MuxConnection>,
    config: TunnelClientConfig,
    client_id: String,
    host_key: HostKeyReport,
    pending: Arc<PendingMap>,
    next_request_id: AtomicU64,
    forwards: Arc<RwLock<ForwardSet>>,
    /// Serializes `update_forwards` and caches its last result
    state: Mutex<Option<TunnelState>>,
    closing: Arc<AtomicBool>,
}

/// Agent side of one control connection
#[derive(Clone)]
pub struct TunnelClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for TunnelClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelClient")
            .field("client_id", &self.inner.client_id)
            .field("connection", &self.inner.connection)
            .finish()
    }
}

impl TunnelClient {
    /// Connect to the gateway at `address` and authenticate with `identity`.
    ///
    /// `on_error` is called once if the connection is lost afterwards.
    pub async fn connect<F>(
        address: &GatewayAddress,
        tls: &TlsClientConfig,
        identity: &Identity,
        config: TunnelClientConfig,
        on_error: F,
    ) -> Result<Self, ClientError>
    where
        F: FnOnce(ClientError) + Send + 'static,
    {
        let connected = connect(address, tls).await?;
        Self::establish(connected, identity, config, on_error).await
    }

    /// Run the handshake over an already open byte stream
    pub async fn establish<F>(
        connected: Connected,
        identity: &Identity,
        config: TunnelClientConfig,
        on_error: F,
    ) -> Result<Self, ClientError>
    where
        F: FnOnce(ClientError) + Send + 'static,
    {
        let Connected {
            io,
            transport_authenticated,
            peer,
        } = connected;
        let connection = Arc::new(MuxConnection::new(io, Role::Client, peer));

        let handshake = timeout(
            config.handshake_timeout,
            handshake(&connection, identity, &config, transport_authenticated),
        )
        .await
        .unwrap_or_else(|_| Err(ClientError::Timeout("control handshake".to_string())));

        let (client_id, host_key) = match handshake {
            Ok(result) => result,
            Err(e) => {
                connection.close("handshake failed");
                return Err(e);
            }
        };

        info!(
            client_id = %client_id,
            host_key = %host_key.thumbprint,
            "Authenticated to gateway {} (host key {})",
            connection.remote(),
            host_key.check
        );

        let inner = Arc::new(Inner {
            connection: connection.clone(),
            config,
            client_id,
            host_key,
            pending: Arc::new(DashMap::new()),
            next_request_id: AtomicU64::new(1),
            forwards: Arc::new(RwLock::new(ForwardSet::new())),
            state: Mutex::new(None),
            closing: Arc::new(AtomicBool::new(false)),
        });

        tokio::spawn(control_loop(
            connection.clone(),
            inner.pending.clone(),
            inner.closing.clone(),
            Box::new(on_error),
        ));
        tokio::spawn(accept_loop(connection, inner.forwards.clone()));

        Ok(Self { inner })
    }

    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    /// How the gateway host key was accepted
    pub fn host_key(&self) -> &HostKeyReport {
        &self.inner.host_key
    }

    pub fn is_closed(&self) -> bool {
        self.inner.connection.is_closed()
    }

    /// Currently established forwards
    pub fn forwards(&self) -> ForwardSet {
        self.read_forwards().clone()
    }

    fn read_forwards(&self) -> std::sync::RwLockReadGuard<'_, ForwardSet> {
        self.inner
            .forwards
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_forwards(&self) -> std::sync::RwLockWriteGuard<'_, ForwardSet> {
        self.inner
            .forwards
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make the established forwards match `desired` and return their public URLs
    pub async fn update_forwards(&self, desired: ForwardSet) -> Result<TunnelState, ClientError> {
        let mut cached = self.inner.state.lock().await;
        if self.is_closed() {
            return Err(ClientError::Closed);
        }

        let plan = reconcile(&self.forwards(), &desired);
        if plan.is_empty() {
            if let Some(state) = cached.as_ref() {
                debug!("Forwards unchanged");
                return Ok(state.clone());
            }
        }

        if !plan.is_empty() {
            info!(
                "Updating forwards: {} to create, {} to destroy",
                plan.inserts.len(),
                plan.deletes.len()
            );
        }

        let mut failures = Vec::new();

        let deleted = join_all(plan.deletes.iter().map(|f| self.destroy_forward(f))).await;
        for (forward, result) in plan.deletes.iter().zip(deleted) {
            match result {
                Ok(()) => {
                    self.write_forwards().remove(forward.key());
                }
                Err(e) => failures.push(ForwardFailure {
                    op: ForwardOp::Destroy,
                    forward: forward.request_id.to_string(),
                    reason: e.to_string(),
                }),
            }
        }

        let created = join_all(plan.inserts.iter().map(|f| self.create_forward(f))).await;
        for (forward, result) in plan.inserts.iter().zip(created) {
            match result {
                Ok(()) => {
                    self.write_forwards().insert(forward.clone());
                }
                Err(e) => failures.push(ForwardFailure {
                    op: ForwardOp::Create,
                    forward: forward.request_id.to_string(),
                    reason: e.to_string(),
                }),
            }
        }

        if !failures.is_empty() {
            *cached = None;
            return Err(ClientError::ForwardsRejected(failures));
        }

        let state = match self.tunnel_state().await {
            Ok(state) => state,
            Err(e) => {
                *cached = None;
                return Err(e);
            }
        };
        *cached = Some(state.clone());
        Ok(state)
    }

    async fn create_forward(&self, forward: &Forward) -> Result<(), ClientError> {
        let path = forward.external_name();
        let inject = forward.inject.clone();
        self.request(|request_id| ControlMessage::ForwardRequest {
            request_id,
            path,
            inject,
        })
        .await?;
        debug!("Gateway accepted forward {} -> {}", forward.request_id, forward.service);
        Ok(())
    }

    /// Close the forward's sockets, then ask the gateway to drop its listener
    async fn destroy_forward(&self, forward: &Forward) -> Result<(), ClientError> {
        let terminated = forward.sockets().terminate_all();
        if terminated > 0 {
            debug!(
                "Closing {} socket(s) of forward {}",
                terminated, forward.request_id
            );
            if timeout(self.inner.config.request_timeout, forward.sockets().drained())
                .await
                .is_err()
            {
                warn!(
                    "Sockets of forward {} still open after {:?}",
                    forward.request_id, self.inner.config.request_timeout
                );
            }
        }

        let path = forward.external_name();
        let cancelled = self
            .request(|request_id| ControlMessage::ForwardCancel { request_id, path })
            .await;
        if let Err(e) = cancelled {
            // Still registered with the gateway
            forward.sockets().reopen();
            return Err(e);
        }
        debug!("Gateway removed forward {}", forward.request_id);
        Ok(())
    }

    fn register_pending(
        &self,
    ) -> (
        RequestId,
        PendingGuard<'_>,
        mpsc::UnboundedReceiver<ControlMessage>,
    ) {
        let request_id = self.inner.next_request_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.pending.insert(request_id, tx);
        let guard = PendingGuard {
            pending: &self.inner.pending,
            request_id,
        };
        (request_id, guard, rx)
    }

    /// Send a request and wait for `RequestSuccess`/`RequestFailure`
    async fn request<F>(&self, build: F) -> Result<(), ClientError>
    where
        F: FnOnce(RequestId) -> ControlMessage,
    {
        let (request_id, _guard, mut rx) = self.register_pending();
        let message = build(request_id);
        let kind = message.kind();
        self.inner.connection.send_control(&message).await?;

        let response = timeout(self.inner.config.request_timeout, rx.recv())
            .await
            .map_err(|_| ClientError::Timeout(format!("{} {}", kind, request_id)))?;

        match response {
            Some(ControlMessage::RequestSuccess { .. }) => Ok(()),
            Some(ControlMessage::RequestFailure { reason, .. }) => {
                Err(ClientError::RequestFailed(reason))
            }
            Some(other) => Err(ClientError::Protocol(format!(
                "unexpected {} in response to {}",
                other.kind(),
                kind
            ))),
            None => Err(TransportError::ConnectionClosed.into()),
        }
    }

    /// Run the `hello` command and collect its JSON response
    pub async fn hello(&self) -> Result<HelloResponse, ClientError> {
        let (request_id, _guard, mut rx) = self.register_pending();
        self.inner
            .connection
            .send_control(&ControlMessage::Exec {
                request_id,
                command: HELLO_COMMAND.to_string(),
            })
            .await?;

        let collect = async {
            let mut output = Vec::new();
            let mut last_error = None;
            while let Some(message) = rx.recv().await {
                match message {
                    ControlMessage::ExecOutput { data, .. } => {
                        output.extend_from_slice(&data);
                        match HelloResponse::find_in(&output) {
                            Some(Ok(hello)) => return Ok(hello),
                            Some(Err(e)) => last_error = Some(e),
                            None => {}
                        }
                    }
                    ControlMessage::ExecExit { code, .. } => {
                        return Err(match last_error {
                            Some(e) => ClientError::Hello(e),
                            None => ClientError::Protocol(format!(
                                "hello exited with code {} without a response",
                                code
                            )),
                        });
                    }
                    ControlMessage::RequestFailure { reason, .. } => {
                        return Err(ClientError::RequestFailed(reason));
                    }
                    other => {
                        debug!("Ignoring {} during hello", other.kind());
                    }
                }
            }
            Err(ClientError::Transport(TransportError::ConnectionClosed))
        };

        timeout(self.inner.config.hello_timeout, collect)
            .await
            .map_err(|_| ClientError::Timeout("hello".to_string()))?
    }

    async fn tunnel_state(&self) -> Result<TunnelState, ClientError> {
        let hello = self.hello().await?;
        let forwards = self.forwards();

        let mut services: BTreeMap<String, BTreeMap<u16, String>> = BTreeMap::new();
        for (id, url) in hello.tunnels {
            let Some(forward) = forwards.get(&id) else {
                warn!("Gateway reported unknown forward {} in hello", id);
                return Err(ClientError::Protocol(format!(
                    "hello returned unknown forward {}",
                    id
                )));
            };
            services
                .entry(forward.service.name.clone())
                .or_default()
                .insert(forward.service.port, url);
        }

        Ok(TunnelState {
            client_id: hello.client_id,
            root_url: hello.root_url,
            services,
        })
    }

    /// Disconnect from the gateway. `on_error` is not called.
    pub async fn close(&self, reason: &str) {
        if self.inner.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self
            .inner
            .connection
            .send_control(&ControlMessage::Disconnect {
                reason: reason.to_string(),
            })
            .await;
        for forward in self.read_forwards().iter() {
            forward.sockets().terminate_all();
        }
        self.inner.connection.close(reason);
    }
}

async fn handshake(
    connection: &MuxConnection,
    identity: &Identity,
    config: &TunnelClientConfig,
    transport_authenticated: bool,
) -> Result<(String, HostKeyReport), ClientError> {
    let agent_nonce = generate_nonce();
    connection
        .send_control(&ControlMessage::Hello {
            version: PROTOCOL_VERSION,
            public_key: identity.public_key().to_vec(),
            nonce: agent_nonce.clone(),
        })
        .await?;

    let (host_key, gateway_nonce, signature) = match connection.recv_control().await {
        Some(ControlMessage::Challenge {
            host_key,
            nonce,
            signature,
        }) => (host_key, nonce, signature),
        Some(ControlMessage::Rejected { reason }) => return Err(ClientError::Rejected(reason)),
        Some(other) => {
            return Err(ClientError::Protocol(format!(
                "expected challenge, got {}",
                other.kind()
            )))
        }
        None => return Err(TransportError::ConnectionClosed.into()),
    };

    if !verify_transcript(
        &host_key,
        HOST_SIGNATURE_LABEL,
        &agent_nonce,
        &gateway_nonce,
        &signature,
    ) {
        return Err(AuthError::BadSignature("gateway").into());
    }
    let report = config
        .host_key_policy
        .check(&host_key, transport_authenticated)?;

    connection
        .send_control(&ControlMessage::Authenticate {
            signature: identity.sign_transcript(
                CLIENT_SIGNATURE_LABEL,
                &agent_nonce,
                &gateway_nonce,
            ),
        })
        .await?;

    match connection.recv_control().await {
        Some(ControlMessage::Authenticated { client_id }) => Ok((client_id, report)),
        Some(ControlMessage::Rejected { reason }) => Err(ClientError::Rejected(reason)),
        Some(other) => Err(ClientError::Protocol(format!(
            "expected authenticated, got {}",
            other.kind()
        ))),
        None => Err(TransportError::ConnectionClosed.into()),
    }
}

/// Dispatch control messages until the connection goes away
async fn control_loop(
    connection: Arc<MuxConnection>,
    pending: Arc<PendingMap>,
    closing: Arc<AtomicBool>,
    on_error: ErrorCallback,
) {
    let reason = loop {
        let message = tokio::select! {
            _ = connection.closed() => break "connection closed".to_string(),
            message = connection.recv_control() => message,
        };

        let Some(message) = message else {
            break "connection closed by gateway".to_string();
        };

        match message {
            ControlMessage::Ping { timestamp } => {
                if let Err(e) = connection
                    .send_control(&ControlMessage::Pong { timestamp })
                    .await
                {
                    break format!("failed to send pong: {}", e);
                }
            }
            ControlMessage::Disconnect { reason } => {
                info!("Gateway disconnected: {}", reason);
                break reason;
            }
            message => match message.response_id() {
                Some(request_id) => {
                    let finished = matches!(
                        message,
                        ControlMessage::RequestSuccess { .. }
                            | ControlMessage::RequestFailure { .. }
                            | ControlMessage::ExecExit { .. }
                    );
                    let delivered = pending
                        .get(&request_id)
                        .map(|tx| tx.send(message).is_ok())
                        .unwrap_or(false);
                    if finished || !delivered {
                        pending.remove(&request_id);
                    }
                    if !delivered {
                        debug!("Dropping response for abandoned request {}", request_id);
                    }
                }
                None => warn!("Unexpected {} on control channel", message.kind()),
            },
        }
    };

    connection.close(&reason);
    pending.clear();

    if closing.load(Ordering::SeqCst) {
        debug!("Tunnel client closed: {}", reason);
        return;
    }
    error!("Lost connection to gateway: {}", reason);
    on_error(ClientError::Transport(TransportError::ConnectionClosed));
}
