//! burrow - expose local services through a public gateway
//!
//! `burrow gateway` runs the public side: the control listener agents connect
//! to and the HTTP listener visitors reach tunnels through. `burrow agent`
//! keeps a set of local services forwarded as described by a YAML file.

use anyhow::{Context, Result};
use burrow_auth::{mint_self_issued, HostKeyPolicy, Identity, SessionManager, TokenVerifier, TrustedIssuer};
use burrow_client::{ClientError, ForwardsFile, TunnelClient, TunnelClientConfig, TunnelState};
use burrow_control::{ControlServer, ControlServerConfig};
use burrow_proto::ScriptInjection;
use burrow_router::TunnelRegistry;
use burrow_server_http::{HttpServer, HttpServerConfig};
use burrow_transport::{GatewayAddress, TlsClientConfig, TlsServerConfig};
use clap::{Parser, Subcommand};
use rand::RngCore;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// burrow - Expose local services through a public gateway
#[derive(Parser, Debug)]
#[command(name = "burrow")]
#[command(about = "burrow - Expose local services through a public gateway")]
#[command(version)]
#[command(long_version = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("BURROW_GIT_HASH"),
    ", built ",
    env!("BURROW_BUILD_TIME"),
    ")"
))]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the public gateway
    #[command(long_about = r#"
Run the public gateway. Agents connect to the control address; visitors reach
tunnels at http(s)://<tunnel>.<base-host> through the HTTP address.

EXAMPLES:
  # Local development
  burrow gateway --base-host localhost

  # Behind a TLS-terminating load balancer, agents over TLS
  burrow gateway --base-host tunnels.example.com --public-scheme https \
    --tls-cert control.crt --tls-key control.key

ENVIRONMENT VARIABLES:
  BURROW_CONTROL_ADDR     Control listen address
  BURROW_HTTP_ADDR        HTTP listen address
  BURROW_BASE_HOST        Public base hostname
  BURROW_SESSION_SECRET   Secret signing visitor sessions
    "#)]
    Gateway {
        /// Address agents connect to
        #[arg(long, env = "BURROW_CONTROL_ADDR", default_value = "0.0.0.0:7000")]
        control_addr: SocketAddr,

        /// Address visitors connect to
        #[arg(long, env = "BURROW_HTTP_ADDR", default_value = "0.0.0.0:8080")]
        http_addr: SocketAddr,

        /// Public hostname; tunnels are served on its subdomains
        #[arg(long, env = "BURROW_BASE_HOST", default_value = "localhost")]
        base_host: String,

        /// Scheme visitors use (http or https)
        #[arg(long, env = "BURROW_PUBLIC_SCHEME", default_value = "http")]
        public_scheme: String,

        /// TLS certificate (PEM) for the control listener
        #[arg(long, env = "BURROW_TLS_CERT", requires = "tls_key")]
        tls_cert: Option<PathBuf>,

        /// TLS private key (PEM) for the control listener
        #[arg(long, env = "BURROW_TLS_KEY", requires = "tls_cert")]
        tls_key: Option<PathBuf>,

        /// Gateway host key, generated when missing
        #[arg(long, env = "BURROW_HOST_KEY", default_value = "burrow-host.key")]
        host_key: PathBuf,

        /// Only accept agents with these key thumbprints
        #[arg(long = "authorized-thumbprint", env = "BURROW_AUTHORIZED_THUMBPRINTS", value_delimiter = ',')]
        authorized_thumbprints: Vec<String>,

        /// Secret signing visitor sessions (random when unset)
        #[arg(long, env = "BURROW_SESSION_SECRET", hide_env_values = true)]
        session_secret: Option<String>,

        /// Visitor session lifetime in hours
        #[arg(long, env = "BURROW_SESSION_TTL_HOURS", default_value = "24")]
        session_ttl_hours: i64,

        /// Issuer of tokens from an external identity provider
        #[arg(long, env = "BURROW_IDP_ISSUER", requires = "idp_public_key")]
        idp_issuer: Option<String>,

        /// PEM public key of the identity provider
        #[arg(long, env = "BURROW_IDP_PUBLIC_KEY", requires = "idp_issuer")]
        idp_public_key: Option<PathBuf>,

        /// Identity provider login page for private tunnels
        #[arg(long, env = "BURROW_LOGIN_URL")]
        login_url: Option<String>,

        /// Scripts injected into every tunnel's HTML (JSON list)
        #[arg(long, env = "BURROW_INJECT_SCRIPTS")]
        inject: Option<String>,

        /// Seconds between keepalive pings to agents
        #[arg(long, default_value = "10")]
        ping_interval: u64,
    },

    /// Forward local services through a gateway
    #[command(long_about = r#"
Connect to a gateway and keep the services listed in a forwards file exposed.
The file is polled for changes; the agent exits if the gateway connection is
lost so a supervisor can restart it.

FORWARDS FILE:
  services:
    - name: web
      ports: [3000]
      access: private
      inject:
        - src: /dev-toolbar.js
          pathRegex: "^/app"

EXAMPLES:
  burrow agent --gateway tls://tunnels.example.com --forwards forwards.yaml \
    --host-key-thumbprint <thumbprint>

  # Show this agent's key thumbprint
  burrow agent --print-thumbprint

ENVIRONMENT VARIABLES:
  BURROW_GATEWAY          Gateway control address (tcp:// or tls://)
  BURROW_KEY              Agent key file
  BURROW_FORWARDS         Forwards file
  BURROW_HOST_KEYS        Pinned gateway host key thumbprints
    "#)]
    Agent {
        /// Gateway control address, e.g. tls://tunnels.example.com:7000
        #[arg(long, env = "BURROW_GATEWAY", required_unless_present = "print_thumbprint")]
        gateway: Option<String>,

        /// Agent key, generated when missing
        #[arg(long, env = "BURROW_KEY", default_value = "burrow-agent.key")]
        key: PathBuf,

        /// YAML file listing the services to forward
        #[arg(long, env = "BURROW_FORWARDS", required_unless_present = "print_thumbprint")]
        forwards: Option<PathBuf>,

        /// Seconds between checks of the forwards file
        #[arg(long, default_value = "2")]
        poll_interval: u64,

        /// Trusted gateway host key thumbprints
        #[arg(long = "host-key-thumbprint", env = "BURROW_HOST_KEYS", value_delimiter = ',')]
        host_key_thumbprints: Vec<String>,

        /// Accept any gateway host key (insecure, for development only)
        #[arg(long)]
        insecure_skip_host_key: bool,

        /// Skip certificate verification (insecure, for development only)
        #[arg(long)]
        insecure: bool,

        /// Extra CA certificate (PEM) for tls:// gateways
        #[arg(long, env = "BURROW_CA_CERT")]
        ca_cert: Option<PathBuf>,

        /// Print the key thumbprint and exit
        #[arg(long)]
        print_thumbprint: bool,
    },

    /// Mint an access token for the private tunnels of an agent key
    Token {
        /// Agent key the token is signed with
        #[arg(long, env = "BURROW_KEY", default_value = "burrow-agent.key")]
        key: PathBuf,

        /// Who the token is for
        #[arg(long, default_value = "burrow")]
        subject: String,

        /// Validity in hours
        #[arg(long, default_value = "24")]
        valid_hours: i64,
    },
}

/// Setup logging with the specified log level
fn setup_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

struct GatewayArgs {
    control_addr: SocketAddr,
    http_addr: SocketAddr,
    base_host: String,
    public_scheme: String,
    tls: Option<(PathBuf, PathBuf)>,
    host_key: PathBuf,
    authorized_thumbprints: Vec<String>,
    session_secret: Option<String>,
    session_ttl_hours: i64,
    idp: Option<(String, PathBuf)>,
    login_url: Option<String>,
    inject: Option<String>,
    ping_interval: u64,
}

async fn run_gateway(args: GatewayArgs) -> Result<()> {
    let host_identity = Identity::load_or_generate(&args.host_key)
        .with_context(|| format!("Failed to load host key {}", args.host_key.display()))?;
    info!("Host key thumbprint: {}", host_identity.thumbprint());

    let registry = Arc::new(TunnelRegistry::new());

    let mut control_config = ControlServerConfig::default()
        .with_base_host(args.base_host.clone())
        .with_public_scheme(args.public_scheme.clone())
        .with_ping_interval(Duration::from_secs(args.ping_interval));
    if !args.authorized_thumbprints.is_empty() {
        info!(
            "Accepting {} authorized agent key(s)",
            args.authorized_thumbprints.len()
        );
        control_config = control_config.with_authorized_thumbprints(args.authorized_thumbprints);
    }

    let mut control = ControlServer::new(host_identity, registry.clone(), control_config);
    if let Some((cert, key)) = &args.tls {
        let acceptor = TlsServerConfig::new(cert, key)
            .build_acceptor()
            .context("Failed to load control TLS certificate")?;
        control = control.with_tls(acceptor);
    }

    let global_inject = match &args.inject {
        Some(json) => ScriptInjection::parse_list(json).context("Invalid --inject JSON")?,
        None => Vec::new(),
    };

    let mut http_config = HttpServerConfig::default()
        .with_bind_addr(args.http_addr)
        .with_base_host(args.base_host)
        .with_public_scheme(args.public_scheme)
        .with_global_inject(global_inject);
    if let Some(url) = args.login_url {
        http_config = http_config.with_login_url(url);
    }

    let mut verifier = TokenVerifier::default();
    if let Some((issuer, key_path)) = &args.idp {
        let pem = std::fs::read(key_path)
            .with_context(|| format!("Failed to read {}", key_path.display()))?;
        let trusted = TrustedIssuer::from_pem(issuer.clone(), &pem)
            .context("Invalid identity provider key")?;
        info!("Trusting tokens from {}", issuer);
        verifier = verifier.with_issuer(trusted);
    }

    let secret = match args.session_secret {
        Some(secret) => secret.into_bytes(),
        None => {
            warn!("No session secret configured; visitor sessions end when the gateway restarts");
            let mut secret = vec![0u8; 32];
            rand::thread_rng().fill_bytes(&mut secret);
            secret
        }
    };
    let sessions = SessionManager::new(&secret, chrono::Duration::hours(args.session_ttl_hours));

    let http = HttpServer::new(http_config, registry).with_access(verifier, sessions);

    let control_listener = TcpListener::bind(args.control_addr)
        .await
        .with_context(|| format!("Failed to bind control address {}", args.control_addr))?;

    tokio::select! {
        result = control.serve(control_listener) => {
            result.context("Control server failed")?;
        }
        result = http.start() => {
            result.context("HTTP server failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
    }

    Ok(())
}

struct AgentArgs {
    gateway: String,
    identity: Identity,
    forwards: PathBuf,
    poll_interval: Duration,
    host_key_thumbprints: Vec<String>,
    insecure_skip_host_key: bool,
    insecure: bool,
    ca_cert: Option<PathBuf>,
}

async fn run_agent(args: AgentArgs) -> Result<()> {
    let address = GatewayAddress::parse(&args.gateway)?;

    let mut tls = if args.insecure {
        warn!("⚠️  Certificate verification disabled (insecure mode)");
        TlsClientConfig::insecure()
    } else {
        TlsClientConfig::default()
    };
    if let Some(path) = &args.ca_cert {
        tls = tls.with_root_cert_file(path)?;
    }

    if args.insecure_skip_host_key {
        warn!("⚠️  Gateway host key verification disabled (insecure mode)");
    }
    let policy = HostKeyPolicy::pinned(args.host_key_thumbprints)
        .with_insecure_skip(args.insecure_skip_host_key);

    let (lost_tx, mut lost_rx) = tokio::sync::oneshot::channel();
    let client = TunnelClient::connect(
        &address,
        &tls,
        &args.identity,
        TunnelClientConfig::default().with_host_key_policy(policy),
        move |e| {
            let _ = lost_tx.send(e);
        },
    )
    .await
    .with_context(|| format!("Failed to connect to {}", args.gateway))?;

    info!(
        client_id = %client.client_id(),
        "Connected to {} (host key {}, {})",
        args.gateway,
        client.host_key().thumbprint,
        client.host_key().check
    );

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut interval = tokio::time::interval(args.poll_interval);
    let mut applied: Option<String> = None;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                sync_forwards(&client, &args.forwards, &mut applied).await?;
            }
            lost = &mut lost_rx => {
                let reason = lost.map(|e| e.to_string()).unwrap_or_else(|_| "unknown".to_string());
                error!("Lost connection to gateway: {}", reason);
                anyhow::bail!("Connection to gateway lost: {}", reason);
            }
            _ = &mut ctrl_c => {
                info!("Received Ctrl+C, shutting down...");
                client.close("agent shutting down").await;
                return Ok(());
            }
        }
    }
}

/// Apply the forwards file if it changed since the last attempt
async fn sync_forwards(
    client: &TunnelClient,
    path: &Path,
    applied: &mut Option<String>,
) -> Result<()> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) => {
            warn!("Cannot read forwards file {}: {}", path.display(), e);
            return Ok(());
        }
    };
    if applied.as_deref() == Some(content.as_str()) {
        return Ok(());
    }
    *applied = Some(content.clone());

    let file = match ForwardsFile::parse(&content) {
        Ok(file) => file,
        Err(e) => {
            warn!("Ignoring invalid forwards file {}: {}", path.display(), e);
            return Ok(());
        }
    };

    match client.update_forwards(file.forwards()).await {
        Ok(state) => {
            print_state(&state);
            Ok(())
        }
        Err(ClientError::ForwardsRejected(failures)) => {
            for failure in &failures {
                warn!("Forward rejected: {}", failure);
            }
            // Retry the rejected ones on the next tick
            *applied = None;
            Ok(())
        }
        Err(e @ (ClientError::Closed | ClientError::Transport(_))) => {
            Err(e).context("Failed to update forwards")
        }
        Err(e) => {
            warn!("Failed to update forwards: {}", e);
            // Retry on the next tick
            *applied = None;
            Ok(())
        }
    }
}

fn print_state(state: &TunnelState) {
    if state.services.is_empty() {
        info!("No services forwarded");
        return;
    }
    for (service, ports) in &state.services {
        for (port, url) in ports {
            info!("{} :{} -> {}", service, port, url);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    match cli.command {
        Commands::Gateway {
            control_addr,
            http_addr,
            base_host,
            public_scheme,
            tls_cert,
            tls_key,
            host_key,
            authorized_thumbprints,
            session_secret,
            session_ttl_hours,
            idp_issuer,
            idp_public_key,
            login_url,
            inject,
            ping_interval,
        } => {
            info!("burrow gateway starting...");
            run_gateway(GatewayArgs {
                control_addr,
                http_addr,
                base_host: base_host.to_ascii_lowercase(),
                public_scheme,
                tls: tls_cert.zip(tls_key),
                host_key,
                authorized_thumbprints,
                session_secret,
                session_ttl_hours,
                idp: idp_issuer.zip(idp_public_key),
                login_url,
                inject,
                ping_interval,
            })
            .await
        }

        Commands::Agent {
            gateway,
            key,
            forwards,
            poll_interval,
            host_key_thumbprints,
            insecure_skip_host_key,
            insecure,
            ca_cert,
            print_thumbprint,
        } => {
            let identity = Identity::load_or_generate(&key)
                .with_context(|| format!("Failed to load agent key {}", key.display()))?;
            if print_thumbprint {
                println!("{}", identity.thumbprint());
                return Ok(());
            }

            info!("burrow agent starting...");
            run_agent(AgentArgs {
                gateway: gateway.context("--gateway is required")?,
                identity,
                forwards: forwards.context("--forwards is required")?,
                poll_interval: Duration::from_secs(poll_interval.max(1)),
                host_key_thumbprints,
                insecure_skip_host_key,
                insecure,
                ca_cert,
            })
            .await
        }

        Commands::Token {
            key,
            subject,
            valid_hours,
        } => {
            let identity = Identity::load(&key)
                .with_context(|| format!("Failed to load agent key {}", key.display()))?;
            let token = mint_self_issued(&identity, &subject, chrono::Duration::hours(valid_hours))?;
            println!("{}", token);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn connect_agent() -> TunnelClient {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = ControlServer::new(
            Identity::generate(),
            Arc::new(TunnelRegistry::new()),
            ControlServerConfig::default(),
        );
        let thumbprint = server.host_thumbprint();
        tokio::spawn(server.serve(listener));

        let address = GatewayAddress::parse(&format!("tcp://127.0.0.1:{}", port)).unwrap();
        TunnelClient::connect(
            &address,
            &TlsClientConfig::default(),
            &Identity::generate(),
            TunnelClientConfig::default().with_host_key_policy(HostKeyPolicy::pinned([thumbprint])),
            |_| {},
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_rejected_forwards_are_retried() {
        let client = connect_agent().await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("forwards.yaml");

        // The gateway refuses the invalid path regex
        std::fs::write(
            &path,
            "services:\n  - name: web\n    ports: [80]\n    inject:\n      - src: /x.js\n        pathRegex: \"(\"\n",
        )
        .unwrap();
        let mut applied = None;
        sync_forwards(&client, &path, &mut applied).await.unwrap();
        assert!(applied.is_none());
        assert!(!client.forwards().contains("web-80"));

        std::fs::write(&path, "services:\n  - name: web\n    ports: [80]\n").unwrap();
        sync_forwards(&client, &path, &mut applied).await.unwrap();
        assert!(applied.is_some());
        assert!(client.forwards().contains("web-80"));
    }

    #[tokio::test]
    async fn test_unchanged_file_is_not_reapplied() {
        let client = connect_agent().await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("forwards.yaml");
        let content = "services:\n  - name: api\n    ports: [3000]\n";
        std::fs::write(&path, content).unwrap();

        let mut applied = None;
        sync_forwards(&client, &path, &mut applied).await.unwrap();
        assert_eq!(applied.as_deref(), Some(content));

        client.close("test done").await;
        // Same content: nothing is sent, so the closed client is not an error
        sync_forwards(&client, &path, &mut applied).await.unwrap();
    }
}
