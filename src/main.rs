//! Outpost CLI
//!
//! Runs the relay, runs a node, or edits a node's forward rules.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use outpost_control::{relay_router, JsonFileStore, RelaySettings, RelayState};
use outpost_node::{Node, NodeConfigStore, NodeSettings, ReconnectConfig};
use outpost_proto::{ForwardProtocol, ForwardRuleDraft, RuleId};
use outpost_transport_websocket::WebSocketConfig;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use url::Url;

/// Outpost - reach private hosts through an outbound-only relay
#[derive(Parser, Debug)]
#[command(name = "outpost")]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the relay
    #[command(long_about = r#"
Run the relay behind a TLS terminator that verifies node client certificates
and forwards the certificate subject as x-client-cert-* headers.

EXAMPLES:
  outpost relay --listen 127.0.0.1:8080 --state /var/lib/outpost/relay.json

ENVIRONMENT VARIABLES:
  OUTPOST_LISTEN                Bind address
  OUTPOST_STATE                 Relay configuration file
  OUTPOST_FORWARD_TIMEOUT_SECS  Wait for the response leg of a TCP forward
  OUTPOST_MAILBOX_CAPACITY      Outbound queue size per control tunnel
  OUTPOST_CONTROL_IDLE_TIMEOUT_SECS
                                Drop a control tunnel silent for this long
    "#)]
    Relay {
        #[arg(long, env = "OUTPOST_LISTEN", default_value = "127.0.0.1:8080")]
        listen: SocketAddr,

        #[arg(long, env = "OUTPOST_STATE", default_value = "outpost-relay.json")]
        state: PathBuf,

        #[arg(long, env = "OUTPOST_FORWARD_TIMEOUT_SECS", default_value = "60")]
        forward_timeout_secs: u64,

        #[arg(long, env = "OUTPOST_MAILBOX_CAPACITY", default_value = "256")]
        mailbox_capacity: usize,

        #[arg(long, env = "OUTPOST_CONTROL_IDLE_TIMEOUT_SECS", default_value = "90")]
        control_idle_timeout_secs: u64,
    },

    /// Run a node
    #[command(long_about = r#"
Keep a control tunnel to the relay open and serve the forward rules from the
node configuration file. Reconnects automatically.

The `outpost rules` commands only edit the configuration file. Send SIGHUP to
the running node to apply them; listeners are restarted to match the file.

EXAMPLES:
  outpost node --relay wss://relay.example.com \
    --cert node.crt --key node.key --config node.json

  # Apply rule changes to a running node
  outpost rules forwarding off && pkill -HUP -x outpost

ENVIRONMENT VARIABLES:
  OUTPOST_RELAY   Relay URL (ws:// or wss://)
  OUTPOST_CERT    Client certificate (PEM)
  OUTPOST_KEY     Client private key (PEM)
  OUTPOST_CA      Extra root CA for the relay (PEM)
  OUTPOST_CONFIG  Node configuration file
    "#)]
    Node {
        #[arg(long, env = "OUTPOST_RELAY")]
        relay: Url,

        #[arg(long, env = "OUTPOST_CERT", requires = "key")]
        cert: Option<PathBuf>,

        #[arg(long, env = "OUTPOST_KEY", requires = "cert")]
        key: Option<PathBuf>,

        #[arg(long, env = "OUTPOST_CA")]
        ca: Option<PathBuf>,

        /// Skip relay certificate verification (development only)
        #[arg(long)]
        insecure: bool,

        #[arg(long, env = "OUTPOST_CONFIG", default_value = "outpost-node.json")]
        config: PathBuf,

        /// Maximum reconnection attempts (0 = infinite)
        #[arg(long, default_value = "0")]
        max_reconnect_attempts: usize,

        /// How long a forwarded datagram waits for its reply
        #[arg(long, default_value = "30")]
        udp_reply_timeout_secs: u64,
    },

    /// Edit the forward rules of a node (SIGHUP the node to apply)
    Rules {
        #[arg(long, env = "OUTPOST_CONFIG", default_value = "outpost-node.json")]
        config: PathBuf,

        #[command(subcommand)]
        action: RulesAction,
    },
}

#[derive(Subcommand, Debug)]
enum RulesAction {
    /// Add a rule and print its id
    #[command(long_about = r#"
EXAMPLES:
  # Expose office-db's PostgreSQL on this host's port 5433
  outpost rules add --listen 127.0.0.1:5433 --node office-db --target 127.0.0.1:5432

  # Forward DNS queries to a resolver next to another node
  outpost rules add --protocol udp --listen 127.0.0.1:5353 --node branch --target 10.0.0.2:53
    "#)]
    Add {
        #[arg(long, value_enum, default_value = "tcp")]
        protocol: Protocol,

        /// Local address to listen on, host:port
        #[arg(long)]
        listen: String,

        /// Certificate id of the node that reaches the target
        #[arg(long)]
        node: String,

        /// Target address as seen from that node, host:port
        #[arg(long)]
        target: String,

        /// Save the rule disabled
        #[arg(long)]
        disabled: bool,
    },

    /// List rules
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Remove a rule
    Remove { id: String },

    /// Enable a rule
    Enable { id: String },

    /// Disable a rule
    Disable { id: String },

    /// Turn forwarding as a whole on or off
    Forwarding {
        #[arg(value_enum)]
        state: Switch,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Protocol {
    Tcp,
    Udp,
}

impl From<Protocol> for ForwardProtocol {
    fn from(value: Protocol) -> Self {
        match value {
            Protocol::Tcp => ForwardProtocol::Tcp,
            Protocol::Udp => ForwardProtocol::Udp,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Switch {
    On,
    Off,
}

/// Setup logging; RUST_LOG takes precedence over --verbose
fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

/// Split `host:port`, accepting bracketed IPv6 hosts
fn split_host_port(value: &str) -> Result<(String, u16)> {
    let (host, port) = value
        .rsplit_once(':')
        .with_context(|| format!("'{}' is not host:port", value))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        bail!("'{}' has no host", value);
    }
    let port = port
        .parse()
        .with_context(|| format!("'{}' has an invalid port", value))?;
    Ok((host.to_string(), port))
}

async fn run_relay(listen: SocketAddr, state: PathBuf, settings: RelaySettings) -> Result<()> {
    let store = Arc::new(JsonFileStore::new(&state));
    let relay = RelayState::new(store, settings)
        .with_context(|| format!("Failed to load relay state from {}", state.display()))?;
    info!(
        nodes = relay.registry.nodes().len(),
        state = %state.display(),
        "Relay state loaded"
    );

    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to bind {}", listen))?;
    info!("Relay listening on {}", listen);

    axum::serve(listener, relay_router(relay))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received Ctrl+C, shutting down...");
        })
        .await
        .context("Relay server failed")?;

    info!("Relay stopped");
    Ok(())
}

async fn run_node(settings: NodeSettings, config: PathBuf) -> Result<()> {
    info!(relay = %settings.relay_url, config = %config.display(), "Node starting...");
    let node = Node::start(settings, NodeConfigStore::new(config))
        .await
        .context("Failed to start node")?;
    log_rule_errors(&node);

    let (reload_tx, reload_rx) = mpsc::channel(1);
    forward_reload_signal(reload_tx)?;

    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down...");
    };
    let result = serve_node(&node, reload_rx, ctrl_c).await;

    node.shutdown();
    info!("Node stopped");
    result
}

/// Run until `shutdown` resolves or the control client gives up, reloading the
/// configuration on every message from `reloads`
async fn serve_node(
    node: &Node,
    mut reloads: mpsc::Receiver<()>,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    let wait = node.wait();
    tokio::pin!(wait, shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => return Ok(()),
            result = &mut wait => {
                if let Err(e) = result {
                    error!("Node stopped: {}", e);
                    return Err(e.into());
                }
                return Ok(());
            }
            Some(()) = reloads.recv() => {
                info!("Reloading node configuration");
                match node.reload().await {
                    Ok(()) => log_rule_errors(node),
                    Err(e) => error!("Reload failed, keeping current listeners: {}", e),
                }
            }
        }
    }
}

fn log_rule_errors(node: &Node) {
    for (id, state) in node.manager().runtime_states() {
        if let Some(error) = state.last_error {
            warn!(rule_id = %id, "Rule not running: {}", error);
        }
    }
}

/// Turn SIGHUP into reload requests
#[cfg(unix)]
fn forward_reload_signal(reloads: mpsc::Sender<()>) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;
    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            // A reload already queued covers this one
            let _ = reloads.try_send(());
        }
    });
    Ok(())
}

#[cfg(not(unix))]
fn forward_reload_signal(_reloads: mpsc::Sender<()>) -> Result<()> {
    Ok(())
}

fn run_rules(store: NodeConfigStore, action: RulesAction) -> Result<()> {
    match action {
        RulesAction::Add {
            protocol,
            listen,
            node,
            target,
            disabled,
        } => {
            let (listen_address, listen_port) = split_host_port(&listen)?;
            let (target_address, target_port) = split_host_port(&target)?;
            let id = store.add_rule(ForwardRuleDraft {
                enabled: !disabled,
                protocol: protocol.into(),
                listen_address,
                listen_port,
                target_node_id: node,
                target_address,
                target_port,
            })?;
            println!("{}", id);
        }
        RulesAction::List { json } => {
            let config = store.load()?;
            if json {
                let rules: Vec<_> = config.rules.iter().collect();
                println!("{}", serde_json::to_string_pretty(&rules)?);
                return Ok(());
            }
            println!(
                "forwarding: {}",
                if config.forwarding_enabled { "on" } else { "off" }
            );
            for rule in config.rules.iter() {
                println!(
                    "{}  {:<3}  {:<8}  {} -> {} @ {}",
                    rule.id,
                    rule.protocol,
                    if rule.enabled { "enabled" } else { "disabled" },
                    rule.listen_endpoint(),
                    rule.target_endpoint(),
                    rule.target_node_id
                );
            }
        }
        RulesAction::Remove { id } => store.remove_rule(&RuleId::from(id))?,
        RulesAction::Enable { id } => store.set_rule_enabled(&RuleId::from(id), true)?,
        RulesAction::Disable { id } => store.set_rule_enabled(&RuleId::from(id), false)?,
        RulesAction::Forwarding { state } => {
            store.set_forwarding_enabled(matches!(state, Switch::On))?
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    match cli.command {
        Commands::Relay {
            listen,
            state,
            forward_timeout_secs,
            mailbox_capacity,
            control_idle_timeout_secs,
        } => {
            let settings = RelaySettings {
                forward_timeout: Duration::from_secs(forward_timeout_secs),
                mailbox_capacity,
                control_idle_timeout: Duration::from_secs(control_idle_timeout_secs),
            };
            run_relay(listen, state, settings).await
        }
        Commands::Node {
            relay,
            cert,
            key,
            ca,
            insecure,
            config,
            max_reconnect_attempts,
            udp_reply_timeout_secs,
        } => {
            let mut websocket = WebSocketConfig::client_default();
            if let (Some(cert), Some(key)) = (cert, key) {
                websocket = websocket.with_client_certificate(cert, key);
            }
            if let Some(ca) = ca {
                websocket = websocket.with_root_ca(ca);
            }
            if insecure {
                warn!("Certificate verification disabled (insecure mode)");
                websocket = websocket.with_insecure_skip_verify();
            }

            let mut settings = NodeSettings::new(relay, websocket);
            settings.reconnect = ReconnectConfig {
                max_attempts: (max_reconnect_attempts > 0).then_some(max_reconnect_attempts),
                ..ReconnectConfig::default()
            };
            settings.udp_reply_timeout = Duration::from_secs(udp_reply_timeout_secs);

            run_node(settings, config).await
        }
        Commands::Rules { config, action } => run_rules(NodeConfigStore::new(config), action),
    }
}
