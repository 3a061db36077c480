//! Listener lifecycle for the node's forward rules
//!
//! Start and stop act on the whole rule set. Each enabled rule gets one
//! listener task; its runtime state is read back from the task and from the
//! last error it recorded.

use outpost_proto::{ForwardProtocol, ForwardRule, RuleId, RuleSet};
use outpost_transport_websocket::RelayConnector;
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::control::ControlHandle;
use crate::udp::UdpSocketTable;
use crate::{tcp, udp};

/// Ephemeral status of one rule
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardRuntimeState {
    pub is_running: bool,
    pub last_error: Option<String>,
    /// Address actually bound, useful when the rule asks for port 0
    pub local_addr: Option<SocketAddr>,
}

/// Last error of a rule, shared with its listener task
#[derive(Debug, Clone, Default)]
pub(crate) struct RuleStatus {
    last_error: Arc<Mutex<Option<String>>>,
}

impl RuleStatus {
    pub(crate) fn record_error(&self, error: String) {
        *self.last_error.lock().unwrap_or_else(|p| p.into_inner()) = Some(error);
    }

    pub(crate) fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

struct RuleEntry {
    task: Option<JoinHandle<()>>,
    status: RuleStatus,
    local_addr: Option<SocketAddr>,
}

pub struct ForwardManager {
    control: ControlHandle,
    connector: RelayConnector,
    udp_sockets: UdpSocketTable,
    rules: Mutex<HashMap<RuleId, RuleEntry>>,
}

impl ForwardManager {
    pub fn new(control: ControlHandle, connector: RelayConnector) -> Self {
        Self {
            control,
            connector,
            udp_sockets: UdpSocketTable::default(),
            rules: Mutex::new(HashMap::new()),
        }
    }

    /// Sockets that UDP replies are delivered through
    pub fn udp_sockets(&self) -> UdpSocketTable {
        self.udp_sockets.clone()
    }

    /// Tear down every listener, then bind one per enabled rule.
    /// Bind failures are kept in the rule's runtime state.
    pub async fn start(&self, rules: &RuleSet) {
        self.stop().await;

        let mut started = HashMap::new();
        for rule in rules.enabled() {
            let rule = Arc::new(rule.clone());
            let entry = self.start_rule(rule.clone()).await;
            started.insert(rule.id.clone(), entry);
        }

        let running = started.values().filter(|entry| entry.task.is_some()).count();
        info!(running, failed = started.len() - running, "Forward rules started");

        let stale: Vec<RuleEntry> = {
            let mut current = self.lock();
            let stale = current.drain().map(|(_, entry)| entry).collect();
            *current = started;
            stale
        };
        for entry in stale {
            abort(entry);
        }
    }

    /// Tear down every listener and wait until their sockets are released.
    /// Flows already in progress are left alone.
    pub async fn stop(&self) {
        for task in self.abort_listeners() {
            // An aborted task resolves once its future, and the socket it
            // owns, has been dropped
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!("Forward listener task failed: {}", e);
                }
            }
        }
    }

    /// Abort every listener without waiting for it to wind down
    pub fn abort_all(&self) {
        self.abort_listeners();
    }

    fn abort_listeners(&self) -> Vec<JoinHandle<()>> {
        let stopped: Vec<RuleEntry> = self.lock().drain().map(|(_, entry)| entry).collect();
        self.udp_sockets.clear();
        if !stopped.is_empty() {
            info!(count = stopped.len(), "Forward rules stopped");
        }
        stopped
            .into_iter()
            .filter_map(|entry| entry.task)
            .inspect(JoinHandle::abort)
            .collect()
    }

    pub fn runtime_state(&self, id: &RuleId) -> ForwardRuntimeState {
        self.lock().get(id).map(entry_state).unwrap_or_default()
    }

    pub fn runtime_states(&self) -> HashMap<RuleId, ForwardRuntimeState> {
        self.lock()
            .iter()
            .map(|(id, entry)| (id.clone(), entry_state(entry)))
            .collect()
    }

    async fn start_rule(&self, rule: Arc<ForwardRule>) -> RuleEntry {
        let status = RuleStatus::default();
        let endpoint = rule.listen_endpoint();

        let bound = match rule.protocol {
            ForwardProtocol::Tcp => match TcpListener::bind(&endpoint).await {
                Ok(listener) => listener.local_addr().map(|addr| {
                    let task = tokio::spawn(tcp::serve_listener(
                        listener,
                        rule.clone(),
                        self.control.clone(),
                        self.connector.clone(),
                        status.clone(),
                    ));
                    (task, addr)
                }),
                Err(e) => Err(e),
            },
            ForwardProtocol::Udp => match UdpSocket::bind(&endpoint).await {
                Ok(socket) => socket.local_addr().map(|addr| {
                    let socket = Arc::new(socket);
                    self.udp_sockets.insert(rule.id.as_str(), socket.clone());
                    let task = tokio::spawn(udp::serve_socket(
                        socket,
                        rule.clone(),
                        self.control.clone(),
                        status.clone(),
                    ));
                    (task, addr)
                }),
                Err(e) => Err(e),
            },
        };

        match bound {
            Ok((task, addr)) => {
                info!(
                    rule_id = %rule.id,
                    protocol = %rule.protocol,
                    listen = %addr,
                    target_node_id = %rule.target_node_id,
                    target = %rule.target_endpoint(),
                    "Forward rule listening"
                );
                RuleEntry {
                    task: Some(task),
                    status,
                    local_addr: Some(addr),
                }
            }
            Err(e) => {
                warn!(rule_id = %rule.id, "Failed to bind {} {}: {}", rule.protocol, endpoint, e);
                status.record_error(format!("bind {} failed: {}", endpoint, e));
                RuleEntry {
                    task: None,
                    status,
                    local_addr: None,
                }
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<RuleId, RuleEntry>> {
        self.rules.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Drop for ForwardManager {
    fn drop(&mut self) {
        self.abort_all();
    }
}

fn abort(entry: RuleEntry) {
    if let Some(task) = entry.task {
        task.abort();
    }
}

fn entry_state(entry: &RuleEntry) -> ForwardRuntimeState {
    ForwardRuntimeState {
        is_running: entry.task.as_ref().is_some_and(|task| !task.is_finished()),
        last_error: entry.status.last_error(),
        local_addr: entry.local_addr,
    }
}
