//! Node registry: persisted catalog plus live instances
//!
//! A node is identified by its certificate id and may have any number of
//! concurrent live instances, one per control tunnel. The catalog of
//! registered nodes is persisted through a [`ConfigStore`]; live instances are
//! memory only.

use chrono::{DateTime, Utc};
use outpost_bus::EventBus;
use outpost_proto::{CertificateSubject, NodeIdentity};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::events::AdminEvent;
use crate::store::{ConfigStore, RegisteredNode, StoreError};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Node {0} is not registered")]
    NodeNotFound(String),

    #[error("Node {certificate_id} still has {instances} live instance(s)")]
    NodeOnline {
        certificate_id: String,
        instances: usize,
    },

    #[error("Instance {0} is already connected")]
    InstanceConflict(String),

    #[error("Failed to persist node catalog: {0}")]
    Store(#[from] StoreError),
}

/// One live control tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveInstance {
    pub identity: NodeIdentity,
    pub remote_addr: String,
    pub connected_at: DateTime<Utc>,
    pub protocol_version: u32,
    pub certificate_expires_at: Option<DateTime<Utc>>,
}

/// What the relay knows about a connecting tunnel
#[derive(Debug, Clone)]
pub struct InstanceMetadata {
    pub remote_addr: String,
    pub protocol_version: u32,
    pub subject: CertificateSubject,
}

/// Editable catalog fields; `None` leaves a field unchanged
#[derive(Debug, Clone, Default)]
pub struct NodeChanges {
    pub display_name: Option<String>,
    pub remark: Option<String>,
}

#[derive(Default)]
struct RegistryState {
    catalog: Vec<RegisteredNode>,
    instances: HashMap<String, Vec<LiveInstance>>,
}

/// Registry of nodes known to this relay
#[derive(Clone)]
pub struct NodeRegistry {
    state: Arc<Mutex<RegistryState>>,
    store: Arc<dyn ConfigStore>,
    events: EventBus<AdminEvent>,
}

impl std::fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("NodeRegistry")
            .field("nodes", &state.catalog.len())
            .field("online", &state.instances.len())
            .finish()
    }
}

impl NodeRegistry {
    /// Build a registry from the persisted catalog
    pub fn load(
        store: Arc<dyn ConfigStore>,
        events: EventBus<AdminEvent>,
    ) -> Result<Self, RegistryError> {
        let config = store.load()?;
        info!(nodes = config.nodes.len(), "Loaded node catalog");

        Ok(Self {
            state: Arc::new(Mutex::new(RegistryState {
                catalog: config.nodes,
                instances: HashMap::new(),
            })),
            store,
            events,
        })
    }

    /// Record a newly accepted control tunnel.
    ///
    /// The instance is live when this returns `Ok`. An instance id that is
    /// already live is refused without touching the registry. A failure to
    /// persist the catalog is logged; the catalog then keeps its previous
    /// contents.
    pub fn node_online(
        &self,
        identity: &NodeIdentity,
        metadata: InstanceMetadata,
    ) -> Result<(), RegistryError> {
        let certificate_id = identity.certificate_id.clone();
        let now = Utc::now();
        let mut events = Vec::new();

        {
            let mut state = self.lock();
            if state
                .instances
                .values()
                .flatten()
                .any(|instance| instance.identity.instance_id == identity.instance_id)
            {
                return Err(RegistryError::InstanceConflict(
                    identity.instance_id.clone(),
                ));
            }

            let is_new = !state
                .catalog
                .iter()
                .any(|node| node.certificate_id == certificate_id);
            let was_offline = state
                .instances
                .get(&certificate_id)
                .map_or(true, Vec::is_empty);

            if is_new || was_offline {
                let mut catalog = state.catalog.clone();
                if is_new {
                    catalog.push(RegisteredNode {
                        certificate_id: certificate_id.clone(),
                        display_name: default_display_name(&metadata.subject, &certificate_id),
                        remark: String::new(),
                        account: metadata.subject.organization.clone(),
                        registered_at: now,
                        registered_ip: metadata.remote_addr.clone(),
                        last_online_at: None,
                        last_offline_at: None,
                        last_address: None,
                    });
                }
                if let Some(node) = catalog
                    .iter_mut()
                    .find(|node| node.certificate_id == certificate_id)
                {
                    node.last_online_at = Some(now);
                    node.last_address = Some(metadata.remote_addr.clone());
                }

                match self.persist(&catalog) {
                    Ok(()) => {
                        if is_new {
                            let display_name = catalog
                                .last()
                                .map(|node| node.display_name.clone())
                                .unwrap_or_default();
                            events.push(AdminEvent::NodeRegistered {
                                certificate_id: certificate_id.clone(),
                                display_name,
                            });
                        }
                        state.catalog = catalog;
                    }
                    Err(e) => warn!(
                        certificate_id = %certificate_id,
                        "Failed to persist node coming online: {}", e
                    ),
                }
            }

            state
                .instances
                .entry(certificate_id.clone())
                .or_default()
                .push(LiveInstance {
                    identity: identity.clone(),
                    remote_addr: metadata.remote_addr.clone(),
                    connected_at: now,
                    protocol_version: metadata.protocol_version,
                    certificate_expires_at: metadata.subject.not_after,
                });

            events.push(AdminEvent::InstanceOnline {
                identity: identity.clone(),
                remote_addr: metadata.remote_addr.clone(),
            });
            if was_offline {
                events.push(AdminEvent::NodeOnline {
                    certificate_id: certificate_id.clone(),
                });
            }
        }

        info!(
            instance_id = %identity.instance_id,
            certificate_id = %certificate_id,
            remote_addr = %metadata.remote_addr,
            "Node instance online"
        );
        self.publish(events);
        Ok(())
    }

    /// Record a closed control tunnel. Returns false for an unknown instance.
    pub fn node_offline(&self, identity: &NodeIdentity) -> bool {
        let certificate_id = &identity.certificate_id;
        let mut events = Vec::new();

        {
            let mut state = self.lock();
            let Some(instances) = state.instances.get_mut(certificate_id) else {
                return false;
            };
            let Some(position) = instances
                .iter()
                .position(|instance| instance.identity.instance_id == identity.instance_id)
            else {
                return false;
            };
            instances.remove(position);
            let remaining = instances.len();

            events.push(AdminEvent::InstanceOffline {
                identity: identity.clone(),
            });

            if remaining == 0 {
                state.instances.remove(certificate_id);

                let mut catalog = state.catalog.clone();
                if let Some(node) = catalog
                    .iter_mut()
                    .find(|node| &node.certificate_id == certificate_id)
                {
                    node.last_offline_at = Some(Utc::now());
                    match self.persist(&catalog) {
                        Ok(()) => state.catalog = catalog,
                        Err(e) => warn!(
                            certificate_id = %certificate_id,
                            "Failed to persist node going offline: {}", e
                        ),
                    }
                }

                events.push(AdminEvent::NodeOffline {
                    certificate_id: certificate_id.clone(),
                });
            }
        }

        info!(
            instance_id = %identity.instance_id,
            certificate_id = %certificate_id,
            "Node instance offline"
        );
        self.publish(events);
        true
    }

    /// Update editable fields. Returns whether anything changed.
    pub fn node_modify(
        &self,
        certificate_id: &str,
        changes: NodeChanges,
    ) -> Result<bool, RegistryError> {
        let event = {
            let mut state = self.lock();
            let mut catalog = state.catalog.clone();
            let node = catalog
                .iter_mut()
                .find(|node| node.certificate_id == certificate_id)
                .ok_or_else(|| RegistryError::NodeNotFound(certificate_id.to_string()))?;

            let mut changed = false;
            if let Some(display_name) = changes.display_name {
                if node.display_name != display_name {
                    node.display_name = display_name;
                    changed = true;
                }
            }
            if let Some(remark) = changes.remark {
                if node.remark != remark {
                    node.remark = remark;
                    changed = true;
                }
            }

            if !changed {
                debug!(certificate_id, "Node modification is a no-op");
                return Ok(false);
            }

            let event = AdminEvent::NodeModified {
                certificate_id: certificate_id.to_string(),
                display_name: node.display_name.clone(),
                remark: node.remark.clone(),
            };
            self.persist(&catalog)?;
            state.catalog = catalog;
            event
        };

        info!(certificate_id, "Node modified");
        self.events.publish(event);
        Ok(true)
    }

    /// Remove a node from the catalog. Refused while it has live instances.
    pub fn node_delete(&self, certificate_id: &str) -> Result<(), RegistryError> {
        {
            let mut state = self.lock();
            let live = state.instances.get(certificate_id).map_or(0, Vec::len);
            if live > 0 {
                return Err(RegistryError::NodeOnline {
                    certificate_id: certificate_id.to_string(),
                    instances: live,
                });
            }

            let mut catalog = state.catalog.clone();
            let before = catalog.len();
            catalog.retain(|node| node.certificate_id != certificate_id);
            if catalog.len() == before {
                return Err(RegistryError::NodeNotFound(certificate_id.to_string()));
            }

            self.persist(&catalog)?;
            state.catalog = catalog;
        }

        info!(certificate_id, "Node revoked");
        self.events.publish(AdminEvent::NodeRevoked {
            certificate_id: certificate_id.to_string(),
        });
        Ok(())
    }

    /// Live instances of a node, oldest first
    pub fn instances(&self, certificate_id: &str) -> Vec<LiveInstance> {
        self.lock()
            .instances
            .get(certificate_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn find_instance(&self, instance_id: &str) -> Option<LiveInstance> {
        self.lock()
            .instances
            .values()
            .flatten()
            .find(|instance| instance.identity.instance_id == instance_id)
            .cloned()
    }

    /// The most recently connected instance of a node
    pub fn resolve_instance(&self, certificate_id: &str) -> Option<LiveInstance> {
        self.lock()
            .instances
            .get(certificate_id)
            .and_then(|instances| instances.last())
            .cloned()
    }

    pub fn node(&self, certificate_id: &str) -> Option<RegisteredNode> {
        self.lock()
            .catalog
            .iter()
            .find(|node| node.certificate_id == certificate_id)
            .cloned()
    }

    pub fn nodes(&self) -> Vec<RegisteredNode> {
        self.lock().catalog.clone()
    }

    pub fn is_online(&self, certificate_id: &str) -> bool {
        self.lock()
            .instances
            .get(certificate_id)
            .is_some_and(|instances| !instances.is_empty())
    }

    pub fn live_instance_count(&self) -> usize {
        self.lock().instances.values().map(Vec::len).sum()
    }

    pub fn events(&self) -> &EventBus<AdminEvent> {
        &self.events
    }

    /// Load the document, swap in `catalog`, save it back
    fn persist(&self, catalog: &[RegisteredNode]) -> Result<(), StoreError> {
        let mut config = self.store.load()?;
        config.nodes = catalog.to_vec();
        self.store.save(&config)
    }

    fn publish(&self, events: Vec<AdminEvent>) {
        for event in events {
            self.events.publish(event);
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn default_display_name(subject: &CertificateSubject, certificate_id: &str) -> String {
    let common_name = subject.common_name.trim();
    if common_name.is_empty() {
        certificate_id.to_string()
    } else {
        common_name.to_string()
    }
}
