//! Wiring of a running node

use outpost_proto::RuleId;
use outpost_transport_websocket::RelayConnector;
use std::sync::{Arc, Mutex};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{error, info};

use crate::config::NodeConfigStore;
use crate::control::{ControlClient, ControlHandle};
use crate::manager::{ForwardManager, ForwardRuntimeState};
use crate::tcp::TcpResponder;
use crate::udp::{UdpDelivery, UdpTerminator};
use crate::{NodeError, NodeSettings};

pub struct Node {
    control: ControlHandle,
    manager: ForwardManager,
    config: NodeConfigStore,
    client: Mutex<Option<JoinHandle<Result<(), NodeError>>>>,
    client_abort: AbortHandle,
}

impl Node {
    /// Connect the control tunnel in the background and start the configured
    /// forward rules
    pub async fn start(
        settings: NodeSettings,
        config: NodeConfigStore,
    ) -> Result<Self, NodeError> {
        let connector =
            RelayConnector::new(settings.relay_url.clone(), Arc::new(settings.websocket))?;
        let control = ControlHandle::new(settings.mailbox_capacity);
        let manager = ForwardManager::new(control.clone(), connector.clone());

        control.add_reader(TcpResponder::new(connector.clone(), control.clone()));
        control.add_reader(UdpTerminator::new(control.clone(), settings.udp_reply_timeout));
        control.add_reader(UdpDelivery::new(manager.udp_sockets()));

        let client = ControlClient::new(
            connector,
            control.clone(),
            settings.reconnect,
            settings.keepalive_interval,
        );
        let client = tokio::spawn(client.run());
        let client_abort = client.abort_handle();

        let node = Self {
            control,
            manager,
            config,
            client: Mutex::new(Some(client)),
            client_abort,
        };
        node.reload().await?;
        Ok(node)
    }

    pub fn control(&self) -> &ControlHandle {
        &self.control
    }

    pub fn manager(&self) -> &ForwardManager {
        &self.manager
    }

    pub fn runtime_state(&self, id: &RuleId) -> ForwardRuntimeState {
        self.manager.runtime_state(id)
    }

    /// Re-read the configuration and restart listeners to match it
    pub async fn reload(&self) -> Result<(), NodeError> {
        let config = self.config.load()?;
        if config.forwarding_enabled {
            self.manager.start(&config.rules).await;
        } else {
            info!("Forwarding disabled");
            self.manager.stop().await;
        }
        Ok(())
    }

    /// Disabling stops every listener at once. Enabling only flips the
    /// switch; listeners come back on the next reload.
    pub async fn set_forwarding_enabled(&self, enabled: bool) -> Result<(), NodeError> {
        self.config.set_forwarding_enabled(enabled)?;
        if !enabled {
            self.manager.stop().await;
        }
        Ok(())
    }

    /// Wait for the control client to give up
    pub async fn wait(&self) -> Result<(), NodeError> {
        let client = self
            .client
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        match client {
            Some(client) => match client.await {
                Ok(result) => result,
                Err(e) if e.is_cancelled() => Ok(()),
                Err(e) => {
                    error!("Control client task failed: {}", e);
                    Ok(())
                }
            },
            None => Ok(()),
        }
    }

    /// Drop the control tunnel and every listener
    pub fn shutdown(&self) {
        self.client_abort.abort();
        self.manager.abort_all();
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.shutdown();
    }
}
