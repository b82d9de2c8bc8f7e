//! Entry point for UI-level requests.
//!
//! Wires the daemon manager, subscription engine and swarm key registry
//! together and owns the ordering rules between them: any change of
//! network identity first stops the managed node and drops every
//! subscription.

use crate::config::Config;
use crate::daemon::{DaemonManager, DaemonSettings, DaemonState, StartOutcome, STOP_GRACE_PERIOD};
use crate::error::{BridgeError, Result};
use crate::events::{event_channel, EventReceiver, EventSender, TransportEvent};
use crate::node_api::NodeApi;
use crate::node_config::{discover_api_port, CliConfigStore, ConfigStore};
use crate::profile::{apply_settings, private_strip_settings, public_restore_settings};
use crate::subscription::{SubscriptionEngine, SubscriptionPhase};
use crate::swarm_key::{self, SwarmKeyEntry, SwarmKeyRegistry, SwarmKeyStatus};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

pub struct Controller {
    repo_path: PathBuf,
    daemon: DaemonManager,
    engine: SubscriptionEngine,
    registry: SwarmKeyRegistry,
    config_store: Arc<dyn ConfigStore>,
    events: EventSender,
}

impl Controller {
    /// Build a controller for the node described by `config`, discovering
    /// the API port from the repository unless one is configured.
    pub async fn from_config(config: &Config) -> Result<(Self, EventReceiver)> {
        let store: Arc<dyn ConfigStore> = Arc::new(CliConfigStore::new(
            config.ipfs_binary.clone(),
            config.repo_path.clone(),
        ));
        let port = match config.api_port {
            Some(port) => port,
            None => discover_api_port(store.as_ref()).await,
        };
        let api = NodeApi::new(&config.api_host, port)?;
        info!(api = api.base_url(), repo = %config.repo_path.display(), "Node API configured");

        let settings = DaemonSettings {
            binary: config.ipfs_binary.clone(),
            repo_path: config.repo_path.clone(),
            readiness_timeout: config.readiness_timeout(),
            stop_grace: STOP_GRACE_PERIOD,
        };
        Ok(Self::new(
            settings,
            api,
            store,
            SwarmKeyRegistry::new(config.swarm_key_registry.clone()),
        ))
    }

    pub fn new(
        settings: DaemonSettings,
        api: NodeApi,
        config_store: Arc<dyn ConfigStore>,
        registry: SwarmKeyRegistry,
    ) -> (Self, EventReceiver) {
        let (events, rx) = event_channel();
        let engine = SubscriptionEngine::new(api.clone(), events.clone());
        let repo_path = settings.repo_path.clone();
        let daemon = DaemonManager::new(
            settings,
            api,
            config_store.clone(),
            engine.clone(),
            events.clone(),
        );
        let controller = Self {
            repo_path,
            daemon,
            engine,
            registry,
            config_store,
            events,
        };
        (controller, rx)
    }

    pub fn engine(&self) -> &SubscriptionEngine {
        &self.engine
    }

    // Daemon

    pub async fn start_daemon(&mut self) -> Result<StartOutcome> {
        self.daemon.start().await
    }

    pub async fn stop_daemon(&mut self) -> Result<bool> {
        self.daemon.stop().await
    }

    pub fn daemon_state(&self) -> DaemonState {
        self.daemon.state()
    }

    /// Pid of the managed node, if one is running.
    pub fn daemon_pid(&self) -> Option<u32> {
        self.daemon.pid()
    }

    // Pubsub

    pub fn subscribe(&self, topic: &str) {
        self.engine.subscribe(topic);
    }

    pub fn unsubscribe(&self, topic: &str) {
        self.engine.unsubscribe(topic);
    }

    pub async fn publish(&self, topic: &str, message: &str) -> Result<()> {
        self.engine.publish(topic, message.as_bytes()).await
    }

    pub async fn peers(&self, topic: &str) -> Result<Vec<String>> {
        self.engine.peers(topic).await
    }

    pub fn subscriptions(&self) -> Vec<(String, SubscriptionPhase)> {
        self.engine
            .topics()
            .into_iter()
            .filter_map(|t| self.engine.phase(&t).map(|p| (t, p)))
            .collect()
    }

    // Swarm keys

    pub fn generate_swarm_key(&self) -> String {
        swarm_key::generate()
    }

    pub async fn list_swarm_keys(&self) -> Result<Vec<SwarmKeyEntry>> {
        self.registry.list().await
    }

    pub async fn save_swarm_key(&self, name: &str, key: &str) -> Result<()> {
        self.registry.save(name, key).await
    }

    pub async fn delete_swarm_key(&self, name: &str) -> Result<bool> {
        self.registry.delete(name).await
    }

    pub async fn swarm_key_status(&self) -> Result<SwarmKeyStatus> {
        self.registry.status(&self.repo_path).await
    }

    /// Switch the repository to the private swarm keyed by `name`.
    pub async fn apply_swarm_key(&mut self, name: &str) -> Result<SwarmKeyStatus> {
        let entry = self
            .registry
            .get(name)
            .await?
            .ok_or_else(|| BridgeError::SwarmKeyError(format!("no saved key named '{}'", name)))?;

        self.daemon.stop().await?;
        self.engine.teardown();

        swarm_key::install_key(&self.repo_path, &entry.key).await?;
        apply_settings(self.config_store.as_ref(), private_strip_settings()).await;
        info!(name, "Swarm key applied");

        let _ = self.events.send(TransportEvent::NetworkModeChanged {
            active: true,
            name: Some(entry.name.clone()),
        });
        Ok(SwarmKeyStatus {
            active: true,
            name: Some(entry.name),
        })
    }

    /// Return the repository to the public network.
    pub async fn clear_swarm_key(&mut self) -> Result<()> {
        self.daemon.stop().await?;
        self.engine.teardown();

        swarm_key::remove_key(&self.repo_path).await?;
        apply_settings(self.config_store.as_ref(), public_restore_settings()).await;
        info!("Swarm key cleared, public network restored");

        let _ = self.events.send(TransportEvent::NetworkModeChanged {
            active: false,
            name: None,
        });
        Ok(())
    }

    /// Process teardown: drop every subscription and stop a managed node.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.engine.teardown();
        self.daemon.stop().await?;
        Ok(())
    }
}
