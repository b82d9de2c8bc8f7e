//! Public / private network configuration profiles.
//!
//! The profile is derived from the repository: a `swarm.key` file means the
//! node must run as a private swarm. Settings are written one key at a time
//! and a failed key never stops the rest, since the node has no
//! transactional config command.

use crate::metrics;
use crate::node_config::ConfigStore;
use crate::swarm_key::SWARM_KEY_FILE;
use serde_json::{json, Value};
use std::path::Path;
use tracing::{info, warn};

/// Swarm listeners that stay enabled in every profile.
const TCP_QUIC_LISTENERS: [&str; 4] = [
    "/ip4/0.0.0.0/tcp/4001",
    "/ip6/::/tcp/4001",
    "/ip4/0.0.0.0/udp/4001/quic-v1",
    "/ip6/::/udp/4001/quic-v1",
];

const WEBSOCKET_LISTENER: &str = "/ip4/0.0.0.0/tcp/4002/ws";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkProfile {
    Public,
    Private,
}

impl NetworkProfile {
    pub fn detect(repo_path: &Path) -> Self {
        if repo_path.join(SWARM_KEY_FILE).is_file() {
            NetworkProfile::Private
        } else {
            NetworkProfile::Public
        }
    }

    pub fn settings(self) -> Vec<(&'static str, Value)> {
        match self {
            NetworkProfile::Private => {
                let mut settings = vec![
                    ("AutoConf.Enabled", json!(false)),
                    ("AutoTLS.Enabled", json!(false)),
                    ("Routing.Type", json!("dht")),
                ];
                settings.extend(private_strip_settings());
                settings.extend([
                    ("Swarm.Transports.Network.Websocket", json!(false)),
                    ("Addresses.Swarm", json!(TCP_QUIC_LISTENERS)),
                    ("Discovery.MDNS.Enabled", json!(true)),
                    ("Pubsub.Enabled", json!(true)),
                ]);
                settings
            }
            NetworkProfile::Public => {
                let mut listeners: Vec<&str> = TCP_QUIC_LISTENERS.to_vec();
                listeners.push(WEBSOCKET_LISTENER);
                vec![
                    ("AutoConf.Enabled", json!(true)),
                    ("Routing.Type", json!("auto")),
                    ("Swarm.Transports.Network.Websocket", json!(true)),
                    ("Addresses.Swarm", json!(listeners)),
                    ("Pubsub.Enabled", json!(true)),
                ]
            }
        }
    }
}

/// Bootstrap peers and `"auto"` placeholders removed for a private swarm.
/// Newer nodes refuse to start with unresolved placeholders once
/// auto-configuration is off.
pub fn private_strip_settings() -> Vec<(&'static str, Value)> {
    vec![
        ("Routing.DelegatedRouters", json!([])),
        ("Ipns.DelegatedPublishers", json!([])),
        ("DNS.Resolvers", json!({})),
        ("Bootstrap", json!([])),
    ]
}

/// Default bootstrap list and `"auto"` placeholders for the public network.
pub fn public_restore_settings() -> Vec<(&'static str, Value)> {
    vec![
        ("Bootstrap", json!(["auto"])),
        ("Routing.DelegatedRouters", json!(["auto"])),
        ("Ipns.DelegatedPublishers", json!(["auto"])),
        ("DNS.Resolvers", json!({ ".": "auto" })),
    ]
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ApplyReport {
    pub applied: usize,
    pub failed: Vec<String>,
}

/// Write every setting, logging and skipping the ones that fail.
pub async fn apply_settings(store: &dyn ConfigStore, settings: Vec<(&'static str, Value)>) -> ApplyReport {
    let mut report = ApplyReport::default();

    for (key, value) in settings {
        match store.set(key, value).await {
            Ok(()) => report.applied += 1,
            Err(e) => {
                warn!(key, "Config step failed, continuing: {}", e);
                metrics::CONFIG_STEP_FAILURES.with_label_values(&[key]).inc();
                report.failed.push(key.to_string());
            }
        }
    }

    report
}

/// Detect the profile for `repo_path` and apply it. Must run while no
/// daemon holds the repository.
pub async fn apply_profile(store: &dyn ConfigStore, repo_path: &Path) -> (NetworkProfile, ApplyReport) {
    let profile = NetworkProfile::detect(repo_path);
    let report = apply_settings(store, profile.settings()).await;
    info!(
        ?profile,
        applied = report.applied,
        failed = report.failed.len(),
        "Network profile applied"
    );
    (profile, report)
}
