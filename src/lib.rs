pub mod codec;
pub mod config;
pub mod controller;
pub mod daemon;
pub mod error;
pub mod events;
pub mod metrics;
pub mod node_api;
pub mod node_config;
pub mod profile;
pub mod retry;
pub mod subscription;
pub mod swarm_key;

// Re-export commonly used types for easier testing
pub use crate::codec::{decode_payload, decode_topic, encode_topic, split_concatenated_records};
pub use crate::controller::Controller;
pub use crate::daemon::{DaemonManager, DaemonSettings, DaemonState, Ownership, StartOutcome};
pub use crate::error::BridgeError;
pub use crate::events::{event_channel, EventReceiver, EventSender, TransportEvent};
pub use crate::node_api::NodeApi;
pub use crate::node_config::{CliConfigStore, ConfigStore};
pub use crate::profile::NetworkProfile;
pub use crate::subscription::{SubscriptionEngine, SubscriptionPhase};
pub use crate::swarm_key::{SwarmKeyEntry, SwarmKeyRegistry, SwarmKeyStatus};
