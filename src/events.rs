use serde::Serialize;
use tokio::sync::mpsc;

/// Notifications pushed up to the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportEvent {
    /// A decoded message arrived on a subscribed topic.
    Message { topic: String, message: String },
    /// The managed node process exited without being asked to.
    DaemonStopped,
    /// A swarm key was applied or cleared.
    NetworkModeChanged { active: bool, name: Option<String> },
}

pub type EventSender = mpsc::UnboundedSender<TransportEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}
