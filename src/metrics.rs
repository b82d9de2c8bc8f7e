use lazy_static::lazy_static;
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Subscription metrics
    pub static ref MESSAGES_DELIVERED: IntCounter = IntCounter::new(
        "pubsub_messages_delivered_total",
        "Total number of decoded pubsub messages delivered to subscribers"
    ).unwrap();

    pub static ref UNDECODABLE_PAYLOADS: IntCounter = IntCounter::new(
        "pubsub_undecodable_payloads_total",
        "Total number of message payloads that could not be decoded"
    ).unwrap();

    pub static ref RECONNECTS_SCHEDULED: IntCounter = IntCounter::new(
        "pubsub_reconnects_scheduled_total",
        "Total number of subscription reconnects scheduled after a stream failure"
    ).unwrap();

    pub static ref HEALTH_RECONNECTS: IntCounter = IntCounter::new(
        "pubsub_health_reconnects_total",
        "Total number of subscriptions force-reconnected by the health check"
    ).unwrap();

    pub static ref ACTIVE_SUBSCRIPTIONS: IntGauge = IntGauge::new(
        "pubsub_active_subscriptions",
        "Current number of tracked topic subscriptions"
    ).unwrap();

    pub static ref PUBLISH_FAILURES: IntCounter = IntCounter::new(
        "pubsub_publish_failures_total",
        "Total number of publishes that failed after the retry"
    ).unwrap();

    // Node configuration metrics
    pub static ref CONFIG_STEP_FAILURES: IntCounterVec = IntCounterVec::new(
        Opts::new("node_config_step_failures_total", "Total number of failed configuration steps"),
        &["key"]
    ).unwrap();
}

/// Register all collectors. Safe to call more than once.
pub fn init_metrics() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(MESSAGES_DELIVERED.clone()),
        Box::new(UNDECODABLE_PAYLOADS.clone()),
        Box::new(RECONNECTS_SCHEDULED.clone()),
        Box::new(HEALTH_RECONNECTS.clone()),
        Box::new(ACTIVE_SUBSCRIPTIONS.clone()),
        Box::new(PUBLISH_FAILURES.clone()),
        Box::new(CONFIG_STEP_FAILURES.clone()),
    ];
    for collector in collectors {
        // AlreadyReg on repeated init
        let _ = REGISTRY.register(collector);
    }

    tracing::debug!("Metrics registry initialized with {} collectors", REGISTRY.gather().len());
}

/// Export metrics in Prometheus format
pub fn export_metrics() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!("Failed to encode metrics: {}", e);
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_contains_registered_counters() {
        init_metrics();
        init_metrics();
        MESSAGES_DELIVERED.inc();
        let text = export_metrics();
        assert!(text.contains("pubsub_messages_delivered_total"));
    }
}
