use anyhow::Result;
use ipfs_pubsub_bridge::config::Config;
use ipfs_pubsub_bridge::{metrics, Controller, StartOutcome, TransportEvent};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging with filters
    // Connection pool chatter from the HTTP stack is rarely useful here
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("info")
                    .add_directive("hyper=warn".parse().expect("static directive"))
                    .add_directive("reqwest=warn".parse().expect("static directive"))
            }),
        )
        .init();

    metrics::init_metrics();

    let config = Config::load()?;
    tracing::info!(repo = %config.repo_path.display(), "Starting pubsub bridge");

    let (mut controller, mut events) = Controller::from_config(&config).await?;

    match controller.start_daemon().await? {
        StartOutcome::Adopted => tracing::info!("Using the node that was already running"),
        StartOutcome::AlreadyRunning => {}
        StartOutcome::Spawned { ready } => tracing::info!(ready, "Started managed node"),
    }

    match controller.swarm_key_status().await {
        Ok(status) if status.active => tracing::info!(
            name = status.name.as_deref().unwrap_or("<unnamed>"),
            "Private network mode"
        ),
        Ok(_) => tracing::info!("Public network mode"),
        Err(e) => tracing::warn!("Could not read swarm key status: {}", e),
    }

    for topic in &config.topics {
        controller.subscribe(topic);
    }

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Some(TransportEvent::Message { topic, message }) => {
                        tracing::info!(topic = %topic, "{}", message);
                    }
                    Some(TransportEvent::DaemonStopped) => {
                        tracing::error!("Node stopped unexpectedly, exiting");
                        break;
                    }
                    Some(TransportEvent::NetworkModeChanged { active, name }) => {
                        tracing::info!(active, ?name, "Network mode changed");
                    }
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown requested");
                break;
            }
        }
    }

    controller.shutdown().await?;
    tracing::debug!("Final metrics:\n{}", metrics::export_metrics());
    Ok(())
}
