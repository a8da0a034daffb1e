pub mod memory;
pub mod transport;

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

use crate::broker_config::BrokerConfig;
use transport::{BrokerClient, Connector};

pub async fn connect_cluster(
    connector: &dyn Connector,
    config: &BrokerConfig,
) -> Result<Arc<dyn BrokerClient>> {
    let client = connector
        .connect(config)
        .await
        .with_context(|| format!("Failed to connect to {}", config.endpoints.join(",")))?;

    info!(
        client_id = %config.client_id,
        tls = config.tls,
        user = config.username().unwrap_or("anonymous"),
        "✓ Connected to cluster"
    );
    Ok(client)
}
