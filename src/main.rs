use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use group_consumer::{
    app_config::AppConfig,
    assignment::{AssignmentContext, AssignmentStrategy},
    handler::LoggingHandler,
    infra::memory::MemoryCluster,
    models::{GenerationId, GroupMember, ProducerRecord, TopicMetadata},
    producer::SyncProducer,
    status_server,
    supervisor::{GroupConsumer, SessionEvent},
};

const DEMO_KEYS: [&str; 3] = ["foo", "bar", "baz"];

#[derive(Parser)]
#[command(name = "group-consumer", version, about = "Consumer group coordination demo")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Publish keyed demo messages and report where each landed
    Produce {
        #[arg(long, default_value_t = 10)]
        messages: usize,
        #[arg(long, default_value_t = 6)]
        partitions: i32,
    },
    /// Run group members until SIGINT/SIGTERM
    Consume {
        #[arg(long, default_value_t = 1)]
        members: usize,
        #[arg(long, default_value_t = 30)]
        messages: usize,
        #[arg(long, default_value_t = 6)]
        partitions: i32,
    },
    /// Print the assignment a strategy computes, without a cluster
    Assign {
        #[arg(long, value_delimiter = ',', required = true)]
        members: Vec<String>,
        /// name:partitions, repeatable
        #[arg(long = "topic", required = true)]
        topics: Vec<String>,
        #[arg(long, default_value = "roundrobin")]
        strategy: AssignmentStrategy,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    match Cli::parse().command {
        Command::Produce {
            messages,
            partitions,
        } => {
            let config = AppConfig::load()?;
            let cluster = seed_cluster(&config, partitions);
            produce(&cluster, &config, messages).await
        }
        Command::Consume {
            members,
            messages,
            partitions,
        } => {
            let config = Arc::new(AppConfig::load()?);
            let cluster = seed_cluster(&config, partitions);
            consume(cluster, config, members, messages).await
        }
        Command::Assign {
            members,
            topics,
            strategy,
        } => assign(members, topics, strategy),
    }
}

// =====================================================
// Cluster
// =====================================================

/// In-process cluster matching the configured endpoints and credentials.
fn seed_cluster(config: &AppConfig, partitions: i32) -> MemoryCluster {
    let mut cluster = MemoryCluster::new(config.broker.endpoints.clone());
    if let Some(credentials) = &config.broker.credentials {
        cluster = cluster.with_user(credentials.username.clone(), credentials.password.clone());
    }
    for topic in &config.group.topics {
        cluster.create_topic(topic.clone(), partitions);
    }
    cluster
}

// =====================================================
// Produce
// =====================================================

async fn produce(cluster: &MemoryCluster, config: &AppConfig, messages: usize) -> Result<()> {
    let Some(topic) = config.group.topics.first() else {
        bail!("TOPICS missing");
    };
    let producer = SyncProducer::connect(cluster, &config.broker).await?;

    for i in 0..messages {
        let key = DEMO_KEYS[i % DEMO_KEYS.len()];
        let record = ProducerRecord::new(topic.clone(), format!("Hello #{i}")).with_key(key);
        let delivery = producer.send(record).await?;
        info!(
            "→ Message sent to partition {} at offset {} (key {})",
            delivery.partition, delivery.offset, key
        );
    }

    producer.close().await?;
    Ok(())
}

// =====================================================
// Consume
// =====================================================

async fn consume(
    cluster: MemoryCluster,
    config: Arc<AppConfig>,
    members: usize,
    messages: usize,
) -> Result<()> {
    info!("🚀 Starting consumer group '{}'", config.group.group_id);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    tokio::spawn(shutdown_signal(shutdown_tx.clone()));

    let consumers = (0..members.max(1))
        .map(|_| {
            GroupConsumer::from_config(&config, Arc::new(cluster.clone()))
                .map(Arc::new)
                .context("Invalid consumer configuration")
        })
        .collect::<Result<Vec<_>>>()?;

    let handles = consumers.iter().map(|c| c.status_handle()).collect();
    let server = tokio::spawn({
        let port = config.port.clone();
        let shutdown = shutdown_rx.clone();
        async move { status_server::serve(&port, handles, shutdown).await }
    });

    // subscribed before the members start so the first Ready is never missed
    let mut events = consumers[0].subscribe();

    let mut runs = JoinSet::new();
    for consumer in &consumers {
        let consumer = consumer.clone();
        let shutdown = shutdown_rx.clone();
        runs.spawn(async move { consumer.run(Arc::new(LoggingHandler), shutdown).await });
    }

    // =====================================================
    // Wait for the first generation, then feed it
    // =====================================================
    let mut shutdown = shutdown_rx.clone();
    let ready = tokio::select! {
        generation = first_ready(&mut events) => generation,
        _ = shutdown.wait_for(|stop| *stop) => None,
    };

    if let Some(generation) = ready {
        info!("✓ Consumer group up and running (generation {})", generation);
        if messages > 0 {
            if let Err(e) = produce(&cluster, &config, messages).await {
                error!("Demo publish failed: {e:#}");
            }
        }
    }

    // =====================================================
    // Run members until shutdown
    // =====================================================
    let mut failed = false;
    while let Some(joined) = runs.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_fatal() => {
                error!("Consumer failed: {e}");
                failed = true;
            }
            Ok(Err(e)) => warn!("Consumer stopped: {e}"),
            Err(e) => {
                error!("Consumer task crashed: {e}");
                failed = true;
            }
        }
    }

    // every member is gone, nothing left to serve
    shutdown_tx.send_replace(true);
    match server.await {
        Ok(Err(e)) => error!("Status server error: {e:#}"),
        Err(e) => error!("Status server task crashed: {e}"),
        Ok(Ok(())) => {}
    }

    if failed {
        bail!("consumer group terminated with errors");
    }
    info!("✓ Consumer group closed");
    Ok(())
}

async fn first_ready(events: &mut broadcast::Receiver<SessionEvent>) -> Option<GenerationId> {
    loop {
        match events.recv().await {
            Ok(SessionEvent::Ready { generation, .. }) => return Some(generation),
            Ok(SessionEvent::Closed) | Err(RecvError::Closed) => return None,
            Ok(_) | Err(RecvError::Lagged(_)) => {}
        }
    }
}

async fn shutdown_signal(shutdown: Arc<watch::Sender<bool>>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("Shutdown signal received");
    shutdown.send_replace(true);
}

// =====================================================
// Assign
// =====================================================

fn assign(members: Vec<String>, topics: Vec<String>, strategy: AssignmentStrategy) -> Result<()> {
    let topics = topics
        .iter()
        .map(|raw| parse_topic(raw))
        .collect::<Result<Vec<_>>>()?;
    let names: Vec<String> = topics.iter().map(|t| t.name.clone()).collect();
    let members: Vec<GroupMember> = members
        .into_iter()
        .map(|member_id| GroupMember {
            client_id: member_id.clone(),
            member_id,
            topics: names.clone(),
        })
        .collect();

    let assignment = strategy.assignor().assign(&AssignmentContext {
        members: &members,
        topics: &topics,
    });
    println!("{}", serde_json::to_string_pretty(&assignment)?);
    Ok(())
}

fn parse_topic(raw: &str) -> Result<TopicMetadata> {
    let (name, count) = raw
        .rsplit_once(':')
        .with_context(|| format!("topic '{raw}' must be name:partitions"))?;
    let partition_count = count
        .parse::<i32>()
        .with_context(|| format!("invalid partition count in '{raw}'"))?;
    if name.is_empty() || partition_count <= 0 {
        bail!("topic '{raw}' must be name:partitions with at least one partition");
    }
    Ok(TopicMetadata {
        name: name.to_string(),
        partition_count,
    })
}
