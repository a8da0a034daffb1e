use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use crate::models::Message;
use crate::session::SessionContext;

/// User code run by the consumer group.
///
/// `process` is invoked once per message, in offset order within a
/// partition, from one task per claimed partition. The claim marks the
/// message after `process` returns; what happens on `Err` is decided by
/// the configured `ProcessingErrorPolicy`.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Runs when a generation starts, before any claim.
    async fn setup(&self, _session: &SessionContext) -> Result<()> {
        Ok(())
    }

    async fn process(&self, session: &SessionContext, message: &Message) -> Result<()>;

    /// Runs after every claim of the generation stopped, before the final commit.
    async fn cleanup(&self, _session: &SessionContext) -> Result<()> {
        Ok(())
    }
}

/// Logs every claimed message.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHandler;

#[async_trait]
impl MessageHandler for LoggingHandler {
    async fn setup(&self, session: &SessionContext) -> Result<()> {
        info!(
            member = %session.member_id(),
            generation = session.generation_id(),
            claims = session.claims().len(),
            "Session setup"
        );
        Ok(())
    }

    async fn process(&self, _session: &SessionContext, message: &Message) -> Result<()> {
        info!(
            topic = %message.topic,
            partition = message.partition,
            offset = message.offset,
            "Message claimed from partition {}: {}",
            message.partition,
            message.value_str()
        );
        Ok(())
    }
}
