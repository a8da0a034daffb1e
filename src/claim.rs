use futures_util::stream::{self, Stream, StreamExt};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::app_config::{GroupConfig, ProcessingErrorPolicy};
use crate::error::{ConsumerError, TransportError};
use crate::handler::MessageHandler;
use crate::infra::transport::{BrokerClient, FetchRequest};
use crate::models::{GenerationId, Message, TopicPartition};
use crate::session::{SessionContext, StopReason, StopSignal};

/// Exclusive right to read one partition during one generation.
#[derive(Debug, Clone)]
pub struct Claim {
    partition: TopicPartition,
    generation: GenerationId,
    start_offset: i64,
}

#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub max_messages: usize,
    pub max_wait: Duration,
    pub retry_backoff: Duration,
}

impl From<&GroupConfig> for FetchOptions {
    fn from(config: &GroupConfig) -> Self {
        Self {
            max_messages: config.fetch_max_messages,
            max_wait: config.fetch_max_wait,
            retry_backoff: config.retry_backoff,
        }
    }
}

struct Cursor {
    client: Arc<dyn BrokerClient>,
    partition: TopicPartition,
    next_offset: i64,
    buffer: VecDeque<Message>,
    options: FetchOptions,
    failed: bool,
}

impl Claim {
    pub fn new(partition: TopicPartition, generation: GenerationId, start_offset: i64) -> Self {
        Self {
            partition,
            generation,
            start_offset,
        }
    }

    pub fn topic_partition(&self) -> &TopicPartition {
        &self.partition
    }

    pub fn generation(&self) -> GenerationId {
        self.generation
    }

    pub fn start_offset(&self) -> i64 {
        self.start_offset
    }

    /// Endless, strictly increasing stream of this partition's messages.
    /// Nothing is fetched until the stream is polled. Retriable fetch errors
    /// are retried after a backoff; anything else is yielded once and ends
    /// the stream.
    pub fn messages(
        &self,
        client: Arc<dyn BrokerClient>,
        options: FetchOptions,
    ) -> impl Stream<Item = Result<Message, TransportError>> + Send + 'static {
        let cursor = Cursor {
            client,
            partition: self.partition.clone(),
            next_offset: self.start_offset,
            buffer: VecDeque::new(),
            options,
            failed: false,
        };

        stream::unfold(cursor, |mut cursor| async move {
            if cursor.failed {
                return None;
            }
            loop {
                if let Some(message) = cursor.buffer.pop_front() {
                    // already delivered
                    if message.offset < cursor.next_offset {
                        continue;
                    }
                    cursor.next_offset = message.offset + 1;
                    return Some((Ok(message), cursor));
                }

                let request = FetchRequest {
                    partition: cursor.partition.clone(),
                    offset: cursor.next_offset,
                    max_messages: cursor.options.max_messages,
                    max_wait: cursor.options.max_wait,
                };
                match cursor.client.fetch(request).await {
                    Ok(batch) => cursor.buffer.extend(batch),
                    Err(e) if e.is_retriable() => {
                        warn!(partition = %cursor.partition, error = %e, "Fetch failed, backing off");
                        tokio::time::sleep(cursor.options.retry_backoff).await;
                    }
                    Err(e) => {
                        cursor.failed = true;
                        return Some((Err(e), cursor));
                    }
                }
            }
        })
    }
}

#[derive(Debug)]
pub enum ClaimExit {
    /// Session stop observed between messages
    Stopped { processed: u64 },
    /// The message stream ended on a transport failure
    Ended { processed: u64 },
    /// Processing failed under the halt policy
    Halted(ConsumerError),
}

/// Drives one claim: pull, process, mark, repeat.
pub struct ClaimRunner<H: ?Sized> {
    pub claim: Claim,
    pub client: Arc<dyn BrokerClient>,
    pub handler: Arc<H>,
    pub session: Arc<SessionContext>,
    pub stop: StopSignal,
    pub options: FetchOptions,
    pub policy: ProcessingErrorPolicy,
}

impl<H: MessageHandler + ?Sized> ClaimRunner<H> {
    pub async fn run(self) -> ClaimExit {
        let partition = self.claim.topic_partition().clone();
        let mut listener = self.stop.listener();
        let messages = self.claim.messages(self.client.clone(), self.options.clone());
        tokio::pin!(messages);

        info!(
            topic = %partition.topic,
            partition = partition.partition,
            generation = self.claim.generation(),
            offset = self.claim.start_offset(),
            "→ Claim started"
        );

        let mut processed = 0u64;
        let exit = loop {
            // the stop check only races the pull, never the callback
            let next = tokio::select! {
                biased;
                _ = listener.stopped() => break ClaimExit::Stopped { processed },
                next = messages.next() => next,
            };

            let message = match next {
                Some(Ok(message)) => message,
                Some(Err(e)) => {
                    error!(%partition, error = %e, "Claim cannot fetch, requesting rejoin");
                    self.stop.trigger(StopReason::Rebalance);
                    break ClaimExit::Ended { processed };
                }
                None => break ClaimExit::Ended { processed },
            };

            if let Err(err) = self.handler.process(&self.session, &message).await {
                match self.policy {
                    ProcessingErrorPolicy::LogAndContinue => {
                        warn!(
                            %partition,
                            offset = message.offset,
                            error = %err,
                            "Processing failed, continuing"
                        );
                    }
                    ProcessingErrorPolicy::Halt => {
                        error!(%partition, offset = message.offset, error = %err, "Processing failed, halting");
                        self.stop.trigger(StopReason::Halted);
                        break ClaimExit::Halted(ConsumerError::Processing {
                            topic: message.topic.clone(),
                            partition: message.partition,
                            offset: message.offset,
                            source: err,
                        });
                    }
                }
            }

            if !self.session.mark_message(&message) {
                debug!(%partition, offset = message.offset, "Generation sealed, claim exits");
                break ClaimExit::Stopped { processed };
            }
            processed += 1;
        };

        info!(%partition, generation = self.claim.generation(), processed, "Claim stopped");
        exit
    }
}
