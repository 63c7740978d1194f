//! Broker capability consumed by the publisher and subscriber.
//!
//! [`JetStreamBackend`] is the slice of JetStream the adapter needs: stream
//! lookup and creation, publishing, durable pull consumers and per-message
//! acknowledgment. [`NatsJetStream`] implements it on top of `async-nats`.

use crate::error::{JetStreamError, Result};
use crate::marshaler::WireMessage;
use async_nats::jetstream::consumer::pull::{Config as ConsumerConfig, MessagesErrorKind};
use async_nats::jetstream::consumer::{AckPolicy, Config as StoredConsumerConfig, DeliverPolicy};
use async_nats::jetstream::context::GetStreamErrorKind;
use async_nats::jetstream::stream::Config as StreamConfig;
use async_nats::jetstream::{self, AckKind, Context, ErrorCode};
use async_nats::Client;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How long an idle ephemeral consumer survives on the server.
const EPHEMERAL_INACTIVE_THRESHOLD: Duration = Duration::from_secs(5 * 60);

/// Where a newly created consumer starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartPosition {
    /// Replay the whole stream
    #[default]
    All,
    /// Only messages published after the consumer was created
    New,
}

/// Stream to create for a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSpec {
    pub name: String,
    pub subjects: Vec<String>,
}

/// Consumer a subscription binds to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSpec {
    /// Consumer name; also the durable name when `durable` is set
    pub name: String,
    pub durable: bool,
    pub ack_wait: Duration,
    pub start_position: StartPosition,
    pub max_deliver: Option<i64>,
}

/// Broker confirmation of a persisted message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishReceipt {
    /// Stream sequence of the message
    pub sequence: u64,
    /// The broker dropped the message as a duplicate id
    pub duplicate: bool,
}

/// Stream of pulled deliveries for one worker.
pub type DeliveryStream<D> = BoxStream<'static, Result<D>>;

/// A message pulled from a consumer, awaiting acknowledgment.
#[async_trait]
pub trait Delivery: Send + Sync + 'static {
    /// The received wire message.
    fn message(&self) -> WireMessage;

    /// How many times the broker delivered this message (1 on first delivery).
    fn delivered(&self) -> u64;

    /// Acknowledge without waiting for the broker.
    async fn ack(&self) -> Result<()>;

    /// Acknowledge and wait until the broker confirms it recorded the ack.
    async fn ack_sync(&self) -> Result<()>;

    /// Ask for redelivery, optionally after a delay.
    async fn nak(&self, delay: Option<Duration>) -> Result<()>;

    /// Stop redelivering this message.
    async fn term(&self) -> Result<()>;
}

/// JetStream-style stream and consumer management.
///
/// Implementations must be safe for concurrent use by many workers and
/// publishers at once.
#[async_trait]
pub trait JetStreamBackend: Send + Sync + 'static {
    type Delivery: Delivery;

    /// Check whether a stream exists.
    async fn stream_exists(&self, name: &str) -> Result<bool>;

    /// Create a stream.
    async fn create_stream(&self, spec: &StreamSpec) -> Result<()>;

    /// Publish a message, optionally waiting for the broker's persistence ack.
    ///
    /// Returns `None` when not waiting for the ack.
    async fn publish(&self, message: WireMessage, await_ack: bool)
        -> Result<Option<PublishReceipt>>;

    /// Get or create a pull consumer on a stream.
    ///
    /// An existing consumer is updated to `spec.ack_wait` where the broker
    /// allows it. Returns the ack-wait the broker enforces afterwards.
    async fn ensure_consumer(&self, stream: &str, spec: &ConsumerSpec) -> Result<Duration>;

    /// Open a pull stream over an existing consumer.
    async fn messages(&self, stream: &str, consumer: &str)
        -> Result<DeliveryStream<Self::Delivery>>;

    /// Flush and release the connection.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// NATS JetStream connection handle.
#[derive(Clone)]
pub struct NatsJetStream {
    client: Client,
    context: Context,
}

impl NatsJetStream {
    /// Wrap a connected client.
    pub fn new(client: Client) -> Self {
        let context = jetstream::new(client.clone());
        Self { client, context }
    }

    /// Get the underlying client.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Get the JetStream context.
    pub fn context(&self) -> &Context {
        &self.context
    }
}

#[async_trait]
impl JetStreamBackend for NatsJetStream {
    type Delivery = NatsDelivery;

    async fn stream_exists(&self, name: &str) -> Result<bool> {
        match self.context.get_stream(name).await {
            Ok(_) => Ok(true),
            Err(e) => match e.kind() {
                GetStreamErrorKind::JetStream(err)
                    if err.error_code() == ErrorCode::STREAM_NOT_FOUND =>
                {
                    Ok(false)
                }
                _ => Err(JetStreamError::from_jetstream_error(e)),
            },
        }
    }

    async fn create_stream(&self, spec: &StreamSpec) -> Result<()> {
        self.context
            .create_stream(StreamConfig {
                name: spec.name.clone(),
                subjects: spec.subjects.clone(),
                ..Default::default()
            })
            .await
            .map_err(JetStreamError::from_jetstream_error)?;

        Ok(())
    }

    async fn publish(
        &self,
        message: WireMessage,
        await_ack: bool,
    ) -> Result<Option<PublishReceipt>> {
        let ack = match message.headers {
            Some(headers) => {
                self.context
                    .publish_with_headers(message.subject, headers, message.payload)
                    .await
            }
            None => self.context.publish(message.subject, message.payload).await,
        }
        .map_err(JetStreamError::publish_error)?;

        if !await_ack {
            return Ok(None);
        }

        let ack = ack.await.map_err(JetStreamError::publish_error)?;

        Ok(Some(PublishReceipt {
            sequence: ack.sequence,
            duplicate: ack.duplicate,
        }))
    }

    async fn ensure_consumer(&self, stream: &str, spec: &ConsumerSpec) -> Result<Duration> {
        let stream_handle = self
            .context
            .get_stream(stream)
            .await
            .map_err(|e| JetStreamError::StreamNotFound(format!("{}: {}", stream, e)))?;

        if let Ok(existing) = stream_handle.get_consumer::<ConsumerConfig>(&spec.name).await {
            let current = existing.cached_info().config.ack_wait;
            if current == spec.ack_wait {
                debug!(consumer = %spec.name, stream = %stream, "Consumer already exists");
                return Ok(current);
            }

            let mut config = existing.cached_info().config.clone();
            config.ack_wait = spec.ack_wait;
            return match stream_handle.update_consumer::<StoredConsumerConfig>(config).await {
                Ok(_) => {
                    info!(
                        consumer = %spec.name,
                        stream = %stream,
                        from = ?current,
                        to = ?spec.ack_wait,
                        "Updated consumer ack wait"
                    );
                    Ok(spec.ack_wait)
                }
                Err(e) => {
                    warn!(
                        consumer = %spec.name,
                        stream = %stream,
                        ack_wait = ?current,
                        error = %e,
                        "Cannot update consumer, keeping its ack wait"
                    );
                    Ok(current)
                }
            };
        }

        info!(
            consumer = %spec.name,
            stream = %stream,
            durable = spec.durable,
            "Creating consumer"
        );

        stream_handle
            .create_consumer(ConsumerConfig {
                durable_name: spec.durable.then(|| spec.name.clone()),
                name: Some(spec.name.clone()),
                ack_policy: AckPolicy::Explicit,
                ack_wait: spec.ack_wait,
                deliver_policy: match spec.start_position {
                    StartPosition::All => DeliverPolicy::All,
                    StartPosition::New => DeliverPolicy::New,
                },
                max_deliver: spec.max_deliver.unwrap_or_default(),
                inactive_threshold: if spec.durable {
                    Duration::ZERO
                } else {
                    EPHEMERAL_INACTIVE_THRESHOLD
                },
                ..Default::default()
            })
            .await
            .map_err(JetStreamError::consumer_error)?;

        Ok(spec.ack_wait)
    }

    async fn messages(
        &self,
        stream: &str,
        consumer: &str,
    ) -> Result<DeliveryStream<NatsDelivery>> {
        let consumer = self
            .context
            .get_stream(stream)
            .await
            .map_err(|e| JetStreamError::StreamNotFound(format!("{}: {}", stream, e)))?
            .get_consumer::<ConsumerConfig>(consumer)
            .await
            .map_err(JetStreamError::consumer_error)?;

        // One message per pull keeps the ack-wait clock from running on
        // messages still buffered client-side.
        let messages = consumer
            .stream()
            .max_messages_per_batch(1)
            .messages()
            .await
            .map_err(JetStreamError::consumer_error)?;

        Ok(messages
            .map(|result| {
                result
                    .map(|message| NatsDelivery { message })
                    .map_err(|e| match e.kind() {
                        MessagesErrorKind::ConsumerDeleted => {
                            JetStreamError::ConsumerDeleted(e.to_string())
                        }
                        _ => JetStreamError::consumer_error(e),
                    })
            })
            .boxed())
    }

    async fn close(&self) -> Result<()> {
        self.client
            .flush()
            .await
            .map_err(JetStreamError::from_jetstream_error)
    }
}

/// A message pulled from a NATS consumer.
pub struct NatsDelivery {
    message: jetstream::Message,
}

#[async_trait]
impl Delivery for NatsDelivery {
    fn message(&self) -> WireMessage {
        WireMessage {
            subject: self.message.subject.to_string(),
            headers: self.message.headers.clone(),
            payload: self.message.payload.clone(),
        }
    }

    fn delivered(&self) -> u64 {
        self.message
            .info()
            .map(|info| info.delivered.max(1) as u64)
            .unwrap_or(1)
    }

    async fn ack(&self) -> Result<()> {
        self.message.ack().await.map_err(JetStreamError::ack_error)
    }

    async fn ack_sync(&self) -> Result<()> {
        self.message
            .double_ack()
            .await
            .map_err(JetStreamError::ack_error)
    }

    async fn nak(&self, delay: Option<Duration>) -> Result<()> {
        self.message
            .ack_with(AckKind::Nak(delay))
            .await
            .map_err(JetStreamError::ack_error)
    }

    async fn term(&self) -> Result<()> {
        self.message
            .ack_with(AckKind::Term)
            .await
            .map_err(JetStreamError::ack_error)
    }
}
