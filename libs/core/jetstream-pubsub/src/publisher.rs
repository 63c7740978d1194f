//! JetStream publisher.

use crate::backend::{JetStreamBackend, NatsJetStream};
use crate::config::PublisherConfig;
use crate::error::{JetStreamError, Result};
use crate::marshaler::{Marshaler, MSG_ID_HEADER};
use crate::metrics::PubSubMetrics;
use crate::topic::TopicProvisioner;
use async_trait::async_trait;
use messaging::{Envelope, Publisher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Publishes envelopes to JetStream streams.
///
/// Safe to share between tasks; each `publish` call publishes its envelopes
/// in order.
///
/// # Example
///
/// ```rust,ignore
/// use jetstream_pubsub::{ConnectionConfig, JetStreamPublisher, JsonMarshaler, PublisherConfig};
/// use messaging::Envelope;
///
/// let backend = ConnectionConfig::from_env().connect().await?;
/// let publisher = JetStreamPublisher::new(backend, PublisherConfig::new(JsonMarshaler))?;
///
/// publisher
///     .publish("orders", &[Envelope::with_random_id("created")])
///     .await?;
/// ```
pub struct JetStreamPublisher<B: JetStreamBackend = NatsJetStream> {
    backend: Arc<B>,
    marshaler: Arc<dyn Marshaler>,
    provisioner: TopicProvisioner<B>,
    config: PublisherConfig,
    closed: AtomicBool,
}

impl<B: JetStreamBackend> JetStreamPublisher<B> {
    /// Create a publisher owning its backend.
    pub fn new(backend: B, config: PublisherConfig) -> Result<Self> {
        Self::with_shared_backend(Arc::new(backend), config)
    }

    /// Create a publisher on a backend shared with other publishers or
    /// subscribers.
    pub fn with_shared_backend(backend: Arc<B>, config: PublisherConfig) -> Result<Self> {
        let marshaler = config.validate()?;
        let provisioner = TopicProvisioner::new(
            backend.clone(),
            config.subject_calculator.clone(),
            config.auto_provision,
        );

        Ok(Self {
            backend,
            marshaler,
            provisioner,
            config,
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.config
    }

    /// Publish envelopes to a topic in order.
    ///
    /// Stops at the first envelope that fails to encode or publish.
    #[instrument(skip(self, envelopes), fields(topic = %topic, count = envelopes.len()))]
    pub async fn publish(&self, topic: &str, envelopes: &[Envelope]) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(JetStreamError::Closed("publisher"));
        }

        self.provisioner.ensure_stream(topic).await?;

        let metrics = PubSubMetrics::new(topic);

        for envelope in envelopes {
            let mut message = self.marshaler.marshal(topic, envelope)?;
            if self.config.track_msg_id {
                message
                    .headers_mut()
                    .insert(MSG_ID_HEADER, envelope.id.as_str());
            }

            debug!(message_id = %envelope.id, subject = %message.subject, "Publishing message");

            match self
                .backend
                .publish(message, !self.config.fire_and_forget)
                .await
            {
                Ok(Some(receipt)) if receipt.duplicate => {
                    debug!(message_id = %envelope.id, "Broker dropped duplicate message");
                }
                Ok(receipt) => {
                    metrics.message_published();
                    if let Some(receipt) = receipt {
                        debug!(message_id = %envelope.id, sequence = receipt.sequence, "Message persisted");
                    }
                }
                Err(e) => {
                    metrics.publish_failed();
                    warn!(message_id = %envelope.id, error = %e, "Failed to publish message");
                    return Err(e);
                }
            }
        }

        Ok(())
    }

    /// Flush and release the connection. Further publishes fail.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        info!("Closing publisher");
        self.backend.close().await
    }
}

#[async_trait]
impl<B: JetStreamBackend> Publisher for JetStreamPublisher<B> {
    type Error = JetStreamError;

    async fn publish(&self, topic: &str, envelopes: &[Envelope]) -> Result<()> {
        JetStreamPublisher::publish(self, topic, envelopes).await
    }

    async fn close(&self) -> Result<()> {
        JetStreamPublisher::close(self).await
    }
}
