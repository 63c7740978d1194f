//! JetStream subscriber.
//!
//! A subscription binds a pull consumer on the topic's stream and runs
//! `subscribers_count` workers against it. Each worker pulls one message at
//! a time, hands it to the application as a tracked [`Envelope`] and waits
//! for the application's verdict before pulling the next one:
//!
//! ```text
//! broker ──pull──▶ worker ──decode──▶ Envelope ──mpsc──▶ application
//!    ▲                                                       │
//!    └──────── ack / nak ◀──── worker ◀──── ack() / nack() ──┘
//! ```
//!
//! If the application does not answer within `ack_wait` the worker moves
//! on and the broker redelivers the message.

use crate::backend::{ConsumerSpec, Delivery, DeliveryStream, JetStreamBackend, NatsJetStream};
use crate::config::{DecodeFailurePolicy, SubscriberConfig};
use crate::error::{JetStreamError, Result};
use crate::marshaler::Unmarshaler;
use crate::metrics::PubSubMetrics;
use crate::topic::TopicProvisioner;
use async_trait::async_trait;
use futures::StreamExt;
use messaging::{AckOutcome, Envelope, SubscribeInitializer, Subscriber};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

/// Lifecycle of a [`JetStreamSubscriber`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    /// No subscription started yet
    Created,
    /// Stream and consumer are being prepared
    Provisioning,
    /// Workers are delivering messages
    Delivering,
    /// Close requested; in-flight messages are being resolved
    Draining,
    /// Workers stopped and connection released
    Closed,
}

impl SubscriberState {
    fn is_stopping(self) -> bool {
        matches!(self, SubscriberState::Draining | SubscriberState::Closed)
    }
}

/// Subscribes to JetStream streams.
///
/// # Example
///
/// ```rust,ignore
/// use jetstream_pubsub::{ConnectionConfig, JetStreamSubscriber, JsonMarshaler, SubscriberConfig};
///
/// let backend = ConnectionConfig::from_env().connect().await?;
/// let subscriber = JetStreamSubscriber::new(
///     backend,
///     SubscriberConfig::new(JsonMarshaler)
///         .with_queue_group("billing")
///         .with_subscribers_count(4),
/// )?;
///
/// let mut messages = subscriber.subscribe("orders").await?;
/// while let Some(mut envelope) = messages.recv().await {
///     match handle(&envelope).await {
///         Ok(()) => envelope.ack(),
///         Err(_) => envelope.nack(),
///     };
/// }
/// ```
pub struct JetStreamSubscriber<B: JetStreamBackend = NatsJetStream> {
    backend: Arc<B>,
    unmarshaler: Arc<dyn Unmarshaler>,
    provisioner: TopicProvisioner<B>,
    config: SubscriberConfig,
    state: watch::Sender<SubscriberState>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<B: JetStreamBackend> JetStreamSubscriber<B> {
    /// Create a subscriber owning its backend.
    pub fn new(backend: B, config: SubscriberConfig) -> Result<Self> {
        Self::with_shared_backend(Arc::new(backend), config)
    }

    /// Create a subscriber on a backend shared with other publishers or
    /// subscribers.
    pub fn with_shared_backend(backend: Arc<B>, config: SubscriberConfig) -> Result<Self> {
        let unmarshaler = config.validate()?;
        let provisioner = TopicProvisioner::new(
            backend.clone(),
            config.subject_calculator.clone(),
            config.auto_provision,
        );
        let (state, _) = watch::channel(SubscriberState::Created);

        Ok(Self {
            backend,
            unmarshaler,
            provisioner,
            config,
            state,
            workers: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &SubscriberConfig {
        &self.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SubscriberState {
        *self.state.borrow()
    }

    fn is_stopping(&self) -> bool {
        self.state().is_stopping()
    }

    /// Consumer the subscription binds to.
    ///
    /// A queue group names a shared durable consumer. Otherwise a durable
    /// name names a private durable one, and without either the
    /// subscription gets an ephemeral consumer of its own.
    pub fn consumer_spec(&self, topic: &str) -> ConsumerSpec {
        let (name, durable) = if let Some(group) = self.config.queue_group() {
            (
                self.config.queue_group_calculator.queue_group(group, topic),
                true,
            )
        } else if let Some(durable) = self.config.durable_name() {
            (
                self.config.durable_calculator.durable_name(durable, topic),
                true,
            )
        } else {
            (
                format!("{}-{}", self.config.client_id, uuid::Uuid::new_v4().simple()),
                false,
            )
        };

        ConsumerSpec {
            name,
            durable,
            ack_wait: self.config.ack_wait,
            start_position: self.config.start_position,
            max_deliver: self.config.max_deliver,
        }
    }

    /// Start delivering messages from a topic.
    ///
    /// The returned channel yields tracked envelopes and closes once every
    /// worker of this subscription has stopped.
    #[instrument(skip(self), fields(topic = %topic))]
    pub async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<Envelope>> {
        if self.is_stopping() {
            return Err(JetStreamError::Closed("subscriber"));
        }

        self.state.send_if_modified(|state| {
            if *state == SubscriberState::Created {
                *state = SubscriberState::Provisioning;
                true
            } else {
                false
            }
        });

        let result = self.start(topic).await;

        if result.is_err() {
            self.state.send_if_modified(|state| {
                if *state == SubscriberState::Provisioning {
                    *state = SubscriberState::Created;
                    true
                } else {
                    false
                }
            });
        }

        result
    }

    async fn start(&self, topic: &str) -> Result<mpsc::Receiver<Envelope>> {
        self.provisioner.ensure_stream(topic).await?;

        let spec = self.consumer_spec(topic);
        let broker_ack_wait = self.backend.ensure_consumer(topic, &spec).await?;
        // Never give up on a message before the broker would redeliver it
        let ack_wait = broker_ack_wait.max(self.config.ack_wait);
        if ack_wait != self.config.ack_wait {
            warn!(
                consumer = %spec.name,
                configured = ?self.config.ack_wait,
                ack_wait = ?ack_wait,
                "Consumer keeps a longer ack wait, waiting for it instead"
            );
        }

        let count = self.config.subscribers_count;
        let mut streams = Vec::with_capacity(count);
        for _ in 0..count {
            streams.push(self.backend.messages(topic, &spec.name).await?);
        }

        let (output, receiver) = mpsc::channel(count);
        let metrics = PubSubMetrics::new(topic);

        let mut workers = self.workers.lock().await;
        if self.is_stopping() {
            return Err(JetStreamError::Closed("subscriber"));
        }
        workers.retain(|handle| !handle.is_finished());

        for (id, deliveries) in streams.into_iter().enumerate() {
            let worker = Worker {
                id,
                topic: topic.to_string(),
                deliveries,
                output: output.clone(),
                unmarshaler: self.unmarshaler.clone(),
                shutdown: self.state.subscribe(),
                ack_wait,
                ack_sync: self.config.ack_sync,
                nak_delay: self.config.nak_delay,
                decode_failure: self.config.decode_failure,
                metrics: metrics.clone(),
            };
            workers.push(tokio::spawn(worker.run()));
        }

        self.state.send_if_modified(|state| {
            if matches!(*state, SubscriberState::Created | SubscriberState::Provisioning) {
                *state = SubscriberState::Delivering;
                true
            } else {
                false
            }
        });

        info!(
            consumer = %spec.name,
            durable = spec.durable,
            workers = count,
            "Subscribed"
        );

        Ok(receiver)
    }

    /// Provision the topic's stream, and its consumer when durable, without
    /// starting delivery.
    ///
    /// Works even when auto-provisioning is disabled.
    #[instrument(skip(self), fields(topic = %topic))]
    pub async fn subscribe_initialize(&self, topic: &str) -> Result<()> {
        self.provisioner.provision(topic).await?;

        let spec = self.consumer_spec(topic);
        if spec.durable {
            self.backend.ensure_consumer(topic, &spec).await?;
        }

        Ok(())
    }

    /// Stop all subscriptions.
    ///
    /// Workers stop pulling immediately. Messages already handed to the
    /// application get up to `close_timeout` to be resolved; whatever is
    /// left after that is abandoned and redelivered by the broker once its
    /// ack-wait expires. Calling close again is a no-op.
    pub async fn close(&self) -> Result<()> {
        let first = self.state.send_if_modified(|state| {
            if state.is_stopping() {
                false
            } else {
                *state = SubscriberState::Draining;
                true
            }
        });
        if !first {
            return Ok(());
        }

        info!("Closing subscriber");

        let mut handles = std::mem::take(&mut *self.workers.lock().await);

        let drain = async {
            for handle in handles.iter_mut() {
                if let Err(e) = handle.await {
                    if e.is_panic() {
                        error!(error = %e, "Delivery worker panicked");
                    }
                }
            }
        };

        if tokio::time::timeout(self.config.close_timeout, drain)
            .await
            .is_err()
        {
            warn!(
                close_timeout = ?self.config.close_timeout,
                "Close timeout elapsed with messages in flight, forcing unsubscribe"
            );
            for handle in handles.iter().filter(|handle| !handle.is_finished()) {
                handle.abort();
            }
            // Abandoned envelopes are released once their worker is gone
            for handle in handles.into_iter().filter(|handle| !handle.is_finished()) {
                let _ = handle.await;
            }
        }

        self.state.send_replace(SubscriberState::Closed);
        let result = self.backend.close().await;
        info!("Subscriber closed");

        result
    }
}

#[async_trait]
impl<B: JetStreamBackend> Subscriber for JetStreamSubscriber<B> {
    type Error = JetStreamError;

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<Envelope>> {
        JetStreamSubscriber::subscribe(self, topic).await
    }

    async fn close(&self) -> Result<()> {
        JetStreamSubscriber::close(self).await
    }
}

#[async_trait]
impl<B: JetStreamBackend> SubscribeInitializer for JetStreamSubscriber<B> {
    type Error = JetStreamError;

    async fn subscribe_initialize(&self, topic: &str) -> Result<()> {
        JetStreamSubscriber::subscribe_initialize(self, topic).await
    }
}

/// First wait after a failed pull; doubles up to [`RECEIVE_BACKOFF_MAX`].
const RECEIVE_BACKOFF_MIN: Duration = Duration::from_millis(100);
const RECEIVE_BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Resolves once the subscriber starts stopping or is dropped.
async fn stopped(shutdown: &mut watch::Receiver<SubscriberState>) {
    let _ = shutdown.wait_for(|state| state.is_stopping()).await;
}

/// One delivery loop of a subscription.
struct Worker<D: Delivery> {
    id: usize,
    topic: String,
    deliveries: DeliveryStream<D>,
    output: mpsc::Sender<Envelope>,
    unmarshaler: Arc<dyn Unmarshaler>,
    shutdown: watch::Receiver<SubscriberState>,
    ack_wait: Duration,
    ack_sync: bool,
    nak_delay: Option<Duration>,
    decode_failure: DecodeFailurePolicy,
    metrics: PubSubMetrics,
}

impl<D: Delivery> Worker<D> {
    async fn run(mut self) {
        debug!(worker = self.id, topic = %self.topic, "Delivery worker started");

        let mut backoff = RECEIVE_BACKOFF_MIN;
        loop {
            let delivery = tokio::select! {
                biased;

                _ = stopped(&mut self.shutdown) => break,

                next = self.deliveries.next() => match next {
                    Some(Ok(delivery)) => {
                        backoff = RECEIVE_BACKOFF_MIN;
                        delivery
                    }
                    Some(Err(e)) if !e.category().is_retryable() => {
                        error!(worker = self.id, topic = %self.topic, error = %e, "Cannot receive messages, stopping worker");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(
                            worker = self.id,
                            topic = %self.topic,
                            error = %e,
                            retry_in = ?backoff,
                            "Error receiving message"
                        );
                        tokio::select! {
                            biased;
                            _ = stopped(&mut self.shutdown) => break,
                            _ = tokio::time::sleep(backoff) => {}
                        }
                        backoff = (backoff * 2).min(RECEIVE_BACKOFF_MAX);
                        continue;
                    }
                    None => {
                        debug!(worker = self.id, topic = %self.topic, "Delivery stream ended");
                        break;
                    }
                },
            };

            if !self.handle(delivery).await {
                break;
            }
        }

        debug!(worker = self.id, topic = %self.topic, "Delivery worker stopped");
    }

    /// Process one delivery. Returns false when the worker should stop.
    async fn handle(&mut self, delivery: D) -> bool {
        let message = delivery.message();
        let delivered = delivery.delivered();
        if delivered > 1 {
            debug!(
                topic = %self.topic,
                subject = %message.subject,
                delivered,
                "Processing redelivered message"
            );
        }

        let envelope = match self.unmarshaler.unmarshal(&message) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(
                    topic = %self.topic,
                    subject = %message.subject,
                    error = %e,
                    "Cannot decode message"
                );
                self.metrics.decode_failed();
                let result = match self.decode_failure {
                    DecodeFailurePolicy::Nak => delivery.nak(self.nak_delay).await,
                    DecodeFailurePolicy::Term => delivery.term().await,
                };
                if let Err(e) = result {
                    self.metrics.ack_failed();
                    error!(topic = %self.topic, error = %e, "Failed to reject undecodable message");
                }
                return true;
            }
        };

        let message_id = envelope.id.clone();
        let (envelope, resolution) = envelope.track();
        self.metrics.message_delivered(delivered > 1);

        tokio::select! {
            biased;

            _ = stopped(&mut self.shutdown) => {
                debug!(message_id = %message_id, "Subscriber closing, returning undelivered message");
                self.nak(&delivery, &message_id).await;
                return false;
            }

            sent = self.output.send(envelope) => {
                if sent.is_err() {
                    debug!(message_id = %message_id, "Output channel closed, returning message");
                    self.nak(&delivery, &message_id).await;
                    return false;
                }
            }
        }

        let handed_over = Instant::now();

        // Not interrupted by close: close_timeout bounds the drain instead.
        match tokio::time::timeout(self.ack_wait, resolution.outcome()).await {
            Ok(Some(AckOutcome::Ack)) => {
                let result = if self.ack_sync {
                    delivery.ack_sync().await
                } else {
                    delivery.ack().await
                };
                match result {
                    Ok(()) => {
                        self.metrics.message_acked(handed_over.elapsed());
                        debug!(message_id = %message_id, "Message acked");
                    }
                    Err(e) => {
                        self.metrics.ack_failed();
                        error!(message_id = %message_id, error = %e, "Failed to ack message");
                    }
                }
            }
            Ok(Some(AckOutcome::Nack)) => {
                self.metrics.message_nacked();
                debug!(message_id = %message_id, "Message nacked");
                self.nak(&delivery, &message_id).await;
            }
            Ok(None) => {
                self.metrics.message_nacked();
                debug!(message_id = %message_id, "Message dropped without ack or nack");
                self.nak(&delivery, &message_id).await;
            }
            Err(_) => {
                self.metrics.ack_timed_out();
                debug!(
                    message_id = %message_id,
                    ack_wait = ?self.ack_wait,
                    "No ack within ack wait, leaving message to redelivery"
                );
            }
        }

        true
    }

    async fn nak(&mut self, delivery: &D, message_id: &str) {
        if let Err(e) = delivery.nak(self.nak_delay).await {
            self.metrics.ack_failed();
            error!(message_id = %message_id, error = %e, "Failed to nak message");
        }
    }
}
