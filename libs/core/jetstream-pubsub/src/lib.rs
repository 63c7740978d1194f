//! NATS JetStream backend for the `messaging` publish/subscribe traits.
//!
//! Topics map onto JetStream streams of the same name. Publishing writes
//! each envelope to `topic.<id>`; subscribing binds a pull consumer and
//! delivers tracked envelopes whose ack/nack is forwarded to the broker.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────┐     ┌─────────────────────┐     ┌────────────────────┐
//! │ JetStreamPublisher│────▶│   NATS JetStream    │────▶│ JetStreamSubscriber│
//! │  (Marshaler)      │     │  stream per topic   │     │  N pull workers    │
//! └───────────────────┘     └─────────────────────┘     └────────────────────┘
//!           │                          ▲                          │
//!           ▼                          │ ack / nak                ▼
//!  ┌─────────────────┐                 └──────────────   mpsc<Envelope> to app
//!  │ TopicProvisioner│  get-or-create stream
//!  └─────────────────┘
//! ```
//!
//! # Key Features
//!
//! - **Pluggable codecs**: bincode, JSON, header-based and protobuf
//! - **Auto-provisioning**: streams created on first use, race-safe
//! - **Queue groups**: workers and processes sharing one durable consumer
//! - **At-least-once delivery**: unresolved messages redelivered after ack-wait
//! - **Graceful close**: in-flight messages get `close_timeout` to resolve
//!
//! # Example
//!
//! ```rust,ignore
//! use jetstream_pubsub::{
//!     ConnectionConfig, JetStreamPublisher, JetStreamSubscriber, JsonMarshaler,
//!     PublisherConfig, SubscriberConfig,
//! };
//! use messaging::Envelope;
//! use std::sync::Arc;
//!
//! let backend = Arc::new(ConnectionConfig::from_env().connect().await?);
//!
//! let publisher =
//!     JetStreamPublisher::with_shared_backend(backend.clone(), PublisherConfig::new(JsonMarshaler))?;
//! let subscriber =
//!     JetStreamSubscriber::with_shared_backend(backend, SubscriberConfig::new(JsonMarshaler))?;
//!
//! let mut messages = subscriber.subscribe("orders").await?;
//! publisher.publish("orders", &[Envelope::with_random_id("created")]).await?;
//!
//! if let Some(mut envelope) = messages.recv().await {
//!     envelope.ack();
//! }
//! subscriber.close().await?;
//! ```

mod backend;
mod config;
mod error;
pub mod marshaler;
pub mod metrics;
mod publisher;
mod subscriber;
mod topic;

pub use backend::{
    ConsumerSpec, Delivery, DeliveryStream, JetStreamBackend, NatsDelivery, NatsJetStream,
    PublishReceipt, StartPosition, StreamSpec,
};
pub use config::{ConnectionConfig, DecodeFailurePolicy, PublisherConfig, SubscriberConfig};
pub use error::{JetStreamError, Result};
pub use marshaler::{
    BinaryMarshaler, HeaderMarshaler, JsonMarshaler, Marshaler, MarshalerUnmarshaler,
    ProtoMarshaler, Unmarshaler, WireMessage,
};
pub use crate::metrics::PubSubMetrics;
pub use publisher::JetStreamPublisher;
pub use subscriber::{JetStreamSubscriber, SubscriberState};
pub use topic::{
    DefaultDurableCalculator, DefaultQueueGroupCalculator, DefaultSubjectCalculator,
    DurableCalculator, QueueGroupCalculator, SubjectCalculator, Subjects, TopicProvisioner,
};
