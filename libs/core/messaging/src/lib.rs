//! Broker-agnostic publish/subscribe abstractions.
//!
//! Application code is written against these types and traits; a backend
//! crate (such as `jetstream-pubsub`) supplies the implementation.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌──────────────────────────────────────┐
//! │   Your Code     │     │              Backends                │
//! │                 │     │                                      │
//! │  ┌───────────┐  │     │  ┌────────────────────────────────┐  │
//! │  │ Envelope  │──│─────│─▶│ jetstream-pubsub (NATS)        │  │
//! │  └───────────┘  │     │  │  Publisher / Subscriber impls  │  │
//! │  ┌───────────┐  │     │  └────────────────────────────────┘  │
//! │  │ ack/nack  │◀─│─────│──  tracked envelopes over mpsc       │
//! │  └───────────┘  │     │                                      │
//! └─────────────────┘     └──────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use messaging::{Envelope, Publisher, Subscriber};
//!
//! publisher.publish("orders", &[Envelope::new("1", "hello")]).await?;
//!
//! let mut messages = subscriber.subscribe("orders").await?;
//! while let Some(mut envelope) = messages.recv().await {
//!     println!("{}: {:?}", envelope.id, envelope.payload);
//!     envelope.ack();
//! }
//! ```

mod envelope;
mod error;
mod pubsub;

pub use envelope::{AckOutcome, AckReceiver, Envelope, Metadata};
pub use error::ErrorCategory;
pub use pubsub::{Publisher, SubscribeInitializer, Subscriber};
