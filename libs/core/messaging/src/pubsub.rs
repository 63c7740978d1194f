//! Publisher and subscriber traits.

use crate::envelope::Envelope;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Publishes envelopes to a topic.
///
/// # Example
///
/// ```rust,ignore
/// use messaging::{Envelope, Publisher};
///
/// async fn send<P: Publisher>(publisher: &P) -> Result<(), P::Error> {
///     let envelopes = [
///         Envelope::new("1", "first"),
///         Envelope::new("2", "second"),
///     ];
///     publisher.publish("orders", &envelopes).await
/// }
/// ```
#[async_trait]
pub trait Publisher: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Publish envelopes in order.
    ///
    /// Stops at the first failure. Envelopes published before the failure
    /// are not rolled back.
    async fn publish(&self, topic: &str, envelopes: &[Envelope]) -> Result<(), Self::Error>;

    /// Release the underlying connection.
    async fn close(&self) -> Result<(), Self::Error>;
}

/// Subscribes to a topic and yields tracked envelopes.
///
/// Every received envelope must be resolved with [`Envelope::ack`] or
/// [`Envelope::nack`]. Unresolved envelopes are redelivered by the backend.
///
/// # Example
///
/// ```rust,ignore
/// use messaging::Subscriber;
///
/// async fn consume<S: Subscriber>(subscriber: &S) -> Result<(), S::Error> {
///     let mut messages = subscriber.subscribe("orders").await?;
///     while let Some(mut envelope) = messages.recv().await {
///         handle(&envelope);
///         envelope.ack();
///     }
///     Ok(())
/// }
/// ```
#[async_trait]
pub trait Subscriber: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Start delivering messages from a topic.
    ///
    /// The returned channel closes when the subscriber is closed.
    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<Envelope>, Self::Error>;

    /// Stop all subscriptions and release the underlying connection.
    async fn close(&self) -> Result<(), Self::Error>;
}

/// Prepares broker-side infrastructure for a topic ahead of subscribing.
#[async_trait]
pub trait SubscribeInitializer: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn subscribe_initialize(&self, topic: &str) -> Result<(), Self::Error>;
}
