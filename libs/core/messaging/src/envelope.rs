//! Broker-agnostic message envelope and its acknowledgment handle.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::btree_map;
use std::collections::BTreeMap;
use std::fmt;
use tokio::sync::oneshot;

/// String key/value metadata attached to an [`Envelope`].
///
/// Keys are kept sorted, so two metadata sets with the same entries compare
/// equal regardless of insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<String, String>);

impl Metadata {
    /// Create empty metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a value by key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Set a value, replacing any previous one.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Remove a value by key.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over entries in key order.
    pub fn iter(&self) -> btree_map::Iter<'_, String, String> {
        self.0.iter()
    }

    /// Borrow the underlying map.
    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.0
    }

    /// Take ownership of the underlying map.
    pub fn into_inner(self) -> BTreeMap<String, String> {
        self.0
    }
}

impl From<BTreeMap<String, String>> for Metadata {
    fn from(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl<'a> IntoIterator for &'a Metadata {
    type Item = (&'a String, &'a String);
    type IntoIter = btree_map::Iter<'a, String, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// How the application resolved a delivered envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// Processed; the broker may forget the message.
    Ack,
    /// Not processed; the broker should redeliver it.
    Nack,
}

impl fmt::Display for AckOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AckOutcome::Ack => write!(f, "ack"),
            AckOutcome::Nack => write!(f, "nack"),
        }
    }
}

/// Receiving side of an envelope's acknowledgment, held by the subscriber.
#[derive(Debug)]
pub struct AckReceiver(oneshot::Receiver<AckOutcome>);

impl AckReceiver {
    /// Wait for the application to resolve the envelope.
    ///
    /// Returns `None` when the envelope was dropped without being acked or
    /// nacked.
    pub async fn outcome(self) -> Option<AckOutcome> {
        self.0.await.ok()
    }
}

/// A unit of application data, independent of any broker wire format.
///
/// Envelopes built by the application are *detached*: acking them is a
/// no-op. Envelopes handed out by a subscriber are *tracked* and must be
/// resolved exactly once with [`Envelope::ack`] or [`Envelope::nack`].
///
/// # Example
///
/// ```
/// use messaging::Envelope;
///
/// let envelope = Envelope::new("order-1", "payload").with_metadata("tenant", "acme");
/// assert_eq!(envelope.metadata.get("tenant"), Some("acme"));
/// ```
#[derive(Debug)]
pub struct Envelope {
    /// Unique message id
    pub id: String,
    /// Opaque application payload
    pub payload: Bytes,
    /// Application metadata
    pub metadata: Metadata,
    resolver: Option<oneshot::Sender<AckOutcome>>,
}

impl Envelope {
    /// Create a detached envelope.
    pub fn new(id: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            id: id.into(),
            payload: payload.into(),
            metadata: Metadata::new(),
            resolver: None,
        }
    }

    /// Create a detached envelope with a random (v4 UUID) id.
    pub fn with_random_id(payload: impl Into<Bytes>) -> Self {
        Self::new(uuid::Uuid::new_v4().to_string(), payload)
    }

    /// Add a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.set(key, value);
        self
    }

    /// Replace all metadata.
    pub fn with_metadata_map(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Copy id, payload and metadata into a new detached envelope.
    pub fn detached(&self) -> Self {
        Self {
            id: self.id.clone(),
            payload: self.payload.clone(),
            metadata: self.metadata.clone(),
            resolver: None,
        }
    }

    /// Attach a fresh acknowledgment channel.
    ///
    /// Any previous channel is dropped, which its receiver observes as an
    /// unresolved envelope.
    pub fn track(mut self) -> (Self, AckReceiver) {
        let (tx, rx) = oneshot::channel();
        self.resolver = Some(tx);
        (self, AckReceiver(rx))
    }

    /// Whether this envelope still waits for an ack or nack.
    pub fn is_pending(&self) -> bool {
        self.resolver.is_some()
    }

    /// Acknowledge the envelope.
    ///
    /// Returns `false` if it was already resolved or is detached.
    pub fn ack(&mut self) -> bool {
        self.resolve(AckOutcome::Ack)
    }

    /// Negatively acknowledge the envelope, asking for redelivery.
    ///
    /// Returns `false` if it was already resolved or is detached.
    pub fn nack(&mut self) -> bool {
        self.resolve(AckOutcome::Nack)
    }

    fn resolve(&mut self, outcome: AckOutcome) -> bool {
        match self.resolver.take() {
            // The subscriber may have stopped waiting (ack-wait elapsed).
            Some(tx) => tx.send(outcome).is_ok(),
            None => false,
        }
    }
}

impl PartialEq for Envelope {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.payload == other.payload && self.metadata == other.metadata
    }
}

impl Eq for Envelope {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_order_insensitive() {
        let mut a = Metadata::new();
        a.set("b", "2");
        a.set("a", "1");

        let b: Metadata = [("a", "1"), ("b", "2")].into_iter().collect();

        assert_eq!(a, b);
        assert_eq!(a.iter().next(), Some((&"a".to_string(), &"1".to_string())));
    }

    #[test]
    fn test_metadata_serialization_is_a_plain_map() {
        let metadata: Metadata = [("k", "v")].into_iter().collect();
        let json = serde_json::to_string(&metadata).unwrap();
        assert_eq!(json, r#"{"k":"v"}"#);
    }

    #[test]
    fn test_detached_envelope_ack_is_noop() {
        let mut envelope = Envelope::new("1", "data");
        assert!(!envelope.is_pending());
        assert!(!envelope.ack());
        assert!(!envelope.nack());
    }

    #[test]
    fn test_equality_ignores_ack_state() {
        let envelope = Envelope::new("1", "data").with_metadata("foo", "bar");
        let (tracked, _rx) = envelope.detached().track();
        assert_eq!(envelope, tracked);
        assert_ne!(envelope, Envelope::new("2", "data"));
    }

    #[tokio::test]
    async fn test_tracked_envelope_resolves_once() {
        let (mut envelope, rx) = Envelope::new("1", "data").track();
        assert!(envelope.is_pending());
        assert!(envelope.ack());
        assert!(!envelope.nack());
        assert_eq!(rx.outcome().await, Some(AckOutcome::Ack));
    }

    #[tokio::test]
    async fn test_tracked_envelope_nack() {
        let (mut envelope, rx) = Envelope::new("1", "data").track();
        assert!(envelope.nack());
        assert_eq!(rx.outcome().await, Some(AckOutcome::Nack));
    }

    #[tokio::test]
    async fn test_dropped_envelope_reports_no_outcome() {
        let (envelope, rx) = Envelope::new("1", "data").track();
        drop(envelope);
        assert_eq!(rx.outcome().await, None);
    }

    #[test]
    fn test_random_ids_are_unique() {
        let a = Envelope::with_random_id("x");
        let b = Envelope::with_random_id("x");
        assert_ne!(a.id, b.id);
    }
}
