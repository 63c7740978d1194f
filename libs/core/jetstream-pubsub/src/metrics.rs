//! Metrics for publishers and subscribers
//!
//! Recorded through the `metrics` facade; install any recorder to export them.

use metrics::{counter, histogram};
use std::time::Duration;

/// Per-topic metrics helper
#[derive(Debug, Clone)]
pub struct PubSubMetrics {
    /// Topic name for labeling
    topic: String,
}

impl PubSubMetrics {
    /// Create new PubSubMetrics
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
        }
    }

    /// Record a message accepted by the broker
    pub fn message_published(&self) {
        counter!(
            "jetstream_pubsub_messages_published_total",
            "topic" => self.topic.clone()
        )
        .increment(1);
    }

    /// Record a failed publish
    pub fn publish_failed(&self) {
        counter!(
            "jetstream_pubsub_publish_errors_total",
            "topic" => self.topic.clone()
        )
        .increment(1);
    }

    /// Record a message handed to the application
    pub fn message_delivered(&self, redelivery: bool) {
        counter!(
            "jetstream_pubsub_messages_delivered_total",
            "topic" => self.topic.clone(),
            "redelivery" => if redelivery { "true" } else { "false" }
        )
        .increment(1);
    }

    /// Record an acked message and how long the application held it
    pub fn message_acked(&self, held: Duration) {
        counter!(
            "jetstream_pubsub_messages_acked_total",
            "topic" => self.topic.clone()
        )
        .increment(1);

        histogram!(
            "jetstream_pubsub_ack_latency_seconds",
            "topic" => self.topic.clone()
        )
        .record(held.as_secs_f64());
    }

    /// Record a message returned for redelivery
    pub fn message_nacked(&self) {
        counter!(
            "jetstream_pubsub_messages_nacked_total",
            "topic" => self.topic.clone()
        )
        .increment(1);
    }

    /// Record a message left to the broker's ack-wait
    pub fn ack_timed_out(&self) {
        counter!(
            "jetstream_pubsub_ack_timeouts_total",
            "topic" => self.topic.clone()
        )
        .increment(1);
    }

    /// Record a broker message that failed to decode
    pub fn decode_failed(&self) {
        counter!(
            "jetstream_pubsub_decode_errors_total",
            "topic" => self.topic.clone()
        )
        .increment(1);
    }

    /// Record an ack or nak the broker did not take
    pub fn ack_failed(&self) {
        counter!(
            "jetstream_pubsub_ack_errors_total",
            "topic" => self.topic.clone()
        )
        .increment(1);
    }
}
