//! Topic to subject mapping and stream provisioning.
//!
//! Every topic gets a stream of the same name. By default the stream
//! captures `topic.*`, which matches the `topic.<id>` subjects the codecs
//! publish to.

use crate::backend::{JetStreamBackend, StreamSpec};
use crate::error::{JetStreamError, Result};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Subjects a topic's stream captures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subjects {
    pub primary: String,
    pub additional: Vec<String>,
}

impl Subjects {
    pub fn new(primary: impl Into<String>) -> Self {
        Self {
            primary: primary.into(),
            additional: Vec::new(),
        }
    }

    /// Capture an extra subject.
    pub fn with_additional(mut self, subject: impl Into<String>) -> Self {
        self.additional.push(subject.into());
        self
    }

    /// Primary subject followed by the additional ones.
    pub fn all(&self) -> Vec<String> {
        std::iter::once(self.primary.clone())
            .chain(self.additional.iter().cloned())
            .collect()
    }
}

/// Computes the subjects for a topic's stream.
pub trait SubjectCalculator: Send + Sync {
    fn subjects(&self, topic: &str) -> Subjects;
}

impl<F> SubjectCalculator for F
where
    F: Fn(&str) -> Subjects + Send + Sync,
{
    fn subjects(&self, topic: &str) -> Subjects {
        self(topic)
    }
}

/// `topic` → `topic.*`
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultSubjectCalculator;

impl SubjectCalculator for DefaultSubjectCalculator {
    fn subjects(&self, topic: &str) -> Subjects {
        Subjects::new(format!("{}.*", topic))
    }
}

/// Derives the consumer name from a configured durable name and topic.
pub trait DurableCalculator: Send + Sync {
    fn durable_name(&self, durable: &str, topic: &str) -> String;
}

impl<F> DurableCalculator for F
where
    F: Fn(&str, &str) -> String + Send + Sync,
{
    fn durable_name(&self, durable: &str, topic: &str) -> String {
        self(durable, topic)
    }
}

/// Uses the durable name unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultDurableCalculator;

impl DurableCalculator for DefaultDurableCalculator {
    fn durable_name(&self, durable: &str, _topic: &str) -> String {
        durable.to_string()
    }
}

/// Derives the shared consumer name from a queue group and topic.
pub trait QueueGroupCalculator: Send + Sync {
    fn queue_group(&self, queue_group: &str, topic: &str) -> String;
}

impl<F> QueueGroupCalculator for F
where
    F: Fn(&str, &str) -> String + Send + Sync,
{
    fn queue_group(&self, queue_group: &str, topic: &str) -> String {
        self(queue_group, topic)
    }
}

/// Uses the queue group unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultQueueGroupCalculator;

impl QueueGroupCalculator for DefaultQueueGroupCalculator {
    fn queue_group(&self, queue_group: &str, _topic: &str) -> String {
        queue_group.to_string()
    }
}

/// Makes sure a topic's stream exists before publishing or subscribing.
pub struct TopicProvisioner<B> {
    backend: Arc<B>,
    subjects: Arc<dyn SubjectCalculator>,
    auto_provision: bool,
}

impl<B> fmt::Debug for TopicProvisioner<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopicProvisioner")
            .field("auto_provision", &self.auto_provision)
            .finish_non_exhaustive()
    }
}

impl<B: JetStreamBackend> TopicProvisioner<B> {
    pub fn new(
        backend: Arc<B>,
        subjects: Arc<dyn SubjectCalculator>,
        auto_provision: bool,
    ) -> Self {
        Self {
            backend,
            subjects,
            auto_provision,
        }
    }

    /// Subjects the topic's stream captures.
    pub fn subjects(&self, topic: &str) -> Subjects {
        self.subjects.subjects(topic)
    }

    /// Ensure the stream exists, if auto-provisioning is enabled.
    pub async fn ensure_stream(&self, topic: &str) -> Result<()> {
        if !self.auto_provision {
            return Ok(());
        }

        self.provision(topic).await
    }

    /// Ensure the stream exists regardless of auto-provisioning.
    ///
    /// Safe to call concurrently for the same topic, from this process or
    /// others: losing a creation race counts as success.
    pub async fn provision(&self, topic: &str) -> Result<()> {
        if self
            .backend
            .stream_exists(topic)
            .await
            .map_err(|e| JetStreamError::provision(topic, e))?
        {
            debug!(stream = %topic, "Stream already exists");
            return Ok(());
        }

        let spec = StreamSpec {
            name: topic.to_string(),
            subjects: self.subjects(topic).all(),
        };

        info!(stream = %topic, subjects = ?spec.subjects, "Creating stream");

        match self.backend.create_stream(&spec).await {
            Ok(()) => {
                info!(stream = %topic, "Stream created");
                Ok(())
            }
            Err(e) => {
                if matches!(self.backend.stream_exists(topic).await, Ok(true)) {
                    debug!(stream = %topic, "Stream was created concurrently");
                    return Ok(());
                }

                warn!(stream = %topic, error = %e, "Failed to create stream");
                Err(JetStreamError::provision(topic, e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_subjects() {
        let subjects = DefaultSubjectCalculator.subjects("orders");
        assert_eq!(subjects.primary, "orders.*");
        assert!(subjects.additional.is_empty());
        assert_eq!(subjects.all(), vec!["orders.*".to_string()]);
    }

    #[test]
    fn test_closure_subject_calculator() {
        let calculator = |topic: &str| {
            Subjects::new(format!("{}.*", topic)).with_additional(format!("{}.audit.>", topic))
        };

        assert_eq!(
            calculator.subjects("orders").all(),
            vec!["orders.*".to_string(), "orders.audit.>".to_string()]
        );
    }

    #[test]
    fn test_default_name_calculators() {
        assert_eq!(DefaultDurableCalculator.durable_name("billing", "orders"), "billing");
        assert_eq!(DefaultQueueGroupCalculator.queue_group("workers", "orders"), "workers");

        let prefixed = |name: &str, topic: &str| format!("{}-{}", name, topic);
        assert_eq!(prefixed.durable_name("billing", "orders"), "billing-orders");
        assert_eq!(QueueGroupCalculator::queue_group(&prefixed, "workers", "orders"), "workers-orders");
    }
}
