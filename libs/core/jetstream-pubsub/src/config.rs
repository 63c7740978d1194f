//! Connection, publisher and subscriber configuration.

use crate::backend::{NatsJetStream, StartPosition};
use crate::error::{JetStreamError, Result};
use crate::marshaler::{Marshaler, Unmarshaler};
use crate::topic::{
    DefaultDurableCalculator, DefaultQueueGroupCalculator, DefaultSubjectCalculator,
    DurableCalculator, QueueGroupCalculator, SubjectCalculator,
};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// NATS connection settings.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Server URL(s), comma separated
    pub url: String,

    /// Client name reported to the server
    pub name: Option<String>,

    /// Timeout for establishing the connection
    pub connection_timeout: Duration,

    /// Keep retrying when the server is unreachable at startup
    pub retry_on_initial_connect: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            name: None,
            connection_timeout: Duration::from_secs(5),
            retry_on_initial_connect: false,
        }
    }
}

impl ConnectionConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Load configuration from environment variables.
    ///
    /// Reads:
    /// - `NATS_URL` (default: nats://localhost:4222)
    /// - `NATS_CLIENT_NAME` (default: unset)
    /// - `NATS_CONNECTION_TIMEOUT_SECS` (default: 5)
    /// - `NATS_RETRY_ON_INITIAL_CONNECT` (default: false)
    pub fn from_env() -> Self {
        let url = std::env::var("NATS_URL").unwrap_or_else(|_| "nats://localhost:4222".to_string());
        let name = std::env::var("NATS_CLIENT_NAME").ok().filter(|v| !v.is_empty());
        let connection_timeout = std::env::var("NATS_CONNECTION_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(5));
        let retry_on_initial_connect = std::env::var("NATS_RETRY_ON_INITIAL_CONNECT")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        Self {
            url,
            name,
            connection_timeout,
            retry_on_initial_connect,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn with_retry_on_initial_connect(mut self, retry: bool) -> Self {
        self.retry_on_initial_connect = retry;
        self
    }

    /// Connect to NATS and open a JetStream context.
    pub async fn connect(&self) -> Result<NatsJetStream> {
        let mut options =
            async_nats::ConnectOptions::new().connection_timeout(self.connection_timeout);
        if let Some(name) = &self.name {
            options = options.name(name.as_str());
        }
        if self.retry_on_initial_connect {
            options = options.retry_on_initial_connect();
        }

        let client = options.connect(self.url.as_str()).await?;
        info!(url = %self.url, "Connected to NATS");

        Ok(NatsJetStream::new(client))
    }
}

/// Publisher settings.
#[derive(Clone)]
pub struct PublisherConfig {
    /// Codec used to build wire messages (required)
    pub marshaler: Option<Arc<dyn Marshaler>>,

    /// Create the topic's stream on first publish
    pub auto_provision: bool,

    /// Send the envelope id as `Nats-Msg-Id` for broker-side deduplication
    pub track_msg_id: bool,

    /// Don't wait for the broker to confirm each message
    pub fire_and_forget: bool,

    /// Subjects captured by provisioned streams
    pub subject_calculator: Arc<dyn SubjectCalculator>,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            marshaler: None,
            auto_provision: true,
            track_msg_id: false,
            fire_and_forget: false,
            subject_calculator: Arc::new(DefaultSubjectCalculator),
        }
    }
}

impl fmt::Debug for PublisherConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublisherConfig")
            .field("marshaler", &self.marshaler.is_some())
            .field("auto_provision", &self.auto_provision)
            .field("track_msg_id", &self.track_msg_id)
            .field("fire_and_forget", &self.fire_and_forget)
            .finish_non_exhaustive()
    }
}

impl PublisherConfig {
    /// Create a configuration with the given codec.
    pub fn new(marshaler: impl Marshaler + 'static) -> Self {
        Self {
            marshaler: Some(Arc::new(marshaler)),
            ..Default::default()
        }
    }

    pub fn with_marshaler(mut self, marshaler: Arc<dyn Marshaler>) -> Self {
        self.marshaler = Some(marshaler);
        self
    }

    pub fn with_auto_provision(mut self, enabled: bool) -> Self {
        self.auto_provision = enabled;
        self
    }

    pub fn with_track_msg_id(mut self, enabled: bool) -> Self {
        self.track_msg_id = enabled;
        self
    }

    pub fn with_fire_and_forget(mut self, enabled: bool) -> Self {
        self.fire_and_forget = enabled;
        self
    }

    pub fn with_subject_calculator(mut self, calculator: impl SubjectCalculator + 'static) -> Self {
        self.subject_calculator = Arc::new(calculator);
        self
    }

    /// Check the configuration and return the codec.
    pub fn validate(&self) -> Result<Arc<dyn Marshaler>> {
        self.marshaler
            .clone()
            .ok_or_else(|| JetStreamError::config("PublisherConfig.marshaler is missing"))
    }
}

/// What to do with a broker message that cannot be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecodeFailurePolicy {
    /// Negative-ack it, leaving redelivery and dead-lettering to the broker
    #[default]
    Nak,
    /// Terminate it so it is never redelivered
    Term,
}

/// Subscriber settings.
#[derive(Clone)]
pub struct SubscriberConfig {
    /// Codec used to read wire messages (required)
    pub unmarshaler: Option<Arc<dyn Unmarshaler>>,

    /// Client identifier, prefix of ephemeral consumer names
    pub client_id: String,

    /// Durable consumer name; survives restarts
    pub durable_name: Option<String>,

    /// Queue group; subscriptions in the same group share messages
    pub queue_group: Option<String>,

    /// Concurrent delivery workers per subscription
    pub subscribers_count: usize,

    /// Time the application has to resolve a message before redelivery
    pub ack_wait: Duration,

    /// Time close waits for in-flight messages before forcing unsubscribe
    pub close_timeout: Duration,

    /// Wait for the broker to confirm each ack
    pub ack_sync: bool,

    /// Create the topic's stream on subscribe
    pub auto_provision: bool,

    /// Redelivery delay for nacked messages (`None`: immediately)
    pub nak_delay: Option<Duration>,

    /// Maximum deliveries per message (`None`: unlimited)
    pub max_deliver: Option<i64>,

    /// Where newly created consumers start reading
    pub start_position: StartPosition,

    /// Handling of undecodable messages
    pub decode_failure: DecodeFailurePolicy,

    pub subject_calculator: Arc<dyn SubjectCalculator>,
    pub durable_calculator: Arc<dyn DurableCalculator>,
    pub queue_group_calculator: Arc<dyn QueueGroupCalculator>,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            unmarshaler: None,
            client_id: format!("subscriber-{}", uuid::Uuid::new_v4().simple()),
            durable_name: None,
            queue_group: None,
            subscribers_count: 1,
            ack_wait: Duration::from_secs(30),
            close_timeout: Duration::from_secs(30),
            ack_sync: false,
            auto_provision: true,
            nak_delay: None,
            max_deliver: None,
            start_position: StartPosition::All,
            decode_failure: DecodeFailurePolicy::Nak,
            subject_calculator: Arc::new(DefaultSubjectCalculator),
            durable_calculator: Arc::new(DefaultDurableCalculator),
            queue_group_calculator: Arc::new(DefaultQueueGroupCalculator),
        }
    }
}

impl fmt::Debug for SubscriberConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriberConfig")
            .field("unmarshaler", &self.unmarshaler.is_some())
            .field("client_id", &self.client_id)
            .field("durable_name", &self.durable_name)
            .field("queue_group", &self.queue_group)
            .field("subscribers_count", &self.subscribers_count)
            .field("ack_wait", &self.ack_wait)
            .field("close_timeout", &self.close_timeout)
            .field("ack_sync", &self.ack_sync)
            .field("auto_provision", &self.auto_provision)
            .field("nak_delay", &self.nak_delay)
            .field("max_deliver", &self.max_deliver)
            .field("start_position", &self.start_position)
            .field("decode_failure", &self.decode_failure)
            .finish_non_exhaustive()
    }
}

impl SubscriberConfig {
    /// Create a configuration with the given codec.
    pub fn new(unmarshaler: impl Unmarshaler + 'static) -> Self {
        Self {
            unmarshaler: Some(Arc::new(unmarshaler)),
            ..Default::default()
        }
    }

    pub fn with_unmarshaler(mut self, unmarshaler: Arc<dyn Unmarshaler>) -> Self {
        self.unmarshaler = Some(unmarshaler);
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn with_durable_name(mut self, name: impl Into<String>) -> Self {
        self.durable_name = Some(name.into());
        self
    }

    pub fn with_queue_group(mut self, group: impl Into<String>) -> Self {
        self.queue_group = Some(group.into());
        self
    }

    pub fn with_subscribers_count(mut self, count: usize) -> Self {
        self.subscribers_count = count;
        self
    }

    pub fn with_ack_wait(mut self, ack_wait: Duration) -> Self {
        self.ack_wait = ack_wait;
        self
    }

    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    pub fn with_ack_sync(mut self, enabled: bool) -> Self {
        self.ack_sync = enabled;
        self
    }

    pub fn with_auto_provision(mut self, enabled: bool) -> Self {
        self.auto_provision = enabled;
        self
    }

    pub fn with_nak_delay(mut self, delay: Duration) -> Self {
        self.nak_delay = Some(delay);
        self
    }

    pub fn with_max_deliver(mut self, max_deliver: i64) -> Self {
        self.max_deliver = Some(max_deliver);
        self
    }

    pub fn with_start_position(mut self, position: StartPosition) -> Self {
        self.start_position = position;
        self
    }

    pub fn with_decode_failure(mut self, policy: DecodeFailurePolicy) -> Self {
        self.decode_failure = policy;
        self
    }

    pub fn with_subject_calculator(mut self, calculator: impl SubjectCalculator + 'static) -> Self {
        self.subject_calculator = Arc::new(calculator);
        self
    }

    pub fn with_durable_calculator(mut self, calculator: impl DurableCalculator + 'static) -> Self {
        self.durable_calculator = Arc::new(calculator);
        self
    }

    pub fn with_queue_group_calculator(
        mut self,
        calculator: impl QueueGroupCalculator + 'static,
    ) -> Self {
        self.queue_group_calculator = Arc::new(calculator);
        self
    }

    /// Queue group, ignoring an empty name.
    pub fn queue_group(&self) -> Option<&str> {
        self.queue_group.as_deref().filter(|group| !group.is_empty())
    }

    /// Durable name, ignoring an empty name.
    pub fn durable_name(&self) -> Option<&str> {
        self.durable_name.as_deref().filter(|name| !name.is_empty())
    }

    /// Check the configuration and return the codec.
    pub fn validate(&self) -> Result<Arc<dyn Unmarshaler>> {
        let unmarshaler = self
            .unmarshaler
            .clone()
            .ok_or_else(|| JetStreamError::config("SubscriberConfig.unmarshaler is missing"))?;

        if self.subscribers_count == 0 {
            return Err(JetStreamError::config(
                "SubscriberConfig.subscribers_count must be at least 1",
            ));
        }

        if self.subscribers_count > 1 && self.queue_group().is_none() {
            return Err(JetStreamError::config(
                "SubscriberConfig.queue_group is required when subscribers_count > 1",
            ));
        }

        if self.ack_wait.is_zero() {
            return Err(JetStreamError::config(
                "SubscriberConfig.ack_wait must be greater than zero",
            ));
        }

        Ok(unmarshaler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marshaler::JsonMarshaler;

    #[test]
    fn test_connection_defaults() {
        let config = ConnectionConfig::default();
        assert_eq!(config.url, "nats://localhost:4222");
        assert_eq!(config.connection_timeout, Duration::from_secs(5));
        assert!(!config.retry_on_initial_connect);

        let config = ConnectionConfig::new("nats://nats:4222")
            .with_name("orders-service")
            .with_retry_on_initial_connect(true);
        assert_eq!(config.url, "nats://nats:4222");
        assert_eq!(config.name.as_deref(), Some("orders-service"));
        assert!(config.retry_on_initial_connect);
    }

    #[test]
    fn test_publisher_defaults() {
        let config = PublisherConfig::default();
        assert!(config.auto_provision);
        assert!(!config.track_msg_id);
        assert!(!config.fire_and_forget);
        assert!(config.validate().is_err());

        assert!(PublisherConfig::new(JsonMarshaler).validate().is_ok());
    }

    #[test]
    fn test_subscriber_defaults() {
        let config = SubscriberConfig::new(JsonMarshaler);
        assert_eq!(config.subscribers_count, 1);
        assert_eq!(config.ack_wait, Duration::from_secs(30));
        assert_eq!(config.close_timeout, Duration::from_secs(30));
        assert!(config.auto_provision);
        assert!(!config.ack_sync);
        assert!(config.client_id.starts_with("subscriber-"));
        assert_eq!(config.decode_failure, DecodeFailurePolicy::Nak);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_subscriber_requires_unmarshaler() {
        let err = SubscriberConfig::default().validate().err().unwrap();
        assert!(matches!(err, JetStreamError::Config(_)));
        assert!(err.to_string().contains("unmarshaler"));
    }

    #[test]
    fn test_multiple_subscribers_require_queue_group() {
        let config = SubscriberConfig::new(JsonMarshaler).with_subscribers_count(3);
        assert!(config.validate().is_err());

        let config = config.with_queue_group("");
        assert!(config.validate().is_err());

        let config = config.with_queue_group("workers");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_subscribers_rejected() {
        let config = SubscriberConfig::new(JsonMarshaler).with_subscribers_count(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_ack_wait_rejected() {
        let config = SubscriberConfig::new(JsonMarshaler).with_ack_wait(Duration::ZERO);
        assert!(config.validate().is_err());
    }
}
