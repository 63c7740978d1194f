//! Shared fixtures: an in-memory JetStream with streams, pull consumers,
//! ack-wait redelivery and `Nats-Msg-Id` deduplication.

#![allow(dead_code)]

use async_trait::async_trait;
use futures::StreamExt;
use jetstream_pubsub::marshaler::MSG_ID_HEADER;
use jetstream_pubsub::{
    ConsumerSpec, Delivery, DeliveryStream, JetStreamBackend, JetStreamError, PublishReceipt,
    Result, StartPosition, StreamSpec, WireMessage,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

const POLL_INTERVAL: Duration = Duration::from_millis(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Poll a condition until it holds or five seconds pass.
pub async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Await with a five second limit.
pub async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out")
}

/// Broker-side acknowledgment tallies.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AckCounters {
    pub acks: usize,
    pub double_acks: usize,
    pub naks: usize,
    pub terms: usize,
}

struct MemoryStream {
    subjects: Vec<String>,
    messages: Vec<WireMessage>,
    msg_ids: HashSet<String>,
}

struct MemoryConsumer {
    durable: bool,
    ack_wait: Duration,
    next: usize,
    redeliver: VecDeque<usize>,
    pending: HashMap<usize, Instant>,
    delivered: HashMap<usize, u64>,
}

#[derive(Default)]
struct State {
    streams: HashMap<String, MemoryStream>,
    consumers: HashMap<(String, String), MemoryConsumer>,
    counters: AckCounters,
    streams_created: usize,
    closes: usize,
    create_race: bool,
    frozen_consumers: bool,
    failing_lookups: bool,
    pull_failure: Option<PullFailure>,
    failed_pulls: usize,
}

/// How every pull fails once [`MemoryJetStream::fail_pulls`] is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullFailure {
    /// Connection trouble; pulling again may succeed
    Unavailable,
    /// The consumer is gone for good
    ConsumerDeleted,
}

impl PullFailure {
    fn error(self) -> JetStreamError {
        match self {
            PullFailure::Unavailable => JetStreamError::consumer_error("no responders"),
            PullFailure::ConsumerDeleted => JetStreamError::ConsumerDeleted("consumer deleted".into()),
        }
    }
}

/// In-memory JetStream. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryJetStream {
    state: Arc<Mutex<State>>,
    notify: Arc<Notify>,
}

impl MemoryJetStream {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn stream_subjects(&self, name: &str) -> Option<Vec<String>> {
        self.lock().streams.get(name).map(|s| s.subjects.clone())
    }

    pub fn stream_len(&self, name: &str) -> usize {
        self.lock()
            .streams
            .get(name)
            .map(|s| s.messages.len())
            .unwrap_or(0)
    }

    pub fn streams_created(&self) -> usize {
        self.lock().streams_created
    }

    /// Consumer names on a stream with their durability, sorted by name.
    pub fn consumers(&self, stream: &str) -> Vec<(String, bool)> {
        let mut consumers: Vec<_> = self
            .lock()
            .consumers
            .iter()
            .filter(|((s, _), _)| s == stream)
            .map(|((_, name), c)| (name.clone(), c.durable))
            .collect();
        consumers.sort();
        consumers
    }

    pub fn counters(&self) -> AckCounters {
        self.lock().counters
    }

    pub fn closes(&self) -> usize {
        self.lock().closes
    }

    pub fn consumer_ack_wait(&self, stream: &str, name: &str) -> Option<Duration> {
        self.lock()
            .consumers
            .get(&(stream.to_string(), name.to_string()))
            .map(|c| c.ack_wait)
    }

    /// Keep existing consumers as they are, as a server refusing the update would.
    pub fn freeze_consumers(&self) {
        self.lock().frozen_consumers = true;
    }

    /// Make stream lookups fail as on a timeout or permissions error.
    pub fn fail_stream_lookups(&self) {
        self.lock().failing_lookups = true;
    }

    /// Make every pull from newly opened message streams fail.
    pub fn fail_pulls(&self, failure: PullFailure) {
        self.lock().pull_failure = Some(failure);
    }

    pub fn failed_pulls(&self) -> usize {
        self.lock().failed_pulls
    }

    /// Make the next stream creation fail as if another client created the
    /// stream first.
    pub fn simulate_create_race(&self) {
        self.lock().create_race = true;
    }

    fn next_delivery(&self, stream: &str, consumer: &str) -> Option<MemoryDelivery> {
        let mut state = self.lock();
        let State {
            streams, consumers, ..
        } = &mut *state;

        let messages = &streams.get(stream)?.messages;
        let c = consumers.get_mut(&(stream.to_string(), consumer.to_string()))?;

        let now = Instant::now();
        let mut expired: Vec<usize> = c
            .pending
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(index, _)| *index)
            .collect();
        expired.sort_unstable();
        for index in expired {
            c.pending.remove(&index);
            c.redeliver.push_back(index);
        }

        let index = match c.redeliver.pop_front() {
            Some(index) => index,
            None if c.next < messages.len() => {
                c.next += 1;
                c.next - 1
            }
            None => return None,
        };

        c.pending.insert(index, now + c.ack_wait);
        let delivered = c.delivered.entry(index).or_insert(0);
        *delivered += 1;

        Some(MemoryDelivery {
            backend: self.clone(),
            stream: stream.to_string(),
            consumer: consumer.to_string(),
            index,
            message: messages[index].clone(),
            delivered: *delivered,
        })
    }

    fn settle(
        &self,
        delivery: &MemoryDelivery,
        apply: impl FnOnce(&mut MemoryConsumer, &mut AckCounters),
    ) {
        {
            let mut state = self.lock();
            let State {
                consumers,
                counters,
                ..
            } = &mut *state;
            let key = (delivery.stream.clone(), delivery.consumer.clone());
            if let Some(consumer) = consumers.get_mut(&key) {
                apply(consumer, counters);
            }
        }
        self.notify.notify_waiters();
    }
}

fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern = pattern.split('.');
    let mut subject = subject.split('.');
    loop {
        match (pattern.next(), subject.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[async_trait]
impl JetStreamBackend for MemoryJetStream {
    type Delivery = MemoryDelivery;

    async fn stream_exists(&self, name: &str) -> Result<bool> {
        let state = self.lock();
        if state.failing_lookups {
            return Err(JetStreamError::from_jetstream_error("request timed out"));
        }
        Ok(state.streams.contains_key(name))
    }

    async fn create_stream(&self, spec: &StreamSpec) -> Result<()> {
        let mut state = self.lock();

        if let Some(existing) = state.streams.get(&spec.name) {
            if existing.subjects == spec.subjects {
                return Ok(());
            }
            return Err(JetStreamError::from_jetstream_error(
                "stream name already in use with a different configuration",
            ));
        }

        state.streams.insert(
            spec.name.clone(),
            MemoryStream {
                subjects: spec.subjects.clone(),
                messages: Vec::new(),
                msg_ids: HashSet::new(),
            },
        );
        state.streams_created += 1;

        if std::mem::take(&mut state.create_race) {
            return Err(JetStreamError::from_jetstream_error("stream name already in use"));
        }

        Ok(())
    }

    async fn publish(
        &self,
        message: WireMessage,
        await_ack: bool,
    ) -> Result<Option<PublishReceipt>> {
        let receipt = {
            let mut state = self.lock();
            let stream = state
                .streams
                .values_mut()
                .find(|s| s.subjects.iter().any(|p| subject_matches(p, &message.subject)))
                .ok_or_else(|| {
                    JetStreamError::publish_error(format!(
                        "no stream matches subject {}",
                        message.subject
                    ))
                })?;

            let msg_id = message
                .headers
                .as_ref()
                .and_then(|headers| headers.get(MSG_ID_HEADER))
                .map(|value| value.as_str().to_string());

            match msg_id {
                Some(id) if stream.msg_ids.contains(&id) => PublishReceipt {
                    sequence: stream.messages.len() as u64,
                    duplicate: true,
                },
                msg_id => {
                    if let Some(id) = msg_id {
                        stream.msg_ids.insert(id);
                    }
                    stream.messages.push(message);
                    PublishReceipt {
                        sequence: stream.messages.len() as u64,
                        duplicate: false,
                    }
                }
            }
        };

        self.notify.notify_waiters();
        Ok(await_ack.then_some(receipt))
    }

    async fn ensure_consumer(&self, stream: &str, spec: &ConsumerSpec) -> Result<Duration> {
        let mut state = self.lock();

        let len = state
            .streams
            .get(stream)
            .map(|s| s.messages.len())
            .ok_or_else(|| JetStreamError::StreamNotFound(stream.to_string()))?;

        let frozen = state.frozen_consumers;
        let key = (stream.to_string(), spec.name.clone());
        if let Some(existing) = state.consumers.get_mut(&key) {
            if !frozen {
                existing.ack_wait = spec.ack_wait;
            }
            return Ok(existing.ack_wait);
        }

        state
            .consumers
            .entry(key)
            .or_insert_with(|| MemoryConsumer {
                durable: spec.durable,
                ack_wait: spec.ack_wait,
                next: match spec.start_position {
                    StartPosition::All => 0,
                    StartPosition::New => len,
                },
                redeliver: VecDeque::new(),
                pending: HashMap::new(),
                delivered: HashMap::new(),
            });

        Ok(spec.ack_wait)
    }

    async fn messages(
        &self,
        stream: &str,
        consumer: &str,
    ) -> Result<DeliveryStream<MemoryDelivery>> {
        let key = (stream.to_string(), consumer.to_string());
        let pull_failure = {
            let state = self.lock();
            if !state.consumers.contains_key(&key) {
                return Err(JetStreamError::consumer_error(format!(
                    "consumer {} not found",
                    consumer
                )));
            }
            state.pull_failure
        };

        if let Some(failure) = pull_failure {
            let backend = self.clone();
            return Ok(futures::stream::repeat_with(move || {
                backend.lock().failed_pulls += 1;
                Err(failure.error())
            })
            .boxed());
        }

        Ok(futures::stream::unfold(
            (self.clone(), key),
            |(backend, key)| async move {
                loop {
                    let notify = backend.notify.clone();
                    let notified = notify.notified();
                    if let Some(delivery) = backend.next_delivery(&key.0, &key.1) {
                        return Some((Ok(delivery), (backend, key)));
                    }
                    tokio::select! {
                        _ = notified => {}
                        _ = tokio::time::sleep(POLL_INTERVAL) => {}
                    }
                }
            },
        )
        .boxed())
    }

    async fn close(&self) -> Result<()> {
        self.lock().closes += 1;
        Ok(())
    }
}

pub struct MemoryDelivery {
    backend: MemoryJetStream,
    stream: String,
    consumer: String,
    index: usize,
    message: WireMessage,
    delivered: u64,
}

#[async_trait]
impl Delivery for MemoryDelivery {
    fn message(&self) -> WireMessage {
        self.message.clone()
    }

    fn delivered(&self) -> u64 {
        self.delivered
    }

    async fn ack(&self) -> Result<()> {
        let index = self.index;
        self.backend.settle(self, |consumer, counters| {
            consumer.pending.remove(&index);
            consumer.redeliver.retain(|i| *i != index);
            counters.acks += 1;
        });
        Ok(())
    }

    async fn ack_sync(&self) -> Result<()> {
        let index = self.index;
        self.backend.settle(self, |consumer, counters| {
            consumer.pending.remove(&index);
            consumer.redeliver.retain(|i| *i != index);
            counters.double_acks += 1;
        });
        Ok(())
    }

    async fn nak(&self, delay: Option<Duration>) -> Result<()> {
        let index = self.index;
        self.backend.settle(self, |consumer, counters| {
            match delay {
                Some(delay) => {
                    consumer.pending.insert(index, Instant::now() + delay);
                }
                None => {
                    consumer.pending.remove(&index);
                    consumer.redeliver.push_back(index);
                }
            }
            counters.naks += 1;
        });
        Ok(())
    }

    async fn term(&self) -> Result<()> {
        let index = self.index;
        self.backend.settle(self, |consumer, counters| {
            consumer.pending.remove(&index);
            consumer.redeliver.retain(|i| *i != index);
            counters.terms += 1;
        });
        Ok(())
    }
}

