//! Conversion between envelopes and NATS wire messages.
//!
//! Four interchangeable codecs share the [`Marshaler`]/[`Unmarshaler`]
//! contract:
//!
//! | Codec | Body | Headers |
//! |-------|------|---------|
//! | [`BinaryMarshaler`] | bincode record of the whole envelope | unused |
//! | [`JsonMarshaler`] | JSON document of the whole envelope | unused |
//! | [`HeaderMarshaler`] | raw payload | id + one header per metadata entry |
//! | [`ProtoMarshaler`] | protobuf `{uuid, metadata, payload}` | unused |
//!
//! Codecs hold no state and can be shared freely between tasks.

mod binary;
mod headers;
mod json;
mod proto;

pub use binary::BinaryMarshaler;
pub use headers::{HeaderMarshaler, ENVELOPE_ID_HEADER, MSG_ID_HEADER, RESERVED_HEADERS};
pub use json::JsonMarshaler;
pub use proto::{EnvelopeProto, ProtoMarshaler};

use crate::error::Result;
use async_nats::HeaderMap;
use bytes::Bytes;
use messaging::{Envelope, Metadata};
use serde::{Deserialize, Serialize};

/// A message as it travels through the broker.
#[derive(Debug, Clone)]
pub struct WireMessage {
    /// Subject the message is published to
    pub subject: String,
    /// NATS headers, if any
    pub headers: Option<HeaderMap>,
    /// Message body
    pub payload: Bytes,
}

impl WireMessage {
    /// Create a wire message without headers.
    pub fn new(subject: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            subject: subject.into(),
            headers: None,
            payload: payload.into(),
        }
    }

    /// Attach headers.
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = Some(headers);
        self
    }

    /// Mutable access to the headers, creating them if absent.
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        self.headers.get_or_insert_with(HeaderMap::new)
    }
}

/// Turns an envelope into a wire message.
pub trait Marshaler: Send + Sync {
    fn marshal(&self, topic: &str, envelope: &Envelope) -> Result<WireMessage>;
}

/// Turns a wire message back into a fresh, detached envelope.
pub trait Unmarshaler: Send + Sync {
    fn unmarshal(&self, message: &WireMessage) -> Result<Envelope>;
}

/// A codec implementing both directions.
pub trait MarshalerUnmarshaler: Marshaler + Unmarshaler {}

impl<T: Marshaler + Unmarshaler> MarshalerUnmarshaler for T {}

/// Subject an envelope is published to: `topic.id`.
pub fn publish_subject(topic: &str, id: &str) -> String {
    format!("{}.{}", topic, id)
}

/// Borrowed view of an envelope, serialized by the binary codec.
#[derive(Serialize)]
struct EnvelopeRef<'a> {
    uuid: &'a str,
    metadata: &'a Metadata,
    payload: &'a [u8],
}

impl<'a> From<&'a Envelope> for EnvelopeRef<'a> {
    fn from(envelope: &'a Envelope) -> Self {
        Self {
            uuid: &envelope.id,
            metadata: &envelope.metadata,
            payload: &envelope.payload,
        }
    }
}

/// Owned counterpart of [`EnvelopeRef`].
#[derive(Deserialize)]
struct EnvelopeRecord {
    uuid: String,
    #[serde(default)]
    metadata: Metadata,
    payload: Vec<u8>,
}

impl EnvelopeRecord {
    fn into_envelope(self) -> Envelope {
        Envelope::new(self.uuid, self.payload).with_metadata_map(self.metadata)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use messaging::Envelope;

    pub fn sample_envelope() -> Envelope {
        Envelope::new("1", "zag")
            .with_metadata("foo", "bar")
            .with_metadata("tenant", "acme")
    }
}
