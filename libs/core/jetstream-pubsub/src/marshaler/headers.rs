use super::{publish_subject, Marshaler, Unmarshaler, WireMessage};
use crate::error::{JetStreamError, Result};
use async_nats::HeaderMap;
use messaging::{Envelope, Metadata};

/// Header carrying the envelope id.
pub const ENVELOPE_ID_HEADER: &str = "_envelope_id";

/// JetStream deduplication id header.
pub const MSG_ID_HEADER: &str = "Nats-Msg-Id";

/// Headers that are never turned into envelope metadata.
///
/// Besides the id header these are JetStream publish controls
/// (deduplication id and optimistic-concurrency expectations).
pub const RESERVED_HEADERS: &[&str] = &[
    ENVELOPE_ID_HEADER,
    MSG_ID_HEADER,
    "Nats-Expected-Stream",
    "Nats-Expected-Last-Msg-Id",
    "Nats-Expected-Last-Sequence",
    "Nats-Expected-Last-Subject-Sequence",
];

fn is_reserved(name: &str) -> bool {
    RESERVED_HEADERS
        .iter()
        .any(|reserved| reserved.eq_ignore_ascii_case(name))
}

fn valid_header_name(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(|b| (33..=126).contains(&b) && b != b':')
}

fn valid_header_value(value: &str) -> bool {
    !value.contains(['\r', '\n'])
}

/// Maps envelopes directly onto NATS messages.
///
/// The payload becomes the message body untouched, the id goes into
/// [`ENVELOPE_ID_HEADER`] and every metadata entry becomes its own header.
/// Metadata keys matching JetStream publish controls (e.g. `Nats-Msg-Id`)
/// reach the broker but are not read back as metadata.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeaderMarshaler;

impl Marshaler for HeaderMarshaler {
    fn marshal(&self, topic: &str, envelope: &Envelope) -> Result<WireMessage> {
        let mut headers = HeaderMap::new();
        headers.insert(ENVELOPE_ID_HEADER, envelope.id.as_str());

        for (key, value) in &envelope.metadata {
            if key.eq_ignore_ascii_case(ENVELOPE_ID_HEADER) {
                return Err(JetStreamError::encode(format!(
                    "metadata key {:?} collides with the envelope id header",
                    key
                )));
            }
            if !valid_header_name(key) {
                return Err(JetStreamError::encode(format!(
                    "metadata key {:?} is not a valid header name",
                    key
                )));
            }
            if !valid_header_value(value) {
                return Err(JetStreamError::encode(format!(
                    "metadata value for {:?} contains a line break",
                    key
                )));
            }
            headers.insert(key.as_str(), value.as_str());
        }

        Ok(WireMessage::new(publish_subject(topic, &envelope.id), envelope.payload.clone())
            .with_headers(headers))
    }
}

impl Unmarshaler for HeaderMarshaler {
    fn unmarshal(&self, message: &WireMessage) -> Result<Envelope> {
        let headers = message
            .headers
            .as_ref()
            .ok_or_else(|| JetStreamError::decode("message has no headers"))?;

        let id = headers
            .get(ENVELOPE_ID_HEADER)
            .map(|value| value.as_str().to_string())
            .ok_or_else(|| {
                JetStreamError::decode(format!("missing {} header", ENVELOPE_ID_HEADER))
            })?;

        let mut metadata = Metadata::new();
        for (name, values) in headers.iter() {
            let name: &str = name.as_ref();
            if is_reserved(name) {
                continue;
            }

            match values.as_slice() {
                [value] => metadata.set(name, value.as_str()),
                _ => {
                    return Err(JetStreamError::decode(format!(
                        "multiple values received in NATS header for {:?}: {:?}",
                        name, values
                    )))
                }
            }
        }

        Ok(Envelope::new(id, message.payload.clone()).with_metadata_map(metadata))
    }
}
