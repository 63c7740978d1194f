use super::{publish_subject, Marshaler, Unmarshaler, WireMessage};
use crate::error::{JetStreamError, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use messaging::{Envelope, Metadata};
use serde::{Deserialize, Serialize};

/// Stores the whole envelope as a JSON document in the message body.
///
/// The payload is carried as a standard base64 string.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonMarshaler;

#[derive(Serialize)]
struct JsonEnvelopeRef<'a> {
    uuid: &'a str,
    metadata: &'a Metadata,
    payload: String,
}

#[derive(Deserialize)]
struct JsonEnvelope {
    uuid: String,
    #[serde(default)]
    metadata: Metadata,
    #[serde(default)]
    payload: String,
}

impl Marshaler for JsonMarshaler {
    fn marshal(&self, topic: &str, envelope: &Envelope) -> Result<WireMessage> {
        let document = JsonEnvelopeRef {
            uuid: &envelope.id,
            metadata: &envelope.metadata,
            payload: BASE64.encode(&envelope.payload),
        };
        let body = serde_json::to_vec(&document)
            .map_err(|e| JetStreamError::encode(format!("cannot encode message: {}", e)))?;

        Ok(WireMessage::new(publish_subject(topic, &envelope.id), body))
    }
}

impl Unmarshaler for JsonMarshaler {
    fn unmarshal(&self, message: &WireMessage) -> Result<Envelope> {
        let document: JsonEnvelope = serde_json::from_slice(&message.payload)
            .map_err(|e| JetStreamError::decode(format!("cannot decode message: {}", e)))?;

        let payload = BASE64
            .decode(document.payload.as_bytes())
            .map_err(|e| JetStreamError::decode(format!("cannot decode payload: {}", e)))?;

        Ok(Envelope::new(document.uuid, payload).with_metadata_map(document.metadata))
    }
}
