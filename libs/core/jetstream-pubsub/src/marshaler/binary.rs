use super::{publish_subject, EnvelopeRecord, EnvelopeRef, Marshaler, Unmarshaler, WireMessage};
use crate::error::{JetStreamError, Result};
use messaging::Envelope;

/// Stores the whole envelope as a bincode record in the message body.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryMarshaler;

impl Marshaler for BinaryMarshaler {
    fn marshal(&self, topic: &str, envelope: &Envelope) -> Result<WireMessage> {
        let body = bincode::serialize(&EnvelopeRef::from(envelope))
            .map_err(|e| JetStreamError::encode(format!("cannot encode message: {}", e)))?;

        Ok(WireMessage::new(publish_subject(topic, &envelope.id), body))
    }
}

impl Unmarshaler for BinaryMarshaler {
    fn unmarshal(&self, message: &WireMessage) -> Result<Envelope> {
        let record: EnvelopeRecord = bincode::deserialize(&message.payload)
            .map_err(|e| JetStreamError::decode(format!("cannot decode message: {}", e)))?;

        Ok(record.into_envelope())
    }
}
