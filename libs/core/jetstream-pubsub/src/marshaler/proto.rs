use super::{publish_subject, Marshaler, Unmarshaler, WireMessage};
use crate::error::{JetStreamError, Result};
use bytes::Bytes;
use messaging::Envelope;
use prost::Message;
use std::collections::BTreeMap;

/// Protobuf schema of an envelope on the wire.
///
/// ```text
/// message Envelope {
///   string uuid = 1;
///   map<string, string> metadata = 2;
///   bytes payload = 3;
/// }
/// ```
#[derive(Clone, PartialEq, prost::Message)]
pub struct EnvelopeProto {
    #[prost(string, tag = "1")]
    pub uuid: String,
    #[prost(btree_map = "string, string", tag = "2")]
    pub metadata: BTreeMap<String, String>,
    #[prost(bytes = "bytes", tag = "3")]
    pub payload: Bytes,
}

/// Stores the envelope as a compact protobuf message in the body.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProtoMarshaler;

impl Marshaler for ProtoMarshaler {
    fn marshal(&self, topic: &str, envelope: &Envelope) -> Result<WireMessage> {
        let proto = EnvelopeProto {
            uuid: envelope.id.clone(),
            metadata: envelope.metadata.as_map().clone(),
            payload: envelope.payload.clone(),
        };

        Ok(WireMessage::new(
            publish_subject(topic, &proto.uuid),
            proto.encode_to_vec(),
        ))
    }
}

impl Unmarshaler for ProtoMarshaler {
    fn unmarshal(&self, message: &WireMessage) -> Result<Envelope> {
        let proto = EnvelopeProto::decode(message.payload.clone()).map_err(JetStreamError::decode)?;

        Ok(Envelope::new(proto.uuid, proto.payload).with_metadata_map(proto.metadata.into()))
    }
}
