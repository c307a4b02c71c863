//! Second Life packet serialization and deserialization
//!
//! Wire layout of every LLUDP datagram:
//!
//! ```text
//! [flags:1] [sequence:4 LE] [extra_len:1] [extra:extra_len]
//! [message number:1|2|4] [body ...] [ack_count:1] [acks:4 LE * n] [ack_count:1]
//! ```
//!
//! The body is the template's blocks in schema order. Zerocoding, when flagged,
//! covers the body only; appended acks are located from the tail of the packet.

use crate::networking::packets::{Block, FieldType, Message};
use bytes::{BufMut, Bytes, BytesMut};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace};

pub mod field_codec;
pub mod packet_buffer;
pub mod template_parser;
pub mod template_registry;
pub mod zerocode;

pub use packet_buffer::PacketBuffer;
use template_registry::{MessageNumber, MessageTemplate, Occurrence, Schema};

/// Fixed part of the header: flags, sequence and the extra-header length byte
pub const HEADER_LEN: usize = 6;

/// Most acks a single packet can append
pub const MAX_APPENDED_ACKS: usize = u8::MAX as usize;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CodecError {
    #[error("Malformed field {field}: {reason}")]
    MalformedField { field: String, reason: String },

    #[error("Incomplete message {message}: {reason}")]
    IncompleteMessage { message: String, reason: String },

    #[error("Unknown message {message}")]
    UnknownMessage { message: String },

    #[error("Block {block} has no field named {field}")]
    UnknownField { block: String, field: String },

    #[error("Message {message} has no block named {block}")]
    UnknownBlock { message: String, block: String },

    #[error("Field {field} is {expected}, got a {found} value")]
    FieldTypeMismatch { field: String, expected: FieldType, found: &'static str },

    #[error("Expected a {expected} value, found {found}")]
    ValueType { expected: &'static str, found: &'static str },

    #[error("Cannot append block {block} to {message}: {reason}")]
    BlockOrder { message: String, block: String, reason: String },

    #[error("Packet truncated: need {needed} bytes, {remaining} remain")]
    Truncated { needed: usize, remaining: usize },

    #[error("Too many appended acks: {count} (at most 255 fit in one packet)")]
    TooManyAcks { count: usize },

    #[error("Template error at line {line}: {reason}")]
    Template { line: usize, reason: String },
}

pub type CodecResult<T> = Result<T, CodecError>;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PacketFlags: u8 {
        /// receiver must ack this sequence number
        const RELIABLE = 0x01;
        /// retransmission of an earlier send
        const RESENT = 0x02;
        const ACKS_APPENDED = 0x04;
        const ZEROCODED = 0x08;
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct PacketHeader {
    pub flags: PacketFlags,
    pub sequence: u32,
    /// opaque extra header bytes, normally empty
    pub extra: Bytes,
}

impl PacketHeader {
    pub fn new(sequence: u32, reliable: bool) -> Self {
        let flags = if reliable { PacketFlags::RELIABLE } else { PacketFlags::empty() };
        Self { flags, sequence, extra: Bytes::new() }
    }

    pub fn is_reliable(&self) -> bool {
        self.flags.contains(PacketFlags::RELIABLE)
    }

    pub fn is_resent(&self) -> bool {
        self.flags.contains(PacketFlags::RESENT)
    }
}

/// A decoded datagram, or one about to be encoded
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub header: PacketHeader,
    pub message: Message,
    /// sequence numbers acknowledged by this packet
    pub acks: Vec<u32>,
}

impl Packet {
    pub fn new(message: Message, sequence: u32, reliable: bool) -> Self {
        Self { header: PacketHeader::new(sequence, reliable), message, acks: Vec::new() }
    }

    pub fn with_acks(mut self, acks: Vec<u32>) -> Self {
        self.acks = acks;
        self
    }
}

/// Header, message number, appended acks and un-zerocoded body of a datagram.
///
/// Produced without consulting the schema, so the circuit can ack a packet and
/// process its appended acks even when the body cannot be decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub header: PacketHeader,
    pub number: MessageNumber,
    pub body: Bytes,
    pub acks: Vec<u32>,
}

/// Copy of an encoded packet with the resent flag raised
pub fn mark_resent(packet: &[u8]) -> Bytes {
    let mut copy = BytesMut::from(packet);
    if let Some(flags) = copy.first_mut() {
        *flags |= PacketFlags::RESENT.bits();
    }
    copy.freeze()
}

/// Stateless encoder/decoder bound to a schema
#[derive(Debug, Clone)]
pub struct PacketCodec {
    schema: Arc<Schema>,
}

impl PacketCodec {
    pub fn new(schema: Arc<Schema>) -> Self {
        Self { schema }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Serialize a packet into its UDP payload.
    ///
    /// The zerocoded and acks-appended flags are derived here: the body is
    /// zerocoded only when the template asks for it and it actually shrinks.
    pub fn encode(&self, packet: &Packet) -> CodecResult<Bytes> {
        if packet.acks.len() > MAX_APPENDED_ACKS {
            return Err(CodecError::TooManyAcks { count: packet.acks.len() });
        }
        let extra_len = u8::try_from(packet.header.extra.len()).map_err(|_| CodecError::MalformedField {
            field: "extra header".to_string(),
            reason: format!("{} bytes exceed the 1 byte length prefix", packet.header.extra.len()),
        })?;

        let message = &packet.message;
        let body = self.encode_body(message)?;

        let mut flags = packet.header.flags - PacketFlags::ZEROCODED - PacketFlags::ACKS_APPENDED;
        let body = match message.template().is_zerocoded().then(|| zerocode::encode_if_smaller(&body)).flatten() {
            Some(coded) => {
                flags |= PacketFlags::ZEROCODED;
                coded
            }
            None => body,
        };
        if !packet.acks.is_empty() {
            flags |= PacketFlags::ACKS_APPENDED;
        }

        let mut buf = BytesMut::with_capacity(
            HEADER_LEN + packet.header.extra.len() + message.number().encoded_len() + body.len() + 2 + 4 * packet.acks.len(),
        );
        buf.put_u8(flags.bits());
        buf.put_u32_le(packet.header.sequence);
        buf.put_u8(extra_len);
        buf.put_slice(&packet.header.extra);
        message.number().write(&mut buf);
        buf.put_slice(&body);

        if !packet.acks.is_empty() {
            buf.put_u8(packet.acks.len() as u8);
            for ack in &packet.acks {
                buf.put_u32_le(*ack);
            }
            buf.put_u8(packet.acks.len() as u8);
        }

        trace!(
            "Encoded {} seq={} flags={:?} ({} bytes)",
            message.name(),
            packet.header.sequence,
            flags,
            buf.len()
        );
        Ok(buf.freeze())
    }

    /// Body bytes of a message, before any zerocoding
    pub fn encode_body(&self, message: &Message) -> CodecResult<Vec<u8>> {
        message.validate()?;

        let mut buf = BytesMut::new();
        for (template, instances) in message.slots() {
            if template.occurrence == Occurrence::Variable {
                buf.put_u8(instances.len() as u8);
            }
            for block in instances {
                encode_block(message, block, &mut buf)?;
            }
        }
        Ok(buf.to_vec())
    }

    /// Parse the schema-independent parts of a datagram
    pub fn read_envelope(data: &[u8]) -> CodecResult<Envelope> {
        let mut reader = PacketBuffer::new(data);
        if data.len() < HEADER_LEN {
            return Err(CodecError::Truncated { needed: HEADER_LEN, remaining: data.len() });
        }

        let flags = PacketFlags::from_bits_truncate(reader.get_u8()?);
        let sequence = reader.get_u32_le()?;
        let extra_len = reader.get_u8()? as usize;
        let extra = Bytes::copy_from_slice(reader.take(extra_len)?);
        let header = PacketHeader { flags, sequence, extra };

        let number = MessageNumber::read(&mut reader)?;
        let rest = reader.remaining_bytes();

        let (body, acks) = if flags.contains(PacketFlags::ACKS_APPENDED) {
            split_appended_acks(rest)?
        } else {
            (rest, Vec::new())
        };

        let body = if flags.contains(PacketFlags::ZEROCODED) {
            Bytes::from(zerocode::decode(body)?)
        } else {
            Bytes::copy_from_slice(body)
        };

        Ok(Envelope { header, number, body, acks })
    }

    /// Resolve the template for an envelope and decode its body
    pub fn decode_envelope(&self, envelope: &Envelope) -> CodecResult<Message> {
        let template = self.schema.lookup_by_number(envelope.number)?;
        self.decode_body(template, &envelope.body)
    }

    /// Parse a complete datagram
    pub fn decode(&self, data: &[u8]) -> CodecResult<Packet> {
        let envelope = Self::read_envelope(data)?;
        let message = self.decode_envelope(&envelope)?;
        Ok(Packet { header: envelope.header, message, acks: envelope.acks })
    }

    /// Decode a plain (not zerocoded) body against a template
    pub fn decode_body(&self, template: &Arc<MessageTemplate>, body: &[u8]) -> CodecResult<Message> {
        let mut reader = PacketBuffer::new(body);
        let mut blocks = Vec::with_capacity(template.blocks.len());

        for block_template in &template.blocks {
            let count = match block_template.occurrence {
                Occurrence::Single => 1,
                Occurrence::Multiple(n) => n as usize,
                Occurrence::Optional => usize::from(reader.has_remaining()),
                Occurrence::Variable => match reader.peek_u8() {
                    Some(_) => reader.get_u8()? as usize,
                    None => {
                        debug!(
                            "{} ended before the count of block '{}', treating it as empty",
                            template.name, block_template.name
                        );
                        0
                    }
                },
            };

            let mut instances = Vec::with_capacity(count);
            for _ in 0..count {
                let mut values = Vec::with_capacity(block_template.fields.len());
                for field in &block_template.fields {
                    let value = field_codec::read(&mut reader, field.field_type).map_err(|e| match e {
                        CodecError::MalformedField { reason, .. } => CodecError::MalformedField {
                            field: format!("{}.{}.{} ({})", template.name, block_template.name, field.name, field.field_type),
                            reason,
                        },
                        other => other,
                    })?;
                    values.push(value);
                }
                instances.push(Block::from_values(block_template.clone(), values));
            }
            blocks.push(instances);
        }

        if reader.has_remaining() {
            debug!(
                "{} has {} unread body bytes; the peer's template may be newer",
                template.name,
                reader.remaining()
            );
        }

        Ok(Message::from_blocks(template.clone(), blocks))
    }
}

fn encode_block(message: &Message, block: &Block, buf: &mut BytesMut) -> CodecResult<()> {
    for (field_template, (name, value)) in block.template().fields.iter().zip(block.fields()) {
        let value = value.ok_or_else(|| CodecError::IncompleteMessage {
            message: message.name().to_string(),
            reason: format!("field '{}.{}' is not set", block.name(), name),
        })?;
        field_codec::encode(value, field_template.field_type, buf).map_err(|e| match e {
            CodecError::MalformedField { reason, .. } => CodecError::MalformedField {
                field: format!("{}.{}.{}", message.name(), block.name(), name),
                reason,
            },
            other => other,
        })?;
    }
    Ok(())
}

/// Split `[body][count][acks][count]` into the body and the ack list
fn split_appended_acks(data: &[u8]) -> CodecResult<(&[u8], Vec<u32>)> {
    let malformed = |reason: String| CodecError::MalformedField { field: "appended acks".to_string(), reason };

    let trailing = *data.last().ok_or_else(|| malformed("flag set but packet has no ack block".to_string()))? as usize;
    let ack_block = 1 + 4 * trailing + 1;
    if data.len() < ack_block {
        return Err(malformed(format!("{} acks need {} bytes, only {} present", trailing, ack_block, data.len())));
    }

    let start = data.len() - ack_block;
    let leading = data[start] as usize;
    if leading != trailing {
        return Err(malformed(format!("leading count {} does not match trailing count {}", leading, trailing)));
    }

    let mut reader = PacketBuffer::new(&data[start + 1..data.len() - 1]);
    let mut acks = Vec::with_capacity(trailing);
    for _ in 0..trailing {
        acks.push(reader.get_u32_le()?);
    }
    Ok((&data[..start], acks))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::networking::packets::{builders, FieldValue};
    use template_registry::Frequency;
    use uuid::Uuid;

    fn codec() -> PacketCodec {
        PacketCodec::new(Schema::builtin().unwrap())
    }

    #[test]
    fn test_header_layout() {
        let codec = codec();
        let message = builders::complete_ping_check(codec.schema(), 9).unwrap();
        let bytes = codec.encode(&Packet::new(message, 0x01020304, true)).unwrap();
        // flags, LE sequence, no extra header, High 2, PingID
        assert_eq!(&bytes[..], &[0x01, 0x04, 0x03, 0x02, 0x01, 0x00, 0x02, 0x09]);
    }

    #[test]
    fn test_appended_acks_round_trip() {
        let codec = codec();
        let message = builders::complete_ping_check(codec.schema(), 1).unwrap();
        let packet = Packet::new(message, 5, false).with_acks(vec![100, 0xDEADBEEF]);
        let bytes = codec.encode(&packet).unwrap();
        assert_eq!(bytes[bytes.len() - 1], 2);
        assert_eq!(bytes[bytes.len() - 10], 2);

        let decoded = codec.decode(&bytes).unwrap();
        assert!(decoded.header.flags.contains(PacketFlags::ACKS_APPENDED));
        assert_eq!(decoded.acks, vec![100, 0xDEADBEEF]);
        assert_eq!(decoded.message, packet.message);
    }

    #[test]
    fn test_too_many_acks() {
        let codec = codec();
        let message = codec.schema().message("CloseCircuit").unwrap();
        let packet = Packet::new(message, 1, false).with_acks((0..256).collect());
        assert_eq!(codec.encode(&packet), Err(CodecError::TooManyAcks { count: 256 }));
    }

    #[test]
    fn test_zerocoding_only_when_smaller() {
        let codec = codec();
        let schema = codec.schema();

        // unencoded templates are never zerocoded, however many zeros they carry
        let mut logout = schema.message("LogoutRequest").unwrap();
        logout
            .append("AgentData", [("AgentID", FieldValue::Uuid(Uuid::nil())), ("SessionID", FieldValue::Uuid(Uuid::nil()))])
            .unwrap();
        let plain = codec.encode(&Packet::new(logout, 1, true)).unwrap();
        assert!(!PacketFlags::from_bits_truncate(plain[0]).contains(PacketFlags::ZEROCODED));

        let mut throttle = schema.message("AgentThrottle").unwrap();
        throttle
            .append(
                "AgentData",
                [
                    ("AgentID", FieldValue::Uuid(Uuid::nil())),
                    ("SessionID", FieldValue::Uuid(Uuid::nil())),
                    ("CircuitCode", FieldValue::U32(7)),
                ],
            )
            .unwrap();
        throttle
            .append("Throttle", [("GenCounter", FieldValue::U32(0)), ("Throttles", FieldValue::Variable(vec![0; 28]))])
            .unwrap();
        // mostly zero UUIDs shrink
        let bytes = codec.encode(&Packet::new(throttle.clone(), 2, true)).unwrap();
        assert!(PacketFlags::from_bits_truncate(bytes[0]).contains(PacketFlags::ZEROCODED));
        assert!(bytes.len() < HEADER_LEN + 4 + 36 + 4 + 1 + 28);
        assert_eq!(codec.decode(&bytes).unwrap().message, throttle);
    }

    #[test]
    fn test_zerocoded_body_with_acks() {
        let codec = codec();
        let schema = codec.schema();
        let mut test = schema.message("TestMessage").unwrap();
        test.append("TestBlock1", [("Test1", FieldValue::U32(0))]).unwrap();
        for i in 0..4u32 {
            test.append(
                "NeighborBlock",
                [("Test0", FieldValue::U32(0)), ("Test1", FieldValue::U32(i)), ("Test2", FieldValue::U32(0))],
            )
            .unwrap();
        }
        let packet = Packet::new(test, 77, true).with_acks(vec![0, 1]);
        let bytes = codec.encode(&packet).unwrap();
        let decoded = codec.decode(&bytes).unwrap();
        assert!(decoded.header.flags.contains(PacketFlags::ZEROCODED));
        assert_eq!(decoded.acks, vec![0, 1]);
        assert_eq!(decoded.message, packet.message);
    }

    #[test]
    fn test_unknown_message_leaves_codec_usable() {
        let codec = codec();
        let bogus = [0x00, 1, 0, 0, 0, 0, 0xFF, 0xFF, 0x7F, 0x00];
        let err = codec.decode(&bogus).unwrap_err();
        assert!(matches!(err, CodecError::UnknownMessage { .. }));

        let envelope = PacketCodec::read_envelope(&bogus).unwrap();
        assert_eq!(envelope.number, MessageNumber { frequency: Frequency::Low, id: 0x7F00 });

        let good = codec.encode(&Packet::new(builders::close_circuit(codec.schema()).unwrap(), 2, false)).unwrap();
        assert_eq!(codec.decode(&good).unwrap().message.name(), "CloseCircuit");
    }

    #[test]
    fn test_truncated_inputs() {
        let codec = codec();
        assert!(matches!(codec.decode(&[0x01, 0, 0]), Err(CodecError::Truncated { .. })));
        // extra header longer than the packet
        assert!(matches!(codec.decode(&[0x00, 1, 0, 0, 0, 9, 1]), Err(CodecError::Truncated { .. })));
        // StartPingCheck missing OldestUnacked
        assert!(matches!(codec.decode(&[0x00, 1, 0, 0, 0, 0, 0x01, 0x05]), Err(CodecError::MalformedField { .. })));
        // ack flag with a count that overruns the packet
        assert!(matches!(codec.decode(&[0x04, 1, 0, 0, 0, 0, 0x02, 0x05, 9]), Err(CodecError::MalformedField { .. })));
    }

    #[test]
    fn test_missing_variable_count_is_empty() {
        let codec = codec();
        let bytes = [0x00, 1, 0, 0, 0, 0, 0xFF, 0xFF, 0xFF, 0xFB];
        let packet = codec.decode(&bytes).unwrap();
        assert!(packet.message.blocks("Packets").unwrap().is_empty());
    }

    #[test]
    fn test_mark_resent() {
        let bytes = mark_resent(&[0x01, 0, 0, 0, 0, 0]);
        assert_eq!(bytes[0], 0x03);
    }
}
