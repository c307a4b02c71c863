//! Message template schema
//!
//! The schema maps message names and wire message numbers to their block and
//! field layouts. It is parsed once and shared read-only behind an `Arc`.

use super::packet_buffer::PacketBuffer;
use super::template_parser;
use super::{CodecError, CodecResult};
use crate::networking::packets::{FieldType, Message};
use bytes::{BufMut, BytesMut};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};

/// Template shipped with the crate: circuit control, ping, xfer, session
/// setup and a handful of agent/region messages.
const BUILTIN_TEMPLATE: &str = include_str!("../../../templates/message_template.msg");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Frequency {
    High,
    Medium,
    Low,
    Fixed,
}

impl FromStr for Frequency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "High" => Ok(Frequency::High),
            "Medium" => Ok(Frequency::Medium),
            "Low" => Ok(Frequency::Low),
            "Fixed" => Ok(Frequency::Fixed),
            _ => Err(format!("Unknown frequency: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustLevel {
    NotTrusted,
    Trusted,
}

impl FromStr for TrustLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NotTrusted" => Ok(TrustLevel::NotTrusted),
            "Trusted" => Ok(TrustLevel::Trusted),
            _ => Err(format!("Unknown trust level: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Unencoded,
    Zerocoded,
}

impl FromStr for Encoding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Unencoded" => Ok(Encoding::Unencoded),
            "Zerocoded" => Ok(Encoding::Zerocoded),
            _ => Err(format!("Unknown encoding: {}", s)),
        }
    }
}

/// Wire identity of a message.
///
/// `id` is the number as written in the template: 1..=254 for High and Medium,
/// 1..=0xFEFF for Low, and the full `0xFFFFFFxx` value for Fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageNumber {
    pub frequency: Frequency,
    pub id: u32,
}

impl MessageNumber {
    pub fn new(frequency: Frequency, id: u32) -> CodecResult<Self> {
        let valid = match frequency {
            Frequency::High | Frequency::Medium => (1..0xFF).contains(&id),
            Frequency::Low => (1..0xFF00).contains(&id),
            Frequency::Fixed => id >= 0xFFFF_FF00,
        };
        if !valid {
            return Err(CodecError::Template {
                line: 0,
                reason: format!("message number {} out of range for {:?} frequency", id, frequency),
            });
        }
        Ok(Self { frequency, id })
    }

    pub fn encoded_len(&self) -> usize {
        match self.frequency {
            Frequency::High => 1,
            Frequency::Medium => 2,
            Frequency::Low | Frequency::Fixed => 4,
        }
    }

    /// Write the number with its `FF` sentinels leading
    pub fn write(&self, buf: &mut BytesMut) {
        match self.frequency {
            Frequency::High => buf.put_u8(self.id as u8),
            Frequency::Medium => {
                buf.put_u8(0xFF);
                buf.put_u8(self.id as u8);
            }
            Frequency::Low => {
                buf.put_u16(0xFFFF);
                buf.put_u16(self.id as u16);
            }
            Frequency::Fixed => buf.put_u32(self.id),
        }
    }

    /// Read a message number; its width follows from the leading sentinel bytes
    pub fn read(reader: &mut PacketBuffer<'_>) -> CodecResult<Self> {
        let first = reader.get_u8()?;
        if first != 0xFF {
            return Ok(Self { frequency: Frequency::High, id: first as u32 });
        }

        let second = reader.get_u8()?;
        if second != 0xFF {
            return Ok(Self { frequency: Frequency::Medium, id: second as u32 });
        }

        let third = reader.get_u8()?;
        let fourth = reader.get_u8()?;
        if third != 0xFF {
            let id = u16::from_be_bytes([third, fourth]) as u32;
            return Ok(Self { frequency: Frequency::Low, id });
        }

        Ok(Self { frequency: Frequency::Fixed, id: 0xFFFF_FF00 | fourth as u32 })
    }
}

impl fmt::Display for MessageNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.frequency {
            Frequency::Fixed => write!(f, "Fixed 0x{:08X}", self.id),
            other => write!(f, "{:?} {}", other, self.id),
        }
    }
}

/// How many instances of a block a message carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Occurrence {
    /// exactly one instance
    Single,
    /// zero or one instance; only valid as a trailing block
    Optional,
    /// exactly N instances, no count byte on the wire
    Multiple(u8),
    /// 1-byte count prefix followed by that many instances
    Variable,
}

impl Occurrence {
    pub fn max_instances(&self) -> usize {
        match self {
            Occurrence::Single | Occurrence::Optional => 1,
            Occurrence::Multiple(n) => *n as usize,
            Occurrence::Variable => u8::MAX as usize,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldTemplate {
    pub name: String,
    pub field_type: FieldType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlockTemplate {
    pub name: String,
    pub occurrence: Occurrence,
    pub fields: Vec<FieldTemplate>,
}

impl BlockTemplate {
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }
}

/// Layout and attributes of one message
#[derive(Debug, Clone, PartialEq)]
pub struct MessageTemplate {
    pub name: String,
    pub number: MessageNumber,
    pub trust: TrustLevel,
    pub encoding: Encoding,
    /// default reliability hint for senders that do not choose explicitly
    pub reliable: bool,
    /// trailing template flags such as `UDPDeprecated`
    pub flags: Vec<String>,
    pub blocks: Vec<Arc<BlockTemplate>>,
}

impl MessageTemplate {
    /// Build a template, deriving the reliability hint and checking block layout.
    ///
    /// Low frequency messages default to reliable. A `Reliable` or `Unreliable`
    /// flag overrides the default.
    pub fn new(
        name: &str,
        number: MessageNumber,
        trust: TrustLevel,
        encoding: Encoding,
        flags: Vec<String>,
        blocks: Vec<Arc<BlockTemplate>>,
    ) -> CodecResult<Self> {
        let reliable = if flags.iter().any(|f| f == "Reliable") {
            true
        } else if flags.iter().any(|f| f == "Unreliable") {
            false
        } else {
            number.frequency == Frequency::Low
        };

        let template = Self { name: name.to_string(), number, trust, encoding, reliable, flags, blocks };
        template.check_layout()?;
        Ok(template)
    }

    fn check_layout(&self) -> CodecResult<()> {
        let mut seen_optional = false;
        for (i, block) in self.blocks.iter().enumerate() {
            if self.blocks[..i].iter().any(|b| b.name == block.name) {
                return Err(self.layout_error(format!("duplicate block '{}'", block.name)));
            }
            match block.occurrence {
                Occurrence::Optional => seen_optional = true,
                _ if seen_optional => {
                    return Err(self.layout_error(format!(
                        "block '{}' follows an optional block; optional blocks must be trailing",
                        block.name
                    )))
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn layout_error(&self, reason: String) -> CodecError {
        CodecError::Template { line: 0, reason: format!("message '{}': {}", self.name, reason) }
    }

    pub fn block_index(&self, name: &str) -> Option<usize> {
        self.blocks.iter().position(|b| b.name == name)
    }

    pub fn is_zerocoded(&self) -> bool {
        self.encoding == Encoding::Zerocoded
    }

    pub fn is_trusted(&self) -> bool {
        self.trust == TrustLevel::Trusted
    }
}

/// Immutable lookup table of message templates
#[derive(Debug, Default)]
pub struct Schema {
    version: Option<String>,
    by_name: HashMap<String, Arc<MessageTemplate>>,
    by_number: HashMap<MessageNumber, Arc<MessageTemplate>>,
}

impl Schema {
    /// Parse a full template file
    pub fn parse(content: &str) -> CodecResult<Self> {
        let parsed = template_parser::parse(content)?;
        let mut schema = Self::from_templates(parsed.messages)?;
        schema.version = parsed.version;
        Ok(schema)
    }

    /// Index already-built templates, rejecting duplicate names or numbers
    pub fn from_templates(templates: impl IntoIterator<Item = MessageTemplate>) -> CodecResult<Self> {
        let mut schema = Self::default();
        for template in templates {
            let template = Arc::new(template);
            if schema.by_name.contains_key(&template.name) {
                return Err(CodecError::Template {
                    line: 0,
                    reason: format!("duplicate message name '{}'", template.name),
                });
            }
            if let Some(existing) = schema.by_number.get(&template.number) {
                return Err(CodecError::Template {
                    line: 0,
                    reason: format!(
                        "message number {} used by both '{}' and '{}'",
                        template.number, existing.name, template.name
                    ),
                });
            }
            schema.by_number.insert(template.number, template.clone());
            schema.by_name.insert(template.name.clone(), template);
        }
        Ok(schema)
    }

    /// The embedded template, parsed on first use
    pub fn builtin() -> CodecResult<Arc<Schema>> {
        static BUILTIN: OnceLock<CodecResult<Arc<Schema>>> = OnceLock::new();
        BUILTIN.get_or_init(|| Schema::parse(BUILTIN_TEMPLATE).map(Arc::new)).clone()
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    pub fn templates(&self) -> impl Iterator<Item = &Arc<MessageTemplate>> {
        self.by_name.values()
    }

    pub fn lookup_by_name(&self, name: &str) -> CodecResult<&Arc<MessageTemplate>> {
        self.by_name
            .get(name)
            .ok_or_else(|| CodecError::UnknownMessage { message: name.to_string() })
    }

    pub fn lookup_by_number(&self, number: MessageNumber) -> CodecResult<&Arc<MessageTemplate>> {
        self.by_number
            .get(&number)
            .ok_or_else(|| CodecError::UnknownMessage { message: number.to_string() })
    }

    /// Empty message for the named template, ready for blocks to be pushed
    pub fn message(&self, name: &str) -> CodecResult<Message> {
        Ok(Message::new(self.lookup_by_name(name)?.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn number_bytes(number: MessageNumber) -> Vec<u8> {
        let mut buf = BytesMut::new();
        number.write(&mut buf);
        buf.to_vec()
    }

    #[test]
    fn test_message_number_widths() {
        let high = MessageNumber::new(Frequency::High, 4).unwrap();
        let medium = MessageNumber::new(Frequency::Medium, 1).unwrap();
        let low = MessageNumber::new(Frequency::Low, 0x0102).unwrap();
        let fixed = MessageNumber::new(Frequency::Fixed, 0xFFFF_FFFB).unwrap();

        assert_eq!(number_bytes(high), vec![4]);
        assert_eq!(number_bytes(medium), vec![0xFF, 1]);
        assert_eq!(number_bytes(low), vec![0xFF, 0xFF, 0x01, 0x02]);
        assert_eq!(number_bytes(fixed), vec![0xFF, 0xFF, 0xFF, 0xFB]);

        for number in [high, medium, low, fixed] {
            let bytes = number_bytes(number);
            assert_eq!(bytes.len(), number.encoded_len());
            let mut reader = PacketBuffer::new(&bytes);
            assert_eq!(MessageNumber::read(&mut reader).unwrap(), number);
            assert!(!reader.has_remaining());
        }
    }

    #[test]
    fn test_message_number_ranges() {
        assert!(MessageNumber::new(Frequency::High, 255).is_err());
        assert!(MessageNumber::new(Frequency::Medium, 0).is_err());
        assert!(MessageNumber::new(Frequency::Low, 0xFF00).is_err());
        assert!(MessageNumber::new(Frequency::Fixed, 0xFB).is_err());
    }

    #[test]
    fn test_builtin_schema() {
        let schema = Schema::builtin().unwrap();
        let ack = schema.lookup_by_name("PacketAck").unwrap();
        assert_eq!(ack.number, MessageNumber { frequency: Frequency::Fixed, id: 0xFFFF_FFFB });
        assert!(!ack.reliable);

        let request = schema.lookup_by_name("RequestXfer").unwrap();
        assert!(request.reliable);
        assert_eq!(schema.lookup_by_number(request.number).unwrap().name, "RequestXfer");

        let update = schema.lookup_by_name("AgentUpdate").unwrap();
        assert!(!update.reliable);
        assert!(update.is_zerocoded());
    }

    #[test]
    fn test_unknown_lookups() {
        let schema = Schema::builtin().unwrap();
        assert!(matches!(schema.lookup_by_name("NoSuchMessage"), Err(CodecError::UnknownMessage { .. })));
        let number = MessageNumber { frequency: Frequency::High, id: 254 };
        assert!(matches!(schema.lookup_by_number(number), Err(CodecError::UnknownMessage { .. })));
    }

    #[test]
    fn test_reliability_flags_override() {
        let text = "{ A Low 1 NotTrusted Unencoded Unreliable }\n{ B High 1 NotTrusted Unencoded Reliable }\n";
        let schema = Schema::parse(text).unwrap();
        assert!(!schema.lookup_by_name("A").unwrap().reliable);
        assert!(schema.lookup_by_name("B").unwrap().reliable);
    }

    #[test]
    fn test_duplicates_rejected() {
        let names = "{ A Low 1 NotTrusted Unencoded }\n{ A Low 2 NotTrusted Unencoded }\n";
        assert!(matches!(Schema::parse(names), Err(CodecError::Template { .. })));
        let numbers = "{ A Low 1 NotTrusted Unencoded }\n{ B Low 1 NotTrusted Unencoded }\n";
        assert!(matches!(Schema::parse(numbers), Err(CodecError::Template { .. })));
    }

    #[test]
    fn test_optional_blocks_must_trail() {
        let text = "{ A Low 1 NotTrusted Unencoded { X Optional { F U8 } } { Y Single { G U8 } } }";
        assert!(matches!(Schema::parse(text), Err(CodecError::Template { .. })));
    }
}
