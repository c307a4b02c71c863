//! Second Life message and block data model
//!
//! Every message, whatever its template, is an ordered list of blocks, and
//! every block an ordered list of field values. Both are bound to their schema
//! entry, so unknown names and mistyped values are rejected when they are set
//! instead of surfacing later as a malformed packet.

use crate::networking::serialization::template_registry::{BlockTemplate, MessageNumber, MessageTemplate, Occurrence};
use crate::networking::serialization::{CodecError, CodecResult};
use std::sync::Arc;

pub mod builders;
pub mod types;

pub use types::*;

/// One block instance: field values in template order
#[derive(Debug, Clone)]
pub struct Block {
    template: Arc<BlockTemplate>,
    values: Vec<Option<FieldValue>>,
}

impl Block {
    pub fn new(template: Arc<BlockTemplate>) -> Self {
        let values = vec![None; template.fields.len()];
        Self { template, values }
    }

    /// Block whose values were decoded straight off the wire
    pub(crate) fn from_values(template: Arc<BlockTemplate>, values: Vec<FieldValue>) -> Self {
        Self { template, values: values.into_iter().map(Some).collect() }
    }

    pub fn name(&self) -> &str {
        &self.template.name
    }

    pub fn template(&self) -> &Arc<BlockTemplate> {
        &self.template
    }

    /// Set a declared field. The value is checked against the field's wire type.
    pub fn set(&mut self, field: &str, value: impl Into<FieldValue>) -> CodecResult<()> {
        let index = self.template.field_index(field).ok_or_else(|| CodecError::UnknownField {
            block: self.template.name.clone(),
            field: field.to_string(),
        })?;
        let field_type = self.template.fields[index].field_type;
        let value = coerce(value.into(), field_type);

        if !value.matches(field_type) {
            let qualified = format!("{}.{}", self.template.name, field);
            return Err(match (&value, field_type) {
                (FieldValue::Fixed(data), FieldType::Fixed(_))
                | (FieldValue::Variable(data), FieldType::Variable1 | FieldType::Variable2) => {
                    CodecError::MalformedField {
                        field: qualified,
                        reason: format!("{} bytes do not fit {}", data.len(), field_type),
                    }
                }
                _ => CodecError::FieldTypeMismatch { field: qualified, expected: field_type, found: value.kind() },
            });
        }

        self.values[index] = Some(value);
        Ok(())
    }

    /// Builder form of [`Block::set`]
    pub fn with(mut self, field: &str, value: impl Into<FieldValue>) -> CodecResult<Self> {
        self.set(field, value)?;
        Ok(self)
    }

    pub fn get(&self, field: &str) -> CodecResult<&FieldValue> {
        let index = self.template.field_index(field).ok_or_else(|| CodecError::UnknownField {
            block: self.template.name.clone(),
            field: field.to_string(),
        })?;
        self.values[index].as_ref().ok_or_else(|| CodecError::IncompleteMessage {
            message: self.template.name.clone(),
            reason: format!("field '{}' is not set", field),
        })
    }

    /// Fields in wire order, with unset ones as `None`
    pub fn fields(&self) -> impl Iterator<Item = (&str, Option<&FieldValue>)> {
        self.template
            .fields
            .iter()
            .zip(self.values.iter())
            .map(|(template, value)| (template.name.as_str(), value.as_ref()))
    }

    pub fn is_complete(&self) -> bool {
        self.values.iter().all(Option::is_some)
    }

    fn first_unset(&self) -> Option<&str> {
        self.fields().find(|(_, value)| value.is_none()).map(|(name, _)| name)
    }
}

impl PartialEq for Block {
    fn eq(&self, other: &Self) -> bool {
        self.template.name == other.template.name && self.values == other.values
    }
}

/// Accept the natural Rust spelling for blob and port fields
fn coerce(value: FieldValue, field_type: FieldType) -> FieldValue {
    match (value, field_type) {
        (FieldValue::Variable(data), FieldType::Fixed(_)) => FieldValue::Fixed(data),
        (FieldValue::Fixed(data), FieldType::Variable1 | FieldType::Variable2) => FieldValue::Variable(data),
        (FieldValue::U16(port), FieldType::IpPort) => FieldValue::IpPort(port),
        (value, _) => value,
    }
}

/// A message: block instances grouped per template block, in schema order
#[derive(Debug, Clone)]
pub struct Message {
    template: Arc<MessageTemplate>,
    blocks: Vec<Vec<Block>>,
}

impl Message {
    pub fn new(template: Arc<MessageTemplate>) -> Self {
        let blocks = vec![Vec::new(); template.blocks.len()];
        Self { template, blocks }
    }

    pub(crate) fn from_blocks(template: Arc<MessageTemplate>, blocks: Vec<Vec<Block>>) -> Self {
        Self { template, blocks }
    }

    pub fn template(&self) -> &Arc<MessageTemplate> {
        &self.template
    }

    pub fn name(&self) -> &str {
        &self.template.name
    }

    pub fn number(&self) -> MessageNumber {
        self.template.number
    }

    /// Default reliability from the template
    pub fn reliable(&self) -> bool {
        self.template.reliable
    }

    fn block_slot(&self, name: &str) -> CodecResult<usize> {
        self.template.block_index(name).ok_or_else(|| CodecError::UnknownBlock {
            message: self.template.name.clone(),
            block: name.to_string(),
        })
    }

    /// Empty block of the named template block
    pub fn new_block(&self, name: &str) -> CodecResult<Block> {
        let slot = self.block_slot(name)?;
        Ok(Block::new(self.template.blocks[slot].clone()))
    }

    /// Append a block instance. Blocks must arrive in schema order and within
    /// their cardinality.
    pub fn push(&mut self, block: Block) -> CodecResult<()> {
        let slot = self.block_slot(block.name())?;
        let template = &self.template.blocks[slot];
        if !Arc::ptr_eq(template, block.template()) && **template != **block.template() {
            return Err(self.order_error(block.name(), "block was built from a different template".to_string()));
        }
        if let Some(later) = self.blocks[slot + 1..].iter().flatten().next() {
            return Err(self.order_error(block.name(), format!("'{}' has already been appended", later.name())));
        }
        let max = template.occurrence.max_instances();
        if self.blocks[slot].len() >= max {
            return Err(self.order_error(block.name(), format!("at most {} instance(s) allowed", max)));
        }
        self.blocks[slot].push(block);
        Ok(())
    }

    fn order_error(&self, block: &str, reason: String) -> CodecError {
        CodecError::BlockOrder { message: self.template.name.clone(), block: block.to_string(), reason }
    }

    /// Builder form of [`Message::push`]
    pub fn with_block(mut self, block: Block) -> CodecResult<Self> {
        self.push(block)?;
        Ok(self)
    }

    /// Build and append a block from `(field, value)` pairs
    pub fn append<'a>(&mut self, name: &str, fields: impl IntoIterator<Item = (&'a str, FieldValue)>) -> CodecResult<()> {
        let mut block = self.new_block(name)?;
        for (field, value) in fields {
            block.set(field, value)?;
        }
        self.push(block)
    }

    /// All instances of the named block
    pub fn blocks(&self, name: &str) -> CodecResult<&[Block]> {
        let slot = self.block_slot(name)?;
        Ok(&self.blocks[slot])
    }

    /// First instance of the named block
    pub fn block(&self, name: &str) -> CodecResult<&Block> {
        self.blocks(name)?.first().ok_or_else(|| CodecError::IncompleteMessage {
            message: self.template.name.clone(),
            reason: format!("block '{}' is absent", name),
        })
    }

    /// Field of the first instance of a block
    pub fn get(&self, block: &str, field: &str) -> CodecResult<&FieldValue> {
        self.block(block)?.get(field)
    }

    pub(crate) fn slots(&self) -> impl Iterator<Item = (&Arc<BlockTemplate>, &[Block])> {
        self.template.blocks.iter().zip(self.blocks.iter().map(Vec::as_slice))
    }

    /// Check that the message can be encoded as-is
    pub fn validate(&self) -> CodecResult<()> {
        let mut optional_missing: Option<&str> = None;
        for (template, instances) in self.slots() {
            let incomplete = |reason: String| CodecError::IncompleteMessage { message: self.template.name.clone(), reason };
            match template.occurrence {
                Occurrence::Single if instances.len() != 1 => {
                    return Err(incomplete(format!("block '{}' is required", template.name)));
                }
                Occurrence::Multiple(n) if instances.len() != n as usize => {
                    return Err(incomplete(format!(
                        "block '{}' needs exactly {} instances, has {}",
                        template.name,
                        n,
                        instances.len()
                    )));
                }
                Occurrence::Optional => match (instances.is_empty(), optional_missing) {
                    (true, _) => optional_missing = Some(template.name.as_str()),
                    (false, Some(missing)) => {
                        return Err(incomplete(format!(
                            "optional block '{}' is present but earlier optional block '{}' is not",
                            template.name, missing
                        )));
                    }
                    (false, None) => {}
                },
                _ => {}
            }
            for block in instances {
                if let Some(field) = block.first_unset() {
                    return Err(incomplete(format!("field '{}.{}' is not set", template.name, field)));
                }
            }
        }
        Ok(())
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.template.name == other.template.name && self.blocks == other.blocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::networking::serialization::template_registry::Schema;
    use uuid::Uuid;

    fn schema() -> Arc<Schema> {
        Schema::builtin().unwrap()
    }

    #[test]
    fn test_build_and_read_back() {
        let schema = schema();
        let mut message = schema.message("ChatFromViewer").unwrap();
        let agent = Uuid::new_v4();
        message
            .append("AgentData", [("AgentID", FieldValue::from(agent)), ("SessionID", FieldValue::from(Uuid::nil()))])
            .unwrap();
        let chat = message
            .new_block("ChatData")
            .unwrap()
            .with("Message", FieldValue::text("hi"))
            .unwrap()
            .with("Type", 1u8)
            .unwrap()
            .with("Channel", 0i32)
            .unwrap();
        message.push(chat).unwrap();

        message.validate().unwrap();
        assert_eq!(message.get("AgentData", "AgentID").unwrap().as_uuid().unwrap(), agent);
        assert_eq!(message.get("ChatData", "Message").unwrap().as_string().unwrap(), "hi");
        let names: Vec<&str> = message.block("ChatData").unwrap().fields().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["Message", "Type", "Channel"]);
    }

    #[test]
    fn test_unknown_names_rejected() {
        let schema = schema();
        let message = schema.message("LogoutRequest").unwrap();
        assert!(matches!(message.new_block("Nope"), Err(CodecError::UnknownBlock { .. })));
        let mut block = message.new_block("AgentData").unwrap();
        assert!(matches!(block.set("Nope", 1u8), Err(CodecError::UnknownField { .. })));
        assert!(matches!(block.set("AgentID", 1u8), Err(CodecError::FieldTypeMismatch { .. })));
    }

    #[test]
    fn test_blob_coercion_and_limits() {
        let schema = schema();
        let message = schema.message("EnableSimulator").unwrap();
        let mut block = message.new_block("SimulatorInfo").unwrap();
        block.set("Port", 13005u16).unwrap();
        assert_eq!(block.get("Port").unwrap(), &FieldValue::IpPort(13005));

        let throttle = schema.message("AgentThrottle").unwrap();
        let mut block = throttle.new_block("Throttle").unwrap();
        assert!(matches!(block.set("Throttles", vec![0u8; 300]), Err(CodecError::MalformedField { .. })));
    }

    #[test]
    fn test_block_order_and_cardinality() {
        let schema = schema();
        let mut message = schema.message("ChatFromViewer").unwrap();
        let chat = message.new_block("ChatData").unwrap();
        message.push(chat).unwrap();
        let agent = message.new_block("AgentData").unwrap();
        assert!(matches!(message.push(agent), Err(CodecError::BlockOrder { .. })));

        let mut test = schema.message("TestMessage").unwrap();
        for _ in 0..4 {
            let block = test.new_block("NeighborBlock").unwrap();
            test.push(block).unwrap();
        }
        let extra = test.new_block("NeighborBlock").unwrap();
        assert!(matches!(test.push(extra), Err(CodecError::BlockOrder { .. })));
    }

    #[test]
    fn test_validate_reports_missing_pieces() {
        let schema = schema();
        let mut message = schema.message("LogoutRequest").unwrap();
        assert!(matches!(message.validate(), Err(CodecError::IncompleteMessage { .. })));

        let block = message.new_block("AgentData").unwrap().with("AgentID", Uuid::nil()).unwrap();
        message.push(block).unwrap();
        assert!(matches!(message.validate(), Err(CodecError::IncompleteMessage { .. })));

        let ack = schema.message("PacketAck").unwrap();
        ack.validate().unwrap();
        assert!(ack.blocks("Packets").unwrap().is_empty());
    }
}
