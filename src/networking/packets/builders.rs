//! Constructors for the circuit-control messages the circuit sends itself

use super::{FieldValue, Message};
use crate::networking::serialization::template_registry::Schema;
use crate::networking::serialization::CodecResult;
use uuid::Uuid;

/// `PacketAck` listing `ids`; callers keep the list within 255 entries
pub fn packet_ack(schema: &Schema, ids: &[u32]) -> CodecResult<Message> {
    let mut message = schema.message("PacketAck")?;
    for id in ids {
        message.append("Packets", [("ID", FieldValue::U32(*id))])?;
    }
    Ok(message)
}

pub fn start_ping_check(schema: &Schema, ping_id: u8, oldest_unacked: u32) -> CodecResult<Message> {
    let mut message = schema.message("StartPingCheck")?;
    message.append(
        "PingID",
        [("PingID", FieldValue::U8(ping_id)), ("OldestUnacked", FieldValue::U32(oldest_unacked))],
    )?;
    Ok(message)
}

pub fn complete_ping_check(schema: &Schema, ping_id: u8) -> CodecResult<Message> {
    let mut message = schema.message("CompletePingCheck")?;
    message.append("PingID", [("PingID", FieldValue::U8(ping_id))])?;
    Ok(message)
}

/// First packet on a new circuit, binding it to a login session
pub fn use_circuit_code(schema: &Schema, code: u32, session_id: Uuid, agent_id: Uuid) -> CodecResult<Message> {
    let mut message = schema.message("UseCircuitCode")?;
    message.append(
        "CircuitCode",
        [
            ("Code", FieldValue::U32(code)),
            ("SessionID", FieldValue::Uuid(session_id)),
            ("ID", FieldValue::Uuid(agent_id)),
        ],
    )?;
    Ok(message)
}

pub fn close_circuit(schema: &Schema) -> CodecResult<Message> {
    schema.message("CloseCircuit")
}

/// Ids carried by a `PacketAck`
pub fn acked_ids(message: &Message) -> CodecResult<Vec<u32>> {
    message
        .blocks("Packets")?
        .iter()
        .map(|block| block.get("ID").and_then(FieldValue::as_u32))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_ack_lists_ids() {
        let schema = Schema::builtin().unwrap();
        let ack = packet_ack(&schema, &[3, 1, 2]).unwrap();
        ack.validate().unwrap();
        assert_eq!(acked_ids(&ack).unwrap(), vec![3, 1, 2]);
    }

    #[test]
    fn test_circuit_messages_validate() {
        let schema = Schema::builtin().unwrap();
        use_circuit_code(&schema, 42, Uuid::new_v4(), Uuid::new_v4()).unwrap().validate().unwrap();
        start_ping_check(&schema, 7, 0).unwrap().validate().unwrap();
        complete_ping_check(&schema, 7).unwrap().validate().unwrap();
        close_circuit(&schema).unwrap().validate().unwrap();
    }
}
