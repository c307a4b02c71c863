//! Builders and readers for the four xfer messages

use super::types::XferRequest;
use crate::networking::packets::{FieldValue, Message};
use crate::networking::serialization::template_registry::Schema;
use crate::networking::serialization::CodecResult;
use bytes::Bytes;

pub fn request_xfer(schema: &Schema, id: u64, request: &XferRequest) -> CodecResult<Message> {
    let mut message = schema.message("RequestXfer")?;
    message.append(
        "XferID",
        [
            ("ID", FieldValue::U64(id)),
            ("Filename", FieldValue::text(&request.filename)),
            ("FilePath", FieldValue::U8(request.path)),
            ("DeleteOnCompletion", FieldValue::Bool(request.delete_on_completion)),
            ("UseBigPackets", FieldValue::Bool(request.use_big_packets)),
            ("VFileID", FieldValue::Uuid(request.vfile_id)),
            ("VFileType", FieldValue::S16(request.vfile_type)),
        ],
    )?;
    Ok(message)
}

pub fn send_xfer_packet(schema: &Schema, id: u64, packet: u32, data: &[u8]) -> CodecResult<Message> {
    let mut message = schema.message("SendXferPacket")?;
    message.append("XferID", [("ID", FieldValue::U64(id)), ("Packet", FieldValue::U32(packet))])?;
    message.append("DataPacket", [("Data", FieldValue::Variable(data.to_vec()))])?;
    Ok(message)
}

pub fn confirm_xfer_packet(schema: &Schema, id: u64, packet: u32) -> CodecResult<Message> {
    let mut message = schema.message("ConfirmXferPacket")?;
    message.append("XferID", [("ID", FieldValue::U64(id)), ("Packet", FieldValue::U32(packet))])?;
    Ok(message)
}

pub fn abort_xfer(schema: &Schema, id: u64, result: i32) -> CodecResult<Message> {
    let mut message = schema.message("AbortXfer")?;
    message.append("XferID", [("ID", FieldValue::U64(id)), ("Result", FieldValue::S32(result))])?;
    Ok(message)
}

pub fn read_request(message: &Message) -> CodecResult<(u64, XferRequest)> {
    let block = message.block("XferID")?;
    let request = XferRequest {
        filename: block.get("Filename")?.as_string()?,
        path: block.get("FilePath")?.as_u8()?,
        delete_on_completion: block.get("DeleteOnCompletion")?.as_bool()?,
        use_big_packets: block.get("UseBigPackets")?.as_bool()?,
        vfile_id: block.get("VFileID")?.as_uuid()?,
        vfile_type: block.get("VFileType")?.as_s16()?,
    };
    Ok((block.get("ID")?.as_u64()?, request))
}

/// `(id, raw packet number, data)` of a `SendXferPacket`
pub fn read_packet(message: &Message) -> CodecResult<(u64, u32, Bytes)> {
    let id = message.get("XferID", "ID")?.as_u64()?;
    let packet = message.get("XferID", "Packet")?.as_u32()?;
    let data = Bytes::copy_from_slice(message.get("DataPacket", "Data")?.as_bytes()?);
    Ok((id, packet, data))
}

pub fn read_confirm(message: &Message) -> CodecResult<(u64, u32)> {
    Ok((message.get("XferID", "ID")?.as_u64()?, message.get("XferID", "Packet")?.as_u32()?))
}

pub fn read_abort(message: &Message) -> CodecResult<(u64, i32)> {
    Ok((message.get("XferID", "ID")?.as_u64()?, message.get("XferID", "Result")?.as_s32()?))
}
