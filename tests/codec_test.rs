use slv_lludp::networking::packets::builders;
use slv_lludp::networking::serialization::field_codec;
use slv_lludp::networking::{
    CodecError, FieldType, FieldValue, Frequency, Message, Occurrence, Packet, PacketCodec, PacketFlags, Schema,
};
use std::net::Ipv4Addr;
use std::sync::Arc;
use uuid::Uuid;

const CUSTOM_TEMPLATE: &str = r#"
version 2.0
{
    RegionInfo Medium 7 Trusted Unencoded Reliable
    {
        RegionData Single
        {   Name        Variable 1  }
        {   Handle      U64 }
        {   Sun         LLVector3d  }
    }
    {
        Neighbors Variable
        {   IP      IPADDR  }
        {   Port    IPPORT  }
    }
    {
        Extra Optional
        {   Flags   U32 }
    }
    {
        Extra2 Optional
        {   Blob    Fixed 4 }
    }
}
"#;

fn round_trip(codec: &PacketCodec, message: Message, reliable: bool) -> Message {
    let bytes = codec.encode(&Packet::new(message, 11, reliable)).unwrap();
    let packet = codec.decode(&bytes).unwrap();
    assert_eq!(packet.header.sequence, 11);
    assert_eq!(packet.header.is_reliable(), reliable);
    packet.message
}

fn region_info(schema: &Schema, neighbors: u16, extra: bool, extra2: bool) -> Message {
    let mut message = schema.message("RegionInfo").unwrap();
    message
        .append(
            "RegionData",
            [
                ("Name", FieldValue::text("Ahern")),
                ("Handle", FieldValue::U64(0x0003_E800_0003_E800)),
                ("Sun", FieldValue::Vector3d([0.5, -0.25, 1.0])),
            ],
        )
        .unwrap();
    for i in 0..neighbors {
        message
            .append("Neighbors", [("IP", FieldValue::IpAddr(Ipv4Addr::new(10, 0, 0, i as u8))), ("Port", FieldValue::IpPort(13000 + i))])
            .unwrap();
    }
    if extra {
        message.append("Extra", [("Flags", FieldValue::U32(0x10))]).unwrap();
    }
    if extra2 {
        message.append("Extra2", [("Blob", FieldValue::Fixed(vec![1, 2, 3, 4]))]).unwrap();
    }
    message
}

#[test]
fn test_custom_schema_round_trips_every_cardinality() {
    let schema = Arc::new(Schema::parse(CUSTOM_TEMPLATE).unwrap());
    let codec = PacketCodec::new(schema.clone());

    let template = schema.lookup_by_name("RegionInfo").unwrap();
    assert_eq!(template.number.frequency, Frequency::Medium);
    assert!(template.reliable, "Reliable flag overrides the Medium default");
    assert_eq!(template.blocks[1].occurrence, Occurrence::Variable);

    for neighbors in [0, 1, 5] {
        for (extra, extra2) in [(false, false), (true, false), (true, true)] {
            let message = region_info(&schema, neighbors, extra, extra2);
            assert_eq!(round_trip(&codec, message.clone(), true), message);
        }
    }
}

#[test]
fn test_second_optional_without_first_is_rejected() {
    let schema = Arc::new(Schema::parse(CUSTOM_TEMPLATE).unwrap());
    let codec = PacketCodec::new(schema.clone());
    let message = region_info(&schema, 1, false, true);
    assert!(codec.encode(&Packet::new(message, 1, false)).is_err());
}

#[test]
fn test_builtin_messages_round_trip() {
    let schema = Schema::builtin().unwrap();
    let codec = PacketCodec::new(schema.clone());

    for ids in [vec![], vec![5], vec![1, 2, 3, 0xFFFF_FFFF]] {
        let ack = builders::packet_ack(&schema, &ids).unwrap();
        let decoded = round_trip(&codec, ack, false);
        assert_eq!(builders::acked_ids(&decoded).unwrap(), ids);
    }

    let agent = Uuid::new_v4();
    let session = Uuid::new_v4();
    let use_code = builders::use_circuit_code(&schema, 0xABCD, session, agent).unwrap();
    assert_eq!(round_trip(&codec, use_code.clone(), true), use_code);

    let mut enable = schema.message("EnableSimulator").unwrap();
    enable
        .append(
            "SimulatorInfo",
            [
                ("Handle", FieldValue::U64(1)),
                ("IP", FieldValue::from(Ipv4Addr::new(192, 168, 1, 20))),
                ("Port", FieldValue::IpPort(12035)),
            ],
        )
        .unwrap();
    let decoded = round_trip(&codec, enable, true);
    assert_eq!(decoded.get("SimulatorInfo", "IP").unwrap().as_ip_addr().unwrap(), Ipv4Addr::new(192, 168, 1, 20));
    assert_eq!(decoded.get("SimulatorInfo", "Port").unwrap().as_ip_port().unwrap(), 12035);
}

#[test]
fn test_message_number_bytes_follow_header() {
    let schema = Schema::builtin().unwrap();
    let codec = PacketCodec::new(schema.clone());
    let header_len = 6;

    let ping = builders::start_ping_check(&schema, 1, 0).unwrap();
    let bytes = codec.encode(&Packet::new(ping, 1, false)).unwrap();
    assert_eq!(bytes[header_len], 1);

    let close = builders::close_circuit(&schema).unwrap();
    let bytes = codec.encode(&Packet::new(close, 1, false)).unwrap();
    assert_eq!(&bytes[header_len..header_len + 4], &[0xFF, 0xFF, 0xFF, 0xFD]);

    let use_code = builders::use_circuit_code(&schema, 1, Uuid::nil(), Uuid::nil()).unwrap();
    let bytes = codec.encode(&Packet::new(use_code, 1, true)).unwrap();
    assert_eq!(&bytes[header_len..header_len + 4], &[0xFF, 0xFF, 0x00, 0x03]);
}

#[test]
fn test_zerocoded_message_on_the_wire() {
    let schema = Schema::builtin().unwrap();
    let codec = PacketCodec::new(schema.clone());

    // mostly zeros: the nil ids and zero vectors collapse
    let mut update = schema.message("AgentUpdate").unwrap();
    update
        .append(
            "AgentData",
            [
                ("AgentID", FieldValue::Uuid(Uuid::nil())),
                ("SessionID", FieldValue::Uuid(Uuid::nil())),
                ("BodyRotation", FieldValue::Quaternion([0.0, 0.0, 0.0, 1.0])),
                ("HeadRotation", FieldValue::Quaternion([0.0, 0.0, 0.0, 1.0])),
                ("State", FieldValue::U8(0)),
                ("CameraCenter", FieldValue::Vector3([128.0, 128.0, 25.0])),
                ("CameraAtAxis", FieldValue::Vector3([1.0, 0.0, 0.0])),
                ("CameraLeftAxis", FieldValue::Vector3([0.0, 1.0, 0.0])),
                ("CameraUpAxis", FieldValue::Vector3([0.0, 0.0, 1.0])),
                ("Far", FieldValue::F32(64.0)),
                ("ControlFlags", FieldValue::U32(0)),
                ("Flags", FieldValue::U8(0)),
            ],
        )
        .unwrap();

    let bytes = codec.encode(&Packet::new(update, 3, false)).unwrap();
    assert!(PacketFlags::from_bits_truncate(bytes[0]).contains(PacketFlags::ZEROCODED));

    let decoded = codec.decode(&bytes).unwrap().message;
    assert_eq!(decoded.name(), "AgentUpdate");
    assert_eq!(decoded.get("AgentData", "CameraCenter").unwrap().as_vector3().unwrap(), [128.0, 128.0, 25.0]);
    let rotation = decoded.get("AgentData", "BodyRotation").unwrap().as_quaternion().unwrap();
    assert!((rotation[3] - 1.0).abs() < 1e-6);
}

#[test]
fn test_garbage_never_panics() {
    let schema = Schema::builtin().unwrap();
    let codec = PacketCodec::new(schema.clone());
    let valid = codec
        .encode(&Packet::new(builders::start_ping_check(&schema, 9, 4).unwrap(), 2, true).with_acks(vec![1, 2]))
        .unwrap();

    // every prefix and every single-byte corruption either decodes or errors
    for len in 0..valid.len() {
        let _ = codec.decode(&valid[..len]);
    }
    for i in 0..valid.len() {
        let mut corrupted = valid.to_vec();
        corrupted[i] ^= 0xFF;
        let _ = codec.decode(&corrupted);
    }
    assert!(codec.decode(&valid).is_ok());
}

#[test]
fn test_field_codec_offsets() {
    let mut buffer = field_codec::encode_to_vec(&FieldValue::U16(0x0102), FieldType::U16).unwrap();
    buffer.extend(field_codec::encode_to_vec(&FieldValue::text("hi"), FieldType::Variable1).unwrap());

    assert_eq!(field_codec::decode(&buffer, 0, FieldType::U16).unwrap(), (FieldValue::U16(0x0102), 2));
    assert_eq!(
        field_codec::decode(&buffer, 2, FieldType::Variable1).unwrap(),
        (FieldValue::Variable(b"hi\0".to_vec()), 6)
    );
    assert!(matches!(
        field_codec::decode(&buffer, 5, FieldType::U32),
        Err(CodecError::MalformedField { .. })
    ));
}
