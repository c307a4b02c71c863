//! Field-level encoding and decoding
//!
//! Pure conversions between a single `FieldValue` and its wire bytes for a
//! declared `FieldType`. Numerics are little-endian; IPADDR/IPPORT keep network
//! byte order.

use super::packet_buffer::PacketBuffer;
use super::{CodecError, CodecResult};
use crate::networking::packets::{FieldType, FieldValue};
use bytes::{BufMut, BytesMut};
use std::net::Ipv4Addr;
use uuid::Uuid;

fn malformed(field_type: FieldType, reason: impl Into<String>) -> CodecError {
    CodecError::MalformedField { field: field_type.to_string(), reason: reason.into() }
}

/// Append the wire form of `value` to `buf`.
///
/// Fails with `FieldTypeMismatch` when the value variant does not belong to the
/// type, and with `MalformedField` when blob data does not fit the declared size.
pub fn encode(value: &FieldValue, field_type: FieldType, buf: &mut BytesMut) -> CodecResult<()> {
    match (value, field_type) {
        (FieldValue::U8(v), FieldType::U8) => buf.put_u8(*v),
        (FieldValue::U16(v), FieldType::U16) => buf.put_u16_le(*v),
        (FieldValue::U32(v), FieldType::U32) => buf.put_u32_le(*v),
        (FieldValue::U64(v), FieldType::U64) => buf.put_u64_le(*v),
        (FieldValue::S8(v), FieldType::S8) => buf.put_i8(*v),
        (FieldValue::S16(v), FieldType::S16) => buf.put_i16_le(*v),
        (FieldValue::S32(v), FieldType::S32) => buf.put_i32_le(*v),
        (FieldValue::S64(v), FieldType::S64) => buf.put_i64_le(*v),
        (FieldValue::F32(v), FieldType::F32) => buf.put_f32_le(*v),
        (FieldValue::F64(v), FieldType::F64) => buf.put_f64_le(*v),
        (FieldValue::Uuid(v), FieldType::Uuid) => buf.put_slice(v.as_bytes()),
        (FieldValue::Bool(v), FieldType::Bool) => buf.put_u8(u8::from(*v)),
        (FieldValue::IpAddr(v), FieldType::IpAddr) => buf.put_slice(&v.octets()),
        (FieldValue::IpPort(v), FieldType::IpPort) => buf.put_u16(*v),
        (FieldValue::Vector3(v), FieldType::Vector3) => v.iter().for_each(|c| buf.put_f32_le(*c)),
        (FieldValue::Vector3d(v), FieldType::Vector3d) => v.iter().for_each(|c| buf.put_f64_le(*c)),
        (FieldValue::Vector4(v), FieldType::Vector4) => v.iter().for_each(|c| buf.put_f32_le(*c)),
        (FieldValue::Quaternion(q), FieldType::Quaternion) => {
            let [x, y, z, _] = pack_quaternion(*q);
            buf.put_f32_le(x);
            buf.put_f32_le(y);
            buf.put_f32_le(z);
        }
        (FieldValue::Fixed(data), FieldType::Fixed(len)) => {
            if data.len() != len {
                return Err(malformed(field_type, format!("expected {} bytes, got {}", len, data.len())));
            }
            buf.put_slice(data);
        }
        (FieldValue::Variable(data), FieldType::Variable1) => {
            let len = u8::try_from(data.len())
                .map_err(|_| malformed(field_type, format!("{} bytes exceed the 1 byte length prefix", data.len())))?;
            buf.put_u8(len);
            buf.put_slice(data);
        }
        (FieldValue::Variable(data), FieldType::Variable2) => {
            let len = u16::try_from(data.len())
                .map_err(|_| malformed(field_type, format!("{} bytes exceed the 2 byte length prefix", data.len())))?;
            buf.put_u16_le(len);
            buf.put_slice(data);
        }
        (other, expected) => {
            return Err(CodecError::FieldTypeMismatch {
                field: expected.to_string(),
                expected,
                found: other.kind(),
            })
        }
    }
    Ok(())
}

/// Encode a single value into a fresh buffer
pub fn encode_to_vec(value: &FieldValue, field_type: FieldType) -> CodecResult<Vec<u8>> {
    let mut buf = BytesMut::new();
    encode(value, field_type, &mut buf)?;
    Ok(buf.to_vec())
}

/// Decode one field starting at `offset`, returning the value and the offset past it
pub fn decode(data: &[u8], offset: usize, field_type: FieldType) -> CodecResult<(FieldValue, usize)> {
    let tail = data
        .get(offset..)
        .ok_or_else(|| malformed(field_type, format!("offset {} is past the end of a {} byte buffer", offset, data.len())))?;
    let mut reader = PacketBuffer::new(tail);
    let value = read(&mut reader, field_type)?;
    Ok((value, offset + reader.position()))
}

/// Read one field from a cursor; truncation is reported as `MalformedField`
pub fn read(reader: &mut PacketBuffer<'_>, field_type: FieldType) -> CodecResult<FieldValue> {
    read_inner(reader, field_type).map_err(|e| match e {
        CodecError::Truncated { needed, remaining } => {
            malformed(field_type, format!("needs {} bytes, {} remain", needed, remaining))
        }
        other => other,
    })
}

fn read_inner(reader: &mut PacketBuffer<'_>, field_type: FieldType) -> CodecResult<FieldValue> {
    let value = match field_type {
        FieldType::U8 => FieldValue::U8(reader.get_u8()?),
        FieldType::U16 => FieldValue::U16(reader.get_u16_le()?),
        FieldType::U32 => FieldValue::U32(reader.get_u32_le()?),
        FieldType::U64 => FieldValue::U64(reader.get_u64_le()?),
        FieldType::S8 => FieldValue::S8(reader.get_u8()? as i8),
        FieldType::S16 => FieldValue::S16(reader.get_u16_le()? as i16),
        FieldType::S32 => FieldValue::S32(reader.get_u32_le()? as i32),
        FieldType::S64 => FieldValue::S64(reader.get_u64_le()? as i64),
        FieldType::F32 => FieldValue::F32(reader.get_f32_le()?),
        FieldType::F64 => FieldValue::F64(reader.get_f64_le()?),
        FieldType::Uuid => {
            let bytes = reader.take(16)?;
            let uuid = Uuid::from_slice(bytes).map_err(|e| malformed(field_type, e.to_string()))?;
            FieldValue::Uuid(uuid)
        }
        FieldType::Bool => FieldValue::Bool(reader.get_u8()? != 0),
        FieldType::IpAddr => {
            let octets = reader.take(4)?;
            FieldValue::IpAddr(Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]))
        }
        FieldType::IpPort => FieldValue::IpPort(reader.get_u16_be()?),
        FieldType::Vector3 => FieldValue::Vector3(read_f32s(reader)?),
        FieldType::Vector3d => {
            let x = reader.get_f64_le()?;
            let y = reader.get_f64_le()?;
            let z = reader.get_f64_le()?;
            FieldValue::Vector3d([x, y, z])
        }
        FieldType::Vector4 => FieldValue::Vector4(read_f32s(reader)?),
        FieldType::Quaternion => {
            let [x, y, z] = read_f32s(reader)?;
            FieldValue::Quaternion(unpack_quaternion(x, y, z))
        }
        FieldType::Fixed(len) => FieldValue::Fixed(reader.get_bytes(len)?),
        FieldType::Variable1 => {
            let len = reader.get_u8()? as usize;
            FieldValue::Variable(reader.get_bytes(len)?)
        }
        FieldType::Variable2 => {
            let len = reader.get_u16_le()? as usize;
            FieldValue::Variable(reader.get_bytes(len)?)
        }
    };
    Ok(value)
}

fn read_f32s<const N: usize>(reader: &mut PacketBuffer<'_>) -> CodecResult<[f32; N]> {
    // size check up front so a short vector never consumes a partial component
    if reader.remaining() < N * 4 {
        return Err(CodecError::Truncated { needed: N * 4, remaining: reader.remaining() });
    }
    let mut out = [0f32; N];
    for component in out.iter_mut() {
        *component = reader.get_f32_le()?;
    }
    Ok(out)
}

/// Normalise and flip into the `w >= 0` hemisphere so `w` can be rebuilt
fn pack_quaternion(q: [f32; 4]) -> [f32; 4] {
    let norm = q.iter().map(|c| c * c).sum::<f32>().sqrt();
    if norm <= f32::EPSILON || !norm.is_finite() {
        return [0.0, 0.0, 0.0, 1.0];
    }
    let sign = if q[3] < 0.0 { -1.0 } else { 1.0 };
    q.map(|c| sign * c / norm)
}

fn unpack_quaternion(x: f32, y: f32, z: f32) -> [f32; 4] {
    let w = (1.0 - x * x - y * y - z * z).max(0.0).sqrt();
    [x, y, z, w]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(value: FieldValue, field_type: FieldType) -> (FieldValue, usize) {
        let bytes = encode_to_vec(&value, field_type).unwrap();
        decode(&bytes, 0, field_type).unwrap()
    }

    #[test]
    fn test_fixed_width_types_consume_declared_size() {
        let samples = [
            (FieldValue::U8(0xAB), FieldType::U8),
            (FieldValue::U16(0xBEEF), FieldType::U16),
            (FieldValue::U32(0xDEADBEEF), FieldType::U32),
            (FieldValue::U64(u64::MAX - 1), FieldType::U64),
            (FieldValue::S8(-5), FieldType::S8),
            (FieldValue::S16(-1234), FieldType::S16),
            (FieldValue::S32(i32::MIN), FieldType::S32),
            (FieldValue::S64(-42), FieldType::S64),
            (FieldValue::F32(1.5), FieldType::F32),
            (FieldValue::F64(-2.25), FieldType::F64),
            (FieldValue::Uuid(Uuid::from_u128(0x0011_2233_4455_6677_8899_aabb_ccdd_eeff)), FieldType::Uuid),
            (FieldValue::Bool(true), FieldType::Bool),
            (FieldValue::IpAddr(Ipv4Addr::new(192, 168, 1, 20)), FieldType::IpAddr),
            (FieldValue::IpPort(13000), FieldType::IpPort),
            (FieldValue::Vector3([1.0, -2.0, 3.5]), FieldType::Vector3),
            (FieldValue::Vector3d([256000.5, 1.0, -7.0]), FieldType::Vector3d),
            (FieldValue::Vector4([0.1, 0.2, 0.3, 0.4]), FieldType::Vector4),
            (FieldValue::Fixed(vec![9, 8, 7, 6]), FieldType::Fixed(4)),
        ];
        for (value, field_type) in samples {
            let size = field_type.fixed_size().unwrap();
            assert_eq!(round_trip(value.clone(), field_type), (value, size), "{}", field_type);
        }
    }

    #[test]
    fn test_little_endian_layout() {
        assert_eq!(encode_to_vec(&FieldValue::U32(0x01020304), FieldType::U32).unwrap(), vec![4, 3, 2, 1]);
        assert_eq!(encode_to_vec(&FieldValue::S16(-2), FieldType::S16).unwrap(), vec![0xFE, 0xFF]);
    }

    #[test]
    fn test_network_order_address_fields() {
        let addr = encode_to_vec(&FieldValue::IpAddr(Ipv4Addr::new(10, 0, 0, 1)), FieldType::IpAddr).unwrap();
        assert_eq!(addr, vec![10, 0, 0, 1]);
        let port = encode_to_vec(&FieldValue::IpPort(0x1F40), FieldType::IpPort).unwrap();
        assert_eq!(port, vec![0x1F, 0x40]);
    }

    #[test]
    fn test_variable_prefixes() {
        let data = FieldValue::Variable(b"hello".to_vec());
        let short = encode_to_vec(&data, FieldType::Variable1).unwrap();
        assert_eq!(short[0], 5);
        assert_eq!(round_trip(data.clone(), FieldType::Variable1), (data.clone(), 6));

        let long = encode_to_vec(&data, FieldType::Variable2).unwrap();
        assert_eq!(&long[..2], &[5, 0]);
        assert_eq!(round_trip(data.clone(), FieldType::Variable2), (data, 7));

        let empty = FieldValue::Variable(Vec::new());
        assert_eq!(round_trip(empty.clone(), FieldType::Variable1), (empty, 1));
    }

    #[test]
    fn test_oversized_blobs_are_rejected() {
        let big = FieldValue::Variable(vec![1; 256]);
        assert!(matches!(encode_to_vec(&big, FieldType::Variable1), Err(CodecError::MalformedField { .. })));
        assert!(encode_to_vec(&big, FieldType::Variable2).is_ok());

        let short = FieldValue::Fixed(vec![1; 3]);
        assert!(matches!(encode_to_vec(&short, FieldType::Fixed(4)), Err(CodecError::MalformedField { .. })));
    }

    #[test]
    fn test_type_mismatch() {
        let err = encode_to_vec(&FieldValue::U16(1), FieldType::U32).unwrap_err();
        assert!(matches!(err, CodecError::FieldTypeMismatch { expected: FieldType::U32, found: "U16", .. }));
    }

    #[test]
    fn test_quaternion_reconstructs_w() {
        let half = std::f32::consts::FRAC_1_SQRT_2;
        let (value, consumed) = round_trip(FieldValue::Quaternion([0.0, 0.0, half, half]), FieldType::Quaternion);
        assert_eq!(consumed, 12);
        let q = value.as_quaternion().unwrap();
        assert!((q[2] - half).abs() < 1e-6);
        assert!((q[3] - half).abs() < 1e-6);

        // negative w is flipped into the same rotation
        let (value, _) = round_trip(FieldValue::Quaternion([0.0, 0.6, 0.0, -0.8]), FieldType::Quaternion);
        let q = value.as_quaternion().unwrap();
        assert!((q[1] + 0.6).abs() < 1e-6);
        assert!((q[3] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_truncated_input_is_malformed() {
        assert!(matches!(decode(&[1, 2, 3], 0, FieldType::U32), Err(CodecError::MalformedField { .. })));
        assert!(matches!(decode(&[1, 2, 3, 4], 2, FieldType::U32), Err(CodecError::MalformedField { .. })));
        // declared length larger than the rest of the buffer
        assert!(matches!(decode(&[10, 1, 2], 0, FieldType::Variable1), Err(CodecError::MalformedField { .. })));
        assert!(matches!(decode(&[1], 5, FieldType::U8), Err(CodecError::MalformedField { .. })));
    }

    #[test]
    fn test_decode_at_offset() {
        let data = [0xFF, 0x02, 0x00, 0x03];
        let (value, next) = decode(&data, 1, FieldType::U16).unwrap();
        assert_eq!(value, FieldValue::U16(2));
        assert_eq!(next, 3);
        let (value, next) = decode(&data, next, FieldType::Bool).unwrap();
        assert_eq!(value, FieldValue::Bool(true));
        assert_eq!(next, 4);
    }
}
