//! Second Life protocol field types
//!
//! Every field in a message template carries one of these wire types. The
//! encoded size of each fixed type is constant; variable fields carry a one or
//! two byte length prefix whose width comes from the template, never the data.

use crate::networking::serialization::{CodecError, CodecResult};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use uuid::Uuid;

/// Wire type of a single template field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    U8,
    U16,
    U32,
    U64,
    S8,
    S16,
    S32,
    S64,
    F32,
    F64,
    /// 16 raw bytes
    Uuid,
    /// 1 byte, non-zero is true
    Bool,
    /// 4 address octets in network order
    IpAddr,
    /// big-endian port
    IpPort,
    Vector3,
    Vector3d,
    Vector4,
    /// x, y, z on the wire; w is rebuilt on decode
    Quaternion,
    /// opaque blob whose length is fixed by the template
    Fixed(usize),
    /// blob with a 1 byte length prefix
    Variable1,
    /// blob with a 2 byte length prefix
    Variable2,
}

impl FieldType {
    /// Encoded size for fixed-width types, `None` for variable fields
    pub fn fixed_size(&self) -> Option<usize> {
        let size = match self {
            FieldType::U8 | FieldType::S8 | FieldType::Bool => 1,
            FieldType::U16 | FieldType::S16 | FieldType::IpPort => 2,
            FieldType::U32 | FieldType::S32 | FieldType::F32 | FieldType::IpAddr => 4,
            FieldType::U64 | FieldType::S64 | FieldType::F64 => 8,
            FieldType::Uuid | FieldType::Vector4 => 16,
            FieldType::Vector3 | FieldType::Quaternion => 12,
            FieldType::Vector3d => 24,
            FieldType::Fixed(len) => *len,
            FieldType::Variable1 | FieldType::Variable2 => return None,
        };
        Some(size)
    }

    /// Largest payload a variable field can carry
    pub fn max_variable_len(&self) -> Option<usize> {
        match self {
            FieldType::Variable1 => Some(u8::MAX as usize),
            FieldType::Variable2 => Some(u16::MAX as usize),
            _ => None,
        }
    }

    /// Parse the template spelling of a type: a type keyword plus an optional size
    pub fn from_template(keyword: &str, size: Option<&str>) -> Result<Self, String> {
        let field_type = match (keyword, size) {
            ("U8", None) => FieldType::U8,
            ("U16", None) => FieldType::U16,
            ("U32", None) => FieldType::U32,
            ("U64", None) => FieldType::U64,
            ("S8", None) => FieldType::S8,
            ("S16", None) => FieldType::S16,
            ("S32", None) => FieldType::S32,
            ("S64", None) => FieldType::S64,
            ("F32", None) => FieldType::F32,
            ("F64", None) => FieldType::F64,
            ("LLUUID", None) => FieldType::Uuid,
            ("BOOL", None) => FieldType::Bool,
            ("IPADDR", None) => FieldType::IpAddr,
            ("IPPORT", None) => FieldType::IpPort,
            ("LLVector3", None) => FieldType::Vector3,
            ("LLVector3d", None) => FieldType::Vector3d,
            ("LLVector4", None) => FieldType::Vector4,
            ("LLQuaternion", None) => FieldType::Quaternion,
            ("Fixed", Some(len)) => {
                let len = len.parse::<usize>().map_err(|e| format!("invalid Fixed size '{}': {}", len, e))?;
                FieldType::Fixed(len)
            }
            ("Variable", Some("1")) => FieldType::Variable1,
            ("Variable", Some("2")) => FieldType::Variable2,
            ("Variable", Some(other)) => return Err(format!("invalid Variable prefix width '{}'", other)),
            ("Fixed", None) | ("Variable", None) => return Err(format!("{} requires a size", keyword)),
            (other, _) => return Err(format!("unknown field type '{}'", other)),
        };
        Ok(field_type)
    }

    /// Whether the type keyword takes a trailing size token in template text
    pub fn takes_size(keyword: &str) -> bool {
        matches!(keyword, "Fixed" | "Variable")
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::U8 => f.write_str("U8"),
            FieldType::U16 => f.write_str("U16"),
            FieldType::U32 => f.write_str("U32"),
            FieldType::U64 => f.write_str("U64"),
            FieldType::S8 => f.write_str("S8"),
            FieldType::S16 => f.write_str("S16"),
            FieldType::S32 => f.write_str("S32"),
            FieldType::S64 => f.write_str("S64"),
            FieldType::F32 => f.write_str("F32"),
            FieldType::F64 => f.write_str("F64"),
            FieldType::Uuid => f.write_str("LLUUID"),
            FieldType::Bool => f.write_str("BOOL"),
            FieldType::IpAddr => f.write_str("IPADDR"),
            FieldType::IpPort => f.write_str("IPPORT"),
            FieldType::Vector3 => f.write_str("LLVector3"),
            FieldType::Vector3d => f.write_str("LLVector3d"),
            FieldType::Vector4 => f.write_str("LLVector4"),
            FieldType::Quaternion => f.write_str("LLQuaternion"),
            FieldType::Fixed(len) => write!(f, "Fixed {}", len),
            FieldType::Variable1 => f.write_str("Variable 1"),
            FieldType::Variable2 => f.write_str("Variable 2"),
        }
    }
}

impl FromStr for FieldType {
    type Err = String;

    /// Accepts the spaced template spelling, e.g. `"Variable 2"` or `"LLUUID"`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split_whitespace();
        let keyword = parts.next().ok_or_else(|| "empty field type".to_string())?;
        let size = parts.next();
        if parts.next().is_some() {
            return Err(format!("trailing tokens in field type '{}'", s));
        }
        FieldType::from_template(keyword, size)
    }
}

/// A decoded or to-be-encoded field value
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    S8(i8),
    S16(i16),
    S32(i32),
    S64(i64),
    F32(f32),
    F64(f64),
    Uuid(Uuid),
    Bool(bool),
    IpAddr(Ipv4Addr),
    IpPort(u16),
    Vector3([f32; 3]),
    Vector3d([f64; 3]),
    Vector4([f32; 4]),
    /// x, y, z, w
    Quaternion([f32; 4]),
    Fixed(Vec<u8>),
    Variable(Vec<u8>),
}

macro_rules! copy_accessor {
    ($name:ident, $variant:ident, $ty:ty) => {
        pub fn $name(&self) -> CodecResult<$ty> {
            match self {
                FieldValue::$variant(v) => Ok(*v),
                other => Err(CodecError::ValueType {
                    expected: stringify!($variant),
                    found: other.kind(),
                }),
            }
        }
    };
}

impl FieldValue {
    /// Variable data holding `text` followed by the NUL terminator the grid expects
    pub fn text(text: &str) -> Self {
        let mut data = Vec::with_capacity(text.len() + 1);
        data.extend_from_slice(text.as_bytes());
        data.push(0);
        FieldValue::Variable(data)
    }

    /// Variant name, used in error reports
    pub fn kind(&self) -> &'static str {
        match self {
            FieldValue::U8(_) => "U8",
            FieldValue::U16(_) => "U16",
            FieldValue::U32(_) => "U32",
            FieldValue::U64(_) => "U64",
            FieldValue::S8(_) => "S8",
            FieldValue::S16(_) => "S16",
            FieldValue::S32(_) => "S32",
            FieldValue::S64(_) => "S64",
            FieldValue::F32(_) => "F32",
            FieldValue::F64(_) => "F64",
            FieldValue::Uuid(_) => "Uuid",
            FieldValue::Bool(_) => "Bool",
            FieldValue::IpAddr(_) => "IpAddr",
            FieldValue::IpPort(_) => "IpPort",
            FieldValue::Vector3(_) => "Vector3",
            FieldValue::Vector3d(_) => "Vector3d",
            FieldValue::Vector4(_) => "Vector4",
            FieldValue::Quaternion(_) => "Quaternion",
            FieldValue::Fixed(_) => "Fixed",
            FieldValue::Variable(_) => "Variable",
        }
    }

    /// Whether this value can be written as a field of `field_type`.
    ///
    /// Blob lengths are checked as well: a `Fixed` value must match the declared
    /// length exactly and a `Variable` value must fit its prefix.
    pub fn matches(&self, field_type: FieldType) -> bool {
        match (self, field_type) {
            (FieldValue::U8(_), FieldType::U8)
            | (FieldValue::U16(_), FieldType::U16)
            | (FieldValue::U32(_), FieldType::U32)
            | (FieldValue::U64(_), FieldType::U64)
            | (FieldValue::S8(_), FieldType::S8)
            | (FieldValue::S16(_), FieldType::S16)
            | (FieldValue::S32(_), FieldType::S32)
            | (FieldValue::S64(_), FieldType::S64)
            | (FieldValue::F32(_), FieldType::F32)
            | (FieldValue::F64(_), FieldType::F64)
            | (FieldValue::Uuid(_), FieldType::Uuid)
            | (FieldValue::Bool(_), FieldType::Bool)
            | (FieldValue::IpAddr(_), FieldType::IpAddr)
            | (FieldValue::IpPort(_), FieldType::IpPort)
            | (FieldValue::Vector3(_), FieldType::Vector3)
            | (FieldValue::Vector3d(_), FieldType::Vector3d)
            | (FieldValue::Vector4(_), FieldType::Vector4)
            | (FieldValue::Quaternion(_), FieldType::Quaternion) => true,
            (FieldValue::Fixed(data), FieldType::Fixed(len)) => data.len() == len,
            (FieldValue::Variable(data), FieldType::Variable1 | FieldType::Variable2) => {
                field_type.max_variable_len().is_some_and(|max| data.len() <= max)
            }
            _ => false,
        }
    }

    copy_accessor!(as_u8, U8, u8);
    copy_accessor!(as_u16, U16, u16);
    copy_accessor!(as_u32, U32, u32);
    copy_accessor!(as_u64, U64, u64);
    copy_accessor!(as_s8, S8, i8);
    copy_accessor!(as_s16, S16, i16);
    copy_accessor!(as_s32, S32, i32);
    copy_accessor!(as_s64, S64, i64);
    copy_accessor!(as_f32, F32, f32);
    copy_accessor!(as_f64, F64, f64);
    copy_accessor!(as_uuid, Uuid, Uuid);
    copy_accessor!(as_bool, Bool, bool);
    copy_accessor!(as_ip_addr, IpAddr, Ipv4Addr);
    copy_accessor!(as_ip_port, IpPort, u16);
    copy_accessor!(as_vector3, Vector3, [f32; 3]);
    copy_accessor!(as_vector3d, Vector3d, [f64; 3]);
    copy_accessor!(as_vector4, Vector4, [f32; 4]);
    copy_accessor!(as_quaternion, Quaternion, [f32; 4]);

    pub fn as_bytes(&self) -> CodecResult<&[u8]> {
        match self {
            FieldValue::Variable(data) | FieldValue::Fixed(data) => Ok(data),
            other => Err(CodecError::ValueType { expected: "Variable/Fixed", found: other.kind() }),
        }
    }

    /// Blob interpreted as text with trailing NUL padding removed
    pub fn as_string(&self) -> CodecResult<String> {
        let data = self.as_bytes()?;
        let end = data.iter().rposition(|&b| b != 0).map_or(0, |pos| pos + 1);
        Ok(String::from_utf8_lossy(&data[..end]).into_owned())
    }
}

macro_rules! from_native {
    ($ty:ty, $variant:ident) => {
        impl From<$ty> for FieldValue {
            fn from(value: $ty) -> Self {
                FieldValue::$variant(value)
            }
        }
    };
}

from_native!(u8, U8);
from_native!(u16, U16);
from_native!(u32, U32);
from_native!(u64, U64);
from_native!(i8, S8);
from_native!(i16, S16);
from_native!(i32, S32);
from_native!(i64, S64);
from_native!(f32, F32);
from_native!(f64, F64);
from_native!(Uuid, Uuid);
from_native!(bool, Bool);
from_native!(Ipv4Addr, IpAddr);
from_native!([f32; 3], Vector3);
from_native!([f64; 3], Vector3d);
from_native!([f32; 4], Vector4);
from_native!(Vec<u8>, Variable);

impl From<&[u8]> for FieldValue {
    fn from(value: &[u8]) -> Self {
        FieldValue::Variable(value.to_vec())
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Variable(value.as_bytes().to_vec())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Variable(value.into_bytes())
    }
}
