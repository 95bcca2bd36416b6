//! PostgreSQL type identifiers and binary value framing.
//!
//! Values are framed the way the binary wire format requires: single
//! bytes stored as-is, multi-byte integers and IEEE-754 floats in network
//! (big-endian) byte order, byte strings and name-typed values stored
//! as-is, one-dimensional arrays with the standard array header. Null
//! serializes to zero bytes.
//!
//! Reference: https://www.postgresql.org/docs/current/protocol-overview.html#PROTOCOL-FORMAT-CODES

use std::collections::HashMap;

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{Error, Result};

// ============================================================================
// Type OIDs
// ============================================================================

/// A PostgreSQL type object identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Oid(pub i32);

impl Oid {
    pub const BOOL: Oid = Oid(16);
    pub const BYTEA: Oid = Oid(17);
    pub const CHAR: Oid = Oid(18);
    pub const NAME: Oid = Oid(19);
    pub const INT8: Oid = Oid(20);
    pub const INT2: Oid = Oid(21);
    pub const INT4: Oid = Oid(23);
    pub const TEXT: Oid = Oid(25);
    pub const FLOAT4: Oid = Oid(700);
    pub const FLOAT8: Oid = Oid(701);
    pub const VARCHAR: Oid = Oid(1043);
    pub const BPCHAR: Oid = Oid(1042);

    // Array types
    pub const BOOL_ARRAY: Oid = Oid(1000);
    pub const INT2_ARRAY: Oid = Oid(1005);
    pub const INT4_ARRAY: Oid = Oid(1007);
    pub const TEXT_ARRAY: Oid = Oid(1009);
    pub const INT8_ARRAY: Oid = Oid(1016);
    pub const FLOAT4_ARRAY: Oid = Oid(1021);
    pub const FLOAT8_ARRAY: Oid = Oid(1022);

    /// Create from raw i32 value.
    #[inline]
    pub fn from_i32(oid: i32) -> Self {
        Oid(oid)
    }

    /// Get the raw i32 value.
    #[inline]
    pub fn as_i32(self) -> i32 {
        self.0
    }

    /// Check if this is a text-like type.
    pub fn is_text_like(self) -> bool {
        matches!(
            self,
            Oid::TEXT | Oid::VARCHAR | Oid::BPCHAR | Oid::CHAR | Oid::NAME
        )
    }

    /// The array type whose elements have this OID, if it is a supported
    /// element type.
    pub fn array_of(self) -> Option<Oid> {
        match self {
            Oid::BOOL => Some(Oid::BOOL_ARRAY),
            Oid::INT2 => Some(Oid::INT2_ARRAY),
            Oid::INT4 => Some(Oid::INT4_ARRAY),
            Oid::INT8 => Some(Oid::INT8_ARRAY),
            Oid::FLOAT4 => Some(Oid::FLOAT4_ARRAY),
            Oid::FLOAT8 => Some(Oid::FLOAT8_ARRAY),
            Oid::TEXT => Some(Oid::TEXT_ARRAY),
            _ => None,
        }
    }

    /// The element type of this array OID, if it is a supported array type.
    pub fn element_of(self) -> Option<Oid> {
        match self {
            Oid::BOOL_ARRAY => Some(Oid::BOOL),
            Oid::INT2_ARRAY => Some(Oid::INT2),
            Oid::INT4_ARRAY => Some(Oid::INT4),
            Oid::INT8_ARRAY => Some(Oid::INT8),
            Oid::FLOAT4_ARRAY => Some(Oid::FLOAT4),
            Oid::FLOAT8_ARRAY => Some(Oid::FLOAT8),
            Oid::TEXT_ARRAY => Some(Oid::TEXT),
            _ => None,
        }
    }
}

// ============================================================================
// OID map
// ============================================================================

/// Associates user-defined type names with their object identifiers.
///
/// The map is opaque to connection establishment and pooling; it is
/// carried by the connection so that the serialization layer can resolve
/// custom types discovered after establishment.
#[derive(Debug, Clone, Default)]
pub struct OidMap {
    types: HashMap<String, Oid>,
}

impl OidMap {
    /// Create an empty map.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Register a type name with its OID.
    pub fn insert(&mut self, name: impl Into<String>, oid: Oid) {
        self.types.insert(name.into(), oid);
    }

    /// Look up the OID registered for a type name.
    pub fn lookup(&self, name: &str) -> Option<Oid> {
        self.types.get(name).copied()
    }

    /// Number of registered types.
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Whether the map has no registered types.
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

// ============================================================================
// Values
// ============================================================================

/// A PostgreSQL value with type information.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    /// A single byte, stored as-is.
    Char(i8),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    Text(String),
    /// A name-typed identifier, stored as-is like text.
    Name(String),
    Bytea(Vec<u8>),
    /// A one-dimensional array of a single element type.
    Array { elem_oid: Oid, elems: Vec<Value> },
    /// Raw bytes of a type the crate does not handle specially.
    Raw { oid: Oid, data: Vec<u8> },
}

impl Value {
    /// Check if this value is NULL.
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Get the OID for this value's type.
    pub fn type_oid(&self) -> Oid {
        match self {
            Value::Null => Oid::TEXT,
            Value::Bool(_) => Oid::BOOL,
            Value::Char(_) => Oid::CHAR,
            Value::Int2(_) => Oid::INT2,
            Value::Int4(_) => Oid::INT4,
            Value::Int8(_) => Oid::INT8,
            Value::Float4(_) => Oid::FLOAT4,
            Value::Float8(_) => Oid::FLOAT8,
            Value::Text(_) => Oid::TEXT,
            Value::Name(_) => Oid::NAME,
            Value::Bytea(_) => Oid::BYTEA,
            Value::Array { elem_oid, .. } => elem_oid.array_of().unwrap_or(*elem_oid),
            Value::Raw { oid, .. } => *oid,
        }
    }

    /// Encode this value to the binary wire format.
    ///
    /// Null encodes to zero bytes; the null-ness itself travels out of
    /// band as a `-1` length in the enclosing message.
    pub fn encode_binary(&self) -> Vec<u8> {
        match self {
            Value::Null => vec![],
            Value::Bool(v) => vec![if *v { 1 } else { 0 }],
            Value::Char(v) => vec![*v as u8],
            Value::Int2(v) => v.to_be_bytes().to_vec(),
            Value::Int4(v) => v.to_be_bytes().to_vec(),
            Value::Int8(v) => v.to_be_bytes().to_vec(),
            Value::Float4(v) => v.to_be_bytes().to_vec(),
            Value::Float8(v) => v.to_be_bytes().to_vec(),
            Value::Text(v) => v.as_bytes().to_vec(),
            Value::Name(v) => v.as_bytes().to_vec(),
            Value::Bytea(v) => v.clone(),
            Value::Array { elem_oid, elems } => encode_array(*elem_oid, elems),
            Value::Raw { data, .. } => data.clone(),
        }
    }

    /// Decode a value from the binary wire format.
    pub fn decode_binary(oid: Oid, data: &[u8]) -> Result<Self> {
        match oid {
            Oid::BOOL => {
                let b = fixed::<1>(oid, data)?;
                Ok(Value::Bool(b[0] != 0))
            }
            Oid::CHAR => {
                let b = fixed::<1>(oid, data)?;
                Ok(Value::Char(b[0] as i8))
            }
            Oid::INT2 => Ok(Value::Int2(i16::from_be_bytes(fixed(oid, data)?))),
            Oid::INT4 => Ok(Value::Int4(i32::from_be_bytes(fixed(oid, data)?))),
            Oid::INT8 => Ok(Value::Int8(i64::from_be_bytes(fixed(oid, data)?))),
            Oid::FLOAT4 => Ok(Value::Float4(f32::from_be_bytes(fixed(oid, data)?))),
            Oid::FLOAT8 => Ok(Value::Float8(f64::from_be_bytes(fixed(oid, data)?))),
            Oid::NAME => Ok(Value::Name(utf8(oid, data)?)),
            Oid::TEXT | Oid::VARCHAR | Oid::BPCHAR => Ok(Value::Text(utf8(oid, data)?)),
            Oid::BYTEA => Ok(Value::Bytea(data.to_vec())),
            _ if oid.element_of().is_some() => decode_array(oid, data),
            _ => Ok(Value::Raw {
                oid,
                data: data.to_vec(),
            }),
        }
    }
}

fn fixed<const N: usize>(oid: Oid, data: &[u8]) -> Result<[u8; N]> {
    data.try_into().map_err(|_| {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("invalid length {} for oid {}", data.len(), oid.as_i32()),
        ))
    })
}

fn utf8(oid: Oid, data: &[u8]) -> Result<String> {
    std::str::from_utf8(data).map(str::to_owned).map_err(|e| {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("invalid UTF-8 for oid {}: {}", oid.as_i32(), e),
        ))
    })
}

/// Encode a one-dimensional array: the header `(ndim, has_nulls,
/// elem_oid, dim_len, lower_bound)` followed by length-prefixed elements.
fn encode_array(elem_oid: Oid, elems: &[Value]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(20 + elems.len() * 8);
    buf.put_i32(1); // ndim
    buf.put_i32(0); // has_nulls
    buf.put_i32(elem_oid.as_i32());
    buf.put_i32(elems.len() as i32);
    buf.put_i32(0); // lower bound
    for elem in elems {
        if elem.is_null() {
            buf.put_i32(-1);
        } else {
            let encoded = elem.encode_binary();
            buf.put_i32(encoded.len() as i32);
            buf.put_slice(&encoded);
        }
    }
    buf.to_vec()
}

fn decode_array(array_oid: Oid, data: &[u8]) -> Result<Value> {
    let invalid = |msg: &str| {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            msg.to_string(),
        ))
    };

    let mut buf = data;
    if buf.remaining() < 12 {
        return Err(invalid("array header too short"));
    }
    let ndim = buf.get_i32();
    let _has_nulls = buf.get_i32();
    let elem_oid = Oid::from_i32(buf.get_i32());

    if ndim == 0 {
        return Ok(Value::Array {
            elem_oid,
            elems: Vec::new(),
        });
    }
    if ndim != 1 {
        return Err(invalid("only one-dimensional arrays are supported"));
    }
    if Some(elem_oid) != array_oid.element_of() {
        return Err(invalid("array element oid does not match array type"));
    }
    if buf.remaining() < 8 {
        return Err(invalid("array dimension header too short"));
    }
    let dim_len = buf.get_i32();
    let _lower_bound = buf.get_i32();

    let mut elems = Vec::with_capacity(dim_len.max(0) as usize);
    for _ in 0..dim_len {
        if buf.remaining() < 4 {
            return Err(invalid("array element header too short"));
        }
        let len = buf.get_i32();
        if len < 0 {
            elems.push(Value::Null);
            continue;
        }
        let len = len as usize;
        if buf.remaining() < len {
            return Err(invalid("array element body too short"));
        }
        elems.push(Value::decode_binary(elem_oid, &buf[..len])?);
        buf.advance(len);
    }

    Ok(Value::Array { elem_oid, elems })
}
