//! Value kinds and their wire integers.

use std::fmt;

use thiserror::Error;

/// Wire flag marking an array-of-kind tag.
pub const TYPE_ARRAY: i32 = 0x20;

/// Errors raised when decoding or validating type tags.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TypeTagError {
    #[error("unknown type tag {0:#x}")]
    Unknown(i32),
    #[error("{tag} payload must be {expected} bytes, got {actual}")]
    BadLength {
        tag: TypeTag,
        expected: usize,
        actual: usize,
    },
    #[error("bool payload must be 0 or 1, got {0}")]
    BadBool(u8),
    #[error("string payload is not valid utf-8")]
    BadUtf8,
    #[error("{0} values are containers and have no byte form")]
    NotScalar(TypeTag),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(i32)]
pub enum TypeKind {
    Address = 1,
    AgentId = 2,
    Bool = 3,
    Bytes = 4,
    ChainId = 5,
    Color = 6,
    Hash = 7,
    Hname = 8,
    Int16 = 9,
    Int32 = 10,
    Int64 = 11,
    Map = 12,
    RequestId = 13,
    String = 14,
}

impl TypeKind {
    pub const ALL: [TypeKind; 14] = [
        TypeKind::Address,
        TypeKind::AgentId,
        TypeKind::Bool,
        TypeKind::Bytes,
        TypeKind::ChainId,
        TypeKind::Color,
        TypeKind::Hash,
        TypeKind::Hname,
        TypeKind::Int16,
        TypeKind::Int32,
        TypeKind::Int64,
        TypeKind::Map,
        TypeKind::RequestId,
        TypeKind::String,
    ];

    pub fn from_i32(value: i32) -> Option<Self> {
        Self::ALL.iter().copied().find(|kind| *kind as i32 == value)
    }

    /// Encoded size for fixed-width kinds.
    pub fn fixed_size(self) -> Option<usize> {
        match self {
            TypeKind::Address | TypeKind::ChainId => Some(33),
            TypeKind::AgentId => Some(37),
            TypeKind::Bool => Some(1),
            TypeKind::Color | TypeKind::Hash => Some(32),
            TypeKind::Hname | TypeKind::Int32 => Some(4),
            TypeKind::Int16 => Some(2),
            TypeKind::Int64 => Some(8),
            TypeKind::RequestId => Some(34),
            TypeKind::Bytes | TypeKind::Map | TypeKind::String => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            TypeKind::Address => "Address",
            TypeKind::AgentId => "AgentID",
            TypeKind::Bool => "Bool",
            TypeKind::Bytes => "Bytes",
            TypeKind::ChainId => "ChainID",
            TypeKind::Color => "Color",
            TypeKind::Hash => "Hash",
            TypeKind::Hname => "Hname",
            TypeKind::Int16 => "Int16",
            TypeKind::Int32 => "Int32",
            TypeKind::Int64 => "Int64",
            TypeKind::Map => "Map",
            TypeKind::RequestId => "RequestID",
            TypeKind::String => "String",
        }
    }
}

/// Type of a value slot: a single kind, or an array of that kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeTag {
    Value(TypeKind),
    Array(TypeKind),
}

impl TypeTag {
    pub const MAP: TypeTag = TypeTag::Value(TypeKind::Map);
    pub const INT32: TypeTag = TypeTag::Value(TypeKind::Int32);
    pub const INT64: TypeTag = TypeTag::Value(TypeKind::Int64);
    pub const BYTES: TypeTag = TypeTag::Value(TypeKind::Bytes);
    pub const STRING: TypeTag = TypeTag::Value(TypeKind::String);

    pub fn from_i32(value: i32) -> Result<Self, TypeTagError> {
        let kind = TypeKind::from_i32(value & !TYPE_ARRAY).ok_or(TypeTagError::Unknown(value))?;
        if value & TYPE_ARRAY != 0 {
            Ok(TypeTag::Array(kind))
        } else {
            Ok(TypeTag::Value(kind))
        }
    }

    pub fn as_i32(self) -> i32 {
        match self {
            TypeTag::Value(kind) => kind as i32,
            TypeTag::Array(kind) => kind as i32 | TYPE_ARRAY,
        }
    }

    pub fn kind(self) -> TypeKind {
        match self {
            TypeTag::Value(kind) | TypeTag::Array(kind) => kind,
        }
    }

    /// Maps and arrays are reached through `get_object_id`, never as bytes.
    pub fn is_container(self) -> bool {
        matches!(self, TypeTag::Array(_) | TypeTag::Value(TypeKind::Map))
    }

    /// Check that `bytes` is a well-formed payload for this tag.
    pub fn validate(self, bytes: &[u8]) -> Result<(), TypeTagError> {
        let kind = match self {
            TypeTag::Value(kind) if !self.is_container() => kind,
            _ => return Err(TypeTagError::NotScalar(self)),
        };
        if let Some(expected) = kind.fixed_size() {
            if bytes.len() != expected {
                return Err(TypeTagError::BadLength {
                    tag: self,
                    expected,
                    actual: bytes.len(),
                });
            }
        }
        match kind {
            TypeKind::Bool if bytes[0] > 1 => Err(TypeTagError::BadBool(bytes[0])),
            TypeKind::String if std::str::from_utf8(bytes).is_err() => Err(TypeTagError::BadUtf8),
            _ => Ok(()),
        }
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeTag::Value(kind) => f.write_str(kind.name()),
            TypeTag::Array(kind) => write!(f, "Array<{}>", kind.name()),
        }
    }
}
