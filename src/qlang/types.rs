//! Static types of the scripting language and their storage properties.

use {
    serde::{Deserialize, Serialize},
    std::fmt,
};

/// A resolved static type. Primitives store by value inside instance memory;
/// strings store an interner handle; pointer types and class references
/// store a raw address.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum QType {
    Null,
    Bool,
    Int32,
    Int64,
    Float32,
    Float64,
    Str,
    CPtr,
    IPtr,
    FPtr,
    BPtr,
    Class(String),
}

impl QType {
    /// Parse a declared type name. Unknown names resolve as class references;
    /// whether the class exists is checked by the layout pass.
    pub fn from_name(name: &str) -> Self {
        match name {
            "null" => Self::Null,
            "bool" => Self::Bool,
            "int32" => Self::Int32,
            "int64" => Self::Int64,
            "float32" => Self::Float32,
            "float64" => Self::Float64,
            "string" => Self::Str,
            "cptr" => Self::CPtr,
            "iptr" => Self::IPtr,
            "fptr" => Self::FPtr,
            "bptr" => Self::BPtr,
            other => Self::Class(other.to_owned()),
        }
    }

    pub fn type_name(&self) -> &str {
        match self {
            Self::Null => "null",
            Self::Bool => "bool",
            Self::Int32 => "int32",
            Self::Int64 => "int64",
            Self::Float32 => "float32",
            Self::Float64 => "float64",
            Self::Str => "string",
            Self::CPtr => "cptr",
            Self::IPtr => "iptr",
            Self::FPtr => "fptr",
            Self::BPtr => "bptr",
            Self::Class(name) => name,
        }
    }

    /// Stable numeric id persisted in the `.qm` member records.
    pub fn token_id(&self) -> i32 {
        match self {
            Self::Null => 0,
            Self::Int32 => 1,
            Self::Int64 => 2,
            Self::Float32 => 3,
            Self::Float64 => 4,
            Self::Bool => 5,
            Self::Str => 6,
            Self::CPtr => 7,
            Self::IPtr => 8,
            Self::FPtr => 9,
            Self::BPtr => 10,
            Self::Class(_) => 100,
        }
    }

    /// Storage size inside instance memory.
    pub fn size(&self) -> u32 {
        match self {
            Self::Null => 0,
            Self::Bool => 1,
            Self::Int32 | Self::Float32 => 4,
            Self::Int64
            | Self::Float64
            | Self::Str
            | Self::CPtr
            | Self::IPtr
            | Self::FPtr
            | Self::BPtr
            | Self::Class(_) => 8,
        }
    }

    /// Natural alignment; equal to size for all storable types.
    pub fn align(&self) -> u32 {
        self.size().max(1)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Int32 | Self::Int64 | Self::Float32 | Self::Float64)
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, Self::Int32 | Self::Int64)
    }

    pub fn is_float(&self) -> bool {
        matches!(self, Self::Float32 | Self::Float64)
    }

    pub fn is_pointer(&self) -> bool {
        matches!(
            self,
            Self::CPtr | Self::IPtr | Self::FPtr | Self::BPtr | Self::Class(_)
        )
    }

    /// Whether a value of `self` may be stored into a slot of `target`
    /// without an explicit cast.
    pub fn assignable_to(&self, target: &Self) -> bool {
        if self == target {
            return true;
        }
        match (self, target) {
            // null fits any class-typed or pointer slot
            (Self::Null, t) if t.is_pointer() => true,
            // any raw pointer flavor fits cptr (the opaque one)
            (s, Self::CPtr) if s.is_pointer() => true,
            _ => false,
        }
    }
}

impl fmt::Display for QType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_and_alignment() {
        assert_eq!(QType::Bool.size(), 1);
        assert_eq!(QType::Float32.size(), 4);
        assert_eq!(QType::Int64.align(), 8);
        assert_eq!(QType::Class("Vec3".into()).size(), 8);
    }

    #[test]
    fn null_assigns_to_class_slots() {
        let vec3 = QType::Class("Vec3".into());
        assert!(QType::Null.assignable_to(&vec3));
        assert!(!QType::Int32.assignable_to(&QType::Int64));
        assert!(vec3.assignable_to(&QType::CPtr));
    }
}
