//! Tagged dynamic values crossing the scripting boundary.

use {
    super::runtime::ClassInstance,
    std::{ffi::c_void, fmt, rc::Rc},
};

/// A value held by a [`Context`](super::context::Context) variable, passed to
/// a native function, or returned from a compiled method.
///
/// The variant of a live value never changes in place; assignment replaces
/// the whole value.
#[derive(Clone, Default)]
pub enum QValue {
    #[default]
    Null,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Str(String),
    /// Opaque engine pointer (`cptr`). Non-owning.
    CPtr(*mut c_void),
    /// Shared handle to a live script object.
    Instance(Rc<ClassInstance>),
}

impl QValue {
    /// Stable name of the value's type, as reported to scripts and shown in
    /// editor panels.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int32(_) => "int32",
            Self::Int64(_) => "int64",
            Self::Float32(_) => "float32",
            Self::Float64(_) => "float64",
            Self::Str(_) => "string",
            Self::CPtr(_) => "cptr",
            Self::Instance(_) => "instance",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Best-effort numeric view used by native functions which accept any
    /// numeric variant (mirrors the editor's lenient member reads).
    pub fn as_f32(&self) -> Option<f32> {
        match self {
            Self::Int32(v) => Some(*v as f32),
            Self::Int64(v) => Some(*v as f32),
            Self::Float32(v) => Some(*v),
            Self::Float64(v) => Some(*v as f32),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int32(v) => Some(*v as f64),
            Self::Int64(v) => Some(*v as f64),
            Self::Float32(v) => Some(*v as f64),
            Self::Float64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Bool(v) => Some(*v as i64),
            Self::Int32(v) => Some(*v as i64),
            Self::Int64(v) => Some(*v),
            Self::Float32(v) => Some(*v as i64),
            Self::Float64(v) => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_instance(&self) -> Option<&Rc<ClassInstance>> {
        match self {
            Self::Instance(inst) => Some(inst),
            _ => None,
        }
    }

    pub fn as_cptr(&self) -> Option<*mut c_void> {
        match self {
            Self::CPtr(p) => Some(*p),
            _ => None,
        }
    }

    /// Decimal/display form used by `printf` and string coercion.
    pub fn display_string(&self) -> String {
        match self {
            Self::Null => "null".to_owned(),
            Self::Bool(v) => if *v { "true" } else { "false" }.to_owned(),
            Self::Int32(v) => v.to_string(),
            Self::Int64(v) => v.to_string(),
            Self::Float32(v) => v.to_string(),
            Self::Float64(v) => v.to_string(),
            Self::Str(s) => s.clone(),
            Self::CPtr(p) => format!("<cptr:{p:p}>"),
            Self::Instance(inst) => format!("<instance {}>", inst.class_name()),
        }
    }
}

impl fmt::Debug for QValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => write!(f, "{s:?}"),
            _ => f.write_str(&self.display_string()),
        }
    }
}

impl From<bool> for QValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for QValue {
    fn from(v: i32) -> Self {
        Self::Int32(v)
    }
}

impl From<i64> for QValue {
    fn from(v: i64) -> Self {
        Self::Int64(v)
    }
}

impl From<f32> for QValue {
    fn from(v: f32) -> Self {
        Self::Float32(v)
    }
}

impl From<f64> for QValue {
    fn from(v: f64) -> Self {
        Self::Float64(v)
    }
}

impl From<&str> for QValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_owned())
    }
}

impl From<String> for QValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}
