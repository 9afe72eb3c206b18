//! The contract between JIT-compiled method code and the host runtime.
//!
//! Compiled methods use one uniform native signature ([`RawMethodFn`]) with
//! 8-byte argument slots; dynamically-typed traffic (native function calls,
//! string operations, runtime faults) goes through the `qn_*` trampolines
//! registered as JIT symbols. All of this is single-threaded: the VM state
//! pointer handed to a trampoline is owned by the calling [`Runtime`] and
//! outlives the call.
//!
//! [`Runtime`]: super::runtime::Runtime

use {
    super::{
        context::{Context, NativeFn},
        runtime::ClassInstance,
        types::QType,
        value::QValue,
    },
    std::{
        collections::HashMap,
        ffi::c_void,
        rc::{Rc, Weak},
    },
    thiserror::Error,
};

/// Uniform ABI of every compiled method: `(vm, self, args, ret)`.
///
/// `args` points at one 8-byte slot per declared parameter; `ret` points at a
/// single slot receiving the return value. Slot encodings are defined by
/// [`qvalue_to_slot`].
pub type RawMethodFn =
    unsafe extern "C" fn(vm: *mut VmState, this: *mut u8, args: *const u64, ret: *mut u64);

/// Runtime faults raised by the scripting layer. They surface to the caller
/// of `Runtime::call_method` and never unwind across JIT frames.
#[derive(Clone, Debug, Error)]
pub enum RuntimeError {
    #[error("unknown class '{0}'")]
    UnknownClass(String),

    #[error("unknown method '{0}'")]
    UnknownMethod(String),

    #[error("unknown member '{0}'")]
    UnknownMember(String),

    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("member '{member}' is {expected}, got {got}")]
    FieldTypeMismatch {
        member: String,
        expected: String,
        got: String,
    },

    #[error("argument {index} of '{method}' expects {expected}, got {got}")]
    ArgumentTypeError {
        method: String,
        index: usize,
        expected: String,
        got: String,
    },

    #[error("null dereference at line {line}")]
    NullDereference { line: u32 },

    #[error("integer division by zero at line {line}")]
    DivisionByZero { line: u32 },
}

/// Dynamic type tags used by the tagged-slot convention of
/// [`qn_native_call`].
pub mod tag {
    pub const NULL: u64 = 0;
    pub const BOOL: u64 = 1;
    pub const INT32: u64 = 2;
    pub const INT64: u64 = 3;
    pub const FLOAT32: u64 = 4;
    pub const FLOAT64: u64 = 5;
    pub const STR: u64 = 6;
    pub const CPTR: u64 = 7;
    pub const INSTANCE: u64 = 8;
}

/// Fault codes passed to [`qn_trap`].
pub mod trap {
    pub const NULL_DEREF: u64 = 0;
    pub const DIV_BY_ZERO: u64 = 1;
}

pub fn type_tag(ty: &QType) -> u64 {
    match ty {
        QType::Null => tag::NULL,
        QType::Bool => tag::BOOL,
        QType::Int32 => tag::INT32,
        QType::Int64 => tag::INT64,
        QType::Float32 => tag::FLOAT32,
        QType::Float64 => tag::FLOAT64,
        QType::Str => tag::STR,
        QType::CPtr | QType::IPtr | QType::FPtr | QType::BPtr => tag::CPTR,
        QType::Class(_) => tag::INSTANCE,
    }
}

/// One argument or return value of a native call: a dynamic type tag plus an
/// 8-byte payload. 16 bytes, matching the slot convention emitted by the
/// code generator.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct TaggedSlot {
    pub tag: u64,
    pub payload: u64,
}

/// Interned script strings. Handles are stable for the life of the runtime;
/// handle 0 is the empty string.
#[derive(Debug, Default)]
pub struct StringTable {
    items: Vec<String>,
    lookup: HashMap<String, u64>,
}

impl StringTable {
    pub fn new() -> Self {
        let mut table = Self::default();
        table.intern("");
        table
    }

    pub fn intern(&mut self, text: &str) -> u64 {
        if let Some(&handle) = self.lookup.get(text) {
            return handle;
        }
        let handle = self.items.len() as u64;
        self.items.push(text.to_owned());
        self.lookup.insert(text.to_owned(), handle);
        handle
    }

    pub fn get(&self, handle: u64) -> &str {
        self.items
            .get(handle as usize)
            .map(String::as_str)
            .unwrap_or("")
    }
}

/// Declared shape of a native function as seen by the compiler. `params` of
/// `None` means variadic (e.g. `printf`).
#[derive(Clone, Debug)]
pub struct NativeSig {
    pub params: Option<Vec<QType>>,
    pub ret: QType,
}

impl NativeSig {
    pub fn variadic() -> Self {
        Self {
            params: None,
            ret: QType::Null,
        }
    }
}

pub struct NativeEntry {
    pub name: String,
    pub sig: NativeSig,
    pub func: Rc<NativeFn>,
}

/// Mutable state shared between the host runtime and trampolines.
pub struct VmState {
    pub strings: StringTable,
    /// Live instances keyed by the base address of their memory, so raw
    /// pointers inside script memory can be re-boxed into handles.
    pub instances: HashMap<usize, Weak<ClassInstance>>,
    /// Native functions resolved at compile time, indexed by id.
    pub natives: Vec<NativeEntry>,
    /// Root engine context handed to native callables.
    pub context: Rc<Context>,
    /// First fault recorded since the last host call; checked by
    /// `Runtime::call_method` after every entry.
    pub error: Option<RuntimeError>,
}

impl VmState {
    pub fn new(context: Rc<Context>) -> Self {
        Self {
            strings: StringTable::new(),
            instances: HashMap::new(),
            natives: Vec::new(),
            context,
            error: None,
        }
    }

    pub fn fault(&mut self, error: RuntimeError) {
        log::warn!("script fault: {error}");
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    pub fn resolve_instance(&self, addr: usize) -> Option<Rc<ClassInstance>> {
        self.instances.get(&addr).and_then(Weak::upgrade)
    }
}

// ------------------------------------------------------------- marshalling

/// Encode a `QValue` into an 8-byte slot for a parameter of static type
/// `ty`. Numeric variants convert between each other; anything else must
/// match exactly.
pub fn qvalue_to_slot(vm: &mut VmState, value: &QValue, ty: &QType) -> Option<u64> {
    Some(match ty {
        QType::Null => 0,
        QType::Bool => match value {
            QValue::Bool(v) => *v as u64,
            _ => return None,
        },
        QType::Int32 => value.as_i64()? as i32 as i64 as u64,
        QType::Int64 => value.as_i64()? as u64,
        QType::Float32 => value.as_f32()?.to_bits() as u64,
        QType::Float64 => value.as_f64()?.to_bits(),
        QType::Str => match value {
            QValue::Str(s) => vm.strings.intern(s),
            _ => return None,
        },
        QType::CPtr | QType::IPtr | QType::FPtr | QType::BPtr => match value {
            QValue::Null => 0,
            QValue::CPtr(p) => *p as u64,
            QValue::Instance(inst) => inst.memory_addr() as u64,
            _ => return None,
        },
        QType::Class(class_name) => match value {
            QValue::Null => 0,
            QValue::Instance(inst) if inst.is_a(class_name) => inst.memory_addr() as u64,
            _ => return None,
        },
    })
}

/// Decode an 8-byte slot of static type `ty` back into a `QValue`.
pub fn slot_to_qvalue(vm: &VmState, slot: u64, ty: &QType) -> QValue {
    match ty {
        QType::Null => QValue::Null,
        QType::Bool => QValue::Bool(slot != 0),
        QType::Int32 => QValue::Int32(slot as i64 as i32),
        QType::Int64 => QValue::Int64(slot as i64),
        QType::Float32 => QValue::Float32(f32::from_bits(slot as u32)),
        QType::Float64 => QValue::Float64(f64::from_bits(slot)),
        QType::Str => QValue::Str(vm.strings.get(slot).to_owned()),
        QType::CPtr | QType::IPtr | QType::FPtr | QType::BPtr => {
            if slot == 0 {
                QValue::Null
            } else {
                QValue::CPtr(slot as usize as *mut c_void)
            }
        }
        QType::Class(_) => {
            if slot == 0 {
                QValue::Null
            } else if let Some(inst) = vm.resolve_instance(slot as usize) {
                QValue::Instance(inst)
            } else {
                QValue::CPtr(slot as usize as *mut c_void)
            }
        }
    }
}

/// Decode a tagged slot whose type is only known dynamically.
pub fn dynamic_to_qvalue(vm: &VmState, tag_value: u64, payload: u64) -> QValue {
    match tag_value {
        tag::BOOL => QValue::Bool(payload != 0),
        tag::INT32 => QValue::Int32(payload as i64 as i32),
        tag::INT64 => QValue::Int64(payload as i64),
        tag::FLOAT32 => QValue::Float32(f32::from_bits(payload as u32)),
        tag::FLOAT64 => QValue::Float64(f64::from_bits(payload)),
        tag::STR => QValue::Str(vm.strings.get(payload).to_owned()),
        tag::CPTR => {
            if payload == 0 {
                QValue::Null
            } else {
                QValue::CPtr(payload as usize as *mut c_void)
            }
        }
        tag::INSTANCE => {
            if payload == 0 {
                QValue::Null
            } else if let Some(inst) = vm.resolve_instance(payload as usize) {
                QValue::Instance(inst)
            } else {
                QValue::CPtr(payload as usize as *mut c_void)
            }
        }
        _ => QValue::Null,
    }
}

/// Encode a native call's `QValue` result for the statically-expected tag.
fn qvalue_to_expected_slot(vm: &mut VmState, value: &QValue, expect: u64) -> Option<u64> {
    let ty = match expect {
        tag::NULL => QType::Null,
        tag::BOOL => QType::Bool,
        tag::INT32 => QType::Int32,
        tag::INT64 => QType::Int64,
        tag::FLOAT32 => QType::Float32,
        tag::FLOAT64 => QType::Float64,
        tag::STR => QType::Str,
        tag::CPTR => QType::CPtr,
        // Instance results decay to a raw address; the static class was
        // checked at compile time.
        tag::INSTANCE => QType::CPtr,
        _ => QType::Null,
    };
    qvalue_to_slot(vm, value, &ty)
}

// ------------------------------------------------------------- trampolines

/// Dispatch a native function registered in the engine context.
///
/// # Safety
///
/// `vm` must point at the live `VmState` of the runtime executing the
/// calling method; `argv` must point at `argc` initialized slots.
pub unsafe extern "C" fn qn_native_call(
    vm: *mut VmState,
    func_id: u64,
    argv: *const TaggedSlot,
    argc: u64,
    expect_tag: u64,
    ret: *mut u64,
) {
    let vm = &mut *vm;
    *ret = 0;

    let Some(entry) = vm.natives.get(func_id as usize) else {
        vm.fault(RuntimeError::UnknownFunction(format!("#{func_id}")));
        return;
    };
    let name = entry.name.clone();
    let func = Rc::clone(&entry.func);

    let mut args = Vec::with_capacity(argc as usize);
    for i in 0..argc as usize {
        let slot = *argv.add(i);
        args.push(dynamic_to_qvalue(vm, slot.tag, slot.payload));
    }

    let context = Rc::clone(&vm.context);
    let result = func(&context, &args);

    match qvalue_to_expected_slot(vm, &result, expect_tag) {
        Some(slot) => *ret = slot,
        None => vm.fault(RuntimeError::ArgumentTypeError {
            method: name,
            index: usize::MAX,
            expected: format!("tag {expect_tag}"),
            got: result.type_name().to_owned(),
        }),
    }
}

/// String `+`: coerces either operand to its decimal/display form and
/// returns a new interned handle.
///
/// # Safety
///
/// `vm` must point at the live `VmState` of the calling runtime.
pub unsafe extern "C" fn qn_str_concat(
    vm: *mut VmState,
    ltag: u64,
    lpay: u64,
    rtag: u64,
    rpay: u64,
) -> u64 {
    let vm = &mut *vm;
    let lhs = dynamic_to_qvalue(vm, ltag, lpay).display_string();
    let rhs = dynamic_to_qvalue(vm, rtag, rpay).display_string();
    vm.strings.intern(&format!("{lhs}{rhs}"))
}

/// String equality by contents.
///
/// # Safety
///
/// `vm` must point at the live `VmState` of the calling runtime.
pub unsafe extern "C" fn qn_str_eq(vm: *mut VmState, lhs: u64, rhs: u64) -> i64 {
    let vm = &*vm;
    (lhs == rhs || vm.strings.get(lhs) == vm.strings.get(rhs)) as i64
}

/// Record a runtime fault raised by generated code; execution continues with
/// a zero value in the faulting expression.
///
/// # Safety
///
/// `vm` must point at the live `VmState` of the calling runtime.
pub unsafe extern "C" fn qn_trap(vm: *mut VmState, code: u64, line: u64) {
    let vm = &mut *vm;
    let error = match code {
        trap::DIV_BY_ZERO => RuntimeError::DivisionByZero { line: line as u32 },
        _ => RuntimeError::NullDereference { line: line as u32 },
    };
    vm.fault(error);
}

/// Names under which the trampolines are registered as JIT symbols.
pub const SYM_NATIVE_CALL: &str = "qn_native_call";
pub const SYM_STR_CONCAT: &str = "qn_str_concat";
pub const SYM_STR_EQ: &str = "qn_str_eq";
pub const SYM_TRAP: &str = "qn_trap";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_table_interns_and_dedupes() {
        let mut table = StringTable::new();
        assert_eq!(table.get(0), "");
        let a = table.intern("hello");
        let b = table.intern("hello");
        assert_eq!(a, b);
        assert_eq!(table.get(a), "hello");
    }

    #[test]
    fn numeric_slot_round_trip() {
        let mut vm = VmState::new(Rc::new(Context::root("test")));
        for (value, ty) in [
            (QValue::Int32(-7), QType::Int32),
            (QValue::Int64(1 << 40), QType::Int64),
            (QValue::Float32(1.5), QType::Float32),
            (QValue::Float64(-0.25), QType::Float64),
            (QValue::Bool(true), QType::Bool),
        ] {
            let slot = qvalue_to_slot(&mut vm, &value, &ty).unwrap();
            let back = slot_to_qvalue(&vm, slot, &ty);
            assert_eq!(back.display_string(), value.display_string());
        }
    }

    #[test]
    fn mismatched_slot_encoding_fails() {
        let mut vm = VmState::new(Rc::new(Context::root("test")));
        assert!(qvalue_to_slot(&mut vm, &QValue::Str("x".into()), &QType::Int32).is_none());
        assert!(qvalue_to_slot(&mut vm, &QValue::Int32(1), &QType::Bool).is_none());
    }
}
