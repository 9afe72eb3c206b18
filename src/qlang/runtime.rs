//! Instance allocation, reflection and method dispatch.

use {
    super::{
        abi::{self, RuntimeError, VmState},
        compile::JitUnit,
        context::Context,
        layout::{ClassLayout, MemberLayout},
        value::QValue,
    },
    std::{cell::UnsafeCell, collections::HashMap, rc::Rc},
};

/// A live script object: shared ownership of a byte buffer laid out per its
/// class. Member access goes through the layout's offsets; the buffer is
/// zero-initialized at construction and freed with the last handle.
pub struct ClassInstance {
    layout: Rc<ClassLayout>,
    /// Interior-mutable because JIT code writes through raw pointers while
    /// the host only ever holds shared handles. Single-threaded.
    memory: UnsafeCell<Box<[u8]>>,
}

impl ClassInstance {
    fn new_zeroed(layout: Rc<ClassLayout>) -> Rc<Self> {
        let memory = vec![0u8; layout.total_size as usize].into_boxed_slice();
        Rc::new(Self {
            layout,
            memory: UnsafeCell::new(memory),
        })
    }

    pub fn layout(&self) -> &Rc<ClassLayout> {
        &self.layout
    }

    pub fn class_name(&self) -> &str {
        &self.layout.name
    }

    /// Whether this instance's class is `class_name` or inherits from it.
    pub fn is_a(&self, class_name: &str) -> bool {
        self.layout.lineage.iter().any(|name| name == class_name)
    }

    /// Ordered member list backing the editor's property panel.
    pub fn members(&self) -> &[MemberLayout] {
        &self.layout.members
    }

    pub(crate) fn memory_ptr(&self) -> *mut u8 {
        // The box itself is stable on the heap for the instance's lifetime.
        unsafe { (*self.memory.get()).as_mut_ptr() }
    }

    pub fn memory_addr(&self) -> usize {
        self.memory_ptr() as usize
    }

    /// Raw address of a member slot. The editor uses this on class-typed
    /// slots to follow object references across the scripting boundary
    /// without boxing.
    pub fn member_ptr(&self, name: &str) -> Result<*mut u8, RuntimeError> {
        let member = self
            .layout
            .member(name)
            .ok_or_else(|| RuntimeError::UnknownMember(name.to_owned()))?;
        Ok(unsafe { self.memory_ptr().add(member.offset as usize) })
    }

    unsafe fn read_slot(&self, member: &MemberLayout) -> u64 {
        let ptr = self.memory_ptr().add(member.offset as usize);
        match member.ty.size() {
            1 => ptr.read() as u64,
            4 => (ptr as *const u32).read_unaligned() as u64,
            _ => (ptr as *const u64).read_unaligned(),
        }
    }

    /// Read a member that needs no runtime tables (numerics, bool, raw
    /// pointers). Native functions use this to unpack structured arguments
    /// like `Vec3` without holding the runtime.
    pub fn member_primitive(&self, name: &str) -> Option<QValue> {
        use super::types::QType;

        let member = self.layout.member(name)?;
        let slot = unsafe { self.read_slot(member) };
        Some(match member.ty {
            QType::Bool => QValue::Bool(slot != 0),
            QType::Int32 => QValue::Int32(slot as i64 as i32),
            QType::Int64 => QValue::Int64(slot as i64),
            QType::Float32 => QValue::Float32(f32::from_bits(slot as u32)),
            QType::Float64 => QValue::Float64(f64::from_bits(slot)),
            QType::CPtr | QType::IPtr | QType::FPtr | QType::BPtr => {
                if slot == 0 {
                    QValue::Null
                } else {
                    QValue::CPtr(slot as usize as *mut std::ffi::c_void)
                }
            }
            _ => return None,
        })
    }

    unsafe fn write_slot(&self, member: &MemberLayout, slot: u64) {
        let ptr = self.memory_ptr().add(member.offset as usize);
        match member.ty.size() {
            1 => ptr.write(slot as u8),
            4 => (ptr as *mut u32).write_unaligned(slot as u32),
            _ => (ptr as *mut u64).write_unaligned(slot),
        }
    }
}

impl std::fmt::Debug for ClassInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassInstance")
            .field("class", &self.layout.name)
            .field("size", &self.layout.total_size)
            .finish()
    }
}

/// Owns every compiled class, the JIT artifacts keeping their code alive,
/// and the VM state trampolines operate on. One runtime per scripting
/// domain; single-threaded, owned by the render thread.
pub struct Runtime {
    vm: Box<VmState>,
    classes: Vec<Rc<ClassLayout>>,
    class_index: HashMap<String, usize>,
    /// Finalized JIT modules; never freed while the runtime lives since
    /// method tables point into their code.
    jit_units: Vec<JitUnit>,
    /// Mangled symbol name to entry address, so later compilations can call
    /// into earlier ones.
    exported: HashMap<String, usize>,
    /// Singletons for `static` classes.
    statics: HashMap<String, Rc<ClassInstance>>,
}

impl Runtime {
    pub fn new(context: Rc<Context>) -> Self {
        Self {
            vm: Box::new(VmState::new(context)),
            classes: Vec::new(),
            class_index: HashMap::new(),
            jit_units: Vec::new(),
            exported: HashMap::new(),
            statics: HashMap::new(),
        }
    }

    pub fn context(&self) -> Rc<Context> {
        Rc::clone(&self.vm.context)
    }

    pub fn class(&self, name: &str) -> Option<&Rc<ClassLayout>> {
        self.class_index.get(name).map(|&i| &self.classes[i])
    }

    /// Registered classes in registration order.
    pub fn classes(&self) -> impl Iterator<Item = &Rc<ClassLayout>> {
        self.classes.iter()
    }

    pub(crate) fn vm(&mut self) -> &mut VmState {
        &mut self.vm
    }

    pub(crate) fn exported_symbols(&self) -> &HashMap<String, usize> {
        &self.exported
    }

    /// Adopt the output of a compilation: classes become visible to lookup
    /// (re-registration replaces an earlier class of the same name) and the
    /// JIT unit is pinned for the runtime's lifetime.
    pub(crate) fn adopt(
        &mut self,
        classes: Vec<Rc<ClassLayout>>,
        unit: JitUnit,
        exported: HashMap<String, usize>,
    ) {
        for class in classes {
            match self.class_index.get(class.name.as_str()) {
                Some(&i) => {
                    self.statics.remove(&class.name);
                    self.classes[i] = class;
                }
                None => {
                    self.class_index
                        .insert(class.name.clone(), self.classes.len());
                    self.classes.push(class);
                }
            }
        }
        self.exported.extend(exported);
        self.jit_units.push(unit);
    }

    // ------------------------------------------------------------ instances

    /// Allocate a zeroed instance, apply declared member defaults, and
    /// register it so raw pointers inside script memory can be re-boxed.
    /// For a `static` class the shared singleton is returned instead.
    pub fn create_instance(&mut self, class_name: &str) -> Result<Rc<ClassInstance>, RuntimeError> {
        let layout = self
            .class(class_name)
            .cloned()
            .ok_or_else(|| RuntimeError::UnknownClass(class_name.to_owned()))?;

        if layout.is_static {
            if let Some(existing) = self.statics.get(class_name) {
                return Ok(Rc::clone(existing));
            }
        }

        let instance = ClassInstance::new_zeroed(layout);
        self.register_instance(&instance);

        let defaults: Vec<(String, QValue)> = instance
            .layout
            .members
            .iter()
            .filter_map(|m| m.default.clone().map(|v| (m.name.clone(), v)))
            .collect();
        for (name, value) in defaults {
            self.set_member(&instance, &name, value)?;
        }

        if instance.layout.is_static {
            self.statics
                .insert(class_name.to_owned(), Rc::clone(&instance));
        }
        Ok(instance)
    }

    fn register_instance(&mut self, instance: &Rc<ClassInstance>) {
        // Drop stale entries before the map grows unbounded.
        if self.vm.instances.len() > 1024 {
            self.vm.instances.retain(|_, weak| weak.strong_count() > 0);
        }
        self.vm
            .instances
            .insert(instance.memory_addr(), Rc::downgrade(instance));
    }

    /// Expose an externally-owned instance to the re-boxing registry (used
    /// when the editor passes instances it created through native calls).
    pub fn track_instance(&mut self, instance: &Rc<ClassInstance>) {
        self.register_instance(instance);
    }

    // ----------------------------------------------------------- reflection

    /// Typed member read at the recorded offset.
    pub fn member(&self, instance: &ClassInstance, name: &str) -> Result<QValue, RuntimeError> {
        let member = instance
            .layout
            .member(name)
            .ok_or_else(|| RuntimeError::UnknownMember(name.to_owned()))?;
        let slot = unsafe { instance.read_slot(member) };
        Ok(abi::slot_to_qvalue(&self.vm, slot, &member.ty))
    }

    /// Typed member write; the value must convert to the member's declared
    /// type.
    pub fn set_member(
        &mut self,
        instance: &ClassInstance,
        name: &str,
        value: QValue,
    ) -> Result<(), RuntimeError> {
        let member = instance
            .layout
            .member(name)
            .cloned()
            .ok_or_else(|| RuntimeError::UnknownMember(name.to_owned()))?;
        let slot = abi::qvalue_to_slot(&mut self.vm, &value, &member.ty).ok_or_else(|| {
            RuntimeError::FieldTypeMismatch {
                member: name.to_owned(),
                expected: member.ty.type_name().to_owned(),
                got: value.type_name().to_owned(),
            }
        })?;
        unsafe { instance.write_slot(&member, slot) };
        Ok(())
    }

    // ------------------------------------------------------------- dispatch

    /// Dispatch through the class's method table. Arguments are converted to
    /// the declared parameter types; the native return value is re-boxed.
    pub fn call_method(
        &mut self,
        instance: &Rc<ClassInstance>,
        name: &str,
        args: &[QValue],
    ) -> Result<QValue, RuntimeError> {
        let method = instance
            .layout
            .method(name)
            .cloned()
            .ok_or_else(|| RuntimeError::UnknownMethod(name.to_owned()))?;

        if args.len() != method.param_types.len() {
            return Err(RuntimeError::ArgumentTypeError {
                method: name.to_owned(),
                index: args.len(),
                expected: format!("{} arguments", method.param_types.len()),
                got: format!("{} arguments", args.len()),
            });
        }

        let mut slots = Vec::with_capacity(args.len());
        for (index, (arg, ty)) in args.iter().zip(&method.param_types).enumerate() {
            let slot = abi::qvalue_to_slot(&mut self.vm, arg, ty).ok_or_else(|| {
                RuntimeError::ArgumentTypeError {
                    method: name.to_owned(),
                    index,
                    expected: ty.type_name().to_owned(),
                    got: arg.type_name().to_owned(),
                }
            })?;
            slots.push(slot);
        }

        self.vm.error = None;
        let mut ret_slot = 0u64;
        unsafe {
            (method.entry)(
                self.vm.as_mut() as *mut VmState,
                instance.memory_ptr(),
                slots.as_ptr(),
                &mut ret_slot,
            );
        }
        if let Some(error) = self.vm.error.take() {
            return Err(error);
        }

        Ok(abi::slot_to_qvalue(&self.vm, ret_slot, &method.return_type))
    }

    /// Whether a class has a method; used by the scene layer to skip absent
    /// lifecycle hooks without paying for an error.
    pub fn has_method(&self, instance: &ClassInstance, name: &str) -> bool {
        instance.layout.method(name).is_some()
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("classes", &self.classes.len())
            .field("jit_units", &self.jit_units.len())
            .finish()
    }
}

/// Convenience for tests and tools: read a member as `f32` with the lenient
/// numeric view native functions use.
pub fn member_f32(runtime: &Runtime, instance: &ClassInstance, name: &str) -> Option<f32> {
    runtime.member(instance, name).ok()?.as_f32()
}
