//! AST to native code.
//!
//! Compilation runs in four passes: declaration, layout, method signatures,
//! then body lowering through the Cranelift backend. Errors are accumulated
//! per class and returned as one batch; a batch with any error means nothing
//! from the unit is registered.

mod lower;

pub use lower::JitUnit;

use {
    super::{
        abi::{self, VmState},
        ast::{ClassDecl, Expr, Literal, Program, UnaryOp},
        layout::{compute_member_offsets, ClassLayout, CompiledMethod, MemberLayout},
        runtime::Runtime,
        token::Span,
        types::QType,
        value::QValue,
    },
    cranelift_codegen::settings::Configurable,
    cranelift_jit::{JITBuilder, JITModule},
    cranelift_module::{default_libcall_names, FuncId, Linkage, Module},
    std::collections::{HashMap, HashSet},
    thiserror::Error,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompileErrorKind {
    UnknownType,
    UnknownMember,
    UnknownMethod,
    UnknownFunction,
    ArityMismatch,
    IncompatibleTypes,
    RedeclaredClass,
    RedeclaredMember,
    RedeclaredMethod,
    ReturnTypeMismatch,
    Backend,
}

#[derive(Clone, Debug, Error)]
#[error("{span_line}:{span_col}: {kind:?}: {message}", span_line = .span.line, span_col = .span.column)]
pub struct CompileError {
    pub kind: CompileErrorKind,
    pub message: String,
    pub span: Span,
}

impl CompileError {
    pub fn new(kind: CompileErrorKind, span: Span, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            span,
        }
    }
}

/// The batch of errors produced by one compilation unit.
#[derive(Debug, Error)]
#[error("{} compile error(s)", .0.len())]
pub struct CompileErrors(pub Vec<CompileError>);

/// Signature of one callable method as seen during lowering; `symbol` names
/// the defining class's JIT symbol.
#[derive(Clone, Debug)]
pub(crate) struct MethodInfo {
    pub params: Vec<QType>,
    pub ret: QType,
    pub symbol: String,
}

/// Merged view of a class available to the code generator: unit-local protos
/// and classes imported from earlier compilations look identical.
#[derive(Clone, Debug)]
pub(crate) struct ClassInfo {
    pub name: String,
    pub parent_name: Option<String>,
    pub lineage: Vec<String>,
    pub members: Vec<MemberLayout>,
    pub total_size: u32,
    /// Flattened: own methods plus inherited ones, overrides applied.
    pub methods: HashMap<String, MethodInfo>,
    /// Own methods in declaration order.
    pub method_order: Vec<String>,
    pub is_static: bool,
}

pub(crate) struct UnitEnv {
    pub classes: HashMap<String, ClassInfo>,
}

impl UnitEnv {
    pub fn class(&self, name: &str) -> Option<&ClassInfo> {
        self.classes.get(name)
    }
}

fn mangle(class: &str, method: &str) -> String {
    format!("{class}::{method}")
}

/// Compile a parsed program against the runtime's registered classes and
/// native environment, then register the result with the runtime.
///
/// Returns the layouts of the classes the unit declared, in declaration
/// order.
pub fn compile_and_register(
    runtime: &mut Runtime,
    program: &Program,
) -> Result<Vec<std::rc::Rc<ClassLayout>>, CompileErrors> {
    let mut errors = Vec::new();

    // Pass 1: declarations.
    let mut declared = HashSet::new();
    for class in &program.classes {
        if !declared.insert(class.name.clone()) {
            errors.push(CompileError::new(
                CompileErrorKind::RedeclaredClass,
                class.span,
                format!("class '{}' is declared twice", class.name),
            ));
        }
    }

    // Imported view of everything already registered.
    let mut env = UnitEnv {
        classes: runtime
            .classes()
            .map(|layout| (layout.name.clone(), import_class_info(layout)))
            .collect(),
    };

    // Pass 2: layout, in declaration order with recursive parent resolution.
    let unit_names: Vec<String> = program.classes.iter().map(|c| c.name.clone()).collect();
    let decls: HashMap<&str, &ClassDecl> = program
        .classes
        .iter()
        .map(|c| (c.name.as_str(), c))
        .collect();
    let mut in_progress = HashSet::new();
    let mut done = HashSet::new();
    for class in &program.classes {
        resolve_layout(
            class,
            &decls,
            &mut env,
            &mut in_progress,
            &mut done,
            &mut errors,
        );
    }

    // Pass 3: method signatures (flattened with inheritance). Parents go
    // first so a child sees the parent's flattened table.
    for name in topo_order(program) {
        if let Some(class) = decls.get(name.as_str()) {
            resolve_signatures(class, &mut env, &mut errors);
        }
    }

    if !errors.is_empty() {
        return Err(CompileErrors(errors));
    }

    // Pass 4: lower bodies through the backend.
    let exported = runtime.exported_symbols().clone();
    let outcome = lower_unit(runtime.vm(), &env, program, &exported, &mut errors);
    let Some((unit, addresses)) = outcome else {
        return Err(CompileErrors(errors));
    };
    if !errors.is_empty() {
        return Err(CompileErrors(errors));
    }

    // Assemble layouts: inherited method entries first, own entries above.
    // Parents assemble before children; results keep declaration order.
    let mut built: HashMap<String, std::rc::Rc<ClassLayout>> = HashMap::new();
    for name in topo_order(program) {
        if let Some(layout) = assemble_layout(&name, &env, runtime, &built, &addresses, &mut errors)
        {
            built.insert(name, layout);
        }
    }
    let results: Vec<_> = unit_names
        .iter()
        .filter_map(|name| built.get(name).cloned())
        .collect();
    if !errors.is_empty() {
        return Err(CompileErrors(errors));
    }

    let mut symbol_addresses = HashMap::new();
    for (symbol, addr) in &addresses {
        symbol_addresses.insert(symbol.clone(), *addr);
    }
    runtime.adopt(results.clone(), unit, symbol_addresses);

    Ok(results)
}

fn import_class_info(layout: &ClassLayout) -> ClassInfo {
    ClassInfo {
        name: layout.name.clone(),
        parent_name: layout.parent_name.clone(),
        lineage: layout.lineage.clone(),
        members: layout.members.clone(),
        total_size: layout.total_size,
        methods: layout
            .methods
            .iter()
            .map(|(name, method)| {
                (
                    name.clone(),
                    MethodInfo {
                        params: method.param_types.clone(),
                        ret: method.return_type.clone(),
                        // The defining class's symbol, so inherited methods
                        // link against the right exported entry.
                        symbol: method.symbol.clone(),
                    },
                )
            })
            .collect(),
        method_order: layout.method_order.clone(),
        is_static: layout.is_static,
    }
}

fn resolve_layout(
    class: &ClassDecl,
    decls: &HashMap<&str, &ClassDecl>,
    env: &mut UnitEnv,
    in_progress: &mut HashSet<String>,
    done: &mut HashSet<String>,
    errors: &mut Vec<CompileError>,
) {
    if done.contains(&class.name) {
        return;
    }
    if in_progress.contains(&class.name) {
        errors.push(CompileError::new(
            CompileErrorKind::UnknownType,
            class.span,
            format!("inheritance cycle through '{}'", class.name),
        ));
        return;
    }

    in_progress.insert(class.name.clone());

    // Parent first: unit-local declaration preferred, then imported.
    let (inherited, mut lineage) = match &class.parent_name {
        Some(parent) => {
            if let Some(decl) = decls.get(parent.as_str()) {
                // Resolve the parent's layout before ours if it is declared
                // in the same unit.
                resolve_layout(decl, decls, env, in_progress, done, errors);
            }
            match env.class(parent) {
                Some(info) => (info.members.clone(), info.lineage.clone()),
                None => {
                    errors.push(CompileError::new(
                        CompileErrorKind::UnknownType,
                        class.span,
                        format!("unknown parent class '{parent}'"),
                    ));
                    (Vec::new(), Vec::new())
                }
            }
        }
        None => (Vec::new(), Vec::new()),
    };
    lineage.insert(0, class.name.clone());

    // Member declarations, with duplicate and type checks.
    let mut seen: HashSet<&str> = inherited.iter().map(|m| m.name.as_str()).collect();
    let mut own = Vec::new();
    for member in &class.members {
        if !seen.insert(&member.name) {
            errors.push(CompileError::new(
                CompileErrorKind::RedeclaredMember,
                member.span,
                format!("member '{}' is declared twice in '{}'", member.name, class.name),
            ));
            continue;
        }
        let ty = QType::from_name(&member.ty.name);
        if let QType::Class(target) = &ty {
            if !env.classes.contains_key(target) && !decls.contains_key(target.as_str()) {
                errors.push(CompileError::new(
                    CompileErrorKind::UnknownType,
                    member.ty.span,
                    format!("unknown type '{target}'"),
                ));
                continue;
            }
        }
        if matches!(ty, QType::Null) {
            errors.push(CompileError::new(
                CompileErrorKind::UnknownType,
                member.ty.span,
                "members cannot be declared null",
            ));
            continue;
        }
        let default = match &member.init {
            Some(expr) => match const_eval(expr, &ty) {
                Ok(value) => Some(value),
                Err(message) => {
                    errors.push(CompileError::new(
                        CompileErrorKind::IncompatibleTypes,
                        member.span,
                        message,
                    ));
                    None
                }
            },
            None => None,
        };
        own.push((member.name.clone(), ty, default));
    }

    let (members, total_size) = compute_member_offsets(&inherited, own);

    in_progress.remove(&class.name);
    done.insert(class.name.clone());
    env.classes.insert(
        class.name.clone(),
        ClassInfo {
            name: class.name.clone(),
            parent_name: class.parent_name.clone(),
            lineage,
            members,
            total_size,
            methods: HashMap::new(),
            method_order: Vec::new(),
            is_static: class.is_static,
        },
    );
}

/// Unit class names with parents before children (non-unit parents ignored).
fn topo_order(program: &Program) -> Vec<String> {
    let unit: HashSet<&str> = program.classes.iter().map(|c| c.name.as_str()).collect();
    let mut order = Vec::new();
    let mut placed = HashSet::new();
    // Bounded by the class count; cycles were already reported in pass 2.
    for _ in 0..program.classes.len() {
        for class in &program.classes {
            if placed.contains(class.name.as_str()) {
                continue;
            }
            let ready = match &class.parent_name {
                Some(parent) => !unit.contains(parent.as_str()) || placed.contains(parent.as_str()),
                None => true,
            };
            if ready {
                placed.insert(class.name.clone());
                order.push(class.name.clone());
            }
        }
    }
    order
}

fn resolve_signatures(class: &ClassDecl, env: &mut UnitEnv, errors: &mut Vec<CompileError>) {
    // Inherited methods come from the parent's flattened table.
    let mut methods: HashMap<String, MethodInfo> = class
        .parent_name
        .as_ref()
        .and_then(|p| env.class(p))
        .map(|p| p.methods.clone())
        .unwrap_or_default();

    let mut order = Vec::new();
    let mut own_names = HashSet::new();
    for method in &class.methods {
        if !own_names.insert(method.name.clone()) {
            errors.push(CompileError::new(
                CompileErrorKind::RedeclaredMethod,
                method.span,
                format!(
                    "method '{}' is declared twice in '{}'",
                    method.name, class.name
                ),
            ));
            continue;
        }
        let mut params = Vec::new();
        for param in &method.params {
            let ty = QType::from_name(&param.ty.name);
            if let QType::Class(target) = &ty {
                if !env.classes.contains_key(target) {
                    errors.push(CompileError::new(
                        CompileErrorKind::UnknownType,
                        param.ty.span,
                        format!("unknown type '{target}'"),
                    ));
                }
            }
            params.push(ty);
        }
        let ret = method
            .return_type
            .as_ref()
            .map(|t| QType::from_name(&t.name))
            .unwrap_or(QType::Null);
        if let QType::Class(target) = &ret {
            if !env.classes.contains_key(target) {
                errors.push(CompileError::new(
                    CompileErrorKind::UnknownType,
                    method.span,
                    format!("unknown type '{target}'"),
                ));
            }
        }
        methods.insert(
            method.name.clone(),
            MethodInfo {
                params,
                ret,
                symbol: mangle(&class.name, &method.name),
            },
        );
        order.push(method.name.clone());
    }

    if let Some(info) = env.classes.get_mut(&class.name) {
        info.methods = methods;
        info.method_order = order;
    }
}

/// Literal (optionally sign-prefixed) member initializers, checked against
/// the declared type.
fn const_eval(expr: &Expr, ty: &QType) -> Result<QValue, String> {
    fn literal(expr: &Expr) -> Option<(Literal, bool)> {
        match expr {
            Expr::Literal { value, .. } => Some((value.clone(), false)),
            Expr::Unary {
                op: UnaryOp::Neg,
                operand,
                ..
            } => match operand.as_ref() {
                Expr::Literal { value, .. } => Some((value.clone(), true)),
                _ => None,
            },
            _ => None,
        }
    }

    let Some((value, negate)) = literal(expr) else {
        return Err("member initializers must be literal constants".to_owned());
    };
    let value = match (value, negate) {
        (Literal::Int32(v), true) => Literal::Int32(-v),
        (Literal::Int64(v), true) => Literal::Int64(-v),
        (Literal::Float32(v), true) => Literal::Float32(-v),
        (Literal::Float64(v), true) => Literal::Float64(-v),
        (other, false) => other,
        _ => return Err("cannot negate a non-numeric initializer".to_owned()),
    };
    let (got, qvalue) = match value {
        Literal::Null => (QType::Null, QValue::Null),
        Literal::Bool(v) => (QType::Bool, QValue::Bool(v)),
        Literal::Int32(v) => (QType::Int32, QValue::Int32(v)),
        Literal::Int64(v) => (QType::Int64, QValue::Int64(v)),
        Literal::Float32(v) => (QType::Float32, QValue::Float32(v)),
        Literal::Float64(v) => (QType::Float64, QValue::Float64(v)),
        Literal::Str(v) => (QType::Str, QValue::Str(v)),
    };
    if got.assignable_to(ty) {
        Ok(qvalue)
    } else {
        Err(format!(
            "initializer of type {got} does not fit member type {ty}"
        ))
    }
}

fn assemble_layout(
    name: &str,
    env: &UnitEnv,
    runtime: &Runtime,
    built: &HashMap<String, std::rc::Rc<ClassLayout>>,
    addresses: &HashMap<String, usize>,
    errors: &mut Vec<CompileError>,
) -> Option<std::rc::Rc<ClassLayout>> {
    let info = env.class(name)?;

    // Start from the parent's runtime table so inherited entries keep their
    // original native entry points.
    let mut methods: HashMap<String, CompiledMethod> = match &info.parent_name {
        Some(parent) => built
            .get(parent)
            .map(|l| l.methods.clone())
            .or_else(|| runtime.class(parent).map(|l| l.methods.clone()))
            .unwrap_or_default(),
        None => HashMap::new(),
    };

    for method_name in &info.method_order {
        let method = &info.methods[method_name];
        let Some(&addr) = addresses.get(&method.symbol) else {
            errors.push(CompileError::new(
                CompileErrorKind::Backend,
                Span::default(),
                format!("missing native entry for {}", method.symbol),
            ));
            continue;
        };
        let entry = unsafe { std::mem::transmute::<usize, abi::RawMethodFn>(addr) };
        methods.insert(
            method_name.clone(),
            CompiledMethod {
                name: method_name.clone(),
                symbol: method.symbol.clone(),
                param_types: method.params.clone(),
                return_type: method.ret.clone(),
                entry,
            },
        );
    }

    Some(std::rc::Rc::new(ClassLayout {
        name: info.name.clone(),
        parent_name: info.parent_name.clone(),
        lineage: info.lineage.clone(),
        members: info.members.clone(),
        total_size: info.total_size,
        methods,
        method_order: info.method_order.clone(),
        is_static: info.is_static,
    }))
}

/// Shared JIT scaffolding handed to the body lowerer.
pub(crate) struct Trampolines {
    pub native_call: FuncId,
    pub str_concat: FuncId,
    pub str_eq: FuncId,
    pub trap: FuncId,
}

fn lower_unit(
    vm: &mut VmState,
    env: &UnitEnv,
    program: &Program,
    exported: &HashMap<String, usize>,
    errors: &mut Vec<CompileError>,
) -> Option<(JitUnit, HashMap<String, usize>)> {
    use cranelift_codegen::{ir::types as ct, ir::AbiParam, settings};

    let mut flag_builder = settings::builder();
    let _ = flag_builder.set("use_colocated_libcalls", "false");
    let _ = flag_builder.set("is_pic", "false");
    let isa = match cranelift_native::builder() {
        Ok(builder) => match builder.finish(settings::Flags::new(flag_builder)) {
            Ok(isa) => isa,
            Err(err) => {
                errors.push(CompileError::new(
                    CompileErrorKind::Backend,
                    Span::default(),
                    format!("backend setup failed: {err}"),
                ));
                return None;
            }
        },
        Err(err) => {
            errors.push(CompileError::new(
                CompileErrorKind::Backend,
                Span::default(),
                format!("host is unsupported by the backend: {err}"),
            ));
            return None;
        }
    };

    let mut jit_builder = JITBuilder::with_isa(isa, default_libcall_names());
    jit_builder.symbol(abi::SYM_NATIVE_CALL, abi::qn_native_call as *const u8);
    jit_builder.symbol(abi::SYM_STR_CONCAT, abi::qn_str_concat as *const u8);
    jit_builder.symbol(abi::SYM_STR_EQ, abi::qn_str_eq as *const u8);
    jit_builder.symbol(abi::SYM_TRAP, abi::qn_trap as *const u8);
    for (symbol, addr) in exported {
        jit_builder.symbol(symbol, *addr as *const u8);
    }
    let mut module = JITModule::new(jit_builder);

    // The uniform method signature: (vm, self, args, ret).
    let mut method_sig = module.make_signature();
    for _ in 0..4 {
        method_sig.params.push(AbiParam::new(ct::I64));
    }

    let trampolines = {
        let mut sig_native = module.make_signature();
        for _ in 0..6 {
            sig_native.params.push(AbiParam::new(ct::I64));
        }
        let mut sig_concat = module.make_signature();
        for _ in 0..5 {
            sig_concat.params.push(AbiParam::new(ct::I64));
        }
        sig_concat.returns.push(AbiParam::new(ct::I64));
        let mut sig_eq = module.make_signature();
        for _ in 0..3 {
            sig_eq.params.push(AbiParam::new(ct::I64));
        }
        sig_eq.returns.push(AbiParam::new(ct::I64));
        let mut sig_trap = module.make_signature();
        for _ in 0..3 {
            sig_trap.params.push(AbiParam::new(ct::I64));
        }

        let declare = |module: &mut JITModule, name: &str, sig, errors: &mut Vec<CompileError>| {
            module
                .declare_function(name, Linkage::Import, sig)
                .map_err(|err| {
                    errors.push(CompileError::new(
                        CompileErrorKind::Backend,
                        Span::default(),
                        format!("declaring {name} failed: {err}"),
                    ))
                })
                .ok()
        };
        Trampolines {
            native_call: declare(&mut module, abi::SYM_NATIVE_CALL, &sig_native, errors)?,
            str_concat: declare(&mut module, abi::SYM_STR_CONCAT, &sig_concat, errors)?,
            str_eq: declare(&mut module, abi::SYM_STR_EQ, &sig_eq, errors)?,
            trap: declare(&mut module, abi::SYM_TRAP, &sig_trap, errors)?,
        }
    };

    // Declare every unit method up front so bodies may reference methods
    // compiled later (forward references).
    let mut func_ids: HashMap<String, FuncId> = HashMap::new();
    for class in &program.classes {
        for method in &class.methods {
            let symbol = mangle(&class.name, &method.name);
            match module.declare_function(&symbol, Linkage::Export, &method_sig) {
                Ok(id) => {
                    func_ids.insert(symbol, id);
                }
                Err(err) => {
                    errors.push(CompileError::new(
                        CompileErrorKind::Backend,
                        method.span,
                        format!("declaring {} failed: {err}", method.name),
                    ));
                }
            }
        }
    }
    if !errors.is_empty() {
        return None;
    }

    // Lower bodies.
    let mut lowerer = lower::UnitLowerer::new(
        &mut module,
        env,
        vm,
        &trampolines,
        func_ids,
        method_sig,
        exported,
    );
    for class in &program.classes {
        let Some(info) = env.class(&class.name) else {
            continue;
        };
        for method in &class.methods {
            lowerer.lower_method(info, method, errors);
        }
    }
    let func_ids = lowerer.into_func_ids();
    if !errors.is_empty() {
        return None;
    }

    if let Err(err) = module.finalize_definitions() {
        errors.push(CompileError::new(
            CompileErrorKind::Backend,
            Span::default(),
            format!("finalizing native code failed: {err}"),
        ));
        return None;
    }

    // Collect finalized entry addresses for unit symbols.
    let mut addresses = HashMap::new();
    for class in &program.classes {
        for method in &class.methods {
            let symbol = mangle(&class.name, &method.name);
            if let Some(&id) = func_ids.get(&symbol) {
                let addr = module.get_finalized_function(id) as usize;
                addresses.insert(symbol, addr);
            }
        }
    }

    Some((JitUnit::new(module), addresses))
}
