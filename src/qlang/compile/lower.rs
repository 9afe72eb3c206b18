//! Method bodies to Cranelift IR.
//!
//! Every compiled method shares the uniform signature `(vm, self, args, ret)`
//! with 8-byte slots; see `qlang::abi`. Member access lowers to loads and
//! stores at the layout's recorded offsets, method calls dispatch directly to
//! the defining class's entry, native calls route through the
//! `qn_native_call` trampoline with tagged slots. Faulting operations (null
//! dereference, integer division by zero) branch to a bail path that records
//! the fault and yields a zero value, so script errors never become host
//! traps.

use {
    super::{ClassInfo, CompileError, CompileErrorKind, Trampolines, UnitEnv},
    crate::qlang::{
        abi::{self, trap, NativeSig, VmState},
        ast::{BinaryOp, Block, Expr, Literal, MethodDecl, Stmt, UnaryOp},
        token::Span,
        types::QType,
    },
    cranelift_codegen::ir::{
        condcodes::{FloatCC, IntCC},
        types as ct, FuncRef, InstBuilder, MemFlags, Signature, StackSlotData, StackSlotKind,
        Type, Value,
    },
    cranelift_entity::EntityRef,
    cranelift_frontend::{FunctionBuilder, FunctionBuilderContext, Variable},
    cranelift_jit::JITModule,
    cranelift_module::{FuncId, Linkage, Module},
    std::collections::HashMap,
};

/// A finalized JIT module pinned for the runtime's lifetime. The executable
/// memory is intentionally never reclaimed while the process runs; method
/// tables point straight into it.
pub struct JitUnit {
    _module: JITModule,
}

impl JitUnit {
    pub(crate) fn new(module: JITModule) -> Self {
        Self { _module: module }
    }
}

impl std::fmt::Debug for JitUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("JitUnit")
    }
}

pub(crate) struct UnitLowerer<'a> {
    module: &'a mut JITModule,
    env: &'a UnitEnv,
    vm: &'a mut VmState,
    trampolines: &'a Trampolines,
    func_ids: HashMap<String, FuncId>,
    method_sig: Signature,
    exported: &'a HashMap<String, usize>,
    /// Resolved native-function ids, shared across the unit's methods.
    natives: HashMap<String, (u64, NativeSig)>,
    ctx: cranelift_codegen::Context,
    fbx: FunctionBuilderContext,
}

impl<'a> UnitLowerer<'a> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        module: &'a mut JITModule,
        env: &'a UnitEnv,
        vm: &'a mut VmState,
        trampolines: &'a Trampolines,
        func_ids: HashMap<String, FuncId>,
        method_sig: Signature,
        exported: &'a HashMap<String, usize>,
    ) -> Self {
        let ctx = module.make_context();
        Self {
            module,
            env,
            vm,
            trampolines,
            func_ids,
            method_sig,
            exported,
            natives: HashMap::new(),
            ctx,
            fbx: FunctionBuilderContext::new(),
        }
    }

    pub(crate) fn into_func_ids(self) -> HashMap<String, FuncId> {
        self.func_ids
    }

    pub(crate) fn lower_method(
        &mut self,
        class: &ClassInfo,
        method: &MethodDecl,
        errors: &mut Vec<CompileError>,
    ) {
        let symbol = format!("{}::{}", class.name, method.name);
        let Some(&func_id) = self.func_ids.get(&symbol) else {
            return;
        };
        let Some(info) = class.methods.get(&method.name) else {
            return;
        };
        let ret_type = info.ret.clone();
        let params = info.params.clone();

        self.module.clear_context(&mut self.ctx);
        self.ctx.func.signature = self.method_sig.clone();

        let error_count = errors.len();
        {
            let builder = FunctionBuilder::new(&mut self.ctx.func, &mut self.fbx);
            let mut lowerer = FnLowerer {
                builder,
                module: &mut *self.module,
                env: self.env,
                vm: &mut *self.vm,
                trampolines: self.trampolines,
                func_ids: &mut self.func_ids,
                natives: &mut self.natives,
                exported: self.exported,
                method_sig: &self.method_sig,
                class,
                ret_type,
                scopes: Vec::new(),
                var_count: 0,
                vm_val: Value::from_u32(0),
                self_val: Value::from_u32(0),
                args_val: Value::from_u32(0),
                ret_val: Value::from_u32(0),
                terminated: false,
                func_refs: HashMap::new(),
                errors,
            };
            lowerer.run(method, &params);
            lowerer.builder.finalize();
        }
        if errors.len() > error_count {
            // Body had type errors; skip definition, the unit will not be
            // registered.
            return;
        }

        if let Err(err) = self.module.define_function(func_id, &mut self.ctx) {
            errors.push(CompileError::new(
                CompileErrorKind::Backend,
                method.span,
                format!("code generation for '{}' failed: {err}", method.name),
            ));
        }
    }
}

fn repr(ty: &QType) -> Type {
    match ty {
        QType::Bool => ct::I8,
        QType::Int32 => ct::I32,
        QType::Float32 => ct::F32,
        QType::Float64 => ct::F64,
        _ => ct::I64,
    }
}

struct FnLowerer<'a, 'f> {
    builder: FunctionBuilder<'f>,
    module: &'a mut JITModule,
    env: &'a UnitEnv,
    vm: &'a mut VmState,
    trampolines: &'a Trampolines,
    func_ids: &'a mut HashMap<String, FuncId>,
    natives: &'a mut HashMap<String, (u64, NativeSig)>,
    exported: &'a HashMap<String, usize>,
    method_sig: &'a Signature,
    class: &'a ClassInfo,
    ret_type: QType,
    scopes: Vec<HashMap<String, (Variable, QType)>>,
    var_count: usize,
    vm_val: Value,
    self_val: Value,
    args_val: Value,
    ret_val: Value,
    terminated: bool,
    func_refs: HashMap<FuncId, FuncRef>,
    errors: &'a mut Vec<CompileError>,
}

impl<'a, 'f> FnLowerer<'a, 'f> {
    fn run(&mut self, method: &MethodDecl, params: &[QType]) {
        let entry = self.builder.create_block();
        self.builder.append_block_params_for_function_params(entry);
        self.builder.switch_to_block(entry);
        self.builder.seal_block(entry);

        let block_params = self.builder.block_params(entry).to_vec();
        self.vm_val = block_params[0];
        self.self_val = block_params[1];
        self.args_val = block_params[2];
        self.ret_val = block_params[3];

        self.scopes.push(HashMap::new());
        for (index, (param, ty)) in method.params.iter().zip(params).enumerate() {
            let slot = self.builder.ins().load(
                ct::I64,
                MemFlags::trusted(),
                self.args_val,
                (index * 8) as i32,
            );
            let value = self.from_slot(slot, ty);
            let var = self.new_var(repr(ty));
            self.builder.def_var(var, value);
            if let Some(scope) = self.scopes.last_mut() {
                scope.insert(param.name.clone(), (var, ty.clone()));
            }
        }

        self.lower_block_stmts(&method.body);

        if !self.terminated {
            self.builder.ins().return_(&[]);
        }
        self.scopes.pop();
    }

    fn new_var(&mut self, ty: Type) -> Variable {
        let var = Variable::new(self.var_count);
        self.var_count += 1;
        self.builder.declare_var(var, ty);
        var
    }

    fn error(&mut self, kind: CompileErrorKind, span: Span, message: impl Into<String>) {
        self.errors.push(CompileError::new(kind, span, message));
    }

    fn func_ref(&mut self, id: FuncId) -> FuncRef {
        if let Some(&func_ref) = self.func_refs.get(&id) {
            return func_ref;
        }
        let func_ref = self.module.declare_func_in_func(id, self.builder.func);
        self.func_refs.insert(id, func_ref);
        func_ref
    }

    fn trampoline_ref(&mut self, which: fn(&Trampolines) -> FuncId) -> FuncRef {
        let id = which(self.trampolines);
        self.func_ref(id)
    }

    /// Resolve a method symbol to a callable FuncId: unit-local first, then
    /// imports from earlier compilations.
    fn method_func_id(&mut self, symbol: &str) -> Option<FuncId> {
        if let Some(&id) = self.func_ids.get(symbol) {
            return Some(id);
        }
        if self.exported.contains_key(symbol) {
            let id = self
                .module
                .declare_function(symbol, Linkage::Import, self.method_sig)
                .ok()?;
            self.func_ids.insert(symbol.to_owned(), id);
            return Some(id);
        }
        None
    }

    // --------------------------------------------------------- conversions

    fn from_slot(&mut self, slot: Value, ty: &QType) -> Value {
        match ty {
            QType::Bool => self.builder.ins().ireduce(ct::I8, slot),
            QType::Int32 => self.builder.ins().ireduce(ct::I32, slot),
            QType::Float32 => {
                let bits = self.builder.ins().ireduce(ct::I32, slot);
                self.builder.ins().bitcast(ct::F32, MemFlags::new(), bits)
            }
            QType::Float64 => self.builder.ins().bitcast(ct::F64, MemFlags::new(), slot),
            _ => slot,
        }
    }

    fn to_slot(&mut self, value: Value, ty: &QType) -> Value {
        match ty {
            QType::Bool => self.builder.ins().uextend(ct::I64, value),
            QType::Int32 => self.builder.ins().sextend(ct::I64, value),
            QType::Float32 => {
                let bits = self.builder.ins().bitcast(ct::I32, MemFlags::new(), value);
                self.builder.ins().uextend(ct::I64, bits)
            }
            QType::Float64 => self.builder.ins().bitcast(ct::I64, MemFlags::new(), value),
            _ => value,
        }
    }

    fn zero(&mut self, ty: &QType) -> Value {
        match ty {
            QType::Bool => self.builder.ins().iconst(ct::I8, 0),
            QType::Int32 => self.builder.ins().iconst(ct::I32, 0),
            QType::Float32 => self.builder.ins().f32const(0.0f32),
            QType::Float64 => self.builder.ins().f64const(0.0f64),
            _ => self.builder.ins().iconst(ct::I64, 0),
        }
    }

    /// Class-aware assignability: the base rules plus subclass-to-parent.
    fn assignable(&self, from: &QType, to: &QType) -> bool {
        if from.assignable_to(to) {
            return true;
        }
        if let (QType::Class(from_name), QType::Class(to_name)) = (from, to) {
            return self
                .env
                .class(from_name)
                .is_some_and(|info| info.lineage.iter().any(|n| n == to_name));
        }
        false
    }

    // --------------------------------------------------------- guard paths

    fn call_trap(&mut self, code: u64, span: Span) {
        let trap_ref = self.trampoline_ref(|t| t.trap);
        let vm = self.vm_val;
        let code = self.builder.ins().iconst(ct::I64, code as i64);
        let line = self.builder.ins().iconst(ct::I64, span.line as i64);
        self.builder.ins().call(trap_ref, &[vm, code, line]);
    }

    /// Branch on `ptr == 0`: the bail path records a null-dereference fault
    /// and produces `zero(result_ty)`; the ok path runs `body` and must
    /// produce a value of the same representation.
    fn guard_null(
        &mut self,
        ptr: Value,
        result_ty: &QType,
        span: Span,
        body: impl FnOnce(&mut Self) -> Value,
    ) -> Value {
        let bail = self.builder.create_block();
        let ok = self.builder.create_block();
        let merge = self.builder.create_block();
        let result = self.builder.append_block_param(merge, repr(result_ty));

        let is_null = self.builder.ins().icmp_imm(IntCC::Equal, ptr, 0);
        self.builder.ins().brif(is_null, bail, &[], ok, &[]);

        self.builder.switch_to_block(bail);
        self.builder.seal_block(bail);
        self.call_trap(trap::NULL_DEREF, span);
        let zero = self.zero(result_ty);
        self.builder.ins().jump(merge, &[zero]);

        self.builder.switch_to_block(ok);
        self.builder.seal_block(ok);
        let value = body(self);
        self.builder.ins().jump(merge, &[value]);

        self.builder.switch_to_block(merge);
        self.builder.seal_block(merge);
        result
    }

    /// Like [`guard_null`] for effects with no produced value.
    fn guard_null_store(
        &mut self,
        ptr: Value,
        span: Span,
        body: impl FnOnce(&mut Self),
    ) {
        let bail = self.builder.create_block();
        let ok = self.builder.create_block();
        let merge = self.builder.create_block();

        let is_null = self.builder.ins().icmp_imm(IntCC::Equal, ptr, 0);
        self.builder.ins().brif(is_null, bail, &[], ok, &[]);

        self.builder.switch_to_block(bail);
        self.builder.seal_block(bail);
        self.call_trap(trap::NULL_DEREF, span);
        self.builder.ins().jump(merge, &[]);

        self.builder.switch_to_block(ok);
        self.builder.seal_block(ok);
        body(self);
        self.builder.ins().jump(merge, &[]);

        self.builder.switch_to_block(merge);
        self.builder.seal_block(merge);
    }

    // ----------------------------------------------------------- statements

    fn lower_block_stmts(&mut self, block: &Block) {
        self.scopes.push(HashMap::new());
        for stmt in &block.stmts {
            if self.terminated {
                // Unreachable code after return; stop emitting.
                break;
            }
            self.lower_stmt(stmt);
        }
        self.scopes.pop();
    }

    fn lower_stmt(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::Block(block) => self.lower_block_stmts(block),
            Stmt::VarDecl {
                name,
                ty,
                init,
                span,
            } => self.lower_var_decl(name, &ty.name, init.as_ref(), *span),
            Stmt::Assign {
                target,
                value,
                span,
            } => self.lower_assign(target, value, *span),
            Stmt::If {
                cond,
                then_block,
                else_block,
                span,
            } => self.lower_if(cond, then_block, else_block.as_ref(), *span),
            Stmt::While { cond, body, span } => self.lower_while(cond, body, *span),
            Stmt::For {
                init,
                cond,
                step,
                body,
                span,
            } => self.lower_for(init.as_deref(), cond.as_ref(), step.as_deref(), body, *span),
            Stmt::Return { value, span } => self.lower_return(value.as_ref(), *span),
            Stmt::Expr { expr, .. } => {
                let _ = self.lower_expr(expr);
            }
        }
    }

    fn lower_var_decl(&mut self, name: &str, ty_name: &str, init: Option<&Expr>, span: Span) {
        let ty = QType::from_name(ty_name);
        if let QType::Class(class_name) = &ty {
            if self.env.class(class_name).is_none() {
                self.error(
                    CompileErrorKind::UnknownType,
                    span,
                    format!("unknown type '{class_name}'"),
                );
                return;
            }
        }
        if self
            .scopes
            .last()
            .is_some_and(|scope| scope.contains_key(name))
        {
            self.error(
                CompileErrorKind::RedeclaredMember,
                span,
                format!("variable '{name}' is declared twice in this scope"),
            );
            return;
        }

        let value = match init {
            Some(expr) => {
                let Some((value, value_ty)) = self.lower_expr(expr) else {
                    return;
                };
                if !self.assignable(&value_ty, &ty) {
                    self.error(
                        CompileErrorKind::IncompatibleTypes,
                        span,
                        format!("cannot initialize {ty} variable '{name}' with {value_ty}"),
                    );
                    return;
                }
                value
            }
            None => self.zero(&ty),
        };
        let var = self.new_var(repr(&ty));
        self.builder.def_var(var, value);
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.to_owned(), (var, ty));
        }
    }

    fn lookup_local(&self, name: &str) -> Option<(Variable, QType)> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.get(name).cloned())
    }

    fn lower_assign(&mut self, target: &Expr, value: &Expr, span: Span) {
        match target {
            Expr::Ident { name, .. } => {
                if let Some((var, var_ty)) = self.lookup_local(name) {
                    let Some((value, value_ty)) = self.lower_expr(value) else {
                        return;
                    };
                    if !self.assignable(&value_ty, &var_ty) {
                        self.error(
                            CompileErrorKind::IncompatibleTypes,
                            span,
                            format!("cannot assign {value_ty} to {var_ty} variable '{name}'"),
                        );
                        return;
                    }
                    self.builder.def_var(var, value);
                } else if self.class.members.iter().any(|m| m.name == *name) {
                    // Bare member name: implicit self.
                    let base = self.self_val;
                    let class_name = self.class.name.clone();
                    self.store_member(base, &class_name, name, value, span, false);
                } else {
                    self.error(
                        CompileErrorKind::UnknownMember,
                        span,
                        format!("unknown variable '{name}'"),
                    );
                }
            }
            Expr::Member { base, member, .. } => {
                let Some((base_value, base_ty)) = self.lower_expr(base) else {
                    return;
                };
                let QType::Class(class_name) = base_ty else {
                    self.error(
                        CompileErrorKind::IncompatibleTypes,
                        span,
                        format!("member assignment on non-class value of type {base_ty}"),
                    );
                    return;
                };
                let guard = !matches!(base.as_ref(), Expr::Ident { name, .. } if name == "self");
                self.store_member(base_value, &class_name, member, value, span, guard);
            }
            _ => self.error(
                CompileErrorKind::IncompatibleTypes,
                span,
                "invalid assignment target",
            ),
        }
    }

    fn store_member(
        &mut self,
        base: Value,
        class_name: &str,
        member_name: &str,
        value: &Expr,
        span: Span,
        guard: bool,
    ) {
        let Some(info) = self.env.class(class_name) else {
            self.error(
                CompileErrorKind::UnknownType,
                span,
                format!("unknown type '{class_name}'"),
            );
            return;
        };
        let Some(member) = info.members.iter().find(|m| m.name == member_name).cloned() else {
            self.error(
                CompileErrorKind::UnknownMember,
                span,
                format!("class '{class_name}' has no member '{member_name}'"),
            );
            return;
        };
        let Some((value, value_ty)) = self.lower_expr(value) else {
            return;
        };
        if !self.assignable(&value_ty, &member.ty) {
            self.error(
                CompileErrorKind::IncompatibleTypes,
                span,
                format!(
                    "cannot assign {value_ty} to member '{member_name}' of type {}",
                    member.ty
                ),
            );
            return;
        }
        let offset = member.offset as i32;
        let store = move |this: &mut Self| {
            this.builder
                .ins()
                .store(MemFlags::trusted(), value, base, offset);
        };
        if guard {
            self.guard_null_store(base, span, store);
        } else {
            store(self);
        }
    }

    fn lower_if(
        &mut self,
        cond: &Expr,
        then_block: &Block,
        else_block: Option<&Block>,
        span: Span,
    ) {
        let Some(cond) = self.lower_bool(cond, span) else {
            return;
        };
        let then_blk = self.builder.create_block();
        let else_blk = self.builder.create_block();
        let merge = self.builder.create_block();

        self.builder.ins().brif(cond, then_blk, &[], else_blk, &[]);

        self.builder.switch_to_block(then_blk);
        self.builder.seal_block(then_blk);
        self.terminated = false;
        self.lower_block_stmts(then_block);
        if !self.terminated {
            self.builder.ins().jump(merge, &[]);
        }
        let then_terminated = self.terminated;

        self.builder.switch_to_block(else_blk);
        self.builder.seal_block(else_blk);
        self.terminated = false;
        if let Some(else_block) = else_block {
            self.lower_block_stmts(else_block);
        }
        if !self.terminated {
            self.builder.ins().jump(merge, &[]);
        }
        let else_terminated = self.terminated;

        self.builder.switch_to_block(merge);
        self.builder.seal_block(merge);
        self.terminated = then_terminated && else_terminated;
        if self.terminated {
            // Merge block is unreachable but must still be filled.
            self.builder.ins().return_(&[]);
            self.terminated = true;
        }
    }

    fn lower_while(&mut self, cond: &Expr, body: &Block, span: Span) {
        let header = self.builder.create_block();
        let body_blk = self.builder.create_block();
        let exit = self.builder.create_block();

        self.builder.ins().jump(header, &[]);
        self.builder.switch_to_block(header);
        let Some(cond) = self.lower_bool(cond, span) else {
            // Keep the CFG well-formed even on a type error.
            self.builder.ins().jump(exit, &[]);
            self.builder.seal_block(header);
            self.builder.switch_to_block(body_blk);
            self.builder.seal_block(body_blk);
            self.builder.ins().jump(exit, &[]);
            self.builder.switch_to_block(exit);
            self.builder.seal_block(exit);
            return;
        };
        self.builder.ins().brif(cond, body_blk, &[], exit, &[]);

        self.builder.switch_to_block(body_blk);
        self.builder.seal_block(body_blk);
        self.terminated = false;
        self.lower_block_stmts(body);
        if !self.terminated {
            self.builder.ins().jump(header, &[]);
        }
        self.builder.seal_block(header);

        self.builder.switch_to_block(exit);
        self.builder.seal_block(exit);
        self.terminated = false;
    }

    fn lower_for(
        &mut self,
        init: Option<&Stmt>,
        cond: Option<&Expr>,
        step: Option<&Stmt>,
        body: &Block,
        span: Span,
    ) {
        self.scopes.push(HashMap::new());
        if let Some(init) = init {
            self.lower_stmt(init);
        }

        let header = self.builder.create_block();
        let body_blk = self.builder.create_block();
        let exit = self.builder.create_block();

        self.builder.ins().jump(header, &[]);
        self.builder.switch_to_block(header);
        let cond_value = match cond {
            Some(cond) => self.lower_bool(cond, span),
            None => Some(self.builder.ins().iconst(ct::I8, 1)),
        };
        let Some(cond_value) = cond_value else {
            self.builder.ins().jump(exit, &[]);
            self.builder.seal_block(header);
            self.builder.switch_to_block(body_blk);
            self.builder.seal_block(body_blk);
            self.builder.ins().jump(exit, &[]);
            self.builder.switch_to_block(exit);
            self.builder.seal_block(exit);
            self.scopes.pop();
            return;
        };
        self.builder.ins().brif(cond_value, body_blk, &[], exit, &[]);

        self.builder.switch_to_block(body_blk);
        self.builder.seal_block(body_blk);
        self.terminated = false;
        self.lower_block_stmts(body);
        if !self.terminated {
            if let Some(step) = step {
                self.lower_stmt(step);
            }
            self.builder.ins().jump(header, &[]);
        }
        self.builder.seal_block(header);

        self.builder.switch_to_block(exit);
        self.builder.seal_block(exit);
        self.terminated = false;
        self.scopes.pop();
    }

    fn lower_return(&mut self, value: Option<&Expr>, span: Span) {
        match (&self.ret_type.clone(), value) {
            (QType::Null, None) => {}
            (QType::Null, Some(_)) => {
                self.error(
                    CompileErrorKind::ReturnTypeMismatch,
                    span,
                    "method declares no return type but returns a value",
                );
                return;
            }
            (ret_ty, Some(expr)) => {
                let Some((value, value_ty)) = self.lower_expr(expr) else {
                    return;
                };
                if !self.assignable(&value_ty, ret_ty) {
                    self.error(
                        CompileErrorKind::ReturnTypeMismatch,
                        span,
                        format!("method returns {ret_ty}, got {value_ty}"),
                    );
                    return;
                }
                let ret_ty = ret_ty.clone();
                let slot = self.to_slot(value, &ret_ty);
                self.builder
                    .ins()
                    .store(MemFlags::trusted(), slot, self.ret_val, 0);
            }
            (ret_ty, None) => {
                self.error(
                    CompileErrorKind::ReturnTypeMismatch,
                    span,
                    format!("method returns {ret_ty} but returns no value"),
                );
                return;
            }
        }
        self.builder.ins().return_(&[]);
        self.terminated = true;
    }

    fn lower_bool(&mut self, expr: &Expr, span: Span) -> Option<Value> {
        let (value, ty) = self.lower_expr(expr)?;
        if ty != QType::Bool {
            self.error(
                CompileErrorKind::IncompatibleTypes,
                span,
                format!("condition must be bool, got {ty}"),
            );
            return None;
        }
        Some(value)
    }

    // ---------------------------------------------------------- expressions

    fn lower_expr(&mut self, expr: &Expr) -> Option<(Value, QType)> {
        match expr {
            Expr::Literal { value, .. } => Some(self.lower_literal(value)),
            Expr::Ident { name, span } => self.lower_ident(name, *span),
            Expr::Member { base, member, span } => self.lower_member(base, member, *span),
            Expr::Call {
                base,
                name,
                args,
                span,
            } => self.lower_call(base.as_deref(), name, args, *span),
            Expr::Binary { op, lhs, rhs, span } => self.lower_binary(*op, lhs, rhs, *span),
            Expr::Unary { op, operand, span } => self.lower_unary(*op, operand, *span),
            Expr::Cast { ty, operand, span } => self.lower_cast(&ty.name, operand, *span),
        }
    }

    fn lower_literal(&mut self, literal: &Literal) -> (Value, QType) {
        match literal {
            Literal::Null => (self.builder.ins().iconst(ct::I64, 0), QType::Null),
            Literal::Bool(v) => (
                self.builder.ins().iconst(ct::I8, *v as i64),
                QType::Bool,
            ),
            Literal::Int32(v) => (
                self.builder.ins().iconst(ct::I32, *v as i64),
                QType::Int32,
            ),
            Literal::Int64(v) => (self.builder.ins().iconst(ct::I64, *v), QType::Int64),
            Literal::Float32(v) => (self.builder.ins().f32const(*v), QType::Float32),
            Literal::Float64(v) => (self.builder.ins().f64const(*v), QType::Float64),
            Literal::Str(text) => {
                let handle = self.vm.strings.intern(text);
                (
                    self.builder.ins().iconst(ct::I64, handle as i64),
                    QType::Str,
                )
            }
        }
    }

    fn lower_ident(&mut self, name: &str, span: Span) -> Option<(Value, QType)> {
        if name == "self" {
            return Some((self.self_val, QType::Class(self.class.name.clone())));
        }
        if let Some((var, ty)) = self.lookup_local(name) {
            return Some((self.builder.use_var(var), ty));
        }
        // Bare member name: implicit self.
        if let Some(member) = self.class.members.iter().find(|m| m.name == name).cloned() {
            let base = self.self_val;
            let loaded = self.builder.ins().load(
                repr(&member.ty),
                MemFlags::trusted(),
                base,
                member.offset as i32,
            );
            return Some((loaded, member.ty));
        }
        self.error(
            CompileErrorKind::UnknownMember,
            span,
            format!("unknown variable '{name}'"),
        );
        None
    }

    fn lower_member(&mut self, base: &Expr, member_name: &str, span: Span) -> Option<(Value, QType)> {
        let (base_value, base_ty) = self.lower_expr(base)?;
        let QType::Class(class_name) = base_ty else {
            self.error(
                CompileErrorKind::IncompatibleTypes,
                span,
                format!("member access on non-class value of type {base_ty}"),
            );
            return None;
        };
        let Some(info) = self.env.class(&class_name) else {
            self.error(
                CompileErrorKind::UnknownType,
                span,
                format!("unknown type '{class_name}'"),
            );
            return None;
        };
        let Some(member) = info.members.iter().find(|m| m.name == member_name).cloned() else {
            self.error(
                CompileErrorKind::UnknownMember,
                span,
                format!("class '{class_name}' has no member '{member_name}'"),
            );
            return None;
        };

        let is_self = matches!(base, Expr::Ident { name, .. } if name == "self");
        let offset = member.offset as i32;
        let member_repr = repr(&member.ty);
        let value = if is_self {
            self.builder
                .ins()
                .load(member_repr, MemFlags::trusted(), base_value, offset)
        } else {
            self.guard_null(base_value, &member.ty, span, |this| {
                this.builder
                    .ins()
                    .load(member_repr, MemFlags::trusted(), base_value, offset)
            })
        };
        Some((value, member.ty))
    }

    fn lower_call(
        &mut self,
        base: Option<&Expr>,
        name: &str,
        args: &[Expr],
        span: Span,
    ) -> Option<(Value, QType)> {
        match base {
            Some(base) => {
                let (base_value, base_ty) = self.lower_expr(base)?;
                let QType::Class(class_name) = base_ty else {
                    self.error(
                        CompileErrorKind::IncompatibleTypes,
                        span,
                        format!("method call on non-class value of type {base_ty}"),
                    );
                    return None;
                };
                let guard = !matches!(base, Expr::Ident { name, .. } if name == "self");
                self.lower_method_call(base_value, &class_name, name, args, span, guard)
            }
            None => {
                // Methods of the current class shadow native functions.
                if self.class.methods.contains_key(name) {
                    let base = self.self_val;
                    let class_name = self.class.name.clone();
                    return self.lower_method_call(base, &class_name, name, args, span, false);
                }
                self.lower_native_call(name, args, span)
            }
        }
    }

    fn lower_method_call(
        &mut self,
        base: Value,
        class_name: &str,
        method_name: &str,
        args: &[Expr],
        span: Span,
        guard: bool,
    ) -> Option<(Value, QType)> {
        let Some(info) = self.env.class(class_name) else {
            self.error(
                CompileErrorKind::UnknownType,
                span,
                format!("unknown type '{class_name}'"),
            );
            return None;
        };
        let Some(method) = info.methods.get(method_name).cloned() else {
            self.error(
                CompileErrorKind::UnknownMethod,
                span,
                format!("class '{class_name}' has no method '{method_name}'"),
            );
            return None;
        };
        if args.len() != method.params.len() {
            self.error(
                CompileErrorKind::ArityMismatch,
                span,
                format!(
                    "'{method_name}' takes {} argument(s), {} given",
                    method.params.len(),
                    args.len()
                ),
            );
            return None;
        }

        let mut slots = Vec::with_capacity(args.len());
        for (arg, param_ty) in args.iter().zip(method.params.iter()) {
            let (value, value_ty) = self.lower_expr(arg)?;
            if !self.assignable(&value_ty, param_ty) {
                self.error(
                    CompileErrorKind::IncompatibleTypes,
                    arg.span(),
                    format!("argument expects {param_ty}, got {value_ty}"),
                );
                return None;
            }
            slots.push(self.to_slot(value, param_ty));
        }

        let Some(func_id) = self.method_func_id(&method.symbol) else {
            self.error(
                CompileErrorKind::UnknownMethod,
                span,
                format!("no native entry for '{}'", method.symbol),
            );
            return None;
        };

        let args_slot = self.builder.create_sized_stack_slot(StackSlotData::new(
            StackSlotKind::ExplicitSlot,
            (slots.len().max(1) * 8) as u32,
            3,
        ));
        for (index, slot) in slots.iter().enumerate() {
            self.builder
                .ins()
                .stack_store(*slot, args_slot, (index * 8) as i32);
        }
        let ret_slot = self.builder.create_sized_stack_slot(StackSlotData::new(
            StackSlotKind::ExplicitSlot,
            8,
            3,
        ));
        let zero64 = self.builder.ins().iconst(ct::I64, 0);
        self.builder.ins().stack_store(zero64, ret_slot, 0);

        let func_ref = self.func_ref(func_id);
        let vm = self.vm_val;
        let args_ptr = self.builder.ins().stack_addr(ct::I64, args_slot, 0);
        let ret_ptr = self.builder.ins().stack_addr(ct::I64, ret_slot, 0);

        let ret_ty = method.ret.clone();
        let emit_call = move |this: &mut Self| {
            this.builder
                .ins()
                .call(func_ref, &[vm, base, args_ptr, ret_ptr]);
            let raw = this.builder.ins().stack_load(ct::I64, ret_slot, 0);
            this.from_slot(raw, &ret_ty)
        };

        let value = if guard {
            let ret_ty = method.ret.clone();
            self.guard_null(base, &ret_ty, span, emit_call)
        } else {
            emit_call(self)
        };
        Some((value, method.ret))
    }

    fn lower_native_call(
        &mut self,
        name: &str,
        args: &[Expr],
        span: Span,
    ) -> Option<(Value, QType)> {
        let (native_id, sig) = match self.natives.get(name) {
            Some((id, sig)) => (*id, sig.clone()),
            None => {
                let Some((func, sig)) = self.vm.context.lookup_func(name) else {
                    self.error(
                        CompileErrorKind::UnknownFunction,
                        span,
                        format!("unknown function '{name}'"),
                    );
                    return None;
                };
                let id = self.vm.natives.len() as u64;
                self.vm.natives.push(abi::NativeEntry {
                    name: name.to_owned(),
                    sig: sig.clone(),
                    func,
                });
                self.natives.insert(name.to_owned(), (id, sig.clone()));
                (id, sig)
            }
        };

        if let Some(params) = &sig.params {
            if args.len() != params.len() {
                self.error(
                    CompileErrorKind::ArityMismatch,
                    span,
                    format!(
                        "'{name}' takes {} argument(s), {} given",
                        params.len(),
                        args.len()
                    ),
                );
                return None;
            }
        }

        let mut lowered = Vec::with_capacity(args.len());
        for (index, arg) in args.iter().enumerate() {
            let (value, value_ty) = self.lower_expr(arg)?;
            if let Some(params) = &sig.params {
                if !self.assignable(&value_ty, &params[index]) {
                    self.error(
                        CompileErrorKind::IncompatibleTypes,
                        arg.span(),
                        format!("argument expects {}, got {value_ty}", params[index]),
                    );
                    return None;
                }
            }
            let slot = self.to_slot(value, &value_ty);
            lowered.push((abi::type_tag(&value_ty), slot));
        }

        let argv_slot = self.builder.create_sized_stack_slot(StackSlotData::new(
            StackSlotKind::ExplicitSlot,
            (lowered.len().max(1) * 16) as u32,
            3,
        ));
        for (index, (tag_value, slot)) in lowered.iter().enumerate() {
            let tag_const = self.builder.ins().iconst(ct::I64, *tag_value as i64);
            self.builder
                .ins()
                .stack_store(tag_const, argv_slot, (index * 16) as i32);
            self.builder
                .ins()
                .stack_store(*slot, argv_slot, (index * 16 + 8) as i32);
        }
        let ret_slot = self.builder.create_sized_stack_slot(StackSlotData::new(
            StackSlotKind::ExplicitSlot,
            8,
            3,
        ));

        let native_ref = self.trampoline_ref(|t| t.native_call);
        let vm = self.vm_val;
        let id_const = self.builder.ins().iconst(ct::I64, native_id as i64);
        let argv_ptr = self.builder.ins().stack_addr(ct::I64, argv_slot, 0);
        let argc_const = self.builder.ins().iconst(ct::I64, args.len() as i64);
        let expect_tag = self
            .builder
            .ins()
            .iconst(ct::I64, abi::type_tag(&sig.ret) as i64);
        let ret_ptr = self.builder.ins().stack_addr(ct::I64, ret_slot, 0);
        self.builder.ins().call(
            native_ref,
            &[vm, id_const, argv_ptr, argc_const, expect_tag, ret_ptr],
        );

        let raw = self.builder.ins().stack_load(ct::I64, ret_slot, 0);
        let value = self.from_slot(raw, &sig.ret);
        Some((value, sig.ret))
    }

    fn lower_binary(
        &mut self,
        op: BinaryOp,
        lhs: &Expr,
        rhs: &Expr,
        span: Span,
    ) -> Option<(Value, QType)> {
        // Short-circuit logic before evaluating the right side.
        if matches!(op, BinaryOp::And | BinaryOp::Or) {
            return self.lower_logic(op, lhs, rhs, span);
        }

        let (lhs_value, lhs_ty) = self.lower_expr(lhs)?;

        // String + coerces either operand.
        if op == BinaryOp::Add {
            let rhs_probe = self.probe_type(rhs);
            if lhs_ty == QType::Str || rhs_probe == Some(QType::Str) {
                let (rhs_value, rhs_ty) = self.lower_expr(rhs)?;
                return self.lower_concat(lhs_value, &lhs_ty, rhs_value, &rhs_ty);
            }
        }

        let (rhs_value, rhs_ty) = self.lower_expr(rhs)?;

        match op {
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => {
                self.lower_arith(op, lhs_value, &lhs_ty, rhs_value, &rhs_ty, span)
            }
            BinaryOp::Eq
            | BinaryOp::NotEq
            | BinaryOp::Less
            | BinaryOp::LessEq
            | BinaryOp::Greater
            | BinaryOp::GreaterEq => {
                self.lower_compare(op, lhs_value, &lhs_ty, rhs_value, &rhs_ty, span)
            }
            BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
        }
    }

    /// Static type of an expression without emitting code; only precise for
    /// the cases string-concat dispatch cares about.
    fn probe_type(&mut self, expr: &Expr) -> Option<QType> {
        match expr {
            Expr::Literal { value, .. } => Some(match value {
                Literal::Null => QType::Null,
                Literal::Bool(_) => QType::Bool,
                Literal::Int32(_) => QType::Int32,
                Literal::Int64(_) => QType::Int64,
                Literal::Float32(_) => QType::Float32,
                Literal::Float64(_) => QType::Float64,
                Literal::Str(_) => QType::Str,
            }),
            Expr::Ident { name, .. } => {
                if name == "self" {
                    return Some(QType::Class(self.class.name.clone()));
                }
                self.lookup_local(name)
                    .map(|(_, ty)| ty)
                    .or_else(|| {
                        self.class
                            .members
                            .iter()
                            .find(|m| m.name == *name)
                            .map(|m| m.ty.clone())
                    })
            }
            _ => None,
        }
    }

    fn lower_concat(
        &mut self,
        lhs: Value,
        lhs_ty: &QType,
        rhs: Value,
        rhs_ty: &QType,
    ) -> Option<(Value, QType)> {
        let lhs_slot = self.to_slot(lhs, lhs_ty);
        let rhs_slot = self.to_slot(rhs, rhs_ty);
        let concat_ref = self.trampoline_ref(|t| t.str_concat);
        let vm = self.vm_val;
        let lhs_tag = self
            .builder
            .ins()
            .iconst(ct::I64, abi::type_tag(lhs_ty) as i64);
        let rhs_tag = self
            .builder
            .ins()
            .iconst(ct::I64, abi::type_tag(rhs_ty) as i64);
        let call = self
            .builder
            .ins()
            .call(concat_ref, &[vm, lhs_tag, lhs_slot, rhs_tag, rhs_slot]);
        let handle = self.builder.inst_results(call)[0];
        Some((handle, QType::Str))
    }

    fn lower_arith(
        &mut self,
        op: BinaryOp,
        lhs: Value,
        lhs_ty: &QType,
        rhs: Value,
        rhs_ty: &QType,
        span: Span,
    ) -> Option<(Value, QType)> {
        if !lhs_ty.is_numeric() || lhs_ty != rhs_ty {
            self.error(
                CompileErrorKind::IncompatibleTypes,
                span,
                format!("arithmetic requires matching numeric types, got {lhs_ty} and {rhs_ty}"),
            );
            return None;
        }
        let value = if lhs_ty.is_integer() {
            match op {
                BinaryOp::Add => self.builder.ins().iadd(lhs, rhs),
                BinaryOp::Sub => self.builder.ins().isub(lhs, rhs),
                BinaryOp::Mul => self.builder.ins().imul(lhs, rhs),
                BinaryOp::Div | BinaryOp::Rem => self.guarded_div(op, lhs, rhs, lhs_ty, span),
                _ => unreachable!(),
            }
        } else {
            match op {
                BinaryOp::Add => self.builder.ins().fadd(lhs, rhs),
                BinaryOp::Sub => self.builder.ins().fsub(lhs, rhs),
                BinaryOp::Mul => self.builder.ins().fmul(lhs, rhs),
                BinaryOp::Div => self.builder.ins().fdiv(lhs, rhs),
                BinaryOp::Rem => {
                    self.error(
                        CompileErrorKind::IncompatibleTypes,
                        span,
                        "'%' requires integer operands",
                    );
                    return None;
                }
                _ => unreachable!(),
            }
        };
        Some((value, lhs_ty.clone()))
    }

    fn guarded_div(
        &mut self,
        op: BinaryOp,
        lhs: Value,
        rhs: Value,
        ty: &QType,
        span: Span,
    ) -> Value {
        let bail = self.builder.create_block();
        let ok = self.builder.create_block();
        let merge = self.builder.create_block();
        let result = self.builder.append_block_param(merge, repr(ty));

        let is_zero = self.builder.ins().icmp_imm(IntCC::Equal, rhs, 0);
        self.builder.ins().brif(is_zero, bail, &[], ok, &[]);

        self.builder.switch_to_block(bail);
        self.builder.seal_block(bail);
        self.call_trap(trap::DIV_BY_ZERO, span);
        let zero = self.zero(ty);
        self.builder.ins().jump(merge, &[zero]);

        self.builder.switch_to_block(ok);
        self.builder.seal_block(ok);
        let value = match op {
            BinaryOp::Div => self.builder.ins().sdiv(lhs, rhs),
            _ => self.builder.ins().srem(lhs, rhs),
        };
        self.builder.ins().jump(merge, &[value]);

        self.builder.switch_to_block(merge);
        self.builder.seal_block(merge);
        result
    }

    fn lower_compare(
        &mut self,
        op: BinaryOp,
        lhs: Value,
        lhs_ty: &QType,
        rhs: Value,
        rhs_ty: &QType,
        span: Span,
    ) -> Option<(Value, QType)> {
        let equality = matches!(op, BinaryOp::Eq | BinaryOp::NotEq);

        // null comparisons against pointer-like values.
        if equality && (*lhs_ty == QType::Null || *rhs_ty == QType::Null) {
            let (target, target_ty) = if *lhs_ty == QType::Null {
                (rhs, rhs_ty)
            } else {
                (lhs, lhs_ty)
            };
            if *target_ty == QType::Null {
                let value = self
                    .builder
                    .ins()
                    .iconst(ct::I8, (op == BinaryOp::Eq) as i64);
                return Some((value, QType::Bool));
            }
            if !target_ty.is_pointer() && *target_ty != QType::Str {
                self.error(
                    CompileErrorKind::IncompatibleTypes,
                    span,
                    format!("cannot compare {target_ty} against null"),
                );
                return None;
            }
            let cc = if op == BinaryOp::Eq {
                IntCC::Equal
            } else {
                IntCC::NotEqual
            };
            let value = self.builder.ins().icmp_imm(cc, target, 0);
            return Some((value, QType::Bool));
        }

        if equality && *lhs_ty == QType::Str && *rhs_ty == QType::Str {
            let eq_ref = self.trampoline_ref(|t| t.str_eq);
            let vm = self.vm_val;
            let call = self.builder.ins().call(eq_ref, &[vm, lhs, rhs]);
            let raw = self.builder.inst_results(call)[0];
            let mut value = self.builder.ins().ireduce(ct::I8, raw);
            if op == BinaryOp::NotEq {
                value = self.builder.ins().bxor_imm(value, 1);
            }
            return Some((value, QType::Bool));
        }

        if equality && lhs_ty.is_pointer() && rhs_ty.is_pointer() {
            let cc = if op == BinaryOp::Eq {
                IntCC::Equal
            } else {
                IntCC::NotEqual
            };
            let value = self.builder.ins().icmp(cc, lhs, rhs);
            return Some((value, QType::Bool));
        }

        if equality && *lhs_ty == QType::Bool && *rhs_ty == QType::Bool {
            let cc = if op == BinaryOp::Eq {
                IntCC::Equal
            } else {
                IntCC::NotEqual
            };
            let value = self.builder.ins().icmp(cc, lhs, rhs);
            return Some((value, QType::Bool));
        }

        if !lhs_ty.is_numeric() || lhs_ty != rhs_ty {
            self.error(
                CompileErrorKind::IncompatibleTypes,
                span,
                format!("cannot compare {lhs_ty} with {rhs_ty}"),
            );
            return None;
        }

        let value = if lhs_ty.is_integer() {
            let cc = match op {
                BinaryOp::Eq => IntCC::Equal,
                BinaryOp::NotEq => IntCC::NotEqual,
                BinaryOp::Less => IntCC::SignedLessThan,
                BinaryOp::LessEq => IntCC::SignedLessThanOrEqual,
                BinaryOp::Greater => IntCC::SignedGreaterThan,
                BinaryOp::GreaterEq => IntCC::SignedGreaterThanOrEqual,
                _ => unreachable!(),
            };
            self.builder.ins().icmp(cc, lhs, rhs)
        } else {
            let cc = match op {
                BinaryOp::Eq => FloatCC::Equal,
                BinaryOp::NotEq => FloatCC::NotEqual,
                BinaryOp::Less => FloatCC::LessThan,
                BinaryOp::LessEq => FloatCC::LessThanOrEqual,
                BinaryOp::Greater => FloatCC::GreaterThan,
                BinaryOp::GreaterEq => FloatCC::GreaterThanOrEqual,
                _ => unreachable!(),
            };
            self.builder.ins().fcmp(cc, lhs, rhs)
        };
        Some((value, QType::Bool))
    }

    fn lower_logic(
        &mut self,
        op: BinaryOp,
        lhs: &Expr,
        rhs: &Expr,
        span: Span,
    ) -> Option<(Value, QType)> {
        let lhs_value = self.lower_bool(lhs, span)?;

        let rhs_blk = self.builder.create_block();
        let merge = self.builder.create_block();
        let result = self.builder.append_block_param(merge, ct::I8);

        let short = self
            .builder
            .ins()
            .iconst(ct::I8, (op == BinaryOp::Or) as i64);
        match op {
            BinaryOp::And => {
                self.builder
                    .ins()
                    .brif(lhs_value, rhs_blk, &[], merge, &[short]);
            }
            _ => {
                self.builder
                    .ins()
                    .brif(lhs_value, merge, &[short], rhs_blk, &[]);
            }
        }

        self.builder.switch_to_block(rhs_blk);
        self.builder.seal_block(rhs_blk);
        let rhs_value = match self.lower_bool(rhs, span) {
            Some(v) => v,
            None => self.builder.ins().iconst(ct::I8, 0),
        };
        self.builder.ins().jump(merge, &[rhs_value]);

        self.builder.switch_to_block(merge);
        self.builder.seal_block(merge);
        Some((result, QType::Bool))
    }

    fn lower_unary(&mut self, op: UnaryOp, operand: &Expr, span: Span) -> Option<(Value, QType)> {
        let (value, ty) = self.lower_expr(operand)?;
        match op {
            UnaryOp::Neg => {
                if !ty.is_numeric() {
                    self.error(
                        CompileErrorKind::IncompatibleTypes,
                        span,
                        format!("cannot negate {ty}"),
                    );
                    return None;
                }
                let value = if ty.is_integer() {
                    self.builder.ins().ineg(value)
                } else {
                    self.builder.ins().fneg(value)
                };
                Some((value, ty))
            }
            UnaryOp::Not => {
                if ty != QType::Bool {
                    self.error(
                        CompileErrorKind::IncompatibleTypes,
                        span,
                        format!("'!' requires bool, got {ty}"),
                    );
                    return None;
                }
                let value = self.builder.ins().bxor_imm(value, 1);
                Some((value, QType::Bool))
            }
        }
    }

    fn lower_cast(&mut self, ty_name: &str, operand: &Expr, span: Span) -> Option<(Value, QType)> {
        let target = QType::from_name(ty_name);
        let (value, source) = self.lower_expr(operand)?;
        if !target.is_numeric() || !source.is_numeric() {
            self.error(
                CompileErrorKind::IncompatibleTypes,
                span,
                format!("cast supports numeric conversions only, got {source} to {target}"),
            );
            return None;
        }
        if source == target {
            return Some((value, target));
        }
        let value = match (&source, &target) {
            (QType::Int32, QType::Int64) => self.builder.ins().sextend(ct::I64, value),
            (QType::Int64, QType::Int32) => self.builder.ins().ireduce(ct::I32, value),
            (QType::Int32, QType::Float32) => self.builder.ins().fcvt_from_sint(ct::F32, value),
            (QType::Int32, QType::Float64) => self.builder.ins().fcvt_from_sint(ct::F64, value),
            (QType::Int64, QType::Float32) => self.builder.ins().fcvt_from_sint(ct::F32, value),
            (QType::Int64, QType::Float64) => self.builder.ins().fcvt_from_sint(ct::F64, value),
            (QType::Float32, QType::Int32) => self.builder.ins().fcvt_to_sint_sat(ct::I32, value),
            (QType::Float32, QType::Int64) => self.builder.ins().fcvt_to_sint_sat(ct::I64, value),
            (QType::Float64, QType::Int32) => self.builder.ins().fcvt_to_sint_sat(ct::I32, value),
            (QType::Float64, QType::Int64) => self.builder.ins().fcvt_to_sint_sat(ct::I64, value),
            (QType::Float32, QType::Float64) => self.builder.ins().fpromote(ct::F64, value),
            (QType::Float64, QType::Float32) => self.builder.ins().fdemote(ct::F32, value),
            _ => unreachable!("numeric pairs covered"),
        };
        Some((value, target))
    }
}
