//! End-to-end scripting tests: source through the JIT to live instances.

use {
    qengine::{
        qlang::{
            abi::RuntimeError,
            compile, lexer,
            module::{load_module, save_module, ModuleData, ModuleError},
            parser, Context, Diagnostics, QType, QValue, Runtime, ScriptHost,
        },
        scene::{script, SceneGraph},
    },
    std::rc::Rc,
};

fn compile_into(runtime: &mut Runtime, source: &str) -> qengine::qlang::ast::Program {
    let mut diags = Diagnostics::new();
    let tokens = lexer::tokenize(source, &mut diags);
    assert!(!diags.has_errors(), "lex errors in test source");
    let program = parser::parse(&tokens, &mut diags);
    assert!(!diags.has_errors(), "parse errors in test source");
    compile::compile_and_register(runtime, &program).expect("compile");
    program
}

fn fresh_runtime() -> Runtime {
    Runtime::new(Rc::new(Context::root("test")))
}

#[test]
fn class_with_two_floats_layout_and_defaults() {
    let mut runtime = fresh_runtime();
    compile_into(&mut runtime, "class Foo { float32 x = 1.5f; float32 y; }");

    let layout = runtime.class("Foo").expect("Foo registered").clone();
    assert_eq!(layout.members.len(), 2);
    assert_eq!(layout.members[0].name, "x");
    assert_eq!(layout.members[0].offset, 0);
    assert_eq!(layout.members[1].name, "y");
    assert_eq!(layout.members[1].offset, 4);
    assert_eq!(layout.total_size, 8);

    let instance = runtime.create_instance("Foo").unwrap();
    assert_eq!(
        runtime.member(&instance, "x").unwrap().as_f32(),
        Some(1.5)
    );
    assert_eq!(runtime.member(&instance, "y").unwrap().as_f32(), Some(0.0));
}

#[test]
fn inheritance_keeps_parent_offsets() {
    let mut runtime = fresh_runtime();
    compile_into(
        &mut runtime,
        "class A { int32 a; } class B extends A { int32 b; }",
    );

    let layout = runtime.class("B").unwrap().clone();
    assert_eq!(layout.members[0].name, "a");
    assert_eq!(layout.members[0].offset, 0);
    assert_eq!(layout.members[1].name, "b");
    assert_eq!(layout.members[1].offset, 4);
    assert_eq!(layout.total_size, 8);

    let instance = runtime.create_instance("B").unwrap();
    runtime
        .set_member(&instance, "a", QValue::Int32(41))
        .unwrap();
    // The inherited member reads back through the same offset.
    assert_eq!(runtime.member(&instance, "a").unwrap().as_i64(), Some(41));
    assert!(instance.is_a("A"));
    assert!(instance.is_a("B"));
}

#[test]
fn compiling_twice_is_deterministic() {
    let source = "class P { bool flag; float64 big; int32 count; }";
    let build = || {
        let mut runtime = fresh_runtime();
        compile_into(&mut runtime, source);
        runtime.class("P").unwrap().clone()
    };
    let first = build();
    let second = build();
    assert_eq!(first.total_size, second.total_size);
    for (a, b) in first.members.iter().zip(&second.members) {
        assert_eq!(a.name, b.name);
        assert_eq!(a.offset, b.offset);
    }
}

#[test]
fn module_round_trip_restores_layout_and_defaults() {
    let mut runtime = fresh_runtime();
    let program = compile_into(&mut runtime, "class Foo { float32 x = 1.5f; float32 y; }");
    let classes: Vec<_> = runtime.classes().cloned().collect();
    let module = ModuleData::from_compiled("demo", &classes, &program);

    let mut bytes = Vec::new();
    save_module(&mut bytes, &module).unwrap();
    let loaded = load_module(&mut bytes.as_slice()).unwrap();
    assert_eq!(loaded, module);

    // Install into a brand-new runtime and construct an instance.
    let mut other = fresh_runtime();
    let installed = loaded.install(&mut other).unwrap();
    assert_eq!(installed.len(), 1);
    let layout = other.class("Foo").unwrap();
    assert_eq!(layout.total_size, 8);
    assert_eq!(layout.members[1].offset, 4);

    let instance = other.create_instance("Foo").unwrap();
    assert_eq!(other.member(&instance, "x").unwrap().as_f32(), Some(1.5));
}

#[test]
fn corrupt_module_image_is_rejected() {
    let module = ModuleData {
        name: "broken".into(),
        classes: Vec::new(),
        image: vec![0xde, 0xad],
    };
    let mut runtime = fresh_runtime();
    assert!(matches!(
        module.install(&mut runtime),
        Err(ModuleError::InvalidModule)
    ));
}

#[test]
fn arithmetic_and_control_flow() {
    let mut runtime = fresh_runtime();
    compile_into(
        &mut runtime,
        "class Math {\n\
         \tfunc add(int32 a, int32 b): int32 { return a + b; }\n\
         \tfunc sum_to(int32 n): int32 {\n\
         \t\tint32 total = 0;\n\
         \t\tfor (int32 i = 1; i <= n; i = i + 1) { total = total + i; }\n\
         \t\treturn total;\n\
         \t}\n\
         \tfunc collatz_steps(int32 start): int32 {\n\
         \t\tint32 n = start;\n\
         \t\tint32 steps = 0;\n\
         \t\twhile (n != 1) {\n\
         \t\t\tif (n % 2 == 0) { n = n / 2; } else { n = n * 3 + 1; }\n\
         \t\t\tsteps = steps + 1;\n\
         \t\t}\n\
         \t\treturn steps;\n\
         \t}\n\
         \tfunc truncate(float64 v): int32 { return int32(v); }\n\
         }",
    );

    let instance = runtime.create_instance("Math").unwrap();
    let add = runtime
        .call_method(&instance, "add", &[QValue::Int32(3), QValue::Int32(4)])
        .unwrap();
    assert_eq!(add.as_i64(), Some(7));

    let sum = runtime
        .call_method(&instance, "sum_to", &[QValue::Int32(9)])
        .unwrap();
    assert_eq!(sum.as_i64(), Some(45));

    let steps = runtime
        .call_method(&instance, "collatz_steps", &[QValue::Int32(6)])
        .unwrap();
    assert_eq!(steps.as_i64(), Some(8));

    let truncated = runtime
        .call_method(&instance, "truncate", &[QValue::Float64(7.9)])
        .unwrap();
    assert_eq!(truncated.as_i64(), Some(7));
}

#[test]
fn members_persist_between_calls() {
    let mut runtime = fresh_runtime();
    compile_into(
        &mut runtime,
        "class Counter {\n\
         \tint32 count;\n\
         \tfunc bump() { count = count + 1; }\n\
         \tfunc read(): int32 { return count; }\n\
         }",
    );

    let instance = runtime.create_instance("Counter").unwrap();
    for _ in 0..3 {
        runtime.call_method(&instance, "bump", &[]).unwrap();
    }
    let count = runtime.call_method(&instance, "read", &[]).unwrap();
    assert_eq!(count.as_i64(), Some(3));
    // Reflection sees the same storage.
    assert_eq!(runtime.member(&instance, "count").unwrap().as_i64(), Some(3));
}

#[test]
fn methods_call_sibling_methods() {
    let mut runtime = fresh_runtime();
    compile_into(
        &mut runtime,
        "class Chain {\n\
         \tfunc double(int32 v): int32 { return v * 2; }\n\
         \tfunc quadruple(int32 v): int32 { return double(double(v)); }\n\
         }",
    );
    let instance = runtime.create_instance("Chain").unwrap();
    let result = runtime
        .call_method(&instance, "quadruple", &[QValue::Int32(5)])
        .unwrap();
    assert_eq!(result.as_i64(), Some(20));
}

#[test]
fn string_concat_coerces_numbers() {
    let mut runtime = fresh_runtime();
    compile_into(
        &mut runtime,
        "class Greeter {\n\
         \tfunc greet(string name, int32 n): string { return \"hi \" + name + \" x\" + n; }\n\
         }",
    );
    let instance = runtime.create_instance("Greeter").unwrap();
    let result = runtime
        .call_method(
            &instance,
            "greet",
            &[QValue::Str("bob".into()), QValue::Int32(2)],
        )
        .unwrap();
    assert_eq!(result.display_string(), "hi bob x2");
}

#[test]
fn native_functions_are_callable_with_side_effects() {
    use std::cell::Cell;

    let context = Rc::new(Context::root("test"));
    let seen: Rc<Cell<i64>> = Rc::new(Cell::new(0));
    let sink = Rc::clone(&seen);
    context.add_func_with_sig(
        "accumulate",
        qengine::qlang::abi::NativeSig {
            params: Some(vec![QType::Int32]),
            ret: QType::Int32,
        },
        move |_, args| {
            let value = args[0].as_i64().unwrap_or(0);
            sink.set(sink.get() + value);
            QValue::Int32(sink.get() as i32)
        },
    );

    let mut runtime = Runtime::new(context);
    compile_into(
        &mut runtime,
        "class Driver {\n\
         \tfunc go(): int32 {\n\
         \t\taccumulate(10);\n\
         \t\treturn accumulate(5);\n\
         \t}\n\
         }",
    );
    let instance = runtime.create_instance("Driver").unwrap();
    let result = runtime.call_method(&instance, "go", &[]).unwrap();
    assert_eq!(result.as_i64(), Some(15));
    assert_eq!(seen.get(), 15);
}

#[test]
fn runtime_faults_surface_without_unwinding() {
    let mut runtime = fresh_runtime();
    compile_into(
        &mut runtime,
        "class Faulty {\n\
         \tFaulty other;\n\
         \tint32 value;\n\
         \tfunc divide(int32 a, int32 b): int32 { return a / b; }\n\
         \tfunc poke(): int32 { return other.value; }\n\
         }",
    );
    let instance = runtime.create_instance("Faulty").unwrap();

    let div = runtime.call_method(
        &instance,
        "divide",
        &[QValue::Int32(1), QValue::Int32(0)],
    );
    assert!(matches!(div, Err(RuntimeError::DivisionByZero { .. })));

    let poke = runtime.call_method(&instance, "poke", &[]);
    assert!(matches!(poke, Err(RuntimeError::NullDereference { .. })));

    // The runtime stays usable after a fault.
    let ok = runtime
        .call_method(&instance, "divide", &[QValue::Int32(8), QValue::Int32(2)])
        .unwrap();
    assert_eq!(ok.as_i64(), Some(4));
}

#[test]
fn argument_conversion_and_arity_checks() {
    let mut runtime = fresh_runtime();
    compile_into(
        &mut runtime,
        "class Sig { func takes(float32 v): float32 { return v * 2f; } }",
    );
    let instance = runtime.create_instance("Sig").unwrap();

    // Numeric variants convert to the declared parameter type.
    let widened = runtime
        .call_method(&instance, "takes", &[QValue::Int32(3)])
        .unwrap();
    assert_eq!(widened.as_f32(), Some(6.0));

    let wrong = runtime.call_method(&instance, "takes", &[QValue::Str("no".into())]);
    assert!(matches!(
        wrong,
        Err(RuntimeError::ArgumentTypeError { .. })
    ));

    let arity = runtime.call_method(&instance, "takes", &[]);
    assert!(matches!(
        arity,
        Err(RuntimeError::ArgumentTypeError { .. })
    ));
}

#[test]
fn compile_error_batches_accumulate() {
    let mut runtime = fresh_runtime();
    let mut diags = Diagnostics::new();
    let tokens = lexer::tokenize(
        "class Dup { int32 a; int32 a; func f(): int32 { return missing; } }\n\
         class Dup { }",
        &mut diags,
    );
    let program = parser::parse(&tokens, &mut diags);
    let errors = compile::compile_and_register(&mut runtime, &program).unwrap_err();
    use qengine::qlang::CompileErrorKind;
    let kinds: Vec<_> = errors.0.iter().map(|e| e.kind).collect();
    assert!(kinds.contains(&CompileErrorKind::RedeclaredClass));
    assert!(kinds.contains(&CompileErrorKind::RedeclaredMember));
    // Nothing registered from a failed batch.
    assert!(runtime.class("Dup").is_none());
}

#[test]
fn script_host_prelude_and_node_natives() {
    let mut host = ScriptHost::new();
    // Builtins arrived with the host.
    assert!(host.runtime_ref().class("GameNode").is_some());
    assert!(host.runtime_ref().class("Vec3").is_some());

    // NodePtr is the first member of GameNode subclasses.
    assert!(host.register_source(
        "class Spinner extends GameNode {\n\
         \tVec3 spin;\n\
         \tfunc on_update(float32 dt) {\n\
         \t\tNodeTurn(NodePtr, spin);\n\
         \t}\n\
         }",
        "Spinner.q",
    ));
    let layout = host.runtime_ref().class("Spinner").unwrap().clone();
    assert_eq!(layout.members[0].name, "NodePtr");
    assert_eq!(layout.members[0].offset, 0);

    let mut scene = SceneGraph::new();
    let node = scene.create_node("spinny", None);

    let instance = host.runtime().create_instance("Spinner").unwrap();
    script::attach_script(host.runtime(), &node, Rc::clone(&instance), None).unwrap();

    // Hand the script a Vec3 with a 90 degree yaw. The host keeps the
    // owning handle; the slot inside script memory is non-owning.
    let spin = host.runtime().create_instance("Vec3").unwrap();
    host.runtime()
        .set_member(&spin, "Y", QValue::Float32(90.0))
        .unwrap();
    host.runtime()
        .set_member(&instance, "spin", QValue::Instance(Rc::clone(&spin)))
        .unwrap();

    scene.on_play(host.runtime());
    scene.on_update(host.runtime(), 0.016);

    let euler = node.borrow().rotation_euler_degrees();
    assert!(
        (euler.y - 90.0).abs() < 1e-3,
        "script should have turned the node, got {euler:?}"
    );

    scene.on_stop(host.runtime());
}

#[test]
fn vec3_setter_method_runs() {
    let mut host = ScriptHost::new();
    let vec3 = host.runtime().create_instance("Vec3").unwrap();
    host.runtime()
        .call_method(
            &vec3,
            "set",
            &[
                QValue::Float32(1.0),
                QValue::Float32(2.0),
                QValue::Float32(3.0),
            ],
        )
        .unwrap();
    assert_eq!(host.runtime().member(&vec3, "X").unwrap().as_f32(), Some(1.0));
    assert_eq!(host.runtime().member(&vec3, "Z").unwrap().as_f32(), Some(3.0));
}

#[test]
fn static_classes_share_one_instance() {
    let mut runtime = fresh_runtime();
    compile_into(
        &mut runtime,
        "static class Globals { int32 frames; func bump() { frames = frames + 1; } }",
    );
    let a = runtime.create_instance("Globals").unwrap();
    let b = runtime.create_instance("Globals").unwrap();
    runtime.call_method(&a, "bump", &[]).unwrap();
    assert_eq!(runtime.member(&b, "frames").unwrap().as_i64(), Some(1));
    assert!(Rc::ptr_eq(&a, &b));
}
