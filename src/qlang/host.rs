//! Engine-side scripting domain: the root context with the native bridge,
//! source loading, and class instantiation onto scene nodes.

use {
    super::{
        abi::NativeSig,
        compile,
        context::Context,
        diag::Diagnostics,
        lexer, parser,
        runtime::{ClassInstance, Runtime},
        types::QType,
        value::QValue,
    },
    crate::scene::{
        node::{NodeRef, SceneNode},
        script,
    },
    glam::Vec3,
    std::{path::Path, rc::Rc},
};

/// Builtin classes registered before any user code; scripts extending
/// `GameNode` inherit the `NodePtr` slot the engine writes at attach time.
const PRELUDE_SOURCES: &[(&str, &str)] = &[
    ("GameNode.q", include_str!("../../assets/qlang/GameNode.q")),
    ("Vec3.q", include_str!("../../assets/qlang/Vec3.q")),
];

/// One scripting domain: a runtime plus the engine context carrying the
/// native-function bridge. Owned by the render thread.
pub struct ScriptHost {
    runtime: Runtime,
}

impl ScriptHost {
    pub fn new() -> Self {
        let context = Rc::new(Context::root("engine"));
        register_engine_functions(&context);

        let mut host = Self {
            runtime: Runtime::new(context),
        };
        for (origin, source) in PRELUDE_SOURCES {
            if !host.register_source(source, origin) {
                log::error!("builtin class source '{origin}' failed to compile");
            }
        }
        host
    }

    pub fn runtime(&mut self) -> &mut Runtime {
        &mut self.runtime
    }

    pub fn runtime_ref(&self) -> &Runtime {
        &self.runtime
    }

    /// Compile and register every class in `source`. Diagnostics are logged;
    /// returns false when anything failed.
    pub fn register_source(&mut self, source: &str, origin: &str) -> bool {
        let mut diags = Diagnostics::new();
        let tokens = lexer::tokenize(source, &mut diags);
        if diags.has_errors() {
            log::error!("{origin}: tokenization failed");
            diags.log_all();
            return false;
        }

        let program = parser::parse(&tokens, &mut diags);
        if diags.has_errors() {
            log::error!("{origin}: parsing failed");
            diags.log_all();
            return false;
        }

        match compile::compile_and_register(&mut self.runtime, &program) {
            Ok(classes) => {
                log::debug!("{origin}: registered {} class(es)", classes.len());
                true
            }
            Err(errors) => {
                for error in &errors.0 {
                    log::error!("{origin}: {error}");
                }
                false
            }
        }
    }

    /// Load one `.q` file and register its classes.
    pub fn load_and_register(&mut self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(source) => self.register_source(&source, &path.display().to_string()),
            Err(err) => {
                log::error!("cannot read {}: {err}", path.display());
                false
            }
        }
    }

    /// Recursively load every `.q` file under `folder`; returns how many
    /// loaded cleanly.
    pub fn load_and_register_folder(&mut self, folder: impl AsRef<Path>) -> usize {
        let mut loaded = 0;
        let mut pending = vec![folder.as_ref().to_path_buf()];
        while let Some(dir) = pending.pop() {
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    pending.push(path);
                } else if path.extension().is_some_and(|ext| ext == "q")
                    && self.load_and_register(&path)
                {
                    loaded += 1;
                }
            }
        }
        loaded
    }

    /// Load a script file, instantiate the class named after the file stem
    /// and attach it to `node`.
    pub fn load_class(&mut self, path: impl AsRef<Path>, node: &NodeRef) -> Option<Rc<ClassInstance>> {
        let path = path.as_ref();
        let class_name = path.file_stem()?.to_str()?.to_owned();
        if !self.load_and_register(path) {
            return None;
        }

        let instance = match self.runtime.create_instance(&class_name) {
            Ok(instance) => instance,
            Err(err) => {
                log::error!("cannot instantiate '{class_name}': {err}");
                return None;
            }
        };
        if let Err(err) = script::attach_script(
            &mut self.runtime,
            node,
            Rc::clone(&instance),
            Some(path.display().to_string()),
        ) {
            log::error!("cannot attach '{class_name}': {err}");
            return None;
        }
        Some(instance)
    }

    /// Call a method on a script instance, logging faults instead of
    /// propagating them.
    pub fn run_method(&mut self, instance: &Rc<ClassInstance>, name: &str, args: &[QValue]) {
        if let Err(err) = self.runtime.call_method(instance, name, args) {
            log::warn!("{}::{name}: {err}", instance.class_name());
        }
    }
}

impl Default for ScriptHost {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ScriptHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptHost")
            .field("runtime", &self.runtime)
            .finish()
    }
}

// ------------------------------------------------------------------ bridge

/// Read a `Vec3`-shaped instance argument leniently: any numeric member
/// variant converts to f32.
fn vec3_arg(value: &QValue) -> Option<Vec3> {
    let instance = value.as_instance()?;
    let component = |name: &str| instance.member_primitive(name)?.as_f32();
    Some(Vec3::new(
        component("X")?,
        component("Y")?,
        component("Z")?,
    ))
}

/// The first argument of a node native is the opaque node pointer written
/// into `NodePtr` at attach time.
///
/// Deliberately non-owning: node lifetime dominates script lifetime, and a
/// script outliving its node is a scene-teardown bug upstream.
fn node_arg(value: &QValue) -> Option<*mut SceneNode> {
    let ptr = value.as_cptr()?;
    if ptr.is_null() {
        return None;
    }
    Some(ptr as *mut SceneNode)
}

/// Install the engine's native functions into `context`.
pub fn register_engine_functions(context: &Context) {
    context.add_func("printf", |_, args| {
        let line = args
            .iter()
            .map(QValue::display_string)
            .collect::<Vec<_>>()
            .join(" ");
        log::info!("[OUTPUT] {line}");
        QValue::Null
    });

    context.add_func("print", |_, args| {
        let line = args
            .iter()
            .map(|arg| format!("{} ({})", arg.display_string(), arg.type_name()))
            .collect::<Vec<_>>()
            .join(", ");
        log::info!("[PRINT] {line}");
        QValue::Null
    });

    let node_sig = || NativeSig {
        params: Some(vec![QType::CPtr, QType::Class("Vec3".into())]),
        ret: QType::Null,
    };

    context.add_func_with_sig("NodeSetPosition", node_sig(), |_, args| {
        let (Some(node), Some(v)) = (
            args.first().and_then(node_arg),
            args.get(1).and_then(vec3_arg),
        ) else {
            log::error!("NodeSetPosition expects (cptr node, Vec3 position)");
            return QValue::Null;
        };
        unsafe {
            (*node).set_local_position(v);
        }
        QValue::Null
    });

    context.add_func_with_sig("NodeTurn", node_sig(), |_, args| {
        let (Some(node), Some(v)) = (
            args.first().and_then(node_arg),
            args.get(1).and_then(vec3_arg),
        ) else {
            log::error!("NodeTurn expects (cptr node, Vec3 rotation)");
            return QValue::Null;
        };
        unsafe {
            (*node).turn(v);
        }
        QValue::Null
    });
}
