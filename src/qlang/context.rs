//! Lexical variable and native-function scope with parent-chained lookup.

use {
    super::{
        abi::{NativeSig, RuntimeError},
        value::QValue,
    },
    std::{cell::RefCell, collections::HashMap, rc::Rc},
};

/// Signature of a host function callable from scripts.
pub type NativeFn = dyn Fn(&Context, &[QValue]) -> QValue;

/// A variable/function scope. The root engine context lives for the whole
/// session; child contexts are short-lived method-call scopes. Lookup walks
/// the parent chain; writes are always local. Single-threaded by design.
pub struct Context {
    name: String,
    parent: Option<Rc<Context>>,
    variables: RefCell<HashMap<String, QValue>>,
    functions: RefCell<HashMap<String, (Rc<NativeFn>, NativeSig)>>,
}

impl Context {
    pub fn root(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parent: None,
            variables: RefCell::new(HashMap::new()),
            functions: RefCell::new(HashMap::new()),
        }
    }

    pub fn child(name: impl Into<String>, parent: &Rc<Context>) -> Rc<Self> {
        Rc::new(Self {
            name: name.into(),
            parent: Some(Rc::clone(parent)),
            variables: RefCell::new(HashMap::new()),
            functions: RefCell::new(HashMap::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<&Rc<Context>> {
        self.parent.as_ref()
    }

    // ------------------------------------------------------------ variables

    /// Writes are always local to this scope.
    pub fn set_variable(&self, name: impl Into<String>, value: QValue) {
        self.variables.borrow_mut().insert(name.into(), value);
    }

    /// Reads search this scope first, then parents. Missing names read as
    /// null.
    pub fn variable(&self, name: &str) -> QValue {
        if let Some(value) = self.variables.borrow().get(name) {
            return value.clone();
        }
        match &self.parent {
            Some(parent) => parent.variable(name),
            None => QValue::Null,
        }
    }

    pub fn has_local_variable(&self, name: &str) -> bool {
        self.variables.borrow().contains_key(name)
    }

    pub fn has_variable(&self, name: &str) -> bool {
        self.has_local_variable(name)
            || self
                .parent
                .as_ref()
                .is_some_and(|parent| parent.has_variable(name))
    }

    // ------------------------------------------------------------ functions

    /// Register a native callable with an unconstrained (variadic, returns
    /// null) signature.
    pub fn add_func(
        &self,
        name: impl Into<String>,
        func: impl Fn(&Context, &[QValue]) -> QValue + 'static,
    ) {
        self.add_func_with_sig(name, NativeSig::variadic(), func);
    }

    /// Register a native callable together with the signature the compiler
    /// should type-check calls against.
    pub fn add_func_with_sig(
        &self,
        name: impl Into<String>,
        sig: NativeSig,
        func: impl Fn(&Context, &[QValue]) -> QValue + 'static,
    ) {
        self.functions
            .borrow_mut()
            .insert(name.into(), (Rc::new(func), sig));
    }

    pub fn has_func(&self, name: &str) -> bool {
        self.functions.borrow().contains_key(name)
            || self
                .parent
                .as_ref()
                .is_some_and(|parent| parent.has_func(name))
    }

    /// Resolve a function by walking the parent chain.
    pub fn lookup_func(&self, name: &str) -> Option<(Rc<NativeFn>, NativeSig)> {
        if let Some((func, sig)) = self.functions.borrow().get(name) {
            return Some((Rc::clone(func), sig.clone()));
        }
        self.parent.as_ref().and_then(|parent| parent.lookup_func(name))
    }

    /// Call a native function by name.
    pub fn call_func(&self, name: &str, args: &[QValue]) -> Result<QValue, RuntimeError> {
        match self.lookup_func(name) {
            Some((func, _)) => Ok(func(self, args)),
            None => Err(RuntimeError::UnknownFunction(name.to_owned())),
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("name", &self.name)
            .field("variables", &self.variables.borrow().len())
            .field("functions", &self.functions.borrow().len())
            .field("has_parent", &self.parent.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_walks_parent_chain_and_set_is_local() {
        let root = Rc::new(Context::root("engine"));
        root.set_variable("speed", QValue::Float32(2.0));

        let scope = Context::child("call", &root);
        assert_eq!(scope.variable("speed").display_string(), "2");

        scope.set_variable("speed", QValue::Float32(5.0));
        assert_eq!(scope.variable("speed").display_string(), "5");
        // Parent unchanged.
        assert_eq!(root.variable("speed").display_string(), "2");
    }

    #[test]
    fn missing_variable_reads_null() {
        let root = Context::root("engine");
        assert!(root.variable("nope").is_null());
    }

    #[test]
    fn function_resolution_and_unknown_function() {
        let root = Rc::new(Context::root("engine"));
        root.add_func("double", |_, args| {
            QValue::Int32(args[0].as_i64().unwrap_or(0) as i32 * 2)
        });

        let scope = Context::child("call", &root);
        let result = scope.call_func("double", &[QValue::Int32(21)]).unwrap();
        assert_eq!(result.display_string(), "42");

        assert!(matches!(
            scope.call_func("missing", &[]),
            Err(RuntimeError::UnknownFunction(_))
        ));
    }
}
