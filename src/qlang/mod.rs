//! QLang: a small class-based scripting language compiled to native code.
//!
//! The front end (tokenizer, parser) accumulates diagnostics and never
//! panics on bad input; the compiler lowers class methods to machine code
//! through Cranelift; the runtime allocates instances per compiled layout
//! and exposes reflection the editor's property panel reads directly.
//! Modules persist as `.qm` files with a metadata block plus a portable
//! program image.

pub mod abi;
pub mod ast;
pub mod compile;
pub mod context;
pub mod diag;
pub mod host;
pub mod layout;
pub mod lexer;
pub mod module;
pub mod parser;
pub mod runtime;
pub mod token;
pub mod types;
pub mod value;

pub use {
    abi::RuntimeError,
    compile::{CompileError, CompileErrorKind, CompileErrors},
    context::Context,
    diag::{Diagnostic, Diagnostics, Severity},
    host::ScriptHost,
    layout::{ClassLayout, CompiledMethod, MemberLayout},
    module::{ModuleData, ModuleError},
    runtime::{ClassInstance, Runtime},
    types::QType,
    value::QValue,
};
