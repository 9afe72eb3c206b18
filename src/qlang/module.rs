//! Persistence of compiled modules (`.qm`).
//!
//! Byte layout, little-endian throughout:
//!
//! ```text
//! u32 magic  "QMOD"
//! u32 version
//! len-string module_name
//! u32 class_count
//!   len-string class_name
//!   u32 member_count  { len-string name, i32 type_token, len-string type_name }
//!   u32 method_count  { len-string name, len-string return_type }
//!   i32 is_static
//! u32 image_size
//! image_size bytes     -- portable program image (backend input)
//! ```
//!
//! The image is the backend's portable representation of the program; the
//! loader re-materializes native code from it, which also revalidates it.

use {
    super::{
        ast::Program,
        compile::{self, CompileErrors},
        layout::ClassLayout,
        runtime::Runtime,
    },
    byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt},
    std::{
        fs::File,
        io::{BufReader, BufWriter, Read, Write},
        path::Path,
        rc::Rc,
    },
    thiserror::Error,
};

pub const QM_MAGIC: u32 = 0x514D_4F44; // "QMOD"
pub const QM_VERSION: u32 = 1;

/// Strings above this length fail the sanity check on load.
const MAX_STRING_LEN: u32 = 1_000_000;

#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("not a module file (bad magic or corrupt data)")]
    InvalidModule,

    #[error("unsupported module version {0}")]
    UnsupportedModuleVersion(u32),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("module image failed to compile: {0}")]
    Rejected(#[from] CompileErrors),
}

/// Member record as persisted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModuleMemberMeta {
    pub name: String,
    pub type_token: i32,
    pub type_name: String,
}

/// Class record as persisted: metadata only, no offsets (those are
/// recomputed deterministically by the loader).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModuleClassMeta {
    pub name: String,
    pub members: Vec<ModuleMemberMeta>,
    /// `(name, return_type)` in declaration order.
    pub methods: Vec<(String, String)>,
    pub is_static: bool,
}

/// A loaded (or about-to-be-saved) module.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModuleData {
    pub name: String,
    pub classes: Vec<ModuleClassMeta>,
    pub image: Vec<u8>,
}

impl ModuleData {
    /// Snapshot a compiled unit for persistence.
    pub fn from_compiled(name: impl Into<String>, classes: &[Rc<ClassLayout>], program: &Program) -> Self {
        Self {
            name: name.into(),
            classes: classes.iter().map(|c| class_meta(c)).collect(),
            image: bincode::serialize(program).unwrap_or_default(),
        }
    }

    /// Re-materialize native code in `runtime` from the embedded image. The
    /// image is the authoritative input; the metadata block exists so tools
    /// can inspect a module without a backend.
    pub fn install(&self, runtime: &mut Runtime) -> Result<Vec<Rc<ClassLayout>>, ModuleError> {
        let program: Program =
            bincode::deserialize(&self.image).map_err(|_| ModuleError::InvalidModule)?;
        Ok(compile::compile_and_register(runtime, &program)?)
    }
}

pub fn class_meta(layout: &ClassLayout) -> ModuleClassMeta {
    ModuleClassMeta {
        name: layout.name.clone(),
        members: layout
            .members
            .iter()
            .map(|m| ModuleMemberMeta {
                name: m.name.clone(),
                type_token: m.type_token,
                type_name: m.type_name.clone(),
            })
            .collect(),
        methods: layout
            .method_order
            .iter()
            .map(|name| {
                (
                    name.clone(),
                    layout
                        .method_return_type(name)
                        .unwrap_or("null")
                        .to_owned(),
                )
            })
            .collect(),
        is_static: layout.is_static,
    }
}

// ------------------------------------------------------------------- write

fn write_string(w: &mut impl Write, text: &str) -> Result<(), ModuleError> {
    w.write_u32::<LittleEndian>(text.len() as u32)?;
    w.write_all(text.as_bytes())?;
    Ok(())
}

pub fn save_module(w: &mut impl Write, module: &ModuleData) -> Result<(), ModuleError> {
    w.write_u32::<LittleEndian>(QM_MAGIC)?;
    w.write_u32::<LittleEndian>(QM_VERSION)?;
    write_string(w, &module.name)?;

    w.write_u32::<LittleEndian>(module.classes.len() as u32)?;
    for class in &module.classes {
        write_string(w, &class.name)?;

        w.write_u32::<LittleEndian>(class.members.len() as u32)?;
        for member in &class.members {
            write_string(w, &member.name)?;
            w.write_i32::<LittleEndian>(member.type_token)?;
            write_string(w, &member.type_name)?;
        }

        w.write_u32::<LittleEndian>(class.methods.len() as u32)?;
        for (name, return_type) in &class.methods {
            write_string(w, name)?;
            write_string(w, return_type)?;
        }

        w.write_i32::<LittleEndian>(class.is_static as i32)?;
        log::debug!(
            "module '{}': wrote class '{}' ({} members, {} methods)",
            module.name,
            class.name,
            class.members.len(),
            class.methods.len()
        );
    }

    w.write_u32::<LittleEndian>(module.image.len() as u32)?;
    w.write_all(&module.image)?;
    Ok(())
}

pub fn save_module_file(path: impl AsRef<Path>, module: &ModuleData) -> Result<(), ModuleError> {
    let mut file = BufWriter::new(File::create(path)?);
    save_module(&mut file, module)
}

// -------------------------------------------------------------------- read

fn read_string(r: &mut impl Read) -> Result<String, ModuleError> {
    let len = r.read_u32::<LittleEndian>()?;
    if len > MAX_STRING_LEN {
        return Err(ModuleError::InvalidModule);
    }
    let mut bytes = vec![0u8; len as usize];
    r.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map_err(|_| ModuleError::InvalidModule)
}

/// Parse a module stream. Magic and version mismatches fail without reading
/// any further; nothing is registered anywhere.
pub fn load_module(r: &mut impl Read) -> Result<ModuleData, ModuleError> {
    let magic = r.read_u32::<LittleEndian>()?;
    if magic != QM_MAGIC {
        return Err(ModuleError::InvalidModule);
    }
    let version = r.read_u32::<LittleEndian>()?;
    if version != QM_VERSION {
        return Err(ModuleError::UnsupportedModuleVersion(version));
    }

    let name = read_string(r)?;
    let class_count = r.read_u32::<LittleEndian>()?;
    let mut classes = Vec::with_capacity(class_count.min(4096) as usize);
    for _ in 0..class_count {
        let class_name = read_string(r)?;

        let member_count = r.read_u32::<LittleEndian>()?;
        let mut members = Vec::with_capacity(member_count.min(4096) as usize);
        for _ in 0..member_count {
            let member_name = read_string(r)?;
            let type_token = r.read_i32::<LittleEndian>()?;
            let type_name = read_string(r)?;
            members.push(ModuleMemberMeta {
                name: member_name,
                type_token,
                type_name,
            });
        }

        let method_count = r.read_u32::<LittleEndian>()?;
        let mut methods = Vec::with_capacity(method_count.min(4096) as usize);
        for _ in 0..method_count {
            let method_name = read_string(r)?;
            let return_type = read_string(r)?;
            methods.push((method_name, return_type));
        }

        let is_static = r.read_i32::<LittleEndian>()? != 0;
        classes.push(ModuleClassMeta {
            name: class_name,
            members,
            methods,
            is_static,
        });
    }

    let image_size = r.read_u32::<LittleEndian>()?;
    let mut image = vec![0u8; image_size as usize];
    r.read_exact(&mut image)?;

    log::debug!("loaded module '{name}' ({} classes, {image_size} byte image)", classes.len());
    Ok(ModuleData {
        name,
        classes,
        image,
    })
}

pub fn load_module_file(path: impl AsRef<Path>) -> Result<ModuleData, ModuleError> {
    let mut file = BufReader::new(File::open(path)?);
    load_module(&mut file)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ModuleData {
        ModuleData {
            name: "demo".into(),
            classes: vec![ModuleClassMeta {
                name: "Foo".into(),
                members: vec![
                    ModuleMemberMeta {
                        name: "x".into(),
                        type_token: 3,
                        type_name: "float32".into(),
                    },
                    ModuleMemberMeta {
                        name: "y".into(),
                        type_token: 3,
                        type_name: "float32".into(),
                    },
                ],
                methods: vec![("update".into(), "null".into())],
                is_static: false,
            }],
            image: vec![1, 2, 3, 4],
        }
    }

    #[test]
    fn round_trip_preserves_metadata() {
        let module = sample();
        let mut bytes = Vec::new();
        save_module(&mut bytes, &module).unwrap();
        let loaded = load_module(&mut bytes.as_slice()).unwrap();
        assert_eq!(loaded, module);
    }

    #[test]
    fn bad_magic_fails_without_side_effects() {
        let module = sample();
        let mut bytes = Vec::new();
        save_module(&mut bytes, &module).unwrap();
        bytes[0] ^= 0xFF;
        assert!(matches!(
            load_module(&mut bytes.as_slice()),
            Err(ModuleError::InvalidModule)
        ));
    }

    #[test]
    fn future_version_is_rejected() {
        let module = sample();
        let mut bytes = Vec::new();
        save_module(&mut bytes, &module).unwrap();
        bytes[4] = 9;
        assert!(matches!(
            load_module(&mut bytes.as_slice()),
            Err(ModuleError::UnsupportedModuleVersion(9))
        ));
    }

    #[test]
    fn oversized_string_is_rejected() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&QM_MAGIC.to_le_bytes());
        bytes.extend_from_slice(&QM_VERSION.to_le_bytes());
        bytes.extend_from_slice(&(2_000_000u32).to_le_bytes());
        assert!(matches!(
            load_module(&mut bytes.as_slice()),
            Err(ModuleError::InvalidModule)
        ));
    }
}
