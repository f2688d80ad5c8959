//! The Ember module image format.
//!
//! A module image is a chunked container: a magic/version header followed by
//! a sequence of IFF-style chunks, each a 4-byte tag, a big-endian u32
//! length, the payload, and padding to the next 4-byte boundary. The reader
//! rejects images with missing required chunks, truncated payloads, or code
//! that references indices outside the declared tables.
//!
//! Literals travel in the `LitT` chunk as a zlib-compressed table of
//! externally-encoded terms; this crate treats the encoded blobs as opaque
//! bytes, the runtime decodes them onto the module's literal area when the
//! image is loaded.

mod builder;
mod ops;
mod reader;
mod writer;

pub use self::builder::{BuildError, ModuleBuilder};
pub use self::ops::{DecodeError, Opcode};
pub use self::reader::{ImageReader, ReadError};
pub use self::writer::ImageWriter;

/// Number of arguments a function accepts
pub type Arity = u8;
/// An index into the module's atom table
pub type AtomIndex = u32;
/// An index into the module's literal table
pub type LiteralIndex = u32;
/// An index into the module's import table
pub type ImportIndex = u32;
/// An index into the module's lambda table
pub type FunIndex = u32;
/// An instruction index in the code section
pub type Label = u32;
/// A register in the current frame
pub type Register = u16;

pub const MAGIC: &[u8; 4] = b"EMBR";
pub const VERSION: u32 = 1;

/// Chunk tags. `AtU8` through `FunT` are required; the rest are optional.
pub mod chunk {
    pub const ATOMS: &[u8; 4] = b"AtU8";
    pub const IMPORTS: &[u8; 4] = b"ImpT";
    pub const EXPORTS: &[u8; 4] = b"ExpT";
    pub const LITERALS: &[u8; 4] = b"LitT";
    pub const CODE: &[u8; 4] = b"Code";
    pub const STRINGS: &[u8; 4] = b"StrT";
    pub const FUNS: &[u8; 4] = b"FunT";
    pub const LINES: &[u8; 4] = b"LinT";
    pub const ATTRIBUTES: &[u8; 4] = b"Attr";

    pub const REQUIRED: [&[u8; 4]; 7] = [ATOMS, IMPORTS, EXPORTS, LITERALS, CODE, STRINGS, FUNS];
}

/// An entry in the import table, referencing a function in another module
/// (or this one, for fully-qualified self calls).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Import {
    pub module: AtomIndex,
    pub function: AtomIndex,
    pub arity: Arity,
}

/// An entry in the export table, naming a function of this module and the
/// instruction index of its `FuncInfo` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Export {
    pub function: AtomIndex,
    pub arity: Arity,
    pub offset: Label,
}

/// An entry in the lambda table, describing a closure's target.
///
/// `arity` is the number of call arguments; `env_len` captured values are
/// appended after them when the closure is applied, so the target function's
/// declared arity is `arity + env_len`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lambda {
    pub function: AtomIndex,
    pub arity: Arity,
    pub env_len: u8,
    pub offset: Label,
}

/// A fully parsed module image.
///
/// Atom 0 is the module's own name, mirroring the convention of the
/// container format we inherit.
#[derive(Debug, Clone, Default)]
pub struct Image {
    pub version: u32,
    pub atoms: Vec<String>,
    pub imports: Vec<Import>,
    pub exports: Vec<Export>,
    /// Externally-encoded literal terms, decoded by the loader
    pub literals: Vec<Vec<u8>>,
    pub strings: Vec<u8>,
    pub funs: Vec<Lambda>,
    pub code: Vec<Opcode>,
    /// Raw line-info chunk, if present
    pub lines: Option<Vec<u8>>,
    /// Raw attributes chunk, if present
    pub attributes: Option<Vec<u8>>,
}

impl Image {
    /// The module name, i.e. atom 0.
    pub fn module_name(&self) -> Option<&str> {
        self.atoms.first().map(|s| s.as_str())
    }

    /// Validates the code section against the declared tables.
    ///
    /// Checks performed:
    /// - every export and lambda offset points at a `FuncInfo` header with
    ///   the matching arity (lambdas include their environment)
    /// - every branch target is an in-range instruction index
    /// - every register operand and register window is within the frame
    ///   declared by the enclosing `FuncInfo`
    /// - every atom/literal/import/lambda index is within its table
    pub fn validate(&self) -> Result<(), ValidateError> {
        if self.atoms.is_empty() {
            return Err(ValidateError::NoModuleName);
        }
        let code_len = self.code.len() as u32;

        for import in self.imports.iter() {
            if import.module as usize >= self.atoms.len()
                || import.function as usize >= self.atoms.len()
            {
                return Err(ValidateError::BadImportEntry);
            }
        }
        for export in self.exports.iter() {
            self.check_function_header(export.offset, export.function, export.arity)?;
        }
        for lambda in self.funs.iter() {
            let total = lambda.arity as u32 + lambda.env_len as u32;
            if total > u8::MAX as u32 {
                return Err(ValidateError::BadLambda { offset: lambda.offset });
            }
            self.check_function_header(lambda.offset, lambda.function, total as Arity)?;
        }

        // Frame size in effect while walking the code section. Code before
        // the first FuncInfo is unreachable by construction, so a frame of
        // zero forbids register use there.
        let mut frame_size: Register = 0;
        for (index, op) in self.code.iter().enumerate() {
            let index = index as u32;
            if let Opcode::FuncInfo { frame_size: declared, arity, .. } = op {
                if (*arity as u16) > *declared {
                    return Err(ValidateError::FrameTooSmall { offset: index });
                }
                frame_size = *declared;
            }
            for register in op.registers() {
                if register >= frame_size {
                    return Err(ValidateError::RegisterOutOfFrame { offset: index, register });
                }
            }
            if let Some((base, count)) = self.window_of(op) {
                let end = base as u32 + count as u32;
                if count > 0 && end > frame_size as u32 {
                    return Err(ValidateError::RegisterOutOfFrame {
                        offset: index,
                        register: (end - 1) as Register,
                    });
                }
            }
            for label in op.labels() {
                if label >= code_len {
                    return Err(ValidateError::BadBranchTarget { offset: index, label });
                }
            }
            if let Some(atom) = op.atom_index() {
                if atom as usize >= self.atoms.len() {
                    return Err(ValidateError::BadAtomIndex { offset: index, atom });
                }
            }
            if let Some(literal) = op.literal_index() {
                if literal as usize >= self.literals.len() {
                    return Err(ValidateError::BadLiteralIndex { offset: index, literal });
                }
            }
            if let Some(import) = op.import_index() {
                if import as usize >= self.imports.len() {
                    return Err(ValidateError::BadImportIndex { offset: index, import });
                }
            }
            if let Some(fun) = op.fun_index() {
                match self.funs.get(fun as usize) {
                    None => return Err(ValidateError::BadFunIndex { offset: index, fun }),
                    Some(lambda) => {
                        if let Opcode::MakeClosure { env_len, .. } = op {
                            if *env_len != lambda.env_len {
                                return Err(ValidateError::LambdaEnvMismatch { offset: index });
                            }
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Register window addressed by `op`, resolving qualified-call arities
    /// through the import table.
    fn window_of(&self, op: &Opcode) -> Option<(Register, u16)> {
        match *op {
            Opcode::CallStatic { import, args, .. } | Opcode::EnterStatic { import, args } => {
                let arity = self.imports.get(import as usize).map(|i| i.arity).unwrap_or(0);
                Some((args, arity as u16))
            }
            _ => op.register_window(),
        }
    }

    fn check_function_header(
        &self,
        offset: Label,
        function: AtomIndex,
        arity: Arity,
    ) -> Result<(), ValidateError> {
        match self.code.get(offset as usize) {
            Some(Opcode::FuncInfo { function: f, arity: a, .. })
                if *f == function && *a == arity =>
            {
                Ok(())
            }
            _ => Err(ValidateError::BadFunctionOffset { offset }),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ValidateError {
    #[error("module has an empty atom table")]
    NoModuleName,
    #[error("export or lambda offset {offset} does not address a matching function header")]
    BadFunctionOffset { offset: Label },
    #[error("lambda at offset {offset} declares more than 255 arguments plus captures")]
    BadLambda { offset: Label },
    #[error("function header at {offset} declares a frame smaller than its arity")]
    FrameTooSmall { offset: Label },
    #[error("instruction {offset} uses register {register} outside the declared frame")]
    RegisterOutOfFrame { offset: Label, register: Register },
    #[error("instruction {offset} branches to {label}, past the end of the code section")]
    BadBranchTarget { offset: Label, label: Label },
    #[error("instruction {offset} references atom {atom} outside the atom table")]
    BadAtomIndex { offset: Label, atom: AtomIndex },
    #[error("instruction {offset} references literal {literal} outside the literal table")]
    BadLiteralIndex { offset: Label, literal: LiteralIndex },
    #[error("instruction {offset} references import {import} outside the import table")]
    BadImportIndex { offset: Label, import: ImportIndex },
    #[error("instruction {offset} references lambda {fun} outside the lambda table")]
    BadFunIndex { offset: Label, fun: FunIndex },
    #[error("instruction {offset} captures a different environment size than its lambda declares")]
    LambdaEnvMismatch { offset: Label },
    #[error("import entry references an atom outside the atom table")]
    BadImportEntry,
}
