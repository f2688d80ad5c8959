//! Native-extension loading and verification.
//!
//! Extensions arrive in two forms. A shared object must export the marker
//! function (returning the fixed sentinel) and the metadata initializer,
//! and must carry the runtime symbols of memory-safe compilation; anything
//! else is refused before a single extension instruction runs. Source form
//! is compiled by the toolchain in safe-only mode — the loader injects
//! `#![forbid(unsafe_code)]` and rejects sources that contain an `unsafe`
//! escape — and the resulting object goes through the same verification.
//!
//! Statically linked Rust extensions register through
//! [`register_extension`], which the runtime itself and tests use.

use std::ffi::{c_char, c_void, CStr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use lazy_static::lazy_static;
use libloading::Library;
use log::info;

use ember_rt::term::{Atom, AtomError, OpaqueTerm};

use super::{NifCallable, NifEntry, NifEnv, NifError, NIF_API_VERSION, NIF_SENTINEL};

/// Marker export every loadable library must provide.
pub const MARKER_SYMBOL: &[u8] = b"ember_nif_marker\0";
/// Metadata export describing the extension.
pub const INIT_SYMBOL: &[u8] = b"ember_nif_init\0";
/// A symbol characteristic of the memory-safe toolchain's runtime.
const SAFE_RUNTIME_SYMBOL: &[u8] = b"rust_eh_personality\0";

/// Raw C-ABI NIF body: receives the env, argument count, and the argument
/// words; returns a term word, or `u64::MAX` to signal `badarg`.
pub type ForeignNifFn =
    unsafe extern "C" fn(env: *mut c_void, argc: usize, args: *const OpaqueTerm) -> u64;

/// Metadata record published by an extension's init export.
#[repr(C)]
pub struct RawNifInit {
    pub module: *const c_char,
    pub version: u32,
    pub num_functions: usize,
    pub functions: *const RawNifFunction,
}

#[repr(C)]
pub struct RawNifFunction {
    pub name: *const c_char,
    pub arity: u8,
    pub flags: u32,
    pub fun: ForeignNifFn,
}

/// A foreign entry point plus the library that keeps it mapped.
#[derive(Clone)]
pub struct ForeignNif {
    fun: ForeignNifFn,
    _library: Arc<Library>,
}

impl ForeignNif {
    pub(super) fn invoke(
        &self,
        env: &mut NifEnv<'_>,
        args: &[OpaqueTerm],
    ) -> Result<OpaqueTerm, NifError> {
        let raw = unsafe {
            (self.fun)(env as *mut NifEnv<'_> as *mut c_void, args.len(), args.as_ptr())
        };
        if raw == u64::MAX {
            Err(NifError::Badarg)
        } else {
            Ok(OpaqueTerm::from_raw(raw))
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NifLoadError {
    #[error("failed to open library: {0}")]
    Open(#[from] libloading::Error),
    #[error("library does not export the marker function")]
    NoMarker,
    #[error("marker returned {0:#x}, expected the sentinel")]
    BadSentinel(u32),
    #[error("library lacks the memory-safe runtime symbols")]
    NotSafeCompiled,
    #[error("library metadata is malformed")]
    BadMetadata,
    #[error("extension API version {0} is unsupported")]
    BadVersion(u32),
    #[error(transparent)]
    Atom(#[from] AtomError),
    #[error("source contains an unsafe escape")]
    UnsafeSource,
    #[error("toolchain invocation failed: {0}")]
    Toolchain(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

lazy_static! {
    static ref REGISTRY: DashMap<(Atom, Atom, u8), NifEntry> = DashMap::new();
}

/// Resolves a NIF entry; NIFs override bytecode exports of the same name.
pub fn lookup(module: Atom, function: Atom, arity: u8) -> Option<NifEntry> {
    REGISTRY.get(&(module, function, arity)).map(|entry| entry.value().clone())
}

/// A statically linked extension written against [`NifEnv`].
pub struct NifExtension {
    pub module: String,
    pub version: u32,
    pub functions: Vec<NifFunction>,
}

pub struct NifFunction {
    pub name: String,
    pub arity: u8,
    pub flags: u32,
    pub fun: super::RustNif,
}

/// Registers an in-process extension's entry points.
pub fn register_extension(extension: NifExtension) -> Result<(), NifLoadError> {
    if extension.version != NIF_API_VERSION {
        return Err(NifLoadError::BadVersion(extension.version));
    }
    let module = Atom::intern(&extension.module)?;
    for function in extension.functions {
        let name = Atom::intern(&function.name)?;
        REGISTRY.insert(
            (module, name, function.arity),
            NifEntry {
                module,
                name,
                arity: function.arity,
                flags: function.flags,
                callable: NifCallable::Rust(function.fun),
            },
        );
    }
    info!(target: "nif", "registered extension {}", extension.module);
    Ok(())
}

/// Loads and verifies a shared object, registering its entry points.
pub fn load_library(path: &Path) -> Result<(), NifLoadError> {
    let library = Arc::new(unsafe { Library::new(path)? });

    // Verification 1: the marker export and its sentinel
    let marker = unsafe {
        library
            .get::<unsafe extern "C" fn() -> u32>(MARKER_SYMBOL)
            .map_err(|_| NifLoadError::NoMarker)?
    };
    let sentinel = unsafe { marker() };
    if sentinel != NIF_SENTINEL {
        return Err(NifLoadError::BadSentinel(sentinel));
    }

    // Verification 2: the runtime signature of memory-safe compilation
    let safe = unsafe { library.get::<*const c_void>(SAFE_RUNTIME_SYMBOL) };
    if safe.is_err() {
        return Err(NifLoadError::NotSafeCompiled);
    }

    // Metadata
    let init = unsafe {
        library
            .get::<unsafe extern "C" fn() -> *const RawNifInit>(INIT_SYMBOL)
            .map_err(|_| NifLoadError::BadMetadata)?
    };
    let raw = unsafe { init() };
    if raw.is_null() {
        return Err(NifLoadError::BadMetadata);
    }
    let raw = unsafe { &*raw };
    if raw.version != NIF_API_VERSION {
        return Err(NifLoadError::BadVersion(raw.version));
    }
    if raw.module.is_null() || (raw.num_functions > 0 && raw.functions.is_null()) {
        return Err(NifLoadError::BadMetadata);
    }
    let module_name = unsafe { CStr::from_ptr(raw.module) }
        .to_str()
        .map_err(|_| NifLoadError::BadMetadata)?;
    let module = Atom::intern(module_name)?;

    let functions = unsafe { std::slice::from_raw_parts(raw.functions, raw.num_functions) };
    for function in functions {
        if function.name.is_null() {
            return Err(NifLoadError::BadMetadata);
        }
        let name = unsafe { CStr::from_ptr(function.name) }
            .to_str()
            .map_err(|_| NifLoadError::BadMetadata)?;
        let name = Atom::intern(name)?;
        REGISTRY.insert(
            (module, name, function.arity),
            NifEntry {
                module,
                name,
                arity: function.arity,
                flags: function.flags,
                callable: NifCallable::Foreign(ForeignNif {
                    fun: function.fun,
                    _library: library.clone(),
                }),
            },
        );
    }
    info!(
        target: "nif",
        "loaded extension {} from {} ({} functions)",
        module_name,
        path.display(),
        raw.num_functions
    );
    Ok(())
}

/// Compiles extension source in safe-only mode and loads the result.
pub fn load_source(source_path: &Path, work_dir: &Path) -> Result<(), NifLoadError> {
    let source = std::fs::read_to_string(source_path)?;
    verify_source_is_safe(&source)?;

    let mut hardened = String::with_capacity(source.len() + 64);
    if !source.contains("#![forbid(unsafe_code)]") {
        hardened.push_str("#![forbid(unsafe_code)]\n");
    }
    hardened.push_str(&source);

    let staged = work_dir.join("ember_nif_source.rs");
    let output: PathBuf = work_dir.join(if cfg!(target_os = "macos") {
        "libember_nif.dylib"
    } else {
        "libember_nif.so"
    });
    std::fs::write(&staged, hardened)?;

    let status = std::process::Command::new("rustc")
        .arg("--edition=2021")
        .arg("--crate-type=cdylib")
        .arg("-o")
        .arg(&output)
        .arg(&staged)
        .output()
        .map_err(|err| NifLoadError::Toolchain(err.to_string()))?;
    if !status.status.success() {
        return Err(NifLoadError::Toolchain(
            String::from_utf8_lossy(&status.stderr).into_owned(),
        ));
    }

    load_library(&output)
}

/// Rejects sources that use an unsafe-escape construct. The compile step
/// enforces the same property via `forbid`, but refusing up front gives a
/// typed error instead of a toolchain diagnostic.
fn verify_source_is_safe(source: &str) -> Result<(), NifLoadError> {
    let mut rest = source;
    while let Some(at) = rest.find("unsafe") {
        let before_ok = at == 0
            || !rest[..at]
                .chars()
                .next_back()
                .map(|c| c.is_alphanumeric() || c == '_')
                .unwrap_or(false);
        let after = &rest[at + "unsafe".len()..];
        let after_ok = !after
            .chars()
            .next()
            .map(|c| c.is_alphanumeric() || c == '_')
            .unwrap_or(false);
        // `forbid(unsafe_code)` mentions the word inside an identifier and
        // is exempted by the boundary checks above
        if before_ok && after_ok {
            return Err(NifLoadError::UnsafeSource);
        }
        rest = &rest[at + "unsafe".len()..];
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_source_scan() {
        assert!(verify_source_is_safe("fn add(a: i64) -> i64 { a + 1 }").is_ok());
        assert!(verify_source_is_safe("#![forbid(unsafe_code)]\nfn f() {}").is_ok());
        assert!(matches!(
            verify_source_is_safe("fn f() { unsafe { *(0 as *const u8) }; }"),
            Err(NifLoadError::UnsafeSource)
        ));
        assert!(matches!(
            verify_source_is_safe("unsafe fn f() {}"),
            Err(NifLoadError::UnsafeSource)
        ));
        // The word inside identifiers does not trip the scan
        assert!(verify_source_is_safe("fn not_unsafe_at_all() {}").is_ok());
    }

    #[test]
    fn missing_library_is_an_open_error() {
        let result = load_library(Path::new("/nonexistent/libember_missing.so"));
        assert!(matches!(result, Err(NifLoadError::Open(_))));
    }

    #[test]
    fn registration_and_lookup() {
        fn identity(_: &mut NifEnv<'_>, args: &[OpaqueTerm]) -> Result<OpaqueTerm, NifError> {
            Ok(args[0])
        }
        register_extension(NifExtension {
            module: "loader_test_mod".into(),
            version: NIF_API_VERSION,
            functions: vec![NifFunction {
                name: "identity".into(),
                arity: 1,
                flags: 0,
                fun: identity,
            }],
        })
        .unwrap();

        let module = Atom::intern("loader_test_mod").unwrap();
        let name = Atom::intern("identity").unwrap();
        assert!(lookup(module, name, 1).is_some());
        assert!(lookup(module, name, 2).is_none());

        let rejected = register_extension(NifExtension {
            module: "loader_test_mod".into(),
            version: 99,
            functions: vec![],
        });
        assert!(matches!(rejected, Err(NifLoadError::BadVersion(99))));
    }
}
