//! Native symbol resolution for module imports.
//!
//! Lookups go to the host's own exports first, then to a library shipped
//! next to the module, and finally to the platform loader's search path.

#![allow(unsafe_code)]

use std::collections::HashMap;
use std::ffi::{c_void, OsStr};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Symbols the host process exports to modules.
pub trait HostExports: Send + Sync {
    /// Address of `symbol` as requested by an import from `library`.
    fn resolve(&self, library: &str, symbol: &str) -> Option<usize>;
}

/// In-process symbol table answering for any library name.
#[derive(Debug, Clone, Default)]
pub struct ExportTable {
    symbols: HashMap<String, usize>,
}

impl ExportTable {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_symbol(mut self, name: impl Into<String>, address: usize) -> Self {
        self.insert(name, address);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, address: usize) {
        self.symbols.insert(name.into(), address);
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

impl HostExports for ExportTable {
    fn resolve(&self, _library: &str, symbol: &str) -> Option<usize> {
        self.symbols.get(symbol).copied()
    }
}

/// A platform library opened on behalf of one module.
pub(crate) struct NativeLibrary {
    name: String,
    path: PathBuf,
    library: libloading::Library,
}

impl NativeLibrary {
    pub(crate) fn open(name: &str, file: impl AsRef<OsStr>) -> Option<Self> {
        let file = file.as_ref();
        // SAFETY: opening a library runs its initializers. Modules only import
        // libraries they were built against.
        match unsafe { libloading::Library::new(file) } {
            Ok(library) => {
                tracing::debug!(library = name, path = ?file, "native library opened");
                Some(Self {
                    name: name.to_owned(),
                    path: PathBuf::from(file),
                    library,
                })
            }
            Err(err) => {
                tracing::debug!(library = name, path = ?file, error = %err, "native library not found");
                None
            }
        }
    }

    pub(crate) fn symbol(self: &Arc<Self>, symbol: &str) -> Option<NativeSymbol> {
        // SAFETY: the symbol is read as an untyped address only. Casting it to
        // something callable is the caller's responsibility.
        let address = unsafe { self.library.get::<*const c_void>(symbol.as_bytes()) }
            .ok()
            .map(|sym| *sym as usize)?;
        Some(NativeSymbol {
            address,
            library: Some(Arc::clone(self)),
        })
    }
}

impl fmt::Debug for NativeLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeLibrary")
            .field("name", &self.name)
            .field("path", &self.path)
            .finish()
    }
}

/// A resolved native symbol. Keeps its library loaded while held.
#[derive(Debug, Clone)]
pub struct NativeSymbol {
    address: usize,
    library: Option<Arc<NativeLibrary>>,
}

impl NativeSymbol {
    pub(crate) fn from_host(address: usize) -> Self {
        Self {
            address,
            library: None,
        }
    }

    pub fn address(&self) -> usize {
        self.address
    }

    /// True when the symbol came from the host's exports rather than a library.
    pub fn is_host_export(&self) -> bool {
        self.library.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn export_table_answers_by_symbol_name() {
        let table = ExportTable::new()
            .with_symbol("heart_log", 0x1000)
            .with_symbol("heart_time", 0x2000);

        assert_eq!(table.len(), 2);
        assert_eq!(table.resolve("__Internal", "heart_log"), Some(0x1000));
        assert_eq!(table.resolve("anything", "heart_time"), Some(0x2000));
        assert_eq!(table.resolve("__Internal", "missing"), None);
    }

    #[test]
    fn opening_a_bogus_file_fails_quietly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(libloading::library_filename("broken"));
        std::fs::write(&path, b"definitely not ELF").unwrap();
        assert!(NativeLibrary::open("broken", &path).is_none());
    }

    #[test]
    fn host_symbols_carry_no_library() {
        let symbol = NativeSymbol::from_host(0x42);
        assert_eq!(symbol.address(), 0x42);
        assert!(symbol.is_host_export());
    }
}
