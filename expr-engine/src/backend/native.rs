use std::ffi::{c_void, CStr};
use std::ptr::NonNull;
use std::sync::Arc;

use dynlib::SymbolTable;
use libc::c_char;
use tracing::debug;

use super::{BackendError, BinaryFn, LibraryInfo, SymbolResolver, UnaryFn, EXTENSION_INFO_SYMBOL};

/// C layout of the structure returned by `get_extension_info`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ExtensionInfo {
    pub library_name: *const c_char,
    pub version_major: u16,
    pub version_minor: u16,
    pub version_build: u16,
    pub flags: u32,
}

pub type ConstantFn = extern "C" fn() -> f64;
pub type RawUnaryFn = extern "C" fn(f64) -> f64;
pub type RawBinaryFn = extern "C" fn(f64, f64) -> f64;
pub type ExtensionInfoFn = extern "C" fn() -> ExtensionInfo;

/// Reinterpret a symbol address as a function pointer.
///
/// # Safety
///
/// `F` must be a function pointer type matching the real signature of the code
/// at `address`.
pub unsafe fn function_at<F: Copy>(address: NonNull<c_void>) -> F {
    debug_assert_eq!(std::mem::size_of::<F>(), std::mem::size_of::<*const c_void>());
    unsafe { std::mem::transmute_copy::<*mut c_void, F>(&address.as_ptr()) }
}

/// Resolves backend slots from a library loaded into this process.
///
/// Every resolved function keeps a reference to the symbol table, so the
/// library stays loaded for as long as any expression can still call into it.
pub struct NativeResolver<T> {
    table: Arc<T>,
    label: String,
}

impl<T: SymbolTable + Send + Sync + 'static> NativeResolver<T> {
    /// # Safety
    ///
    /// Every symbol of `table` named like a backend slot (and
    /// `get_extension_info`) must have the native operator ABI signature.
    pub unsafe fn new(table: Arc<T>, label: impl Into<String>) -> NativeResolver<T> {
        NativeResolver {
            table,
            label: label.into(),
        }
    }

    fn function<F: Copy>(&self, symbol: &str) -> Option<F> {
        let address = self.table.symbol(symbol)?;
        debug!(symbol, address = ?address, "resolved");
        // The constructor's contract covers the signature.
        Some(unsafe { function_at::<F>(address) })
    }
}

impl<T: SymbolTable + Send + Sync + 'static> SymbolResolver for NativeResolver<T> {
    fn library_info(&self) -> Result<LibraryInfo, BackendError> {
        let get_extension_info = self
            .function::<ExtensionInfoFn>(EXTENSION_INFO_SYMBOL)
            .ok_or_else(|| BackendError::MissingExtensionInfo {
                library: self.label.clone(),
            })?;

        let info = get_extension_info();
        let name = if info.library_name.is_null() {
            None
        } else {
            Some(unsafe { CStr::from_ptr(info.library_name) }.to_string_lossy().into_owned())
        };

        Ok(LibraryInfo {
            name,
            version_major: info.version_major,
            version_minor: info.version_minor,
            version_build: info.version_build,
            flags: info.flags,
        })
    }

    fn constant(&self, symbol: &'static str) -> Result<Option<f64>, BackendError> {
        Ok(self.function::<ConstantFn>(symbol).map(|constant| constant()))
    }

    fn binary(&self, symbol: &'static str) -> Result<Option<BinaryFn>, BackendError> {
        Ok(self.function::<RawBinaryFn>(symbol).map(|function| {
            let table = self.table.clone();
            Arc::new(move |a: f64, b: f64| {
                let _loaded = &table;
                function(a, b)
            }) as BinaryFn
        }))
    }

    fn unary(&self, symbol: &'static str) -> Result<Option<UnaryFn>, BackendError> {
        Ok(self.function::<RawUnaryFn>(symbol).map(|function| {
            let table = self.table.clone();
            Arc::new(move |a: f64| {
                let _loaded = &table;
                function(a)
            }) as UnaryFn
        }))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::backend::{Backend, BackendKind, BinaryOp, Constant, UnaryFunction};

    /// Symbol table backed by the reference native library linked into the test binary.
    pub(crate) struct LinkedOperators {
        symbols: HashMap<&'static str, usize>,
    }

    impl LinkedOperators {
        pub(crate) fn without(missing: &[&str]) -> LinkedOperators {
            let symbols = native_operators::exported_symbols()
                .into_iter()
                .filter(|(name, _)| !missing.contains(name))
                .map(|(name, ptr)| (name, ptr as usize))
                .collect();
            LinkedOperators { symbols }
        }
    }

    impl SymbolTable for LinkedOperators {
        fn symbol(&self, name: &str) -> Option<NonNull<c_void>> {
            self.symbols
                .get(name)
                .and_then(|address| NonNull::new(*address as *mut c_void))
        }
    }

    pub(crate) fn linked_backend(missing: &[&str]) -> Backend {
        let resolver = unsafe { NativeResolver::new(Arc::new(LinkedOperators::without(missing)), "linked") };
        Backend::from_resolver(BackendKind::Native, &resolver).unwrap()
    }

    #[test]
    fn test_native_backend_complete() {
        let backend = linked_backend(&[]);
        assert!(backend.missing().is_empty());
        assert_eq!(backend.kind(), BackendKind::Native);
        assert!(backend.name().starts_with("Rust libm v0.1"));
        assert_eq!(backend.constant(Constant::Pi), std::f64::consts::PI);
        assert_eq!(backend.binary(BinaryOp::Pow)(2.0, 10.0), 1024.0);
        // C `round` rounds half away from zero.
        assert_eq!(backend.unary(UnaryFunction::Round)(6.5), 7.0);
    }

    #[test]
    fn test_native_backend_missing_symbols() {
        let backend = linked_backend(&["operator_abs", "operator_log"]);
        assert_eq!(backend.missing(), &["operator_abs", "operator_log"]);
        assert_eq!(backend.unary(UnaryFunction::Abs)(-3.0), 3.0);
        assert_eq!(backend.unary(UnaryFunction::Log)(1000.0), 3.0);
    }

    #[test]
    fn test_missing_extension_info_fails() {
        let resolver =
            unsafe { NativeResolver::new(Arc::new(LinkedOperators::without(&[EXTENSION_INFO_SYMBOL])), "linked") };
        let err = Backend::from_resolver(BackendKind::Native, &resolver).unwrap_err();
        assert!(matches!(err, BackendError::MissingExtensionInfo { .. }));
    }

    #[test]
    fn test_functions_keep_table_alive() {
        let table = Arc::new(LinkedOperators::without(&[]));
        let resolver = unsafe { NativeResolver::new(table.clone(), "linked") };
        let add = resolver.binary("operator_add").unwrap().unwrap();
        drop(resolver);
        assert_eq!(Arc::strong_count(&table), 2);
        assert_eq!(add(1.0, 2.0), 3.0);
        drop(add);
        assert_eq!(Arc::strong_count(&table), 1);
    }
}
