//! Tables of numeric primitives an expression is evaluated with.
//!
//! A [`Backend`] holds two constants, six binary operators and seventeen unary
//! functions. It is built once, never mutated afterwards and shared between
//! expressions through an `Arc`.

use std::fmt;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use dynlib::LibraryError;
use thiserror::Error;
use tracing::debug;

use crate::rpc::{RpcError, WorkerConfig};

pub mod native;
pub mod reference;
pub mod remote;

pub use native::{ExtensionInfo, NativeResolver};
pub use remote::RemoteResolver;

pub type BinaryFn = Arc<dyn Fn(f64, f64) -> f64 + Send + Sync>;
pub type UnaryFn = Arc<dyn Fn(f64) -> f64 + Send + Sync>;

/// Name of the metadata entry point every native library must export.
pub const EXTENSION_INFO_SYMBOL: &str = "get_extension_info";

pub const FLAG_SSE: u32 = 1 << 0;
pub const FLAG_SSE2: u32 = 1 << 1;
pub const FLAG_AVX: u32 = 1 << 2;
pub const FLAG_AVX2: u32 = 1 << 3;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error(transparent)]
    Library(#[from] LibraryError),

    #[error("{library} does not export `get_extension_info`")]
    MissingExtensionInfo { library: String },

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("cannot read {}: {source}", .path.display())]
    Image {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Pow,
    Remainder,
}

impl BinaryOp {
    pub const ALL: [BinaryOp; 6] = [
        BinaryOp::Add,
        BinaryOp::Subtract,
        BinaryOp::Multiply,
        BinaryOp::Divide,
        BinaryOp::Pow,
        BinaryOp::Remainder,
    ];

    pub fn from_char(c: char) -> Option<BinaryOp> {
        match c {
            '+' => Some(BinaryOp::Add),
            '-' => Some(BinaryOp::Subtract),
            '*' => Some(BinaryOp::Multiply),
            '/' => Some(BinaryOp::Divide),
            '^' => Some(BinaryOp::Pow),
            '%' => Some(BinaryOp::Remainder),
            _ => None,
        }
    }

    pub fn as_char(self) -> char {
        match self {
            BinaryOp::Add => '+',
            BinaryOp::Subtract => '-',
            BinaryOp::Multiply => '*',
            BinaryOp::Divide => '/',
            BinaryOp::Pow => '^',
            BinaryOp::Remainder => '%',
        }
    }

    /// Name of the exported native symbol.
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "operator_add",
            BinaryOp::Subtract => "operator_subtract",
            BinaryOp::Multiply => "operator_multiply",
            BinaryOp::Divide => "operator_divide",
            BinaryOp::Pow => "operator_pow",
            BinaryOp::Remainder => "operator_remainder",
        }
    }

    pub fn precedence(self) -> u8 {
        match self {
            BinaryOp::Add | BinaryOp::Subtract => 1,
            BinaryOp::Multiply | BinaryOp::Divide | BinaryOp::Remainder => 2,
            BinaryOp::Pow => 3,
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryFunction {
    Abs,
    Sqrt,
    Exp,
    Ln,
    Log,
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Sinh,
    Cosh,
    Tanh,
    Round,
    Floor,
    Ceil,
}

impl UnaryFunction {
    pub const ALL: [UnaryFunction; 17] = [
        UnaryFunction::Abs,
        UnaryFunction::Sqrt,
        UnaryFunction::Exp,
        UnaryFunction::Ln,
        UnaryFunction::Log,
        UnaryFunction::Sin,
        UnaryFunction::Cos,
        UnaryFunction::Tan,
        UnaryFunction::Asin,
        UnaryFunction::Acos,
        UnaryFunction::Atan,
        UnaryFunction::Sinh,
        UnaryFunction::Cosh,
        UnaryFunction::Tanh,
        UnaryFunction::Round,
        UnaryFunction::Floor,
        UnaryFunction::Ceil,
    ];

    /// Every function binds tighter than any binary operator.
    pub const PRECEDENCE: u8 = 4;

    pub fn from_name(name: &str) -> Option<UnaryFunction> {
        UnaryFunction::ALL.into_iter().find(|f| f.name() == name)
    }

    /// Keyword used in expressions.
    pub fn name(self) -> &'static str {
        match self {
            UnaryFunction::Abs => "abs",
            UnaryFunction::Sqrt => "sqrt",
            UnaryFunction::Exp => "exp",
            UnaryFunction::Ln => "ln",
            UnaryFunction::Log => "log",
            UnaryFunction::Sin => "sin",
            UnaryFunction::Cos => "cos",
            UnaryFunction::Tan => "tan",
            UnaryFunction::Asin => "asin",
            UnaryFunction::Acos => "acos",
            UnaryFunction::Atan => "atan",
            UnaryFunction::Sinh => "sinh",
            UnaryFunction::Cosh => "cosh",
            UnaryFunction::Tanh => "tanh",
            UnaryFunction::Round => "round",
            UnaryFunction::Floor => "floor",
            UnaryFunction::Ceil => "ceil",
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            UnaryFunction::Abs => "operator_abs",
            UnaryFunction::Sqrt => "operator_sqrt",
            UnaryFunction::Exp => "operator_exp",
            UnaryFunction::Ln => "operator_ln",
            UnaryFunction::Log => "operator_log",
            UnaryFunction::Sin => "operator_sin",
            UnaryFunction::Cos => "operator_cos",
            UnaryFunction::Tan => "operator_tan",
            UnaryFunction::Asin => "operator_asin",
            UnaryFunction::Acos => "operator_acos",
            UnaryFunction::Atan => "operator_atan",
            UnaryFunction::Sinh => "operator_sinh",
            UnaryFunction::Cosh => "operator_cosh",
            UnaryFunction::Tanh => "operator_tanh",
            UnaryFunction::Round => "operator_round",
            UnaryFunction::Floor => "operator_floor",
            UnaryFunction::Ceil => "operator_ceil",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Constant {
    E,
    Pi,
}

impl Constant {
    pub const ALL: [Constant; 2] = [Constant::E, Constant::Pi];

    /// `e`, `E`, `pi` and `PI` are recognized, nothing else.
    pub fn from_name(name: &str) -> Option<Constant> {
        match name {
            "e" | "E" => Some(Constant::E),
            "pi" | "PI" => Some(Constant::Pi),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Constant::E => "e",
            Constant::Pi => "pi",
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Constant::E => "constant_e",
            Constant::Pi => "constant_pi",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Every native symbol a backend table is built from, in table order.
pub fn all_symbols() -> impl Iterator<Item = &'static str> {
    Constant::ALL
        .into_iter()
        .map(Constant::symbol)
        .chain(BinaryOp::ALL.into_iter().map(BinaryOp::symbol))
        .chain(UnaryFunction::ALL.into_iter().map(UnaryFunction::symbol))
}

/// Strip the `operator_` / `constant_` prefix of a native symbol name.
pub fn bare_name(symbol: &str) -> &str {
    symbol
        .strip_prefix("operator_")
        .or_else(|| symbol.strip_prefix("constant_"))
        .unwrap_or(symbol)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Double,
    Float,
    Native,
    Remote,
}

/// Metadata a native library reports through `get_extension_info`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LibraryInfo {
    pub name: Option<String>,
    pub version_major: u16,
    pub version_minor: u16,
    pub version_build: u16,
    pub flags: u32,
}

impl LibraryInfo {
    /// Human readable implementation name, e.g. `GNU GCC v7.2.0 [AVX2]`.
    ///
    /// The build number is only shown when it is non-zero, the version only when
    /// any of its parts is, and only the highest instruction set flag is shown.
    /// A library without a name is just `Unknown`.
    pub fn display_name(&self) -> String {
        let Some(mut name) = self.name.clone() else {
            return "Unknown".to_string();
        };

        if self.version_build != 0 {
            name.push_str(&format!(
                " v{}.{}.{}",
                self.version_major, self.version_minor, self.version_build
            ));
        } else if self.version_major != 0 || self.version_minor != 0 {
            name.push_str(&format!(" v{}.{}", self.version_major, self.version_minor));
        }

        let flag = if self.flags & FLAG_AVX2 != 0 {
            Some("AVX2")
        } else if self.flags & FLAG_AVX != 0 {
            Some("AVX")
        } else if self.flags & FLAG_SSE2 != 0 {
            Some("SSE2")
        } else if self.flags & FLAG_SSE != 0 {
            Some("SSE")
        } else {
            None
        };

        if let Some(flag) = flag {
            name.push_str(&format!(" [{}]", flag));
        }

        name
    }
}

/// Source of native symbols a [`Backend`] can be built from.
///
/// Each lookup returns `Ok(None)` when the library does not provide the symbol,
/// in which case the double precision reference is used for that slot.
pub trait SymbolResolver {
    fn library_info(&self) -> Result<LibraryInfo, BackendError>;

    fn constant(&self, symbol: &'static str) -> Result<Option<f64>, BackendError>;

    fn binary(&self, symbol: &'static str) -> Result<Option<BinaryFn>, BackendError>;

    fn unary(&self, symbol: &'static str) -> Result<Option<UnaryFn>, BackendError>;
}

/// An immutable table of numeric primitives.
#[derive(Clone)]
pub struct Backend {
    name: String,
    kind: BackendKind,
    constants: [f64; 2],
    binary: [BinaryFn; 6],
    unary: [UnaryFn; 17],
    missing: Vec<&'static str>,
}

impl Backend {
    /// The host's double precision math.
    pub fn double() -> Backend {
        Backend {
            name: "Rust (double)".to_string(),
            kind: BackendKind::Double,
            constants: std::array::from_fn(|i| reference::double_constant(Constant::ALL[i])),
            binary: std::array::from_fn(|i| reference::double_binary(BinaryOp::ALL[i])),
            unary: std::array::from_fn(|i| reference::double_unary(UnaryFunction::ALL[i])),
            missing: Vec::new(),
        }
    }

    /// The host's math with every operand and result rounded to `f32`.
    pub fn float() -> Backend {
        Backend {
            name: "Rust (float)".to_string(),
            kind: BackendKind::Float,
            constants: std::array::from_fn(|i| reference::float_constant(Constant::ALL[i])),
            binary: std::array::from_fn(|i| reference::float_binary(BinaryOp::ALL[i])),
            unary: std::array::from_fn(|i| reference::float_unary(UnaryFunction::ALL[i])),
            missing: Vec::new(),
        }
    }

    /// Shared instance of [`Backend::double`], the default for new expressions.
    pub fn shared_double() -> Arc<Backend> {
        static DOUBLE: OnceLock<Arc<Backend>> = OnceLock::new();
        DOUBLE.get_or_init(|| Arc::new(Backend::double())).clone()
    }

    /// Build a table from a symbol source.
    ///
    /// Slots the resolver cannot provide keep the double precision reference and
    /// are recorded in [`Backend::missing`].
    ///
    /// # Errors
    ///
    /// Fails if the library metadata cannot be read or if the resolver reports
    /// a hard error (e.g. a broken RPC channel).
    pub fn from_resolver<R: SymbolResolver>(kind: BackendKind, resolver: &R) -> Result<Backend, BackendError> {
        let info = resolver.library_info()?;

        let mut backend = Backend::double();
        backend.kind = kind;
        backend.name = info.display_name();

        for constant in Constant::ALL {
            match resolver.constant(constant.symbol())? {
                Some(value) => backend.constants[constant.index()] = value,
                None => backend.missing.push(constant.symbol()),
            }
        }

        for op in BinaryOp::ALL {
            match resolver.binary(op.symbol())? {
                Some(function) => backend.binary[op.index()] = function,
                None => backend.missing.push(op.symbol()),
            }
        }

        for function in UnaryFunction::ALL {
            match resolver.unary(function.symbol())? {
                Some(resolved) => backend.unary[function.index()] = resolved,
                None => backend.missing.push(function.symbol()),
            }
        }

        debug!(
            name = %backend.name,
            kind = ?kind,
            missing = backend.missing.len(),
            "backend constructed"
        );
        Ok(backend)
    }

    /// Load a native library of the host's pointer width into this process.
    ///
    /// # Safety
    ///
    /// The library's initialization code runs, and every exported symbol named
    /// after a slot must have the native operator ABI signature.
    pub unsafe fn native(path: impl AsRef<Path>) -> Result<Backend, BackendError> {
        let library = unsafe { dynlib::Library::open(path.as_ref()) }?;
        let label = library.path().display().to_string();
        let resolver = unsafe { NativeResolver::new(Arc::new(library), label) };
        Backend::from_resolver(BackendKind::Native, &resolver)
    }

    /// Load a native library in a worker process and forward every call to it.
    ///
    /// The worker is shut down when the last clone of this backend (or of any
    /// function taken from it) is dropped, or immediately if construction fails.
    pub fn remote(path: impl AsRef<Path>, config: &WorkerConfig) -> Result<Backend, BackendError> {
        let resolver = RemoteResolver::spawn(path.as_ref(), config)?;
        Backend::from_resolver(BackendKind::Remote, &resolver)
    }

    /// Load a native library in process, or through a worker if its pointer width
    /// differs from the host's.
    ///
    /// `worker` overrides the worker executable, otherwise one matching the
    /// library's width is located with [`WorkerConfig::locate_for`].
    ///
    /// # Safety
    ///
    /// See [`Backend::native`].
    pub unsafe fn open(path: impl AsRef<Path>, worker: Option<&WorkerConfig>) -> Result<Backend, BackendError> {
        let path = path.as_ref();
        match unsafe { Backend::native(path) } {
            Err(BackendError::Library(LibraryError::BadImageFormat { found, .. })) => {
                let config = worker.cloned().unwrap_or_else(|| WorkerConfig::locate_for(found));
                debug!(
                    path = %path.display(),
                    bitness = %found,
                    worker = %config.executable.display(),
                    "foreign image, using worker"
                );
                Backend::remote(path, &config)
            }
            result => result,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    pub fn constant(&self, constant: Constant) -> f64 {
        self.constants[constant.index()]
    }

    pub fn binary(&self, op: BinaryOp) -> &BinaryFn {
        &self.binary[op.index()]
    }

    pub fn unary(&self, function: UnaryFunction) -> &UnaryFn {
        &self.unary[function.index()]
    }

    /// Symbols the library did not provide, in table order.
    pub fn missing(&self) -> &[&'static str] {
        &self.missing
    }

    pub fn is_missing(&self, symbol: &str) -> bool {
        self.missing.iter().any(|missing| *missing == symbol)
    }

    /// Missing symbols as a comma separated list of bare names, e.g. `abs, log`.
    pub fn missing_display(&self) -> String {
        self.missing
            .iter()
            .map(|symbol| bare_name(symbol))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Backend")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("constants", &self.constants)
            .field("missing", &self.missing)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct PartialResolver {
        missing: &'static [&'static str],
    }

    impl SymbolResolver for PartialResolver {
        fn library_info(&self) -> Result<LibraryInfo, BackendError> {
            Ok(LibraryInfo {
                name: Some("Partial".to_string()),
                ..LibraryInfo::default()
            })
        }

        fn constant(&self, symbol: &'static str) -> Result<Option<f64>, BackendError> {
            Ok((!self.missing.contains(&symbol)).then_some(42.0))
        }

        fn binary(&self, symbol: &'static str) -> Result<Option<BinaryFn>, BackendError> {
            Ok((!self.missing.contains(&symbol)).then(|| Arc::new(|_: f64, _: f64| -1.0) as BinaryFn))
        }

        fn unary(&self, symbol: &'static str) -> Result<Option<UnaryFn>, BackendError> {
            Ok((!self.missing.contains(&symbol)).then(|| Arc::new(|_: f64| -2.0) as UnaryFn))
        }
    }

    #[test]
    fn test_symbol_names() {
        let symbols: Vec<_> = all_symbols().collect();
        assert_eq!(symbols.len(), 25);
        assert_eq!(symbols[0], "constant_e");
        assert_eq!(symbols[2], "operator_add");
        assert_eq!(symbols[24], "operator_ceil");
        assert_eq!(bare_name("operator_abs"), "abs");
        assert_eq!(bare_name("constant_pi"), "pi");
        assert_eq!(bare_name("get_extension_info"), "get_extension_info");
    }

    #[test]
    fn test_lookups() {
        assert_eq!(BinaryOp::from_char('%'), Some(BinaryOp::Remainder));
        assert_eq!(BinaryOp::from_char('!'), None);
        assert_eq!(UnaryFunction::from_name("tanh"), Some(UnaryFunction::Tanh));
        assert_eq!(UnaryFunction::from_name("Sin"), None);
        assert_eq!(Constant::from_name("PI"), Some(Constant::Pi));
        assert_eq!(Constant::from_name("Pi"), None);
        for op in BinaryOp::ALL {
            assert_eq!(BinaryOp::from_char(op.as_char()), Some(op));
        }
    }

    #[test]
    fn test_display_name() {
        let mut info = LibraryInfo {
            name: Some("GNU GCC".to_string()),
            version_major: 7,
            version_minor: 2,
            version_build: 0,
            flags: FLAG_SSE | FLAG_SSE2 | FLAG_AVX2,
        };
        assert_eq!(info.display_name(), "GNU GCC v7.2 [AVX2]");

        info.version_build = 1;
        info.flags = FLAG_SSE;
        assert_eq!(info.display_name(), "GNU GCC v7.2.1 [SSE]");

        info.version_major = 0;
        info.version_minor = 0;
        info.version_build = 0;
        info.flags = 0;
        assert_eq!(info.display_name(), "GNU GCC");

        info.name = None;
        info.version_build = 3;
        info.flags = FLAG_AVX2;
        assert_eq!(info.display_name(), "Unknown");
    }

    #[test]
    fn test_reference_tables_are_complete() {
        let double = Backend::double();
        assert!(double.missing().is_empty());
        assert_eq!(double.kind(), BackendKind::Double);
        assert_eq!(double.name(), "Rust (double)");
        assert_eq!(Backend::float().name(), "Rust (float)");
        assert!(Arc::ptr_eq(&Backend::shared_double(), &Backend::shared_double()));
    }

    #[test]
    fn test_missing_fall_back_to_double() {
        let resolver = PartialResolver {
            missing: &["constant_pi", "operator_pow", "operator_abs", "operator_log"],
        };
        let backend = Backend::from_resolver(BackendKind::Native, &resolver).unwrap();

        assert_eq!(backend.name(), "Partial");
        assert_eq!(
            backend.missing(),
            &["constant_pi", "operator_pow", "operator_abs", "operator_log"]
        );
        assert_eq!(backend.missing_display(), "pi, pow, abs, log");
        assert!(backend.is_missing("operator_abs"));
        assert!(!backend.is_missing("operator_sqrt"));

        assert_eq!(backend.constant(Constant::E), 42.0);
        assert_eq!(backend.constant(Constant::Pi), std::f64::consts::PI);
        assert_eq!(backend.binary(BinaryOp::Add)(1.0, 2.0), -1.0);
        assert_eq!(backend.binary(BinaryOp::Pow)(2.0, 3.0), 8.0);
        assert_eq!(backend.unary(UnaryFunction::Sqrt)(4.0), -2.0);
        assert_eq!(backend.unary(UnaryFunction::Abs)(-4.0), 4.0);
        assert_eq!(backend.unary(UnaryFunction::Log)(100.0), 2.0);
    }
}
