//! Arithmetic expressions of one variable, evaluated with interchangeable
//! numeric backends: the host's double or float math, a native library loaded
//! in process, or a native library of another pointer width running in a
//! worker process.

pub mod backend;
pub mod differences;
pub mod discovery;
pub mod evaluator;
pub mod expression;
pub mod logging;
pub mod parser;
pub mod rpc;
pub mod tokenizer;

pub use backend::{Backend, BackendError, BackendKind};
pub use differences::{Difference, DifferenceSearch, SearchError};
pub use expression::Expression;
pub use parser::{SyntaxError, SyntaxErrorKind};
