pub mod image;
pub mod library;

pub use image::Bitness;
pub use library::{Library, LibraryError, SymbolTable};
