use std::ffi::{c_void, CStr, CString};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

use thiserror::Error;
use tracing::debug;

use crate::image::{self, Bitness};

#[derive(Debug, Error)]
pub enum LibraryError {
    #[error("library path contains an interior NUL byte: {}", .0.display())]
    InvalidPath(PathBuf),

    #[error("{} is a {found} image, this process is {expected}", .path.display())]
    BadImageFormat {
        path: PathBuf,
        expected: Bitness,
        found: Bitness,
    },

    #[error("dlopen({}) failed: {message}", .path.display())]
    Open { path: PathBuf, message: String },
}

/// Lookup of exported symbols by name.
///
/// Implemented by [`Library`]; anything else that can hand out addresses of
/// C-callable functions (for example a table of functions linked into the
/// current binary) can stand in for a loaded library.
pub trait SymbolTable {
    /// Address of the exported symbol `name`, or `None` if it is not exported.
    fn symbol(&self, name: &str) -> Option<NonNull<c_void>>;

    fn contains(&self, name: &str) -> bool {
        self.symbol(name).is_some()
    }
}

/// A dynamically loaded native library.
///
/// The library is opened with `dlopen` and closed with `dlclose` on drop.
#[derive(Debug)]
pub struct Library {
    handle: NonNull<c_void>,
    path: PathBuf,
}

// dlsym and dlclose are thread-safe, the handle is never mutated.
unsafe impl Send for Library {}
unsafe impl Sync for Library {}

impl Library {
    /// Load the library at `path`.
    ///
    /// Relative paths are looked up next to the current executable first, in the
    /// directory for the host pointer width (`x64/` or `x86/`) and then in the
    /// executable's own directory. If neither exists the path is passed to
    /// `dlopen` unchanged so the system search path applies (e.g. `libm.so.6`).
    ///
    /// # Errors
    ///
    /// [`LibraryError::BadImageFormat`] if the file is an image for the other
    /// pointer width, [`LibraryError::Open`] if `dlopen` fails.
    ///
    /// # Safety
    ///
    /// Loading a library runs its initialization routines. The caller must trust
    /// the library not to violate memory safety on load or unload.
    pub unsafe fn open(path: impl AsRef<Path>) -> Result<Library, LibraryError> {
        let path = resolve_path(path.as_ref());

        if let Ok(Some(found)) = image::read_bitness(&path) {
            if !found.is_host() {
                return Err(LibraryError::BadImageFormat {
                    path,
                    expected: Bitness::HOST,
                    found,
                });
            }
        }

        let c_path = path_to_cstring(&path)?;
        let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW | libc::RTLD_LOCAL) };

        match NonNull::new(handle) {
            Some(handle) => {
                debug!(path = %path.display(), "library loaded");
                Ok(Library { handle, path })
            }
            None => Err(LibraryError::Open {
                path,
                message: last_dl_error(),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SymbolTable for Library {
    fn symbol(&self, name: &str) -> Option<NonNull<c_void>> {
        let name = CString::new(name).ok()?;
        let ptr = unsafe { libc::dlsym(self.handle.as_ptr(), name.as_ptr()) };
        NonNull::new(ptr)
    }
}

impl Drop for Library {
    fn drop(&mut self) {
        unsafe {
            if libc::dlclose(self.handle.as_ptr()) != 0 {
                debug!(path = %self.path.display(), error = %last_dl_error(), "dlclose failed");
            }
        }
    }
}

/// Resolve a relative library path against the directory of the current executable.
fn resolve_path(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }

    let exe_dir = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf));

    if let Some(exe_dir) = exe_dir {
        let by_bitness = exe_dir.join(Bitness::HOST.dir_name()).join(path);
        if by_bitness.is_file() {
            return by_bitness;
        }

        let beside = exe_dir.join(path);
        if beside.is_file() {
            return beside;
        }
    }

    path.to_path_buf()
}

fn path_to_cstring(path: &Path) -> Result<CString, LibraryError> {
    use std::os::unix::ffi::OsStrExt;

    CString::new(path.as_os_str().as_bytes()).map_err(|_| LibraryError::InvalidPath(path.to_path_buf()))
}

fn last_dl_error() -> String {
    let message = unsafe { libc::dlerror() };
    if message.is_null() {
        return "unknown error".to_string();
    }

    unsafe { CStr::from_ptr(message) }.to_string_lossy().into_owned()
}
