//! Finds native operator libraries laid out as `<root>/x64/*` and `<root>/x86/*`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dynlib::image::read_bitness;
use dynlib::Bitness;
use tracing::{debug, info, warn};

use crate::backend::{Backend, BackendError};
use crate::rpc::WorkerConfig;

#[derive(Debug, Clone)]
pub struct DiscoveredLibrary {
    pub path: PathBuf,
    pub bitness: Bitness,
    pub backend: Arc<Backend>,
}

/// Whether `path` looks like a shared library by its name.
pub fn is_library_candidate(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
        return false;
    };
    name.ends_with(".so") || name.contains(".so.") || name.ends_with(".dylib") || name.ends_with(".dll")
}

/// Sorted library candidates directly inside `dir`. A missing directory is empty.
pub fn candidates(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut paths = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.is_file() && is_library_candidate(&path) {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

/// Pointer width of the image at `path`.
pub fn image_bitness(path: &Path) -> Result<Bitness, BackendError> {
    read_bitness(path)
        .map_err(|source| BackendError::Image {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| BackendError::Image {
            path: path.to_path_buf(),
            source: io::Error::new(io::ErrorKind::InvalidData, "not a native image"),
        })
}

/// The worker to load images of `bitness` with: `worker` if given, otherwise
/// the located one for that width.
pub fn worker_for(bitness: Bitness, worker: Option<&WorkerConfig>) -> WorkerConfig {
    match worker {
        Some(config) => config.clone(),
        None => WorkerConfig::locate_for(bitness),
    }
}

/// Open one library, in process if it matches the host's pointer width and
/// through a worker otherwise.
///
/// `worker` overrides the worker executable, otherwise one matching the image's
/// width is located.
///
/// # Safety
///
/// See [`Backend::native`].
pub unsafe fn open_library(path: &Path, worker: Option<&WorkerConfig>) -> Result<DiscoveredLibrary, BackendError> {
    let bitness = image_bitness(path)?;
    let backend = if bitness.is_host() {
        unsafe { Backend::native(path) }?
    } else {
        Backend::remote(path, &worker_for(bitness, worker))?
    };

    Ok(DiscoveredLibrary {
        path: path.to_path_buf(),
        bitness,
        backend: Arc::new(backend),
    })
}

/// Open every library under `root`, host width first. Libraries that fail to
/// open are logged and skipped.
///
/// # Safety
///
/// Runs the initialization code of every library found, see [`Backend::native`].
pub unsafe fn discover(root: &Path, worker: Option<&WorkerConfig>) -> Vec<DiscoveredLibrary> {
    let mut found = Vec::new();

    for bitness in [Bitness::HOST, Bitness::HOST.other()] {
        let dir = root.join(bitness.dir_name());
        let paths = match candidates(&dir) {
            Ok(paths) => paths,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "cannot list libraries");
                continue;
            }
        };
        debug!(dir = %dir.display(), count = paths.len(), "scanning");

        for path in paths {
            match unsafe { open_library(&path, worker) } {
                Ok(library) => {
                    info!(
                        path = %path.display(),
                        name = %library.backend.name(),
                        bitness = %library.bitness,
                        missing = library.backend.missing().len(),
                        "library loaded"
                    );
                    found.push(library);
                }
                Err(e) => warn!(path = %path.display(), error = %e, "skipping library"),
            }
        }
    }

    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::RpcError;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("expr-engine-{}-{}", name, uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_library_candidates() {
        assert!(is_library_candidate(Path::new("x64/libm.so")));
        assert!(is_library_candidate(Path::new("libm.so.6")));
        assert!(is_library_candidate(Path::new("NativeOperators.dll")));
        assert!(is_library_candidate(Path::new("libops.dylib")));
        assert!(!is_library_candidate(Path::new("readme.txt")));
        assert!(!is_library_candidate(Path::new("libm.sol")));
    }

    #[test]
    fn test_candidates_sorted() {
        let dir = scratch_dir("candidates");
        for name in ["libb.so", "liba.so", "notes.md"] {
            fs::write(dir.join(name), b"").unwrap();
        }
        fs::create_dir(dir.join("libdir.so")).unwrap();

        let names: Vec<_> = candidates(&dir)
            .unwrap()
            .into_iter()
            .map(|path| path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["liba.so", "libb.so"]);

        assert!(candidates(&dir.join("missing")).unwrap().is_empty());
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_discover_skips_broken_files() {
        let root = scratch_dir("discover");
        fs::create_dir_all(root.join(Bitness::HOST.dir_name())).unwrap();
        fs::write(root.join(Bitness::HOST.dir_name()).join("libbroken.so"), b"not an image").unwrap();

        let err = unsafe {
            open_library(
                &root.join(Bitness::HOST.dir_name()).join("libbroken.so"),
                None,
            )
        }
        .unwrap_err();
        assert!(matches!(err, BackendError::Image { .. }));

        let found = unsafe { discover(&root, None) };
        assert!(found.is_empty());
        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_foreign_image_goes_to_worker() {
        let root = scratch_dir("foreign");
        let foreign = Bitness::HOST.other();
        let dir = root.join(foreign.dir_name());
        fs::create_dir_all(&dir).unwrap();

        let class = match foreign {
            Bitness::Bits32 => 1,
            Bitness::Bits64 => 2,
        };
        let path = dir.join("libforeign.so");
        fs::write(&path, [0x7f, b'E', b'L', b'F', class, 1, 1, 0]).unwrap();
        assert_eq!(image_bitness(&path).unwrap(), foreign);

        // Never loaded in process: the configured worker is what fails.
        let config = WorkerConfig::new("/nonexistent/expr-engine-worker");
        let err = unsafe { open_library(&path, Some(&config)) }.unwrap_err();
        assert!(
            matches!(err, BackendError::Rpc(RpcError::Spawn { ref path, .. }) if path == &config.executable),
            "{:?}",
            err
        );

        assert_eq!(worker_for(foreign, Some(&config)).executable, config.executable);
        assert!(unsafe { discover(&root, Some(&config)) }.is_empty());
        fs::remove_dir_all(&root).unwrap();
    }
}
