use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::warn;

use super::{BackendError, BinaryFn, LibraryInfo, SymbolResolver, UnaryFn, EXTENSION_INFO_SYMBOL};
use crate::rpc::{Connection, RemoteBridge, RpcError, Signature, Value, WorkerConfig};

/// Resolves backend slots through a worker process.
///
/// All slots share one connection. The lock is held for exactly one round-trip,
/// and the worker lives until the last function referencing it is dropped.
pub struct RemoteResolver<C: Connection = RemoteBridge> {
    connection: Arc<Mutex<C>>,
}

impl RemoteResolver {
    pub fn spawn(library: &Path, config: &WorkerConfig) -> Result<RemoteResolver, RpcError> {
        RemoteBridge::spawn(library, config).map(RemoteResolver::new)
    }
}

impl<C: Connection> RemoteResolver<C> {
    pub fn new(connection: C) -> RemoteResolver<C> {
        RemoteResolver {
            connection: Arc::new(Mutex::new(connection)),
        }
    }

    fn exists(&self, symbol: &str) -> Result<bool, BackendError> {
        Ok(with_connection(&self.connection, |connection| {
            connection.client().symbol_exists(symbol)
        })?)
    }
}

fn with_connection<C: Connection, R>(connection: &Mutex<C>, f: impl FnOnce(&mut C) -> R) -> R {
    let mut guard = connection.lock().unwrap_or_else(PoisonError::into_inner);
    f(&mut guard)
}

/// Forward one call, reporting failures as NaN since evaluation cannot fail.
fn forward<C: Connection>(connection: &Mutex<C>, symbol: &'static str, args: &[f64]) -> f64 {
    match with_connection(connection, |connection| connection.client().invoke_f64(symbol, args)) {
        Ok(value) => value,
        Err(e) => {
            warn!(symbol, error = %e, "remote call failed");
            f64::NAN
        }
    }
}

impl<C: Connection> SymbolResolver for RemoteResolver<C> {
    fn library_info(&self) -> Result<LibraryInfo, BackendError> {
        with_connection(&self.connection, |connection| {
            let info = match connection
                .client()
                .invoke(EXTENSION_INFO_SYMBOL, Signature::ExtensionInfo, &[])
            {
                Ok(Value::ExtensionInfo(info)) => info,
                Ok(other) => {
                    return Err(RpcError::Protocol(format!("`get_extension_info` returned {:?}", other)).into())
                }
                Err(RpcError::SymbolNotFound(_)) => {
                    return Err(BackendError::MissingExtensionInfo {
                        library: connection.library().display().to_string(),
                    })
                }
                Err(e) => return Err(e.into()),
            };

            Ok(LibraryInfo {
                name: connection.client().resolve_ansi_string(info.library_name)?,
                version_major: info.version_major,
                version_minor: info.version_minor,
                version_build: info.version_build,
                flags: info.flags,
            })
        })
    }

    fn constant(&self, symbol: &'static str) -> Result<Option<f64>, BackendError> {
        if !self.exists(symbol)? {
            return Ok(None);
        }
        let value = with_connection(&self.connection, |connection| connection.client().invoke_f64(symbol, &[]))?;
        Ok(Some(value))
    }

    fn binary(&self, symbol: &'static str) -> Result<Option<BinaryFn>, BackendError> {
        if !self.exists(symbol)? {
            return Ok(None);
        }
        let connection = self.connection.clone();
        Ok(Some(Arc::new(move |a: f64, b: f64| forward(&connection, symbol, &[a, b])) as BinaryFn))
    }

    fn unary(&self, symbol: &'static str) -> Result<Option<UnaryFn>, BackendError> {
        if !self.exists(symbol)? {
            return Ok(None);
        }
        let connection = self.connection.clone();
        Ok(Some(Arc::new(move |a: f64| forward(&connection, symbol, &[a])) as UnaryFn))
    }
}
