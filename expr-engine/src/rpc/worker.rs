//! Server end of the bridge, run inside the worker process.

use std::collections::HashMap;
use std::ffi::{c_void, CStr};
use std::io::{Read, Write};
use std::os::unix::net::UnixListener;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::ptr::NonNull;

use dynlib::{Library, SymbolTable};
use libc::c_char;
use tracing::{debug, error, info};

use super::{
    frame, socket_path, Fault, RemoteExtensionInfo, Request, Response, Result, RpcError, Signature, Value,
};
use crate::backend::native::{self, ConstantFn, ExtensionInfoFn, RawBinaryFn, RawUnaryFn};

/// Executes requests against a symbol table.
pub struct Worker<T> {
    table: std::result::Result<T, String>,
    cache: HashMap<String, NonNull<c_void>>,
}

impl<T: SymbolTable> Worker<T> {
    pub fn new(table: T) -> Worker<T> {
        Worker {
            table: Ok(table),
            cache: HashMap::new(),
        }
    }

    /// A worker whose library failed to load. Every request except `Close` is
    /// answered with a fault carrying `message`.
    pub fn failed(message: impl Into<String>) -> Worker<T> {
        Worker {
            table: Err(message.into()),
            cache: HashMap::new(),
        }
    }

    /// Answer requests until the client sends `Close` or disconnects.
    pub fn serve<S: Read + Write>(&mut self, stream: &mut S) -> Result<()> {
        loop {
            let request: Request = match frame::read_message(stream) {
                Ok(request) => request,
                Err(RpcError::Disconnected) => {
                    debug!("client disconnected");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            let close = request == Request::Close;
            let response = self.dispatch(request);
            frame::write_message(stream, &response)?;

            if close {
                debug!("close requested");
                return Ok(());
            }
        }
    }

    /// Execute one request. Panics raised while executing it become faults.
    pub fn dispatch(&mut self, request: Request) -> Response {
        match panic::catch_unwind(AssertUnwindSafe(|| self.handle(request))) {
            Ok(response) => response,
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "worker panicked".to_string());
                error!(%message, "request panicked");
                Response::fault(Fault::Failed { message })
            }
        }
    }

    fn handle(&mut self, request: Request) -> Response {
        if let (Err(message), false) = (&self.table, request == Request::Close) {
            return Response::fault(Fault::Failed {
                message: message.clone(),
            });
        }

        match request {
            Request::Close => Response::default(),
            Request::SymbolExists { symbol } => Response::value(Value::Bool(self.resolve(&symbol).is_some())),
            Request::Invoke {
                symbol,
                signature,
                args,
            } => match self.call(&symbol, signature, &args) {
                Ok(value) => Response::value(value),
                Err(fault) => Response::fault(fault),
            },
            Request::InvokeWithMutableArgs {
                symbol,
                signature,
                args,
            } => match self.call(&symbol, signature, &args) {
                // Native operators take every argument by value, so the callee's
                // view of the arguments is what was sent.
                Ok(value) => Response {
                    result: Some(value),
                    mutated_args: Some(args),
                    fault: None,
                },
                Err(fault) => Response::fault(fault),
            },
            Request::ResolveAnsiString { address } => {
                Response::value(Value::Str(unsafe { read_c_string(address) }))
            }
        }
    }

    fn resolve(&mut self, symbol: &str) -> Option<NonNull<c_void>> {
        if let Some(address) = self.cache.get(symbol) {
            return Some(*address);
        }

        let address = self.table.as_ref().ok()?.symbol(symbol)?;
        self.cache.insert(symbol.to_string(), address);
        Some(address)
    }

    fn call(&mut self, symbol: &str, signature: Signature, args: &[Value]) -> std::result::Result<Value, Fault> {
        let address = self.resolve(symbol).ok_or_else(|| Fault::NotFound {
            symbol: symbol.to_string(),
        })?;

        if args.len() != signature.arity() {
            return Err(Fault::BadArguments {
                message: format!("`{}` takes {} arguments, got {}", symbol, signature.arity(), args.len()),
            });
        }
        let mut floats = [0f64; 2];
        for (slot, arg) in floats.iter_mut().zip(args) {
            *slot = arg.as_f64().ok_or_else(|| Fault::BadArguments {
                message: format!("`{}` takes doubles, got {:?}", symbol, arg),
            })?;
        }

        // The client chooses the signature, the library's ABI has to match it.
        let value = unsafe {
            match signature {
                Signature::Constant => Value::F64(native::function_at::<ConstantFn>(address)()),
                Signature::Unary => Value::F64(native::function_at::<RawUnaryFn>(address)(floats[0])),
                Signature::Binary => {
                    Value::F64(native::function_at::<RawBinaryFn>(address)(floats[0], floats[1]))
                }
                Signature::ExtensionInfo => {
                    let info = native::function_at::<ExtensionInfoFn>(address)();
                    Value::ExtensionInfo(RemoteExtensionInfo {
                        library_name: info.library_name as usize as u64,
                        version_major: info.version_major,
                        version_minor: info.version_minor,
                        version_build: info.version_build,
                        flags: info.flags,
                    })
                }
            }
        };
        Ok(value)
    }
}

/// # Safety
///
/// `address` must be zero or point to a NUL-terminated string in this process,
/// such as the name returned by `get_extension_info`.
unsafe fn read_c_string(address: u64) -> Option<String> {
    if address == 0 {
        return None;
    }
    let ptr = address as usize as *const c_char;
    Some(unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned())
}

/// Worker process entry point: load `library`, listen on the socket for
/// `channel_id`, serve one client and exit.
pub fn run(library: &Path, channel_id: &str) -> Result<()> {
    let mut worker = match unsafe { Library::open(library) } {
        Ok(library) => {
            info!(library = %library.path().display(), "library loaded");
            Worker::new(library)
        }
        Err(e) => {
            error!(library = %library.display(), error = %e, "cannot load library");
            Worker::<Library>::failed(e.to_string())
        }
    };

    let path = socket_path(channel_id);
    let listener = UnixListener::bind(&path)?;
    debug!(socket = %path.display(), "listening");

    let accepted = listener.accept();
    drop(listener);
    let _ = std::fs::remove_file(&path);
    let (mut stream, _) = accepted?;

    let result = worker.serve(&mut stream);
    drop(worker);
    info!("worker finished");
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::native::tests::LinkedOperators;

    fn invoke(symbol: &str, signature: Signature, args: Vec<Value>) -> Request {
        Request::Invoke {
            symbol: symbol.to_string(),
            signature,
            args,
        }
    }

    #[test]
    fn test_dispatch() {
        let mut worker = Worker::new(LinkedOperators::without(&[]));

        let response = worker.dispatch(invoke(
            "operator_subtract",
            Signature::Binary,
            vec![Value::F64(5.0), Value::F64(7.0)],
        ));
        assert_eq!(response, Response::value(Value::F64(-2.0)));

        let response = worker.dispatch(Request::SymbolExists {
            symbol: "operator_ceil".to_string(),
        });
        assert_eq!(response, Response::value(Value::Bool(true)));

        assert_eq!(worker.dispatch(Request::Close), Response::default());
    }

    #[test]
    fn test_symbols_are_cached() {
        let mut worker = Worker::new(LinkedOperators::without(&[]));
        assert!(worker.cache.is_empty());

        worker.dispatch(invoke("operator_cos", Signature::Unary, vec![Value::F64(0.0)]));
        worker.dispatch(invoke("operator_cos", Signature::Unary, vec![Value::F64(1.0)]));
        worker.dispatch(invoke("_not_exists_", Signature::Unary, vec![Value::F64(1.0)]));
        assert_eq!(worker.cache.len(), 1);
        assert!(worker.cache.contains_key("operator_cos"));
    }

    #[test]
    fn test_faults() {
        let mut worker = Worker::new(LinkedOperators::without(&["operator_tan"]));

        let response = worker.dispatch(invoke("operator_tan", Signature::Unary, vec![Value::F64(0.0)]));
        assert_eq!(
            response.fault,
            Some(Fault::NotFound {
                symbol: "operator_tan".to_string()
            })
        );

        let response = worker.dispatch(invoke("operator_sin", Signature::Unary, vec![Value::Bool(true)]));
        assert!(matches!(response.fault, Some(Fault::BadArguments { .. })));

        let response = worker.dispatch(invoke("operator_sin", Signature::Binary, vec![Value::F64(1.0)]));
        assert!(matches!(response.fault, Some(Fault::BadArguments { .. })));
    }

    #[test]
    fn test_failed_worker() {
        let mut worker = Worker::<LinkedOperators>::failed("cannot open libfoo.so");

        let response = worker.dispatch(Request::SymbolExists {
            symbol: "operator_add".to_string(),
        });
        assert_eq!(
            response.fault,
            Some(Fault::Failed {
                message: "cannot open libfoo.so".to_string()
            })
        );
        assert_eq!(worker.dispatch(Request::Close), Response::default());
    }
}
