//! Runs the real worker executable against the reference operator library.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use expr_engine::backend::{Backend, BackendError, BackendKind, BinaryOp, UnaryFunction};
use expr_engine::rpc::{RemoteBridge, RpcError, Signature, Value, WorkerConfig};
use expr_engine::Expression;

fn worker_config() -> WorkerConfig {
    WorkerConfig::new(env!("CARGO_BIN_EXE_expr-engine-worker"))
}

fn is_operator_library(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
        return false;
    };
    name.starts_with("libnative_operators") && (name.ends_with(".so") || name.ends_with(".dylib"))
}

/// The reference operator library built alongside the tests, if any.
fn operator_library() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os("NATIVE_OPERATORS_LIB") {
        return Some(PathBuf::from(path));
    }

    let target = Path::new(env!("CARGO_BIN_EXE_expr-engine-worker")).parent()?;
    for dir in [target.to_path_buf(), target.join("deps")] {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        let mut found: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| is_operator_library(path))
            .collect();
        found.sort();
        if let Some(path) = found.pop() {
            return Some(path);
        }
    }
    None
}

macro_rules! require_library {
    () => {
        match operator_library() {
            Some(path) => path,
            None => {
                eprintln!("skipping: native operator library not built (set NATIVE_OPERATORS_LIB)");
                return;
            }
        }
    };
}

#[test]
fn test_bridge_round_trips() {
    let library = require_library!();
    let mut bridge = RemoteBridge::spawn(&library, &worker_config()).unwrap();

    assert!(bridge.symbol_exists("operator_pow").unwrap());
    assert_eq!(bridge.invoke_f64("operator_pow", &[2.0, 3.0]).unwrap(), 8.0);
    assert_eq!(
        bridge
            .invoke("operator_pow", Signature::Binary, &[Value::F64(2.0), Value::F64(3.0)])
            .unwrap(),
        Value::F64(8.0)
    );

    assert!(!bridge.symbol_exists("_not_exists_").unwrap());
    let err = bridge.invoke_f64("_not_exists_", &[1.0]).unwrap_err();
    assert!(matches!(err, RpcError::SymbolNotFound(ref symbol) if symbol == "_not_exists_"));

    assert_eq!(bridge.invoke_f64("operator_sqrt", &[81.0]).unwrap(), 9.0);
    assert_eq!(bridge.invoke_f64("constant_pi", &[]).unwrap(), std::f64::consts::PI);
}

#[test]
fn test_remote_backend() {
    let library = require_library!();
    let backend = Arc::new(Backend::remote(&library, &worker_config()).unwrap());

    assert_eq!(backend.kind(), BackendKind::Remote);
    assert!(backend.name().starts_with("Rust libm"));
    assert!(backend.missing().is_empty());
    assert_eq!(backend.binary(BinaryOp::Add)(2.0, 3.0), 5.0);
    assert_eq!(backend.unary(UnaryFunction::Round)(6.5), 7.0);

    let expression = Expression::parse("sin(x) ^ 2 + 2pi * x").unwrap();
    let remote = expression.with_backend(backend.clone());
    for x in [-3.0, 0.0, 0.5, 10.0] {
        assert_eq!(remote.evaluate(x), expression.evaluate(x));
    }
}

#[test]
fn test_remote_backend_shared_across_threads() {
    let library = require_library!();
    let backend = Arc::new(Backend::remote(&library, &worker_config()).unwrap());
    let expression = Expression::parse_with("x * x - 1", backend).unwrap();

    std::thread::scope(|scope| {
        for i in 0..4 {
            let expression = &expression;
            scope.spawn(move || {
                let x = i as f64;
                assert_eq!(expression.evaluate(x), x * x - 1.0);
            });
        }
    });
}

#[test]
fn test_worker_stops_with_last_reference() {
    let library = require_library!();
    let bridge = RemoteBridge::spawn(&library, &worker_config()).unwrap();
    let pid = bridge.worker_id() as libc::pid_t;
    assert_eq!(unsafe { libc::kill(pid, 0) }, 0);

    drop(bridge);
    // The child was reaped, so its pid no longer names a process.
    assert_eq!(unsafe { libc::kill(pid, 0) }, -1);
}

#[test]
fn test_unloadable_library() {
    let err = Backend::remote("/nonexistent/libnothing.so", &worker_config()).unwrap_err();
    assert!(matches!(err, BackendError::Rpc(RpcError::RemoteInvocation(_))), "{:?}", err);
}

#[test]
fn test_missing_worker_executable() {
    let config = WorkerConfig::new("/nonexistent/expr-engine-worker");
    let err = Backend::remote("/nonexistent/libnothing.so", &config).unwrap_err();
    assert!(matches!(err, BackendError::Rpc(RpcError::Spawn { .. })), "{:?}", err);
}
