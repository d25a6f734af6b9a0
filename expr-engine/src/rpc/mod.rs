//! Synchronous request/response bridge to a worker process.
//!
//! The worker loads a native library (usually one of the other pointer width)
//! and executes calls on behalf of the client. Exactly one request is in flight
//! per channel; every request is answered by exactly one response.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod client;
pub mod frame;
pub mod worker;

pub use client::{Connection, RemoteBridge, RpcClient, WorkerConfig};
pub use worker::Worker;

pub type Result<T> = std::result::Result<T, RpcError>;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("transport failure: {0}")]
    Transport(#[from] io::Error),

    #[error("malformed message: {0}")]
    Codec(#[from] bincode::Error),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("channel closed by peer")]
    Disconnected,

    #[error("channel is unusable after an earlier transport failure")]
    Broken,

    #[error("symbol `{0}` not found")]
    SymbolNotFound(String),

    #[error("remote invocation failed: {0}")]
    RemoteInvocation(String),

    #[error("failed to spawn worker {}: {source}", .path.display())]
    Spawn {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("worker did not open its channel within {0:?}")]
    ConnectTimeout(Duration),

    #[error("worker exited before accepting a connection ({0})")]
    WorkerExited(ExitStatus),
}

impl RpcError {
    /// Whether the channel can no longer be used after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RpcError::Transport(_)
                | RpcError::Codec(_)
                | RpcError::Protocol(_)
                | RpcError::Disconnected
                | RpcError::Broken
        )
    }
}

/// Shape of a native function, selects how the worker calls a symbol.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signature {
    /// `double f()`
    Constant,
    /// `double f(double)`
    Unary,
    /// `double f(double, double)`
    Binary,
    /// `extension_info get_extension_info()`
    ExtensionInfo,
}

impl Signature {
    pub fn arity(self) -> usize {
        match self {
            Signature::Constant | Signature::ExtensionInfo => 0,
            Signature::Unary => 1,
            Signature::Binary => 2,
        }
    }
}

/// `get_extension_info` result with the name pointer kept as a remote address.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RemoteExtensionInfo {
    pub library_name: u64,
    pub version_major: u16,
    pub version_minor: u16,
    pub version_build: u16,
    pub flags: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum Value {
    F64(f64),
    /// Pointer-sized integer in the worker's address space.
    Address(u64),
    Bool(bool),
    Str(Option<String>),
    ExtensionInfo(RemoteExtensionInfo),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::F64(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(value) => Some(*value),
            _ => None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum Request {
    Close,
    Invoke {
        symbol: String,
        signature: Signature,
        args: Vec<Value>,
    },
    InvokeWithMutableArgs {
        symbol: String,
        signature: Signature,
        args: Vec<Value>,
    },
    SymbolExists {
        symbol: String,
    },
    ResolveAnsiString {
        address: u64,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum Fault {
    NotFound { symbol: String },
    BadArguments { message: String },
    Failed { message: String },
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Fault::NotFound { symbol } => write!(f, "symbol `{}` not found", symbol),
            Fault::BadArguments { message } => write!(f, "bad arguments: {}", message),
            Fault::Failed { message } => write!(f, "{}", message),
        }
    }
}

impl From<Fault> for RpcError {
    fn from(fault: Fault) -> RpcError {
        match fault {
            Fault::NotFound { symbol } => RpcError::SymbolNotFound(symbol),
            other => RpcError::RemoteInvocation(other.to_string()),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Response {
    pub result: Option<Value>,
    pub mutated_args: Option<Vec<Value>>,
    pub fault: Option<Fault>,
}

impl Response {
    pub fn value(value: Value) -> Response {
        Response {
            result: Some(value),
            ..Response::default()
        }
    }

    pub fn fault(fault: Fault) -> Response {
        Response {
            fault: Some(fault),
            ..Response::default()
        }
    }
}

/// Path of the Unix socket a worker listens on for `channel_id`.
pub fn socket_path(channel_id: &str) -> PathBuf {
    std::env::temp_dir().join(format!("expr-engine-{}.sock", channel_id))
}
