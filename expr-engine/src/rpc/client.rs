use std::env::consts::EXE_SUFFIX;
use std::io::{Read, Write};
use std::net::Shutdown;
use std::ops::{Deref, DerefMut};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use dynlib::image::read_bitness;
use dynlib::Bitness;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{frame, socket_path, Request, Response, Result, RpcError, Signature, Value};

/// Environment variable overriding the host width worker executable.
pub const WORKER_ENV: &str = "EXPR_ENGINE_WORKER";

pub const WORKER_EXE_NAME: &str = "expr-engine-worker";

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Client end of a channel.
///
/// Every operation sends one request and blocks until its response arrives.
/// After a transport or codec failure the client refuses further requests.
#[derive(Debug)]
pub struct RpcClient<S> {
    stream: S,
    broken: bool,
}

impl<S: Read + Write> RpcClient<S> {
    pub fn new(stream: S) -> RpcClient<S> {
        RpcClient { stream, broken: false }
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    fn round_trip(&mut self, request: &Request) -> Result<Response> {
        if self.broken {
            return Err(RpcError::Broken);
        }

        let result = frame::write_message(&mut self.stream, request)
            .and_then(|_| frame::read_message::<_, Response>(&mut self.stream));

        if let Err(e) = &result {
            if e.is_fatal() {
                self.broken = true;
            }
        }
        result
    }

    fn call(&mut self, request: &Request) -> Result<(Value, Option<Vec<Value>>)> {
        let response = self.round_trip(request)?;
        if let Some(fault) = response.fault {
            return Err(fault.into());
        }

        match response.result {
            Some(value) => Ok((value, response.mutated_args)),
            None => Err(RpcError::Protocol("response carries neither result nor fault".to_string())),
        }
    }

    /// Invoke `symbol` in the worker.
    pub fn invoke(&mut self, symbol: &str, signature: Signature, args: &[Value]) -> Result<Value> {
        let request = Request::Invoke {
            symbol: symbol.to_string(),
            signature,
            args: args.to_vec(),
        };
        self.call(&request).map(|(value, _)| value)
    }

    /// Invoke `symbol` and copy the worker's view of the arguments back into `args`.
    pub fn invoke_with_mutable_args(
        &mut self,
        symbol: &str,
        signature: Signature,
        args: &mut [Value],
    ) -> Result<Value> {
        let request = Request::InvokeWithMutableArgs {
            symbol: symbol.to_string(),
            signature,
            args: args.to_vec(),
        };
        let (value, mutated) = self.call(&request)?;

        match mutated {
            Some(mutated) if mutated.len() == args.len() => {
                args.clone_from_slice(&mutated);
                Ok(value)
            }
            Some(mutated) => Err(RpcError::Protocol(format!(
                "expected {} mutated arguments, got {}",
                args.len(),
                mutated.len()
            ))),
            None => Err(RpcError::Protocol("response is missing mutated arguments".to_string())),
        }
    }

    /// Call a `double` returning symbol, choosing the signature from the argument count.
    pub fn invoke_f64(&mut self, symbol: &str, args: &[f64]) -> Result<f64> {
        let signature = match args.len() {
            0 => Signature::Constant,
            1 => Signature::Unary,
            2 => Signature::Binary,
            n => return Err(RpcError::Protocol(format!("no native signature takes {} arguments", n))),
        };
        let args: Vec<Value> = args.iter().copied().map(Value::F64).collect();

        let value = self.invoke(symbol, signature, &args)?;
        value
            .as_f64()
            .ok_or_else(|| RpcError::Protocol(format!("`{}` returned {:?}", symbol, value)))
    }

    pub fn symbol_exists(&mut self, symbol: &str) -> Result<bool> {
        let request = Request::SymbolExists {
            symbol: symbol.to_string(),
        };
        let (value, _) = self.call(&request)?;
        value
            .as_bool()
            .ok_or_else(|| RpcError::Protocol(format!("symbol query returned {:?}", value)))
    }

    /// Read a NUL-terminated string at `address` in the worker.
    ///
    /// Returns `None` for a null address.
    pub fn resolve_ansi_string(&mut self, address: u64) -> Result<Option<String>> {
        let (value, _) = self.call(&Request::ResolveAnsiString { address })?;
        match value {
            Value::Str(s) => Ok(s),
            other => Err(RpcError::Protocol(format!("string query returned {:?}", other))),
        }
    }

    /// Ask the worker to stop. Failures are ignored, the peer may already be gone.
    pub fn close(&mut self) {
        if self.broken {
            return;
        }
        self.broken = true;

        if let Err(e) = frame::write_message(&mut self.stream, &Request::Close)
            .and_then(|_| frame::read_message::<_, Response>(&mut self.stream))
        {
            debug!(error = %e, "close request failed");
        }
    }
}

/// Where and how to start worker processes.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub executable: PathBuf,
    pub connect_timeout: Duration,
    pub shutdown_timeout: Duration,
}

impl WorkerConfig {
    pub fn new(executable: impl Into<PathBuf>) -> WorkerConfig {
        WorkerConfig {
            executable: executable.into(),
            connect_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(2),
        }
    }

    /// Find the worker executable for libraries of the host's pointer width.
    pub fn locate() -> WorkerConfig {
        WorkerConfig::locate_for(Bitness::HOST)
    }

    /// Find a worker executable able to load images of `bitness`.
    ///
    /// Looks, in order, at `EXPR_ENGINE_WORKER_X86` or `EXPR_ENGINE_WORKER_X64`,
    /// at `EXPR_ENGINE_WORKER` for the host width, and at the directory of the
    /// current executable and its parent (test binaries live in `deps/`), see
    /// [`find_worker`]. Falls back to the bare host worker name, which is then
    /// looked up in `PATH`.
    pub fn locate_for(bitness: Bitness) -> WorkerConfig {
        if let Some(path) = std::env::var_os(worker_env_for(bitness)) {
            return WorkerConfig::new(path);
        }
        if bitness.is_host() {
            if let Some(path) = std::env::var_os(WORKER_ENV) {
                return WorkerConfig::new(path);
            }
        }

        if let Ok(exe) = std::env::current_exe() {
            let dirs: Vec<&Path> = exe.ancestors().skip(1).take(2).collect();
            if let Some(path) = find_worker(&dirs[..], bitness) {
                return WorkerConfig::new(path);
            }
        }

        if !bitness.is_host() {
            warn!(%bitness, "no worker of matching width found, trying the host worker");
        }
        WorkerConfig::new(format!("{}{}", WORKER_EXE_NAME, EXE_SUFFIX))
    }
}

/// Environment variable naming the worker for images of `bitness`, e.g.
/// `EXPR_ENGINE_WORKER_X86`.
pub fn worker_env_for(bitness: Bitness) -> String {
    format!("{}_{}", WORKER_ENV, bitness.dir_name().to_uppercase())
}

/// Search `dirs` for a worker executable of pointer width `bitness`.
///
/// Each directory is checked for `<x86|x64>/expr-engine-worker`, then
/// `expr-engine-worker.<x86|x64>` and, for the host width only, plain
/// `expr-engine-worker`. Candidates whose image has the other width are skipped.
pub fn find_worker<P: AsRef<Path>>(dirs: &[P], bitness: Bitness) -> Option<PathBuf> {
    let exe_name = format!("{}{}", WORKER_EXE_NAME, EXE_SUFFIX);
    let suffixed = format!("{}.{}{}", WORKER_EXE_NAME, bitness.dir_name(), EXE_SUFFIX);

    for dir in dirs {
        let dir = dir.as_ref();
        let mut candidates = vec![dir.join(bitness.dir_name()).join(&exe_name), dir.join(&suffixed)];
        if bitness.is_host() {
            candidates.push(dir.join(&exe_name));
        }

        for candidate in candidates {
            if !candidate.is_file() {
                continue;
            }
            match read_bitness(&candidate) {
                Ok(Some(found)) if found != bitness => {
                    debug!(path = %candidate.display(), %found, "skipping worker of other width");
                }
                Ok(_) => return Some(candidate),
                Err(e) => debug!(path = %candidate.display(), error = %e, "cannot read worker image"),
            }
        }
    }
    None
}

impl Default for WorkerConfig {
    fn default() -> WorkerConfig {
        WorkerConfig::locate()
    }
}

/// A running worker process and the channel connected to it.
///
/// Dropping the bridge asks the worker to close, waits for it to exit and
/// kills it if it does not exit within the configured timeout.
#[derive(Debug)]
pub struct RemoteBridge {
    client: RpcClient<UnixStream>,
    worker: Child,
    library: PathBuf,
    shutdown_timeout: Duration,
}

impl RemoteBridge {
    /// Start a worker for `library` and connect to it.
    pub fn spawn(library: &Path, config: &WorkerConfig) -> Result<RemoteBridge> {
        let channel_id = Uuid::new_v4().to_string();
        let socket = socket_path(&channel_id);

        let mut worker = Command::new(&config.executable)
            .arg(library)
            .arg(&channel_id)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|source| RpcError::Spawn {
                path: config.executable.clone(),
                source,
            })?;
        debug!(pid = worker.id(), channel = %channel_id, library = %library.display(), "worker spawned");

        let stream = match connect(&socket, &mut worker, config.connect_timeout) {
            Ok(stream) => stream,
            Err(e) => {
                let _ = worker.kill();
                let _ = worker.wait();
                let _ = std::fs::remove_file(&socket);
                return Err(e);
            }
        };

        Ok(RemoteBridge {
            client: RpcClient::new(stream),
            worker,
            library: library.to_path_buf(),
            shutdown_timeout: config.shutdown_timeout,
        })
    }

    pub fn library(&self) -> &Path {
        &self.library
    }

    pub fn worker_id(&self) -> u32 {
        self.worker.id()
    }
}

fn connect(socket: &Path, worker: &mut Child, timeout: Duration) -> Result<UnixStream> {
    let deadline = Instant::now() + timeout;
    loop {
        match UnixStream::connect(socket) {
            Ok(stream) => return Ok(stream),
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused
                ) => {}
            Err(e) => return Err(e.into()),
        }

        if let Some(status) = worker.try_wait()? {
            return Err(RpcError::WorkerExited(status));
        }
        if Instant::now() >= deadline {
            return Err(RpcError::ConnectTimeout(timeout));
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// A channel to a worker that has a library loaded.
pub trait Connection: Send + 'static {
    type Stream: Read + Write;

    fn client(&mut self) -> &mut RpcClient<Self::Stream>;

    /// Library loaded on the other end.
    fn library(&self) -> &Path;
}

impl Connection for RemoteBridge {
    type Stream = UnixStream;

    fn client(&mut self) -> &mut RpcClient<UnixStream> {
        &mut self.client
    }

    fn library(&self) -> &Path {
        &self.library
    }
}

impl Deref for RemoteBridge {
    type Target = RpcClient<UnixStream>;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

impl DerefMut for RemoteBridge {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.client
    }
}

impl Drop for RemoteBridge {
    fn drop(&mut self) {
        self.client.close();
        let _ = self.client.get_ref().shutdown(Shutdown::Both);

        let deadline = Instant::now() + self.shutdown_timeout;
        loop {
            match self.worker.try_wait() {
                Ok(Some(status)) => {
                    debug!(pid = self.worker.id(), %status, "worker exited");
                    return;
                }
                Ok(None) if Instant::now() < deadline => thread::sleep(POLL_INTERVAL),
                Ok(None) => break,
                Err(e) => {
                    warn!(pid = self.worker.id(), error = %e, "cannot query worker state");
                    break;
                }
            }
        }

        warn!(pid = self.worker.id(), "worker did not exit, killing it");
        let _ = self.worker.kill();
        let _ = self.worker.wait();
    }
}
