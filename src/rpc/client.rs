//! RPC client for connecting to a bridge server.
//!
//! [`Client`] keeps one connection open and issues calls on it one at a
//! time, so calls made through one client reach the engine in the order they
//! were issued. Remote properties are reached through their `propget_` and
//! `propset_` accessor endpoints.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex as StdMutex, PoisonError};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::dispatcher::EndpointInfo;
use super::files::{DownloadReply, FileError, FilePayload, Payload};
use super::protocol::{Request, Response};
use crate::config::ClientConfig;
use crate::core::reflect::{PROPGET_PREFIX, PROPSET_PREFIX};
use crate::core::{CallArgs, EndpointKind};
use crate::logging::LogThrottle;

/// Delay before the first reconnection attempt.
const BACKOFF_BASE: Duration = Duration::from_millis(100);
const BACKOFF_FACTOR: f64 = 2.0;

/// Error returned by client operations.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("server at {0} did not answer the readiness check")]
    NotReady(SocketAddr),

    #[error("communication error: {0}")]
    Io(#[source] std::io::Error),

    #[error("failed to serialize request: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("failed to parse response: {0}")]
    Parse(#[source] serde_json::Error),

    /// The server answered with an error; `kind` is the remote error kind.
    #[error("{kind}: {message}")]
    Remote {
        code: i32,
        kind: String,
        message: String,
    },

    #[error("remote object has no attribute '{0}'")]
    UnknownAttribute(String),

    #[error("'{0}' is a method, not a property")]
    NotAProperty(String),

    #[error("property '{0}' is read-only")]
    ReadOnly(String),

    #[error("client has exited")]
    Exited,

    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    #[error("server closed the connection")]
    Closed,

    #[error(transparent)]
    File(#[from] FileError),

    #[error("failed to {op} {}: {source}", .path.display())]
    LocalIo {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("refusing to write outside the target directory: {0}")]
    UnsafePath(String),

    #[error("unexpected reply to {0}")]
    UnexpectedReply(String),
}

impl ClientError {
    /// Remote error kind, when the server raised one.
    pub fn remote_kind(&self) -> Option<&str> {
        match self {
            ClientError::Remote { kind, .. } => Some(kind),
            _ => None,
        }
    }

    /// The connection can no longer be trusted after these.
    fn breaks_connection(&self) -> bool {
        matches!(
            self,
            ClientError::Io(_)
                | ClientError::Closed
                | ClientError::Timeout(_)
                | ClientError::Parse(_)
        )
    }

    fn local_io(op: &'static str, path: &Path) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.to_path_buf();
        move |source| ClientError::LocalIo { op, path, source }
    }
}

/// What a remote attribute name resolves to.
#[derive(Debug, Clone, PartialEq)]
pub enum Attribute {
    /// A callable endpoint; invoke it with [`Client::call`].
    Method(String),
    /// The current value of a remote property.
    Value(Value),
}

/// Exponential reconnection delay: `100ms * 2^attempt`, never above `cap`.
pub fn backoff_delay(attempt: u32, cap: Duration) -> Duration {
    let exponent = attempt.min(i32::MAX as u32) as i32;
    let delay_ms = BACKOFF_BASE.as_millis() as f64 * BACKOFF_FACTOR.powi(exponent);
    let delay = if delay_ms.is_finite() && delay_ms < u64::MAX as f64 {
        Duration::from_millis(delay_ms as u64)
    } else {
        cap
    };
    delay.min(cap)
}

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Connection {
    async fn open(addr: SocketAddr) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| ClientError::Connect { addr, source })?;
        stream.set_nodelay(true).map_err(ClientError::Io)?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
        })
    }

    /// Send one framed request and read one framed response.
    async fn exchange(&mut self, frame: &str) -> Result<String, ClientError> {
        self.writer
            .write_all(frame.as_bytes())
            .await
            .map_err(ClientError::Io)?;

        let mut line = String::new();
        let read = self
            .reader
            .read_line(&mut line)
            .await
            .map_err(ClientError::Io)?;
        if read == 0 {
            return Err(ClientError::Closed);
        }
        Ok(line)
    }
}

fn frame(request: &Request) -> Result<String, ClientError> {
    let mut json = serde_json::to_string(request).map_err(ClientError::Serialize)?;
    json.push('\n');
    Ok(json)
}

async fn exchange_on(
    slot: &mut Option<Connection>,
    addr: SocketAddr,
    frame: &str,
) -> Result<String, ClientError> {
    if slot.is_none() {
        *slot = Some(Connection::open(addr).await?);
    }
    let Some(conn) = slot.as_mut() else {
        return Err(ClientError::Closed);
    };
    conn.exchange(frame).await
}

/// Client proxy for a bridge server.
pub struct Client {
    config: ClientConfig,
    conn: Mutex<Option<Connection>>,
    next_id: AtomicU64,
    endpoints: StdMutex<Option<BTreeMap<String, EndpointKind>>>,
    exited: AtomicBool,
}

impl Client {
    /// Connect, retrying with exponential backoff until `config.timeout()`
    /// has elapsed, then check that the server is serving.
    pub async fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        let addr = config.addr();
        let timeout = config.timeout();
        let deadline = Instant::now() + timeout;
        let mut attempt = 0u32;

        let conn = loop {
            match Connection::open(addr).await {
                Ok(conn) => break conn,
                Err(e) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(e);
                    }
                    let delay = backoff_delay(attempt, timeout).min(remaining);
                    debug!(
                        addr = %addr,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Server not reachable yet, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        };

        let client = Self {
            config,
            conn: Mutex::new(Some(conn)),
            next_id: AtomicU64::new(1),
            endpoints: StdMutex::new(None),
            exited: AtomicBool::new(false),
        };

        match client.call_raw("service_ping", CallArgs::new()).await {
            Ok(Value::String(pong)) if pong == "pong" => {}
            Ok(_) => return Err(ClientError::NotReady(addr)),
            Err(e) => {
                debug!(addr = %addr, error = %e, "Readiness check failed");
                return Err(ClientError::NotReady(addr));
            }
        }
        client.endpoints().await?;

        info!(addr = %addr, attempts = attempt + 1, "Connected to server");
        Ok(client)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Call an endpoint and return its raw JSON result.
    pub async fn call_raw(&self, method: &str, args: CallArgs) -> Result<Value, ClientError> {
        if self.exited() {
            return Err(ClientError::Exited);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = frame(&Request::call(id, method, &args))?;
        let addr = self.config.addr();

        let mut conn = self.conn.lock().await;
        let outcome = match self.config.call_timeout() {
            Some(limit) => tokio::time::timeout(limit, exchange_on(&mut conn, addr, &frame))
                .await
                .unwrap_or(Err(ClientError::Timeout(limit))),
            None => exchange_on(&mut conn, addr, &frame).await,
        };
        let outcome = outcome.and_then(|line| {
            serde_json::from_str::<Response>(line.trim()).map_err(ClientError::Parse)
        });

        let response = match outcome {
            Ok(response) => response,
            Err(e) => {
                if e.breaks_connection() {
                    // Dropping the stream closes it; the next call reconnects.
                    *conn = None;
                }
                return Err(e);
            }
        };
        drop(conn);

        if response.id != Value::from(id) {
            return Err(ClientError::UnexpectedReply(method.to_string()));
        }
        if let Some(error) = response.error {
            let kind = error.kind().unwrap_or("RpcError").to_string();
            return Err(ClientError::Remote {
                code: error.code,
                kind,
                message: error.message,
            });
        }
        Ok(response.result.unwrap_or(Value::Null))
    }

    /// Call an endpoint and decode its result.
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        args: CallArgs,
    ) -> Result<T, ClientError> {
        let value = self.call_raw(method, args).await?;
        serde_json::from_value(value).map_err(ClientError::Parse)
    }

    /// Fetch the endpoint listing and refresh the cached one.
    pub async fn endpoints(&self) -> Result<Vec<EndpointInfo>, ClientError> {
        let listing: Vec<EndpointInfo> = self.call("service_endpoints", CallArgs::new()).await?;
        let table = listing.iter().map(|e| (e.name.clone(), e.kind)).collect();
        *self.endpoints.lock().unwrap_or_else(PoisonError::into_inner) = Some(table);
        Ok(listing)
    }

    async fn endpoint_table(&self) -> Result<BTreeMap<String, EndpointKind>, ClientError> {
        let cached = self
            .endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match cached {
            Some(table) => Ok(table),
            None => {
                let listing = self.endpoints().await?;
                Ok(listing.into_iter().map(|e| (e.name, e.kind)).collect())
            }
        }
    }

    /// Resolve `name`: a remote method of that name first, else the
    /// property read through `propget_<name>`.
    pub async fn attr(&self, name: &str) -> Result<Attribute, ClientError> {
        if self.exited() {
            return Err(ClientError::Exited);
        }
        let table = self.endpoint_table().await?;
        if table.contains_key(name) {
            return Ok(Attribute::Method(name.to_string()));
        }
        let getter = format!("{PROPGET_PREFIX}{name}");
        if table.contains_key(&getter) {
            return Ok(Attribute::Value(self.call_raw(&getter, CallArgs::new()).await?));
        }
        Err(ClientError::UnknownAttribute(name.to_string()))
    }

    pub async fn has_attr(&self, name: &str) -> Result<bool, ClientError> {
        if self.exited() {
            return Err(ClientError::Exited);
        }
        let table = self.endpoint_table().await?;
        Ok(table.contains_key(name) || table.contains_key(&format!("{PROPGET_PREFIX}{name}")))
    }

    /// Read a remote property.
    pub async fn get<T: DeserializeOwned>(&self, name: &str) -> Result<T, ClientError> {
        match self.attr(name).await? {
            Attribute::Value(value) => serde_json::from_value(value).map_err(ClientError::Parse),
            Attribute::Method(_) => Err(ClientError::NotAProperty(name.to_string())),
        }
    }

    /// Write a remote property.
    pub async fn set(&self, name: &str, value: impl serde::Serialize) -> Result<(), ClientError> {
        if self.exited() {
            return Err(ClientError::Exited);
        }
        let table = self.endpoint_table().await?;
        let setter = format!("{PROPSET_PREFIX}{name}");
        if table.contains_key(&setter) {
            let args = CallArgs::new()
                .try_with(value)
                .map_err(ClientError::Serialize)?;
            self.call_raw(&setter, args).await?;
            return Ok(());
        }
        if table.contains_key(&format!("{PROPGET_PREFIX}{name}")) {
            return Err(ClientError::ReadOnly(name.to_string()));
        }
        if table.contains_key(name) {
            return Err(ClientError::NotAProperty(name.to_string()));
        }
        Err(ClientError::UnknownAttribute(name.to_string()))
    }

    /// Ping the server. Any transport or remote error counts as dead.
    pub async fn is_alive(&self) -> bool {
        matches!(
            self.call_raw("service_ping", CallArgs::new()).await,
            Ok(Value::String(pong)) if pong == "pong"
        )
    }

    /// Close the connection. Idempotent; every later call fails with
    /// [`ClientError::Exited`].
    pub async fn exit(&self) {
        if self.exited.swap(true, Ordering::SeqCst) {
            return;
        }
        self.conn.lock().await.take();
        debug!(addr = %self.config.addr(), "Client exited");
    }

    pub fn exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    /// Ask the server to shut down, then exit.
    pub async fn shutdown_server(&self) -> Result<(), ClientError> {
        let outcome = self.call_raw("service_exit", CallArgs::new()).await;
        self.exit().await;
        outcome.map(|_| ())
    }

    /// Engine project directory on the server.
    pub async fn project_directory(&self) -> Result<String, ClientError> {
        self.get("project_directory").await
    }

    /// Absolute paths of every project file on the server.
    pub async fn list_files(&self) -> Result<Vec<String>, ClientError> {
        self.call("list_files", CallArgs::new()).await
    }

    /// Upload `local` into the remote directory `remote_dir`. Returns the
    /// remote path written.
    pub async fn upload(&self, local: &Path, remote_dir: &str) -> Result<String, ClientError> {
        let name = local
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| ClientError::UnsafePath(local.display().to_string()))?;
        let bytes = tokio::fs::read(local)
            .await
            .map_err(ClientError::local_io("read", local))?;
        let size = bytes.len() as u64;

        let remote = join_remote(remote_dir, &name);
        let written: u64 = self
            .call(
                "service_upload",
                CallArgs::new().with(&remote).with(Payload(bytes)),
            )
            .await?;
        if written != size {
            return Err(ClientError::UnexpectedReply(format!(
                "service_upload({remote}): wrote {written} of {size} bytes"
            )));
        }

        info!(local = %local.display(), remote = %remote, bytes = size, "Uploaded file");
        Ok(remote)
    }

    /// Download a remote file or directory into `target_dir`.
    ///
    /// A file lands at `target_dir/<basename>`; a directory's files land at
    /// `target_dir/<relative path>`. Returns the local paths written. With
    /// `overwrite` false, existing local files are left alone.
    pub async fn download(
        &self,
        remote: &str,
        target_dir: &Path,
        overwrite: bool,
    ) -> Result<Vec<PathBuf>, ClientError> {
        tokio::fs::create_dir_all(target_dir)
            .await
            .map_err(ClientError::local_io("create directory", target_dir))?;
        let reply: DownloadReply = self
            .call("service_download", CallArgs::new().with(remote))
            .await?;

        match reply {
            DownloadReply::File(payload) => {
                let name = remote_basename(remote)
                    .ok_or_else(|| ClientError::UnsafePath(remote.to_string()))?;
                let dest = target_dir.join(name);
                Ok(store(&dest, payload, remote, overwrite).await?.into_iter().collect())
            }
            DownloadReply::Directory(listing) => {
                let mut written = Vec::with_capacity(listing.files.len());
                for relative in &listing.files {
                    let dest = target_dir.join(safe_relative(relative)?);
                    let remote_file = join_remote(remote, relative);
                    if let Some(path) = self.download_file(&remote_file, &dest, overwrite).await? {
                        written.push(path);
                    }
                }
                debug!(remote, files = written.len(), "Directory downloaded");
                Ok(written)
            }
        }
    }

    /// Download one remote file to exactly `dest`. Returns `None` when the
    /// file was skipped.
    pub async fn download_file(
        &self,
        remote: &str,
        dest: &Path,
        overwrite: bool,
    ) -> Result<Option<PathBuf>, ClientError> {
        if !overwrite && local_exists(dest).await {
            info!(path = %dest.display(), "File exists, skipping download");
            return Ok(None);
        }
        let reply: DownloadReply = self
            .call("service_download", CallArgs::new().with(remote))
            .await?;
        let DownloadReply::File(payload) = reply else {
            return Err(ClientError::UnexpectedReply(format!("service_download({remote})")));
        };
        store(dest, payload, remote, overwrite).await
    }

    /// Download every project file, keeping the layout relative to the
    /// project's parent directory. `extensions` (without the dot) filters
    /// the files when non-empty.
    pub async fn download_project(
        &self,
        target_dir: &Path,
        extensions: &[String],
        overwrite: bool,
    ) -> Result<Vec<PathBuf>, ClientError> {
        let project = PathBuf::from(self.project_directory().await?);
        let base = project.parent().unwrap_or(&project).to_path_buf();

        let files: Vec<String> = self
            .list_files()
            .await?
            .into_iter()
            .filter(|f| matches_extension(f, extensions))
            .collect();

        let total = files.len();
        let throttle = LogThrottle::new(Duration::from_secs(2));
        let mut written = Vec::with_capacity(total);

        for (index, remote) in files.iter().enumerate() {
            let relative = match Path::new(remote).strip_prefix(&base) {
                Ok(relative) => relative.to_path_buf(),
                Err(_) => {
                    warn!(file = %remote, "File outside the project tree, saving by name");
                    let name = remote_basename(remote)
                        .ok_or_else(|| ClientError::UnsafePath(remote.clone()))?;
                    PathBuf::from(name)
                }
            };
            let dest = target_dir.join(safe_relative(&super::files::to_wire_path(&relative))?);
            if let Some(path) = self.download_file(remote, &dest, overwrite).await? {
                written.push(path);
            }
            if throttle.should_log() {
                info!(done = index + 1, total, "Downloading project files");
            }
        }

        info!(target = %target_dir.display(), files = written.len(), total, "Project downloaded");
        Ok(written)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if !self.config.cleanup_on_exit || self.exited.swap(true, Ordering::SeqCst) {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No runtime available, server left running");
            return;
        };

        let addr = self.config.addr();
        let conn = self.conn.get_mut().take();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        runtime.spawn(async move {
            let outcome = async {
                let frame = frame(&Request::call(id, "service_exit", &CallArgs::new()))?;
                let mut slot = conn;
                exchange_on(&mut slot, addr, &frame).await
            }
            .await;
            match outcome {
                Ok(_) => debug!(addr = %addr, "Server asked to exit on client drop"),
                Err(e) => debug!(addr = %addr, error = %e, "Exit on drop failed"),
            }
        });
    }
}

fn join_remote(dir: &str, name: &str) -> String {
    let dir = dir.trim_end_matches('/');
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{dir}/{name}")
    }
}

fn remote_basename(remote: &str) -> Option<&str> {
    remote
        .trim_end_matches(['/', '\\'])
        .rsplit(['/', '\\'])
        .next()
        .filter(|name| !name.is_empty() && *name != "." && *name != "..")
}

/// Turn a `/`-separated relative path from the server into a local one that
/// cannot escape the target directory.
fn safe_relative(relative: &str) -> Result<PathBuf, ClientError> {
    let path: PathBuf = relative.split('/').filter(|s| !s.is_empty()).collect();
    let escapes = relative.starts_with('/')
        || path
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
    if escapes || path.as_os_str().is_empty() {
        return Err(ClientError::UnsafePath(relative.to_string()));
    }
    Ok(path)
}

fn matches_extension(file: &str, extensions: &[String]) -> bool {
    if extensions.is_empty() {
        return true;
    }
    let Some(ext) = Path::new(file).extension() else {
        return false;
    };
    let ext = ext.to_string_lossy();
    extensions
        .iter()
        .any(|wanted| wanted.trim_start_matches('.').eq_ignore_ascii_case(&ext))
}

async fn local_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

async fn store(
    dest: &Path,
    payload: FilePayload,
    remote: &str,
    overwrite: bool,
) -> Result<Option<PathBuf>, ClientError> {
    if !overwrite && local_exists(dest).await {
        info!(path = %dest.display(), "File exists, skipping download");
        return Ok(None);
    }
    let bytes = payload.verify(remote)?;
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(ClientError::local_io("create directory", parent))?;
    }
    tokio::fs::write(dest, &bytes)
        .await
        .map_err(ClientError::local_io("write", dest))?;
    debug!(remote, path = %dest.display(), bytes = bytes.len(), "Downloaded file");
    Ok(Some(dest.to_path_buf()))
}
