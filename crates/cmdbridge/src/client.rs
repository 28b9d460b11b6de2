//! The bridge transport.
//!
//! A [`Client`] owns one running helper and multiplexes any number of
//! concurrent requests over its stdin/stdout.  Two tasks on the client's
//! own runtime do the I/O:
//!
//! - the **writer** drains a queue of pre-encoded frames into the helper's
//!   stdin, and closes stdin once the queue is dropped;
//! - the **reader** reads frames from the helper's stdout and routes each
//!   one to the pending request (or watch) it belongs to.
//!
//! Every operation returns a [`BridgeFuture`] immediately.  When the helper
//! goes away all outstanding futures fail with
//! [`BridgeError::TransportLost`] and the client stays dead.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use bytes::Bytes;
use rmpv::Value;
use tokio::io::AsyncWriteExt;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::BridgeConfig;
use crate::errors::{BridgeError, BridgeResult};
use crate::future::BridgeFuture;
use crate::path::FilePath;
use crate::rpc::{
    self, DecodeError, Incoming, Notification, Reply, ReplyStatus, Request, decode_incoming,
    encode_frame, get_str, get_u64, make_params, read_frame, val_bin, val_bool, val_i64, val_str,
    val_str_array, val_u64, write_frame,
};
use crate::runner::{BoxedReader, BoxedWriter, CommandRunner, HelperIo, HelperProcess};
use crate::types::{ControlSignal, Environment, FileFilter, FindEntry, IsKind, StatRecord};
use crate::watcher::{ChangeKind, FilePathWatcher, WatchEvent};

/// How long `shutdown` waits for the helper to exit after its stdin closes.
const EXIT_GRACE: Duration = Duration::from_secs(2);

/// Build the runtime a [`Client`] (and the runner that starts its helper)
/// runs on.
pub fn build_runtime(config: &BridgeConfig) -> BridgeResult<Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.io_threads.max(1))
        .thread_name("cmdbridge-io")
        .enable_all()
        .build()
        .map_err(|e| BridgeError::Io(format!("could not create runtime: {e}")))
}

// ---------------------------------------------------------------------------
// Pending requests
// ---------------------------------------------------------------------------

type Decoder<T> = fn(Value) -> BridgeResult<T>;

/// Type-erased receiver of the replies to one request.
trait PendingReply: Send + Sync {
    /// Returns `false` when the request was failed mid-stream and the
    /// helper should be told to stop.
    fn deliver(&self, reply: Reply) -> bool;
    fn fail(&self, err: BridgeError);
}

struct Pending<T> {
    method: &'static str,
    future: BridgeFuture<T>,
    decode: Decoder<T>,
    /// Streaming requests may end with a bare `ok`; others always carry a
    /// result in their terminal frame.
    streaming: bool,
}

impl<T: Send + 'static> Pending<T> {
    fn push(&self, value: Value) -> bool {
        match (self.decode)(value) {
            Ok(item) => {
                self.future.report_result(item);
                true
            }
            Err(e) => {
                self.future.report_error(e.context(self.method));
                false
            }
        }
    }
}

impl<T: Send + 'static> PendingReply for Pending<T> {
    fn deliver(&self, reply: Reply) -> bool {
        match reply.status {
            ReplyStatus::Chunk => {
                if let Some(value) = reply.result {
                    if !self.push(value) {
                        return !self.streaming;
                    }
                }
            }
            ReplyStatus::Ok => {
                let value = reply.result.unwrap_or(Value::Nil);
                if (!self.streaming || !value.is_nil()) && !self.push(value) {
                    return true;
                }
                self.future.report_finished();
            }
            ReplyStatus::Error => {
                let err = reply.error.map(rpc::rpc_error_to_bridge).unwrap_or_else(|| {
                    BridgeError::Protocol(format!("{}: error reply without details", self.method))
                });
                self.future.report_error(err);
            }
            ReplyStatus::Cancelled => self.future.report_cancelled(),
        }
        true
    }

    fn fail(&self, err: BridgeError) {
        self.future.report_error(err);
    }
}

// ---------------------------------------------------------------------------
// Decoders
// ---------------------------------------------------------------------------

fn unexpected(what: &str, value: &Value) -> BridgeError {
    BridgeError::Protocol(format!("expected {what}, got {value}"))
}

fn decode_unit(_: Value) -> BridgeResult<()> {
    Ok(())
}

fn decode_bool(value: Value) -> BridgeResult<bool> {
    value.as_bool().ok_or_else(|| unexpected("bool", &value))
}

fn decode_string(value: Value) -> BridgeResult<String> {
    match value {
        Value::String(s) if s.is_str() => Ok(s.into_str().unwrap_or_default()),
        other => Err(unexpected("string", &other)),
    }
}

fn decode_u64(value: Value) -> BridgeResult<u64> {
    value.as_u64().ok_or_else(|| unexpected("unsigned integer", &value))
}

fn decode_u32(value: Value) -> BridgeResult<u32> {
    value
        .as_u64()
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| unexpected("32-bit id", &value))
}

fn decode_i64(value: Value) -> BridgeResult<i64> {
    value.as_i64().ok_or_else(|| unexpected("integer", &value))
}

fn decode_bytes(value: Value) -> BridgeResult<Bytes> {
    match value {
        Value::Binary(data) => Ok(Bytes::from(data)),
        other => Err(unexpected("binary", &other)),
    }
}

fn decode_stat(value: Value) -> BridgeResult<StatRecord> {
    StatRecord::from_value(&value)
}

/// A malformed entry is reported in-band so the rest of the listing still
/// arrives.
fn decode_find_entry(value: Value) -> BridgeResult<FindEntry> {
    Ok(FindEntry::from_value(&value)
        .unwrap_or_else(|e| FindEntry::Error(format!("undecodable entry {value}: {e}"))))
}

fn decode_version(value: Value) -> BridgeResult<String> {
    value
        .as_map()
        .and_then(|map| get_str(map, "version"))
        .map(str::to_string)
        .ok_or_else(|| unexpected("version map", &value))
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

struct WatchRoute {
    base: FilePath,
    events: mpsc::UnboundedSender<WatchEvent>,
}

struct State {
    pending: HashMap<u64, Arc<dyn PendingReply>>,
    watchers: HashMap<u64, WatchRoute>,
    /// `None` once the transport is lost or shut down.
    outgoing: Option<mpsc::UnboundedSender<Vec<u8>>>,
    lost: Option<String>,
}

struct Shared {
    state: Mutex<State>,
    next_id: AtomicU64,
    max_frame_size: u32,
}

fn loss_reason(err: BridgeError) -> String {
    match err {
        BridgeError::TransportLost(reason) => reason,
        other => other.to_string(),
    }
}

impl Shared {
    fn new(outgoing: mpsc::UnboundedSender<Vec<u8>>, max_frame_size: u32) -> Self {
        Self {
            state: Mutex::new(State {
                pending: HashMap::new(),
                watchers: HashMap::new(),
                outgoing: Some(outgoing),
                lost: None,
            }),
            next_id: AtomicU64::new(1),
            max_frame_size,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register `pending` under `id` and queue its request frame.
    ///
    /// Registration and the lost check happen under one lock so nothing
    /// can slip in after the fatal drain.
    fn register(
        &self,
        id: u64,
        pending: Arc<dyn PendingReply>,
        frame: Vec<u8>,
    ) -> BridgeResult<()> {
        let mut state = self.lock();
        if let Some(ref reason) = state.lost {
            return Err(BridgeError::TransportLost(reason.clone()));
        }
        let Some(outgoing) = state.outgoing.clone() else {
            return Err(BridgeError::TransportLost("client shut down".into()));
        };
        state.pending.insert(id, pending);
        if outgoing.send(frame).is_err() {
            state.pending.remove(&id);
            return Err(BridgeError::TransportLost("writer stopped".into()));
        }
        Ok(())
    }

    fn request<T: Send + 'static>(
        self: &Arc<Self>,
        id: u64,
        method: &'static str,
        params: Value,
        decode: Decoder<T>,
        streaming: bool,
    ) -> BridgeFuture<T> {
        let future = BridgeFuture::new();
        let request = Request::new(id, method, params);
        let frame = match encode_frame(&request, self.max_frame_size) {
            Ok(frame) => frame,
            Err(e) => {
                future.report_error(e);
                return future;
            }
        };

        let pending = Arc::new(Pending {
            method,
            future: future.clone(),
            decode,
            streaming,
        });
        if let Err(e) = self.register(id, pending, frame) {
            future.report_error(e);
            return future;
        }
        tracing::trace!(id, method, "request queued");

        if streaming {
            let shared = Arc::downgrade(self);
            future.set_canceller(move || {
                if let Some(shared) = shared.upgrade() {
                    shared.send_cancel(id);
                }
            });
        }
        future
    }

    /// Queue a `cancel` for request `target`.  Cancels get no reply.
    fn send_cancel(&self, target_id: u64) {
        let id = self.next_id();
        let params = make_params(vec![("target", val_u64(target_id))]);
        let request = Request::new(id, "cancel", params);
        let frame = match encode_frame(&request, self.max_frame_size) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(target_id, error = %e, "could not encode cancel");
                return;
            }
        };
        if let Some(ref outgoing) = self.lock().outgoing {
            tracing::debug!(target_id, "cancelling request");
            let _ = outgoing.send(frame);
        }
    }

    fn unwatch(self: &Arc<Self>, id: u64) {
        let removed = self.lock().watchers.remove(&id).is_some();
        if removed && self.is_alive() {
            let params = make_params(vec![("watch", val_u64(id))]);
            let next = self.next_id();
            // Fire and forget; the reply only clears the pending entry.
            drop(self.request(next, "watch.remove", params, decode_unit, false));
        }
    }

    fn is_alive(&self) -> bool {
        self.lock().lost.is_none()
    }

    fn deliver(&self, reply: Reply) {
        let id = reply.id;
        let entry = {
            let mut state = self.lock();
            if reply.status.is_terminal() {
                state.pending.remove(&id)
            } else {
                state.pending.get(&id).cloned()
            }
        };
        let Some(pending) = entry else {
            tracing::debug!(id, status = ?reply.status, "dropping reply for unknown request");
            return;
        };
        if !pending.deliver(reply) {
            // Later chunks have nowhere to go; stop the helper producing them.
            self.lock().pending.remove(&id);
            tracing::warn!(id, "abandoning stream after undecodable chunk");
            self.send_cancel(id);
        }
    }

    fn fail_one(&self, id: u64, err: BridgeError) {
        let entry = self.lock().pending.remove(&id);
        match entry {
            Some(pending) => pending.fail(err),
            None => tracing::debug!(id, error = %err, "undecodable reply for unknown request"),
        }
    }

    fn notify(&self, notification: Notification) {
        if notification.method != "watch.event" {
            tracing::debug!(method = %notification.method, "ignoring notification");
            return;
        }
        let Some(params) = notification.params.as_map() else {
            tracing::warn!("watch.event without params");
            return;
        };
        let Some(watch) = get_u64(params, "watch") else {
            tracing::warn!("watch.event without watch id");
            return;
        };

        let state = self.lock();
        let Some(route) = state.watchers.get(&watch) else {
            tracing::debug!(watch, "event for removed watch");
            return;
        };
        let path = match get_str(params, "path") {
            Some(p) if p.starts_with('/') => route.base.with_new_path(p),
            Some(p) if !p.is_empty() => route.base.join(p),
            _ => route.base.clone(),
        };
        let kind = ChangeKind::parse(get_str(params, "kind").unwrap_or(""));
        let _ = route.events.send(WatchEvent { path, kind });
    }

    /// Mark the transport dead and fail everything outstanding.
    fn lose(&self, reason: String) {
        let (pending, watchers) = {
            let mut state = self.lock();
            if state.lost.is_some() {
                return;
            }
            state.lost = Some(reason.clone());
            state.outgoing = None;
            (
                std::mem::take(&mut state.pending),
                std::mem::take(&mut state.watchers),
            )
        };

        if pending.is_empty() {
            tracing::debug!(%reason, "helper transport closed");
        } else {
            tracing::warn!(%reason, outstanding = pending.len(), "helper transport lost");
        }
        for entry in pending.into_values() {
            entry.fail(BridgeError::TransportLost(reason.clone()));
        }
        // Dropping the routes ends every watcher's event stream.
        drop(watchers);
    }
}

// ---------------------------------------------------------------------------
// I/O tasks
// ---------------------------------------------------------------------------

async fn write_loop(
    mut stdin: BoxedWriter,
    mut queue: mpsc::UnboundedReceiver<Vec<u8>>,
    shared: Weak<Shared>,
) {
    while let Some(frame) = queue.recv().await {
        if let Err(e) = write_frame(&mut stdin, &frame).await {
            if let Some(shared) = shared.upgrade() {
                shared.lose(loss_reason(e));
            }
            return;
        }
    }
    // Queue closed: an EOF on stdin tells the helper to exit.
    if let Err(e) = stdin.shutdown().await {
        tracing::debug!(error = %e, "closing helper stdin");
    }
}

async fn read_loop(mut stdout: BoxedReader, shared: Arc<Shared>, max_frame_size: u32) {
    loop {
        let buf = match read_frame(&mut stdout, max_frame_size).await {
            Ok(buf) => buf,
            Err(e) => {
                shared.lose(loss_reason(e));
                return;
            }
        };
        match decode_incoming(&buf) {
            Ok(Incoming::Reply(reply)) => shared.deliver(reply),
            Ok(Incoming::Notification(notification)) => shared.notify(notification),
            Err(DecodeError {
                id: Some(id),
                message,
            }) => shared.fail_one(id, BridgeError::Protocol(message)),
            Err(DecodeError { id: None, message }) => {
                tracing::warn!(%message, "skipping undecodable frame");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// A connection to one running helper.
pub struct Client {
    shared: Arc<Shared>,
    runtime: Option<Runtime>,
    reader: Mutex<Option<JoinHandle<()>>>,
    process: Mutex<Option<Box<dyn HelperProcess>>>,
    bridge_path: String,
}

impl Client {
    /// Start the helper at `bridge_path` through `runner` and check that it
    /// answers.
    ///
    /// `runtime` must be the one `runner` was created on; the client keeps
    /// it for its I/O tasks.
    pub fn start(
        runtime: Runtime,
        runner: &dyn CommandRunner,
        bridge_path: &str,
        env: &Environment,
        delete_on_exit: bool,
        config: &BridgeConfig,
    ) -> BridgeResult<Self> {
        let args: &[&str] = if delete_on_exit {
            &["--delete-on-exit"]
        } else {
            &[]
        };
        tracing::debug!(
            helper = bridge_path,
            runner = %runner.description(),
            delete_on_exit,
            "starting helper"
        );

        let io = runtime.block_on(runner.spawn_helper(bridge_path, args, env))?;
        let client = Self::from_io(runtime, io, bridge_path, config);

        match client.ping().result() {
            Ok(version) => {
                tracing::info!(helper = bridge_path, %version, "helper started");
                Ok(client)
            }
            Err(e) => Err(BridgeError::StartFailed {
                path: bridge_path.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    /// Wrap an already running helper.
    pub fn from_io(
        runtime: Runtime,
        io: HelperIo,
        bridge_path: &str,
        config: &BridgeConfig,
    ) -> Self {
        let (outgoing, queue) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::new(outgoing, config.max_frame_size));

        runtime.spawn(write_loop(io.stdin, queue, Arc::downgrade(&shared)));
        let reader = runtime.spawn(read_loop(
            io.stdout,
            Arc::clone(&shared),
            config.max_frame_size,
        ));

        Self {
            shared,
            runtime: Some(runtime),
            reader: Mutex::new(Some(reader)),
            process: Mutex::new(Some(io.process)),
            bridge_path: bridge_path.to_string(),
        }
    }

    pub fn bridge_path(&self) -> &str {
        &self.bridge_path
    }

    /// `false` once the helper is gone or the client was shut down.
    pub fn is_alive(&self) -> bool {
        self.shared.is_alive()
    }

    /// Close the helper's stdin, fail outstanding requests, and stop the
    /// helper.  Idempotent.
    pub fn shutdown(&self) {
        self.shared.lose("client shut down".into());

        let reader = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let (Some(reader), Some(runtime)) = (reader, self.runtime.as_ref()) {
            // Give the helper a moment to see EOF and clean up after itself.
            // Blocking is impossible from inside another runtime.
            if tokio::runtime::Handle::try_current().is_err() {
                let _ = runtime.block_on(async { tokio::time::timeout(EXIT_GRACE, reader).await });
            }
        }

        if let Some(mut process) = self
            .process
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            process.terminate();
        }
    }

    fn call<T: Send + 'static>(
        &self,
        method: &'static str,
        params: Value,
        decode: Decoder<T>,
    ) -> BridgeFuture<T> {
        let id = self.shared.next_id();
        self.shared.request(id, method, params, decode, false)
    }

    fn call_streaming<T: Send + 'static>(
        &self,
        method: &'static str,
        params: Value,
        decode: Decoder<T>,
    ) -> BridgeFuture<T> {
        let id = self.shared.next_id();
        self.shared.request(id, method, params, decode, true)
    }

    fn path_call<T: Send + 'static>(
        &self,
        method: &'static str,
        path: &str,
        decode: Decoder<T>,
    ) -> BridgeFuture<T> {
        self.call(method, make_params(vec![("path", val_str(path))]), decode)
    }

    // -- Operations ---------------------------------------------------------

    /// Health check; resolves to the helper's protocol version.
    pub fn ping(&self) -> BridgeFuture<String> {
        self.call("ping", make_params(vec![]), decode_version)
    }

    pub fn is(&self, path: &str, kind: IsKind) -> BridgeFuture<bool> {
        let params = make_params(vec![("path", val_str(path)), ("kind", val_str(kind.as_str()))]);
        self.call("is", params, decode_bool)
    }

    pub fn stat(&self, path: &str) -> BridgeFuture<StatRecord> {
        self.path_call("stat", path, decode_stat)
    }

    pub fn readlink(&self, path: &str) -> BridgeFuture<String> {
        self.path_call("readlink", path, decode_string)
    }

    /// Stream the contents of `path` in chunks.  A negative `limit` reads
    /// to the end of the file.
    pub fn read_file(&self, path: &str, limit: i64, offset: i64) -> BridgeFuture<Bytes> {
        let params = make_params(vec![
            ("path", val_str(path)),
            ("limit", val_i64(limit)),
            ("offset", val_i64(offset)),
        ]);
        self.call_streaming("read", params, decode_bytes)
    }

    /// Replace the contents of `path`; resolves to the bytes written.
    pub fn write_file(&self, path: &str, data: &[u8]) -> BridgeFuture<i64> {
        let params = make_params(vec![("path", val_str(path)), ("data", val_bin(data))]);
        self.call("write", params, decode_i64)
    }

    pub fn remove_file(&self, path: &str) -> BridgeFuture<()> {
        self.path_call("remove", path, decode_unit)
    }

    pub fn remove_recursively(&self, path: &str) -> BridgeFuture<()> {
        self.path_call("remove_all", path, decode_unit)
    }

    pub fn ensure_existing_file(&self, path: &str) -> BridgeFuture<()> {
        self.path_call("ensure_existing", path, decode_unit)
    }

    pub fn create_dir(&self, path: &str) -> BridgeFuture<()> {
        self.path_call("mkdir", path, decode_unit)
    }

    pub fn copy_file(&self, source: &str, target: &str) -> BridgeFuture<()> {
        let params = make_params(vec![("src", val_str(source)), ("dst", val_str(target))]);
        self.call("copy", params, decode_unit)
    }

    pub fn rename_file(&self, source: &str, target: &str) -> BridgeFuture<()> {
        let params = make_params(vec![("src", val_str(source)), ("dst", val_str(target))]);
        self.call("rename", params, decode_unit)
    }

    pub fn free_space(&self, path: &str) -> BridgeFuture<u64> {
        self.path_call("free_space", path, decode_u64)
    }

    pub fn file_id(&self, path: &str) -> BridgeFuture<String> {
        self.path_call("file_id", path, decode_string)
    }

    pub fn owner(&self, path: &str) -> BridgeFuture<String> {
        self.path_call("owner", path, decode_string)
    }

    pub fn owner_id(&self, path: &str) -> BridgeFuture<u32> {
        self.path_call("owner_id", path, decode_u32)
    }

    pub fn group(&self, path: &str) -> BridgeFuture<String> {
        self.path_call("group", path, decode_string)
    }

    pub fn group_id(&self, path: &str) -> BridgeFuture<u32> {
        self.path_call("group_id", path, decode_u32)
    }

    /// Set the POSIX permission bits of `path`.
    pub fn set_permissions(&self, path: &str, mode: u32) -> BridgeFuture<()> {
        let params = make_params(vec![
            ("path", val_str(path)),
            ("mode", val_u64(u64::from(mode))),
        ]);
        self.call("set_permissions", params, decode_unit)
    }

    /// Stream the entries below `path` that pass `filter`.  Cancellable.
    pub fn find(&self, path: &str, filter: &FileFilter) -> BridgeFuture<FindEntry> {
        let params = make_params(vec![
            ("path", val_str(path)),
            ("name_filters", val_str_array(&filter.name_filters)),
            ("kinds", val_u64(u64::from(filter.kinds.bits()))),
            ("recursive", val_bool(filter.recursive)),
        ]);
        self.call_streaming("find", params, decode_find_entry)
    }

    /// Start watching `path`.  The watch ends when the handle is dropped.
    pub fn watch(&self, path: &FilePath) -> FilePathWatcher {
        let (events, receiver) = mpsc::unbounded_channel();
        let id = self.shared.next_id();
        {
            let mut state = self.shared.lock();
            if state.lost.is_none() {
                state.watchers.insert(
                    id,
                    WatchRoute {
                        base: path.clone(),
                        events,
                    },
                );
            }
        }

        let params = make_params(vec![("path", val_str(path.native_path()))]);
        let registration = self.shared.request(id, "watch", params, decode_unit, false);
        let shared = Arc::downgrade(&self.shared);
        FilePathWatcher::new(id, path.clone(), registration, receiver, move || {
            if let Some(shared) = shared.upgrade() {
                shared.unwatch(id);
            }
        })
    }

    pub fn signal_process(&self, pid: i64, signal: ControlSignal) -> BridgeFuture<()> {
        let params = make_params(vec![
            ("pid", val_i64(pid)),
            ("signal", val_str(signal.as_str())),
        ]);
        self.call("signal", params, decode_unit)
    }

    /// Create a temp file whose name matches `pattern`, where `*` stands for
    /// the random part.  Resolves to the created path.
    pub fn create_temp_file(&self, pattern: &str) -> BridgeFuture<String> {
        let params = make_params(vec![("pattern", val_str(pattern))]);
        self.call("create_temp_file", params, decode_string)
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("bridge_path", &self.bridge_path)
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
