//! An in-memory stand-in for the cmdbridge helper.
//!
//! It serves a tiny file tree over `tokio::io::duplex` pipes and records
//! every request it receives, so tests can check both the answers and the
//! traffic.  A few magic paths change its behaviour:
//!
//! - `/hang` never gets a reply
//! - `/crash` makes the helper exit on the spot
//!
//! Nodes added with [`FakeHelper::unreadable`] show up in `find` listings
//! as error entries.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use cmdbridge::client::{Client, build_runtime};
use cmdbridge::config::BridgeConfig;
use cmdbridge::errors::ENOENT;
use cmdbridge::mode::runtime;
use cmdbridge::rpc::{
    self, Notification, Reply, Request, error_code, get_bin, get_i64, get_str, get_u64,
    make_params, val_bool, val_i64, val_str, val_u64,
};
use cmdbridge::runner::{HelperIo, HelperProcess};
use rmpv::Value;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

pub const TEMP_SUFFIX: &str = "a1b2c3";
const CHUNK: usize = 5;
const MODIFIED_NS: i64 = 1_700_000_000_000_000_000;

#[derive(Debug, Clone)]
pub enum Node {
    File(Vec<u8>),
    Dir,
    Symlink(String),
    Unreadable,
}

#[derive(Default)]
pub struct HelperState {
    pub nodes: BTreeMap<String, Node>,
    /// `(id, method, params)` of every request, in arrival order.
    pub requests: Vec<(u64, String, Value)>,
    pub cancelled: HashSet<u64>,
}

pub struct FakeHelper {
    pub state: Arc<Mutex<HelperState>>,
}

struct NoProcess;

impl HelperProcess for NoProcess {
    fn terminate(&mut self) {}
}

impl FakeHelper {
    pub fn new() -> Self {
        let mut state = HelperState::default();
        state.nodes.insert("/".into(), Node::Dir);
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn file(self, path: &str, contents: &[u8]) -> Self {
        self.insert(path, Node::File(contents.to_vec()))
    }

    pub fn dir(self, path: &str) -> Self {
        self.insert(path, Node::Dir)
    }

    pub fn symlink(self, path: &str, target: &str) -> Self {
        self.insert(path, Node::Symlink(target.to_string()))
    }

    pub fn unreadable(self, path: &str) -> Self {
        self.insert(path, Node::Unreadable)
    }

    fn insert(self, path: &str, node: Node) -> Self {
        self.state.lock().unwrap().nodes.insert(path.to_string(), node);
        self
    }

    /// Connect a fresh client to this helper.
    pub fn start(&self) -> Client {
        let config = BridgeConfig::default();
        let runtime = build_runtime(&config).unwrap();
        let (client_stdin, helper_stdin) = tokio::io::duplex(1 << 16);
        let (helper_stdout, client_stdout) = tokio::io::duplex(1 << 16);
        runtime.spawn(serve(helper_stdin, helper_stdout, Arc::clone(&self.state)));

        let io = HelperIo {
            stdin: Box::new(client_stdin),
            stdout: Box::new(client_stdout),
            process: Box::new(NoProcess),
        };
        Client::from_io(runtime, io, "/fake/cmdbridge-linux-amd64", &config)
    }

    pub fn methods(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state.requests.iter().map(|(_, m, _)| m.clone()).collect()
    }

    /// Params of the first request for `method`.
    pub fn params_of(&self, method: &str) -> Option<Value> {
        let state = self.state.lock().unwrap();
        state
            .requests
            .iter()
            .find(|(_, m, _)| m == method)
            .map(|(_, _, p)| p.clone())
    }

    pub fn id_of(&self, method: &str) -> Option<u64> {
        let state = self.state.lock().unwrap();
        state
            .requests
            .iter()
            .find(|(_, m, _)| m == method)
            .map(|(id, _, _)| *id)
    }

    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        match self.state.lock().unwrap().nodes.get(path) {
            Some(Node::File(data)) => Some(data.clone()),
            _ => None,
        }
    }

    /// Poll until `check` holds, for at most two seconds.
    pub fn wait_for(&self, check: impl Fn(&HelperState) -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if check(&self.state.lock().unwrap()) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }
}

// ---------------------------------------------------------------------------
// Serving
// ---------------------------------------------------------------------------

async fn serve(mut stdin: DuplexStream, mut stdout: DuplexStream, state: Arc<Mutex<HelperState>>) {
    let (queue, mut requests) = mpsc::unbounded_channel::<Request>();

    // Cancels are handled as they arrive, even while a stream is running.
    let reader_state = Arc::clone(&state);
    tokio::spawn(async move {
        while let Ok(buf) = rpc::read_frame(&mut stdin, 1 << 26).await {
            let Ok(request) = rmp_serde::from_slice::<Request>(&buf) else {
                continue;
            };
            let forward = {
                let mut state = reader_state.lock().unwrap();
                state
                    .requests
                    .push((request.id, request.method.clone(), request.params.clone()));
                if request.method == "cancel" {
                    let target = request.params.as_map().and_then(|m| get_u64(m, "target"));
                    if let Some(target) = target {
                        state.cancelled.insert(target);
                    }
                    None
                } else {
                    Some(request)
                }
            };
            if let Some(request) = forward {
                if queue.send(request).is_err() {
                    break;
                }
            }
        }
    });

    while let Some(request) = requests.recv().await {
        if !handle(&mut stdout, &state, request).await {
            return;
        }
    }
}

async fn send<T: serde::Serialize>(stdout: &mut DuplexStream, msg: &T) -> bool {
    let frame = rpc::encode_frame(msg, 1 << 26).unwrap();
    rpc::write_frame(stdout, &frame).await.is_ok()
}

fn parent(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some(("", _)) => "/",
        Some((parent, _)) => parent,
        None => "",
    }
}

fn mode_of(node: &Node) -> u32 {
    match node {
        Node::File(_) => 0o644,
        Node::Dir => 0o755 | runtime::DIR,
        Node::Symlink(_) => 0o777 | runtime::SYMLINK,
        Node::Unreadable => 0,
    }
}

fn size_of(node: &Node) -> i64 {
    match node {
        Node::File(data) => data.len() as i64,
        Node::Dir => 4096,
        Node::Symlink(target) => target.len() as i64,
        Node::Unreadable => 0,
    }
}

fn not_found(id: u64, path: &str) -> Reply {
    Reply::err(
        id,
        error_code::NOT_FOUND,
        format!("{path}: no such file or directory"),
        Some(ENOENT),
    )
}

/// Answer one request.  Returns `false` when the helper should exit.
async fn handle(stdout: &mut DuplexStream, state: &Arc<Mutex<HelperState>>, req: Request) -> bool {
    let id = req.id;
    let params = req.params.as_map().cloned().unwrap_or_default();
    let path = get_str(&params, "path").unwrap_or("").to_string();
    match path.as_str() {
        "/crash" => return false,
        "/hang" => return true,
        _ => {}
    }
    let node = state.lock().unwrap().nodes.get(&path).cloned();

    let reply = match req.method.as_str() {
        "ping" => Reply::ok(id, make_params(vec![("version", val_str("2.0"))])),
        "is" => {
            let answer = match (get_str(&params, "kind").unwrap_or(""), &node) {
                ("exists", n) => n.is_some(),
                ("file" | "readable-file" | "writable-file", Some(Node::File(_))) => true,
                ("dir" | "readable-dir" | "writable-dir", Some(Node::Dir)) => true,
                ("symlink", Some(Node::Symlink(_))) => true,
                _ => false,
            };
            Reply::ok(id, val_bool(answer))
        }
        "stat" => match node {
            Some(ref n) => Reply::ok(
                id,
                make_params(vec![
                    ("size", val_i64(size_of(n))),
                    ("mode", val_u64(u64::from(mode_of(n)))),
                    ("modified_ns", val_i64(MODIFIED_NS)),
                    ("nlinks", val_u64(1)),
                    ("user_mode_extras", val_u64(0x600)),
                ]),
            ),
            None => not_found(id, &path),
        },
        "readlink" => match node {
            Some(Node::Symlink(target)) => Reply::ok(id, val_str(&target)),
            Some(_) => Reply::err(id, error_code::IO_ERROR, "invalid argument", Some(22)),
            None => not_found(id, &path),
        },
        "read" => {
            let Some(Node::File(data)) = node else {
                return send(stdout, &not_found(id, &path)).await;
            };
            let offset = get_i64(&params, "offset").unwrap_or(0).max(0) as usize;
            let limit = get_i64(&params, "limit").unwrap_or(-1);
            let start = offset.min(data.len());
            let end = if limit < 0 {
                data.len()
            } else {
                (start + limit as usize).min(data.len())
            };
            for chunk in data[start..end].chunks(CHUNK) {
                if !send(stdout, &Reply::chunk(id, Value::Binary(chunk.to_vec()))).await {
                    return false;
                }
            }
            Reply::done(id)
        }
        "write" => {
            let data = get_bin(&params, "data").unwrap_or_default().to_vec();
            let written = data.len() as i64;
            state.lock().unwrap().nodes.insert(path, Node::File(data));
            Reply::ok(id, val_i64(written))
        }
        "remove" => match node {
            Some(Node::Dir) => Reply::err(id, error_code::IO_ERROR, "is a directory", Some(21)),
            Some(_) => {
                state.lock().unwrap().nodes.remove(&path);
                Reply::done(id)
            }
            None => not_found(id, &path),
        },
        "mkdir" => {
            state.lock().unwrap().nodes.insert(path, Node::Dir);
            Reply::done(id)
        }
        "create_temp_file" => {
            let pattern = get_str(&params, "pattern").unwrap_or("");
            let created = pattern.replace('*', TEMP_SUFFIX);
            state
                .lock()
                .unwrap()
                .nodes
                .insert(created.clone(), Node::File(Vec::new()));
            Reply::ok(id, val_str(&created))
        }
        "find" => return stream_find(stdout, state, id, &path).await,
        "owner" | "group" => Reply::ok(id, val_str("root")),
        "owner_id" | "group_id" => Reply::ok(id, val_u64(0)),
        "free_space" => Reply::ok(id, val_u64(1 << 30)),
        "file_id" => Reply::ok(id, val_str("2049:131")),
        "set_permissions" | "signal" | "watch.remove" => Reply::done(id),
        "watch" => {
            if !send(stdout, &Reply::done(id)).await {
                return false;
            }
            let event = Notification::new(
                "watch.event",
                make_params(vec![
                    ("watch", val_u64(id)),
                    ("path", val_str(&format!("{path}/new.txt"))),
                    ("kind", val_str("create")),
                ]),
            );
            return send(stdout, &event).await;
        }
        other => Reply::err(id, error_code::METHOD_NOT_FOUND, other, None),
    };
    send(stdout, &reply).await
}

/// Stream the children of `dir`, stopping early when cancelled.
async fn stream_find(
    stdout: &mut DuplexStream,
    state: &Arc<Mutex<HelperState>>,
    id: u64,
    dir: &str,
) -> bool {
    let children: Vec<(String, Node)> = {
        let state = state.lock().unwrap();
        state
            .nodes
            .iter()
            .filter(|(p, _)| p.as_str() != dir && parent(p) == dir)
            .map(|(p, n)| (p.clone(), n.clone()))
            .collect()
    };

    for (path, node) in children {
        if state.lock().unwrap().cancelled.contains(&id) {
            return send(stdout, &Reply::cancelled(id)).await;
        }
        if let Node::Unreadable = node {
            let message = format!("{path}: permission denied");
            let error = make_params(vec![("error", val_str(&message))]);
            if !send(stdout, &Reply::chunk(id, error)).await {
                return false;
            }
            continue;
        }
        let entry = make_params(vec![
            ("path", val_str(&path)),
            ("size", val_i64(size_of(&node))),
            ("mode", val_u64(u64::from(mode_of(&node)))),
            ("modified_ns", val_i64(MODIFIED_NS)),
        ]);
        if !send(stdout, &Reply::chunk(id, entry)).await {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    send(stdout, &Reply::done(id)).await
}
