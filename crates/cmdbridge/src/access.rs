//! Blocking file access on top of a [`Client`].
//!
//! [`DeviceFileAccess`] is the interface file-system callers program
//! against; [`BridgeFileAccess`] implements it by turning every call into a
//! helper request and waiting for the answer.  Read-style probes never fail
//! loudly: they log a warning and return a neutral value.  Mutating
//! operations return a [`BridgeResult`].
//!
//! All methods block the calling thread, so they must not be called from
//! inside an async runtime.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Bytes, BytesMut};

use crate::client::{Client, build_runtime};
use crate::config::BridgeConfig;
use crate::deploy::{Deployer, check_remote_root};
use crate::errors::{BridgeError, BridgeResult};
use crate::future::BridgeFuture;
use crate::mode::{FileFlags, file_flags_from_stat_mode, stat_mode_from_permissions};
use crate::path::FilePath;
use crate::runner::{CommandRunner, LocalRunner, SshRunner};
use crate::types::{
    ControlSignal, Environment, FileFilter, FilePathInfo, FindEntry, IsKind, StatRecord,
};
use crate::watcher::FilePathWatcher;

/// What a directory iteration callback wants to happen next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationPolicy {
    Continue,
    Stop,
}

/// Callback invoked once per entry by [`DeviceFileAccess::iterate_directory`].
pub enum IterateCallback<'a> {
    Path(Box<dyn FnMut(&FilePath) -> IterationPolicy + 'a>),
    PathAndInfo(Box<dyn FnMut(&FilePath, &FilePathInfo) -> IterationPolicy + 'a>),
}

impl<'a> IterateCallback<'a> {
    pub fn path(callback: impl FnMut(&FilePath) -> IterationPolicy + 'a) -> Self {
        IterateCallback::Path(Box::new(callback))
    }

    pub fn path_and_info(
        callback: impl FnMut(&FilePath, &FilePathInfo) -> IterationPolicy + 'a,
    ) -> Self {
        IterateCallback::PathAndInfo(Box::new(callback))
    }

    fn call(&mut self, path: &FilePath, info: impl FnOnce() -> FilePathInfo) -> IterationPolicy {
        match self {
            IterateCallback::Path(callback) => callback(path),
            IterateCallback::PathAndInfo(callback) => callback(path, &info()),
        }
    }
}

/// Synchronous access to the files of one device.
pub trait DeviceFileAccess: Send + Sync {
    fn is_executable_file(&self, path: &FilePath) -> bool;
    fn is_readable_file(&self, path: &FilePath) -> bool;
    fn is_writable_file(&self, path: &FilePath) -> bool;
    fn is_readable_directory(&self, path: &FilePath) -> bool;
    fn is_writable_directory(&self, path: &FilePath) -> bool;
    fn is_file(&self, path: &FilePath) -> bool;
    fn is_directory(&self, path: &FilePath) -> bool;
    fn is_sym_link(&self, path: &FilePath) -> bool;
    fn exists(&self, path: &FilePath) -> bool;

    fn file_size(&self, path: &FilePath) -> i64;
    fn last_modified(&self, path: &FilePath) -> Option<SystemTime>;
    fn owner(&self, path: &FilePath) -> String;
    fn owner_id(&self, path: &FilePath) -> u32;
    fn group(&self, path: &FilePath) -> String;
    fn group_id(&self, path: &FilePath) -> u32;
    fn has_hard_links(&self, path: &FilePath) -> bool;
    fn bytes_available(&self, path: &FilePath) -> Option<u64>;
    fn file_id(&self, path: &FilePath) -> String;

    fn file_path_info(&self, path: &FilePath) -> FilePathInfo;
    fn permissions(&self, path: &FilePath) -> FileFlags;
    fn set_permissions(&self, path: &FilePath, permissions: FileFlags) -> bool;
    fn sym_link_target(&self, path: &FilePath) -> FilePath;

    /// Up to `limit` bytes starting at `offset`; `limit < 1` reads to the
    /// end of the file.
    fn file_contents(&self, path: &FilePath, limit: i64, offset: i64) -> BridgeResult<Bytes>;
    fn write_file_contents(&self, path: &FilePath, data: &[u8]) -> BridgeResult<i64>;

    fn remove_file(&self, path: &FilePath) -> BridgeResult<()>;
    fn remove_recursively(&self, path: &FilePath) -> BridgeResult<()>;
    fn ensure_existing_file(&self, path: &FilePath) -> BridgeResult<()>;
    fn create_directory(&self, path: &FilePath) -> BridgeResult<()>;
    fn copy_file(&self, source: &FilePath, target: &FilePath) -> BridgeResult<()>;
    fn rename_file(&self, source: &FilePath, target: &FilePath) -> BridgeResult<()>;
    fn create_temp_file(&self, pattern: &FilePath) -> BridgeResult<FilePath>;

    fn iterate_directory(
        &self,
        path: &FilePath,
        callback: IterateCallback<'_>,
        filter: &FileFilter,
    ) -> BridgeResult<()>;

    fn watch(&self, path: &FilePath) -> BridgeResult<FilePathWatcher>;
    fn signal_process(&self, pid: i64, signal: ControlSignal) -> BridgeResult<()>;
    fn device_environment(&self) -> Environment;
}

/// Turn a `mktemp`-style pattern into the helper's wildcard form.
///
/// `/tmp/build.XXXXXX` becomes `/tmp/build.*`.  At least two trailing `X`s
/// are needed; any other pattern gets `.*` appended.
pub fn temp_file_pattern(pattern: &str) -> String {
    let stem = pattern.trim_end_matches('X');
    if pattern.len() - stem.len() >= 2 {
        format!("{stem}*")
    } else {
        format!("{pattern}.*")
    }
}

/// Info reported for `/` without asking the helper.
fn root_info() -> FilePathInfo {
    FilePathInfo {
        size: 4096,
        flags: FileFlags::READ_OWNER
            | FileFlags::WRITE_OWNER
            | FileFlags::EXE_OWNER
            | FileFlags::READ_GROUP
            | FileFlags::EXE_GROUP
            | FileFlags::READ_OTHER
            | FileFlags::EXE_OTHER
            | FileFlags::DIRECTORY_TYPE
            | FileFlags::LOCAL_DISK_FLAG
            | FileFlags::EXISTS_FLAG,
        modified_time: UNIX_EPOCH,
    }
}

// ---------------------------------------------------------------------------
// BridgeFileAccess
// ---------------------------------------------------------------------------

/// [`DeviceFileAccess`] backed by a cmdbridge helper.
pub struct BridgeFileAccess {
    client: Option<Client>,
    environment: Environment,
    config: BridgeConfig,
}

impl Default for BridgeFileAccess {
    fn default() -> Self {
        Self::with_config(BridgeConfig::from_env())
    }
}

impl BridgeFileAccess {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: BridgeConfig) -> Self {
        Self {
            client: None,
            environment: Environment::new(),
            config,
        }
    }

    /// Start the helper at `bridge_path` on this machine.
    pub fn init(
        &mut self,
        bridge_path: &str,
        environment: Environment,
        delete_on_exit: bool,
    ) -> BridgeResult<()> {
        self.shutdown();
        let runtime = build_runtime(&self.config)?;
        let client = Client::start(
            runtime,
            &LocalRunner,
            bridge_path,
            &environment,
            delete_on_exit,
            &self.config,
        )?;
        self.client = Some(client);
        self.environment = environment;
        Ok(())
    }

    /// Find or stage a helper for `remote_root`'s host, then start it.
    pub fn deploy_and_init(
        &mut self,
        lib_exec_dir: &Path,
        remote_root: &FilePath,
        environment: Environment,
    ) -> BridgeResult<()> {
        self.shutdown();
        check_remote_root(remote_root)?;
        let lib_exec_dir = self.config.lib_exec_dir.as_deref().unwrap_or(lib_exec_dir);
        let runtime = build_runtime(&self.config)?;

        let runner: Box<dyn CommandRunner> = match remote_root.host() {
            Some(host) if !remote_root.is_empty() => {
                Box::new(runtime.block_on(SshRunner::connect(host))?)
            }
            _ => Box::new(LocalRunner),
        };

        let deployer = Deployer::new(&self.config);
        let deployed = runtime.block_on(deployer.deploy(runner.as_ref(), lib_exec_dir, remote_root))?;

        let client = Client::start(
            runtime,
            runner.as_ref(),
            &deployed.path,
            &environment,
            deployed.delete_on_exit,
            &self.config,
        )?;
        self.client = Some(client);
        self.environment = environment;
        Ok(())
    }

    /// Use an already running client.
    pub fn from_client(client: Client, environment: Environment) -> Self {
        Self {
            client: Some(client),
            environment,
            config: BridgeConfig::default(),
        }
    }

    /// `true` while a helper is connected and alive.
    pub fn is_initialized(&self) -> bool {
        self.client.as_ref().is_some_and(Client::is_alive)
    }

    /// The helper path the current client was started with.
    pub fn bridge_path(&self) -> Option<&str> {
        self.client.as_ref().map(Client::bridge_path)
    }

    /// Stop the helper.  The access object can be initialised again.
    pub fn shutdown(&mut self) {
        if let Some(client) = self.client.take() {
            client.shutdown();
        }
    }

    fn client(&self) -> BridgeResult<&Client> {
        match self.client {
            Some(ref client) => Ok(client),
            None => Err(BridgeError::TransportLost("not initialised".into())),
        }
    }

    fn wait<T: Clone>(&self, request: impl FnOnce(&Client) -> BridgeFuture<T>) -> BridgeResult<T> {
        request(self.client()?).result()
    }

    fn probe(&self, path: &FilePath, kind: IsKind) -> bool {
        match self.wait(|c| c.is(path.native_path(), kind)) {
            Ok(answer) => answer,
            Err(e) => {
                tracing::warn!(path = %path, kind = kind.as_str(), error = %e, "probe failed");
                false
            }
        }
    }

    /// Wait for a scalar, falling back to `T::default()` on failure.
    fn scalar<T: Clone + Default>(
        &self,
        what: &str,
        path: &FilePath,
        request: impl FnOnce(&Client) -> BridgeFuture<T>,
    ) -> T {
        self.wait(request).unwrap_or_else(|e| {
            tracing::warn!(path = %path, error = %e, "{what} failed");
            T::default()
        })
    }

    fn stat(&self, path: &FilePath) -> Option<StatRecord> {
        match self.wait(|c| c.stat(path.native_path())) {
            Ok(stat) => Some(stat),
            Err(e) => {
                tracing::warn!(path = %path, error = %e, "stat failed");
                None
            }
        }
    }
}

impl DeviceFileAccess for BridgeFileAccess {
    fn is_executable_file(&self, path: &FilePath) -> bool {
        self.probe(path, IsKind::ExecutableFile)
    }

    fn is_readable_file(&self, path: &FilePath) -> bool {
        self.probe(path, IsKind::ReadableFile)
    }

    fn is_writable_file(&self, path: &FilePath) -> bool {
        self.probe(path, IsKind::WritableFile)
    }

    fn is_readable_directory(&self, path: &FilePath) -> bool {
        self.probe(path, IsKind::ReadableDir)
    }

    fn is_writable_directory(&self, path: &FilePath) -> bool {
        self.probe(path, IsKind::WritableDir)
    }

    fn is_file(&self, path: &FilePath) -> bool {
        self.probe(path, IsKind::File)
    }

    fn is_directory(&self, path: &FilePath) -> bool {
        self.probe(path, IsKind::Dir)
    }

    fn is_sym_link(&self, path: &FilePath) -> bool {
        self.probe(path, IsKind::Symlink)
    }

    fn exists(&self, path: &FilePath) -> bool {
        self.probe(path, IsKind::Exists)
    }

    fn file_size(&self, path: &FilePath) -> i64 {
        self.stat(path).map_or(0, |s| s.size)
    }

    fn last_modified(&self, path: &FilePath) -> Option<SystemTime> {
        self.stat(path).map(|s| s.modified_time)
    }

    fn owner(&self, path: &FilePath) -> String {
        self.scalar("owner", path, |c| c.owner(path.native_path()))
    }

    fn owner_id(&self, path: &FilePath) -> u32 {
        self.scalar("owner_id", path, |c| c.owner_id(path.native_path()))
    }

    fn group(&self, path: &FilePath) -> String {
        self.scalar("group", path, |c| c.group(path.native_path()))
    }

    fn group_id(&self, path: &FilePath) -> u32 {
        self.scalar("group_id", path, |c| c.group_id(path.native_path()))
    }

    fn has_hard_links(&self, path: &FilePath) -> bool {
        self.stat(path).is_some_and(|s| s.num_hard_links > 1)
    }

    fn bytes_available(&self, path: &FilePath) -> Option<u64> {
        match self.wait(|c| c.free_space(path.native_path())) {
            Ok(free) => Some(free),
            Err(e) => {
                tracing::warn!(path = %path, error = %e, "free_space failed");
                None
            }
        }
    }

    fn file_id(&self, path: &FilePath) -> String {
        self.scalar("file_id", path, |c| c.file_id(path.native_path()))
    }

    fn file_path_info(&self, path: &FilePath) -> FilePathInfo {
        if path.path() == "/" {
            return root_info();
        }
        match self.stat(path) {
            Some(stat) => FilePathInfo {
                size: stat.size,
                flags: file_flags_from_stat_mode(stat.mode)
                    | FileFlags::from_bits_truncate(stat.user_mode_extras),
                modified_time: stat.modified_time,
            },
            None => FilePathInfo::default(),
        }
    }

    fn permissions(&self, path: &FilePath) -> FileFlags {
        self.file_path_info(path).flags & FileFlags::PERMISSIONS_MASK
    }

    fn set_permissions(&self, path: &FilePath, permissions: FileFlags) -> bool {
        let mode = stat_mode_from_permissions(permissions);
        match self.wait(|c| c.set_permissions(path.native_path(), mode)) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(path = %path, mode = %format!("{mode:o}"), error = %e, "set_permissions failed");
                false
            }
        }
    }

    fn sym_link_target(&self, path: &FilePath) -> FilePath {
        match self.wait(|c| c.readlink(path.native_path())) {
            Ok(target) => path.parent_dir().resolve_path(&target),
            Err(e) => {
                tracing::warn!(path = %path, error = %e, "readlink failed");
                path.with_new_path("")
            }
        }
    }

    fn file_contents(&self, path: &FilePath, limit: i64, offset: i64) -> BridgeResult<Bytes> {
        let limit = if limit < 1 { -1 } else { limit };
        let chunks = self
            .client()?
            .read_file(path.native_path(), limit, offset)
            .wait()
            .map_err(|e| e.context(format!("Failed reading file {path}")))?;

        if chunks.len() == 1 {
            return Ok(chunks.into_iter().next().unwrap_or_default());
        }
        let mut contents = BytesMut::with_capacity(chunks.iter().map(Bytes::len).sum());
        for chunk in &chunks {
            contents.extend_from_slice(chunk);
        }
        Ok(contents.freeze())
    }

    fn write_file_contents(&self, path: &FilePath, data: &[u8]) -> BridgeResult<i64> {
        self.wait(|c| c.write_file(path.native_path(), data))
            .map_err(|e| e.context(format!("Failed writing file {path}")))
    }

    fn remove_file(&self, path: &FilePath) -> BridgeResult<()> {
        self.wait(|c| c.remove_file(path.native_path()))
            .map_err(|e| {
                if e.is_not_found() {
                    e.context(format!("File does not exist: {path}"))
                } else {
                    e.context(format!("Failed to remove file {path}"))
                }
            })
    }

    fn remove_recursively(&self, path: &FilePath) -> BridgeResult<()> {
        self.wait(|c| c.remove_recursively(path.native_path()))
            .map_err(|e| e.context(format!("Failed to remove directory {path}")))
    }

    fn ensure_existing_file(&self, path: &FilePath) -> BridgeResult<()> {
        self.wait(|c| c.ensure_existing_file(path.native_path()))
            .map_err(|e| e.context(format!("Failed to create file {path}")))
    }

    fn create_directory(&self, path: &FilePath) -> BridgeResult<()> {
        self.wait(|c| c.create_dir(path.native_path()))
            .map_err(|e| e.context(format!("Failed to create directory {path}")))
    }

    fn copy_file(&self, source: &FilePath, target: &FilePath) -> BridgeResult<()> {
        self.wait(|c| c.copy_file(source.native_path(), target.native_path()))
            .map_err(|e| e.context(format!("Failed to copy {source} to {target}")))
    }

    fn rename_file(&self, source: &FilePath, target: &FilePath) -> BridgeResult<()> {
        self.wait(|c| c.rename_file(source.native_path(), target.native_path()))
            .map_err(|e| e.context(format!("Failed to rename {source} to {target}")))
    }

    fn create_temp_file(&self, pattern: &FilePath) -> BridgeResult<FilePath> {
        let wildcard = temp_file_pattern(pattern.native_path());
        let created = self
            .wait(|c| c.create_temp_file(&wildcard))
            .map_err(|e| e.context(format!("Failed creating temporary file from {pattern}")))?;
        Ok(pattern.with_new_path(created))
    }

    fn iterate_directory(
        &self,
        path: &FilePath,
        mut callback: IterateCallback<'_>,
        filter: &FileFilter,
    ) -> BridgeResult<()> {
        let entries = self.client()?.find(path.native_path(), filter);

        for entry in entries.stream() {
            let (found, size, mode, modified_time) = match entry {
                FindEntry::Entry {
                    path: found,
                    size,
                    mode,
                    modified_time,
                } => (found, size, mode, modified_time),
                FindEntry::Error(message) => {
                    tracing::warn!(dir = %path, %message, "error while iterating directory");
                    continue;
                }
            };

            let entry_path = path.with_new_path(found);
            let policy = callback.call(&entry_path, || FilePathInfo {
                size,
                flags: file_flags_from_stat_mode(mode),
                modified_time,
            });
            if policy == IterationPolicy::Stop {
                entries.cancel();
                return Ok(());
            }
        }

        match entries.error() {
            Some(e) => Err(e.context(format!("Failed iterating {path}"))),
            None => Ok(()),
        }
    }

    fn watch(&self, path: &FilePath) -> BridgeResult<FilePathWatcher> {
        Ok(self.client()?.watch(path))
    }

    fn signal_process(&self, pid: i64, signal: ControlSignal) -> BridgeResult<()> {
        self.wait(|c| c.signal_process(pid, signal))
            .map_err(|e| e.context(format!("Failed to send {} to {pid}", signal.as_str())))
    }

    fn device_environment(&self) -> Environment {
        self.environment.clone()
    }
}

impl Drop for BridgeFileAccess {
    fn drop(&mut self) {
        self.shutdown();
    }
}
