//! Value types exchanged between the transport and its callers.

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bitflags::bitflags;
use rmpv::Value;

use crate::errors::{BridgeError, BridgeResult};
use crate::mode::FileFlags;
use crate::rpc::{expect_map, get_i64, get_str, get_u64};

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

/// Variables handed to the helper process at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    vars: BTreeMap<String, String>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// `NAME=value` pairs, sorted by name.
    pub fn to_assignments(&self) -> Vec<String> {
        self.iter().map(|(k, v)| format!("{k}={v}")).collect()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Environment {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            vars: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Stat / path info
// ---------------------------------------------------------------------------

/// What the helper reports for `stat`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatRecord {
    pub size: i64,
    /// POSIX permission bits and runtime type bits (see [`crate::mode`]).
    pub mode: u32,
    pub modified_time: SystemTime,
    pub num_hard_links: u32,
    /// `FileFlags` bits describing what the helper's own user may do.
    pub user_mode_extras: u32,
}

/// Size, flags and modification time of a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePathInfo {
    pub size: i64,
    pub flags: FileFlags,
    pub modified_time: SystemTime,
}

impl Default for FilePathInfo {
    fn default() -> Self {
        Self {
            size: 0,
            flags: FileFlags::empty(),
            modified_time: UNIX_EPOCH,
        }
    }
}

/// One entry streamed by `find`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FindEntry {
    Entry {
        path: String,
        size: i64,
        mode: u32,
        modified_time: SystemTime,
    },
    Error(String),
}

/// Decode a `modified_ns` field (nanoseconds since the epoch, may be
/// negative for pre-1970 timestamps).
fn time_from_ns(ns: i64) -> SystemTime {
    if ns >= 0 {
        UNIX_EPOCH + Duration::from_nanos(ns as u64)
    } else {
        UNIX_EPOCH - Duration::from_nanos(ns.unsigned_abs())
    }
}

/// Read an optional 32-bit field, rejecting values that do not fit.
fn get_u32(map: &[(Value, Value)], method: &str, key: &str) -> BridgeResult<Option<u32>> {
    match get_u64(map, key) {
        None => Ok(None),
        Some(n) => u32::try_from(n).map(Some).map_err(|_| {
            BridgeError::Protocol(format!("{method}: '{key}' out of range: {n}"))
        }),
    }
}

impl StatRecord {
    pub(crate) fn from_value(value: &Value) -> BridgeResult<Self> {
        let map = expect_map(value, "stat")?;
        let size = get_i64(map, "size")
            .ok_or_else(|| BridgeError::Protocol("stat: missing 'size'".into()))?;
        let mode = get_u32(map, "stat", "mode")?
            .ok_or_else(|| BridgeError::Protocol("stat: missing 'mode'".into()))?;
        Ok(Self {
            size,
            mode,
            modified_time: time_from_ns(get_i64(map, "modified_ns").unwrap_or(0)),
            num_hard_links: get_u32(map, "stat", "nlinks")?.unwrap_or(1),
            user_mode_extras: get_u32(map, "stat", "user_mode_extras")?.unwrap_or(0),
        })
    }
}

impl FindEntry {
    pub(crate) fn from_value(value: &Value) -> BridgeResult<Self> {
        let map = expect_map(value, "find")?;
        if let Some(err) = get_str(map, "error") {
            return Ok(FindEntry::Error(err.to_string()));
        }
        let path = get_str(map, "path")
            .ok_or_else(|| BridgeError::Protocol("find: missing 'path'".into()))?;
        Ok(FindEntry::Entry {
            path: path.to_string(),
            size: get_i64(map, "size").unwrap_or(0),
            mode: get_u32(map, "find", "mode")?.unwrap_or(0),
            modified_time: time_from_ns(get_i64(map, "modified_ns").unwrap_or(0)),
        })
    }
}

// ---------------------------------------------------------------------------
// Request parameters
// ---------------------------------------------------------------------------

/// The property an `is` request checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IsKind {
    ExecutableFile,
    ReadableFile,
    WritableFile,
    ReadableDir,
    WritableDir,
    File,
    Dir,
    Symlink,
    Exists,
}

impl IsKind {
    pub fn as_str(self) -> &'static str {
        match self {
            IsKind::ExecutableFile => "executable-file",
            IsKind::ReadableFile => "readable-file",
            IsKind::WritableFile => "writable-file",
            IsKind::ReadableDir => "readable-dir",
            IsKind::WritableDir => "writable-dir",
            IsKind::File => "file",
            IsKind::Dir => "dir",
            IsKind::Symlink => "symlink",
            IsKind::Exists => "exists",
        }
    }
}

/// Signals the helper can deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    Interrupt,
    Terminate,
    Kill,
}

impl ControlSignal {
    pub fn as_str(self) -> &'static str {
        match self {
            ControlSignal::Interrupt => "interrupt",
            ControlSignal::Terminate => "terminate",
            ControlSignal::Kill => "kill",
        }
    }
}

bitflags! {
    /// Which entries `find` reports.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FilterKinds: u32 {
        const DIRS = 0x001;
        const FILES = 0x002;
        const DRIVES = 0x004;
        const NO_SYMLINKS = 0x008;
        const READABLE = 0x010;
        const WRITABLE = 0x020;
        const EXECUTABLE = 0x040;
        const HIDDEN = 0x100;
        const SYSTEM = 0x200;
        const NO_DOT = 0x2000;
        const NO_DOT_DOT = 0x4000;
        const NO_DOT_AND_DOT_DOT = Self::NO_DOT.bits() | Self::NO_DOT_DOT.bits();
    }
}

impl Default for FilterKinds {
    fn default() -> Self {
        FilterKinds::DIRS | FilterKinds::FILES | FilterKinds::NO_DOT_AND_DOT_DOT
    }
}

/// Directory iteration filter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileFilter {
    /// Glob patterns matched against entry names, e.g. `*.cpp`.
    pub name_filters: Vec<String>,
    pub kinds: FilterKinds,
    /// Descend into subdirectories.
    pub recursive: bool,
}

impl FileFilter {
    pub fn new(name_filters: Vec<String>, kinds: FilterKinds) -> Self {
        Self {
            name_filters,
            kinds,
            recursive: false,
        }
    }

    pub fn recursive(mut self) -> Self {
        self.recursive = true;
        self
    }
}
