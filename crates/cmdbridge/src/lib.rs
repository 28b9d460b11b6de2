//! `cmdbridge`: file access on local and remote devices through a small
//! helper process.
//!
//! The helper runs on the target machine and speaks a length-prefixed
//! MsgPack protocol over its stdin/stdout.  This crate provides:
//!
//! - [`Client`]: starts the helper, multiplexes requests,
//!   hands out [`BridgeFuture`]s and fails them all if the helper dies
//! - [`Deployer`]: finds the right helper binary for a host and stages it
//!   there over `dd` when the host is remote
//! - [`BridgeFileAccess`]: the blocking [`DeviceFileAccess`] API callers
//!   use, built on the two above
//! - [`file_flags_from_stat_mode`]: translation of the helper's mode word
//!
//! Remote paths use the form `/<scheme>:<user>@<host>#<port>:<path>`:
//!
//! ```text
//! /ssh:admin@build01:/var/lib
//! ```
//!
//! The library logs through `tracing` and never installs a subscriber.

pub mod access;
pub mod client;
pub mod config;
pub mod deploy;
pub mod errors;
pub mod future;
pub mod mode;
pub mod path;
pub mod rpc;
pub mod runner;
pub mod types;
pub mod watcher;

pub use access::{
    BridgeFileAccess, DeviceFileAccess, IterateCallback, IterationPolicy, temp_file_pattern,
};
pub use client::Client;
pub use config::BridgeConfig;
pub use deploy::{DeployedHelper, Deployer, OsArch, OsType};
pub use errors::{BridgeError, BridgeResult};
pub use future::BridgeFuture;
pub use mode::{FileFlags, file_flags_from_stat_mode};
pub use path::{DeviceHost, FilePath};
pub use runner::{CommandRunner, LocalRunner, SshRunner};
pub use types::{
    ControlSignal, Environment, FileFilter, FilePathInfo, FilterKinds, FindEntry, IsKind,
    StatRecord,
};
pub use watcher::{ChangeKind, FilePathWatcher, WatchEvent};
