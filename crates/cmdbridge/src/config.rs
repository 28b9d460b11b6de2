//! Client configuration.
//!
//! Everything has a built-in default; a few knobs can be overridden from the
//! process environment:
//!
//! | Variable                  | Effect                                      |
//! |---------------------------|---------------------------------------------|
//! | `CMDBRIDGE_LIBEXEC_DIR`   | Directory holding `cmdbridge-<os>-<arch>`   |
//! | `CMDBRIDGE_IO_THREADS`    | Worker threads of the transport runtime     |
//! | `CMDBRIDGE_MAX_FRAME`     | Largest accepted reply payload, in bytes    |

use std::path::PathBuf;

/// Maximum payload size (64 MiB) to prevent runaway allocations.
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

/// Base name of helper binaries and of staged temp files.
pub const HELPER_PREFIX: &str = "cmdbridge";

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Overrides the lib-exec directory passed to `deploy_and_init`.
    pub lib_exec_dir: Option<PathBuf>,
    /// Helper file names are `<prefix>-<os>-<arch>`.
    pub helper_prefix: String,
    /// `mktemp -t <prefix>.XXXXXXXXXX` is used for staged helpers.
    pub temp_prefix: String,
    pub max_frame_size: u32,
    /// Worker threads of the runtime that drives the helper's stdio.
    pub io_threads: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            lib_exec_dir: None,
            helper_prefix: HELPER_PREFIX.to_string(),
            temp_prefix: HELPER_PREFIX.to_string(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            io_threads: 2,
        }
    }
}

impl BridgeConfig {
    /// Defaults, with overrides taken from the environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(dir) = lookup("CMDBRIDGE_LIBEXEC_DIR").filter(|d| !d.is_empty()) {
            config.lib_exec_dir = Some(PathBuf::from(dir));
        }

        match lookup("CMDBRIDGE_IO_THREADS").map(|v| v.parse::<usize>()) {
            Some(Ok(n)) if n > 0 => config.io_threads = n,
            Some(_) => tracing::warn!("ignoring invalid CMDBRIDGE_IO_THREADS"),
            None => {}
        }

        match lookup("CMDBRIDGE_MAX_FRAME").map(|v| v.parse::<u32>()) {
            Some(Ok(n)) if n > 0 => config.max_frame_size = n,
            Some(_) => tracing::warn!("ignoring invalid CMDBRIDGE_MAX_FRAME"),
            None => {}
        }

        config
    }

    /// The `mktemp` template used when staging a helper.
    pub fn temp_template(&self) -> String {
        format!("{}.XXXXXXXXXX", self.temp_prefix)
    }
}
