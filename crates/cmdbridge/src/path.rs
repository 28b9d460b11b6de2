//! Host-qualified file paths.
//!
//! Local paths are plain POSIX strings.  Paths on another host use the
//! tramp URI form:
//!
//! ```text
//! /<scheme>:<user>@<host>#<port>:<native-path>
//! ```
//!
//! e.g. `/ssh:admin@build01#2222:/var/lib`.  Only the final
//! `<native-path>` is ever sent to the helper; the host part selects which
//! helper to talk to.

use std::fmt;

use crate::errors::{BridgeError, BridgeResult};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// The host part of a device path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceHost {
    pub scheme: String,
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
}

/// A path together with the host it lives on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct FilePath {
    host: Option<DeviceHost>,
    path: String,
}

/// Schemes recognised in device paths.
const KNOWN_SCHEMES: &[&str] = &["ssh", "docker", "device"];

impl fmt::Display for DeviceHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.scheme)?;
        if let Some(ref user) = self.user {
            write!(f, "{user}@")?;
        }
        write!(f, "{}", self.host)?;
        if let Some(port) = self.port {
            write!(f, "#{port}")?;
        }
        Ok(())
    }
}

impl fmt::Display for FilePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.host {
            Some(ref host) => write!(f, "/{host}:{}", self.path),
            None => write!(f, "{}", self.path),
        }
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Returns `true` if `path` starts with a known `/<scheme>:` prefix.
pub fn is_device_path(path: &str) -> bool {
    let Some(rest) = path.strip_prefix('/') else {
        return false;
    };
    let Some((candidate, _)) = rest.split_once(':') else {
        return false;
    };
    KNOWN_SCHEMES
        .iter()
        .any(|scheme| candidate.eq_ignore_ascii_case(scheme))
}

fn parse_host(segment: &str) -> BridgeResult<DeviceHost> {
    let (scheme, host_info) = segment
        .split_once(':')
        .ok_or_else(|| BridgeError::Usage(format!("expected ':' in device path '{segment}'")))?;

    let (user, remainder) = match host_info.split_once('@') {
        Some(("", rest)) => (None, rest),
        Some((user, rest)) => (Some(user.to_string()), rest),
        None => (None, host_info),
    };

    let (host, port) = match remainder.split_once('#') {
        Some((host, port_str)) => {
            let port = port_str
                .parse::<u16>()
                .map_err(|_| BridgeError::Usage(format!("invalid port '{port_str}'")))?;
            (host.to_string(), Some(port))
        }
        None => (remainder.to_string(), None),
    };

    if host.is_empty() {
        return Err(BridgeError::Usage(format!(
            "missing host in device path '{segment}'"
        )));
    }

    Ok(DeviceHost {
        scheme: scheme.to_ascii_lowercase(),
        user,
        host,
        port,
    })
}

impl FilePath {
    /// Parse either a plain local path or a device path.
    pub fn parse(path: &str) -> BridgeResult<Self> {
        if !is_device_path(path) {
            return Ok(Self::local(path));
        }

        let rest = &path[1..];
        // The native path starts at the first ":/" after the host segment.
        let sep = rest.find(":/").ok_or_else(|| {
            BridgeError::Usage(format!("missing remote path in device path '{path}'"))
        })?;

        Ok(Self {
            host: Some(parse_host(&rest[..sep])?),
            path: rest[sep + 1..].to_string(),
        })
    }

    pub fn local(path: impl Into<String>) -> Self {
        Self {
            host: None,
            path: path.into(),
        }
    }

    /// The host this path lives on, or `None` for local paths.
    pub fn host(&self) -> Option<&DeviceHost> {
        self.host.as_ref()
    }

    pub fn is_local(&self) -> bool {
        self.host.is_none()
    }

    pub fn is_empty(&self) -> bool {
        self.path.is_empty()
    }

    pub fn is_absolute_path(&self) -> bool {
        self.path.starts_with('/')
    }

    /// The path component, without any host prefix.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The path as the owning host understands it.
    pub fn native_path(&self) -> &str {
        &self.path
    }

    pub fn file_name(&self) -> &str {
        match self.path.rsplit_once('/') {
            Some((_, name)) => name,
            None => &self.path,
        }
    }

    /// Same host, different path.
    pub fn with_new_path(&self, path: impl Into<String>) -> Self {
        Self {
            host: self.host.clone(),
            path: path.into(),
        }
    }

    /// The containing directory.  Empty for `/` and for bare names.
    pub fn parent_dir(&self) -> Self {
        let trimmed = self.path.trim_end_matches('/');
        let parent = match trimmed.rsplit_once('/') {
            Some(("", _)) if !trimmed.is_empty() => "/",
            Some((parent, _)) => parent,
            None => "",
        };
        self.with_new_path(parent)
    }

    /// Resolve `relative` against this path as a directory.  Absolute
    /// inputs replace the path; `.` and `..` components are folded.
    pub fn resolve_path(&self, relative: &str) -> Self {
        if relative.starts_with('/') {
            return self.with_new_path(clean_path(relative));
        }
        if self.path.is_empty() {
            return self.with_new_path(clean_path(relative));
        }
        self.with_new_path(clean_path(&format!("{}/{relative}", self.path)))
    }

    /// Append a child component.
    pub fn join(&self, name: &str) -> Self {
        if self.path.ends_with('/') {
            self.with_new_path(format!("{}{name}", self.path))
        } else {
            self.with_new_path(format!("{}/{name}", self.path))
        }
    }
}

/// Fold `.`, `..` and repeated separators.
fn clean_path(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if parts.last().is_some_and(|p| *p != "..") {
                    parts.pop();
                } else if !absolute {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }
    let joined = parts.join("/");
    if absolute {
        format!("/{joined}")
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
