//! Helper deployment.
//!
//! Before a remote host can be served, a helper built for its OS and
//! architecture has to be on it:
//!
//! 1. Make sure `dd` exists (it is what copies the binary over).
//! 2. Detect OS and architecture with `uname -s` / `uname -m`.
//! 3. Pick `<prefix>-<os>-<arch>` from the local lib-exec directory.
//! 4. `mktemp`, stream the bytes through `dd of=<tmp>`, `chmod +x`.
//!
//! The staged copy is started with `--delete-on-exit` so it removes itself.
//! Local roots skip all of this and run the host's own helper in place.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::config::BridgeConfig;
use crate::errors::{BridgeError, BridgeResult};
use crate::path::FilePath;
use crate::runner::CommandRunner;

// ---------------------------------------------------------------------------
// Platform detection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsType {
    Linux,
    Mac,
    Windows,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsArch {
    Amd64,
    Arm64,
    X86,
    Arm,
}

impl OsType {
    /// Parse `uname -s` output.
    pub fn from_uname(output: &str) -> Option<Self> {
        let name = output.trim();
        if name.eq_ignore_ascii_case("linux") {
            return Some(OsType::Linux);
        }
        if name.eq_ignore_ascii_case("darwin") {
            return Some(OsType::Mac);
        }
        let upper = name.to_ascii_uppercase();
        if upper.starts_with("MINGW")
            || upper.starts_with("MSYS")
            || upper.starts_with("CYGWIN")
            || upper.starts_with("WINDOWS")
        {
            return Some(OsType::Windows);
        }
        None
    }

    /// The OS this process runs on.
    pub fn host() -> Option<Self> {
        match std::env::consts::OS {
            "linux" => Some(OsType::Linux),
            "macos" => Some(OsType::Mac),
            "windows" => Some(OsType::Windows),
            _ => None,
        }
    }

    /// Name used in helper file names.
    pub fn as_str(self) -> &'static str {
        match self {
            OsType::Linux => "linux",
            OsType::Mac => "darwin",
            OsType::Windows => "windows",
        }
    }
}

impl OsArch {
    /// Parse `uname -m` output.
    pub fn from_uname(output: &str) -> Option<Self> {
        match output.trim() {
            "x86_64" | "amd64" => Some(OsArch::Amd64),
            "aarch64" | "arm64" => Some(OsArch::Arm64),
            "i386" | "i686" | "x86" => Some(OsArch::X86),
            other if other.starts_with("arm") => Some(OsArch::Arm),
            _ => None,
        }
    }

    /// The architecture this process runs on.
    pub fn host() -> Option<Self> {
        match std::env::consts::ARCH {
            "x86_64" => Some(OsArch::Amd64),
            "aarch64" => Some(OsArch::Arm64),
            "x86" => Some(OsArch::X86),
            "arm" => Some(OsArch::Arm),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OsArch::Amd64 => "amd64",
            OsArch::Arm64 => "arm64",
            OsArch::X86 => "386",
            OsArch::Arm => "arm",
        }
    }
}

impl fmt::Display for OsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for OsArch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `<prefix>-<os>-<arch>`, plus `.exe` on Windows.
/// Reject roots no helper can be deployed for: empty or relative paths,
/// and hosts reached through anything but `ssh`.
pub fn check_remote_root(remote_root: &FilePath) -> BridgeResult<()> {
    if remote_root.is_empty() {
        return Err(BridgeError::Usage("Remote root path must not be empty".into()));
    }
    if !remote_root.is_absolute_path() {
        return Err(BridgeError::Usage(format!(
            "Remote root path must be absolute: {remote_root}"
        )));
    }
    match remote_root.host() {
        Some(host) if host.scheme != "ssh" => Err(BridgeError::Usage(format!(
            "Cannot deploy a helper over '{}': {remote_root}",
            host.scheme
        ))),
        _ => Ok(()),
    }
}

pub fn helper_file_name(prefix: &str, os: OsType, arch: OsArch) -> String {
    let suffix = if os == OsType::Windows { ".exe" } else { "" };
    format!("{prefix}-{os}-{arch}{suffix}")
}

// ---------------------------------------------------------------------------
// Deployer
// ---------------------------------------------------------------------------

/// Where the helper to start lives, and whether it should delete itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployedHelper {
    pub path: String,
    pub delete_on_exit: bool,
}

pub struct Deployer {
    helper_prefix: String,
    temp_template: String,
}

impl Deployer {
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            helper_prefix: config.helper_prefix.clone(),
            temp_template: config.temp_template(),
        }
    }

    /// Make a helper available for `remote_root`, staging one through
    /// `runner` when the root is on another host.
    pub async fn deploy(
        &self,
        runner: &dyn CommandRunner,
        lib_exec_dir: &Path,
        remote_root: &FilePath,
    ) -> BridgeResult<DeployedHelper> {
        check_remote_root(remote_root)?;

        if remote_root.is_local() {
            return self.local_helper(lib_exec_dir);
        }

        tracing::info!(runner = %runner.description(), root = %remote_root, "deploying helper");

        let dd = runner.run_shell("command -v dd").await;
        if !dd.as_ref().is_ok_and(|r| r.success()) {
            return Err(BridgeError::Deploy("Could not find dd on remote host".into()));
        }

        let os = self.probe(runner, "-s", "OS type", OsType::from_uname).await?;
        let arch = self.probe(runner, "-m", "architecture", OsArch::from_uname).await?;
        tracing::debug!(%os, %arch, "detected remote platform");

        let local_helper = self.helper_in(lib_exec_dir, os, arch)?;
        let staged = self.stage(runner, &local_helper).await?;
        tracing::info!(helper = %staged, "helper deployed");

        Ok(DeployedHelper {
            path: staged,
            delete_on_exit: true,
        })
    }

    fn local_helper(&self, lib_exec_dir: &Path) -> BridgeResult<DeployedHelper> {
        let (Some(os), Some(arch)) = (OsType::host(), OsArch::host()) else {
            return Err(BridgeError::Deploy(format!(
                "No helper available for this host ({}/{})",
                std::env::consts::OS,
                std::env::consts::ARCH
            )));
        };
        let helper = self.helper_in(lib_exec_dir, os, arch)?;
        tracing::debug!(helper = %helper.display(), "using local helper");
        Ok(DeployedHelper {
            path: helper.to_string_lossy().into_owned(),
            delete_on_exit: false,
        })
    }

    fn helper_in(&self, lib_exec_dir: &Path, os: OsType, arch: OsArch) -> BridgeResult<PathBuf> {
        let helper = lib_exec_dir.join(helper_file_name(&self.helper_prefix, os, arch));
        if !helper.is_file() {
            return Err(BridgeError::Deploy(format!(
                "Could not find helper for {os}/{arch}: {} does not exist",
                helper.display()
            )));
        }
        Ok(helper)
    }

    async fn probe<T>(
        &self,
        runner: &dyn CommandRunner,
        flag: &str,
        what: &str,
        parse: fn(&str) -> Option<T>,
    ) -> BridgeResult<T> {
        let output = runner
            .run("uname", &[flag])
            .await
            .map_err(|e| e.context(format!("Could not determine {what} of remote host")))?;
        if !output.success() {
            return Err(BridgeError::Deploy(format!(
                "Could not determine {what} of remote host: {}",
                output.merged_output()
            )));
        }
        let text = output.stdout_text();
        parse(&text).ok_or_else(|| {
            BridgeError::Deploy(format!("Unsupported {what} on remote host: '{text}'"))
        })
    }

    /// Copy `local_helper` into a fresh remote temp file and make it
    /// executable.  Returns the remote path.
    async fn stage(&self, runner: &dyn CommandRunner, local_helper: &Path) -> BridgeResult<String> {
        let mktemp = runner.run("mktemp", &["-t", &self.temp_template]).await?;
        let target = mktemp.stdout_text();
        if !mktemp.success() || target.is_empty() {
            return Err(BridgeError::Deploy(format!(
                "Could not create temporary file on remote host: {}",
                mktemp.merged_output()
            )));
        }

        let bytes = tokio::fs::read(local_helper).await.map_err(|e| {
            BridgeError::Deploy(format!(
                "Could not read helper {}: {e}",
                local_helper.display()
            ))
        })?;

        let of = format!("of={target}");
        let copied = runner.run_with_stdin("dd", &[&of], &bytes).await?;
        if !copied.success() {
            return Err(BridgeError::Deploy(format!(
                "Could not copy helper to {target}: {}",
                copied.merged_output()
            )));
        }
        tracing::debug!(target = %target, bytes = bytes.len(), "helper copied");

        let chmod = runner.run("chmod", &["+x", &target]).await?;
        if !chmod.success() {
            return Err(BridgeError::Deploy(format!(
                "Could not make {target} executable: {}",
                chmod.merged_output()
            )));
        }

        Ok(target)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{ExecResult, HelperIo};
    use crate::types::Environment;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::Mutex;

    /// Answers commands from a fixed table and records what it ran.
    struct ScriptedRunner {
        answers: Vec<(&'static str, i32, &'static str)>,
        ran: Mutex<Vec<String>>,
        piped: Mutex<Vec<u8>>,
    }

    impl ScriptedRunner {
        fn new(answers: Vec<(&'static str, i32, &'static str)>) -> Self {
            Self {
                answers,
                ran: Mutex::new(Vec::new()),
                piped: Mutex::new(Vec::new()),
            }
        }

        fn answer(&self, program: &str, args: &[&str]) -> BridgeResult<ExecResult> {
            let line = std::iter::once(program)
                .chain(args.iter().copied())
                .collect::<Vec<_>>()
                .join(" ");
            self.ran.lock().unwrap().push(line.clone());
            let (_, code, out) = self
                .answers
                .iter()
                .find(|(prefix, _, _)| line.starts_with(prefix))
                .copied()
                .unwrap_or(("", 127, ""));
            Ok(ExecResult {
                stdout: Bytes::from(format!("{out}\n")),
                stderr: Bytes::new(),
                exit_code: code,
            })
        }

        fn ran(&self) -> Vec<String> {
            self.ran.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, program: &str, args: &[&str]) -> BridgeResult<ExecResult> {
            self.answer(program, args)
        }

        async fn run_with_stdin(
            &self,
            program: &str,
            args: &[&str],
            stdin_data: &[u8],
        ) -> BridgeResult<ExecResult> {
            self.piped.lock().unwrap().extend_from_slice(stdin_data);
            self.answer(program, args)
        }

        async fn spawn_helper(
            &self,
            program: &str,
            _args: &[&str],
            _env: &Environment,
        ) -> BridgeResult<HelperIo> {
            Err(BridgeError::StartFailed {
                path: program.into(),
                reason: "not supported".into(),
            })
        }

        fn description(&self) -> String {
            "scripted".into()
        }
    }

    fn linux_remote() -> Vec<(&'static str, i32, &'static str)> {
        vec![
            ("sh -c command -v dd", 0, "/bin/dd"),
            ("uname -s", 0, "Linux"),
            ("uname -m", 0, "x86_64"),
            ("mktemp -t cmdbridge.XXXXXXXXXX", 0, "/tmp/cmdbridge.a1b2c3"),
            ("dd of=/tmp/cmdbridge.a1b2c3", 0, ""),
            ("chmod +x /tmp/cmdbridge.a1b2c3", 0, ""),
        ]
    }

    fn lib_exec_with(names: &[&str]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for name in names {
            std::fs::write(dir.path().join(name), b"\x7fELF helper").unwrap();
        }
        dir
    }

    fn remote_root() -> FilePath {
        FilePath::parse("/ssh:remote:/").unwrap()
    }

    #[test]
    fn uname_parsing() {
        assert_eq!(OsType::from_uname("Linux\n"), Some(OsType::Linux));
        assert_eq!(OsType::from_uname("Darwin"), Some(OsType::Mac));
        assert_eq!(
            OsType::from_uname("MINGW64_NT-10.0-19045"),
            Some(OsType::Windows)
        );
        assert_eq!(OsType::from_uname("Plan9"), None);

        assert_eq!(OsArch::from_uname("x86_64"), Some(OsArch::Amd64));
        assert_eq!(OsArch::from_uname("aarch64"), Some(OsArch::Arm64));
        assert_eq!(OsArch::from_uname("i686"), Some(OsArch::X86));
        assert_eq!(OsArch::from_uname("armv7l"), Some(OsArch::Arm));
        assert_eq!(OsArch::from_uname("riscv64"), None);
    }

    #[test]
    fn helper_names() {
        assert_eq!(
            helper_file_name("cmdbridge", OsType::Linux, OsArch::Amd64),
            "cmdbridge-linux-amd64"
        );
        assert_eq!(
            helper_file_name("cmdbridge", OsType::Windows, OsArch::X86),
            "cmdbridge-windows-386.exe"
        );
    }

    #[tokio::test]
    async fn stages_helper_on_remote() {
        let lib_exec = lib_exec_with(&["cmdbridge-linux-amd64"]);
        let runner = ScriptedRunner::new(linux_remote());
        let deployed = Deployer::new(&BridgeConfig::default())
            .deploy(&runner, lib_exec.path(), &remote_root())
            .await
            .unwrap();

        assert_eq!(deployed.path, "/tmp/cmdbridge.a1b2c3");
        assert!(deployed.delete_on_exit);
        assert_eq!(runner.piped.lock().unwrap().as_slice(), b"\x7fELF helper");
        let ran = runner.ran();
        assert_eq!(ran.last().unwrap(), "chmod +x /tmp/cmdbridge.a1b2c3");
    }

    #[tokio::test]
    async fn missing_dd_is_fatal() {
        let lib_exec = lib_exec_with(&["cmdbridge-linux-amd64"]);
        let mut answers = linux_remote();
        answers[0] = ("sh -c command -v dd", 1, "");
        let runner = ScriptedRunner::new(answers);
        let err = Deployer::new(&BridgeConfig::default())
            .deploy(&runner, lib_exec.path(), &remote_root())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Could not find dd on remote host"));
        assert_eq!(runner.ran().len(), 1);
    }

    #[tokio::test]
    async fn unknown_arch_is_fatal() {
        let lib_exec = lib_exec_with(&["cmdbridge-linux-amd64"]);
        let mut answers = linux_remote();
        answers[2] = ("uname -m", 0, "riscv64");
        let runner = ScriptedRunner::new(answers);
        let err = Deployer::new(&BridgeConfig::default())
            .deploy(&runner, lib_exec.path(), &remote_root())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("riscv64"));
        assert!(!runner.ran().iter().any(|c| c.starts_with("mktemp")));
    }

    #[tokio::test]
    async fn missing_helper_binary_is_fatal() {
        let lib_exec = lib_exec_with(&["cmdbridge-darwin-arm64"]);
        let runner = ScriptedRunner::new(linux_remote());
        let err = Deployer::new(&BridgeConfig::default())
            .deploy(&runner, lib_exec.path(), &remote_root())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cmdbridge-linux-amd64"));
    }

    #[tokio::test]
    async fn failed_copy_stops_before_chmod() {
        let lib_exec = lib_exec_with(&["cmdbridge-linux-amd64"]);
        let mut answers = linux_remote();
        answers[4] = ("dd of=/tmp/cmdbridge.a1b2c3", 1, "No space left on device");
        let runner = ScriptedRunner::new(answers);
        let err = Deployer::new(&BridgeConfig::default())
            .deploy(&runner, lib_exec.path(), &remote_root())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("No space left on device"));
        assert!(!runner.ran().iter().any(|c| c.starts_with("chmod")));
    }

    #[tokio::test]
    async fn relative_or_empty_root_is_a_usage_error() {
        let runner = ScriptedRunner::new(linux_remote());
        let deployer = Deployer::new(&BridgeConfig::default());

        let err = deployer
            .deploy(&runner, Path::new("/nonexistent"), &remote_root().with_new_path(""))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Usage(_)));

        let err = deployer
            .deploy(&runner, Path::new("/nonexistent"), &remote_root().with_new_path("tmp"))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Usage(_)));
        assert!(runner.ran().is_empty());
    }

    #[tokio::test]
    async fn non_ssh_scheme_is_a_usage_error() {
        let runner = ScriptedRunner::new(linux_remote());
        let root = FilePath::parse("/docker:builder:/").unwrap();
        let err = Deployer::new(&BridgeConfig::default())
            .deploy(&runner, Path::new("/nonexistent"), &root)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Usage(ref m) if m.contains("docker")));
        assert!(runner.ran().is_empty());
        assert!(check_remote_root(&remote_root()).is_ok());
    }

    #[tokio::test]
    async fn local_root_uses_host_helper_in_place() {
        let (Some(os), Some(arch)) = (OsType::host(), OsArch::host()) else {
            return;
        };
        let name = helper_file_name("cmdbridge", os, arch);
        let lib_exec = lib_exec_with(&[name.as_str()]);
        let runner = ScriptedRunner::new(Vec::new());
        let deployed = Deployer::new(&BridgeConfig::default())
            .deploy(&runner, lib_exec.path(), &FilePath::local("/"))
            .await
            .unwrap();
        assert!(!deployed.delete_on_exit);
        assert!(deployed.path.ends_with(&name));
        assert!(runner.ran().is_empty());
    }
}
