//! OS access for the connectivity engine.
//!
//! Every subprocess, glob, sysfs read and sysfs write goes through the
//! [`Executor`] trait so the rest of the crate can be driven by a scripted
//! fake in tests. [`SystemExecutor`] is the real implementation and
//! [`LimitedExecutor`] caps the number of subprocesses in flight.
//!
//! Filesystem methods are blocking. The engine calls them from the blocking
//! pool under its sysfs deadline (see [`crate::ScsiGenericHelper::glob`]).

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::error::{ConnectivityError, Result};
use crate::metrics;

/// A writable handle on a sysfs control file.
pub type ControlFile = Box<dyn Write + Send>;

#[tonic::async_trait]
pub trait Executor: Send + Sync {
    /// Run `cmd args...` and return its stdout.
    ///
    /// On deadline expiry the whole process group is killed and
    /// [`ConnectivityError::CommandTimeout`] is returned; partial output is
    /// discarded. A non-zero exit status is [`ConnectivityError::CommandFailed`].
    async fn execute_with_timeout(
        &self,
        timeout: Duration,
        cmd: &str,
        args: &[&str],
    ) -> Result<Vec<u8>>;

    /// Shell-style glob over the local filesystem, sorted.
    fn filepath_glob(&self, pattern: &str) -> Result<Vec<PathBuf>>;

    /// Read a single symlink without following chains.
    fn read_symlink(&self, path: &Path) -> Result<PathBuf>;

    /// Entry names of a directory.
    fn read_dir(&self, path: &Path) -> Result<Vec<String>>;

    fn read_file(&self, path: &Path) -> Result<Vec<u8>>;

    /// Open an existing file for append-only writes.
    fn open_file_write_append(&self, path: &Path, mode: u32) -> Result<ControlFile>;

    /// Issue a single write of `s` and report how many bytes were accepted.
    fn write_string(&self, handle: &mut dyn Write, s: &str) -> Result<usize> {
        let n = handle.write(s.as_bytes())?;
        handle.flush()?;
        Ok(n)
    }

    fn path_exists(&self, path: &Path) -> bool;

    /// Resolve `name` on `PATH` (or directly, if it contains a slash).
    fn is_executable(&self, name: &str) -> Result<()>;

    /// Exit code carried by a failed command, if any.
    fn exit_code(&self, err: &ConnectivityError) -> Option<i32> {
        match err {
            ConnectivityError::CommandFailed { exit_code, .. } => *exit_code,
            _ => None,
        }
    }
}

/// Render `cmd args...` for logs and error messages.
pub(crate) fn command_line(cmd: &str, args: &[&str]) -> String {
    std::iter::once(cmd)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ")
}

// ============================================================================
// SystemExecutor
// ============================================================================

/// Executor backed by the real host.
#[derive(Debug, Default, Clone)]
pub struct SystemExecutor;

impl SystemExecutor {
    pub fn new() -> Self {
        Self
    }
}

fn kill_process_group(pid: u32, command: &str) {
    // Children are spawned as their own group leader, so pgid == pid.
    match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) => debug!(pid, command = %command, "Killed timed out process group"),
        Err(nix::errno::Errno::ESRCH) => {}
        Err(e) => warn!(pid, command = %command, error = %e, "Failed to kill process group"),
    }
}

fn is_executable_file(path: &Path) -> bool {
    fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[tonic::async_trait]
impl Executor for SystemExecutor {
    async fn execute_with_timeout(
        &self,
        timeout: Duration,
        cmd: &str,
        args: &[&str],
    ) -> Result<Vec<u8>> {
        let command = command_line(cmd, args);
        debug!(command = %command, timeout_ms = timeout.as_millis() as u64, "Executing command");

        let child = Command::new(cmd)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == io::ErrorKind::NotFound {
                    ConnectivityError::ExecutableNotFound(cmd.to_string())
                } else {
                    ConnectivityError::Io(e)
                }
            })?;
        let pid = child.id();
        let start = Instant::now();

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                debug!(
                    command = %command,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    status = %output.status,
                    "Command finished"
                );
                if output.status.success() {
                    Ok(output.stdout)
                } else {
                    Err(ConnectivityError::CommandFailed {
                        command,
                        exit_code: output.status.code(),
                        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                    })
                }
            }
            Ok(Err(e)) => Err(ConnectivityError::Io(e)),
            Err(_) => {
                // Dropping the wait future already killed the leader.
                if let Some(pid) = pid {
                    kill_process_group(pid, &command);
                }
                warn!(command = %command, timeout_ms = timeout.as_millis() as u64, "Command timed out");
                Err(ConnectivityError::CommandTimeout { command, timeout })
            }
        }
    }

    fn filepath_glob(&self, pattern: &str) -> Result<Vec<PathBuf>> {
        let entries = glob::glob(pattern).map_err(|e| ConnectivityError::InvalidGlob {
            pattern: pattern.to_string(),
            message: e.to_string(),
        })?;

        let mut paths = Vec::new();
        for entry in entries {
            match entry {
                Ok(path) => paths.push(path),
                Err(e) => debug!(pattern = %pattern, error = %e, "Skipping unreadable glob entry"),
            }
        }
        Ok(paths)
    }

    fn read_symlink(&self, path: &Path) -> Result<PathBuf> {
        Ok(fs::read_link(path)?)
    }

    fn read_dir(&self, path: &Path) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(path)? {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        Ok(fs::read(path)?)
    }

    fn open_file_write_append(&self, path: &Path, mode: u32) -> Result<ControlFile> {
        let file = OpenOptions::new().append(true).mode(mode).open(path)?;
        Ok(Box::new(file))
    }

    fn path_exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn is_executable(&self, name: &str) -> Result<()> {
        if name.contains('/') {
            return if is_executable_file(Path::new(name)) {
                Ok(())
            } else {
                Err(ConnectivityError::ExecutableNotFound(name.to_string()))
            };
        }

        let path = std::env::var_os("PATH").unwrap_or_default();
        if std::env::split_paths(&path).any(|dir| is_executable_file(&dir.join(name))) {
            Ok(())
        } else {
            Err(ConnectivityError::ExecutableNotFound(name.to_string()))
        }
    }
}

// ============================================================================
// LimitedExecutor
// ============================================================================

/// Wraps an executor with a fixed-capacity semaphore around subprocesses.
///
/// Caps the load put on multipath tooling when many volumes are staged at
/// once. Filesystem calls are not limited.
pub struct LimitedExecutor {
    inner: Arc<dyn Executor>,
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl LimitedExecutor {
    pub fn new(inner: Arc<dyn Executor>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner,
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Number of subprocesses currently running through this executor.
    pub fn in_flight(&self) -> usize {
        self.capacity - self.permits.available_permits()
    }
}

#[tonic::async_trait]
impl Executor for LimitedExecutor {
    async fn execute_with_timeout(
        &self,
        timeout: Duration,
        cmd: &str,
        args: &[&str],
    ) -> Result<Vec<u8>> {
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ConnectivityError::Io(io::Error::other("executor semaphore closed")))?;
        metrics::set_commands_in_flight(self.in_flight());
        let result = self.inner.execute_with_timeout(timeout, cmd, args).await;
        drop(permit);
        metrics::set_commands_in_flight(self.in_flight());
        result
    }

    fn filepath_glob(&self, pattern: &str) -> Result<Vec<PathBuf>> {
        self.inner.filepath_glob(pattern)
    }

    fn read_symlink(&self, path: &Path) -> Result<PathBuf> {
        self.inner.read_symlink(path)
    }

    fn read_dir(&self, path: &Path) -> Result<Vec<String>> {
        self.inner.read_dir(path)
    }

    fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        self.inner.read_file(path)
    }

    fn open_file_write_append(&self, path: &Path, mode: u32) -> Result<ControlFile> {
        self.inner.open_file_write_append(path, mode)
    }

    fn write_string(&self, handle: &mut dyn Write, s: &str) -> Result<usize> {
        self.inner.write_string(handle, s)
    }

    fn path_exists(&self, path: &Path) -> bool {
        self.inner.path_exists(path)
    }

    fn is_executable(&self, name: &str) -> Result<()> {
        self.inner.is_executable(name)
    }

    fn exit_code(&self, err: &ConnectivityError) -> Option<i32> {
        self.inner.exit_code(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_execute_returns_stdout() {
        let exec = SystemExecutor::new();
        let out = exec
            .execute_with_timeout(Duration::from_secs(5), "sh", &["-c", "echo hello"])
            .await
            .unwrap();
        assert_eq!(out, b"hello\n");
    }

    #[tokio::test]
    async fn test_execute_reports_exit_code() {
        let exec = SystemExecutor::new();
        let err = exec
            .execute_with_timeout(Duration::from_secs(5), "sh", &["-c", "echo oops >&2; exit 3"])
            .await
            .unwrap_err();
        assert_eq!(exec.exit_code(&err), Some(3));
        match err {
            ConnectivityError::CommandFailed { stderr, .. } => assert_eq!(stderr, "oops"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_execute_times_out() {
        let exec = SystemExecutor::new();
        let start = Instant::now();
        let err = exec
            .execute_with_timeout(Duration::from_millis(100), "sleep", &["5"])
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectivityError::CommandTimeout { .. }));
        assert!(start.elapsed() < Duration::from_secs(3));
        assert_eq!(exec.exit_code(&err), None);
    }

    #[tokio::test]
    async fn test_execute_missing_binary() {
        let exec = SystemExecutor::new();
        let err = exec
            .execute_with_timeout(Duration::from_secs(1), "no-such-binary-for-tests", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectivityError::ExecutableNotFound(_)));
    }

    #[test]
    fn test_is_executable() {
        let exec = SystemExecutor::new();
        assert!(exec.is_executable("sh").is_ok());
        assert!(exec.is_executable("no-such-binary-for-tests").is_err());
        assert!(exec.is_executable("/no/such/binary").is_err());
    }

    #[test]
    fn test_filesystem_operations() {
        let dir = tempfile::tempdir().unwrap();
        let host1 = dir.path().join("host1");
        let host2 = dir.path().join("host2");
        fs::create_dir_all(&host1).unwrap();
        fs::create_dir_all(&host2).unwrap();
        fs::write(host1.join("port_state"), "Online\n").unwrap();
        fs::write(host2.join("port_state"), "Offline\n").unwrap();

        let exec = SystemExecutor::new();
        let pattern = format!("{}/host*/port_state", dir.path().display());
        let paths = exec.filepath_glob(&pattern).unwrap();
        assert_eq!(paths, vec![host1.join("port_state"), host2.join("port_state")]);

        assert_eq!(exec.read_file(&paths[0]).unwrap(), b"Online\n");
        assert_eq!(exec.read_dir(dir.path()).unwrap(), vec!["host1", "host2"]);
        assert!(exec.path_exists(&host1));
        assert!(!exec.path_exists(&dir.path().join("host3")));

        let link = dir.path().join("link");
        std::os::unix::fs::symlink(&host1, &link).unwrap();
        assert_eq!(exec.read_symlink(&link).unwrap(), host1);
    }

    #[test]
    fn test_invalid_glob() {
        let exec = SystemExecutor::new();
        let err = exec.filepath_glob("/sys/[").unwrap_err();
        assert!(matches!(err, ConnectivityError::InvalidGlob { .. }));
    }

    #[test]
    fn test_append_write() {
        let dir = tempfile::tempdir().unwrap();
        let scan = dir.path().join("scan");
        fs::write(&scan, "").unwrap();

        let exec = SystemExecutor::new();
        let mut handle = exec.open_file_write_append(&scan, 0o200).unwrap();
        assert_eq!(exec.write_string(&mut handle, "0 0 1").unwrap(), 5);
        drop(handle);
        assert_eq!(fs::read_to_string(&scan).unwrap(), "0 0 1");

        // Append only: the control file must already exist.
        assert!(matches!(
            exec.open_file_write_append(&dir.path().join("missing"), 0o200),
            Err(ref e) if e.is_not_found()
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_limited_executor_serializes_commands() {
        let exec = Arc::new(LimitedExecutor::new(Arc::new(SystemExecutor::new()), 1));
        let start = Instant::now();

        let a = {
            let exec = exec.clone();
            tokio::spawn(async move {
                exec.execute_with_timeout(Duration::from_secs(5), "sleep", &["0.3"])
                    .await
            })
        };
        let b = {
            let exec = exec.clone();
            tokio::spawn(async move {
                exec.execute_with_timeout(Duration::from_secs(5), "sleep", &["0.3"])
                    .await
            })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        assert!(start.elapsed() >= Duration::from_millis(600));
        assert_eq!(exec.in_flight(), 0);
    }
}
