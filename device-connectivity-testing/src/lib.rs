//! Scripted executor for testing code built on the connectivity engine.
//!
//! Holds an in-memory sysfs/dev tree and a queue of canned subprocess
//! results per command line, and records every command and control-file
//! write so tests can assert on exactly what the engine did to the host.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use device_connectivity::{ConnectivityError, ControlFile, Executor, Result};
use glob::{MatchOptions, Pattern};

pub const SHOW_MAPS: &str = "multipathd show maps raw format %w,%d";
pub const RECONFIGURE: &str = "multipathd reconfigure";

#[derive(Debug, Clone)]
pub enum Reply {
    Stdout(String),
    Fail { exit_code: i32, stderr: String },
    Timeout,
}

impl Reply {
    pub fn ok(stdout: &str) -> Self {
        Reply::Stdout(stdout.to_string())
    }

    pub fn fail(exit_code: i32, stderr: &str) -> Self {
        Reply::Fail {
            exit_code,
            stderr: stderr.to_string(),
        }
    }
}

/// Subprocess window observed by the fake, for overlap checks.
#[derive(Debug, Clone)]
pub struct Window {
    pub command: String,
    pub start: Instant,
    pub end: Instant,
}

#[derive(Default)]
struct State {
    files: HashMap<PathBuf, Vec<u8>>,
    /// Paths that exist but are not readable as files (device nodes, dirs).
    nodes: HashSet<PathBuf>,
    unreadable: HashSet<PathBuf>,
    short_writes: HashSet<PathBuf>,
    missing_executables: HashSet<String>,
    replies: HashMap<String, VecDeque<Reply>>,
    delays: HashMap<String, Duration>,
    stalls: HashMap<PathBuf, Duration>,
    calls: Vec<String>,
    windows: Vec<Window>,
}

#[derive(Default)]
pub struct FakeExecutor {
    state: Mutex<State>,
    writes: Arc<Mutex<Vec<(PathBuf, String)>>>,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn add_file(&self, path: impl Into<PathBuf>, contents: &str) -> &Self {
        self.state()
            .files
            .insert(path.into(), contents.as_bytes().to_vec());
        self
    }

    /// Writable control file, initially empty.
    pub fn add_control_file(&self, path: impl Into<PathBuf>) -> &Self {
        self.add_file(path, "")
    }

    pub fn add_node(&self, path: impl Into<PathBuf>) -> &Self {
        self.state().nodes.insert(path.into());
        self
    }

    pub fn remove_node(&self, path: impl AsRef<Path>) {
        self.state().nodes.remove(path.as_ref());
    }

    pub fn make_unreadable(&self, path: impl Into<PathBuf>) -> &Self {
        self.state().unreadable.insert(path.into());
        self
    }

    pub fn short_write(&self, path: impl Into<PathBuf>) -> &Self {
        self.state().short_writes.insert(path.into());
        self
    }

    pub fn missing_executable(&self, name: &str) -> &Self {
        self.state().missing_executables.insert(name.to_string());
        self
    }

    /// Queue a reply for `command`; the last queued reply repeats forever.
    pub fn reply(&self, command: &str, reply: Reply) -> &Self {
        self.state()
            .replies
            .entry(command.to_string())
            .or_default()
            .push_back(reply);
        self
    }

    /// Make every invocation of the program `cmd` take `delay`.
    pub fn delay(&self, cmd: &str, delay: Duration) -> &Self {
        self.state().delays.insert(cmd.to_string(), delay);
        self
    }

    /// Make reads of `path` block the calling thread for `duration`, like a
    /// sysfs attribute whose driver is wedged.
    pub fn stall(&self, path: impl Into<PathBuf>, duration: Duration) -> &Self {
        self.state().stalls.insert(path.into(), duration);
        self
    }

    // --- iSCSI / FC / multipath fixtures -----------------------------------

    pub fn add_scsi_host(&self, host: u32) -> &Self {
        self.add_control_file(format!("/sys/class/scsi_host/host{}/scan", host))
    }

    pub fn add_iscsi_session(&self, host: u32, session: u32, target: &str) -> &Self {
        self.add_scsi_host(host);
        self.add_file(
            format!(
                "/sys/class/iscsi_host/host{h}/device/session{s}/iscsi_session/session{s}/targetname",
                h = host,
                s = session
            ),
            &format!("{}\n", target),
        )
    }

    pub fn add_fc_host(&self, host: u32, port_state: &str) -> &Self {
        self.add_scsi_host(host);
        self.add_file(
            format!("/sys/class/fc_host/host{}/port_state", host),
            &format!("{}\n", port_state),
        )
    }

    pub fn add_fc_rport(&self, host: u32, rport: u32, port_name: &str) -> &Self {
        self.add_file(
            format!(
                "/sys/class/fc_remote_ports/rport-{}:0-{}/port_name",
                host, rport
            ),
            &format!("{}\n", port_name),
        )
    }

    /// A dm device node plus its slaves and their delete control files.
    pub fn add_dm(&self, dm: &str, slaves: &[&str]) -> &Self {
        self.add_node(format!("/dev/{}", dm));
        for slave in slaves {
            self.add_node(format!("/sys/block/{}/slaves/{}", dm, slave));
            self.add_control_file(format!("/sys/block/{}/device/delete", slave));
        }
        self
    }

    // --- Observations ------------------------------------------------------

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn count_calls(&self, prefix: &str) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub fn writes(&self) -> Vec<(PathBuf, String)> {
        self.writes.lock().unwrap().clone()
    }

    pub fn writes_to(&self, path: &str) -> Vec<String> {
        self.writes()
            .into_iter()
            .filter(|(p, _)| p == Path::new(path))
            .map(|(_, s)| s)
            .collect()
    }

    pub fn windows(&self, cmd: &str) -> Vec<Window> {
        self.state()
            .windows
            .iter()
            .filter(|w| w.command.starts_with(cmd))
            .cloned()
            .collect()
    }

    /// Highest number of subprocesses observed running at once.
    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    fn next_reply(&self, command: &str) -> Option<Reply> {
        let mut state = self.state();
        let queue = state.replies.get_mut(command)?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

fn not_found(path: &Path) -> ConnectivityError {
    ConnectivityError::Io(io::Error::new(
        io::ErrorKind::NotFound,
        format!("{}: no such file", path.display()),
    ))
}

struct RecordingWriter {
    path: PathBuf,
    short: bool,
    writes: Arc<Mutex<Vec<(PathBuf, String)>>>,
}

impl Write for RecordingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.short {
            return Ok(0);
        }
        self.writes.lock().unwrap().push((
            self.path.clone(),
            String::from_utf8_lossy(buf).into_owned(),
        ));
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[tonic::async_trait]
impl Executor for FakeExecutor {
    async fn execute_with_timeout(
        &self,
        timeout: Duration,
        cmd: &str,
        args: &[&str],
    ) -> Result<Vec<u8>> {
        let command = std::iter::once(cmd)
            .chain(args.iter().copied())
            .collect::<Vec<_>>()
            .join(" ");
        let delay = {
            let mut state = self.state();
            state.calls.push(command.clone());
            state.delays.get(cmd).copied()
        };

        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(running, Ordering::SeqCst);
        let start = Instant::now();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let end = Instant::now();
        self.running.fetch_sub(1, Ordering::SeqCst);
        self.state().windows.push(Window {
            command: command.clone(),
            start,
            end,
        });

        match self.next_reply(&command) {
            Some(Reply::Stdout(out)) => Ok(out.into_bytes()),
            Some(Reply::Fail { exit_code, stderr }) => Err(ConnectivityError::CommandFailed {
                command,
                exit_code: Some(exit_code),
                stderr,
            }),
            Some(Reply::Timeout) => Err(ConnectivityError::CommandTimeout { command, timeout }),
            None => Err(ConnectivityError::ExecutableNotFound(cmd.to_string())),
        }
    }

    fn filepath_glob(&self, pattern: &str) -> Result<Vec<PathBuf>> {
        let pattern = Pattern::new(pattern).map_err(|e| ConnectivityError::InvalidGlob {
            pattern: pattern.to_string(),
            message: e.to_string(),
        })?;
        let options = MatchOptions {
            require_literal_separator: true,
            ..MatchOptions::new()
        };
        let state = self.state();
        let mut matches: Vec<PathBuf> = state
            .files
            .keys()
            .chain(state.nodes.iter())
            .filter(|p| pattern.matches_path_with(p, options))
            .cloned()
            .collect();
        matches.sort();
        matches.dedup();
        Ok(matches)
    }

    fn read_symlink(&self, path: &Path) -> Result<PathBuf> {
        let state = self.state();
        let target = state.files.get(path).ok_or_else(|| not_found(path))?;
        Ok(PathBuf::from(String::from_utf8_lossy(target).trim()))
    }

    fn read_dir(&self, path: &Path) -> Result<Vec<String>> {
        let state = self.state();
        let mut names: Vec<String> = state
            .files
            .keys()
            .chain(state.nodes.iter())
            .filter(|p| p.parent() == Some(path))
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect();
        names.sort();
        Ok(names)
    }

    fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        let stall = self.state().stalls.get(path).copied();
        if let Some(duration) = stall {
            std::thread::sleep(duration);
        }
        let state = self.state();
        if state.unreadable.contains(path) {
            return Err(ConnectivityError::Io(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "permission denied",
            )));
        }
        state.files.get(path).cloned().ok_or_else(|| not_found(path))
    }

    fn open_file_write_append(&self, path: &Path, _mode: u32) -> Result<ControlFile> {
        let state = self.state();
        if !state.files.contains_key(path) {
            return Err(not_found(path));
        }
        Ok(Box::new(RecordingWriter {
            path: path.to_path_buf(),
            short: state.short_writes.contains(path),
            writes: Arc::clone(&self.writes),
        }))
    }

    fn path_exists(&self, path: &Path) -> bool {
        let state = self.state();
        state.files.contains_key(path) || state.nodes.contains(path)
    }

    fn is_executable(&self, name: &str) -> Result<()> {
        if self.state().missing_executables.contains(name) {
            return Err(ConnectivityError::ExecutableNotFound(name.to_string()));
        }
        Ok(())
    }
}
