//! Ownership and monitoring of external VPN client processes.
//!
//! The supervisor is the only component that holds OS process handles. It
//! keeps a table keyed by connection id; everyone else refers to a process
//! through an opaque [`ProcessHandle`]. Each launched process gets two
//! reader threads (stdout and stderr) that forward complete lines into a
//! channel, so reads can be done with a timeout without blocking the caller
//! on a silent client.

use std::collections::HashMap;
use std::ffi::OsString;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use secrecy::{ExposeSecret, SecretString};

use crate::constants;
use crate::error::{Result, VpnError};

/// Opaque reference to a supervised process.
///
/// The generation makes handles from earlier launches of the same
/// connection id stale, so they can never address a newer process.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ProcessHandle {
    id: String,
    generation: u64,
}

/// Which pipe a line was read from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub text: String,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    Line(OutputLine),
    /// Nothing arrived within the timeout.
    Timeout,
    /// Both output streams are closed.
    Eof,
}

/// How a process ended when asked to stop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Termination {
    /// It had already exited before the stop request.
    AlreadyExited,
    /// It exited within the grace period after the stop signal.
    Graceful,
    /// It was force-killed after the grace period.
    Forced,
    /// It was still alive after the force kill.
    Unresponsive,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessStatus {
    Running,
    Exited(Option<i32>),
}

/// Everything needed to start one client process.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: OsString,
    pub args: Vec<OsString>,
    /// Written to stdin right after spawn (the elevation password).
    pub stdin_secret: Option<SecretString>,
    /// The process runs with elevated privileges.
    pub elevated: bool,
}

/// A running child process as seen by the supervisor.
pub trait ChildProcess: Send {
    fn pid(&self) -> u32;
    fn take_stdin(&mut self) -> Option<Box<dyn Write + Send>>;
    fn take_stdout(&mut self) -> Option<Box<dyn Read + Send>>;
    fn take_stderr(&mut self) -> Option<Box<dyn Read + Send>>;
    /// Non-blocking exit check; reaps the process once it has exited.
    fn try_status(&mut self) -> io::Result<ProcessStatus>;
    /// Sends the graceful stop request.
    fn terminate(&mut self) -> io::Result<()>;
    /// Forcefully stops the process.
    fn kill(&mut self) -> io::Result<()>;
}

/// Creates child processes. The seam lets tests replace the OS.
pub trait ProcessBackend: Send + Sync {
    /// Spawns `spec` with all three standard streams piped.
    ///
    /// # Errors
    ///
    /// The OS spawn error.
    fn spawn(&self, spec: &LaunchSpec) -> io::Result<Box<dyn ChildProcess>>;

    /// Stops every process whose name is exactly `process_name`.
    ///
    /// # Errors
    ///
    /// Failure to run the kill tool, or a kill tool failure other than
    /// "nothing matched".
    fn kill_all_by_name(&self, process_name: &str, secret: Option<&SecretString>) -> io::Result<()>;
}

struct Entry {
    handle: ProcessHandle,
    child: Mutex<Box<dyn ChildProcess>>,
    lines: Mutex<Receiver<OutputLine>>,
}

impl Entry {
    fn status(&self) -> ProcessStatus {
        let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        child.try_status().unwrap_or_else(|e| {
            log::warn!("PROC: status check failed for '{}': {e}", self.handle.id);
            ProcessStatus::Exited(None)
        })
    }
}

pub struct ProcessSupervisor {
    backend: Arc<dyn ProcessBackend>,
    table: Mutex<HashMap<String, Arc<Entry>>>,
    next_generation: AtomicU64,
}

impl ProcessSupervisor {
    pub fn new(backend: Arc<dyn ProcessBackend>) -> Self {
        Self {
            backend,
            table: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Supervisor backed by real OS processes.
    #[must_use]
    pub fn with_os_backend() -> Self {
        Self::new(Arc::new(OsBackend))
    }

    fn table(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Entry>>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn entry(&self, handle: &ProcessHandle) -> Option<Arc<Entry>> {
        self.table()
            .get(&handle.id)
            .filter(|e| e.handle == *handle)
            .cloned()
    }

    /// Starts the client for `id`, hands it the elevation secret on stdin,
    /// and begins collecting its output.
    ///
    /// # Errors
    ///
    /// [`VpnError::AlreadyConnected`] when a live process is tracked for
    /// `id`; [`VpnError::Spawn`] when the OS refuses to start it.
    pub fn launch(&self, id: &str, spec: &LaunchSpec) -> Result<ProcessHandle> {
        self.reap_if_exited(id)?;

        let mut child = self
            .backend
            .spawn(spec)
            .map_err(|source| VpnError::Spawn { source })?;
        let pid = child.pid();
        log::info!(
            "PROC: started '{}' for '{id}' (pid {pid}{})",
            spec.program.to_string_lossy(),
            if spec.elevated { ", elevated" } else { "" }
        );

        if let Some(mut stdin) = child.take_stdin() {
            if let Some(secret) = &spec.stdin_secret {
                let mut hand_over = || -> io::Result<()> {
                    stdin.write_all(secret.expose_secret().as_bytes())?;
                    stdin.write_all(b"\n")?;
                    stdin.flush()
                };
                if let Err(e) = hand_over() {
                    log::warn!("PROC: could not hand the elevation secret to pid {pid}: {e}");
                }
            }
            // Dropping closes the pipe so nothing else can be read from it.
        }

        let (tx, rx) = mpsc::channel();
        if let Some(stdout) = child.take_stdout() {
            spawn_reader(id, OutputStream::Stdout, stdout, tx.clone());
        }
        if let Some(stderr) = child.take_stderr() {
            spawn_reader(id, OutputStream::Stderr, stderr, tx);
        }

        let handle = ProcessHandle {
            id: id.to_string(),
            generation: self.next_generation.fetch_add(1, Ordering::Relaxed),
        };
        let entry = Arc::new(Entry {
            handle: handle.clone(),
            child: Mutex::new(child),
            lines: Mutex::new(rx),
        });

        let mut table = self.table();
        if table.contains_key(id) {
            // Lost a race with another launch for the same id.
            drop(table);
            stop_entry(&entry, constants::DEFAULT_GRACE_TIMEOUT);
            return Err(VpnError::AlreadyConnected(id.to_string()));
        }
        table.insert(id.to_string(), entry);
        Ok(handle)
    }

    /// Drops a tracked entry whose process has already exited; fails if it
    /// is still running.
    fn reap_if_exited(&self, id: &str) -> Result<()> {
        let existing = self.table().get(id).cloned();
        if let Some(entry) = existing {
            if entry.status() == ProcessStatus::Running {
                return Err(VpnError::AlreadyConnected(id.to_string()));
            }
            let mut table = self.table();
            if table.get(id).is_some_and(|e| Arc::ptr_eq(e, &entry)) {
                table.remove(id);
            }
        }
        Ok(())
    }

    /// Waits up to `timeout` for the next line from either output stream.
    ///
    /// Intended for the per-connection monitor thread; other callers are
    /// never blocked by it.
    ///
    /// # Errors
    ///
    /// [`VpnError::NotTracked`] if the handle is stale.
    pub fn read_line(&self, handle: &ProcessHandle, timeout: Duration) -> Result<ReadOutcome> {
        let entry = self
            .entry(handle)
            .ok_or_else(|| VpnError::NotTracked(handle.id.clone()))?;
        let rx = entry.lines.lock().unwrap_or_else(PoisonError::into_inner);
        match rx.recv_timeout(timeout) {
            Ok(line) => Ok(ReadOutcome::Line(line)),
            Err(RecvTimeoutError::Timeout) => Ok(ReadOutcome::Timeout),
            Err(RecvTimeoutError::Disconnected) => Ok(ReadOutcome::Eof),
        }
    }

    /// True while the process behind `handle` is tracked and running.
    #[must_use]
    pub fn is_alive(&self, handle: &ProcessHandle) -> bool {
        self.entry(handle)
            .is_some_and(|e| e.status() == ProcessStatus::Running)
    }

    /// Whether any process is tracked for `id`.
    #[must_use]
    pub fn is_tracked(&self, id: &str) -> bool {
        self.table().contains_key(id)
    }

    #[must_use]
    pub fn tracked_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.table().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Stops the process: graceful signal, then force kill after `grace`.
    ///
    /// The entry is removed from the table first, so the handle is dead
    /// after this call on every path.
    ///
    /// # Errors
    ///
    /// [`VpnError::NotTracked`] if the handle is stale.
    pub fn terminate(&self, handle: &ProcessHandle, grace: Duration) -> Result<Termination> {
        let entry = {
            let mut table = self.table();
            let current = table.get(&handle.id).is_some_and(|e| e.handle == *handle);
            if current {
                table.remove(&handle.id)
            } else {
                None
            }
        }
        .ok_or_else(|| VpnError::NotTracked(handle.id.clone()))?;

        Ok(stop_entry(&entry, grace))
    }

    /// Stops every process named `process_name`, elevated through the
    /// secret when one is given.
    ///
    /// This is a blunt fallback: it also hits client processes this
    /// supervisor did not launch (other sessions, manual runs).
    ///
    /// # Errors
    ///
    /// [`VpnError::Spawn`] if the kill tool could not be run or failed.
    pub fn kill_all_by_name(&self, process_name: &str, secret: Option<&SecretString>) -> Result<()> {
        log::warn!("PROC: killing every process named '{process_name}'");
        self.backend
            .kill_all_by_name(process_name, secret)
            .map_err(|source| VpnError::Spawn { source })
    }

    /// Stops everything still tracked.
    pub fn shutdown(&self, grace: Duration) {
        let entries: Vec<_> = self.table().drain().map(|(_, e)| e).collect();
        for entry in entries {
            stop_entry(&entry, grace);
        }
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        self.shutdown(constants::DEFAULT_GRACE_TIMEOUT);
    }
}

fn stop_entry(entry: &Entry, grace: Duration) -> Termination {
    let id = &entry.handle.id;
    let mut child = entry.child.lock().unwrap_or_else(PoisonError::into_inner);

    if matches!(child.try_status(), Ok(ProcessStatus::Exited(_))) {
        log::debug!("PROC: '{id}' had already exited");
        return Termination::AlreadyExited;
    }

    if let Err(e) = child.terminate() {
        log::warn!("PROC: stop signal to '{id}' failed: {e}");
    }
    if wait_for_exit(&mut **child, grace) {
        log::info!("PROC: '{id}' stopped");
        return Termination::Graceful;
    }

    log::warn!("PROC: '{id}' ignored the stop signal for {grace:?}, force killing");
    if let Err(e) = child.kill() {
        log::warn!("PROC: force kill of '{id}' failed: {e}");
    }
    if wait_for_exit(&mut **child, grace) {
        Termination::Forced
    } else {
        log::warn!("PROC: '{id}' (pid {}) survived a force kill", child.pid());
        Termination::Unresponsive
    }
}

fn wait_for_exit(child: &mut dyn ChildProcess, limit: Duration) -> bool {
    let start = Instant::now();
    loop {
        match child.try_status() {
            Ok(ProcessStatus::Exited(_)) | Err(_) => return true,
            Ok(ProcessStatus::Running) => {}
        }
        if start.elapsed() >= limit {
            return false;
        }
        thread::sleep(constants::EXIT_POLL_INTERVAL.min(limit));
    }
}

fn spawn_reader(id: &str, stream: OutputStream, source: Box<dyn Read + Send>, tx: Sender<OutputLine>) {
    let name = format!("vpn-{}-{id}", if stream == OutputStream::Stdout { "out" } else { "err" });
    let id = id.to_string();
    let spawned = thread::Builder::new().name(name).spawn(move || {
        let mut reader = BufReader::new(source);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match read_capped_line(&mut reader, &mut buf, constants::MAX_OUTPUT_LINE_BYTES) {
                Ok(0) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&buf).trim_end().to_string();
                    log::debug!("VPN[{id}] {text}");
                    if tx.send(OutputLine { stream, text }).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    log::debug!("PROC: {stream:?} reader for '{id}' stopped: {e}");
                    break;
                }
            }
        }
    });
    if let Err(e) = spawned {
        log::warn!("PROC: could not start output reader: {e}");
    }
}

/// Reads one line into `buf`, keeping at most `cap` bytes of it. The rest
/// of a longer line is consumed and dropped. Returns 0 at end of input.
fn read_capped_line<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>, cap: usize) -> io::Result<usize> {
    let limit = u64::try_from(cap).unwrap_or(u64::MAX);
    let read = reader.by_ref().take(limit).read_until(b'\n', buf)?;
    if read < cap || buf.last() == Some(&b'\n') {
        return Ok(read);
    }
    loop {
        let available = reader.fill_buf()?;
        if available.is_empty() {
            break;
        }
        match available.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                reader.consume(pos + 1);
                break;
            }
            None => {
                let n = available.len();
                reader.consume(n);
            }
        }
    }
    Ok(read)
}

/// Real processes via `std::process`.
pub struct OsBackend;

impl ProcessBackend for OsBackend {
    fn spawn(&self, spec: &LaunchSpec) -> io::Result<Box<dyn ChildProcess>> {
        let child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        Ok(Box::new(OsChild {
            child,
            elevation: spec
                .elevated
                .then(|| spec.stdin_secret.clone())
                .flatten(),
            status: None,
        }))
    }

    fn kill_all_by_name(&self, process_name: &str, secret: Option<&SecretString>) -> io::Result<()> {
        let args = ["-TERM", "-x", process_name];
        let status = match secret {
            Some(secret) => run_elevated(constants::PKILL_BINARY, &args, secret)?,
            None => Command::new(constants::PKILL_BINARY)
                .args(args)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()?,
        };
        pkill_outcome(status.code(), process_name, || is_running(process_name))
    }
}

/// Interprets the pkill exit code. Code 1 means either nothing matched or
/// no match could be signalled, so survivors decide which.
fn pkill_outcome(
    code: Option<i32>,
    process_name: &str,
    still_running: impl FnOnce() -> bool,
) -> io::Result<()> {
    match code {
        Some(0) => Ok(()),
        Some(1) => {
            if still_running() {
                Err(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    format!("'{process_name}' is still running and could not be signalled"),
                ))
            } else {
                Ok(())
            }
        }
        code => Err(io::Error::new(
            io::ErrorKind::Other,
            format!("{} exited with {code:?}", constants::PKILL_BINARY),
        )),
    }
}

fn is_running(process_name: &str) -> bool {
    Command::new(constants::PGREP_BINARY)
        .args(["-x", process_name])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok_and(|status| status.success())
}

struct OsChild {
    child: Child,
    /// Secret for re-issuing signals through sudo when the child runs as root.
    elevation: Option<SecretString>,
    status: Option<ProcessStatus>,
}

impl OsChild {
    #[cfg(unix)]
    #[allow(unsafe_code, clippy::cast_possible_wrap)]
    fn signal(&mut self, signal: libc::c_int, flag: &str) -> io::Result<()> {
        let pid = self.child.id() as libc::pid_t;
        // SAFETY: kill(2) has no memory-safety preconditions.
        let rc = unsafe { libc::kill(pid, signal) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::ESRCH) => Ok(()),
            Some(libc::EPERM) => {
                let Some(secret) = &self.elevation else {
                    return Err(err);
                };
                let pid = pid.to_string();
                if signal == libc::SIGKILL {
                    // sudo does not relay SIGKILL; take its children down first.
                    let _ = run_elevated(constants::PKILL_BINARY, &[flag, "-P", pid.as_str()], secret);
                }
                let status = run_elevated("kill", &[flag, pid.as_str()], secret)?;
                if status.success() {
                    Ok(())
                } else {
                    Err(io::Error::new(
                        io::ErrorKind::PermissionDenied,
                        format!("elevated kill {flag} {pid} failed"),
                    ))
                }
            }
            _ => Err(err),
        }
    }
}

impl ChildProcess for OsChild {
    fn pid(&self) -> u32 {
        self.child.id()
    }

    fn take_stdin(&mut self) -> Option<Box<dyn Write + Send>> {
        self.child
            .stdin
            .take()
            .map(|s| Box::new(s) as Box<dyn Write + Send>)
    }

    fn take_stdout(&mut self) -> Option<Box<dyn Read + Send>> {
        self.child
            .stdout
            .take()
            .map(|s| Box::new(s) as Box<dyn Read + Send>)
    }

    fn take_stderr(&mut self) -> Option<Box<dyn Read + Send>> {
        self.child
            .stderr
            .take()
            .map(|s| Box::new(s) as Box<dyn Read + Send>)
    }

    fn try_status(&mut self) -> io::Result<ProcessStatus> {
        if let Some(status) = self.status {
            return Ok(status);
        }
        match self.child.try_wait()? {
            Some(exit) => {
                let status = ProcessStatus::Exited(exit.code());
                self.status = Some(status);
                Ok(status)
            }
            None => Ok(ProcessStatus::Running),
        }
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> io::Result<()> {
        self.signal(libc::SIGTERM, "-TERM")
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> io::Result<()> {
        self.child.kill()
    }

    #[cfg(unix)]
    fn kill(&mut self) -> io::Result<()> {
        self.signal(libc::SIGKILL, "-KILL")
    }

    #[cfg(not(unix))]
    fn kill(&mut self) -> io::Result<()> {
        self.child.kill()
    }
}

/// Runs `program args` through `sudo -S`, feeding the secret on stdin.
fn run_elevated(program: &str, args: &[&str], secret: &SecretString) -> io::Result<std::process::ExitStatus> {
    let mut child = Command::new(constants::SUDO_BINARY)
        .args(["-S", "-p", "", program])
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;
    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(secret.expose_secret().as_bytes())?;
        stdin.write_all(b"\n")?;
    }
    child.wait()
}
