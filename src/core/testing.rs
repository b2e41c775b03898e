//! In-memory process backend for unit tests.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};

use secrecy::SecretString;

use super::supervisor::{ChildProcess, LaunchSpec, ProcessBackend, ProcessStatus};

/// What the next stub child does.
#[derive(Debug, Clone, Default)]
pub struct StubScript {
    stdout: Vec<String>,
    stderr: Vec<String>,
    exit: bool,
    ignore_terminate: bool,
    ignore_kill: bool,
}

impl StubScript {
    pub fn lines(lines: &[&str]) -> Self {
        Self {
            stdout: lines.iter().map(ToString::to_string).collect(),
            ..Self::default()
        }
    }

    pub fn with_stderr(mut self, lines: &[&str]) -> Self {
        self.stderr = lines.iter().map(ToString::to_string).collect();
        self
    }

    /// Exits (and closes its output) right after printing.
    pub fn exiting(mut self) -> Self {
        self.exit = true;
        self
    }

    /// Only a force kill stops it.
    pub fn ignoring_terminate(mut self) -> Self {
        self.ignore_terminate = true;
        self
    }

    /// Survives both the stop signal and the force kill.
    pub fn unkillable(mut self) -> Self {
        self.ignore_terminate = true;
        self.ignore_kill = true;
        self
    }
}

type Pipe = Arc<Mutex<Option<Sender<Vec<u8>>>>>;

#[derive(Default)]
struct Shared {
    scripts: Mutex<VecDeque<StubScript>>,
    specs: Mutex<Vec<LaunchSpec>>,
    stdin: Arc<Mutex<Vec<u8>>>,
    live_stdout: Mutex<Option<Pipe>>,
    kill_all_calls: Mutex<Vec<(String, bool)>>,
    fail_next_spawn: AtomicBool,
    spawns: AtomicUsize,
    terminates: Arc<AtomicUsize>,
    kills: Arc<AtomicUsize>,
}

#[derive(Default)]
pub struct StubBackend {
    shared: Shared,
}

impl StubBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_script(&self, script: StubScript) {
        self.shared.scripts.lock().unwrap().push_back(script);
    }

    pub fn fail_next_spawn(&self) {
        self.shared.fail_next_spawn.store(true, Ordering::SeqCst);
    }

    /// Writes a line to the stdout of the most recently spawned child.
    pub fn emit(&self, line: &str) {
        if let Some(pipe) = self.shared.live_stdout.lock().unwrap().as_ref() {
            if let Some(tx) = pipe.lock().unwrap().as_ref() {
                let _ = tx.send(format!("{line}\n").into_bytes());
            }
        }
    }

    pub fn spawn_count(&self) -> usize {
        self.shared.spawns.load(Ordering::SeqCst)
    }

    pub fn terminate_count(&self) -> usize {
        self.shared.terminates.load(Ordering::SeqCst)
    }

    pub fn kill_count(&self) -> usize {
        self.shared.kills.load(Ordering::SeqCst)
    }

    /// Process names passed to `kill_all_by_name`, with whether a secret
    /// came along.
    pub fn kill_all_calls(&self) -> Vec<(String, bool)> {
        self.shared.kill_all_calls.lock().unwrap().clone()
    }

    pub fn specs(&self) -> Vec<LaunchSpec> {
        self.shared.specs.lock().unwrap().clone()
    }

    pub fn stdin_text(&self) -> String {
        String::from_utf8_lossy(&self.shared.stdin.lock().unwrap()).into_owned()
    }
}

impl ProcessBackend for StubBackend {
    fn spawn(&self, spec: &LaunchSpec) -> io::Result<Box<dyn ChildProcess>> {
        if self.shared.fail_next_spawn.swap(false, Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no such binary"));
        }
        self.shared.spawns.fetch_add(1, Ordering::SeqCst);
        self.shared.specs.lock().unwrap().push(spec.clone());
        let script = self
            .shared
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default();

        let (out_tx, out_rx) = mpsc::channel();
        let (err_tx, err_rx) = mpsc::channel();
        for line in &script.stdout {
            out_tx.send(format!("{line}\n").into_bytes()).unwrap();
        }
        for line in &script.stderr {
            err_tx.send(format!("{line}\n").into_bytes()).unwrap();
        }

        let (out, err) = if script.exit {
            (None, None)
        } else {
            (Some(out_tx), Some(err_tx))
        };
        let out: Pipe = Arc::new(Mutex::new(out));
        *self.shared.live_stdout.lock().unwrap() = Some(Arc::clone(&out));

        Ok(Box::new(StubChild {
            stdin: Some(Arc::clone(&self.shared.stdin)),
            stdout: Some(out_rx),
            stderr: Some(err_rx),
            out,
            err: Arc::new(Mutex::new(err)),
            exited: script.exit,
            ignore_terminate: script.ignore_terminate,
            ignore_kill: script.ignore_kill,
            terminates: Arc::clone(&self.shared.terminates),
            kills: Arc::clone(&self.shared.kills),
        }))
    }

    fn kill_all_by_name(&self, process_name: &str, secret: Option<&SecretString>) -> io::Result<()> {
        self.shared
            .kill_all_calls
            .lock()
            .unwrap()
            .push((process_name.to_string(), secret.is_some()));
        Ok(())
    }
}

struct StubChild {
    stdin: Option<Arc<Mutex<Vec<u8>>>>,
    stdout: Option<Receiver<Vec<u8>>>,
    stderr: Option<Receiver<Vec<u8>>>,
    out: Pipe,
    err: Pipe,
    exited: bool,
    ignore_terminate: bool,
    ignore_kill: bool,
    terminates: Arc<AtomicUsize>,
    kills: Arc<AtomicUsize>,
}

impl StubChild {
    fn exit(&mut self) {
        self.exited = true;
        self.out.lock().unwrap().take();
        self.err.lock().unwrap().take();
    }
}

impl ChildProcess for StubChild {
    fn pid(&self) -> u32 {
        4242
    }

    fn take_stdin(&mut self) -> Option<Box<dyn Write + Send>> {
        self.stdin
            .take()
            .map(|buf| Box::new(CapturedStdin(buf)) as Box<dyn Write + Send>)
    }

    fn take_stdout(&mut self) -> Option<Box<dyn Read + Send>> {
        self.stdout
            .take()
            .map(|rx| Box::new(ChannelReader::new(rx)) as Box<dyn Read + Send>)
    }

    fn take_stderr(&mut self) -> Option<Box<dyn Read + Send>> {
        self.stderr
            .take()
            .map(|rx| Box::new(ChannelReader::new(rx)) as Box<dyn Read + Send>)
    }

    fn try_status(&mut self) -> io::Result<ProcessStatus> {
        Ok(if self.exited {
            ProcessStatus::Exited(Some(0))
        } else {
            ProcessStatus::Running
        })
    }

    fn terminate(&mut self) -> io::Result<()> {
        self.terminates.fetch_add(1, Ordering::SeqCst);
        if !self.ignore_terminate {
            self.exit();
        }
        Ok(())
    }

    fn kill(&mut self) -> io::Result<()> {
        self.kills.fetch_add(1, Ordering::SeqCst);
        if !self.ignore_kill {
            self.exit();
        }
        Ok(())
    }
}

struct CapturedStdin(Arc<Mutex<Vec<u8>>>);

impl Write for CapturedStdin {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct ChannelReader {
    rx: Receiver<Vec<u8>>,
    chunk: Vec<u8>,
    pos: usize,
}

impl ChannelReader {
    fn new(rx: Receiver<Vec<u8>>) -> Self {
        Self {
            rx,
            chunk: Vec::new(),
            pos: 0,
        }
    }
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.chunk.len() {
            match self.rx.recv() {
                Ok(chunk) => {
                    self.chunk = chunk;
                    self.pos = 0;
                }
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.chunk.len() - self.pos);
        buf[..n].copy_from_slice(&self.chunk[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}
