use std::ffi::OsString;
use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::debug;

use crate::core::cancel::CancelToken;

const POLL_INTERVAL: Duration = Duration::from_millis(20);
const DRAIN_GRACE: Duration = Duration::from_millis(200);

/// One external command, fully described up front.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub working_dir: Option<PathBuf>,
    pub capture_stderr: bool,
    pub timeout: Option<Duration>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            capture_stderr: true,
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn capture_stderr(mut self, capture: bool) -> Self {
        self.capture_stderr = capture;
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn display_command(&self) -> String {
        let mut parts = vec![self.program.to_string_lossy().to_string()];
        parts.extend(self.args.iter().map(|arg| arg.to_string_lossy().to_string()));
        parts.join(" ")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessExit {
    Exited { code: Option<i32> },
    TimedOut { after: Duration },
    Cancelled,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        matches!(self, ProcessExit::Exited { code: Some(0) })
    }
}

#[derive(Debug, Clone)]
pub struct Captured {
    pub exit: ProcessExit,
    pub output: String,
    pub elapsed: Duration,
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("{0}")]
    Spawn(std::io::Error),
    #[error("failed to wait for child: {0}")]
    Wait(std::io::Error),
}

/// Runs the command to completion and returns everything it wrote.
///
/// Stdout and, when enabled, stderr are merged in arrival order. The child is always reaped
/// before returning, including on timeout, cancellation and wait errors.
pub fn run_captured(
    spec: &ProcessSpec,
    cancel: Option<&CancelToken>,
) -> Result<Captured, RunError> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped());

    if spec.capture_stderr {
        cmd.stderr(Stdio::piped());
    } else {
        cmd.stderr(Stdio::inherit());
    }

    if let Some(dir) = &spec.working_dir {
        cmd.current_dir(dir);
    }

    let started = Instant::now();
    let mut child = cmd.spawn().map_err(RunError::Spawn)?;
    debug!(pid = child.id(), command = %spec.display_command(), "spawned");

    let (chunk_tx, chunk_rx) = mpsc::channel::<Vec<u8>>();
    if let Some(stdout) = child.stdout.take() {
        spawn_chunk_reader(stdout, chunk_tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_chunk_reader(stderr, chunk_tx.clone());
    }
    drop(chunk_tx);

    let mut buffer: Vec<u8> = Vec::new();
    let waited = wait_for_exit(&mut child, spec.timeout, cancel, started, &chunk_rx, &mut buffer);
    let exit = match waited {
        Ok(exit) => exit,
        Err(err) => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(RunError::Wait(err));
        }
    };

    match exit {
        // Background grandchildren can hold the pipes open long after the child exits.
        ProcessExit::Exited { .. } => {
            let deadline = spec
                .timeout
                .map(|limit| (started + limit).max(Instant::now() + DRAIN_GRACE));
            drain(&chunk_rx, &mut buffer, deadline, cancel);
        }
        ProcessExit::TimedOut { .. } | ProcessExit::Cancelled => {
            drain(&chunk_rx, &mut buffer, None, None);
        }
    }

    let elapsed = started.elapsed();
    debug!(?exit, ?elapsed, bytes = buffer.len(), "child finished");

    Ok(Captured {
        exit,
        output: String::from_utf8_lossy(&buffer).to_string(),
        elapsed,
    })
}

fn wait_for_exit(
    child: &mut Child,
    timeout: Option<Duration>,
    cancel: Option<&CancelToken>,
    started: Instant,
    chunk_rx: &Receiver<Vec<u8>>,
    buffer: &mut Vec<u8>,
) -> std::io::Result<ProcessExit> {
    loop {
        loop {
            match chunk_rx.try_recv() {
                Ok(chunk) => buffer.extend(chunk),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }

        if let Some(status) = child.try_wait()? {
            return Ok(ProcessExit::Exited {
                code: status.code(),
            });
        }

        if cancel.is_some_and(CancelToken::is_cancelled) {
            kill_and_reap(child)?;
            return Ok(ProcessExit::Cancelled);
        }

        if let Some(limit) = timeout {
            if started.elapsed() >= limit {
                kill_and_reap(child)?;
                return Ok(ProcessExit::TimedOut { after: limit });
            }
        }

        thread::sleep(POLL_INTERVAL);
    }
}

/// Collects output still in flight. Stops once the pipes close, nothing arrives within
/// `DRAIN_GRACE`, the deadline passes, or the token fires.
fn drain(
    chunk_rx: &Receiver<Vec<u8>>,
    buffer: &mut Vec<u8>,
    deadline: Option<Instant>,
    cancel: Option<&CancelToken>,
) {
    loop {
        if cancel.is_some_and(CancelToken::is_cancelled) {
            break;
        }
        let wait = match deadline {
            Some(deadline) => deadline
                .saturating_duration_since(Instant::now())
                .min(DRAIN_GRACE),
            None => DRAIN_GRACE,
        };
        if wait.is_zero() {
            break;
        }
        match chunk_rx.recv_timeout(wait) {
            Ok(chunk) => buffer.extend(chunk),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    for chunk in chunk_rx.try_iter() {
        buffer.extend(chunk);
    }
}

fn kill_and_reap(child: &mut Child) -> std::io::Result<()> {
    debug!(pid = child.id(), "killing child");
    if let Err(err) = child.kill() {
        // Already exited between the last poll and the kill.
        if err.kind() != std::io::ErrorKind::InvalidInput {
            return Err(err);
        }
    }
    child.wait().map(|_| ())
}

fn spawn_chunk_reader<R: Read + Send + 'static>(
    reader: R,
    sender: Sender<Vec<u8>>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut reader = BufReader::new(reader);
        loop {
            let mut line: Vec<u8> = Vec::new();
            match reader.read_until(b'\n', &mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    if sender.send(line).is_err() {
                        break;
                    }
                }
            }
        }
    })
}
