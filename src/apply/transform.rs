//! The per-record transformation seam.
//!
//! The engine only knows [`Transform`]: bytes in, bytes out, or a
//! [`WorkerError`].  [`CommandTransform`] is the production implementation
//! and runs an external program per record; any `Fn(&[u8]) -> Result<..>`
//! closure is a transformation too, which is what the tests and benches use.

use std::ffi::OsString;
use std::io::{self, Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tracing::trace;

use crate::signal::CancelToken;

/// Captured stderr kept for diagnostics, in bytes.
pub const STDERR_LIMIT: usize = 4096;

const POLL_MIN: Duration = Duration::from_millis(1);
const POLL_MAX: Duration = Duration::from_millis(25);

// ── Error type ───────────────────────────────────────────────────────────────

/// Why one record could not be transformed.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerError {
    #[error("failed to start `{program}`: {reason}")]
    Spawn { program: String, reason: String },
    #[error("exited with status {code}{}", stderr_suffix(.stderr))]
    Exit { code: i32, stderr: String },
    #[error("killed by signal {signal}{}", stderr_suffix(.stderr))]
    Signal { signal: i32, stderr: String },
    #[error("pipe error: {reason}")]
    Pipe { reason: String },
    #[error("timed out after {limit_ms} ms")]
    Timeout { limit_ms: u64 },
    #[error("cancelled")]
    Cancelled,
    #[error("{reason}")]
    Failed { reason: String },
}

fn stderr_suffix(stderr: &str) -> String {
    if stderr.is_empty() { String::new() } else { format!(": {stderr}") }
}

impl WorkerError {
    /// Failure raised by an in-process transformation.
    pub fn failed(reason: impl Into<String>) -> Self {
        WorkerError::Failed { reason: reason.into() }
    }

    /// Process exit code, when the transformation was a process that exited.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            WorkerError::Exit { code, .. } => Some(*code),
            _ => None,
        }
    }
}

// ── Transform trait ──────────────────────────────────────────────────────────

/// What a transformation knows about the record it is working on.
pub struct TransformContext<'a> {
    pub position: usize,
    pub name:     &'a str,
    /// Hard limit on one invocation.
    pub timeout:  Option<Duration>,
    /// How long an invocation may keep running once `cancel` is tripped.
    pub grace:    Duration,
    pub cancel:   &'a CancelToken,
}

pub trait Transform: Sync {
    fn transform(&self, input: &[u8], ctx: &TransformContext<'_>) -> Result<Vec<u8>, WorkerError>;
}

impl<F> Transform for F
where
    F: Fn(&[u8]) -> Result<Vec<u8>, WorkerError> + Sync,
{
    fn transform(&self, input: &[u8], _: &TransformContext<'_>) -> Result<Vec<u8>, WorkerError> {
        self(input)
    }
}

// ── CommandTransform ─────────────────────────────────────────────────────────

/// Runs `program args..` once per record: the record on stdin, the new
/// record read from stdout, exit status 0 for success.
#[derive(Debug, Clone)]
pub struct CommandTransform {
    program: OsString,
    args:    Vec<OsString>,
}

impl CommandTransform {
    pub fn new<S: Into<OsString>>(program: S) -> Self {
        Self { program: program.into(), args: Vec::new() }
    }

    pub fn arg<S: Into<OsString>>(mut self, arg: S) -> Self {
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

    /// Build from a command line already split into words.
    /// `None` when `argv` is empty.
    pub fn from_argv<I, S>(argv: I) -> Option<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        let mut it = argv.into_iter();
        let program = it.next()?;
        Some(Self::new(program).args(it))
    }

    fn program_name(&self) -> String {
        self.program.to_string_lossy().into_owned()
    }
}

impl Transform for CommandTransform {
    fn transform(&self, input: &[u8], ctx: &TransformContext<'_>) -> Result<Vec<u8>, WorkerError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| WorkerError::Spawn { program: self.program_name(), reason: e.to_string() })?;
        trace!(name = ctx.name, pid = child.id(), "spawned");

        let stdin  = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        // Feed and drain on separate threads so a child that writes before
        // it finishes reading can never deadlock against us.
        thread::scope(|s| -> Result<Vec<u8>, WorkerError> {
            let feeder = s.spawn(move || -> io::Result<()> {
                match stdin {
                    Some(mut pipe) => pipe.write_all(input),
                    None           => Ok(()),
                }
            });
            let out = s.spawn(move || drain(stdout));
            let err = s.spawn(move || drain(stderr));

            let waited = wait_for(&mut child, ctx);
            if waited.is_err() {
                // Unblock the pipe threads before the scope joins them.
                let _ = reap(&mut child);
            }

            let fed    = join(feeder)?;
            let output = join(out)?.map_err(pipe_error)?;
            let errors = join(err)?.map_err(pipe_error)?;

            match waited.map_err(pipe_error)? {
                Waited::TimedOut(limit) => Err(WorkerError::Timeout {
                    limit_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                }),
                Waited::Cancelled => Err(WorkerError::Cancelled),
                Waited::Exited(status) if status.success() => match fed {
                    // The program is free to stop reading early.
                    Err(e) if e.kind() != io::ErrorKind::BrokenPipe => Err(pipe_error(e)),
                    _ => Ok(output),
                },
                Waited::Exited(status) => Err(exit_error(status, &errors)),
            }
        })
    }
}

fn drain<R: Read>(pipe: Option<R>) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        pipe.read_to_end(&mut buf)?;
    }
    Ok(buf)
}

fn join<T>(handle: thread::ScopedJoinHandle<'_, T>) -> Result<T, WorkerError> {
    handle.join().map_err(|_| WorkerError::Pipe { reason: "pipe thread panicked".into() })
}

fn pipe_error(e: io::Error) -> WorkerError {
    WorkerError::Pipe { reason: e.to_string() }
}

fn exit_error(status: ExitStatus, stderr: &[u8]) -> WorkerError {
    let stderr = {
        let end = stderr.len().min(STDERR_LIMIT);
        String::from_utf8_lossy(&stderr[..end]).trim().to_owned()
    };
    if let Some(code) = status.code() {
        return WorkerError::Exit { code, stderr };
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return WorkerError::Signal { signal, stderr };
        }
    }
    WorkerError::Exit { code: -1, stderr }
}

enum Waited {
    Exited(ExitStatus),
    TimedOut(Duration),
    Cancelled,
}

/// Wait for `child`, killing it when the timeout expires or when the grace
/// period after cancellation runs out.
fn wait_for(child: &mut Child, ctx: &TransformContext<'_>) -> io::Result<Waited> {
    let started = Instant::now();
    let mut cancelled_at: Option<Instant> = None;
    let mut poll = POLL_MIN;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Waited::Exited(status));
        }
        let now = Instant::now();
        if let Some(limit) = ctx.timeout {
            if now.duration_since(started) >= limit {
                reap(child)?;
                return Ok(Waited::TimedOut(limit));
            }
        }
        if ctx.cancel.is_cancelled() {
            let since = *cancelled_at.get_or_insert(now);
            if now.duration_since(since) >= ctx.grace {
                reap(child)?;
                return Ok(Waited::Cancelled);
            }
        }
        thread::sleep(poll);
        poll = (poll * 2).min(POLL_MAX);
    }
}

fn reap(child: &mut Child) -> io::Result<()> {
    match child.kill() {
        Ok(()) => {}
        // Exited between the last poll and the kill.
        Err(e) if e.kind() == io::ErrorKind::InvalidInput => {}
        Err(e) => return Err(e),
    }
    child.wait().map(|_| ())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn ctx<'a>(cancel: &'a CancelToken, timeout: Option<Duration>) -> TransformContext<'a> {
        TransformContext { position: 0, name: "rec", timeout, grace: Duration::ZERO, cancel }
    }

    #[test]
    fn pipes_record_through_program() {
        let cancel = CancelToken::new();
        let t = CommandTransform::new("tr").args(["a-z", "A-Z"]);
        assert_eq!(t.transform(b"hello", &ctx(&cancel, None)).unwrap(), b"HELLO");
    }

    #[test]
    fn empty_output_is_success() {
        let cancel = CancelToken::new();
        let t = CommandTransform::new("true");
        assert_eq!(t.transform(b"ignored input", &ctx(&cancel, None)).unwrap(), b"");
    }

    #[test]
    fn nonzero_exit_carries_code_and_stderr() {
        let cancel = CancelToken::new();
        let t = CommandTransform::new("sh").args(["-c", "echo oops >&2; exit 3"]);
        match t.transform(b"", &ctx(&cancel, None)) {
            Err(WorkerError::Exit { code, stderr }) => {
                assert_eq!(code, 3);
                assert_eq!(stderr, "oops");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let cancel = CancelToken::new();
        let t = CommandTransform::new("/nonexistent/ffindex-test-program");
        assert!(matches!(t.transform(b"x", &ctx(&cancel, None)), Err(WorkerError::Spawn { .. })));
    }

    #[test]
    fn slow_program_times_out() {
        let cancel = CancelToken::new();
        let t = CommandTransform::new("sleep").arg("5");
        let started = Instant::now();
        let res = t.transform(b"", &ctx(&cancel, Some(Duration::from_millis(100))));
        assert_eq!(res, Err(WorkerError::Timeout { limit_ms: 100 }));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn cancellation_kills_after_grace() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let t = CommandTransform::new("sleep").arg("5");
        assert_eq!(t.transform(b"", &ctx(&cancel, None)), Err(WorkerError::Cancelled));
    }

    #[test]
    fn large_record_does_not_deadlock() {
        let cancel = CancelToken::new();
        let input = vec![b'x'; 1 << 20];
        let t = CommandTransform::new("cat");
        assert_eq!(t.transform(&input, &ctx(&cancel, None)).unwrap().len(), input.len());
    }

    #[test]
    fn from_argv_splits_program_and_args() {
        assert!(CommandTransform::from_argv(Vec::<String>::new()).is_none());
        let t = CommandTransform::from_argv(["tr", "a", "b"]).unwrap();
        assert_eq!(t.program_name(), "tr");
        assert_eq!(t.args.len(), 2);
    }
}
