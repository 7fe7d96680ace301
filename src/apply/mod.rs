//! Parallel apply engine.
//!
//! Runs a [`Transform`] over every record of a [`RecordSource`] with a fixed
//! pool of worker threads and returns the transformed records in index
//! order, whatever order the workers finish in.
//!
//! # Pipeline
//! ```text
//!  dispatcher ──► sync_channel(W + lookahead) ──► W workers ──► slots[i]
//! ```
//! The dispatcher walks the source and blocks when the queue is full, so
//! at most `W + lookahead` records are waiting at any time.  Each worker
//! writes its outcome into `slots[position]`; every slot is written exactly
//! once, by exactly one worker, so the hot path takes no lock beyond the
//! queue itself.
//!
//! # Failure policies
//! - [`FailurePolicy::AbortOnFirstError`]: the first failure stops dispatch.
//!   Records still queued are discarded unprocessed; transformations already
//!   running are allowed to finish.  The run fails with [`Error::Aborted`].
//! - [`FailurePolicy::SkipAndReport`]: failed records are dropped from the
//!   output and listed in the [`FailureReport`]; the run succeeds.
//!
//! # Cancellation
//! Tripping the [`CancelToken`] stops dispatch and discards queued records.
//! Running transformations get [`ApplyOptions::grace`] to finish before they
//! are killed.  The run fails with [`Error::Cancelled`] and the partial
//! results are dropped.

pub mod transform;

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Mutex, OnceLock, PoisonError};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{dispatcher, info, warn};

use crate::error::{Error, Result};
use crate::format::{Index, RECORD_DELIMITER};
use crate::signal::CancelToken;
use crate::source::{Record, RecordSource};
use crate::writer::ArchiveWriter;

pub use transform::{CommandTransform, Transform, TransformContext, WorkerError};

/// Queue slots beyond one per worker.
pub const DEFAULT_LOOKAHEAD: usize = 2;
/// Time running transformations get after cancellation.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(5);

// ── Options ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    AbortOnFirstError,
    SkipAndReport,
}

impl FailurePolicy {
    pub fn name(self) -> &'static str {
        match self {
            FailurePolicy::AbortOnFirstError => "abort",
            FailurePolicy::SkipAndReport     => "skip",
        }
    }

    /// Parse from a CLI string.
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "abort" | "abort-on-first-error" => Some(FailurePolicy::AbortOnFirstError),
            "skip"  | "skip-and-report"      => Some(FailurePolicy::SkipAndReport),
            _                                => None,
        }
    }
}

impl FromStr for FailurePolicy {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, String> {
        Self::from_name(s).ok_or_else(|| format!("unknown failure policy '{s}' (expected abort or skip)"))
    }
}

/// How record bytes cross the transformation boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Bytes go in and come out unchanged.
    Raw,
    /// One trailing [`RECORD_DELIMITER`] is removed before the
    /// transformation sees the record and appended to what it returns.
    NullTerminated,
}

impl Framing {
    pub fn name(self) -> &'static str {
        match self {
            Framing::Raw            => "raw",
            Framing::NullTerminated => "null",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "raw"                    => Some(Framing::Raw),
            "null" | "nul" | "zero"  => Some(Framing::NullTerminated),
            _                        => None,
        }
    }

    /// The bytes the transformation sees, and whether a terminator was
    /// removed to get them.
    pub fn unframe(self, bytes: &[u8]) -> (&[u8], bool) {
        match self {
            Framing::Raw => (bytes, false),
            Framing::NullTerminated => match bytes.strip_suffix(&[RECORD_DELIMITER]) {
                Some(body) => (body, true),
                None       => (bytes, false),
            },
        }
    }

    /// Restore the terminator [`unframe`](Self::unframe) removed.  Records
    /// that had none (packed or empty) come back without one.
    pub fn frame(self, mut bytes: Vec<u8>, terminated: bool) -> Vec<u8> {
        if self == Framing::NullTerminated && terminated {
            bytes.push(RECORD_DELIMITER);
        }
        bytes
    }
}

impl FromStr for Framing {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, String> {
        Self::from_name(s).ok_or_else(|| format!("unknown framing '{s}' (expected raw or null)"))
    }
}

/// Configuration for [`apply`].
#[derive(Debug, Clone)]
pub struct ApplyOptions {
    /// Concurrent transformations, at least 1.
    pub workers:   usize,
    pub lookahead: usize,
    pub policy:    FailurePolicy,
    /// Per-record limit; `None` lets a transformation run unbounded.
    pub timeout:   Option<Duration>,
    pub grace:     Duration,
    pub framing:   Framing,
    pub cancel:    CancelToken,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            workers:   1,
            lookahead: DEFAULT_LOOKAHEAD,
            policy:    FailurePolicy::AbortOnFirstError,
            timeout:   None,
            grace:     DEFAULT_GRACE,
            framing:   Framing::Raw,
            cancel:    CancelToken::new(),
        }
    }
}

impl ApplyOptions {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    fn check(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::Config("worker count must be at least 1".into()));
        }
        Ok(())
    }
}

// ── Results ──────────────────────────────────────────────────────────────────

/// What one worker produced for one position.
#[derive(Debug, Clone)]
pub struct RecordOutcome {
    pub position: usize,
    pub name:     String,
    pub result:   std::result::Result<Vec<u8>, WorkerError>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformedRecord {
    pub name:  String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureRecord {
    pub position:  usize,
    pub name:      String,
    pub exit_code: Option<i32>,
    pub message:   String,
    pub error:     WorkerError,
}

impl FailureRecord {
    fn new(position: usize, name: String, error: WorkerError) -> Self {
        Self { position, name, exit_code: error.exit_code(), message: error.to_string(), error }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FailureReport {
    pub started_at:  DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub policy:      FailurePolicy,
    pub total:       usize,
    pub succeeded:   usize,
    pub failures:    Vec<FailureRecord>,
}

impl FailureReport {
    pub fn is_clean(&self) -> bool { self.failures.is_empty() }

    pub fn failed(&self) -> usize { self.failures.len() }

    pub fn summary(&self) -> String {
        format!("{}/{} records processed, {} failed", self.succeeded, self.total, self.failed())
    }

    pub fn to_json(&self) -> std::result::Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec_pretty(self)
    }
}

/// Successful records in index order plus the failure report.
#[derive(Debug, Clone)]
pub struct ApplyOutput {
    pub records: Vec<TransformedRecord>,
    pub report:  FailureReport,
}

// ── Engine ───────────────────────────────────────────────────────────────────

/// Shared state of one run.  Everything but the slots is bookkeeping.
struct Run<'a, T: ?Sized> {
    transform: &'a T,
    opts:      &'a ApplyOptions,
    slots:     Vec<OnceLock<RecordOutcome>>,
    /// Position of the failure that stopped an aborting run.
    first_failure: OnceLock<usize>,
    halted:    AtomicBool,
    completed: AtomicUsize,
    failed:    AtomicUsize,
    discarded: AtomicUsize,
}

impl<'a, T: Transform + ?Sized> Run<'a, T> {
    fn stopping(&self) -> bool {
        self.halted.load(Ordering::Acquire) || self.opts.cancel.is_cancelled()
    }

    fn work(&self, queue: &Mutex<mpsc::Receiver<Record<'_>>>) {
        loop {
            let record = {
                let rx = queue.lock().unwrap_or_else(PoisonError::into_inner);
                match rx.recv() {
                    Ok(r)  => r,
                    Err(_) => return,
                }
            };
            if self.stopping() {
                self.discarded.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            self.process(record);
        }
    }

    fn process(&self, record: Record<'_>) {
        let ctx = TransformContext {
            position: record.position,
            name:     record.name,
            timeout:  self.opts.timeout,
            grace:    self.opts.grace,
            cancel:   &self.opts.cancel,
        };
        let framing = self.opts.framing;
        let (input, terminated) = framing.unframe(record.bytes);
        let result = self
            .transform
            .transform(input, &ctx)
            .map(|out| framing.frame(out, terminated));

        match &result {
            Ok(bytes) => {
                self.completed.fetch_add(1, Ordering::Relaxed);
                info!(position = record.position, name = record.name, bytes = bytes.len(), "record done");
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                warn!(position = record.position, name = record.name, error = %e, "record failed");
                if self.opts.policy == FailurePolicy::AbortOnFirstError {
                    let _ = self.first_failure.set(record.position);
                    self.halted.store(true, Ordering::Release);
                }
            }
        }

        let outcome = RecordOutcome { position: record.position, name: record.name.to_owned(), result };
        let filled = self.slots[record.position].set(outcome).is_ok();
        debug_assert!(filled, "slot {} written twice", record.position);
    }
}

/// Transform every record of `source`.
pub fn apply<T: Transform + ?Sized>(
    source:    &RecordSource<'_>,
    transform: &T,
    opts:      &ApplyOptions,
) -> Result<ApplyOutput> {
    opts.check()?;
    let total = source.len();
    let started_at = Utc::now();
    let workers = opts.workers.min(total).max(1);
    info!(records = total, workers, policy = opts.policy.name(), "apply started");

    let run = Run {
        transform,
        opts,
        slots:         (0..total).map(|_| OnceLock::new()).collect(),
        first_failure: OnceLock::new(),
        halted:        AtomicBool::new(false),
        completed:     AtomicUsize::new(0),
        failed:        AtomicUsize::new(0),
        discarded:     AtomicUsize::new(0),
    };

    let (tx, rx) = mpsc::sync_channel::<Record<'_>>(workers + opts.lookahead);
    let queue = Mutex::new(rx);

    // Workers log through the caller's subscriber, scoped or global.
    let dispatch = dispatcher::get_default(|d| d.clone());
    thread::scope(|s| {
        for _ in 0..workers {
            s.spawn(|| dispatcher::with_default(&dispatch, || run.work(&queue)));
        }
        for record in source.records() {
            if run.stopping() {
                break;
            }
            // Blocks while the queue is full.
            if tx.send(record).is_err() {
                break;
            }
        }
        drop(tx);
    });

    let completed = run.completed.load(Ordering::Relaxed);
    let failed = run.failed.load(Ordering::Relaxed);

    if opts.cancel.is_cancelled() {
        let discarded = total - completed;
        warn!(completed, discarded, signal = opts.cancel.signal_name(), "apply cancelled");
        return Err(Error::Cancelled { completed, discarded });
    }

    if let Some(&position) = run.first_failure.get() {
        let first = run.slots[position]
            .get()
            .and_then(|o| o.result.as_ref().err().map(|e| FailureRecord::new(position, o.name.clone(), e.clone())))
            .ok_or_else(|| Error::Consistency(format!("failure at record {position} left no outcome")))?;
        return Err(Error::Aborted {
            first: Box::new(first),
            completed,
            failed,
            discarded: total - completed - failed,
        });
    }

    let mut records = Vec::with_capacity(completed);
    let mut failures = Vec::with_capacity(failed);
    for (position, slot) in run.slots.into_iter().enumerate() {
        let outcome = slot
            .into_inner()
            .ok_or_else(|| Error::Consistency(format!("record {position} was never processed")))?;
        match outcome.result {
            Ok(bytes) => records.push(TransformedRecord { name: outcome.name, bytes }),
            Err(e)    => failures.push(FailureRecord::new(position, outcome.name, e)),
        }
    }

    let report = FailureReport {
        started_at,
        finished_at: Utc::now(),
        policy: opts.policy,
        total,
        succeeded: records.len(),
        failures,
    };
    info!(summary = %report.summary(), "apply finished");
    Ok(ApplyOutput { records, report })
}

/// Transform every record and write the results as a new archive.
///
/// Nothing becomes visible under the writer's target paths unless the run
/// succeeds.
pub fn apply_to_archive<T: Transform + ?Sized>(
    source:    &RecordSource<'_>,
    transform: &T,
    opts:      &ApplyOptions,
    mut writer: ArchiveWriter,
) -> Result<(Index, FailureReport)> {
    let output = apply(source, transform, opts)?;
    for record in &output.records {
        writer.append(&record.name, &record.bytes)?;
    }
    let index = writer.finish()?;
    Ok((index, output.report))
}
