//! Asynchronous batching sender.
//!
//! Finished spans and error events are pushed onto bounded producer queues
//! and return immediately; a drain loop moves them into pending batches and
//! flushes on size or age, handing batches to a pool of send workers over a
//! dispatch channel. Failed sends retry with exponential backoff and
//! jitter; overflow drops with accounting. The caller's critical path never
//! blocks on I/O.

use crate::config::Config;
use crate::error_event::ErrorEvent;
use crate::export::{ErrorExporter, OtlpExporter};
use crate::ids;
use crate::trace::span::Span;
use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TrySendError};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Attempts per batch, including the first.
pub const MAX_RETRY_ATTEMPTS: u32 = 3;
/// First-retry delay; doubles per attempt.
pub const BASE_RETRY_DELAY: Duration = Duration::from_millis(500);
/// Uniform jitter added per retry, as a fraction of the backoff delay.
const RETRY_JITTER_RATIO: f64 = 0.1;
/// Drain-loop tick.
const DRAIN_TICK: Duration = Duration::from_millis(100);
/// Maximum wait to join each background thread during shutdown.
const SHUTDOWN_WAIT: Duration = Duration::from_secs(5);
/// Maximum wait for in-flight sends during `flush`.
const FLUSH_WAIT: Duration = Duration::from_secs(5);

/// The payload kinds flowing through the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryKind {
    Span,
    Error,
}

impl TelemetryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TelemetryKind::Span => "span",
            TelemetryKind::Error => "error",
        }
    }
}

/// Per-kind counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KindStats {
    pub enqueued: u64,
    pub sent: u64,
    pub dropped: u64,
    pub failed: u64,
}

/// Sender statistics snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stats {
    pub spans: KindStats,
    pub errors: KindStats,
    pub retries: u64,
}

/// Messages on the dispatch channel feeding the send workers.
#[derive(Debug)]
enum Work {
    Spans(Vec<Span>),
    Errors(Vec<ErrorEvent>),
    /// Sentinel terminating one worker.
    Terminate,
}

struct Pending {
    spans: Vec<Span>,
    errors: Vec<ErrorEvent>,
    span_last_flush: Instant,
    error_last_flush: Instant,
    stats: Stats,
}

struct Shared {
    batch_size: usize,
    flush_interval: Duration,
    span_tx: Sender<Span>,
    span_rx: Receiver<Span>,
    error_tx: Sender<ErrorEvent>,
    error_rx: Receiver<ErrorEvent>,
    dispatch_tx: Sender<Work>,
    dispatch_rx: Receiver<Work>,
    pending: Mutex<Pending>,
    /// Batches dispatched but not yet fully processed by a worker.
    outstanding: AtomicUsize,
    shutdown: AtomicBool,
    span_exporter: OtlpExporter,
    error_exporter: ErrorExporter,
}

struct Handles {
    drain: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

/// The batching sender. Created started; stopped explicitly or on drop.
pub struct BatchSender {
    shared: Arc<Shared>,
    handles: Mutex<Option<Handles>>,
}

impl BatchSender {
    /// Allocate queues and spawn the drain loop plus the send-worker pool.
    pub fn start(
        config: &Config,
        span_exporter: OtlpExporter,
        error_exporter: ErrorExporter,
    ) -> Self {
        // A batch can never exceed the queue that feeds it.
        let batch_size = config.batch_size.min(config.max_queue_size);
        let (span_tx, span_rx) = bounded(config.max_queue_size);
        let (error_tx, error_rx) = bounded(config.max_queue_size);
        let (dispatch_tx, dispatch_rx) = unbounded();
        let now = Instant::now();

        let shared = Arc::new(Shared {
            batch_size,
            flush_interval: config.flush_interval,
            span_tx,
            span_rx,
            error_tx,
            error_rx,
            dispatch_tx,
            dispatch_rx,
            pending: Mutex::new(Pending {
                spans: Vec::new(),
                errors: Vec::new(),
                span_last_flush: now,
                error_last_flush: now,
                stats: Stats::default(),
            }),
            outstanding: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            span_exporter,
            error_exporter,
        });

        let drain = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("miniapm-batcher".to_string())
                .spawn(move || drain_loop(&shared))
                .map_err(|e| error!("failed to spawn batcher thread: {e}"))
                .ok()
        };

        let mut workers = Vec::with_capacity(config.max_concurrent_sends);
        for i in 0..config.max_concurrent_sends {
            let shared = Arc::clone(&shared);
            match thread::Builder::new()
                .name(format!("miniapm-sender-{i}"))
                .spawn(move || worker_loop(&shared))
            {
                Ok(handle) => workers.push(handle),
                Err(e) => error!("failed to spawn send worker: {e}"),
            }
        }

        BatchSender {
            shared,
            handles: Mutex::new(Some(Handles { drain, workers })),
        }
    }

    /// Enqueue a finished span. Never blocks; a full queue drops the span
    /// and accounts for it.
    pub fn enqueue_span(&self, span: Span) {
        if self.shared.shutdown.load(Ordering::SeqCst) {
            return;
        }
        match self.shared.span_tx.try_send(span) {
            Ok(()) => self.shared.lock_pending().stats.spans.enqueued += 1,
            Err(TrySendError::Full(_)) => {
                self.shared.lock_pending().stats.spans.dropped += 1;
                debug!("span queue full; dropping");
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    /// Enqueue an error event; same policy as [`BatchSender::enqueue_span`].
    pub fn enqueue_error(&self, event: ErrorEvent) {
        if self.shared.shutdown.load(Ordering::SeqCst) {
            return;
        }
        match self.shared.error_tx.try_send(event) {
            Ok(()) => self.shared.lock_pending().stats.errors.enqueued += 1,
            Err(TrySendError::Full(_)) => {
                self.shared.lock_pending().stats.errors.dropped += 1;
                debug!("error queue full; dropping");
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    /// Move everything queued into batches, dispatch, and wait up to five
    /// seconds for the in-flight sends to complete.
    pub fn flush(&self) {
        if self.handles.lock().unwrap_or_else(|e| e.into_inner()).is_none() {
            return;
        }
        self.shared.drain_all();
        if !self.shared.wait_for_drain(FLUSH_WAIT) {
            warn!("flush timed out waiting for dispatch channel to drain");
        }
    }

    /// Stop the sender: flush remaining telemetry, then join the drain
    /// loop and workers. Idempotent.
    pub fn stop(&self) {
        let handles = self
            .handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(handles) = handles else {
            return;
        };

        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.drain_all();

        if let Some(drain) = handles.drain {
            join_timeout(drain, SHUTDOWN_WAIT, "batcher");
        }
        for _ in 0..handles.workers.len() {
            let _ = self.shared.dispatch_tx.send(Work::Terminate);
        }
        for worker in handles.workers {
            join_timeout(worker, SHUTDOWN_WAIT, "send worker");
        }
        debug!("batch sender stopped");
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> Stats {
        self.shared.lock_pending().stats.clone()
    }
}

impl Drop for BatchSender {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for BatchSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchSender")
            .field("shutdown", &self.shared.shutdown.load(Ordering::SeqCst))
            .finish()
    }
}

impl Shared {
    fn lock_pending(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Non-blockingly move queued items into the pending buffers, up to one
    /// batch per kind.
    fn collect_pending(&self) {
        let mut pending = self.lock_pending();
        while pending.spans.len() < self.batch_size {
            match self.span_rx.try_recv() {
                Ok(span) => pending.spans.push(span),
                Err(_) => break,
            }
        }
        while pending.errors.len() < self.batch_size {
            match self.error_rx.try_recv() {
                Ok(event) => pending.errors.push(event),
                Err(_) => break,
            }
        }
    }

    /// Dispatch any pending batch that is full or stale; with `force`,
    /// any non-empty batch.
    fn flush_due(&self, force: bool) {
        let mut ready: Vec<Work> = Vec::new();
        {
            let mut pending = self.lock_pending();
            let now = Instant::now();
            if !pending.spans.is_empty()
                && (force
                    || pending.spans.len() >= self.batch_size
                    || now.duration_since(pending.span_last_flush) >= self.flush_interval)
            {
                ready.push(Work::Spans(std::mem::take(&mut pending.spans)));
                pending.span_last_flush = now;
            }
            if !pending.errors.is_empty()
                && (force
                    || pending.errors.len() >= self.batch_size
                    || now.duration_since(pending.error_last_flush) >= self.flush_interval)
            {
                ready.push(Work::Errors(std::mem::take(&mut pending.errors)));
                pending.error_last_flush = now;
            }
        }
        for work in ready {
            self.dispatch(work);
        }
    }

    fn dispatch(&self, work: Work) {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        if self.dispatch_tx.send(work).is_err() {
            self.outstanding.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Drain both producer queues completely, dispatching batches as they
    /// fill regardless of the flush interval.
    fn drain_all(&self) {
        loop {
            self.collect_pending();
            self.flush_due(true);
            let pending = self.lock_pending();
            if self.span_rx.is_empty()
                && self.error_rx.is_empty()
                && pending.spans.is_empty()
                && pending.errors.is_empty()
            {
                break;
            }
        }
    }

    fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.outstanding.load(Ordering::SeqCst) == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    /// Send one span batch, retrying retriable failures with exponential
    /// backoff plus jitter, up to [`MAX_RETRY_ATTEMPTS`].
    fn send_spans_with_retry(&self, spans: &[Span]) {
        let count = spans.len();
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let Some(response) = self.span_exporter.export(spans) else {
                debug!(count, "span export skipped: no api key configured");
                return;
            };

            if response.success {
                self.lock_pending().stats.spans.sent += count as u64;
                debug!(count, attempt, "span batch exported");
                return;
            }
            if response.is_client_error() {
                self.lock_pending().stats.spans.failed += 1;
                warn!(
                    status = response.status,
                    count, "collector rejected span batch; not retrying"
                );
                return;
            }
            if attempt >= MAX_RETRY_ATTEMPTS {
                self.lock_pending().stats.spans.failed += 1;
                error!(
                    status = response.status,
                    count,
                    attempts = attempt,
                    "span export failed; giving up"
                );
                return;
            }

            self.backoff(TelemetryKind::Span, attempt, response.status);
        }
    }

    /// Send error events one POST each. Accepted and client-rejected
    /// events are accounted per event right away; only the retriably
    /// failed subset is carried into the next attempt.
    fn send_errors_with_retry(&self, events: Vec<ErrorEvent>) {
        let mut remaining = events;
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let Some(responses) = self.error_exporter.export_each(&remaining) else {
                debug!(
                    count = remaining.len(),
                    "error export skipped: no api key configured"
                );
                return;
            };

            let mut retriable = Vec::new();
            let mut sent = 0u64;
            let mut rejected = 0u64;
            let mut last_status = 0u16;
            for (event, response) in remaining.into_iter().zip(responses) {
                if response.success {
                    sent += 1;
                } else if response.is_client_error() {
                    rejected += 1;
                    warn!(
                        status = response.status,
                        "collector rejected error event; not retrying"
                    );
                } else {
                    last_status = response.status;
                    retriable.push(event);
                }
            }
            {
                let mut pending = self.lock_pending();
                pending.stats.errors.sent += sent;
                pending.stats.errors.failed += rejected;
            }

            if retriable.is_empty() {
                debug!(sent, attempt, "error batch exported");
                return;
            }
            if attempt >= MAX_RETRY_ATTEMPTS {
                let failed = retriable.len() as u64;
                self.lock_pending().stats.errors.failed += failed;
                error!(
                    status = last_status,
                    count = failed,
                    attempts = attempt,
                    "error export failed; giving up"
                );
                return;
            }

            self.backoff(TelemetryKind::Error, attempt, last_status);
            remaining = retriable;
        }
    }

    fn backoff(&self, kind: TelemetryKind, attempt: u32, status: u16) {
        let backoff = BASE_RETRY_DELAY * 2u32.pow(attempt - 1);
        let jitter = backoff.mul_f64(RETRY_JITTER_RATIO * ids::random_unit());
        self.lock_pending().stats.retries += 1;
        warn!(
            kind = kind.as_str(),
            status,
            attempt,
            delay_ms = (backoff + jitter).as_millis() as u64,
            "export failed; retrying"
        );
        thread::sleep(backoff + jitter);
    }
}

fn drain_loop(shared: &Shared) {
    while !shared.shutdown.load(Ordering::SeqCst) {
        shared.collect_pending();
        shared.flush_due(false);
        thread::sleep(DRAIN_TICK);
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        match shared.dispatch_rx.recv() {
            Err(_) | Ok(Work::Terminate) => break,
            Ok(work) => {
                let kind = match &work {
                    Work::Errors(_) => TelemetryKind::Error,
                    _ => TelemetryKind::Span,
                };
                let result = catch_unwind(AssertUnwindSafe(|| match work {
                    Work::Spans(items) => shared.send_spans_with_retry(&items),
                    Work::Errors(items) => shared.send_errors_with_retry(items),
                    Work::Terminate => {}
                }));
                if result.is_err() {
                    error!(kind = kind.as_str(), "send worker panicked while exporting; continuing");
                }
                shared.outstanding.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }
}

fn join_timeout(handle: JoinHandle<()>, timeout: Duration, what: &str) {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    if handle.is_finished() {
        let _ = handle.join();
    } else {
        warn!("{what} thread did not stop within {timeout:?}; detaching");
    }
}
