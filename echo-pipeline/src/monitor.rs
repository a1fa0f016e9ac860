//! Storage operation instrumentation.
//!
//! Architecture:
//! ```text
//!  begin_op(resource, type, size) ──► OpHandle ── end() ──┐
//!                                                         ▼
//!                               ┌───────────────────────────────────┐
//!                               │ open buckets (one per resource)   │
//!                               │   read / write / other:           │
//!                               │     count, bytes, time            │
//!                               └────────────────┬──────────────────┘
//!                                every flush_interval (1s default)
//!                                                ▼
//!                               ┌───────────────────────────────────┐
//!                               │ MetricsSink (finalized buckets)   │
//!                               └───────────────────────────────────┘
//! ```
//!
//! Disabled monitors hand out empty handles: no clock reads, no allocation.
//!
//! `usage` is busy time divided by window length. Overlapping operations on
//! one resource each contribute their full duration, so usage can exceed 1.0
//! under concurrency. It is reported as measured, without clamping.

use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::lock;

/// Monitor configuration.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Bucket window length. Default: 1s.
    pub flush_interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_millis(1000),
        }
    }
}

impl MonitorConfig {
    /// Short windows for tests.
    pub fn for_testing() -> Self {
        Self {
            flush_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpType {
    Read,
    Write,
    Other,
}

impl OpType {
    /// `"read"` and `"write"` map to their variants, anything else is `Other`.
    pub fn from_name(name: &str) -> Self {
        match name {
            "read" => OpType::Read,
            "write" => OpType::Write,
            _ => OpType::Other,
        }
    }
}

/// Aggregate for one operation type within a bucket.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OpStats {
    pub count: u64,
    pub bytes: u64,
    pub time_ms: f64,
}

impl OpStats {
    fn record(&mut self, size: u64, elapsed: Duration) {
        self.count += 1;
        self.bytes += size;
        self.time_ms += elapsed.as_secs_f64() * 1000.0;
    }
}

/// Finalized per-resource statistics for one window.
#[derive(Debug, Clone, PartialEq)]
pub struct StatsBucket {
    pub resource: String,
    /// Window start, ms since the Unix epoch.
    pub begin_ms: u64,
    /// Window end, ms since the Unix epoch.
    pub end_ms: u64,
    /// Busy time / window length. May exceed 1.0.
    pub usage: f64,
    pub read: OpStats,
    pub write: OpStats,
    pub other: OpStats,
}

impl StatsBucket {
    pub fn total_ops(&self) -> u64 {
        self.read.count + self.write.count + self.other.count
    }
}

#[derive(Default)]
struct SinkState {
    buckets: Vec<StatsBucket>,
    disposed: bool,
}

/// Destination for finalized buckets, shared with whoever consumes them.
#[derive(Clone, Default)]
pub struct MetricsSink {
    state: Arc<Mutex<SinkState>>,
}

impl MetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-arm a disposed sink.
    pub fn init(&self) {
        lock(&self.state).disposed = false;
    }

    pub fn push(&self, bucket: StatsBucket) {
        let mut state = lock(&self.state);
        if !state.disposed {
            state.buckets.push(bucket);
        }
    }

    /// Take every bucket collected so far.
    pub fn drain(&self) -> Vec<StatsBucket> {
        std::mem::take(&mut lock(&self.state).buckets)
    }

    /// Drop collected buckets and ignore further pushes until `init`.
    pub fn dispose(&self) {
        let mut state = lock(&self.state);
        state.buckets.clear();
        state.disposed = true;
    }

    pub fn len(&self) -> usize {
        lock(&self.state).buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct OpenBucket {
    begin: Instant,
    begin_ms: u64,
    read: OpStats,
    write: OpStats,
    other: OpStats,
}

impl OpenBucket {
    fn new(now: Instant) -> Self {
        Self {
            begin: now,
            begin_ms: wall_clock_ms(),
            read: OpStats::default(),
            write: OpStats::default(),
            other: OpStats::default(),
        }
    }

    fn is_empty(&self) -> bool {
        self.read.count + self.write.count + self.other.count == 0
    }

    fn finalize(self, resource: String, now: Instant) -> StatsBucket {
        let window_ms = now.duration_since(self.begin).as_secs_f64() * 1000.0;
        let busy_ms = self.read.time_ms + self.write.time_ms + self.other.time_ms;
        let usage = if window_ms > 0.0 { busy_ms / window_ms } else { 0.0 };
        StatsBucket {
            resource,
            begin_ms: self.begin_ms,
            end_ms: wall_clock_ms(),
            usage,
            read: self.read,
            write: self.write,
            other: self.other,
        }
    }
}

struct MonitorInner {
    config: MonitorConfig,
    sink: MetricsSink,
    enabled: AtomicBool,
    buckets: Mutex<FxHashMap<String, OpenBucket>>,
    flush_task: Mutex<Option<JoinHandle<()>>>,
}

impl MonitorInner {
    fn record(&self, resource: &str, op_type: OpType, size: u64, elapsed: Duration) {
        let mut buckets = lock(&self.buckets);
        let bucket = buckets
            .entry(resource.to_string())
            .or_insert_with(|| OpenBucket::new(Instant::now()));
        match op_type {
            OpType::Read => bucket.read.record(size, elapsed),
            OpType::Write => bucket.write.record(size, elapsed),
            OpType::Other => bucket.other.record(size, elapsed),
        }
    }

    fn flush(&self) -> usize {
        let now = Instant::now();
        let mut buckets = lock(&self.buckets);
        let mut flushed = 0;
        for (resource, bucket) in buckets.iter_mut() {
            let finished = std::mem::replace(bucket, OpenBucket::new(now));
            if finished.is_empty() {
                continue;
            }
            self.sink.push(finished.finalize(resource.clone(), now));
            flushed += 1;
        }
        flushed
    }
}

impl Drop for MonitorInner {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.flush_task).take() {
            task.abort();
        }
    }
}

/// Storage monitor. Cheap to clone; clones share buckets and sink.
#[derive(Clone)]
pub struct StorageMonitor {
    inner: Arc<MonitorInner>,
}

impl StorageMonitor {
    pub fn new(config: MonitorConfig, sink: MetricsSink) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                config,
                sink,
                enabled: AtomicBool::new(false),
                buckets: Mutex::new(FxHashMap::default()),
                flush_task: Mutex::new(None),
            }),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(MonitorConfig::default(), MetricsSink::new())
    }

    pub fn sink(&self) -> &MetricsSink {
        &self.inner.sink
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Acquire)
    }

    /// Start collecting and schedule periodic flushes.
    ///
    /// The flush task only holds a weak reference and ends once the monitor
    /// is dropped or disabled. Without a tokio runtime, buckets are only
    /// finalized by explicit [`flush`](Self::flush) calls.
    pub fn enable(&self) {
        if self.inner.enabled.swap(true, Ordering::AcqRel) {
            return;
        }

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                log::warn!("StorageMonitor enabled outside a runtime; periodic flush disabled");
                return;
            }
        };

        let weak: Weak<MonitorInner> = Arc::downgrade(&self.inner);
        let period = self.inner.config.flush_interval;
        let task = handle.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                if !inner.enabled.load(Ordering::Acquire) {
                    break;
                }
                let flushed = inner.flush();
                if flushed > 0 {
                    log::trace!("StorageMonitor flushed {flushed} buckets");
                }
            }
        });
        *lock(&self.inner.flush_task) = Some(task);
        log::debug!("StorageMonitor enabled (window {period:?})");
    }

    /// Stop collecting. Open buckets are flushed first.
    pub fn disable(&self) {
        if !self.inner.enabled.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(task) = lock(&self.inner.flush_task).take() {
            task.abort();
        }
        self.inner.flush();
        lock(&self.inner.buckets).clear();
    }

    /// Start timing one operation.
    pub fn begin_op(&self, resource: &str, op_type: OpType, size: u64) -> OpHandle {
        if !self.is_enabled() {
            return OpHandle { pending: None };
        }
        lock(&self.inner.buckets)
            .entry(resource.to_string())
            .or_insert_with(|| OpenBucket::new(Instant::now()));
        OpHandle {
            pending: Some(PendingOp {
                monitor: self.inner.clone(),
                resource: resource.to_string(),
                op_type,
                size,
                started: Instant::now(),
            }),
        }
    }

    /// Finalize all open buckets into the sink and reopen them empty.
    /// Returns the number of buckets emitted.
    pub fn flush(&self) -> usize {
        self.inner.flush()
    }

    /// Number of resources with an open bucket.
    pub fn open_buckets(&self) -> usize {
        lock(&self.inner.buckets).len()
    }
}

struct PendingOp {
    monitor: Arc<MonitorInner>,
    resource: String,
    op_type: OpType,
    size: u64,
    started: Instant,
}

/// In-flight operation. Dropping without `end` discards the measurement.
#[must_use = "call end() when the operation completes"]
pub struct OpHandle {
    pending: Option<PendingOp>,
}

impl OpHandle {
    pub fn is_noop(&self) -> bool {
        self.pending.is_none()
    }

    pub fn end(self) {
        if let Some(op) = self.pending {
            let elapsed = op.started.elapsed();
            op.monitor.record(&op.resource, op.op_type, op.size, elapsed);
        }
    }
}

fn wall_clock_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
