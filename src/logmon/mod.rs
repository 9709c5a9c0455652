//! Log Monitor
//!
//! A bounded, sequenced ring of captured log lines with live subscriptions.
//! Generalizes the teacher's `logging::LogBuffer` (which only ever captured
//! this process's own `tracing` events for the TUI) to "capture a
//! subprocess's stdout/stderr, or mux together other monitors" — the same
//! ring-with-eviction and non-blocking-subscriber discipline, wider input.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

const DEFAULT_CAPACITY: usize = 1000;
const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn from_line(line: &str) -> Self {
        let lower = line.to_ascii_lowercase();
        if lower.contains("error") {
            LogLevel::Error
        } else if lower.contains("warn") {
            LogLevel::Warn
        } else if lower.contains("debug") {
            LogLevel::Debug
        } else {
            LogLevel::Info
        }
    }
}

/// One captured line, stamped with a monotonic sequence number so
/// subscribers can resume from a cursor after reconnecting.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub source: String,
    pub line: String,
}

/// Where captured lines ultimately go, beyond the in-memory ring.
pub trait Sink: Send + Sync {
    fn write_line(&self, source: &str, line: &str);
}

/// Mirrors a line to this process's own stdout, `[source]`-prefixed —
/// the "tee child output to the supervisor's own terminal" habit most
/// process supervisors default to.
pub struct StdoutSink;

impl Sink for StdoutSink {
    fn write_line(&self, source: &str, line: &str) {
        println!("[{source}] {line}");
    }
}

/// Drops everything. Used in tests and whenever a quiet monitor is wanted.
pub struct DiscardSink;

impl Sink for DiscardSink {
    fn write_line(&self, _source: &str, _line: &str) {}
}

struct Inner {
    ring: Mutex<VecDeque<LogRecord>>,
    capacity: usize,
    next_seq: AtomicU64,
    subscribers: Mutex<Vec<Subscriber>>,
    sink: Box<dyn Sink>,
}

struct Subscriber {
    min_level: LogLevel,
    tx: mpsc::Sender<LogRecord>,
}

/// A bounded ring of log records with live, filterable subscriptions.
///
/// Multiple monitors can be composed by giving one monitor's `write` calls
/// as another monitor's [`Sink`] (see [`MonitorSink`]) — spec.md §4.1's
/// "proxy, upstream, mux" composition.
pub struct LogMonitor {
    inner: std::sync::Arc<Inner>,
}

impl Clone for LogMonitor {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Live view onto a [`LogMonitor`], usable as another monitor's sink.
pub struct MonitorSink(LogMonitor);

impl Sink for MonitorSink {
    fn write_line(&self, source: &str, line: &str) {
        self.0.write(source, line.as_bytes());
    }
}

impl LogMonitor {
    pub fn new(sink: Box<dyn Sink>) -> Self {
        Self::with_capacity(sink, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(sink: Box<dyn Sink>, capacity: usize) -> Self {
        Self {
            inner: std::sync::Arc::new(Inner {
                ring: Mutex::new(VecDeque::with_capacity(capacity)),
                capacity,
                next_seq: AtomicU64::new(0),
                subscribers: Mutex::new(Vec::new()),
                sink,
            }),
        }
    }

    /// A sink that forwards into this monitor, for composing monitors.
    pub fn as_sink(&self) -> MonitorSink {
        MonitorSink(self.clone())
    }

    /// Append bytes, splitting on `\n`. Each resulting non-empty line is
    /// stamped with the next sequence number and pushed into the ring,
    /// evicting the oldest entry on overflow, then mirrored to the sink and
    /// fanned out to live subscribers.
    pub fn write(&self, source: &str, bytes: &[u8]) {
        let text = String::from_utf8_lossy(bytes);
        for line in text.split('\n') {
            if line.is_empty() {
                continue;
            }
            self.push_line(source, line);
        }
    }

    fn push_line(&self, source: &str, line: &str) {
        let seq = self.inner.next_seq.fetch_add(1, Ordering::SeqCst);
        let record = LogRecord {
            seq,
            timestamp: Utc::now(),
            level: LogLevel::from_line(line),
            source: source.to_string(),
            line: line.to_string(),
        };

        {
            let mut ring = self.inner.ring.lock().unwrap();
            if ring.len() >= self.inner.capacity {
                ring.pop_front();
            }
            ring.push_back(record.clone());
        }

        self.inner.sink.write_line(source, line);

        let mut subs = self.inner.subscribers.lock().unwrap();
        subs.retain(|sub| {
            if record.level < sub.min_level {
                return true;
            }
            match sub.tx.try_send(record.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::debug!(source, "log subscriber queue full, dropping record");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    /// Currently retained records with `seq >= from_seq`.
    pub fn snapshot(&self, from_seq: u64, min_level: LogLevel) -> Vec<LogRecord> {
        self.inner
            .ring
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.seq >= from_seq && r.level >= min_level)
            .cloned()
            .collect()
    }

    /// Register a bounded channel that receives records with `seq >=
    /// from_seq` as they're written. Never blocks the writer: a full queue
    /// silently drops the new record rather than stalling ingestion.
    pub fn subscribe(&self, from_seq: u64, min_level: LogLevel) -> mpsc::Receiver<LogRecord> {
        let (tx, rx) = mpsc::channel(DEFAULT_SUBSCRIBER_CAPACITY);

        let backlog = self.snapshot(from_seq, min_level);
        for record in backlog {
            let _ = tx.try_send(record);
        }

        self.inner.subscribers.lock().unwrap().push(Subscriber { min_level, tx });
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_oldest_past_capacity() {
        let mon = LogMonitor::with_capacity(Box::new(DiscardSink), 2);
        mon.write("m1", b"one\n");
        mon.write("m1", b"two\n");
        mon.write("m1", b"three\n");
        let snap = mon.snapshot(0, LogLevel::Debug);
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[0].line, "two");
        assert_eq!(snap[1].line, "three");
    }

    #[test]
    fn sequence_numbers_monotonic() {
        let mon = LogMonitor::with_capacity(Box::new(DiscardSink), 10);
        mon.write("m1", b"a\nb\nc\n");
        let snap = mon.snapshot(0, LogLevel::Debug);
        let seqs: Vec<u64> = snap.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn subscriber_receives_new_records() {
        let mon = LogMonitor::with_capacity(Box::new(DiscardSink), 10);
        let mut rx = mon.subscribe(0, LogLevel::Debug);
        mon.write("m1", b"hello\n");
        let record = rx.recv().await.unwrap();
        assert_eq!(record.line, "hello");
    }

    #[test]
    fn level_filter_excludes_below_minimum() {
        let mon = LogMonitor::with_capacity(Box::new(DiscardSink), 10);
        mon.write("m1", b"plain info line\n");
        mon.write("m1", b"an ERROR occurred\n");
        let snap = mon.snapshot(0, LogLevel::Error);
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].line, "an ERROR occurred");
    }

    #[test]
    fn composed_monitor_forwards_lines() {
        let upstream = LogMonitor::with_capacity(Box::new(DiscardSink), 10);
        let mux = LogMonitor::with_capacity(Box::new(upstream.as_sink()), 10);
        mux.write("proxy", b"line one\n");
        assert_eq!(upstream.snapshot(0, LogLevel::Debug).len(), 1);
        assert_eq!(mux.snapshot(0, LogLevel::Debug).len(), 1);
    }
}
