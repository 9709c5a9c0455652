//! Metrics Monitor (C6): wraps forwarding to record per-request timing and
//! token-usage counters into a bounded in-memory ring.
//!
//! Grounded on `proxy/count_tokens.rs` (bounded state behind a single
//! `Mutex`, `Instant`-based bookkeeping) and `proxy/sse/mod.rs`'s streamed
//! accumulation, generalized via [`crate::sse`] to OpenAI-dialect usage
//! objects.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::sse::TokenUsage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Success,
    ClientError,
    UpstreamError,
}

#[derive(Debug, Clone)]
pub struct MetricsRecord {
    pub model_id: String,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub first_byte: Option<Duration>,
    pub response_bytes: u64,
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub status: RequestStatus,
}

/// Bounded FIFO ring of completed-request rows. Contention is a single
/// mutex, matching spec.md §4.6's explicit note.
pub struct MetricsMonitor {
    capacity: usize,
    ring: Mutex<VecDeque<MetricsRecord>>,
}

impl MetricsMonitor {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            ring: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn record(&self, record: MetricsRecord) {
        let mut ring = self.ring.lock().unwrap();
        if ring.len() >= self.capacity {
            ring.pop_front();
        }
        ring.push_back(record);
    }

    pub fn snapshot(&self) -> Vec<MetricsRecord> {
        self.ring.lock().unwrap().iter().cloned().collect()
    }
}

/// Tracks one in-flight request's timing so a handler can report the final
/// row once forwarding completes (or fails).
pub struct RequestTimer {
    model_id: String,
    start: Instant,
    started_at: DateTime<Utc>,
    first_byte: Option<Instant>,
}

impl RequestTimer {
    pub fn start(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            start: Instant::now(),
            started_at: Utc::now(),
            first_byte: None,
        }
    }

    pub fn mark_first_byte(&mut self) {
        if self.first_byte.is_none() {
            self.first_byte = Some(Instant::now());
        }
    }

    pub fn finish(
        self,
        response_bytes: u64,
        usage: Option<TokenUsage>,
        status: RequestStatus,
    ) -> MetricsRecord {
        MetricsRecord {
            model_id: self.model_id,
            started_at: self.started_at,
            duration: self.start.elapsed(),
            first_byte: self.first_byte.map(|t| t - self.start),
            response_bytes,
            prompt_tokens: usage.map(|u| u.prompt_tokens),
            completion_tokens: usage.map(|u| u.completion_tokens),
            status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_oldest_past_capacity() {
        let monitor = MetricsMonitor::new(2);
        for i in 0..3 {
            let timer = RequestTimer::start(format!("m{i}"));
            monitor.record(timer.finish(0, None, RequestStatus::Success));
        }
        let snap = monitor.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[0].model_id, "m1");
        assert_eq!(snap[1].model_id, "m2");
    }

    #[test]
    fn finish_carries_usage() {
        let timer = RequestTimer::start("m1");
        let usage = TokenUsage {
            prompt_tokens: 10,
            completion_tokens: 4,
        };
        let record = timer.finish(128, Some(usage), RequestStatus::Success);
        assert_eq!(record.prompt_tokens, Some(10));
        assert_eq!(record.completion_tokens, Some(4));
    }
}
