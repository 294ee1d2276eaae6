// Call tracing
// Span bookkeeping for causal call chains across instances

use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use tracing::debug;
use uuid::Uuid;

use crate::models::{CallSpan, SpanStatus};

/// Open spans by id plus a bounded ring of finished ones
///
/// Both sides hold at most `capacity` spans; opening a span past that closes
/// the oldest open one as abandoned.
#[derive(Debug)]
pub struct TracingManager {
    capacity: usize,
    active: HashMap<String, CallSpan>,
    completed: VecDeque<CallSpan>,
    next_sequence: u64,
    total_spans: u64,
}

impl TracingManager {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            active: HashMap::new(),
            completed: VecDeque::new(),
            next_sequence: 0,
            total_spans: 0,
        }
    }

    /// Open a span
    ///
    /// Without an explicit `trace_id` the span joins its parent's trace, or
    /// starts a new one when it has no known parent.
    pub fn create_span(
        &mut self,
        operation_name: &str,
        instance_id: &str,
        trace_id: Option<&str>,
        parent_span_id: Option<&str>,
    ) -> CallSpan {
        let trace_id = trace_id
            .map(str::to_string)
            .or_else(|| {
                parent_span_id
                    .and_then(|parent| self.get_span(parent))
                    .map(|parent| parent.trace_id)
            })
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let span = CallSpan {
            span_id: Uuid::new_v4().to_string(),
            trace_id,
            parent_span_id: parent_span_id.map(str::to_string),
            operation_name: operation_name.to_string(),
            instance_id: instance_id.to_string(),
            start_time: Utc::now(),
            end_time: None,
            duration_ms: None,
            status: None,
            error: None,
            tags: HashMap::new(),
            sequence: self.next_sequence,
        };
        self.next_sequence += 1;
        self.total_spans += 1;
        if self.active.len() >= self.capacity {
            self.evict_oldest_active();
        }
        self.active.insert(span.span_id.clone(), span.clone());
        span
    }

    /// Close the longest-open span as abandoned so `active` stays bounded
    fn evict_oldest_active(&mut self) {
        let oldest = self
            .active
            .values()
            .min_by_key(|s| s.sequence)
            .map(|s| s.span_id.clone());
        if let Some(span_id) = oldest {
            debug!("Span {} never finished, closing it as abandoned", span_id);
            self.finish_span(&span_id, SpanStatus::Error, Some("abandoned".to_string()));
        }
    }

    /// Close an open span; `None` if it is unknown or already finished
    pub fn finish_span(
        &mut self,
        span_id: &str,
        status: SpanStatus,
        error: Option<String>,
    ) -> Option<CallSpan> {
        let mut span = self.active.remove(span_id)?;
        let end = Utc::now();
        span.duration_ms = Some((end - span.start_time).num_microseconds().unwrap_or(0) as f64 / 1000.0);
        span.end_time = Some(end);
        span.status = Some(status);
        span.error = error;

        if self.completed.len() == self.capacity {
            self.completed.pop_front();
        }
        self.completed.push_back(span.clone());
        Some(span)
    }

    pub fn tag_span(&mut self, span_id: &str, key: &str, value: &str) -> bool {
        match self.active.get_mut(span_id) {
            Some(span) => {
                span.tags.insert(key.to_string(), value.to_string());
                true
            }
            None => false,
        }
    }

    pub fn get_span(&self, span_id: &str) -> Option<CallSpan> {
        self.active
            .get(span_id)
            .or_else(|| self.completed.iter().rev().find(|s| s.span_id == span_id))
            .cloned()
    }

    /// Every span of a trace, open or finished, in start order
    pub fn get_trace(&self, trace_id: &str) -> Vec<CallSpan> {
        let mut spans: Vec<CallSpan> = self
            .active
            .values()
            .chain(self.completed.iter())
            .filter(|s| s.trace_id == trace_id)
            .cloned()
            .collect();
        spans.sort_by(|a, b| {
            a.start_time
                .cmp(&b.start_time)
                .then(a.sequence.cmp(&b.sequence))
        });
        spans
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn total_spans(&self) -> u64 {
        self.total_spans
    }
}
