use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// One finished operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationRecord {
    pub operation: String,
    pub elapsed_ms: f64,
    pub success: bool,
    pub within_budget: bool,
    pub recorded_at: DateTime<Utc>,
}

/// Aggregate over a window of records.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationSummary {
    pub count: u64,
    pub avg_response_time_ms: f64,
    pub success_rate_percent: f64,
    pub within_budget_rate_percent: f64,
}

impl OperationSummary {
    fn from_records<'a>(records: impl IntoIterator<Item = &'a OperationRecord>) -> Self {
        let mut count = 0u64;
        let mut total_ms = 0.0;
        let mut successes = 0u64;
        let mut within = 0u64;
        for r in records {
            count += 1;
            total_ms += r.elapsed_ms;
            successes += u64::from(r.success);
            within += u64::from(r.within_budget);
        }

        // An empty window reports a perfect score rather than NaN.
        if count == 0 {
            return Self {
                count: 0,
                avg_response_time_ms: 0.0,
                success_rate_percent: 100.0,
                within_budget_rate_percent: 100.0,
            };
        }

        let n = count as f64;
        Self {
            count,
            avg_response_time_ms: round2(total_ms / n),
            success_rate_percent: round2(successes as f64 / n * 100.0),
            within_budget_rate_percent: round2(within as f64 / n * 100.0),
        }
    }
}

/// Snapshot returned by `getMetrics(limit)`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub operations: BTreeMap<String, OperationSummary>,
    pub recent: Vec<OperationRecord>,
    pub total_operations: u64,
    pub latency_budget_ms: u64,
}

/// Bounded in-process log of operation latencies.
///
/// Latency is measured against an advisory budget; exceeding it only flips
/// `within_budget` on the record, it never fails the operation.
#[derive(Debug)]
pub struct MetricsRecorder {
    records: Mutex<VecDeque<OperationRecord>>,
    retention: usize,
    total: AtomicU64,
    budget: Duration,
}

impl MetricsRecorder {
    pub fn new(budget: Duration, retention: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::with_capacity(retention.min(1024))),
            retention: retention.max(1),
            total: AtomicU64::new(0),
            budget,
        }
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    pub fn within_budget(&self, elapsed: Duration) -> bool {
        elapsed <= self.budget
    }

    pub fn record(&self, operation: &str, elapsed: Duration, success: bool) -> OperationRecord {
        let record = OperationRecord {
            operation: operation.to_string(),
            elapsed_ms: round2(elapsed.as_secs_f64() * 1000.0),
            success,
            within_budget: self.within_budget(elapsed),
            recorded_at: Utc::now(),
        };

        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        if records.len() == self.retention {
            records.pop_front();
        }
        records.push_back(record.clone());
        self.total.fetch_add(1, Ordering::Relaxed);

        record
    }

    /// The last `limit` records, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<OperationRecord> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let skip = records.len().saturating_sub(limit);
        records.iter().skip(skip).cloned().collect()
    }

    /// Summary across every operation kind over the last `limit` records.
    pub fn overall(&self, limit: usize) -> OperationSummary {
        OperationSummary::from_records(&self.recent(limit))
    }

    pub fn snapshot(&self, limit: usize) -> MetricsSnapshot {
        let recent = self.recent(limit);

        let mut by_operation: BTreeMap<String, Vec<&OperationRecord>> = BTreeMap::new();
        for r in &recent {
            by_operation.entry(r.operation.clone()).or_default().push(r);
        }
        let operations = by_operation
            .into_iter()
            .map(|(op, records)| (op, OperationSummary::from_records(records)))
            .collect();

        MetricsSnapshot {
            operations,
            recent,
            total_operations: self.total.load(Ordering::Relaxed),
            latency_budget_ms: self.budget.as_millis() as u64,
        }
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}
