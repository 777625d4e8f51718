use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use opsdesk_core::domain::RequestMetrics;
use serde::Serialize;
use tracing::info;

const RECENT_WINDOW: usize = 100;

pub trait MetricsSink: Send + Sync {
    fn record(&self, metrics: &RequestMetrics);
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ToolUsage {
    pub name: String,
    pub count: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub total_requests: u64,
    pub truncations: u64,
    pub truncation_rate: f64,
    pub limit_hits: u64,
    pub limit_hit_rate: f64,
    pub errors: u64,
    pub avg_response_ms: f64,
    pub tool_usage: Vec<ToolUsage>,
}

#[derive(Default)]
struct Counters {
    total: u64,
    truncations: u64,
    limit_hits: u64,
    errors: u64,
    recent_durations_ms: VecDeque<u64>,
    tool_usage: HashMap<String, u64>,
}

/// Process-wide rolling counters. Logs a rollup every `rollup_interval` requests
/// and on every limit hit.
pub struct MetricsRecorder {
    rollup_interval: u64,
    counters: Mutex<Counters>,
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new(10)
    }
}

impl MetricsRecorder {
    pub fn new(rollup_interval: u64) -> Self {
        Self { rollup_interval: rollup_interval.max(1), counters: Mutex::new(Counters::default()) }
    }

    /// Records one request; returns the snapshot when a rollup was emitted.
    pub fn observe(&self, metrics: &RequestMetrics) -> Option<StatsSnapshot> {
        let snapshot = {
            let mut counters = match self.counters.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            counters.total += 1;
            if metrics.truncated {
                counters.truncations += 1;
            }
            if metrics.limit_hit {
                counters.limit_hits += 1;
            }
            if metrics.error {
                counters.errors += 1;
            }
            if counters.recent_durations_ms.len() == RECENT_WINDOW {
                counters.recent_durations_ms.pop_front();
            }
            counters.recent_durations_ms.push_back(metrics.duration_ms());
            for tool in &metrics.tools_used {
                *counters.tool_usage.entry(tool.clone()).or_insert(0) += 1;
            }

            let due = counters.total % self.rollup_interval == 0 || metrics.limit_hit;
            due.then(|| snapshot_of(&counters))
        };

        if let Some(stats) = &snapshot {
            info!(
                event_name = "agent.metrics.rollup",
                total_requests = stats.total_requests,
                truncations = stats.truncations,
                truncation_rate = stats.truncation_rate,
                limit_hits = stats.limit_hits,
                limit_hit_rate = stats.limit_hit_rate,
                errors = stats.errors,
                avg_response_ms = stats.avg_response_ms,
                top_tools = ?stats.tool_usage.iter().take(5).map(|usage| (&usage.name, usage.count)).collect::<Vec<_>>(),
                "request metrics rollup"
            );
        }

        snapshot
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let counters = match self.counters.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        snapshot_of(&counters)
    }
}

impl MetricsSink for MetricsRecorder {
    fn record(&self, metrics: &RequestMetrics) {
        self.observe(metrics);
    }
}

fn snapshot_of(counters: &Counters) -> StatsSnapshot {
    let rate = |count: u64| {
        if counters.total == 0 {
            0.0
        } else {
            count as f64 / counters.total as f64
        }
    };
    let avg_response_ms = if counters.recent_durations_ms.is_empty() {
        0.0
    } else {
        counters.recent_durations_ms.iter().sum::<u64>() as f64
            / counters.recent_durations_ms.len() as f64
    };

    let mut tool_usage = counters
        .tool_usage
        .iter()
        .map(|(name, count)| ToolUsage { name: name.clone(), count: *count })
        .collect::<Vec<_>>();
    tool_usage.sort_by(|left, right| right.count.cmp(&left.count).then_with(|| left.name.cmp(&right.name)));

    StatsSnapshot {
        total_requests: counters.total,
        truncations: counters.truncations,
        truncation_rate: rate(counters.truncations),
        limit_hits: counters.limit_hits,
        limit_hit_rate: rate(counters.limit_hits),
        errors: counters.errors,
        avg_response_ms,
        tool_usage,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use opsdesk_core::domain::RequestMetrics;

    use super::MetricsRecorder;

    fn request(ms: u64, tools: &[&str], truncated: bool, limit_hit: bool) -> RequestMetrics {
        RequestMetrics {
            duration: Duration::from_millis(ms),
            tools_used: tools.iter().map(|tool| tool.to_string()).collect(),
            truncated,
            limit_hit,
            error: false,
        }
    }

    #[test]
    fn snapshot_reports_rates_and_sorted_tool_usage() {
        let recorder = MetricsRecorder::new(10);
        recorder.observe(&request(100, &["search_logs", "list_alarms"], true, false));
        recorder.observe(&request(300, &["search_logs"], false, false));

        let stats = recorder.snapshot();
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.truncations, 1);
        assert!((stats.truncation_rate - 0.5).abs() < f64::EPSILON);
        assert!((stats.avg_response_ms - 200.0).abs() < f64::EPSILON);
        assert_eq!(stats.tool_usage[0].name, "search_logs");
        assert_eq!(stats.tool_usage[0].count, 2);
    }

    #[test]
    fn rollup_fires_every_interval_and_on_limit_hits() {
        let recorder = MetricsRecorder::new(3);
        assert!(recorder.observe(&request(1, &[], false, false)).is_none());
        assert!(recorder.observe(&request(1, &[], false, true)).is_some());
        assert!(recorder.observe(&request(1, &[], false, false)).is_some());
        assert!(recorder.observe(&request(1, &[], false, false)).is_none());
    }

    #[test]
    fn average_covers_only_the_recent_window() {
        let recorder = MetricsRecorder::new(1_000);
        recorder.observe(&request(10_000, &[], false, false));
        for _ in 0..100 {
            recorder.observe(&request(10, &[], false, false));
        }
        assert!((recorder.snapshot().avg_response_ms - 10.0).abs() < f64::EPSILON);
    }
}
