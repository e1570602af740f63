use chrono::{DateTime, Utc};
use hdrhistogram::Histogram;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

use super::threshold::ThresholdOutcome;
use super::{quantile_ms, RequestStats, StatsAggregator, Tags};
use crate::engine::control::AbortReason;
use crate::engine::executor::ExecutorOutcome;

/// Exit status of a run whose thresholds failed.
pub const THRESHOLD_FAILURE_EXIT: i32 = 99;

fn ms(d: Duration) -> f64 {
    d.as_micros() as f64 / 1000.0
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct TrendReport {
    pub count: u64,
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub p50_ms: f64,
    pub p90_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

impl TrendReport {
    fn new(hist: &Histogram<u64>, total: Duration) -> Self {
        let count = hist.len();
        if count == 0 {
            return Self::default();
        }
        Self {
            count,
            avg_ms: ms(total) / count as f64,
            min_ms: hist.min() as f64 / 1000.0,
            max_ms: hist.max() as f64 / 1000.0,
            p50_ms: quantile_ms(hist, 0.5),
            p90_ms: quantile_ms(hist, 0.9),
            p95_ms: quantile_ms(hist, 0.95),
            p99_ms: quantile_ms(hist, 0.99),
        }
    }

    /// Like `new`, with exact extremes instead of histogram buckets.
    fn exact(
        hist: &Histogram<u64>,
        total: Duration,
        min: Option<Duration>,
        max: Duration,
    ) -> Self {
        let mut trend = Self::new(hist, total);
        if trend.count > 0 {
            trend.min_ms = min.map(ms).unwrap_or_default();
            trend.max_ms = ms(max);
        }
        trend
    }
}

/// One request series, i.e. one endpoint name under one tag set.
#[derive(Debug, Clone, Serialize)]
pub struct SeriesReport {
    pub tags: Tags,
    pub total_requests: usize,
    pub failed_requests: usize,
    pub duration: TrendReport,
    pub avg_waiting_ms: f64,
    pub avg_receiving_ms: f64,
    pub avg_response_size: f64,
    pub data_sent: u64,
}

impl From<&RequestStats> for SeriesReport {
    fn from(stats: &RequestStats) -> Self {
        let count = stats.total_requests.max(1) as f64;
        Self {
            tags: stats.tags.clone(),
            total_requests: stats.total_requests,
            failed_requests: stats.failed_requests,
            duration: TrendReport::exact(
                &stats.histogram,
                stats.total_duration,
                stats.min_duration,
                stats.max_duration,
            ),
            avg_waiting_ms: ms(stats.total_waiting) / count,
            avg_receiving_ms: ms(stats.total_receiving) / count,
            avg_response_size: stats.total_response_size as f64 / count,
            data_sent: stats.total_request_size,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CheckReport {
    pub passes: usize,
    pub fails: usize,
    pub rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    #[serde(flatten)]
    pub executor: ExecutorOutcome,
    pub iterations: usize,
    pub failed_iterations: usize,
    pub interrupted_iterations: usize,
    pub iteration_duration: TrendReport,
}

/// Counts per failure category. Each one is reported on its own line.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct FailureSummary {
    pub check_failures: usize,
    pub request_failures: usize,
    pub dropped_iterations: u64,
    pub vu_shortfall: u64,
    pub threshold_breaches: usize,
}

/// Final, immutable result of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub passed: bool,
    pub aborted: Option<AbortReason>,
    pub total_requests: usize,
    pub failed_requests: usize,
    pub http_req_duration: TrendReport,
    pub status_codes: BTreeMap<u16, usize>,
    pub errors: BTreeMap<String, usize>,
    pub data_sent: u64,
    pub data_received: u64,
    pub requests: BTreeMap<String, SeriesReport>,
    pub checks: BTreeMap<String, CheckReport>,
    pub scenarios: Vec<ScenarioReport>,
    pub thresholds: Vec<ThresholdOutcome>,
    pub failures: FailureSummary,
}

impl RunReport {
    pub fn build(
        started_at: DateTime<Utc>,
        elapsed: Duration,
        stats: &StatsAggregator,
        outcomes: Vec<ExecutorOutcome>,
        thresholds: Vec<ThresholdOutcome>,
        aborted: Option<AbortReason>,
    ) -> Self {
        let checks: BTreeMap<String, CheckReport> = stats
            .checks
            .iter()
            .map(|(name, (total, passes))| {
                let report = CheckReport {
                    passes: *passes,
                    fails: total - passes,
                    rate: if *total > 0 {
                        *passes as f64 / *total as f64
                    } else {
                        0.0
                    },
                };
                (name.clone(), report)
            })
            .collect();

        let scenarios: Vec<ScenarioReport> = outcomes
            .into_iter()
            .map(|executor| {
                let iters = stats.iterations_for(Some(&executor.scenario));
                ScenarioReport {
                    iterations: iters.iterations,
                    failed_iterations: iters.failed_iterations,
                    interrupted_iterations: iters.interrupted_iterations,
                    iteration_duration: TrendReport::new(
                        &iters.iteration_histogram,
                        iters.total_iteration_duration,
                    ),
                    executor,
                }
            })
            .collect();

        let failures = FailureSummary {
            check_failures: checks.values().map(|c| c.fails).sum(),
            request_failures: stats.failed_requests,
            dropped_iterations: scenarios.iter().map(|s| s.executor.dropped_iterations).sum(),
            vu_shortfall: scenarios.iter().map(|s| s.executor.vu_shortfall).sum(),
            threshold_breaches: thresholds.iter().filter(|t| !t.passed).count(),
        };

        Self {
            started_at,
            duration_secs: elapsed.as_secs_f64(),
            passed: failures.threshold_breaches == 0,
            aborted,
            total_requests: stats.total_requests,
            failed_requests: stats.failed_requests,
            http_req_duration: TrendReport::exact(
                &stats.histogram,
                stats.total_duration,
                stats.min_duration,
                stats.max_duration,
            ),
            status_codes: stats.status_codes.iter().map(|(k, v)| (*k, *v)).collect(),
            errors: stats.errors.iter().map(|(k, v)| (k.clone(), *v)).collect(),
            data_sent: stats.total_data_sent,
            data_received: stats.total_data_received,
            requests: stats
                .requests
                .iter()
                .map(|(key, series)| (key.clone(), SeriesReport::from(series)))
                .collect(),
            checks,
            scenarios,
            thresholds,
            failures,
        }
    }

    pub fn exit_code(&self) -> i32 {
        if self.passed {
            0
        } else {
            THRESHOLD_FAILURE_EXIT
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn print_summary(&self) {
        println!("\n--- Test Summary ---");
        println!("Duration:       {:.1}s", self.duration_secs);
        if let Some(reason) = &self.aborted {
            println!("Aborted:        {}", reason);
        }

        if self.total_requests == 0 {
            println!("No requests were made.");
        } else {
            let trend = &self.http_req_duration;
            println!("Total Requests: {}", self.total_requests);
            println!("Failed:         {}", self.failed_requests);
            println!("Avg Latency:    {:.2} ms", trend.avg_ms);
            println!("Min Latency:    {:.2} ms", trend.min_ms);
            println!("Max Latency:    {:.2} ms", trend.max_ms);
            println!("P50 Latency:    {:.2} ms", trend.p50_ms);
            println!("P90 Latency:    {:.2} ms", trend.p90_ms);
            println!("P95 Latency:    {:.2} ms", trend.p95_ms);
            println!("P99 Latency:    {:.2} ms", trend.p99_ms);

            println!("\nStatus Codes:");
            for (code, count) in &self.status_codes {
                println!("  {}: {}", code, count);
            }

            println!("\nData Transfer:");
            println!("  Sent:     {:.2} MB", self.data_sent as f64 / 1_048_576.0);
            println!("  Received: {:.2} MB", self.data_received as f64 / 1_048_576.0);
        }

        if !self.requests.is_empty() {
            println!("\nGrouped Requests:");
            for (key, series) in &self.requests {
                println!("  Request: {}", key);
                println!("    Count: {}", series.total_requests);
                println!("    P95:   {:.2} ms", series.duration.p95_ms);
                if series.failed_requests > 0 {
                    println!("    Failed: {}", series.failed_requests);
                }
            }
        }

        if !self.errors.is_empty() {
            println!("\nErrors:");
            for (err, count) in &self.errors {
                println!("  {}: {}", err, count);
            }
        }

        if !self.checks.is_empty() {
            println!("\nChecks:");
            for (name, check) in &self.checks {
                if check.fails > 0 {
                    println!(
                        "  ✗ {} : {:.2}% ({} passed, {} failed)",
                        name,
                        check.rate * 100.0,
                        check.passes,
                        check.fails
                    );
                } else {
                    println!("  ✓ {} : 100% ({} passed)", name, check.passes);
                }
            }
        }

        println!("\nScenarios:");
        for s in &self.scenarios {
            let e = &s.executor;
            if e.skipped {
                println!("  {} ({}): skipped", e.scenario, e.executor);
                continue;
            }
            println!("  {} ({})", e.scenario, e.executor);
            println!(
                "    Iterations: {} ({} failed, {} interrupted)",
                s.iterations, s.failed_iterations, s.interrupted_iterations
            );
            println!("    Avg Iteration: {:.2} ms", s.iteration_duration.avg_ms);
            println!("    VUs: peak {} / max {}", e.peak_vus, e.max_vus);
            if e.dropped_iterations > 0 {
                println!("    Dropped: {}", e.dropped_iterations);
            }
            if e.force_stopped > 0 {
                println!("    Force-stopped: {}", e.force_stopped);
            }
        }

        if !self.thresholds.is_empty() {
            println!("\nThresholds:");
            for outcome in &self.thresholds {
                println!("  {}", outcome);
            }
        }

        let f = &self.failures;
        println!("\nFailures:");
        println!("  Checks:             {}", f.check_failures);
        println!("  Requests:           {}", f.request_failures);
        println!("  Dropped iterations: {}", f.dropped_iterations);
        println!("  VU shortfall:       {}", f.vu_shortfall);
        println!("  Thresholds:         {}", f.threshold_breaches);

        println!("\nResult: {}", if self.passed { "PASSED" } else { "FAILED" });
        println!("--------------------\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::tests::sample;
    use crate::stats::Metric;
    use std::sync::Arc;

    fn outcome(name: &str, dropped: u64) -> ExecutorOutcome {
        ExecutorOutcome {
            scenario: name.to_string(),
            executor: "constant-arrival-rate",
            dispatched: 10,
            dropped_iterations: dropped,
            vu_shortfall: 0,
            peak_vus: 2,
            max_vus: 2,
            final_vus: 0,
            completed_at_stop: 0,
            force_stopped: 0,
            started_at_secs: 0.0,
            finished_at_secs: 10.0,
            skipped: false,
        }
    }

    fn stats() -> StatsAggregator {
        let mut agg = StatsAggregator::new();
        let scenario: Arc<str> = Arc::from("noise");
        for (ms, status) in [(100, 200), (300, 200), (200, 500)] {
            agg.add(Metric::Request {
                scenario: scenario.clone(),
                sample: sample("list", ms, status),
            });
        }
        agg.add(Metric::Check {
            name: "status is 200".to_string(),
            success: true,
        });
        agg.add(Metric::Check {
            name: "status is 200".to_string(),
            success: false,
        });
        agg
    }

    #[test]
    fn test_report_generation() {
        let report = RunReport::build(
            Utc::now(),
            Duration::from_secs(10),
            &stats(),
            vec![outcome("noise", 3)],
            vec![],
            None,
        );
        assert_eq!(report.total_requests, 3);
        assert_eq!(report.failed_requests, 1);
        assert_eq!(report.http_req_duration.avg_ms, 200.0);
        assert_eq!(report.http_req_duration.min_ms, 100.0);
        assert_eq!(report.http_req_duration.max_ms, 300.0);
        assert_eq!(report.status_codes.get(&500), Some(&1));
        assert_eq!(report.requests.len(), 2);

        let check = &report.checks["status is 200"];
        assert_eq!((check.passes, check.fails), (1, 1));
        assert_eq!(check.rate, 0.5);

        assert_eq!(
            report.failures,
            FailureSummary {
                check_failures: 1,
                request_failures: 1,
                dropped_iterations: 3,
                vu_shortfall: 0,
                threshold_breaches: 0,
            }
        );
        assert!(report.passed);
        assert_eq!(report.exit_code(), 0);

        let json = report.to_json().unwrap();
        assert!(json.contains("\"total_requests\": 3"));
        assert!(json.contains("\"dropped_iterations\": 3"));
        assert!(json.contains("\"executor\": \"constant-arrival-rate\""));
    }

    #[test]
    fn test_threshold_failure_sets_exit_code() {
        let failed = ThresholdOutcome {
            metric: "http_req_duration".to_string(),
            expression: "p(95)<100".to_string(),
            observed: Some(300.0),
            passed: false,
            abort_on_fail: true,
        };
        let report = RunReport::build(
            Utc::now(),
            Duration::from_secs(3),
            &stats(),
            vec![],
            vec![failed],
            Some(AbortReason::ThresholdBreach {
                metric: "http_req_duration".to_string(),
                expression: "p(95)<100".to_string(),
            }),
        );
        assert!(!report.passed);
        assert_eq!(report.exit_code(), THRESHOLD_FAILURE_EXIT);
        assert_eq!(report.failures.threshold_breaches, 1);
        let json = report.to_json().unwrap();
        assert!(json.contains("\"kind\": \"threshold_breach\""));
    }

    #[test]
    fn test_report_empty() {
        let report = RunReport::build(
            Utc::now(),
            Duration::ZERO,
            &StatsAggregator::new(),
            vec![],
            vec![],
            None,
        );
        assert_eq!(report.http_req_duration, TrendReport::default());
        assert!(report.requests.is_empty());
        assert_eq!(report.exit_code(), 0);
    }
}
