use serde::Serialize;
use std::fmt;
use std::time::Duration;

use crate::engine::control::{AbortReason, ControlState};
use crate::error::ConfigError;
use crate::stats::{quantile_ms, StatsAggregator, Tags};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MetricKind {
    HttpReqDuration,
    HttpReqFailed,
    HttpReqs,
    Checks,
    IterationDuration,
    Iterations,
    DroppedIterations,
    DataSent,
    DataReceived,
}

impl MetricKind {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "http_req_duration" => MetricKind::HttpReqDuration,
            "http_req_failed" => MetricKind::HttpReqFailed,
            "http_reqs" => MetricKind::HttpReqs,
            "checks" => MetricKind::Checks,
            "iteration_duration" => MetricKind::IterationDuration,
            "iterations" => MetricKind::Iterations,
            "dropped_iterations" => MetricKind::DroppedIterations,
            "data_sent" => MetricKind::DataSent,
            "data_received" => MetricKind::DataReceived,
            _ => return None,
        })
    }

    fn is_trend(self) -> bool {
        matches!(
            self,
            MetricKind::HttpReqDuration | MetricKind::IterationDuration
        )
    }

    fn is_rate(self) -> bool {
        matches!(self, MetricKind::HttpReqFailed | MetricKind::Checks)
    }

    fn filterable(self, key: &str) -> bool {
        match self {
            MetricKind::HttpReqDuration
            | MetricKind::HttpReqFailed
            | MetricKind::HttpReqs
            | MetricKind::DataSent
            | MetricKind::DataReceived => true,
            MetricKind::IterationDuration
            | MetricKind::Iterations
            | MetricKind::DroppedIterations => key == "scenario",
            MetricKind::Checks => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Aggregation {
    Percentile(f64),
    Avg,
    Min,
    Max,
    Med,
    Count,
    Rate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl Operator {
    fn holds(self, actual: f64, bound: f64) -> bool {
        match self {
            Operator::Lt => actual < bound,
            Operator::Le => actual <= bound,
            Operator::Gt => actual > bound,
            Operator::Ge => actual >= bound,
            Operator::Eq => (actual - bound).abs() < f64::EPSILON,
            Operator::Ne => (actual - bound).abs() >= f64::EPSILON,
        }
    }
}

/// A pass/fail criterion such as `http_req_duration{endpoint:analyze}: p(95)<1500`.
#[derive(Debug, Clone)]
pub struct Threshold {
    /// Metric as written, tag filter included.
    pub metric: String,
    pub expression: String,
    pub abort_on_fail: bool,
    pub delay_abort_eval: Duration,
    kind: MetricKind,
    filter: Tags,
    aggregation: Aggregation,
    operator: Operator,
    bound: f64,
}

/// Result of evaluating one threshold against a snapshot.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ThresholdOutcome {
    pub metric: String,
    pub expression: String,
    /// `None` when the metric has no samples yet.
    pub observed: Option<f64>,
    pub passed: bool,
    pub abort_on_fail: bool,
}

impl fmt::Display for ThresholdOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mark = if self.passed { "✓" } else { "✗" };
        match self.observed {
            Some(v) => write!(f, "{} {}: {} (actual: {:.2})", mark, self.metric, self.expression, v),
            None => write!(f, "{} {}: {} (no data)", mark, self.metric, self.expression),
        }
    }
}

fn parse_metric(metric: &str) -> Option<(&str, Tags)> {
    let metric = metric.trim();
    let Some(open) = metric.find('{') else {
        return Some((metric, Tags::new()));
    };
    let inner = metric[open + 1..].strip_suffix('}')?;
    let mut filter = Tags::new();
    for pair in inner.split(',').filter(|p| !p.trim().is_empty()) {
        let (k, v) = pair.split_once(':')?;
        filter.insert(k.trim().to_string(), v.trim().to_string());
    }
    Some((metric[..open].trim(), filter))
}

fn parse_aggregation(raw: &str) -> Option<Aggregation> {
    let raw = raw.trim();
    Some(match raw {
        "avg" => Aggregation::Avg,
        "min" => Aggregation::Min,
        "max" => Aggregation::Max,
        "med" => Aggregation::Med,
        "count" => Aggregation::Count,
        "rate" => Aggregation::Rate,
        _ => {
            let p = raw
                .strip_prefix("p(")
                .and_then(|r| r.strip_suffix(')'))
                .or_else(|| raw.strip_prefix('p'))?;
            let p: f64 = p.trim().parse().ok()?;
            if !(0.0..=100.0).contains(&p) {
                return None;
            }
            Aggregation::Percentile(p)
        }
    })
}

fn split_operator(expr: &str) -> Option<(&str, Operator, &str)> {
    const OPERATORS: [(&str, Operator); 6] = [
        ("<=", Operator::Le),
        (">=", Operator::Ge),
        ("==", Operator::Eq),
        ("!=", Operator::Ne),
        ("<", Operator::Lt),
        (">", Operator::Gt),
    ];
    OPERATORS.iter().find_map(|(token, op)| {
        expr.find(token)
            .map(|at| (&expr[..at], *op, &expr[at + token.len()..]))
    })
}

/// Bounds on trends are milliseconds; `s` and `ms` suffixes are accepted.
fn parse_bound(raw: &str, trend: bool) -> Option<f64> {
    let raw = raw.trim();
    if trend {
        if let Some(ms) = raw.strip_suffix("ms") {
            return ms.trim().parse().ok();
        }
        if let Some(s) = raw.strip_suffix('s') {
            return s.trim().parse::<f64>().ok().map(|s| s * 1000.0);
        }
    }
    raw.parse().ok()
}

impl Threshold {
    pub fn parse(
        metric: &str,
        expression: &str,
        abort_on_fail: bool,
        delay_abort_eval: Duration,
    ) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidThreshold {
            metric: metric.to_string(),
            expression: expression.to_string(),
            reason: reason.to_string(),
        };

        let (name, filter) = parse_metric(metric).ok_or_else(|| invalid("malformed tag filter"))?;
        let kind = MetricKind::from_name(name).ok_or_else(|| invalid("unknown metric"))?;
        if let Some(key) = filter.keys().find(|k| !kind.filterable(k)) {
            return Err(invalid(&format!("metric cannot be filtered by `{}`", key)));
        }

        let (lhs, operator, rhs) =
            split_operator(expression).ok_or_else(|| invalid("missing comparison operator"))?;
        let aggregation = parse_aggregation(lhs).ok_or_else(|| invalid("unknown aggregation"))?;
        let allowed = match aggregation {
            Aggregation::Percentile(_)
            | Aggregation::Avg
            | Aggregation::Min
            | Aggregation::Max
            | Aggregation::Med => kind.is_trend(),
            Aggregation::Count => true,
            Aggregation::Rate => !kind.is_trend(),
        };
        if !allowed {
            return Err(invalid("aggregation does not apply to this metric"));
        }
        let bound = parse_bound(rhs, kind.is_trend()).ok_or_else(|| invalid("bad threshold value"))?;

        Ok(Self {
            metric: metric.trim().to_string(),
            expression: expression.trim().to_string(),
            abort_on_fail,
            delay_abort_eval,
            kind,
            filter,
            aggregation,
            operator,
            bound,
        })
    }

    /// Current value of the threshold's aggregation, `None` without samples.
    /// `elapsed` turns counters into per-second rates.
    pub fn observe(&self, stats: &StatsAggregator, elapsed: Duration) -> Option<f64> {
        let per_second = |count: f64| count / elapsed.as_secs_f64().max(f64::MIN_POSITIVE);
        let scenario = self.filter.get("scenario").map(String::as_str);

        match self.kind {
            MetricKind::HttpReqDuration => {
                let reqs = stats.requests_matching(&self.filter);
                if reqs.total_requests == 0 {
                    return None;
                }
                let n = reqs.total_requests as f64;
                Some(match self.aggregation {
                    Aggregation::Percentile(p) => quantile_ms(&reqs.histogram, p / 100.0),
                    Aggregation::Med => quantile_ms(&reqs.histogram, 0.5),
                    Aggregation::Avg => reqs.total_duration.as_secs_f64() * 1000.0 / n,
                    Aggregation::Min => {
                        reqs.min_duration.unwrap_or_default().as_secs_f64() * 1000.0
                    }
                    Aggregation::Max => reqs.max_duration.as_secs_f64() * 1000.0,
                    Aggregation::Count | Aggregation::Rate => n,
                })
            }
            MetricKind::IterationDuration => {
                let iters = stats.iterations_for(scenario);
                let h = &iters.iteration_histogram;
                if h.is_empty() {
                    return None;
                }
                let n = h.len() as f64;
                Some(match self.aggregation {
                    Aggregation::Percentile(p) => quantile_ms(h, p / 100.0),
                    Aggregation::Med => quantile_ms(h, 0.5),
                    Aggregation::Avg => iters.total_iteration_duration.as_secs_f64() * 1000.0 / n,
                    Aggregation::Min => h.min() as f64 / 1000.0,
                    Aggregation::Max => h.max() as f64 / 1000.0,
                    Aggregation::Count | Aggregation::Rate => n,
                })
            }
            MetricKind::HttpReqFailed => {
                let reqs = stats.requests_matching(&self.filter);
                if reqs.total_requests == 0 {
                    return None;
                }
                Some(match self.aggregation {
                    Aggregation::Count => reqs.failed_requests as f64,
                    _ => reqs.failed_requests as f64 / reqs.total_requests as f64,
                })
            }
            MetricKind::Checks => {
                let (total, passes) = stats.check_totals();
                if total == 0 {
                    return None;
                }
                Some(match self.aggregation {
                    Aggregation::Count => total as f64,
                    _ => passes as f64 / total as f64,
                })
            }
            MetricKind::HttpReqs | MetricKind::DataSent | MetricKind::DataReceived => {
                let reqs = stats.requests_matching(&self.filter);
                if reqs.total_requests == 0 {
                    return None;
                }
                let count = match self.kind {
                    MetricKind::DataSent => reqs.total_request_size as f64,
                    MetricKind::DataReceived => reqs.total_response_size as f64,
                    _ => reqs.total_requests as f64,
                };
                Some(self.counter(count, per_second))
            }
            MetricKind::Iterations | MetricKind::DroppedIterations => {
                let iters = stats.iterations_for(scenario);
                let count = if self.kind == MetricKind::Iterations {
                    iters.iterations
                } else {
                    iters.dropped_iterations
                };
                if count == 0 {
                    return None;
                }
                Some(self.counter(count as f64, per_second))
            }
        }
    }

    fn counter(&self, count: f64, per_second: impl Fn(f64) -> f64) -> f64 {
        if self.aggregation == Aggregation::Rate && !self.kind.is_rate() {
            per_second(count)
        } else {
            count
        }
    }

    pub fn evaluate(&self, stats: &StatsAggregator, elapsed: Duration) -> ThresholdOutcome {
        let observed = self.observe(stats, elapsed);
        ThresholdOutcome {
            metric: self.metric.clone(),
            expression: self.expression.clone(),
            observed,
            passed: observed.map_or(true, |v| self.operator.holds(v, self.bound)),
            abort_on_fail: self.abort_on_fail,
        }
    }
}

/// All thresholds of a run plus which of them tripped the abort.
#[derive(Debug, Default)]
pub struct ThresholdSet {
    thresholds: Vec<Threshold>,
    tripped: Vec<bool>,
}

impl ThresholdSet {
    pub fn new(thresholds: Vec<Threshold>) -> Self {
        let tripped = vec![false; thresholds.len()];
        Self {
            thresholds,
            tripped,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.thresholds.is_empty()
    }

    /// Evaluate every threshold. With `control`, the first abort-on-fail breach past its
    /// `delay_abort_eval` aborts the run. A threshold that tripped the abort stays failed.
    pub fn evaluate(
        &mut self,
        stats: &StatsAggregator,
        elapsed: Duration,
        control: Option<&ControlState>,
    ) -> Vec<ThresholdOutcome> {
        let mut outcomes = Vec::with_capacity(self.thresholds.len());
        for (threshold, tripped) in self.thresholds.iter().zip(self.tripped.iter_mut()) {
            let mut outcome = threshold.evaluate(stats, elapsed);
            if !outcome.passed {
                tracing::debug!(threshold = %outcome, "threshold failing");
                if let Some(control) = control {
                    if threshold.abort_on_fail && elapsed >= threshold.delay_abort_eval {
                        let reason = AbortReason::ThresholdBreach {
                            metric: threshold.metric.clone(),
                            expression: threshold.expression.clone(),
                        };
                        if control.abort(reason) {
                            *tripped = true;
                        }
                    }
                }
            }
            if *tripped {
                outcome.passed = false;
            }
            outcomes.push(outcome);
        }
        outcomes
    }
}
