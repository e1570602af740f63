use hdrhistogram::Histogram;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

pub mod report;
pub mod threshold;

pub use report::RunReport;

/// Tag set attached to a request series (`name`, `method`, `status`, `scenario`, user tags).
pub type Tags = BTreeMap<String, String>;

// 1µs .. 1h at two significant digits.
const HISTOGRAM_MAX_MICROS: u64 = 60 * 60 * 1000 * 1000;

pub(crate) fn new_histogram() -> Histogram<u64> {
    Histogram::<u64>::new_with_bounds(1, HISTOGRAM_MAX_MICROS, 2)
        .expect("constant histogram bounds are valid")
}

fn record_micros(h: &mut Histogram<u64>, d: Duration) {
    h.saturating_record((d.as_micros() as u64).max(1));
}

/// Milliseconds at quantile `q`, or 0 for an empty histogram.
pub(crate) fn quantile_ms(h: &Histogram<u64>, q: f64) -> f64 {
    if h.is_empty() {
        0.0
    } else {
        h.value_at_quantile(q) as f64 / 1000.0
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq)]
pub struct RequestTimings {
    pub waiting: Duration,
    pub receiving: Duration,
    pub duration: Duration,
    pub response_size: usize,
    pub request_size: usize,
}

/// One completed (or failed) outbound request. Immutable once created.
#[derive(Debug, Clone, Serialize)]
pub struct RequestSample {
    pub method: String,
    /// Endpoint tag: the request's `name`, falling back to the URL path.
    pub name: String,
    /// HTTP status, 0 when the request never got a response.
    pub status: u16,
    pub timings: RequestTimings,
    /// Run time at which the request started.
    pub timestamp: Duration,
    pub error: Option<String>,
    pub tags: Tags,
}

impl RequestSample {
    /// Transport errors and statuses outside 200..400 count as failed.
    pub fn is_failed(&self) -> bool {
        self.error.is_some() || !(200..400).contains(&self.status)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckOutcome {
    pub name: String,
    pub passed: bool,
}

/// Everything one iteration produced. Folded into the aggregator, then dropped.
#[derive(Debug, Clone)]
pub struct IterationResult {
    pub vu_id: u64,
    pub scenario: Arc<str>,
    pub started: Duration,
    pub ended: Duration,
    pub samples: Vec<RequestSample>,
    pub checks: Vec<CheckOutcome>,
    /// False when a fatal check failed or a request error ended the iteration.
    pub passed: bool,
    /// Cut short by a hard stop.
    pub interrupted: bool,
}

impl IterationResult {
    pub fn duration(&self) -> Duration {
        self.ended.saturating_sub(self.started)
    }
}

#[derive(Debug, Clone)]
pub enum Metric {
    Request {
        scenario: Arc<str>,
        sample: RequestSample,
    },
    Check {
        name: String,
        success: bool,
    },
    Iteration {
        scenario: Arc<str>,
        duration: Duration,
        passed: bool,
        interrupted: bool,
    },
    /// An arrival-rate dispatch found no free VU.
    DroppedIteration {
        scenario: Arc<str>,
    },
    /// A ramping-vus executor could not start a VU it wanted.
    VuShortfall {
        scenario: Arc<str>,
    },
}

pub struct RequestStats {
    pub tags: Tags,
    pub total_requests: usize,
    pub failed_requests: usize,
    pub total_duration: Duration,
    pub min_duration: Option<Duration>,
    pub max_duration: Duration,
    pub histogram: Histogram<u64>,
    pub total_waiting: Duration,
    pub total_receiving: Duration,
    pub total_response_size: u64,
    pub total_request_size: u64,
}

impl RequestStats {
    pub fn new(tags: Tags) -> Self {
        Self {
            tags,
            total_requests: 0,
            failed_requests: 0,
            total_duration: Duration::ZERO,
            min_duration: None,
            max_duration: Duration::ZERO,
            histogram: new_histogram(),
            total_waiting: Duration::ZERO,
            total_receiving: Duration::ZERO,
            total_response_size: 0,
            total_request_size: 0,
        }
    }

    fn absorb(&mut self, other: &RequestStats) {
        self.total_requests += other.total_requests;
        self.failed_requests += other.failed_requests;
        self.total_duration += other.total_duration;
        if let Some(min) = other.min_duration {
            if self.min_duration.map_or(true, |m| min < m) {
                self.min_duration = Some(min);
            }
        }
        self.max_duration = self.max_duration.max(other.max_duration);
        self.histogram.add(&other.histogram).ok();
        self.total_waiting += other.total_waiting;
        self.total_receiving += other.total_receiving;
        self.total_response_size += other.total_response_size;
        self.total_request_size += other.total_request_size;
    }

    /// True when every filter tag is present with the same value.
    pub fn matches(&self, filter: &Tags) -> bool {
        filter.iter().all(|(k, v)| self.tags.get(k) == Some(v))
    }
}

pub struct ScenarioStats {
    pub iterations: usize,
    pub failed_iterations: usize,
    pub interrupted_iterations: usize,
    pub dropped_iterations: usize,
    pub vu_shortfall: usize,
    pub total_iteration_duration: Duration,
    pub iteration_histogram: Histogram<u64>,
}

impl Default for ScenarioStats {
    fn default() -> Self {
        Self {
            iterations: 0,
            failed_iterations: 0,
            interrupted_iterations: 0,
            dropped_iterations: 0,
            vu_shortfall: 0,
            total_iteration_duration: Duration::ZERO,
            iteration_histogram: new_histogram(),
        }
    }
}

impl ScenarioStats {
    fn absorb(&mut self, other: &ScenarioStats) {
        self.iterations += other.iterations;
        self.failed_iterations += other.failed_iterations;
        self.interrupted_iterations += other.interrupted_iterations;
        self.dropped_iterations += other.dropped_iterations;
        self.vu_shortfall += other.vu_shortfall;
        self.total_iteration_duration += other.total_iteration_duration;
        self.iteration_histogram.add(&other.iteration_histogram).ok();
    }
}

pub struct StatsAggregator {
    pub total_requests: usize,
    pub failed_requests: usize,
    pub total_duration: Duration,
    pub min_duration: Option<Duration>,
    pub max_duration: Duration,
    pub status_codes: HashMap<u16, usize>,
    pub errors: HashMap<String, usize>,
    /// name -> (total, passes)
    pub checks: HashMap<String, (usize, usize)>,
    pub histogram: Histogram<u64>,
    /// Per series, keyed `name{k:v,...}`.
    pub requests: HashMap<String, RequestStats>,
    pub total_data_sent: u64,
    pub total_data_received: u64,
    pub scenarios: HashMap<String, ScenarioStats>,
}

impl Default for StatsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

fn series_key(name: &str, tags: &Tags) -> String {
    let mut key = name.to_string();
    key.push('{');
    for (i, (k, v)) in tags.iter().filter(|(k, _)| *k != "name").enumerate() {
        if i > 0 {
            key.push(',');
        }
        key.push_str(k);
        key.push(':');
        key.push_str(v);
    }
    key.push('}');
    key
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self {
            total_requests: 0,
            failed_requests: 0,
            total_duration: Duration::ZERO,
            min_duration: None,
            max_duration: Duration::ZERO,
            status_codes: HashMap::new(),
            errors: HashMap::new(),
            checks: HashMap::new(),
            histogram: new_histogram(),
            requests: HashMap::new(),
            total_data_sent: 0,
            total_data_received: 0,
            scenarios: HashMap::new(),
        }
    }

    pub fn add(&mut self, metric: Metric) {
        match metric {
            Metric::Request { scenario, sample } => self.add_request(&scenario, sample),
            Metric::Check { name, success } => {
                let entry = self.checks.entry(name).or_insert((0, 0));
                entry.0 += 1;
                if success {
                    entry.1 += 1;
                }
            }
            Metric::Iteration {
                scenario,
                duration,
                passed,
                interrupted,
            } => {
                let stats = self.scenario_mut(&scenario);
                stats.iterations += 1;
                if !passed {
                    stats.failed_iterations += 1;
                }
                if interrupted {
                    stats.interrupted_iterations += 1;
                } else {
                    stats.total_iteration_duration += duration;
                    record_micros(&mut stats.iteration_histogram, duration);
                }
            }
            Metric::DroppedIteration { scenario } => {
                self.scenario_mut(&scenario).dropped_iterations += 1;
            }
            Metric::VuShortfall { scenario } => {
                self.scenario_mut(&scenario).vu_shortfall += 1;
            }
        }
    }

    fn scenario_mut(&mut self, scenario: &str) -> &mut ScenarioStats {
        self.scenarios.entry(scenario.to_string()).or_default()
    }

    fn add_request(&mut self, scenario: &str, sample: RequestSample) {
        let failed = sample.is_failed();
        let timings = sample.timings;

        self.total_requests += 1;
        if failed {
            self.failed_requests += 1;
        }
        self.total_duration += timings.duration;
        if self.min_duration.map_or(true, |min| timings.duration < min) {
            self.min_duration = Some(timings.duration);
        }
        self.max_duration = self.max_duration.max(timings.duration);
        record_micros(&mut self.histogram, timings.duration);
        *self.status_codes.entry(sample.status).or_insert(0) += 1;
        if let Some(err) = &sample.error {
            *self.errors.entry(err.clone()).or_insert(0) += 1;
        }
        self.total_data_sent += timings.request_size as u64;
        self.total_data_received += timings.response_size as u64;

        let mut tags = sample.tags;
        tags.insert("name".to_string(), sample.name.clone());
        tags.insert("method".to_string(), sample.method.clone());
        tags.insert("status".to_string(), sample.status.to_string());
        tags.insert("scenario".to_string(), scenario.to_string());
        let key = series_key(&sample.name, &tags);

        let req_stats = self
            .requests
            .entry(key)
            .or_insert_with(|| RequestStats::new(tags));
        req_stats.total_requests += 1;
        if failed {
            req_stats.failed_requests += 1;
        }
        req_stats.total_duration += timings.duration;
        if req_stats
            .min_duration
            .map_or(true, |min| timings.duration < min)
        {
            req_stats.min_duration = Some(timings.duration);
        }
        req_stats.max_duration = req_stats.max_duration.max(timings.duration);
        record_micros(&mut req_stats.histogram, timings.duration);
        req_stats.total_waiting += timings.waiting;
        req_stats.total_receiving += timings.receiving;
        req_stats.total_response_size += timings.response_size as u64;
        req_stats.total_request_size += timings.request_size as u64;
    }

    /// Fold a finished iteration in: its requests, its checks and the iteration itself.
    pub fn add_iteration(&mut self, result: IterationResult) {
        let duration = result.duration();
        for sample in result.samples {
            self.add(Metric::Request {
                scenario: result.scenario.clone(),
                sample,
            });
        }
        for check in result.checks {
            self.add(Metric::Check {
                name: check.name,
                success: check.passed,
            });
        }
        self.add(Metric::Iteration {
            scenario: result.scenario,
            duration,
            passed: result.passed,
            interrupted: result.interrupted,
        });
    }

    /// Merge another aggregator's totals into this one.
    pub fn absorb(&mut self, other: &StatsAggregator) {
        self.total_requests += other.total_requests;
        self.failed_requests += other.failed_requests;
        self.total_duration += other.total_duration;
        if let Some(min) = other.min_duration {
            if self.min_duration.map_or(true, |m| min < m) {
                self.min_duration = Some(min);
            }
        }
        self.max_duration = self.max_duration.max(other.max_duration);
        for (code, count) in &other.status_codes {
            *self.status_codes.entry(*code).or_insert(0) += count;
        }
        for (err, count) in &other.errors {
            *self.errors.entry(err.clone()).or_insert(0) += count;
        }
        for (name, (total, passes)) in &other.checks {
            let entry = self.checks.entry(name.clone()).or_insert((0, 0));
            entry.0 += total;
            entry.1 += passes;
        }
        self.histogram.add(&other.histogram).ok();
        for (key, stats) in &other.requests {
            self.requests
                .entry(key.clone())
                .or_insert_with(|| RequestStats::new(stats.tags.clone()))
                .absorb(stats);
        }
        self.total_data_sent += other.total_data_sent;
        self.total_data_received += other.total_data_received;
        for (name, stats) in &other.scenarios {
            self.scenarios
                .entry(name.clone())
                .or_default()
                .absorb(stats);
        }
    }

    /// All request series carrying every tag in `filter`, merged into one.
    pub fn requests_matching(&self, filter: &Tags) -> RequestStats {
        let mut merged = RequestStats::new(filter.clone());
        for stats in self.requests.values().filter(|s| s.matches(filter)) {
            merged.absorb(stats);
        }
        merged
    }

    /// Iteration stats for one scenario, or all scenarios merged when `None`.
    pub fn iterations_for(&self, scenario: Option<&str>) -> ScenarioStats {
        let mut merged = ScenarioStats::default();
        for (name, stats) in &self.scenarios {
            if scenario.map_or(true, |s| s == name) {
                merged.absorb(stats);
            }
        }
        merged
    }

    pub fn check_totals(&self) -> (usize, usize) {
        self.checks
            .values()
            .fold((0, 0), |(t, p), (total, passes)| (t + total, p + passes))
    }
}

/// Aggregator split into independently locked shards so many VUs can record
/// at once; readers merge the shards into a snapshot.
pub struct ShardedAggregator {
    shards: Vec<RwLock<StatsAggregator>>,
}

pub type SharedAggregator = Arc<ShardedAggregator>;

impl ShardedAggregator {
    pub fn new(num_shards: usize) -> Self {
        let shards = (0..num_shards.max(1))
            .map(|_| RwLock::new(StatsAggregator::new()))
            .collect();
        Self { shards }
    }

    /// Shard count scaled to the machine, matching the number of worker threads.
    pub fn for_host() -> Self {
        Self::new((num_cpus::get() * 4).clamp(16, 256))
    }

    fn shard(&self, hint: u64) -> &RwLock<StatsAggregator> {
        &self.shards[(hint % self.shards.len() as u64) as usize]
    }

    pub fn record(&self, hint: u64, metric: Metric) {
        self.shard(hint).write().add(metric);
    }

    pub fn record_iteration(&self, hint: u64, result: IterationResult) {
        self.shard(hint).write().add_iteration(result);
    }

    /// Merge all shards. Each shard is read under its lock, so no counter is seen
    /// half-updated; different shards may be read at slightly different instants.
    pub fn snapshot(&self) -> StatsAggregator {
        let mut merged = StatsAggregator::new();
        for shard in &self.shards {
            merged.absorb(&shard.read());
        }
        merged
    }
}
