use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use tokio::task::JoinSet;

use crate::stats::threshold::ThresholdSet;
use crate::stats::{RunReport, ShardedAggregator, SharedAggregator};

pub mod clock;
pub mod control;
pub mod executor;
pub mod fixtures;
pub mod http_client;
pub mod plan;
pub mod pool;
pub mod sandbox;
pub mod schedule;
pub mod template;

use clock::RunClock;
use control::ControlState;
use executor::{run_scenario, ScenarioContext};
use http_client::{HyperTransport, Transport};
use plan::RunPlan;
use sandbox::Sandbox;

/// Runs every scenario of a plan concurrently and builds the report.
pub struct Engine {
    plan: RunPlan,
    transport: Arc<dyn Transport>,
    control: Arc<ControlState>,
    stats: SharedAggregator,
}

impl Engine {
    pub fn new(plan: RunPlan, transport: Arc<dyn Transport>) -> Self {
        Self {
            plan,
            transport,
            control: Arc::new(ControlState::new()),
            stats: Arc::new(ShardedAggregator::for_host()),
        }
    }

    /// An engine on the default hyper transport, sized for the plan's VU ceiling.
    pub fn with_hyper(plan: RunPlan) -> Result<Self> {
        let concurrency: u64 = plan
            .scenarios
            .iter()
            .map(|s| s.executor.max_vus(s.run_length))
            .sum();
        let concurrency = concurrency.max(1) as usize;
        let transport = HyperTransport::new(concurrency, concurrency)?;
        Ok(Self::new(plan, Arc::new(transport)))
    }

    /// Abort handle. Aborting it stops every scenario.
    pub fn control(&self) -> Arc<ControlState> {
        self.control.clone()
    }

    pub async fn run(self) -> RunReport {
        let Engine {
            plan,
            transport,
            control,
            stats,
        } = self;
        let started_at = Utc::now();
        let clock = RunClock::start(control.token().clone());
        let sandbox = Arc::new(Sandbox::new(
            transport,
            plan.base_url.as_str(),
            plan.discard_response_bodies,
            plan.request_timeout,
        ));
        let ids = Arc::new(AtomicU64::new(0));
        let thresholds = Arc::new(Mutex::new(ThresholdSet::new(plan.thresholds.clone())));

        tracing::info!(
            scenarios = plan.scenarios.len(),
            base_url = %plan.base_url,
            nominal_duration = ?plan.nominal_duration(),
            "run started"
        );

        let monitor_clock = clock.child();
        let monitor = tokio::spawn({
            let clock = monitor_clock.clone();
            let thresholds = thresholds.clone();
            let stats = stats.clone();
            let control = control.clone();
            let interval = plan.threshold_interval;
            async move {
                if thresholds.lock().is_empty() {
                    return;
                }
                let mut next = interval;
                while clock.sleep_until(next).await {
                    let snapshot = stats.snapshot();
                    thresholds
                        .lock()
                        .evaluate(&snapshot, clock.now(), Some(&control));
                    next += interval;
                }
            }
        });

        let mut set = JoinSet::new();
        for (index, scenario) in plan.scenarios.iter().enumerate() {
            let ctx = ScenarioContext {
                scenario: scenario.clone(),
                sandbox: sandbox.clone(),
                stats: stats.clone(),
                clock: clock.child(),
                ids: ids.clone(),
                seed: plan.seed,
            };
            set.spawn(async move { (index, run_scenario(ctx).await) });
        }

        let mut outcomes = Vec::with_capacity(plan.scenarios.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => tracing::error!(error = %e, "scenario task failed"),
            }
        }
        outcomes.sort_by_key(|(index, _)| *index);

        monitor_clock.token().cancel();
        if let Err(e) = monitor.await {
            tracing::error!(error = %e, "threshold monitor failed");
        }

        let elapsed = clock.now();
        let snapshot = stats.snapshot();
        let results = thresholds.lock().evaluate(&snapshot, elapsed, None);
        for failed in results.iter().filter(|t| !t.passed) {
            tracing::warn!(threshold = %failed, "threshold failed");
        }

        let report = RunReport::build(
            started_at,
            elapsed,
            &snapshot,
            outcomes.into_iter().map(|(_, o)| o).collect(),
            results,
            control.reason(),
        );
        tracing::info!(
            elapsed = ?elapsed,
            passed = report.passed,
            aborted = report.aborted.is_some(),
            "run finished"
        );
        report
    }
}
