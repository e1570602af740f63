//! Scenario executors: turn a stage curve into running VUs or dispatched iterations.

use serde::Serialize;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use crate::engine::clock::RunClock;
use crate::engine::plan::{ExecutorPlan, ScenarioPlan};
use crate::engine::pool::ShutdownSummary;
use crate::engine::sandbox::Sandbox;
use crate::stats::SharedAggregator;

mod arrival_rate;
mod ramping_vus;

// Capacity warnings are logged at most this often per scenario.
const WARN_EVERY: Duration = Duration::from_secs(5);

/// Everything one scenario's executor needs. Cheap to clone into VU tasks.
#[derive(Clone)]
pub struct ScenarioContext {
    pub scenario: Arc<ScenarioPlan>,
    pub sandbox: Arc<Sandbox>,
    pub stats: SharedAggregator,
    /// Scenario-scoped clock; cancelling its token stops the scenario.
    pub clock: RunClock,
    pub ids: Arc<AtomicU64>,
    pub seed: u64,
}

/// What an executor did, for the run report.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ExecutorOutcome {
    pub scenario: String,
    pub executor: &'static str,
    /// Iterations handed to a VU (arrival-rate) or VU starts (ramping-vus).
    pub dispatched: u64,
    pub dropped_iterations: u64,
    pub vu_shortfall: u64,
    pub peak_vus: u64,
    pub max_vus: u64,
    /// VUs running when the schedule ended, before the graceful stop.
    pub final_vus: u64,
    pub completed_at_stop: u64,
    pub force_stopped: u64,
    pub started_at_secs: f64,
    pub finished_at_secs: f64,
    /// The scenario never started (aborted during its startTime delay).
    pub skipped: bool,
}

impl ExecutorOutcome {
    fn new(scenario: &ScenarioPlan) -> Self {
        Self {
            scenario: scenario.name.to_string(),
            executor: scenario.executor.kind(),
            dispatched: 0,
            dropped_iterations: 0,
            vu_shortfall: 0,
            peak_vus: 0,
            max_vus: scenario.executor.max_vus(scenario.run_length),
            final_vus: 0,
            completed_at_stop: 0,
            force_stopped: 0,
            started_at_secs: 0.0,
            finished_at_secs: 0.0,
            skipped: false,
        }
    }

    fn stopped(&mut self, summary: ShutdownSummary) {
        self.completed_at_stop = summary.completed;
        self.force_stopped = summary.force_stopped;
    }
}

/// Rate-limits capacity warnings so a saturated run does not flood the log.
#[derive(Default)]
struct CapacityWarning {
    last: Option<Duration>,
    suppressed: u64,
}

impl CapacityWarning {
    /// Returns how many events were suppressed since the last warning when one is due.
    fn due(&mut self, now: Duration) -> Option<u64> {
        match self.last {
            Some(last) if now.saturating_sub(last) < WARN_EVERY => {
                self.suppressed += 1;
                None
            }
            _ => {
                self.last = Some(now);
                Some(std::mem::take(&mut self.suppressed))
            }
        }
    }
}

/// Run one scenario to completion: wait for its start time, drive its executor,
/// and stop its VUs.
pub async fn run_scenario(ctx: ScenarioContext) -> ExecutorOutcome {
    let scenario = ctx.scenario.clone();
    let mut outcome = ExecutorOutcome::new(&scenario);

    if !ctx.clock.sleep_until(scenario.start_time).await {
        tracing::info!(scenario = %scenario.name, "scenario aborted before start");
        outcome.skipped = true;
        return outcome;
    }
    outcome.started_at_secs = ctx.clock.now().as_secs_f64();
    tracing::info!(
        scenario = %scenario.name,
        executor = scenario.executor.kind(),
        run_length = ?scenario.run_length,
        "scenario started"
    );

    match &scenario.executor {
        ExecutorPlan::RampingVus {
            graceful_ramp_down,
            ..
        } => {
            let curve = scenario.executor.curve(scenario.run_length);
            ramping_vus::run(&ctx, &curve, *graceful_ramp_down, &mut outcome).await;
        }
        ExecutorPlan::RampingArrivalRate {
            time_unit,
            pre_allocated_vus,
            max_vus,
            ..
        }
        | ExecutorPlan::ConstantArrivalRate {
            time_unit,
            pre_allocated_vus,
            max_vus,
            ..
        } => {
            let curve = scenario.executor.curve(scenario.run_length);
            arrival_rate::run(
                &ctx,
                &curve,
                *time_unit,
                *pre_allocated_vus,
                *max_vus,
                &mut outcome,
            )
            .await;
        }
    }

    outcome.finished_at_secs = ctx.clock.now().as_secs_f64();
    tracing::info!(
        scenario = %scenario.name,
        dispatched = outcome.dispatched,
        dropped = outcome.dropped_iterations,
        peak_vus = outcome.peak_vus,
        force_stopped = outcome.force_stopped,
        "scenario finished"
    );
    outcome
}
