use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::{CapacityWarning, ExecutorOutcome, ScenarioContext};
use crate::engine::clock::RunClock;
use crate::engine::pool::{Vu, VuPool};
use crate::engine::schedule::StageCurve;
use crate::stats::Metric;

// How often the running VU count is reconciled with the curve.
const CONTROL_TICK: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LeaseState {
    Active,
    /// Ramped down; finishing its current iteration and may still be revived.
    Retiring,
    /// Left the loop. Its slot is back in the pool.
    Gone,
}

/// Ramp state shared by the control loop and one VU task.
#[derive(Clone)]
struct VuLease(Arc<watch::Sender<LeaseState>>);

impl VuLease {
    fn new() -> Self {
        let (tx, _) = watch::channel(LeaseState::Active);
        Self(Arc::new(tx))
    }

    fn transition(&self, from: LeaseState, to: LeaseState) -> bool {
        self.0.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    fn retire(&self) -> bool {
        self.transition(LeaseState::Active, LeaseState::Retiring)
    }

    /// Cancel a pending retirement. `false` once the VU has left.
    fn revive(&self) -> bool {
        self.transition(LeaseState::Retiring, LeaseState::Active)
    }

    /// Called by the VU: leave if retired, atomically with respect to `revive`.
    fn leave(&self) -> bool {
        self.transition(LeaseState::Retiring, LeaseState::Gone)
    }

    fn is_gone(&self) -> bool {
        *self.0.borrow() == LeaseState::Gone
    }
}

/// Resolves once the VU has stayed retired for `grace`; the lease is then gone.
async fn ramp_down_expired(lease: &VuLease, grace: Duration) {
    let mut rx = lease.0.subscribe();
    loop {
        let closed = rx
            .wait_for(|state| *state == LeaseState::Retiring)
            .await
            .is_err();
        if closed {
            std::future::pending::<()>().await;
        }
        tokio::select! {
            _ = tokio::time::sleep(grace) => {
                if lease.leave() {
                    return;
                }
            }
            _ = rx.wait_for(|state| *state != LeaseState::Retiring) => {}
        }
    }
}

/// One VU's lifetime: iterations back to back until it is retired or the scenario ends.
///
/// A retired VU finishes its current iteration, which is interrupted once
/// `graceful_ramp_down` runs out; a revive within that window keeps it looping.
/// `finish` asks it to stop after its current iteration with no deadline; the
/// pool's graceful stop bounds that one.
async fn vu_loop(
    ctx: ScenarioContext,
    pool: Arc<VuPool>,
    mut vu: Vu,
    lease: VuLease,
    finish: CancellationToken,
    clock: RunClock,
    graceful_ramp_down: Duration,
) {
    loop {
        if finish.is_cancelled() || clock.is_cancelled() || lease.leave() {
            break;
        }
        let result = {
            let iteration = ctx.sandbox.run_iteration(
                &ctx.scenario.function,
                &mut vu,
                &clock,
                &ctx.scenario.tags,
            );
            tokio::pin!(iteration);
            tokio::select! {
                biased;
                result = &mut iteration => result,
                _ = ramp_down_expired(&lease, graceful_ramp_down) => {
                    clock.token().cancel();
                    iteration.await
                }
            }
        };
        ctx.stats.record_iteration(vu.id, result);
    }

    let ramped_down = lease.is_gone();
    lease.0.send_replace(LeaseState::Gone);
    if clock.is_cancelled() {
        pool.retire(vu);
    } else {
        if ramped_down {
            tracing::debug!(scenario = %vu.scenario, vu = vu.id, "vu ramped down");
        }
        pool.release(vu);
    }
}

/// Keep `round(curve(t))` VUs looping over the scenario's function.
pub(super) async fn run(
    ctx: &ScenarioContext,
    curve: &StageCurve,
    graceful_ramp_down: Duration,
    outcome: &mut ExecutorOutcome,
) {
    let scenario = &ctx.scenario;
    let run_length = scenario.run_length;
    let pool = Arc::new(VuPool::new(
        scenario.name.clone(),
        outcome.max_vus,
        ctx.seed,
        ctx.ids.clone(),
    ));
    let hard = ctx.clock.token().child_token();
    let finish = CancellationToken::new();
    let started = ctx.clock.now();

    // Running VUs, oldest first.
    let mut running: Vec<VuLease> = Vec::new();
    // Retired VUs still finishing an iteration, most recently retired last.
    let mut retiring: Vec<VuLease> = Vec::new();
    let mut last_missing = 0u64;
    let mut warning = CapacityWarning::default();

    loop {
        let elapsed = ctx.clock.now().saturating_sub(started);
        let target = curve.value_at(elapsed.min(run_length)).round() as u64;
        retiring.retain(|lease| !lease.is_gone());

        // Scale up: take back the most recently retired VUs before starting new ones.
        while (running.len() as u64) < target {
            let Some(lease) = retiring.pop() else {
                break;
            };
            if lease.revive() {
                running.push(lease);
            }
        }
        while (running.len() as u64) < target {
            let Some(vu) = pool.acquire() else {
                break;
            };
            tracing::debug!(scenario = %scenario.name, vu = vu.id, "vu started");
            let lease = VuLease::new();
            running.push(lease.clone());
            outcome.dispatched += 1;
            pool.spawn(vu_loop(
                ctx.clone(),
                pool.clone(),
                vu,
                lease,
                finish.clone(),
                ctx.clock.with_token(hard.child_token()),
                graceful_ramp_down,
            ));
        }

        let missing = target.saturating_sub(running.len() as u64);
        if missing > last_missing {
            let new = missing - last_missing;
            outcome.vu_shortfall += new;
            for _ in 0..new {
                ctx.stats.record(
                    outcome.vu_shortfall,
                    Metric::VuShortfall {
                        scenario: scenario.name.clone(),
                    },
                );
            }
            if let Some(suppressed) = warning.due(elapsed) {
                tracing::warn!(
                    scenario = %scenario.name,
                    target,
                    running = running.len(),
                    suppressed,
                    "could not start enough VUs"
                );
            }
        }
        last_missing = missing;

        // Scale down newest first.
        while running.len() as u64 > target {
            if let Some(lease) = running.pop() {
                if lease.retire() {
                    retiring.push(lease);
                }
            }
        }

        if elapsed >= run_length {
            break;
        }
        let next = (elapsed + CONTROL_TICK).min(run_length);
        if !ctx.clock.sleep_until(started.saturating_add(next)).await {
            break;
        }
    }

    outcome.final_vus = running.len() as u64;
    finish.cancel();
    outcome.stopped(pool.shutdown(scenario.graceful_stop, &hard).await);
    outcome.peak_vus = pool.peak();
}
