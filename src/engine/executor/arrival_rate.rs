use std::sync::Arc;
use std::time::Duration;

use super::{CapacityWarning, ExecutorOutcome, ScenarioContext};
use crate::engine::pool::VuPool;
use crate::engine::schedule::{ArrivalSchedule, StageCurve};
use crate::stats::Metric;

/// Start iterations at the arrival instants of `curve`, each on a free VU.
/// With no VU free and the pool at its cap, the iteration is dropped.
pub(super) async fn run(
    ctx: &ScenarioContext,
    curve: &StageCurve,
    time_unit: Duration,
    pre_allocated_vus: u64,
    max_vus: u64,
    outcome: &mut ExecutorOutcome,
) {
    let scenario = &ctx.scenario;
    let run_length = scenario.run_length;
    let schedule = ArrivalSchedule::new(curve, time_unit, run_length);
    let pool = Arc::new(VuPool::new(
        scenario.name.clone(),
        max_vus,
        ctx.seed,
        ctx.ids.clone(),
    ));
    pool.preallocate(pre_allocated_vus);
    tracing::debug!(
        scenario = %scenario.name,
        expected = schedule.expected_arrivals(),
        preallocated = pool.created(),
        "arrival schedule ready"
    );

    let hard = ctx.clock.token().child_token();
    let vu_clock = ctx.clock.with_token(hard.clone());
    let started = ctx.clock.now();
    let mut warning = CapacityWarning::default();
    let mut k = 0u64;

    while let Some(at) = schedule.arrival_at(k) {
        k += 1;
        if !ctx.clock.sleep_until(started.saturating_add(at)).await {
            break;
        }
        let Some(mut vu) = pool.acquire() else {
            outcome.dropped_iterations += 1;
            ctx.stats.record(
                k,
                Metric::DroppedIteration {
                    scenario: scenario.name.clone(),
                },
            );
            if let Some(suppressed) = warning.due(at) {
                tracing::warn!(
                    scenario = %scenario.name,
                    max_vus,
                    suppressed,
                    "no free VU, dropping iteration"
                );
            }
            continue;
        };

        outcome.dispatched += 1;
        let task_ctx = ctx.clone();
        let task_pool = pool.clone();
        let clock = vu_clock.clone();
        pool.spawn(async move {
            let result = task_ctx
                .sandbox
                .run_iteration(
                    &task_ctx.scenario.function,
                    &mut vu,
                    &clock,
                    &task_ctx.scenario.tags,
                )
                .await;
            let interrupted = result.interrupted;
            task_ctx.stats.record_iteration(vu.id, result);
            if interrupted {
                task_pool.retire(vu);
            } else {
                task_pool.release(vu);
            }
        });
    }

    ctx.clock.sleep_until(started.saturating_add(run_length)).await;
    outcome.final_vus = pool.active();
    outcome.stopped(pool.shutdown(scenario.graceful_stop, &hard).await);
    outcome.peak_vus = pool.peak();
}

#[cfg(test)]
mod tests {
    use super::super::tests::context;
    use super::super::run_scenario;
    use crate::engine::http_client::tests::MockTransport;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_constant_rate_dispatch_count() {
        let transport = Arc::new(MockTransport::ok(Duration::from_millis(50)));
        let ctx = context(
            r#"
functions:
  default:
    steps:
      - request: {url: "{{base_url}}/noise"}
scenarios:
  noise:
    executor: constant-arrival-rate
    rate: 10
    timeUnit: 1s
    duration: 10s
    preAllocatedVUs: 2
    maxVUs: 5
"#,
            transport.clone(),
        );
        let stats = ctx.stats.clone();
        let outcome = run_scenario(ctx).await;

        assert_eq!(outcome.dispatched, 100);
        assert_eq!(outcome.dropped_iterations, 0);
        assert!(outcome.peak_vus <= 5);
        assert_eq!(transport.call_count(), 100);
        assert_eq!(stats.snapshot().iterations_for(Some("noise")).iterations, 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drops_when_out_of_vus() {
        let transport = Arc::new(MockTransport::ok(Duration::from_millis(250)));
        let ctx = context(
            r#"
functions:
  default:
    steps:
      - request: {url: "{{base_url}}/slow"}
scenarios:
  saturated:
    executor: constant-arrival-rate
    rate: 10
    duration: 10s
    preAllocatedVUs: 1
    maxVUs: 1
"#,
            transport,
        );
        let stats = ctx.stats.clone();
        let outcome = run_scenario(ctx).await;

        assert_eq!(outcome.dispatched + outcome.dropped_iterations, 100);
        assert!(outcome.dropped_iterations > 50);
        assert_eq!(outcome.peak_vus, 1);
        let snap = stats.snapshot().iterations_for(None);
        assert_eq!(snap.dropped_iterations as u64, outcome.dropped_iterations);
        assert_eq!(snap.iterations as u64, outcome.dispatched);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ramping_rate_grows_vus_on_demand() {
        let transport = Arc::new(MockTransport::ok(Duration::from_millis(500)));
        let ctx = context(
            r#"
functions:
  default:
    steps:
      - request: {url: "{{base_url}}/predict"}
scenarios:
  predict:
    executor: ramping-arrival-rate
    startRate: 2
    timeUnit: 1s
    preAllocatedVUs: 1
    maxVUs: 50
    stages:
      - {target: 20, duration: 10s}
"#,
            transport,
        );
        let outcome = run_scenario(ctx).await;
        // Integral of a 2 -> 20 ramp over 10s.
        assert!((109..=110).contains(&outcome.dispatched), "{}", outcome.dispatched);
        assert_eq!(outcome.dropped_iterations, 0);
        assert!(outcome.peak_vus > 1 && outcome.peak_vus <= 50);
    }
}
