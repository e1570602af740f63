use anyhow::Result;
use std::path::Path;

use crate::engine::plan::{ExecutorPlan, PlanOverrides, RunPlan};
use crate::utils::format_duration;

/// Load and validate a scenario document without running it, then print what
/// the run would do.
pub fn run_validate(scenario: &Path, overrides: &PlanOverrides) -> Result<()> {
    println!("Validating {}...", scenario.display());

    let plan = match RunPlan::load(scenario, overrides) {
        Ok(plan) => plan,
        Err(e) => {
            println!("  ✗ Validation failed: {:#}", e);
            return Err(e);
        }
    };

    println!("  ✓ Document parsed");
    println!("  ✓ {} scenario(s) valid", plan.scenarios.len());
    println!("    base url: {}", plan.base_url);
    println!("    nominal duration: {}", format_duration(plan.nominal_duration()));
    for s in &plan.scenarios {
        println!("    {} ({}, exec {})", s.name, s.executor.kind(), s.function.name);
        match &s.executor {
            ExecutorPlan::RampingVus { stages, .. } => {
                println!(
                    "      {} stage(s), peak {} VUs",
                    stages.len(),
                    s.executor.max_vus(s.run_length)
                );
            }
            ExecutorPlan::RampingArrivalRate {
                stages,
                pre_allocated_vus,
                max_vus,
                ..
            } => {
                println!(
                    "      {} stage(s), VUs {}..{}",
                    stages.len(),
                    pre_allocated_vus,
                    max_vus
                );
            }
            ExecutorPlan::ConstantArrivalRate {
                rate,
                time_unit,
                pre_allocated_vus,
                max_vus,
            } => {
                println!(
                    "      {} per {}, VUs {}..{}",
                    rate,
                    format_duration(*time_unit),
                    pre_allocated_vus,
                    max_vus
                );
            }
        }
        if !s.start_time.is_zero() {
            println!("      starts at {}", format_duration(s.start_time));
        }
    }
    if !plan.thresholds.is_empty() {
        println!("  ✓ {} threshold(s) parsed", plan.thresholds.len());
        for t in &plan.thresholds {
            let abort = if t.abort_on_fail { " (abortOnFail)" } else { "" };
            println!("    {}: {}{}", t.metric, t.expression, abort);
        }
    }
    Ok(())
}
