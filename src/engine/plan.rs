use anyhow::{Context, Result};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::cli::config::{Config, ScenarioConfig, ThresholdEntry};
use crate::engine::fixtures::FixtureRegistry;
use crate::engine::sandbox::{FunctionSet, IterationFunction};
use crate::engine::schedule::{Stage, StageCurve};
use crate::error::ConfigError;
use crate::stats::threshold::Threshold;
use crate::stats::Tags;
use crate::utils::parse_duration_str;

pub const DEFAULT_BASE_URL: &str = "http://localhost:8080";
const DEFAULT_GRACE: Duration = Duration::from_secs(30);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_THRESHOLD_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutorPlan {
    RampingVus {
        start_vus: u64,
        stages: Vec<Stage>,
        graceful_ramp_down: Duration,
    },
    RampingArrivalRate {
        start_rate: u64,
        time_unit: Duration,
        stages: Vec<Stage>,
        pre_allocated_vus: u64,
        max_vus: u64,
    },
    ConstantArrivalRate {
        rate: u64,
        time_unit: Duration,
        pre_allocated_vus: u64,
        max_vus: u64,
    },
}

impl ExecutorPlan {
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutorPlan::RampingVus { .. } => "ramping-vus",
            ExecutorPlan::RampingArrivalRate { .. } => "ramping-arrival-rate",
            ExecutorPlan::ConstantArrivalRate { .. } => "constant-arrival-rate",
        }
    }

    /// The target curve: VUs for ramping-vus, iterations per time unit otherwise.
    pub fn curve(&self, run_length: Duration) -> StageCurve {
        match self {
            ExecutorPlan::RampingVus {
                start_vus, stages, ..
            } => StageCurve::new(*start_vus, stages),
            ExecutorPlan::RampingArrivalRate {
                start_rate, stages, ..
            } => StageCurve::new(*start_rate, stages),
            ExecutorPlan::ConstantArrivalRate { rate, .. } => StageCurve::constant(*rate, run_length),
        }
    }

    /// Upper bound on VUs this executor may hold at once.
    pub fn max_vus(&self, run_length: Duration) -> u64 {
        match self {
            ExecutorPlan::RampingVus { .. } => self.curve(run_length).peak(),
            ExecutorPlan::RampingArrivalRate { max_vus, .. }
            | ExecutorPlan::ConstantArrivalRate { max_vus, .. } => *max_vus,
        }
    }
}

#[derive(Debug)]
pub struct ScenarioPlan {
    pub name: Arc<str>,
    pub executor: ExecutorPlan,
    /// Explicit `duration`, or the stage durations summed.
    pub run_length: Duration,
    pub start_time: Duration,
    pub graceful_stop: Duration,
    pub function: Arc<IterationFunction>,
    pub tags: Tags,
}

/// A validated, immutable run description.
#[derive(Debug)]
pub struct RunPlan {
    pub base_url: String,
    pub seed: u64,
    pub discard_response_bodies: bool,
    pub request_timeout: Duration,
    pub threshold_interval: Duration,
    pub thresholds: Vec<Threshold>,
    pub scenarios: Vec<Arc<ScenarioPlan>>,
}

/// Command-line and environment settings that win over the document.
#[derive(Debug, Clone, Default)]
pub struct PlanOverrides {
    pub base_url: Option<String>,
    pub seed: Option<u64>,
}

fn duration_field(
    context: impl Into<String>,
    value: Option<&str>,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match value {
        None => Ok(default),
        Some(v) => parse_duration_str(v).ok_or_else(|| ConfigError::InvalidDuration {
            context: context.into(),
            value: v.to_string(),
        }),
    }
}

fn stages(name: &str, config: &ScenarioConfig) -> Result<Vec<Stage>, ConfigError> {
    let raw = config.stages.as_ref().ok_or_else(|| ConfigError::MissingField {
        scenario: name.to_string(),
        field: "stages",
    })?;
    if raw.is_empty() {
        return Err(ConfigError::InvalidStages {
            scenario: name.to_string(),
            reason: "at least one stage is required".to_string(),
        });
    }
    raw.iter()
        .enumerate()
        .map(|(i, s)| {
            let duration = parse_duration_str(&s.duration).ok_or_else(|| {
                ConfigError::InvalidDuration {
                    context: format!("scenario `{}` stage {}", name, i + 1),
                    value: s.duration.clone(),
                }
            })?;
            Ok(Stage::new(s.target, duration))
        })
        .collect()
}

fn vu_bounds(name: &str, config: &ScenarioConfig) -> Result<(u64, u64), ConfigError> {
    let pre_allocated = config
        .pre_allocated_vus
        .ok_or_else(|| ConfigError::MissingField {
            scenario: name.to_string(),
            field: "preAllocatedVUs",
        })?;
    let max = config.max_vus.unwrap_or(pre_allocated);
    if pre_allocated > max {
        return Err(ConfigError::PreAllocatedExceedsMax {
            scenario: name.to_string(),
            pre_allocated,
            max,
        });
    }
    Ok((pre_allocated, max))
}

fn time_unit(name: &str, config: &ScenarioConfig) -> Result<Duration, ConfigError> {
    let unit = duration_field(
        format!("scenario `{}` timeUnit", name),
        config.time_unit.as_deref(),
        Duration::from_secs(1),
    )?;
    if unit.is_zero() {
        return Err(ConfigError::InvalidDuration {
            context: format!("scenario `{}` timeUnit", name),
            value: config.time_unit.clone().unwrap_or_default(),
        });
    }
    Ok(unit)
}

/// Reject options the executor has no use for.
fn reject_fields(
    name: &str,
    executor: &'static str,
    fields: &[(&'static str, bool)],
) -> Result<(), ConfigError> {
    match fields.iter().find(|(_, set)| *set) {
        Some((field, _)) => Err(ConfigError::UnsupportedField {
            scenario: name.to_string(),
            executor,
            field,
        }),
        None => Ok(()),
    }
}

fn executor_plan(name: &str, config: &ScenarioConfig) -> Result<ExecutorPlan, ConfigError> {
    let executor = config
        .executor
        .as_deref()
        .ok_or_else(|| ConfigError::MissingField {
            scenario: name.to_string(),
            field: "executor",
        })?;
    match executor {
        "ramping-vus" => {
            reject_fields(
                name,
                "ramping-vus",
                &[
                    ("startRate", config.start_rate.is_some()),
                    ("rate", config.rate.is_some()),
                    ("timeUnit", config.time_unit.is_some()),
                    ("preAllocatedVUs", config.pre_allocated_vus.is_some()),
                    ("maxVUs", config.max_vus.is_some()),
                ],
            )?;
            Ok(ExecutorPlan::RampingVus {
                start_vus: config.start_vus.unwrap_or(1),
                stages: stages(name, config)?,
                graceful_ramp_down: duration_field(
                    format!("scenario `{}` gracefulRampDown", name),
                    config.graceful_ramp_down.as_deref(),
                    DEFAULT_GRACE,
                )?,
            })
        }
        "ramping-arrival-rate" => {
            reject_fields(
                name,
                "ramping-arrival-rate",
                &[
                    ("rate", config.rate.is_some()),
                    ("startVUs", config.start_vus.is_some()),
                    ("gracefulRampDown", config.graceful_ramp_down.is_some()),
                ],
            )?;
            let (pre_allocated_vus, max_vus) = vu_bounds(name, config)?;
            Ok(ExecutorPlan::RampingArrivalRate {
                start_rate: config.start_rate.unwrap_or(0),
                time_unit: time_unit(name, config)?,
                stages: stages(name, config)?,
                pre_allocated_vus,
                max_vus,
            })
        }
        "constant-arrival-rate" => {
            reject_fields(
                name,
                "constant-arrival-rate",
                &[
                    ("startRate", config.start_rate.is_some()),
                    ("startVUs", config.start_vus.is_some()),
                    ("stages", config.stages.is_some()),
                    ("gracefulRampDown", config.graceful_ramp_down.is_some()),
                ],
            )?;
            let rate = config.rate.ok_or_else(|| ConfigError::MissingField {
                scenario: name.to_string(),
                field: "rate",
            })?;
            if config.duration.is_none() {
                return Err(ConfigError::MissingField {
                    scenario: name.to_string(),
                    field: "duration",
                });
            }
            let (pre_allocated_vus, max_vus) = vu_bounds(name, config)?;
            Ok(ExecutorPlan::ConstantArrivalRate {
                rate,
                time_unit: time_unit(name, config)?,
                pre_allocated_vus,
                max_vus,
            })
        }
        other => Err(ConfigError::UnknownExecutor {
            scenario: name.to_string(),
            executor: other.to_string(),
        }),
    }
}

impl RunPlan {
    /// Validate a parsed document. Fixtures must already be loaded.
    pub fn from_config(
        config: &Config,
        fixtures: &FixtureRegistry,
        overrides: &PlanOverrides,
    ) -> Result<Self, ConfigError> {
        if config.scenarios.0.is_empty() {
            return Err(ConfigError::NoScenarios);
        }
        let mut seen = HashSet::new();
        for (name, _) in &config.scenarios.0 {
            if !seen.insert(name.as_str()) {
                return Err(ConfigError::DuplicateScenario(name.clone()));
            }
        }

        let functions = FunctionSet::compile(&config.functions, fixtures)?;

        let mut scenarios = Vec::with_capacity(config.scenarios.0.len());
        for (name, sc) in &config.scenarios.0 {
            let executor = executor_plan(name, sc)?;
            let stage_sum = match &executor {
                ExecutorPlan::RampingVus { stages, .. }
                | ExecutorPlan::RampingArrivalRate { stages, .. } => stages
                    .iter()
                    .try_fold(Duration::ZERO, |acc, s| acc.checked_add(s.duration))
                    .ok_or_else(|| ConfigError::InvalidDuration {
                        context: format!("scenario `{}` stages", name),
                        value: "sum of stage durations".to_string(),
                    })?,
                ExecutorPlan::ConstantArrivalRate { .. } => Duration::ZERO,
            };
            let run_length = duration_field(
                format!("scenario `{}` duration", name),
                sc.duration.as_deref(),
                stage_sum,
            )?;
            let start_time = duration_field(
                format!("scenario `{}` startTime", name),
                sc.start_time.as_deref(),
                Duration::ZERO,
            )?;
            let graceful_stop = duration_field(
                format!("scenario `{}` gracefulStop", name),
                sc.graceful_stop.as_deref(),
                DEFAULT_GRACE,
            )?;
            // The scenario's whole timeline must be representable.
            if start_time
                .checked_add(run_length)
                .and_then(|end| end.checked_add(graceful_stop))
                .is_none()
            {
                return Err(ConfigError::InvalidDuration {
                    context: format!("scenario `{}` startTime + duration + gracefulStop", name),
                    value: format!("{:?}", run_length),
                });
            }

            let exec = sc.exec.as_deref().unwrap_or("default");
            let function = functions
                .get(exec)
                .ok_or_else(|| ConfigError::UnknownFunction {
                    scenario: name.clone(),
                    function: exec.to_string(),
                })?;

            scenarios.push(Arc::new(ScenarioPlan {
                name: Arc::from(name.as_str()),
                executor,
                run_length,
                start_time,
                graceful_stop,
                function,
                tags: sc.tags.clone(),
            }));
        }

        let abort_all = config.abort_on_fail.unwrap_or(false);
        let mut thresholds = Vec::new();
        for (metric, entries) in &config.thresholds {
            for entry in entries {
                let threshold = match entry {
                    ThresholdEntry::Expression(expr) => {
                        Threshold::parse(metric, expr, abort_all, Duration::ZERO)?
                    }
                    ThresholdEntry::Detailed {
                        threshold,
                        abort_on_fail,
                        delay_abort_eval,
                    } => Threshold::parse(
                        metric,
                        threshold,
                        abort_on_fail.unwrap_or(abort_all),
                        duration_field(
                            format!("threshold `{}` delayAbortEval", metric),
                            delay_abort_eval.as_deref(),
                            Duration::ZERO,
                        )?,
                    )?,
                };
                thresholds.push(threshold);
            }
        }

        let base_url = overrides
            .base_url
            .clone()
            .or_else(|| config.base_url.clone())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            seed: overrides.seed.or(config.seed).unwrap_or(0),
            discard_response_bodies: config.discard_response_bodies.unwrap_or(false),
            request_timeout: duration_field(
                "requestTimeout",
                config.request_timeout.as_deref(),
                DEFAULT_REQUEST_TIMEOUT,
            )?,
            threshold_interval: duration_field(
                "thresholdInterval",
                config.threshold_interval.as_deref(),
                DEFAULT_THRESHOLD_INTERVAL,
            )?
            .max(Duration::from_millis(10)),
            thresholds,
            scenarios,
        })
    }

    /// Read the document at `path`, load its fixtures relative to it, and validate.
    pub fn load(path: &Path, overrides: &PlanOverrides) -> Result<Self> {
        let config = Config::load_file(path)?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        let fixtures = FixtureRegistry::load(&config.fixtures, base_dir)?;
        if !fixtures.is_empty() {
            tracing::debug!(count = fixtures.len(), "fixtures loaded");
        }
        let plan = Self::from_config(&config, &fixtures, overrides)
            .with_context(|| format!("validating {}", path.display()))?;
        Ok(plan)
    }

    /// Length of the whole run if nothing aborts it, grace periods excluded.
    pub fn nominal_duration(&self) -> Duration {
        self.scenarios
            .iter()
            .map(|s| s.start_time.saturating_add(s.run_length))
            .max()
            .unwrap_or_default()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const FUNCTIONS: &str = r#"
functions:
  default:
    steps:
      - request: {url: "{{base_url}}/ping"}
"#;

    pub(crate) fn plan(yaml: &str) -> Result<RunPlan, ConfigError> {
        plan_with(yaml, &PlanOverrides::default())
    }

    fn plan_with(yaml: &str, overrides: &PlanOverrides) -> Result<RunPlan, ConfigError> {
        let config: Config = serde_yaml::from_str(&format!("{}{}", FUNCTIONS, yaml)).unwrap();
        RunPlan::from_config(&config, &FixtureRegistry::new(), overrides)
    }

    #[test]
    fn test_ramping_vus_plan() {
        let plan = plan(
            r#"
scenarios:
  steady:
    executor: ramping-vus
    startVUs: 0
    stages:
      - {target: 10, duration: 1m}
      - {target: 0, duration: 30s}
    gracefulRampDown: 5s
"#,
        )
        .unwrap();
        let scenario = &plan.scenarios[0];
        assert_eq!(&*scenario.name, "steady");
        assert_eq!(scenario.run_length, Duration::from_secs(90));
        assert_eq!(scenario.graceful_stop, Duration::from_secs(30));
        assert_eq!(
            scenario.executor,
            ExecutorPlan::RampingVus {
                start_vus: 0,
                stages: vec![
                    Stage::new(10, Duration::from_secs(60)),
                    Stage::new(0, Duration::from_secs(30))
                ],
                graceful_ramp_down: Duration::from_secs(5),
            }
        );
        assert_eq!(scenario.executor.max_vus(scenario.run_length), 10);
        assert_eq!(plan.base_url, DEFAULT_BASE_URL);
        assert_eq!(plan.nominal_duration(), Duration::from_secs(90));
    }

    #[test]
    fn test_arrival_rate_plans() {
        let plan = plan(
            r#"
scenarios:
  predict:
    executor: ramping-arrival-rate
    startRate: 20
    timeUnit: 1s
    preAllocatedVUs: 100
    maxVUs: 600
    stages: [{target: 100, duration: 30m}]
  noise:
    executor: constant-arrival-rate
    rate: 5
    duration: 10m
    preAllocatedVUs: 10
    startTime: 1m
"#,
        )
        .unwrap();
        assert_eq!(plan.scenarios[0].executor.kind(), "ramping-arrival-rate");
        assert_eq!(plan.scenarios[0].run_length, Duration::from_secs(1800));
        let noise = &plan.scenarios[1];
        assert_eq!(
            noise.executor,
            ExecutorPlan::ConstantArrivalRate {
                rate: 5,
                time_unit: Duration::from_secs(1),
                pre_allocated_vus: 10,
                max_vus: 10,
            }
        );
        assert_eq!(noise.start_time, Duration::from_secs(60));
        assert_eq!(plan.nominal_duration(), Duration::from_secs(1800));
    }

    #[test]
    fn test_validation_errors() {
        assert_eq!(plan("scenarios: {}").unwrap_err(), ConfigError::NoScenarios);

        let err = plan(
            r#"
scenarios:
  s: {executor: shared-iterations}
"#,
        )
        .unwrap_err();
        assert_eq!(
            err,
            ConfigError::UnknownExecutor {
                scenario: "s".to_string(),
                executor: "shared-iterations".to_string()
            }
        );

        let err = plan(
            r#"
scenarios:
  s:
    executor: ramping-arrival-rate
    preAllocatedVUs: 600
    maxVUs: 500
    stages: [{target: 1, duration: 1s}]
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::PreAllocatedExceedsMax { .. }));

        let err = plan(
            r#"
scenarios:
  s: {executor: ramping-arrival-rate, preAllocatedVUs: 1}
"#,
        )
        .unwrap_err();
        assert_eq!(
            err,
            ConfigError::MissingField {
                scenario: "s".to_string(),
                field: "stages"
            }
        );

        let err = plan(
            r#"
scenarios:
  s: {executor: constant-arrival-rate, duration: 1m, preAllocatedVUs: 1}
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::MissingField { field: "rate", .. }));

        let err = plan(
            r#"
scenarios:
  s:
    executor: ramping-vus
    stages: [{target: 1, duration: 1s}]
    exec: nothingHere
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownFunction { .. }));

        let err = plan(
            r#"
scenarios:
  s:
    executor: ramping-vus
    stages: [{target: 1, duration: forever}]
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidDuration { .. }));

        let err = plan(
            r#"
scenarios:
  s: {executor: ramping-vus, stages: []}
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidStages { .. }));
    }

    #[test]
    fn test_options_of_other_executors_rejected() {
        let err = plan(
            r#"
scenarios:
  s:
    executor: ramping-vus
    rate: 10
    stages: [{target: 1, duration: 1s}]
"#,
        )
        .unwrap_err();
        assert_eq!(
            err,
            ConfigError::UnsupportedField {
                scenario: "s".to_string(),
                executor: "ramping-vus",
                field: "rate",
            }
        );

        let err = plan(
            r#"
scenarios:
  s:
    executor: constant-arrival-rate
    rate: 10
    duration: 1m
    preAllocatedVUs: 1
    stages: [{target: 1, duration: 1s}]
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedField { field: "stages", .. }));

        let err = plan(
            r#"
scenarios:
  s:
    executor: ramping-arrival-rate
    preAllocatedVUs: 1
    gracefulRampDown: 5s
    stages: [{target: 1, duration: 1s}]
"#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::UnsupportedField { field: "gracefulRampDown", .. }
        ));
    }

    #[test]
    fn test_oversized_durations_rejected() {
        let err = plan(
            r#"
scenarios:
  s:
    executor: ramping-vus
    stages: [{target: 1, duration: 99999999999999999999h}]
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidDuration { .. }));

        // Each stage fits on its own, their sum does not.
        let err = plan(
            r#"
scenarios:
  s:
    executor: ramping-vus
    stages:
      - {target: 1, duration: 3000000000000000h}
      - {target: 1, duration: 3000000000000000h}
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidDuration { .. }));

        let err = plan(
            r#"
scenarios:
  s:
    executor: constant-arrival-rate
    rate: 1
    preAllocatedVUs: 1
    duration: 5000000000000000h
    startTime: 5000000000000000h
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidDuration { .. }));
    }

    #[test]
    fn test_duplicate_scenario_rejected() {
        let json = r#"{
            "functions": {"default": {"steps": [{"sleep": "1s"}]}},
            "scenarios": {
                "steady": {"executor": "ramping-vus", "stages": [{"target": 1, "duration": "1s"}]},
                "steady": {"executor": "ramping-vus", "stages": [{"target": 2, "duration": "1s"}]}
            }
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        let err = RunPlan::from_config(&config, &FixtureRegistry::new(), &PlanOverrides::default())
            .unwrap_err();
        assert_eq!(err, ConfigError::DuplicateScenario("steady".to_string()));
    }

    #[test]
    fn test_thresholds_and_overrides() {
        let overrides = PlanOverrides {
            base_url: Some("https://staging.example.com/api/".to_string()),
            seed: Some(99),
        };
        let overridden = plan_with(
            r#"
baseUrl: http://localhost:9999
seed: 1
abortOnFail: true
thresholds:
  http_req_duration: ["p(95)<1500", {threshold: "p(99)<3000", abortOnFail: false}]
  "http_req_duration{endpoint:analyze}": ["avg<800"]
scenarios:
  s: {executor: ramping-vus, stages: [{target: 1, duration: 1s}]}
"#,
            &overrides,
        )
        .unwrap();
        assert_eq!(overridden.base_url, "https://staging.example.com/api");
        assert_eq!(overridden.seed, 99);
        assert_eq!(overridden.thresholds.len(), 3);
        let aborting = overridden.thresholds.iter().filter(|t| t.abort_on_fail).count();
        assert_eq!(aborting, 2);

        let err = plan(
            r#"
thresholds:
  http_req_duration: ["p(95) about 5"]
scenarios:
  s: {executor: ramping-vus, stages: [{target: 1, duration: 1s}]}
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidThreshold { .. }));
    }

    #[test]
    fn test_load_resolves_fixtures_next_to_document() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("samples.json"), r#"[{"q": 1}, {"q": 2}]"#).unwrap();
        let doc = dir.path().join("load.yaml");
        std::fs::write(
            &doc,
            r#"
fixtures:
  samples: {path: samples.json, kind: json}
functions:
  analyze:
    steps:
      - request:
          method: POST
          url: "{{base_url}}/analyze"
          body: {jsonFixture: samples, randomItem: true}
scenarios:
  analyze_load:
    executor: constant-arrival-rate
    rate: 2
    duration: 10s
    preAllocatedVUs: 2
    exec: analyze
"#,
        )
        .unwrap();
        let plan = RunPlan::load(&doc, &PlanOverrides::default()).unwrap();
        assert_eq!(plan.scenarios[0].function.name, "analyze");
    }

    #[test]
    fn test_demo_document_is_valid() {
        let doc = Path::new(env!("CARGO_MANIFEST_DIR")).join("demos/slo_orders.yaml");
        let plan = RunPlan::load(&doc, &PlanOverrides::default()).unwrap();
        assert_eq!(plan.scenarios.len(), 3);
        assert_eq!(plan.thresholds.len(), 4);
        assert_eq!(plan.nominal_duration(), Duration::from_secs(60 + 100));
    }
}
