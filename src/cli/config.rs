use anyhow::{Context, Result};
use schemars::JsonSchema;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
pub struct StageConfig {
    /// Target VUs (ramping-vus) or iterations per timeUnit (ramping-arrival-rate)
    pub target: u64,
    /// Time to reach the target (e.g., "30s", "5m")
    pub duration: String,
}

/// One named scenario. Fields not used by the chosen executor are rejected at validation.
#[derive(Debug, Serialize, Deserialize, Clone, Default, JsonSchema)]
pub struct ScenarioConfig {
    /// Executor type (ramping-vus, ramping-arrival-rate, constant-arrival-rate)
    pub executor: Option<String>,
    /// Initial rate for ramping-arrival-rate
    #[serde(alias = "startRate")]
    pub start_rate: Option<u64>,
    /// Fixed rate for constant-arrival-rate
    pub rate: Option<u64>,
    /// Period the rate is expressed over (default: "1s")
    #[serde(alias = "timeUnit")]
    pub time_unit: Option<String>,
    /// Initial VUs for ramping-vus
    #[serde(alias = "startVUs")]
    pub start_vus: Option<u64>,
    #[serde(alias = "preAllocatedVUs")]
    pub pre_allocated_vus: Option<u64>,
    #[serde(alias = "maxVUs")]
    pub max_vus: Option<u64>,
    pub stages: Option<Vec<StageConfig>>,
    /// Total run length. Defaults to the sum of stage durations.
    pub duration: Option<String>,
    /// Iteration function to run (default: "default")
    pub exec: Option<String>,
    /// Time a VU retired by a ramp-down gets to finish its iteration (default: "30s")
    #[serde(alias = "gracefulRampDown")]
    pub graceful_ramp_down: Option<String>,
    /// Time in-flight iterations get to finish when the scenario ends (default: "30s")
    #[serde(alias = "gracefulStop")]
    pub graceful_stop: Option<String>,
    /// Delay before starting this scenario (e.g., "30s")
    #[serde(alias = "startTime")]
    pub start_time: Option<String>,
    /// Tags added to every request of this scenario
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// Scenarios in declaration order. Duplicate names are kept so validation can report them.
#[derive(Debug, Clone, Default)]
pub struct ScenarioList(pub Vec<(String, ScenarioConfig)>);

impl<'de> Deserialize<'de> for ScenarioList {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct ListVisitor;

        impl<'de> Visitor<'de> for ListVisitor {
            type Value = ScenarioList;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of scenario name to scenario")
            }

            fn visit_map<A: MapAccess<'de>>(
                self,
                mut map: A,
            ) -> std::result::Result<ScenarioList, A::Error> {
                let mut entries = Vec::new();
                while let Some(entry) = map.next_entry::<String, ScenarioConfig>()? {
                    entries.push(entry);
                }
                Ok(ScenarioList(entries))
            }
        }

        deserializer.deserialize_map(ListVisitor)
    }
}

impl Serialize for ScenarioList {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, scenario) in &self.0 {
            map.serialize_entry(name, scenario)?;
        }
        map.end()
    }
}

/// A threshold is either a bare expression or an expression with abort settings.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
#[serde(untagged)]
pub enum ThresholdEntry {
    Expression(String),
    Detailed {
        threshold: String,
        #[serde(default, alias = "abortOnFail")]
        abort_on_fail: Option<bool>,
        /// Grace period before an abort-on-fail breach may stop the run
        #[serde(default, alias = "delayAbortEval")]
        delay_abort_eval: Option<String>,
    },
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum FixtureKind {
    Binary,
    Json,
}

#[derive(Debug, Serialize, Deserialize, Clone, JsonSchema)]
pub struct FixtureConfig {
    /// Path relative to the scenario document
    pub path: String,
    pub kind: FixtureKind,
    #[serde(alias = "contentType")]
    pub content_type: Option<String>,
    /// File name sent in multipart uploads (default: the file's own name)
    pub filename: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum OnRequestError {
    /// Record the failed request and carry on with the next step
    #[default]
    Continue,
    /// Record the failed request and end the iteration as failed
    Abort,
}

#[derive(Debug, Serialize, Deserialize, Clone, JsonSchema)]
pub struct MultipartConfig {
    /// Form field name
    pub field: String,
    /// Binary fixture to upload
    pub fixture: String,
    pub filename: Option<String>,
    #[serde(alias = "contentType")]
    pub content_type: Option<String>,
}

/// Request body. Exactly one source may be set.
#[derive(Debug, Serialize, Deserialize, Clone, Default, JsonSchema)]
pub struct BodyConfig {
    /// Inline JSON value
    pub json: Option<serde_json::Value>,
    /// JSON fixture sent as the body
    #[serde(alias = "jsonFixture")]
    pub json_fixture: Option<String>,
    /// Send one random element of the (array) JSON fixture instead of the whole document
    #[serde(default, alias = "randomItem")]
    pub random_item: bool,
    /// Text template
    pub text: Option<String>,
    pub multipart: Option<MultipartConfig>,
    #[serde(alias = "contentType")]
    pub content_type: Option<String>,
}

/// A named check. It passes when every condition set on it holds.
#[derive(Debug, Serialize, Deserialize, Clone, Default, JsonSchema)]
pub struct CheckConfig {
    pub name: String,
    pub status: Option<u16>,
    #[serde(alias = "statusIn")]
    pub status_in: Option<Vec<u16>>,
    /// Dotted path that must be present in the JSON response (e.g., "result.items")
    #[serde(alias = "jsonField")]
    pub json_field: Option<String>,
    /// Response must complete within this duration (e.g., "1000ms")
    #[serde(alias = "maxDuration")]
    pub max_duration: Option<String>,
    /// A failing fatal check ends the iteration as failed
    #[serde(default)]
    pub fatal: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, JsonSchema)]
pub struct RequestConfig {
    /// Endpoint tag used for grouping (default: the URL path)
    pub name: Option<String>,
    /// HTTP method (default: GET)
    pub method: Option<String>,
    /// URL template, e.g. "{{base_url}}/predict?topk={{rand_int:1:10}}"
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub body: Option<BodyConfig>,
    #[serde(default)]
    pub checks: Vec<CheckConfig>,
    /// Iteration variable name -> dotted JSON path in the response
    #[serde(default)]
    pub capture: BTreeMap<String, String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Per-request timeout overriding the document's requestTimeout
    pub timeout: Option<String>,
    #[serde(default, alias = "onRequestError")]
    pub on_request_error: OnRequestError,
}

/// Pacing wait: fixed ("1s") or uniform random between `min` and `max`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
#[serde(untagged)]
pub enum SleepConfig {
    Fixed(String),
    Range { min: String, max: String },
}

#[derive(Debug, Serialize, Deserialize, Clone, JsonSchema)]
pub struct ChoiceBranch {
    #[serde(default = "default_weight")]
    pub weight: f64,
    pub steps: Vec<StepConfig>,
}

fn default_weight() -> f64 {
    1.0
}

/// One step of an iteration function. Exactly one kind may be set.
#[derive(Debug, Serialize, Deserialize, Clone, Default, JsonSchema)]
pub struct StepConfig {
    pub request: Option<RequestConfig>,
    /// Requests issued in parallel
    pub batch: Option<Vec<RequestConfig>>,
    pub sleep: Option<SleepConfig>,
    /// Weighted random branch
    pub choice: Option<Vec<ChoiceBranch>>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, JsonSchema)]
pub struct FunctionConfig {
    pub steps: Vec<StepConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, JsonSchema)]
pub struct Config {
    /// Base URL for `{{base_url}}`. Overridden by BASE_URL / --base-url.
    #[serde(alias = "baseUrl")]
    pub base_url: Option<String>,
    /// Seed for every VU's random source (default: 0)
    pub seed: Option<u64>,
    /// Read response bodies off the wire without keeping them, unless a check or capture needs them
    #[serde(alias = "discardResponseBodies")]
    pub discard_response_bodies: Option<bool>,
    /// Default request timeout (default: "60s")
    #[serde(alias = "requestTimeout")]
    pub request_timeout: Option<String>,
    /// How often thresholds are evaluated during the run (default: "1s")
    #[serde(alias = "thresholdInterval")]
    pub threshold_interval: Option<String>,
    /// Make every threshold abort-on-fail
    #[serde(alias = "abortOnFail")]
    pub abort_on_fail: Option<bool>,
    /// Pass/Fail criteria: metric (with optional {tag:value} filter) -> expressions
    #[serde(default)]
    pub thresholds: BTreeMap<String, Vec<ThresholdEntry>>,
    #[serde(default)]
    pub fixtures: BTreeMap<String, FixtureConfig>,
    #[serde(default)]
    pub functions: BTreeMap<String, FunctionConfig>,
    #[serde(default)]
    #[schemars(with = "BTreeMap<String, ScenarioConfig>")]
    pub scenarios: ScenarioList,
}

impl Config {
    /// Load a YAML or JSON document. `.json` files are read as JSON, anything else as YAML.
    pub fn load_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));
        if is_json {
            serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
        } else {
            serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use schemars::schema_for;
    use std::io::Write;

    #[test]
    fn test_config_schema() {
        let schema = schema_for!(Config);
        let schema_json = serde_json::to_string(&schema).unwrap();
        assert!(schema_json.contains("scenarios"));
        assert!(schema_json.contains("thresholds"));
        assert!(schema_json.contains("fixtures"));
        assert!(schema_json.contains("preAllocatedVUs") || schema_json.contains("pre_allocated_vus"));
    }

    #[test]
    fn test_config_deserialize_camel_case() {
        let yaml = r#"
baseUrl: http://localhost:8080/api
discardResponseBodies: true
scenarios:
  predict_load:
    executor: ramping-arrival-rate
    startRate: 20
    timeUnit: 1s
    preAllocatedVUs: 100
    maxVUs: 600
    stages:
      - target: 100
        duration: 30m
    exec: predictLoad
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.base_url.as_deref(), Some("http://localhost:8080/api"));
        assert_eq!(config.discard_response_bodies, Some(true));
        let (name, scenario) = &config.scenarios.0[0];
        assert_eq!(name, "predict_load");
        assert_eq!(scenario.start_rate, Some(20));
        assert_eq!(scenario.pre_allocated_vus, Some(100));
        assert_eq!(scenario.max_vus, Some(600));
        assert_eq!(scenario.stages.as_ref().unwrap()[0].target, 100);
    }

    #[test]
    fn test_scenarios_keep_declaration_order() {
        let yaml = r#"
scenarios:
  zeta: {executor: ramping-vus}
  alpha: {executor: ramping-vus}
  mid: {executor: ramping-vus}
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let names: Vec<_> = config.scenarios.0.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn test_duplicate_scenarios_survive_parsing() {
        let json = r#"{"scenarios": {"steady": {"executor": "ramping-vus"}, "steady": {"executor": "ramping-vus"}}}"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.scenarios.0.len(), 2);
    }

    #[test]
    fn test_threshold_entries() {
        let yaml = r#"
thresholds:
  http_req_duration:
    - "p(95)<1500"
    - threshold: "p(99)<3000"
      abortOnFail: true
      delayAbortEval: 10s
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let entries = &config.thresholds["http_req_duration"];
        assert_eq!(entries[0], ThresholdEntry::Expression("p(95)<1500".to_string()));
        assert_eq!(
            entries[1],
            ThresholdEntry::Detailed {
                threshold: "p(99)<3000".to_string(),
                abort_on_fail: Some(true),
                delay_abort_eval: Some("10s".to_string()),
            }
        );
    }

    #[test]
    fn test_function_steps() {
        let yaml = r#"
functions:
  analyzeLoad:
    steps:
      - request:
          method: POST
          url: "{{base_url}}/analyze"
          body: {jsonFixture: analyze, randomItem: true}
          tags: {endpoint: analyze, type: memory}
          checks:
            - {name: analyze status is 200, status: 200}
            - {name: analyze under 1s, maxDuration: 1000ms}
      - sleep: {min: 100ms, max: 2500ms}
      - sleep: 1s
      - choice:
          - weight: 3
            steps: [{sleep: 10ms}]
          - steps: [{sleep: 20ms}]
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let steps = &config.functions["analyzeLoad"].steps;
        assert_eq!(steps.len(), 4);
        let request = steps[0].request.as_ref().unwrap();
        assert_eq!(request.method.as_deref(), Some("POST"));
        let body = request.body.as_ref().unwrap();
        assert_eq!(body.json_fixture.as_deref(), Some("analyze"));
        assert!(body.random_item);
        assert_eq!(request.checks[1].max_duration.as_deref(), Some("1000ms"));
        assert_eq!(request.on_request_error, OnRequestError::Continue);
        assert_eq!(
            steps[1].sleep,
            Some(SleepConfig::Range {
                min: "100ms".to_string(),
                max: "2500ms".to_string()
            })
        );
        assert_eq!(steps[2].sleep, Some(SleepConfig::Fixed("1s".to_string())));
        let branches = steps[3].choice.as_ref().unwrap();
        assert_eq!(branches[0].weight, 3.0);
        assert_eq!(branches[1].weight, 1.0);
    }

    #[test]
    fn test_load_file_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let json_path = dir.path().join("doc.json");
        std::fs::File::create(&json_path)
            .unwrap()
            .write_all(br#"{"seed": 7, "scenarios": {}}"#)
            .unwrap();
        assert_eq!(Config::load_file(&json_path).unwrap().seed, Some(7));

        let yaml_path = dir.path().join("doc.yaml");
        std::fs::write(&yaml_path, "seed: 9\n").unwrap();
        assert_eq!(Config::load_file(&yaml_path).unwrap().seed, Some(9));

        assert!(Config::load_file(&dir.path().join("missing.yaml")).is_err());
    }
}
