use futures::future::join_all;
use http::header::{HeaderName, CONTENT_TYPE};
use http::{HeaderValue, Method, Request};
use hyper::body::Bytes;
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::cli::config::{
    BodyConfig, CheckConfig, FunctionConfig, OnRequestError, RequestConfig, SleepConfig,
    StepConfig,
};
use crate::engine::clock::RunClock;
use crate::engine::fixtures::{Fixture, FixtureRegistry};
use crate::engine::http_client::{request_size, Transport, TransportResponse};
use crate::engine::pool::Vu;
use crate::engine::template::{Template, TemplateContext};
use crate::error::{ConfigError, TransportError};
use crate::stats::{CheckOutcome, IterationResult, RequestSample, RequestTimings, Tags};
use crate::utils::parse_duration_str;

#[derive(Debug)]
enum Condition {
    Status(u16),
    StatusIn(Vec<u16>),
    /// JSON pointer that must resolve to a non-null value.
    JsonField(String),
    MaxDuration(Duration),
}

#[derive(Debug)]
struct Check {
    name: String,
    conditions: Vec<Condition>,
    fatal: bool,
}

impl Check {
    fn passes(&self, status: u16, json: Option<&serde_json::Value>, duration: Duration) -> bool {
        self.conditions.iter().all(|c| match c {
            Condition::Status(want) => status == *want,
            Condition::StatusIn(set) => set.contains(&status),
            Condition::JsonField(ptr) => json
                .and_then(|v| v.pointer(ptr))
                .is_some_and(|v| !v.is_null()),
            Condition::MaxDuration(max) => status != 0 && duration <= *max,
        })
    }
}

#[derive(Debug)]
enum Body {
    Empty,
    Static {
        bytes: Bytes,
        content_type: Option<String>,
    },
    RandomItem {
        items: Arc<[Bytes]>,
        content_type: String,
    },
    Text {
        template: Template,
        content_type: String,
    },
    Multipart {
        field: String,
        filename: String,
        content_type: String,
        data: Bytes,
    },
}

#[derive(Debug)]
struct RequestStep {
    name: Option<String>,
    method: Method,
    url: Template,
    headers: Vec<(HeaderName, Template)>,
    body: Body,
    checks: Vec<Check>,
    /// variable -> JSON pointer
    captures: Vec<(String, String)>,
    tags: Tags,
    timeout: Option<Duration>,
    on_error: OnRequestError,
    needs_body: bool,
}

#[derive(Debug)]
enum Pacing {
    Fixed(Duration),
    Uniform(Duration, Duration),
}

#[derive(Debug)]
struct Choice {
    weights: WeightedIndex<f64>,
    branches: Vec<Vec<Step>>,
}

#[derive(Debug)]
enum Step {
    Request(Box<RequestStep>),
    Batch(Vec<RequestStep>),
    Sleep(Pacing),
    Choice(Choice),
}

/// A compiled, validated iteration function.
#[derive(Debug)]
pub struct IterationFunction {
    pub name: String,
    steps: Vec<Step>,
}

/// `result.items.0` -> `/result/items/0`. Paths already starting with `/` are pointers.
fn dotted_to_pointer(path: &str) -> String {
    if path.starts_with('/') {
        return path.to_string();
    }
    let mut pointer = String::new();
    for segment in path.split('.') {
        pointer.push('/');
        pointer.push_str(&segment.replace('~', "~0").replace('/', "~1"));
    }
    pointer
}

struct Compiler<'a> {
    function: &'a str,
    fixtures: &'a FixtureRegistry,
}

impl Compiler<'_> {
    fn step_error(&self, reason: impl Into<String>) -> ConfigError {
        ConfigError::InvalidStep {
            function: self.function.to_string(),
            reason: reason.into(),
        }
    }

    fn duration(&self, context: &str, value: &str) -> Result<Duration, ConfigError> {
        parse_duration_str(value).ok_or_else(|| ConfigError::InvalidDuration {
            context: format!("function `{}` {}", self.function, context),
            value: value.to_string(),
        })
    }

    fn fixture(&self, name: &str) -> Result<&Fixture, ConfigError> {
        self.fixtures
            .get(name)
            .ok_or_else(|| ConfigError::UnknownFixture {
                function: self.function.to_string(),
                fixture: name.to_string(),
            })
    }

    fn kind_error(&self, fixture: &str, expected: &'static str, actual: &Fixture) -> ConfigError {
        ConfigError::FixtureKind {
            function: self.function.to_string(),
            fixture: fixture.to_string(),
            expected,
            actual: actual.kind_name(),
        }
    }

    fn steps(&self, configs: &[StepConfig]) -> Result<Vec<Step>, ConfigError> {
        configs.iter().map(|c| self.step(c)).collect()
    }

    fn step(&self, config: &StepConfig) -> Result<Step, ConfigError> {
        let kinds = [
            config.request.is_some(),
            config.batch.is_some(),
            config.sleep.is_some(),
            config.choice.is_some(),
        ];
        if kinds.iter().filter(|k| **k).count() != 1 {
            return Err(self.step_error(
                "each step needs exactly one of `request`, `batch`, `sleep`, `choice`",
            ));
        }

        if let Some(request) = &config.request {
            return Ok(Step::Request(Box::new(self.request(request)?)));
        }
        if let Some(batch) = &config.batch {
            if batch.is_empty() {
                return Err(self.step_error("empty batch"));
            }
            let requests = batch
                .iter()
                .map(|r| self.request(r))
                .collect::<Result<_, _>>()?;
            return Ok(Step::Batch(requests));
        }
        if let Some(sleep) = &config.sleep {
            let pacing = match sleep {
                SleepConfig::Fixed(d) => Pacing::Fixed(self.duration("sleep", d)?),
                SleepConfig::Range { min, max } => {
                    let min = self.duration("sleep min", min)?;
                    let max = self.duration("sleep max", max)?;
                    if min > max {
                        return Err(self.step_error("sleep min is greater than max"));
                    }
                    Pacing::Uniform(min, max)
                }
            };
            return Ok(Step::Sleep(pacing));
        }

        let branches = config.choice.as_deref().unwrap_or_default();
        if branches.iter().any(|b| b.weight <= 0.0 || !b.weight.is_finite()) {
            return Err(self.step_error("choice weights must be positive"));
        }
        let weights = WeightedIndex::new(branches.iter().map(|b| b.weight))
            .map_err(|e| self.step_error(format!("choice: {}", e)))?;
        let compiled = branches
            .iter()
            .map(|b| self.steps(&b.steps))
            .collect::<Result<_, _>>()?;
        Ok(Step::Choice(Choice {
            weights,
            branches: compiled,
        }))
    }

    fn body(&self, config: &BodyConfig) -> Result<Body, ConfigError> {
        let sources = [
            config.json.is_some(),
            config.json_fixture.is_some(),
            config.text.is_some(),
            config.multipart.is_some(),
        ];
        match sources.iter().filter(|s| **s).count() {
            0 => return Ok(Body::Empty),
            1 => {}
            _ => {
                return Err(self.step_error(
                    "a body needs exactly one of `json`, `json_fixture`, `text`, `multipart`",
                ))
            }
        }
        let json_type = || {
            config
                .content_type
                .clone()
                .unwrap_or_else(|| "application/json".to_string())
        };

        if let Some(value) = &config.json {
            let bytes = serde_json::to_vec(value)
                .map_err(|e| self.step_error(format!("inline json: {}", e)))?;
            return Ok(Body::Static {
                bytes: Bytes::from(bytes),
                content_type: Some(json_type()),
            });
        }
        if let Some(name) = &config.json_fixture {
            let fixture = self.fixture(name)?;
            let Fixture::Json { whole, items, .. } = fixture else {
                return Err(self.kind_error(name, "json", fixture));
            };
            if config.random_item {
                if items.is_empty() {
                    return Err(self.step_error(format!(
                        "fixture `{}` must be a non-empty array for randomItem",
                        name
                    )));
                }
                return Ok(Body::RandomItem {
                    items: items.clone(),
                    content_type: json_type(),
                });
            }
            return Ok(Body::Static {
                bytes: whole.clone(),
                content_type: Some(json_type()),
            });
        }
        if let Some(text) = &config.text {
            return Ok(Body::Text {
                template: Template::parse(text)?,
                content_type: config
                    .content_type
                    .clone()
                    .unwrap_or_else(|| "text/plain".to_string()),
            });
        }

        let Some(multipart) = &config.multipart else {
            return Ok(Body::Empty);
        };
        let fixture = self.fixture(&multipart.fixture)?;
        let Fixture::Binary {
            bytes,
            filename,
            content_type,
        } = fixture
        else {
            return Err(self.kind_error(&multipart.fixture, "binary", fixture));
        };
        Ok(Body::Multipart {
            field: multipart.field.clone(),
            filename: multipart.filename.clone().unwrap_or_else(|| filename.clone()),
            content_type: multipart
                .content_type
                .clone()
                .unwrap_or_else(|| content_type.clone()),
            data: bytes.clone(),
        })
    }

    fn check(&self, config: &CheckConfig) -> Result<Check, ConfigError> {
        let mut conditions = Vec::new();
        if let Some(status) = config.status {
            conditions.push(Condition::Status(status));
        }
        if let Some(set) = &config.status_in {
            conditions.push(Condition::StatusIn(set.clone()));
        }
        if let Some(path) = &config.json_field {
            conditions.push(Condition::JsonField(dotted_to_pointer(path)));
        }
        if let Some(max) = &config.max_duration {
            let context = format!("check `{}`", config.name);
            conditions.push(Condition::MaxDuration(self.duration(&context, max)?));
        }
        if conditions.is_empty() {
            return Err(self.step_error(format!("check `{}` has no conditions", config.name)));
        }
        Ok(Check {
            name: config.name.clone(),
            conditions,
            fatal: config.fatal,
        })
    }

    fn request(&self, config: &RequestConfig) -> Result<RequestStep, ConfigError> {
        let method = config.method.as_deref().unwrap_or("GET").to_ascii_uppercase();
        let method = Method::from_bytes(method.as_bytes())
            .map_err(|_| self.step_error(format!("invalid method `{}`", method)))?;

        let mut headers = Vec::with_capacity(config.headers.len());
        for (name, value) in &config.headers {
            let header = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| self.step_error(format!("invalid header name `{}`", name)))?;
            headers.push((header, Template::parse(value)?));
        }

        let body = match &config.body {
            Some(body) => self.body(body)?,
            None => Body::Empty,
        };
        let checks = config
            .checks
            .iter()
            .map(|c| self.check(c))
            .collect::<Result<Vec<_>, _>>()?;
        let captures: Vec<_> = config
            .capture
            .iter()
            .map(|(var, path)| (var.clone(), dotted_to_pointer(path)))
            .collect();
        let timeout = config
            .timeout
            .as_deref()
            .map(|t| self.duration("request timeout", t))
            .transpose()?;

        let needs_body = !captures.is_empty()
            || checks
                .iter()
                .flat_map(|c| &c.conditions)
                .any(|c| matches!(c, Condition::JsonField(_)));

        Ok(RequestStep {
            name: config.name.clone(),
            method,
            url: Template::parse(&config.url)?,
            headers,
            body,
            checks,
            captures,
            tags: config.tags.clone(),
            timeout,
            on_error: config.on_request_error,
            needs_body,
        })
    }
}

/// All iteration functions of a document, compiled once.
#[derive(Debug, Default)]
pub struct FunctionSet {
    functions: HashMap<String, Arc<IterationFunction>>,
}

impl FunctionSet {
    pub fn compile(
        configs: &BTreeMap<String, FunctionConfig>,
        fixtures: &FixtureRegistry,
    ) -> Result<Self, ConfigError> {
        let mut functions = HashMap::with_capacity(configs.len());
        for (name, config) in configs {
            let compiler = Compiler {
                function: name,
                fixtures,
            };
            let steps = compiler.steps(&config.steps)?;
            functions.insert(
                name.clone(),
                Arc::new(IterationFunction {
                    name: name.clone(),
                    steps,
                }),
            );
        }
        Ok(Self { functions })
    }

    pub fn get(&self, name: &str) -> Option<Arc<IterationFunction>> {
        self.functions.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }
}

enum Sent {
    Response(TransportResponse),
    Failed(TransportError, Duration),
    Cancelled,
}

/// What is known about a request before it is sent.
struct RequestMeta {
    name: String,
    size: usize,
}

type Prepared = (RequestMeta, Result<Request<Bytes>, TransportError>);

/// Runs iteration functions against a transport.
pub struct Sandbox {
    transport: Arc<dyn Transport>,
    base_url: Arc<str>,
    discard_bodies: bool,
    request_timeout: Duration,
}

struct IterationState {
    samples: Vec<RequestSample>,
    checks: Vec<CheckOutcome>,
    passed: bool,
    interrupted: bool,
}

impl Sandbox {
    pub fn new(
        transport: Arc<dyn Transport>,
        base_url: impl Into<Arc<str>>,
        discard_bodies: bool,
        request_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            base_url: base_url.into(),
            discard_bodies,
            request_timeout,
        }
    }

    /// Run one iteration of `function` on `vu`. Every suspension point observes
    /// `clock`'s token; once it fires the iteration stops and is marked interrupted.
    pub async fn run_iteration(
        &self,
        function: &IterationFunction,
        vu: &mut Vu,
        clock: &RunClock,
        scenario_tags: &Tags,
    ) -> IterationResult {
        vu.scope.clear();
        let iteration = vu.iterations;
        vu.iterations += 1;

        let started = clock.now();
        let mut state = IterationState {
            samples: Vec::new(),
            checks: Vec::new(),
            passed: true,
            interrupted: false,
        };

        let mut stack = vec![function.steps.iter()];
        loop {
            let Some(frame) = stack.last_mut() else {
                break;
            };
            let Some(step) = frame.next() else {
                stack.pop();
                continue;
            };
            if clock.is_cancelled() {
                state.interrupted = true;
                break;
            }

            let keep_going = match step {
                Step::Request(request) => {
                    let (meta, prepared) = self.prepare(request, vu, iteration);
                    let sent = self.send(request, prepared, clock.token()).await;
                    self.finish(request, meta, sent, vu, clock, scenario_tags, &mut state)
                }
                Step::Batch(requests) => {
                    let (metas, prepared): (Vec<_>, Vec<_>) = requests
                        .iter()
                        .map(|r| self.prepare(r, vu, iteration))
                        .unzip();
                    let sent = join_all(
                        requests
                            .iter()
                            .zip(prepared)
                            .map(|(r, p)| self.send(r, p, clock.token())),
                    )
                    .await;
                    let mut keep_going = true;
                    for ((request, meta), sent) in requests.iter().zip(metas).zip(sent) {
                        keep_going &=
                            self.finish(request, meta, sent, vu, clock, scenario_tags, &mut state);
                    }
                    keep_going
                }
                Step::Sleep(pacing) => {
                    let d = match pacing {
                        Pacing::Fixed(d) => *d,
                        Pacing::Uniform(min, max) => {
                            let nanos =
                                |d: &Duration| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX);
                            Duration::from_nanos(vu.rng.gen_range(nanos(min)..=nanos(max)))
                        }
                    };
                    if !clock.sleep_for(d).await {
                        state.interrupted = true;
                    }
                    !state.interrupted
                }
                Step::Choice(choice) => {
                    let branch = choice.weights.sample(&mut vu.rng);
                    stack.push(choice.branches[branch].iter());
                    true
                }
            };
            if !keep_going {
                break;
            }
        }

        IterationResult {
            vu_id: vu.id,
            scenario: vu.scenario.clone(),
            started,
            ended: clock.now(),
            samples: state.samples,
            checks: state.checks,
            passed: state.passed,
            interrupted: state.interrupted,
        }
    }

    fn prepare(&self, step: &RequestStep, vu: &mut Vu, iteration: u64) -> Prepared {
        let ctx = TemplateContext {
            base_url: &self.base_url,
            vu: vu.id,
            iteration,
            scenario: &vu.scenario,
            scope: &vu.scope,
        };
        let rng = &mut vu.rng;
        let url = step.url.render(&ctx, rng);

        let (body, content_type) = match &step.body {
            Body::Empty => (Bytes::new(), None),
            Body::Static {
                bytes,
                content_type,
            } => (bytes.clone(), content_type.clone()),
            Body::RandomItem {
                items,
                content_type,
            } => (
                items[rng.gen_range(0..items.len())].clone(),
                Some(content_type.clone()),
            ),
            Body::Text {
                template,
                content_type,
            } => (
                Bytes::from(template.render(&ctx, rng)),
                Some(content_type.clone()),
            ),
            Body::Multipart {
                field,
                filename,
                content_type,
                data,
            } => {
                let boundary = format!("----volley{:016x}", rng.gen::<u64>());
                let mut buf = Vec::with_capacity(data.len() + 256);
                buf.extend_from_slice(
                    format!(
                        "--{}\r\nContent-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: {}\r\n\r\n",
                        boundary, field, filename, content_type
                    )
                    .as_bytes(),
                );
                buf.extend_from_slice(data);
                buf.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());
                (
                    Bytes::from(buf),
                    Some(format!("multipart/form-data; boundary={}", boundary)),
                )
            }
        };

        let mut builder = Request::builder().method(step.method.clone()).uri(url.as_str());
        let mut has_content_type = false;
        for (name, value) in &step.headers {
            has_content_type |= *name == CONTENT_TYPE;
            builder = builder.header(name, value.render(&ctx, rng));
        }
        if let (false, Some(ct)) = (has_content_type, content_type) {
            match HeaderValue::from_str(&ct) {
                Ok(v) => builder = builder.header(CONTENT_TYPE, v),
                Err(e) => tracing::debug!(error = %e, "skipping invalid content type"),
            }
        }

        match builder.body(body) {
            Ok(request) => {
                let meta = RequestMeta {
                    name: step
                        .name
                        .clone()
                        .unwrap_or_else(|| request.uri().path().to_string()),
                    size: request_size(&request),
                };
                (meta, Ok(request))
            }
            Err(e) => {
                let meta = RequestMeta {
                    name: step.name.clone().unwrap_or(url),
                    size: 0,
                };
                (meta, Err(TransportError::InvalidRequest(e.to_string())))
            }
        }
    }

    async fn send(
        &self,
        step: &RequestStep,
        prepared: Result<Request<Bytes>, TransportError>,
        token: &CancellationToken,
    ) -> Sent {
        let request = match prepared {
            Ok(request) => request,
            Err(e) => return Sent::Failed(e, Duration::ZERO),
        };
        let discard = self.discard_bodies && !step.needs_body;
        let timeout = step.timeout.unwrap_or(self.request_timeout);
        let start = tokio::time::Instant::now();
        tokio::select! {
            biased;
            _ = token.cancelled() => Sent::Cancelled,
            r = tokio::time::timeout(timeout, self.transport.send(request, discard)) => match r {
                Ok(Ok(response)) => Sent::Response(response),
                Ok(Err(e)) => Sent::Failed(e, start.elapsed()),
                Err(_) => Sent::Failed(TransportError::Timeout, start.elapsed()),
            },
        }
    }

    /// Record the request's sample and checks. Returns `false` when the iteration must stop.
    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        step: &RequestStep,
        meta: RequestMeta,
        sent: Sent,
        vu: &mut Vu,
        clock: &RunClock,
        scenario_tags: &Tags,
        state: &mut IterationState,
    ) -> bool {
        let (status, timings, error, response) = match sent {
            Sent::Cancelled => {
                state.interrupted = true;
                return false;
            }
            Sent::Response(resp) => (resp.status.as_u16(), resp.timings, None, Some(resp)),
            Sent::Failed(e, elapsed) => (
                0,
                RequestTimings {
                    duration: elapsed,
                    request_size: meta.size,
                    ..Default::default()
                },
                Some(e.to_string()),
                None,
            ),
        };

        let mut tags = scenario_tags.clone();
        tags.extend(step.tags.iter().map(|(k, v)| (k.clone(), v.clone())));
        let sample = RequestSample {
            method: step.method.to_string(),
            name: meta.name,
            status,
            timings,
            timestamp: clock.now().saturating_sub(timings.duration),
            error,
            tags,
        };
        let failed_transport = sample.error.is_some();
        if let Some(err) = &sample.error {
            tracing::debug!(vu = vu.id, endpoint = %sample.name, error = %err, "request failed");
        }
        state.samples.push(sample);

        let json = if step.needs_body {
            response.as_ref().and_then(TransportResponse::json)
        } else {
            None
        };

        let mut fatal_failed = false;
        for check in &step.checks {
            let passed = check.passes(status, json.as_ref(), timings.duration);
            if !passed && check.fatal {
                fatal_failed = true;
            }
            state.checks.push(CheckOutcome {
                name: check.name.clone(),
                passed,
            });
        }

        if let Some(json) = &json {
            for (var, pointer) in &step.captures {
                match json.pointer(pointer) {
                    Some(serde_json::Value::String(s)) => vu.scope.set(var.clone(), s.clone()),
                    Some(serde_json::Value::Null) | None => {}
                    Some(other) => vu.scope.set(var.clone(), other.to_string()),
                }
            }
        }

        if fatal_failed || (failed_transport && step.on_error == OnRequestError::Abort) {
            state.passed = false;
            return false;
        }
        true
    }
}
