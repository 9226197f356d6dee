//! Scenario program: request steps, checks, and the setup/teardown phases.
//!
//! Each virtual user runs one iteration of the scenario per loop pass. A step
//! issues one request through the executor and feeds the built-in series:
//! `http_reqs`, `http_req_duration` and `http_req_failed` (tagged with the
//! step name), `checks` (tagged with the check name), and the shared `errors`
//! rate series which tracks the fraction of steps with any failed check.

use crate::config::LoadProfile;
use crate::error::{EngineError, EngineResult};
use crate::exec::{ExecutedResponse, RequestExecutor, StepRequest};
use crate::metrics::{tag, MetricsAggregator, Observation, Tags};
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use serde::Serialize;
use serde_json::json;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub const METRIC_HTTP_REQS: &str = "http_reqs";
pub const METRIC_HTTP_REQ_DURATION: &str = "http_req_duration";
pub const METRIC_HTTP_REQ_FAILED: &str = "http_req_failed";
pub const METRIC_CHECKS: &str = "checks";
pub const METRIC_ERRORS: &str = "errors";
pub const METRIC_ITERATIONS: &str = "iterations";

/// Step-name tag applied to the setup phase's request.
pub const SETUP_STEP_NAME: &str = "setup_create_team";

/// Per-unit execution context: id, iteration counter and own RNG.
///
/// The RNG drives sampling draws and is injectable so tests can supply a
/// deterministic source.
pub struct VuContext {
    pub id: u64,
    pub iteration: u64,
    rng: Box<dyn RngCore + Send>,
}

impl VuContext {
    pub fn new(id: u64, seed: Option<u64>) -> Self {
        let rng: Box<dyn RngCore + Send> = match seed {
            Some(seed) => Box::new(StdRng::seed_from_u64(seed.wrapping_add(id))),
            None => Box::new(StdRng::from_entropy()),
        };
        Self::with_rng(id, rng)
    }

    pub fn with_rng(id: u64, rng: Box<dyn RngCore + Send>) -> Self {
        Self {
            id,
            iteration: 0,
            rng,
        }
    }

    fn draw(&mut self) -> f64 {
        self.rng.gen()
    }
}

/// Immutable value produced by the setup phase, shared read-only with every unit.
#[derive(Debug, Clone, Serialize)]
pub struct SetupResult {
    pub team_created: bool,
}

/// Named boolean assertion evaluated against a step's response.
#[derive(Debug, Clone)]
pub struct Check {
    pub name: String,
    pub kind: CheckKind,
}

#[derive(Debug, Clone)]
pub enum CheckKind {
    StatusIs(u16),
    StatusIn(Vec<u16>),
    DurationUnder(Duration),
    BodyContains(String),
}

impl Check {
    pub fn new(name: impl Into<String>, kind: CheckKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    fn passes(&self, response: &ExecutedResponse) -> bool {
        match &self.kind {
            CheckKind::StatusIs(status) => response.status == *status,
            CheckKind::StatusIn(statuses) => statuses.contains(&response.status),
            CheckKind::DurationUnder(limit) => response.duration < *limit,
            CheckKind::BodyContains(needle) => response.body.contains(needle),
        }
    }
}

/// How a step builds its outbound request.
#[derive(Debug, Clone)]
pub enum RequestSpec {
    Health,
    GetTeam { team_name: String },
    CreatePullRequest { author_id: String },
}

/// One scenario step: a request plus its checks.
#[derive(Debug, Clone)]
pub struct Step {
    pub name: String,
    pub request: RequestSpec,
    pub checks: Vec<Check>,
    /// Statuses that do not count toward `http_req_failed`.
    pub expected_statuses: Vec<u16>,
    /// Execute with this probability per iteration; `None` always executes.
    pub sample_probability: Option<f64>,
}

impl Step {
    fn build_request(&self, base_url: &str, ctx: &VuContext) -> StepRequest {
        match &self.request {
            RequestSpec::Health => StepRequest::get(format!("{}/health", base_url)),
            RequestSpec::GetTeam { team_name } => StepRequest::get(format!(
                "{}/team/get?team_name={}",
                base_url, team_name
            )),
            RequestSpec::CreatePullRequest { author_id } => {
                // vu id + iteration never repeat across the run, so the token
                // stays unique even when the millisecond clock is coarse.
                let token = format!(
                    "pr-load-{}-{}-{}",
                    ctx.id,
                    ctx.iteration,
                    chrono::Utc::now().timestamp_millis()
                );
                StepRequest::post_json(
                    format!("{}/pullRequest/create", base_url),
                    json!({
                        "pull_request_id": token,
                        "pull_request_name": "Load Test PR",
                        "author_id": author_id,
                    }),
                )
            }
        }
    }
}

/// The ordered step list one virtual user executes per iteration.
#[derive(Debug, Clone)]
pub struct Scenario {
    pub steps: Vec<Step>,
    /// Optional request executed once after the pool has drained.
    pub teardown: Option<Step>,
}

impl Scenario {
    /// Default scenario against the collaboration service: health check,
    /// team read, and a sampled pull-request creation.
    pub fn collab_default(profile: &LoadProfile) -> Self {
        let under_300 = CheckKind::DurationUnder(Duration::from_millis(300));
        Self {
            steps: vec![
                Step {
                    name: "health".to_string(),
                    request: RequestSpec::Health,
                    checks: vec![
                        Check::new("health check status is 200", CheckKind::StatusIs(200)),
                        Check::new("health check response time < 300ms", under_300.clone()),
                    ],
                    expected_statuses: vec![200],
                    sample_probability: None,
                },
                Step {
                    name: "get_team".to_string(),
                    request: RequestSpec::GetTeam {
                        team_name: profile.team_name.clone(),
                    },
                    checks: vec![
                        Check::new("get team status is 200", CheckKind::StatusIs(200)),
                        Check::new("get team response time < 300ms", under_300.clone()),
                    ],
                    expected_statuses: vec![200],
                    sample_probability: None,
                },
                Step {
                    name: "create_pr".to_string(),
                    request: RequestSpec::CreatePullRequest {
                        author_id: profile.author_id.clone(),
                    },
                    checks: vec![
                        Check::new(
                            "create PR status is 201 or 400",
                            CheckKind::StatusIn(vec![201, 400]),
                        ),
                        Check::new("create PR response time < 300ms", under_300),
                    ],
                    expected_statuses: vec![201, 400],
                    sample_probability: Some(profile.create_pr_probability),
                },
            ],
            teardown: None,
        }
    }
}

/// A single logged request for debugging and visualization.
#[derive(Debug, Serialize)]
pub struct RequestLog {
    pub timestamp_ms: i64,
    pub vu: u64,
    pub iteration: u64,
    pub step: String,
    pub method: String,
    pub url: String,
    pub status: Option<u16>,
    pub latency_ms: Option<f64>,
    pub error: Option<String>,
}

/// JSONL sink for per-request logs.
pub struct RequestLogSink {
    writer: parking_lot::Mutex<BufWriter<File>>,
}

impl RequestLogSink {
    pub fn create(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            writer: parking_lot::Mutex::new(BufWriter::new(file)),
        })
    }

    fn write(&self, entry: &RequestLog) {
        if let Ok(json) = serde_json::to_string(entry) {
            let mut writer = self.writer.lock();
            let _ = writeln!(writer, "{}", json);
        }
    }

    pub fn flush(&self) {
        let _ = self.writer.lock().flush();
    }
}

/// Everything a virtual user needs to execute iterations. Shared state is
/// read-only except the aggregator, which is internally synchronized.
pub struct ScenarioRuntime {
    pub executor: Arc<dyn RequestExecutor>,
    pub metrics: Arc<MetricsAggregator>,
    pub base_url: String,
    pub setup: Arc<SetupResult>,
    pub request_log: Option<Arc<RequestLogSink>>,
}

/// Execute the setup phase: create the load-test team exactly once.
///
/// 201 (created) and 400 (already exists) are both non-failing outcomes and
/// produce an equivalent SetupResult. Any other status is logged and leaves
/// `team_created` false without aborting; a transport error is fatal, since
/// no usable SetupResult can be produced before load starts.
pub async fn run_setup(
    executor: &Arc<dyn RequestExecutor>,
    metrics: &MetricsAggregator,
    profile: &LoadProfile,
) -> EngineResult<SetupResult> {
    let payload = json!({
        "team_name": profile.team_name,
        "members": profile.members,
    });
    let request = StepRequest::post_json(format!("{}/team/add", profile.base_url), payload);
    let tags = tag("name", SETUP_STEP_NAME);

    metrics.record(Observation::counter(METRIC_HTTP_REQS, tags.clone(), 1.0));
    match executor.send(request).await {
        Ok(response) => {
            metrics.record(Observation::duration(
                METRIC_HTTP_REQ_DURATION,
                tags.clone(),
                response.duration,
            ));
            let created = response.status == 201 || response.status == 400;
            metrics.record(Observation::rate(METRIC_HTTP_REQ_FAILED, tags, !created));
            if !created {
                tracing::warn!(
                    status = response.status,
                    body = %response.body,
                    "Failed to create test team"
                );
            }
            Ok(SetupResult {
                team_created: created,
            })
        }
        Err(e) => {
            metrics.record(Observation::rate(METRIC_HTTP_REQ_FAILED, tags, true));
            Err(EngineError::SetupFailed(e.to_string()))
        }
    }
}

/// Execute the teardown step, if any. Runs after the verdict snapshot, so a
/// failure here is reported but cannot change the verdict.
pub async fn run_teardown(scenario: &Scenario, runtime: &ScenarioRuntime) {
    let Some(step) = &scenario.teardown else {
        return;
    };
    let ctx = VuContext::new(0, None);
    let request = step.build_request(&runtime.base_url, &ctx);
    match runtime.executor.send(request).await {
        Ok(response) if step.expected_statuses.contains(&response.status) => {
            tracing::info!(step = %step.name, "teardown complete");
        }
        Ok(response) => {
            tracing::warn!(step = %step.name, status = response.status, "teardown failed");
        }
        Err(e) => {
            tracing::warn!(step = %step.name, error = %e, "teardown failed");
        }
    }
}

/// Run one full pass of the scenario for one unit.
pub async fn run_iteration(scenario: &Scenario, ctx: &mut VuContext, runtime: &ScenarioRuntime) {
    for step in &scenario.steps {
        run_step(step, ctx, runtime).await;
    }
    runtime.metrics.record(Observation::counter(
        METRIC_ITERATIONS,
        Tags::new(),
        1.0,
    ));
    ctx.iteration += 1;
}

async fn run_step(step: &Step, ctx: &mut VuContext, runtime: &ScenarioRuntime) {
    if let Some(p) = step.sample_probability {
        if ctx.draw() >= p {
            return;
        }
    }

    let request = step.build_request(&runtime.base_url, ctx);
    let method = request.method.to_string();
    let url = request.url.clone();
    let name_tags = tag("name", &step.name);

    runtime.metrics.record(Observation::counter(
        METRIC_HTTP_REQS,
        name_tags.clone(),
        1.0,
    ));

    match runtime.executor.send(request).await {
        Ok(response) => {
            runtime.metrics.record(Observation::duration(
                METRIC_HTTP_REQ_DURATION,
                name_tags.clone(),
                response.duration,
            ));
            let failed = !step.expected_statuses.contains(&response.status);
            runtime.metrics.record(Observation::rate(
                METRIC_HTTP_REQ_FAILED,
                name_tags,
                failed,
            ));

            let mut all_passed = true;
            for check in &step.checks {
                let passed = check.passes(&response);
                all_passed &= passed;
                runtime.metrics.record(Observation::rate(
                    METRIC_CHECKS,
                    tag("check", &check.name),
                    passed,
                ));
            }
            runtime
                .metrics
                .record(Observation::rate(METRIC_ERRORS, Tags::new(), !all_passed));

            if let Some(log) = &runtime.request_log {
                log.write(&RequestLog {
                    timestamp_ms: chrono::Utc::now().timestamp_millis(),
                    vu: ctx.id,
                    iteration: ctx.iteration,
                    step: step.name.clone(),
                    method,
                    url,
                    status: Some(response.status),
                    latency_ms: Some(response.duration.as_secs_f64() * 1000.0),
                    error: None,
                });
            }
        }
        Err(e) => {
            tracing::debug!(step = %step.name, vu = ctx.id, error = %e, "request failed");
            runtime
                .metrics
                .record(Observation::rate(METRIC_HTTP_REQ_FAILED, name_tags, true));
            for check in &step.checks {
                runtime.metrics.record(Observation::rate(
                    METRIC_CHECKS,
                    tag("check", &check.name),
                    false,
                ));
            }
            runtime
                .metrics
                .record(Observation::rate(METRIC_ERRORS, Tags::new(), true));

            if let Some(log) = &runtime.request_log {
                log.write(&RequestLog {
                    timestamp_ms: chrono::Utc::now().timestamp_millis(),
                    vu: ctx.id,
                    iteration: ctx.iteration,
                    step: step.name.clone(),
                    method,
                    url,
                    status: None,
                    latency_ms: None,
                    error: Some(e.message),
                });
            }
        }
    }
}
