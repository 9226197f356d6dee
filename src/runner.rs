//! Load test orchestration: setup, scheduling, drain, verdict.

use crate::config::LoadProfile;
use crate::error::EngineResult;
use crate::exec::{ReqwestExecutor, RequestExecutor};
use crate::metrics::{MetricsAggregator, Snapshot};
use crate::pool::VuPool;
use crate::scenario::{
    self, RequestLogSink, Scenario, ScenarioRuntime, METRIC_ERRORS, METRIC_HTTP_REQS,
    METRIC_HTTP_REQ_DURATION, METRIC_HTTP_REQ_FAILED, METRIC_ITERATIONS,
};
use crate::thresholds::Verdict;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, Instant, MissedTickBehavior};

/// Control-loop cadence: targets are recomputed once per second.
const SCHEDULER_TICK: Duration = Duration::from_secs(1);

/// Executes a load test run end to end.
pub struct LoadRunner {
    executor: Arc<dyn RequestExecutor>,
    profile: LoadProfile,
}

impl LoadRunner {
    /// Create a runner backed by a real HTTP client.
    pub fn new(profile: LoadProfile) -> Self {
        let executor = Arc::new(ReqwestExecutor::new(
            profile.request_timeout(),
            profile.peak_target() as usize,
        ));
        Self { executor, profile }
    }

    /// Create a runner with an injected request executor.
    pub fn with_executor(profile: LoadProfile, executor: Arc<dyn RequestExecutor>) -> Self {
        Self { executor, profile }
    }

    /// Run the default collaboration-service scenario.
    pub async fn run(&self) -> EngineResult<RunReport> {
        self.run_scenario(Scenario::collab_default(&self.profile))
            .await
    }

    /// Run a specific scenario under this runner's profile.
    pub async fn run_scenario(&self, scenario: Scenario) -> EngineResult<RunReport> {
        self.profile.validate()?;
        let thresholds = self.profile.parse_thresholds()?;
        let plan = self.profile.stage_plan();
        let metrics = Arc::new(MetricsAggregator::new());

        println!("Starting load test: {}", self.profile.name);
        println!(
            "  Stages: {} ({}s total)",
            self.profile.stages.len(),
            plan.total_duration().as_secs()
        );
        println!("  Think time: {}ms", self.profile.think_time_ms);
        println!("  Thresholds: {}", thresholds.len());
        println!();

        // Setup runs strictly before any virtual user starts.
        let setup = scenario::run_setup(&self.executor, &metrics, &self.profile).await?;
        tracing::info!(team_created = setup.team_created, "setup complete");

        let request_log = if self.profile.log_requests {
            std::fs::create_dir_all("results")?;
            let name = self.profile.name.replace(' ', "_").to_lowercase();
            let log_path = format!(
                "results/{}_{}.jsonl",
                name,
                chrono::Utc::now().format("%Y%m%d_%H%M%S")
            );
            println!("  Logging requests to: {}", log_path);
            Some(Arc::new(RequestLogSink::create(&log_path)?))
        } else {
            None
        };

        let runtime = Arc::new(ScenarioRuntime {
            executor: self.executor.clone(),
            metrics: metrics.clone(),
            base_url: self.profile.base_url.clone(),
            setup: Arc::new(setup.clone()),
            request_log: request_log.clone(),
        });
        let scenario = Arc::new(scenario);
        let mut pool = VuPool::new(
            scenario.clone(),
            runtime.clone(),
            self.profile.think_time(),
            self.profile.seed,
        );

        let total_secs = plan.total_duration().as_secs();
        let pb = ProgressBar::new(total_secs);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len}s {msg}")
                .expect("Invalid progress bar template")
                .progress_chars("##-"),
        );

        let start = Instant::now();
        let mut ticker = interval(SCHEDULER_TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Control loop: only signals desired concurrency, never runs requests.
        loop {
            ticker.tick().await;
            let elapsed = start.elapsed();
            if elapsed >= plan.total_duration() {
                break;
            }
            let target = plan.target_at(elapsed);
            pool.resize(target as usize);
            pb.set_position(elapsed.as_secs().min(total_secs));
            pb.set_message(format!("VUs: {}/{}", pool.live(), target));
        }

        pb.set_message("Draining...");
        pool.drain(self.profile.grace()).await;
        let elapsed = start.elapsed();
        pb.finish_with_message("Complete!");
        println!();

        // Verdict comes from the post-drain snapshot; teardown runs after it
        // and cannot change the outcome.
        let snapshot = metrics.snapshot(elapsed);
        let verdict = Verdict::evaluate(&thresholds, &snapshot)?;
        scenario::run_teardown(&scenario, &runtime).await;
        if let Some(log) = &request_log {
            log.flush();
        }

        Ok(RunReport::build(&self.profile, &setup, &snapshot, verdict))
    }
}

/// Final run artifact: totals, latency summary and the verdict.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub timestamp: String,
    pub name: String,
    pub duration_secs: f64,
    pub team_created: bool,
    pub iterations: u64,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub requests_per_second: f64,
    pub error_rate: f64,

    // Latency over all request steps (ms)
    pub latency_p50: f64,
    pub latency_p90: f64,
    pub latency_p95: f64,
    pub latency_p99: f64,
    pub latency_min: f64,
    pub latency_max: f64,
    pub latency_avg: f64,

    pub verdict: Verdict,
}

impl RunReport {
    fn build(
        profile: &LoadProfile,
        setup: &scenario::SetupResult,
        snapshot: &Snapshot,
        verdict: Verdict,
    ) -> Self {
        let durations = snapshot
            .merge_matching(METRIC_HTTP_REQ_DURATION, |_| true)
            .ok()
            .flatten();
        let pct = |p: f64| {
            durations
                .as_ref()
                .and_then(|d| d.percentile_ms(p))
                .unwrap_or(0.0)
        };

        let requests = snapshot
            .merge_matching(METRIC_HTTP_REQS, |_| true)
            .ok()
            .flatten();
        let failed = snapshot
            .merge_matching(METRIC_HTTP_REQ_FAILED, |_| true)
            .ok()
            .flatten();
        let errors = snapshot
            .merge_matching(METRIC_ERRORS, |_| true)
            .ok()
            .flatten();
        let iterations = snapshot
            .merge_matching(METRIC_ITERATIONS, |_| true)
            .ok()
            .flatten();

        let total_requests = requests.as_ref().map(|s| s.count()).unwrap_or(0);

        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            name: profile.name.clone(),
            duration_secs: snapshot.elapsed().as_secs_f64(),
            team_created: setup.team_created,
            iterations: iterations.map(|s| s.count()).unwrap_or(0),
            total_requests,
            failed_requests: failed
                .as_ref()
                .and_then(|s| s.true_count())
                .unwrap_or(0),
            requests_per_second: requests
                .as_ref()
                .map(|s| s.per_second(snapshot.elapsed()))
                .unwrap_or(0.0),
            error_rate: errors.and_then(|s| s.rate_fraction()).unwrap_or(0.0),
            latency_p50: pct(50.0),
            latency_p90: pct(90.0),
            latency_p95: pct(95.0),
            latency_p99: pct(99.0),
            latency_min: durations.as_ref().and_then(|d| d.min_ms()).unwrap_or(0.0),
            latency_max: durations.as_ref().and_then(|d| d.max_ms()).unwrap_or(0.0),
            latency_avg: durations.as_ref().and_then(|d| d.mean()).unwrap_or(0.0),
            verdict,
        }
    }
}
