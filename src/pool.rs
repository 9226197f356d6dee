//! Virtual user pool: spawn, retire and drain of independent execution units.

use crate::scenario::{run_iteration, Scenario, ScenarioRuntime, VuContext};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

struct VuHandle {
    id: u64,
    stop: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

/// Dynamically sized set of virtual-user tasks.
///
/// Units execute fully independently: the only shared state is the read-only
/// setup result and the aggregator inside the [`ScenarioRuntime`]. Retiring a
/// unit sets its stop flag; the unit exits after finishing its current
/// iteration, never mid-request.
pub struct VuPool {
    scenario: Arc<Scenario>,
    runtime: Arc<ScenarioRuntime>,
    think_time: Duration,
    seed: Option<u64>,
    active: Vec<VuHandle>,
    retired: Vec<VuHandle>,
    next_id: u64,
}

impl VuPool {
    pub fn new(
        scenario: Arc<Scenario>,
        runtime: Arc<ScenarioRuntime>,
        think_time: Duration,
        seed: Option<u64>,
    ) -> Self {
        Self {
            scenario,
            runtime,
            think_time,
            seed,
            active: Vec::new(),
            retired: Vec::new(),
            next_id: 0,
        }
    }

    /// Number of units that have not been told to stop.
    pub fn live(&self) -> usize {
        self.active.len()
    }

    /// Grow or shrink the live set toward the scheduler's target.
    pub fn resize(&mut self, target: usize) {
        while self.active.len() < target {
            self.spawn_one();
        }
        if self.active.len() > target {
            self.retire(self.active.len() - target);
        }
    }

    fn spawn_one(&mut self) {
        self.next_id += 1;
        let id = self.next_id;
        let stop = Arc::new(AtomicBool::new(false));
        let ctx = VuContext::new(id, self.seed);
        let task = tokio::spawn(vu_loop(
            ctx,
            self.scenario.clone(),
            self.runtime.clone(),
            self.think_time,
            stop.clone(),
        ));
        tracing::debug!(vu = id, "spawned virtual user");
        self.active.push(VuHandle { id, stop, task });
    }

    /// Mark the n most-recently-spawned units for retirement.
    pub fn retire(&mut self, n: usize) {
        for _ in 0..n {
            if let Some(handle) = self.active.pop() {
                tracing::debug!(vu = handle.id, "retiring virtual user");
                handle.stop.store(true, Ordering::Relaxed);
                self.retired.push(handle);
            }
        }
    }

    pub fn retire_all(&mut self) {
        self.retire(self.active.len());
    }

    /// Retire everything and wait for all units to exit.
    ///
    /// Units finish their in-flight iteration; tasks still running when the
    /// grace period expires are aborted.
    pub async fn drain(mut self, grace: Duration) {
        self.retire_all();
        let mut handles = std::mem::take(&mut self.retired);

        let all_exited = tokio::time::timeout(grace, async {
            for handle in handles.iter_mut() {
                let _ = (&mut handle.task).await;
            }
        })
        .await;

        if all_exited.is_err() {
            let mut aborted = 0usize;
            for handle in &handles {
                if !handle.task.is_finished() {
                    handle.task.abort();
                    aborted += 1;
                }
            }
            tracing::warn!(aborted, "grace period expired; aborted unfinished virtual users");
        }
    }
}

async fn vu_loop(
    mut ctx: VuContext,
    scenario: Arc<Scenario>,
    runtime: Arc<ScenarioRuntime>,
    think_time: Duration,
    stop: Arc<AtomicBool>,
) {
    loop {
        run_iteration(&scenario, &mut ctx, &runtime).await;
        tokio::time::sleep(think_time).await;
        if stop.load(Ordering::Relaxed) {
            break;
        }
    }
    tracing::debug!(vu = ctx.id, iterations = ctx.iteration, "virtual user exited");
}
