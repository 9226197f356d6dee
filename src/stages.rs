//! Stage scheduling: concurrency target as a continuous function of elapsed time.

use std::time::Duration;

/// A time-bounded segment of the run with a concurrency target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stage {
    pub duration: Duration,
    pub target: u32,
}

impl Stage {
    pub fn new(duration: Duration, target: u32) -> Self {
        Self { duration, target }
    }
}

/// Converts an ordered stage list into a target-concurrency function.
///
/// Within a stage the target ramps linearly from the previous stage's target
/// (initially `start_target`) to the stage's own target, rounded to nearest
/// and clamped to the ramp's own endpoint range. The function is continuous
/// at stage boundaries; a zero-duration stage is an explicit step change.
#[derive(Debug, Clone)]
pub struct StagePlan {
    start_target: u32,
    stages: Vec<Stage>,
    total: Duration,
}

impl StagePlan {
    pub fn new(start_target: u32, stages: Vec<Stage>) -> Self {
        let total = stages.iter().map(|s| s.duration).sum();
        Self {
            start_target,
            stages,
            total,
        }
    }

    /// Sum of all stage durations.
    pub fn total_duration(&self) -> Duration {
        self.total
    }

    /// Target concurrency for the given elapsed time since run start.
    ///
    /// Past the final stage boundary this keeps reporting the final stage
    /// target; the runner is responsible for draining to zero afterwards.
    pub fn target_at(&self, elapsed: Duration) -> u32 {
        let mut t = elapsed.as_secs_f64();
        let mut prev = self.start_target as f64;

        for stage in &self.stages {
            let d = stage.duration.as_secs_f64();
            if t <= d {
                if d == 0.0 {
                    return stage.target;
                }
                let target = stage.target as f64;
                let value = prev + (target - prev) * (t / d);
                return value.round().clamp(0.0, prev.max(target)) as u32;
            }
            t -= d;
            prev = stage.target as f64;
        }

        self.stages
            .last()
            .map(|s| s.target)
            .unwrap_or(self.start_target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn gate_profile() -> StagePlan {
        StagePlan::new(
            0,
            vec![
                Stage::new(secs(30), 1),
                Stage::new(secs(60), 1),
                Stage::new(secs(30), 0),
            ],
        )
    }

    #[test]
    fn test_boundary_targets_exact() {
        let plan = gate_profile();
        assert_eq!(plan.target_at(secs(0)), 0);
        assert_eq!(plan.target_at(secs(30)), 1);
        assert_eq!(plan.target_at(secs(90)), 1);
        assert_eq!(plan.target_at(secs(120)), 0);
    }

    #[test]
    fn test_linear_ramp_midpoint() {
        let plan = StagePlan::new(0, vec![Stage::new(secs(10), 10)]);
        assert_eq!(plan.target_at(secs(5)), 5);
        assert_eq!(plan.target_at(Duration::from_millis(2500)), 3); // 2.5 rounds to 3
        assert_eq!(plan.target_at(secs(10)), 10);
    }

    #[test]
    fn test_ramp_down() {
        let plan = StagePlan::new(10, vec![Stage::new(secs(10), 0)]);
        assert_eq!(plan.target_at(secs(0)), 10);
        assert_eq!(plan.target_at(secs(5)), 5);
        assert_eq!(plan.target_at(secs(10)), 0);
    }

    #[test]
    fn test_continuity_within_stages() {
        let plan = StagePlan::new(0, vec![Stage::new(secs(30), 15), Stage::new(secs(30), 3)]);
        let step = Duration::from_millis(100);
        let mut prev = plan.target_at(Duration::ZERO);
        let mut t = Duration::ZERO;
        while t < plan.total_duration() {
            t += step;
            let cur = plan.target_at(t);
            // 15 VUs over 30s is one VU per 2s; 100ms steps never jump by more than 1.
            assert!(
                cur.abs_diff(prev) <= 1,
                "discontinuity at {:?}: {} -> {}",
                t,
                prev,
                cur
            );
            prev = cur;
        }
    }

    #[test]
    fn test_zero_duration_stage_steps() {
        let plan = StagePlan::new(
            0,
            vec![
                Stage::new(secs(10), 5),
                Stage::new(Duration::ZERO, 2),
                Stage::new(secs(10), 4),
            ],
        );
        // Boundary itself still belongs to the first ramp.
        assert_eq!(plan.target_at(secs(10)), 5);
        // Just past it, the zero-duration stage has reset the origin to 2.
        assert_eq!(plan.target_at(Duration::from_millis(10_001)), 2);
        assert_eq!(plan.target_at(secs(15)), 3);
        assert_eq!(plan.target_at(secs(20)), 4);
    }

    #[test]
    fn test_beyond_total_reports_final_target() {
        let plan = gate_profile();
        assert_eq!(plan.target_at(secs(500)), 0);

        let plan = StagePlan::new(0, vec![Stage::new(secs(10), 7)]);
        assert_eq!(plan.target_at(secs(11)), 7);
    }

    #[test]
    fn test_total_duration() {
        assert_eq!(gate_profile().total_duration(), secs(120));
        assert_eq!(StagePlan::new(0, vec![]).total_duration(), Duration::ZERO);
    }
}
