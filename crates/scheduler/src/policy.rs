use std::fmt;

use log::debug;

use crate::config::SchedulerConfig;
use crate::monitor::ResourceSample;

/// Why a decision came out the way it did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PressureReason {
    /// Available memory below the hard floor
    CriticalMemory,
    PriorityProcess,
    Cpu,
    Memory,
    Load,
    /// A higher target is waiting for more favorable samples
    HeldByHysteresis,
}

impl fmt::Display for PressureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PressureReason::CriticalMemory => "critical_memory",
            PressureReason::PriorityProcess => "priority_process",
            PressureReason::Cpu => "cpu",
            PressureReason::Memory => "memory",
            PressureReason::Load => "load",
            PressureReason::HeldByHysteresis => "hysteresis",
        };
        f.write_str(s)
    }
}

/// Result of one policy evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    /// Target the raw policy computed for this sample
    pub proposed: usize,
    /// Target in effect after hysteresis
    pub target: usize,
    pub reasons: Vec<PressureReason>,
}

impl Decision {
    pub fn is_memory_critical(&self) -> bool {
        self.reasons.contains(&PressureReason::CriticalMemory)
    }

    pub fn reasons_label(&self) -> String {
        if self.reasons.is_empty() {
            return "none".to_string();
        }
        self.reasons
            .iter()
            .map(|r| r.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Target job count for one sample.
///
/// Pure function of the sample and the configuration.
pub fn decide(sample: &ResourceSample, cfg: &SchedulerConfig) -> usize {
    evaluate(sample, cfg).0
}

fn evaluate(sample: &ResourceSample, cfg: &SchedulerConfig) -> (usize, Vec<PressureReason>) {
    if sample.available_memory_bytes < cfg.min_available_memory_bytes() {
        return (0, vec![PressureReason::CriticalMemory]);
    }

    let mut reasons = Vec::new();
    let mut target = cfg.max_parallel_jobs;

    if sample.priority_process_active {
        target /= 2;
        reasons.push(PressureReason::PriorityProcess);
    }
    if sample.cpu_percent > cfg.max_cpu_percent {
        target = target.saturating_sub(1);
        reasons.push(PressureReason::Cpu);
    }
    if sample.memory_percent() > cfg.max_memory_percent {
        target = target.saturating_sub(1);
        reasons.push(PressureReason::Memory);
    }
    if sample.load_average_1m > cfg.max_load_average {
        target = target.saturating_sub(1);
        reasons.push(PressureReason::Load);
    }

    // min_parallel_jobs is a floor against resource pressure, not against a
    // priority process: the halving must hold for every configuration.
    let floor = if sample.priority_process_active {
        0
    } else {
        cfg.min_parallel_jobs
    };
    (target.clamp(floor, cfg.max_parallel_jobs), reasons)
}

/// Scaling policy with asymmetric hysteresis.
///
/// Decreases take effect on the sample that asks for them. Increases wait for
/// `scale_up_samples` consecutive samples proposing a higher target and then
/// move to the smallest of those proposals.
#[derive(Debug, Clone)]
pub struct ScalingPolicy {
    current: Option<usize>,
    pending_increase: Option<usize>,
    favorable_streak: u32,
    required_streak: u32,
}

impl ScalingPolicy {
    pub fn new(cfg: &SchedulerConfig) -> Self {
        Self {
            current: None,
            pending_increase: None,
            favorable_streak: 0,
            required_streak: cfg.scale_up_samples.max(1),
        }
    }

    pub fn reconfigure(&mut self, cfg: &SchedulerConfig) {
        self.required_streak = cfg.scale_up_samples.max(1);
    }

    /// Current target, if any sample has been seen
    pub fn current(&self) -> Option<usize> {
        self.current
    }

    pub fn update(&mut self, sample: &ResourceSample, cfg: &SchedulerConfig) -> Decision {
        let (proposed, mut reasons) = evaluate(sample, cfg);

        let target = match self.current {
            None => {
                self.reset_streak();
                proposed
            }
            Some(current) if proposed <= current => {
                self.reset_streak();
                proposed
            }
            Some(current) => {
                self.favorable_streak += 1;
                let lowest = self.pending_increase.map_or(proposed, |p| p.min(proposed));
                self.pending_increase = Some(lowest);
                if self.favorable_streak >= self.required_streak {
                    debug!(
                        "scale up after {} favorable samples: {} -> {}",
                        self.favorable_streak, current, lowest
                    );
                    self.reset_streak();
                    lowest
                } else {
                    reasons.push(PressureReason::HeldByHysteresis);
                    current
                }
            }
        };

        self.current = Some(target);
        Decision {
            proposed,
            target,
            reasons,
        }
    }

    fn reset_streak(&mut self) {
        self.favorable_streak = 0;
        self.pending_increase = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use proptest::prelude::*;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn sample(cpu: f64, available_gb: u64, load: f64, priority: bool) -> ResourceSample {
        ResourceSample {
            cpu_percent: cpu,
            available_memory_bytes: available_gb * GIB,
            total_memory_bytes: 64 * GIB,
            load_average_1m: load,
            priority_process_active: priority,
            taken_at: Utc::now(),
        }
    }

    fn config(min: usize, max: usize) -> SchedulerConfig {
        SchedulerConfig {
            min_parallel_jobs: min,
            max_parallel_jobs: max,
            max_cpu_percent: 80.0,
            max_memory_percent: 80.0,
            max_load_average: 8.0,
            min_available_memory_gb: 2.0,
            scale_up_samples: 3,
            ..Default::default()
        }
    }

    #[test]
    fn test_idle_machine_gets_max() {
        assert_eq!(decide(&sample(5.0, 48, 0.3, false), &config(1, 4)), 4);
    }

    #[test]
    fn test_each_pressure_steps_down_once() {
        let cfg = config(0, 6);
        assert_eq!(decide(&sample(95.0, 48, 0.3, false), &cfg), 5);
        // 64 GiB total, 4 available => 93.75% used
        assert_eq!(decide(&sample(95.0, 4, 0.3, false), &cfg), 4);
        assert_eq!(decide(&sample(95.0, 4, 12.0, false), &cfg), 3);
    }

    #[test]
    fn test_clamped_to_min_without_priority() {
        let cfg = config(2, 3);
        assert_eq!(decide(&sample(99.0, 4, 30.0, false), &cfg), 2);
    }

    #[test]
    fn test_priority_halves() {
        let cfg = config(1, 8);
        assert_eq!(decide(&sample(5.0, 48, 0.3, true), &cfg), 4);
        let cfg = config(1, 1);
        assert_eq!(decide(&sample(5.0, 48, 0.3, true), &cfg), 0);
    }

    #[test]
    fn test_memory_floor_overrides_min_jobs() {
        let cfg = config(3, 8);
        assert_eq!(decide(&sample(1.0, 1, 0.0, false), &cfg), 0);
    }

    #[test]
    fn test_decrease_is_immediate() {
        let cfg = config(0, 4);
        let mut policy = ScalingPolicy::new(&cfg);
        assert_eq!(policy.update(&sample(5.0, 48, 0.3, false), &cfg).target, 4);
        let d = policy.update(&sample(5.0, 1, 0.3, false), &cfg);
        assert_eq!(d.target, 0);
        assert!(d.is_memory_critical());
    }

    #[test]
    fn test_increase_waits_for_consecutive_favorable_samples() {
        let cfg = config(0, 4);
        let mut policy = ScalingPolicy::new(&cfg);
        policy.update(&sample(5.0, 1, 0.3, false), &cfg);
        assert_eq!(policy.current(), Some(0));

        let d = policy.update(&sample(5.0, 48, 0.3, false), &cfg);
        assert_eq!((d.proposed, d.target), (4, 0));
        assert!(d.reasons.contains(&PressureReason::HeldByHysteresis));
        assert_eq!(policy.update(&sample(95.0, 48, 0.3, false), &cfg).target, 0);
        // Third favorable sample releases the smallest proposal seen in the streak
        assert_eq!(policy.update(&sample(5.0, 48, 0.3, false), &cfg).target, 3);
    }

    #[test]
    fn test_unfavorable_sample_resets_streak() {
        let cfg = config(0, 4);
        let mut policy = ScalingPolicy::new(&cfg);
        policy.update(&sample(5.0, 1, 0.3, false), &cfg);
        policy.update(&sample(5.0, 48, 0.3, false), &cfg);
        policy.update(&sample(5.0, 48, 0.3, false), &cfg);
        policy.update(&sample(5.0, 1, 0.3, false), &cfg);
        assert_eq!(policy.update(&sample(5.0, 48, 0.3, false), &cfg).target, 0);
        assert_eq!(policy.update(&sample(5.0, 48, 0.3, false), &cfg).target, 0);
        assert_eq!(policy.update(&sample(5.0, 48, 0.3, false), &cfg).target, 4);
    }

    fn arb_sample() -> impl Strategy<Value = ResourceSample> {
        (0.0f64..100.0, 0u64..64, 0.0f64..32.0, any::<bool>())
            .prop_map(|(cpu, avail, load, priority)| sample(cpu, avail, load, priority))
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        /// Property: a priority process at least halves the target the same sample would get without it
        #[test]
        fn prop_priority_halves_target(
            s in arb_sample(),
            min in 0usize..4,
            extra in 0usize..8,
        ) {
            let cfg = config(min, min + extra.max(1));
            let with = ResourceSample { priority_process_active: true, ..s.clone() };
            let without = ResourceSample { priority_process_active: false, ..s };
            let unpressured = decide(&without, &cfg);
            prop_assert!(decide(&with, &cfg) <= unpressured / 2);
        }

        /// Property: below the memory floor the target is zero no matter what else holds
        #[test]
        fn prop_memory_floor_forces_zero(
            s in arb_sample(),
            min in 0usize..4,
            extra in 1usize..8,
        ) {
            let cfg = config(min, min + extra);
            let starved = ResourceSample { available_memory_bytes: GIB, ..s };
            prop_assert_eq!(decide(&starved, &cfg), 0);
        }

        /// Property: outside the memory floor and priority yield, the target stays within bounds
        #[test]
        fn prop_target_within_bounds(
            s in arb_sample(),
            min in 0usize..4,
            extra in 1usize..8,
        ) {
            let cfg = config(min, min + extra);
            let t = decide(&s, &cfg);
            prop_assert!(t <= cfg.max_parallel_jobs);
            if s.available_memory_bytes >= cfg.min_available_memory_bytes() && !s.priority_process_active {
                prop_assert!(t >= cfg.min_parallel_jobs);
            }
        }

        /// Property: hysteresis never raises the target above the proposal nor keeps it above a lower one
        #[test]
        fn prop_hysteresis_never_exceeds_proposal_on_decrease(
            samples in prop::collection::vec(arb_sample(), 1..30),
        ) {
            let cfg = config(1, 6);
            let mut policy = ScalingPolicy::new(&cfg);
            for s in &samples {
                let d = policy.update(s, &cfg);
                if d.proposed <= d.target {
                    prop_assert_eq!(d.proposed, d.target);
                }
            }
        }
    }
}
