//! Linear warmup then linear decay to zero

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearWarmup {
    base_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
    current_step: usize,
}

impl LinearWarmup {
    pub fn new(base_lr: f64, warmup_steps: usize, total_steps: usize) -> Self {
        Self {
            base_lr,
            warmup_steps,
            total_steps,
            current_step: 0,
        }
    }

    /// Multiplier applied to `base_lr` at `step`.
    pub fn factor_at(&self, step: usize) -> f64 {
        if step < self.warmup_steps {
            return step as f64 / self.warmup_steps.max(1) as f64;
        }
        let remaining = self.total_steps.saturating_sub(step) as f64;
        let decay_span = self.total_steps.saturating_sub(self.warmup_steps).max(1) as f64;
        (remaining / decay_span).max(0.0)
    }

    /// Learning rate for the step about to run.
    pub fn lr(&self) -> f64 {
        self.base_lr * self.factor_at(self.current_step)
    }

    /// Advance one step and return the new learning rate.
    pub fn step(&mut self) -> f64 {
        self.current_step += 1;
        self.lr()
    }

    pub fn current_step(&self) -> usize {
        self.current_step
    }

    pub fn total_steps(&self) -> usize {
        self.total_steps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lr_scheduler_warmup() {
        let mut schedule = LinearWarmup::new(1e-3, 100, 1000);
        assert_eq!(schedule.lr(), 0.0);

        for _ in 0..50 {
            schedule.step();
        }
        assert!((schedule.lr() - 5e-4).abs() < 1e-12);

        for _ in 50..100 {
            schedule.step();
        }
        assert!((schedule.lr() - 1e-3).abs() < 1e-12);
    }

    #[test]
    fn test_decays_to_zero_at_total() {
        let mut schedule = LinearWarmup::new(2e-4, 10, 110);
        for _ in 0..60 {
            schedule.step();
        }
        assert!((schedule.lr() - 1e-4).abs() < 1e-12);

        for _ in 60..110 {
            schedule.step();
        }
        assert_eq!(schedule.lr(), 0.0);
        // Past the end stays clamped.
        assert_eq!(schedule.step(), 0.0);
    }

    #[test]
    fn test_no_warmup_starts_at_base() {
        let schedule = LinearWarmup::new(3e-5, 0, 4);
        assert_eq!(schedule.lr(), 3e-5);
        assert_eq!(schedule.factor_at(2), 0.5);
    }

    #[test]
    fn test_warmup_longer_than_run() {
        let schedule = LinearWarmup::new(1.0, 10, 4);
        assert_eq!(schedule.factor_at(3), 0.3);
        assert!(schedule.factor_at(10) == 0.0);
    }
}
