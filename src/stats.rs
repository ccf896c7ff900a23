//! Loss smoothing and throughput measurement for progress reports.

use std::time::Instant;

/// Weight kept by the previous average on each update.
const KEEP: f32 = 0.99;
/// Weight given to the new sample.
const TAKE: f32 = 0.01;

/// Exponential running average that is initialized by its first sample.
///
/// # Example
/// ```
/// use leelaz_train_rs::stats::RunningAverage;
///
/// let mut avg = RunningAverage::default();
/// avg.update(2.0);
/// avg.update(4.0);
/// assert!((avg.value().unwrap() - 2.02).abs() < 1e-6);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub enum RunningAverage {
    /// No sample seen yet
    #[default]
    Uninitialized,
    /// Current average
    Value(f32),
}

impl RunningAverage {
    /// Fold in a sample.
    pub fn update(&mut self, sample: f32) {
        *self = match *self {
            Self::Uninitialized => Self::Value(sample),
            Self::Value(avg) => Self::Value(KEEP * avg + TAKE * sample),
        };
    }

    pub fn value(&self) -> Option<f32> {
        match self {
            Self::Uninitialized => None,
            Self::Value(v) => Some(*v),
        }
    }
}

/// Smoothed training losses.
#[derive(Debug, Clone, Copy, Default)]
pub struct LossAverages {
    pub policy: RunningAverage,
    /// Value loss scaled by 1/4 into [0, 1]
    pub value: RunningAverage,
}

impl LossAverages {
    /// Fold in the raw losses of one step.
    pub fn update(&mut self, policy_loss: f32, value_loss: f32) {
        self.policy.update(policy_loss);
        self.value.update(value_loss / 4.0);
    }
}

/// Positions per second between consecutive reports.
#[derive(Debug, Default)]
pub struct ThroughputMeter {
    last: Option<Instant>,
    positions: u64,
}

impl ThroughputMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count positions processed since the last report.
    pub fn record(&mut self, positions: usize) {
        self.positions += positions as u64;
    }

    /// Close the current window at `now`.
    ///
    /// Returns 0 for the first report, which has no window start.
    pub fn report(&mut self, now: Instant) -> f64 {
        let speed = match self.last {
            Some(start) => {
                let elapsed = now.saturating_duration_since(start).as_secs_f64();
                if elapsed > 0.0 {
                    self.positions as f64 / elapsed
                } else {
                    0.0
                }
            }
            None => 0.0,
        };
        self.last = Some(now);
        self.positions = 0;
        speed
    }
}

/// Periodic report of the smoothed losses.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressReport {
    pub step: u64,
    pub policy_loss: f32,
    /// Value loss / 4
    pub value_loss: f32,
    pub positions_per_second: f64,
}

/// Result of an evaluation pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvaluationReport {
    pub step: u64,
    /// Mean top-1 move accuracy in [0, 1]
    pub accuracy: f32,
    /// Mean value loss / 4
    pub value_loss: f32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_first_sample_initializes() {
        let mut avg = RunningAverage::default();
        assert_eq!(avg.value(), None);
        avg.update(3.5);
        assert_eq!(avg, RunningAverage::Value(3.5));
    }

    #[test]
    fn test_second_sample_blends() {
        let mut avg = RunningAverage::default();
        avg.update(1.0);
        avg.update(0.0);
        assert_eq!(avg.value(), Some(0.99));
    }

    #[test]
    fn test_zero_first_sample_still_initializes() {
        let mut avg = RunningAverage::default();
        avg.update(0.0);
        avg.update(1.0);
        assert!((avg.value().unwrap() - 0.01).abs() < 1e-7);
    }

    #[test]
    fn test_value_loss_is_quartered() {
        let mut losses = LossAverages::default();
        losses.update(2.0, 0.8);
        assert_eq!(losses.policy.value(), Some(2.0));
        assert_eq!(losses.value.value(), Some(0.2));
    }

    #[test]
    fn test_throughput_first_report_is_zero() {
        let mut meter = ThroughputMeter::new();
        let t0 = Instant::now();
        meter.record(256);
        assert_eq!(meter.report(t0), 0.0);

        meter.record(500);
        meter.record(500);
        let speed = meter.report(t0 + Duration::from_secs(2));
        assert!((speed - 500.0).abs() < 1e-9);
    }
}
