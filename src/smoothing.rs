use std::collections::VecDeque;

/// Output of the smoother for one raw score
#[derive(Debug, Clone, Copy)]
pub struct SmoothedScore {
    pub raw: f64,
    /// Arithmetic mean of the last N raw scores
    pub smoothed: f64,
    /// Number of consecutive raw scores at or above the alert threshold
    pub consecutive_high: u32,
}

/// Temporal moving average plus a consecutive-detection counter.
///
/// Reduces false positives from transient spikes before the API reports a
/// window as violent. The detector itself consumes raw scores; the smoothed
/// value feeds `is_violent` on the wire.
#[derive(Debug)]
pub struct ScoreSmoother {
    window: usize,
    alert_threshold: f64,
    scores: VecDeque<f64>,
    consecutive_high: u32,
}

impl ScoreSmoother {
    pub fn new(window: usize, alert_threshold: f64) -> Self {
        assert!(window > 0, "smoothing window must be greater than 0");
        Self {
            window,
            alert_threshold,
            scores: VecDeque::with_capacity(window),
            consecutive_high: 0,
        }
    }

    /// Fold in a raw score and return the smoothed view
    pub fn push(&mut self, raw: f64) -> SmoothedScore {
        if self.scores.len() == self.window {
            self.scores.pop_front();
        }
        self.scores.push_back(raw);

        if raw >= self.alert_threshold {
            self.consecutive_high += 1;
        } else {
            self.consecutive_high = 0;
        }

        let smoothed = self.scores.iter().sum::<f64>() / self.scores.len() as f64;
        SmoothedScore {
            raw,
            smoothed,
            consecutive_high: self.consecutive_high,
        }
    }

    /// Clear all state; called on stream stop
    pub fn reset(&mut self) {
        self.scores.clear();
        self.consecutive_high = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean_over_window() {
        let mut s = ScoreSmoother::new(3, 0.9);

        assert!((s.push(0.3).smoothed - 0.3).abs() < 1e-9);
        assert!((s.push(0.6).smoothed - 0.45).abs() < 1e-9);
        assert!((s.push(0.9).smoothed - 0.6).abs() < 1e-9);
        // Window slides: (0.6 + 0.9 + 0.0) / 3
        assert!((s.push(0.0).smoothed - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_consecutive_high_counts_alert_threshold() {
        let mut s = ScoreSmoother::new(3, 0.9);

        assert_eq!(s.push(0.95).consecutive_high, 1);
        assert_eq!(s.push(0.90).consecutive_high, 2); // exactly at threshold counts
        assert_eq!(s.push(0.89).consecutive_high, 0);
        assert_eq!(s.push(0.99).consecutive_high, 1);
    }

    #[test]
    fn test_reset_clears_state() {
        let mut s = ScoreSmoother::new(3, 0.9);
        s.push(0.95);
        s.push(0.95);
        s.reset();

        let out = s.push(0.6);
        assert_eq!(out.consecutive_high, 0);
        assert!((out.smoothed - 0.6).abs() < 1e-9);
    }
}
