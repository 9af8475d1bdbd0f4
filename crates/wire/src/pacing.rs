//! Send pacing from estimated transmission time

/// Converts message sizes into expected wire time
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransTimeEstimate {
    bandwidth_mbps: f64,
}

impl TransTimeEstimate {
    /// Estimator for a link of `bandwidth_mbps` megabits per second
    ///
    /// # Panics
    ///
    /// If the bandwidth is not positive.
    pub fn new(bandwidth_mbps: f64) -> Self {
        if !(bandwidth_mbps > 0.0) {
            panic!("bandwidth must be positive, got {}", bandwidth_mbps);
        }
        Self { bandwidth_mbps }
    }

    /// Configured bandwidth
    pub fn bandwidth_mbps(&self) -> f64 {
        self.bandwidth_mbps
    }

    /// Milliseconds needed to put `num_bytes` on the wire
    pub fn estimate_trans_millisec(&self, num_bytes: usize) -> f64 {
        Self::estimate(num_bytes, self.bandwidth_mbps)
    }

    /// Milliseconds needed to send `num_bytes` at `bandwidth_mbps`
    pub fn estimate(num_bytes: usize, bandwidth_mbps: f64) -> f64 {
        (num_bytes as f64 * 8.0) / (bandwidth_mbps * 1000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_megabit_takes_one_second_at_one_mbps() {
        let est = TransTimeEstimate::new(1.0);
        assert!((est.estimate_trans_millisec(125_000) - 1000.0).abs() < 1e-9);
        assert_eq!(TransTimeEstimate::estimate(0, 40.0), 0.0);
    }

    #[test]
    #[should_panic(expected = "bandwidth must be positive")]
    fn test_zero_bandwidth_rejected() {
        TransTimeEstimate::new(0.0);
    }
}
