//! Running mean and variance of observations (Welford's online algorithm).
use ndarray::Array1;

/// Floor of the reported variance.
const MIN_VARIANCE: f64 = 1e-6;

/// Per-dimension running mean and variance.
///
/// Before any sample is seen the statistics are the identity, mean 0 and
/// variance 1.
#[derive(Debug, Clone)]
pub struct RunningMeanStd {
    mean: Vec<f64>,
    // Sum of squared deviations from the mean
    m2: Vec<f64>,
    count: u64,
}

impl RunningMeanStd {
    /// Creates statistics for `dim`-dimensional samples.
    pub fn new(dim: usize) -> Self {
        Self {
            mean: vec![0.0; dim],
            m2: vec![0.0; dim],
            count: 0,
        }
    }

    /// Updates the statistics with a sample.
    pub fn update(&mut self, x: &[f32]) {
        debug_assert_eq!(x.len(), self.mean.len());
        self.count += 1;
        let n = self.count as f64;
        for ((m, m2), &x) in self.mean.iter_mut().zip(self.m2.iter_mut()).zip(x) {
            let x = x as f64;
            let delta = x - *m;
            *m += delta / n;
            *m2 += delta * (x - *m);
        }
    }

    /// Number of samples seen so far.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Running mean.
    pub fn mean(&self) -> Array1<f32> {
        self.mean.iter().map(|&m| m as f32).collect()
    }

    /// Running (population) variance, floored at `1e-6`.
    pub fn variance(&self) -> Array1<f32> {
        if self.count == 0 {
            return Array1::ones(self.mean.len());
        }
        let n = self.count as f64;
        self.m2
            .iter()
            .map(|&m2| (m2 / n).max(MIN_VARIANCE) as f32)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_before_samples() {
        let stats = RunningMeanStd::new(3);
        assert_eq!(stats.mean().to_vec(), vec![0.0; 3]);
        assert_eq!(stats.variance().to_vec(), vec![1.0; 3]);
    }

    #[test]
    fn test_matches_batch_statistics() {
        let xs = [[1.0f32, -2.0], [2.0, 0.0], [6.0, 2.0], [3.0, 4.0]];
        let mut stats = RunningMeanStd::new(2);
        xs.iter().for_each(|x| stats.update(x));

        let mean = stats.mean();
        let var = stats.variance();
        assert!((mean[0] - 3.0).abs() < 1e-6);
        assert!((mean[1] - 1.0).abs() < 1e-6);
        // population variance
        assert!((var[0] - 3.5).abs() < 1e-5);
        assert!((var[1] - 5.0).abs() < 1e-5);
    }

    #[test]
    fn test_variance_floor() {
        let mut stats = RunningMeanStd::new(1);
        stats.update(&[2.0]);
        stats.update(&[2.0]);
        assert_eq!(stats.variance()[0], 1e-6);
    }
}
