//! Calibrated-noise mechanisms for differential privacy.
//!
//! Laplace gives (ε, 0)-DP, Gaussian gives (ε, δ)-DP, the exponential
//! mechanism handles categorical selection, and the sparse vector technique
//! answers threshold queries under a shared budget.
//!
//! Laplace sampling uses the inverse CDF: for U ~ Uniform(-0.5, 0.5),
//! X = -b · sign(U) · ln(1 - 2|U|) is distributed Laplace(0, b).
//!
//! All mechanisms draw from a caller-supplied RNG so tests can seed a
//! `ChaCha20Rng` and assert on the resulting statistics.

use rand::Rng;

use crate::utils::{ApiError, ApiResult};

fn validate_epsilon(epsilon: f64) -> ApiResult<()> {
    if !(epsilon.is_finite() && epsilon > 0.0) {
        return Err(ApiError::invalid_data(format!(
            "epsilon must be positive and finite, got {}",
            epsilon
        )));
    }
    Ok(())
}

fn validate_sensitivity(sensitivity: f64) -> ApiResult<()> {
    if !(sensitivity.is_finite() && sensitivity > 0.0) {
        return Err(ApiError::invalid_data(format!(
            "sensitivity must be positive and finite, got {}",
            sensitivity
        )));
    }
    Ok(())
}

/// Sample from Laplace(0, scale) via the inverse CDF.
pub fn sample_laplace<R: Rng + ?Sized>(rng: &mut R, scale: f64) -> f64 {
    let u: f64 = rng.gen_range(-0.5..0.5);
    -scale * u.signum() * (1.0 - 2.0 * u.abs()).ln()
}

/// Sample from N(0, sigma^2) via Box-Muller.
pub fn sample_gaussian<R: Rng + ?Sized>(rng: &mut R, sigma: f64) -> f64 {
    let u1: f64 = rng.gen_range(f64::MIN_POSITIVE..1.0);
    let u2: f64 = rng.gen_range(0.0..1.0);
    sigma * (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

/// Laplace mechanism: value + Lap(0, sensitivity/epsilon)
pub fn add_laplace_noise<R: Rng + ?Sized>(
    rng: &mut R,
    value: f64,
    epsilon: f64,
    sensitivity: f64,
) -> ApiResult<f64> {
    validate_epsilon(epsilon)?;
    validate_sensitivity(sensitivity)?;
    let scale = sensitivity / epsilon;
    Ok(value + sample_laplace(rng, scale))
}

/// Gaussian mechanism for (ε, δ)-DP: sigma = sensitivity · sqrt(2·ln(1.25/δ)) / ε
pub fn add_gaussian_noise<R: Rng + ?Sized>(
    rng: &mut R,
    value: f64,
    epsilon: f64,
    delta: f64,
    sensitivity: f64,
) -> ApiResult<f64> {
    validate_epsilon(epsilon)?;
    validate_sensitivity(sensitivity)?;
    if !(delta.is_finite() && delta > 0.0 && delta < 1.0) {
        return Err(ApiError::invalid_data(format!(
            "delta must be in (0, 1), got {}",
            delta
        )));
    }
    let sigma = sensitivity * (2.0 * (1.25 / delta).ln()).sqrt() / epsilon;
    Ok(value + sample_gaussian(rng, sigma))
}

/// Exponential mechanism over a candidate set with utility scores.
///
/// Selection probability is proportional to exp(ε·u / (2·Δu)); the maximum
/// utility is subtracted before exponentiating for numerical stability.
pub struct ExponentialMechanism {
    pub epsilon: f64,
    pub sensitivity: f64,
}

impl ExponentialMechanism {
    pub fn new(epsilon: f64, sensitivity: f64) -> ApiResult<Self> {
        validate_epsilon(epsilon)?;
        validate_sensitivity(sensitivity)?;
        Ok(Self {
            epsilon,
            sensitivity,
        })
    }

    /// Pick one candidate; returns the selected index.
    pub fn select<R: Rng + ?Sized>(&self, rng: &mut R, utility_scores: &[f64]) -> ApiResult<usize> {
        if utility_scores.is_empty() {
            return Err(ApiError::invalid_data("candidates cannot be empty"));
        }

        let max_score = utility_scores
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max);

        let weights: Vec<f64> = utility_scores
            .iter()
            .map(|u| (self.epsilon * (u - max_score) / (2.0 * self.sensitivity)).exp())
            .collect();
        let total: f64 = weights.iter().sum();

        let mut r = rng.gen_range(0.0..total);
        for (i, w) in weights.iter().enumerate() {
            r -= w;
            if r <= 0.0 {
                return Ok(i);
            }
        }
        Ok(weights.len() - 1)
    }
}

/// Sparse vector technique for threshold queries.
///
/// The total budget is split half-and-half between a one-shot noisy
/// threshold (scale 2s/ε_T) and each query's noise (scale 4·c·s/ε_Q where
/// c = max_above). Stops returning true once c positives have been emitted.
pub struct SparseVectorTechnique {
    epsilon: f64,
    threshold: f64,
    max_above: u32,
    sensitivity: f64,
    epsilon_query: f64,
    noisy_threshold: f64,
    above_count: u32,
}

impl SparseVectorTechnique {
    pub fn new<R: Rng + ?Sized>(
        rng: &mut R,
        epsilon: f64,
        threshold: f64,
        max_above: u32,
        sensitivity: f64,
    ) -> ApiResult<Self> {
        validate_epsilon(epsilon)?;
        validate_sensitivity(sensitivity)?;
        if max_above == 0 {
            return Err(ApiError::invalid_data("max_above must be at least 1"));
        }
        let epsilon_threshold = epsilon / 2.0;
        let epsilon_query = epsilon / 2.0;
        let noisy_threshold =
            threshold + sample_laplace(rng, 2.0 * sensitivity / epsilon_threshold);
        Ok(Self {
            epsilon,
            threshold,
            max_above,
            sensitivity,
            epsilon_query,
            noisy_threshold,
            above_count: 0,
        })
    }

    /// Answer whether a value is above the noisy threshold.
    pub fn query<R: Rng + ?Sized>(&mut self, rng: &mut R, value: f64) -> bool {
        if self.above_count >= self.max_above {
            return false;
        }
        let scale = 4.0 * f64::from(self.max_above) * self.sensitivity / self.epsilon_query;
        let noisy_value = value + sample_laplace(rng, scale);
        if noisy_value >= self.noisy_threshold {
            self.above_count += 1;
            return true;
        }
        false
    }

    pub fn batch_query<R: Rng + ?Sized>(&mut self, rng: &mut R, values: &[f64]) -> Vec<bool> {
        values.iter().map(|v| self.query(rng, *v)).collect()
    }

    /// Re-draw the threshold noise and reset the positive counter.
    pub fn reset<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        let epsilon_threshold = self.epsilon / 2.0;
        self.noisy_threshold =
            self.threshold + sample_laplace(rng, 2.0 * self.sensitivity / epsilon_threshold);
        self.above_count = 0;
    }

    pub fn above_count(&self) -> u32 {
        self.above_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    #[test]
    fn test_laplace_sample_mean_approximately_zero() {
        let mut rng = ChaCha20Rng::seed_from_u64(42);
        let n = 10_000;
        let sum: f64 = (0..n).map(|_| sample_laplace(&mut rng, 1.0)).sum();
        let mean = sum / n as f64;

        // SE = sqrt(2/n); mean should be within 4 standard errors of 0
        let se = (2.0_f64 / n as f64).sqrt();
        assert!(mean.abs() < 4.0 * se, "mean {} too far from 0", mean);
    }

    #[test]
    fn test_laplace_sample_variance_approximately_correct() {
        let mut rng = ChaCha20Rng::seed_from_u64(7);
        let scale = 2.0;
        let n = 10_000;
        let samples: Vec<f64> = (0..n).map(|_| sample_laplace(&mut rng, scale)).collect();
        let mean: f64 = samples.iter().sum::<f64>() / n as f64;
        let variance: f64 =
            samples.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1) as f64;

        // Var(Lap(0, b)) = 2b^2 = 8
        let expected = 2.0 * scale * scale;
        assert!(
            (variance - expected).abs() / expected < 0.2,
            "variance {} too far from expected {}",
            variance,
            expected
        );
    }

    #[test]
    fn test_add_laplace_noise_rejects_bad_params() {
        let mut rng = ChaCha20Rng::seed_from_u64(0);
        assert!(add_laplace_noise(&mut rng, 1.0, 0.0, 1.0).is_err());
        assert!(add_laplace_noise(&mut rng, 1.0, -1.0, 1.0).is_err());
        assert!(add_laplace_noise(&mut rng, 1.0, 1.0, 0.0).is_err());
    }

    #[test]
    fn test_gaussian_noise_rejects_bad_delta() {
        let mut rng = ChaCha20Rng::seed_from_u64(0);
        assert!(add_gaussian_noise(&mut rng, 1.0, 1.0, 0.0, 1.0).is_err());
        assert!(add_gaussian_noise(&mut rng, 1.0, 1.0, 1.0, 1.0).is_err());
        assert!(add_gaussian_noise(&mut rng, 1.0, 1.0, 1e-5, 1.0).is_ok());
    }

    #[test]
    fn test_exponential_mechanism_prefers_high_utility() {
        let mut rng = ChaCha20Rng::seed_from_u64(99);
        let mechanism = ExponentialMechanism::new(5.0, 1.0).unwrap();
        let scores = [0.0, 0.0, 10.0];

        let mut wins = 0;
        for _ in 0..1000 {
            if mechanism.select(&mut rng, &scores).unwrap() == 2 {
                wins += 1;
            }
        }
        // With epsilon 5 and a 10-point utility gap the top candidate should
        // dominate overwhelmingly.
        assert!(wins > 900, "high-utility candidate won only {} times", wins);
    }

    #[test]
    fn test_exponential_mechanism_empty_candidates() {
        let mut rng = ChaCha20Rng::seed_from_u64(0);
        let mechanism = ExponentialMechanism::new(1.0, 1.0).unwrap();
        assert!(mechanism.select(&mut rng, &[]).is_err());
    }

    #[test]
    fn test_sparse_vector_stops_after_max_above() {
        let mut rng = ChaCha20Rng::seed_from_u64(5);
        let mut svt = SparseVectorTechnique::new(&mut rng, 10.0, 50.0, 2, 1.0).unwrap();

        // Values far above the threshold; only the first two may answer true.
        let results = svt.batch_query(&mut rng, &[1000.0, 1000.0, 1000.0, 1000.0]);
        let positives = results.iter().filter(|r| **r).count();
        assert!(positives <= 2);
        assert_eq!(svt.above_count() as usize, positives);

        // Once exhausted, everything is false.
        assert!(!svt.query(&mut rng, 1_000_000.0));

        svt.reset(&mut rng);
        assert_eq!(svt.above_count(), 0);
    }
}
