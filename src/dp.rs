// dpau: Differential privacy mechanisms
//
// Sensitivity for both metrics is the flippancy bound W: the maximum number
// of times one user can toggle within a release horizon. DAU releases use
// Laplace noise, MAU releases use Gaussian noise.

use crate::error::{EngineError, EngineResult};
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mechanism {
    Laplace,
    Gaussian,
}

impl Mechanism {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mechanism::Laplace => "laplace",
            Mechanism::Gaussian => "gaussian",
        }
    }
}

/// Laplace scale b = W / epsilon.
pub fn laplace_scale(sensitivity: f64, epsilon: f64) -> f64 {
    sensitivity / epsilon
}

/// Gaussian sigma = W * sqrt(2 ln(1.25/delta)) / epsilon.
pub fn gaussian_sigma(sensitivity: f64, epsilon: f64, delta: f64) -> f64 {
    sensitivity * (2.0 * (1.25 / delta).ln()).sqrt() / epsilon
}

/// Two-sided 95% interval half-width of the noise distribution alone; sketch
/// variance is not folded in.
pub fn ci_half_width(mechanism: Mechanism, scale: f64) -> f64 {
    match mechanism {
        // P(|X| > t) = exp(-t/b)  =>  t = b ln(20) at 5% mass
        Mechanism::Laplace => scale * 20.0f64.ln(),
        Mechanism::Gaussian => 1.96 * scale,
    }
}

/// Post-process a noisy count: clamp at zero and round to an integer.
pub fn noisy_count(raw: f64, noise: f64) -> u64 {
    (raw + noise).max(0.0).round() as u64
}

/// Noise source. Deterministic when constructed with a seed (test mode),
/// otherwise seeded from OS entropy.
pub struct NoiseSampler {
    rng: StdRng,
    seeded: bool,
}

impl NoiseSampler {
    pub fn new(seed: Option<u64>) -> Self {
        match seed {
            Some(s) => Self {
                rng: StdRng::seed_from_u64(s),
                seeded: true,
            },
            None => Self {
                rng: StdRng::from_entropy(),
                seeded: false,
            },
        }
    }

    pub fn is_seeded(&self) -> bool {
        self.seeded
    }

    /// Per-release seed recorded in the ledger, truncated to 63 bits for
    /// storage portability.
    pub fn release_seed(&mut self) -> u64 {
        self.rng.next_u64() & (i64::MAX as u64)
    }

    pub fn sample_laplace(&mut self, scale: f64) -> f64 {
        // Inverse CDF on r in (0, 1).
        let mut r: f64 = self.rng.gen();
        if r <= f64::EPSILON {
            r = f64::EPSILON;
        }
        if r < 0.5 {
            scale * (2.0 * r).ln()
        } else {
            -scale * (2.0 * (1.0 - r)).max(f64::EPSILON).ln()
        }
    }

    pub fn sample_gaussian(&mut self, sigma: f64) -> EngineResult<f64> {
        let normal = Normal::new(0.0, sigma)
            .map_err(|e| EngineError::Fatal(format!("invalid gaussian sigma {}: {}", sigma, e)))?;
        Ok(normal.sample(&mut self.rng))
    }

    pub fn sample(&mut self, mechanism: Mechanism, scale: f64) -> EngineResult<f64> {
        match mechanism {
            Mechanism::Laplace => Ok(self.sample_laplace(scale)),
            Mechanism::Gaussian => self.sample_gaussian(scale),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scales() {
        assert_eq!(laplace_scale(2.0, 0.5), 4.0);
        let sigma = gaussian_sigma(2.0, 0.5, 1e-6);
        assert!(sigma > 0.0);
        // sigma grows as delta shrinks
        assert!(gaussian_sigma(2.0, 0.5, 1e-8) > sigma);
    }

    #[test]
    fn test_seeded_sampler_is_deterministic() {
        let mut a = NoiseSampler::new(Some(42));
        let mut b = NoiseSampler::new(Some(42));
        for _ in 0..10 {
            assert_eq!(a.sample_laplace(1.0), b.sample_laplace(1.0));
        }
        assert_eq!(a.release_seed(), b.release_seed());
    }

    #[test]
    fn test_release_seed_fits_63_bits() {
        let mut sampler = NoiseSampler::new(Some(1));
        for _ in 0..100 {
            assert!(sampler.release_seed() <= i64::MAX as u64);
        }
    }

    #[test]
    fn test_laplace_moments() {
        // Sample mean within 3 standard errors of zero; variance near 2b^2.
        let mut sampler = NoiseSampler::new(Some(1234));
        let b = 2.0f64;
        let n = 10_000usize;
        let samples: Vec<f64> = (0..n).map(|_| sampler.sample_laplace(b)).collect();
        let mean = samples.iter().sum::<f64>() / n as f64;
        let var = samples.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n as f64;
        let expected_var = 2.0 * b * b;
        let std_err = (expected_var / n as f64).sqrt();
        assert!(mean.abs() < 3.0 * std_err, "mean {}", mean);
        assert!(
            (var - expected_var).abs() / expected_var < 0.15,
            "variance {} vs {}",
            var,
            expected_var
        );
    }

    #[test]
    fn test_gaussian_moments() {
        let mut sampler = NoiseSampler::new(Some(99));
        let sigma = 3.0f64;
        let n = 10_000usize;
        let mut sum = 0.0;
        let mut sumsq = 0.0;
        for _ in 0..n {
            let x = sampler.sample_gaussian(sigma).unwrap();
            sum += x;
            sumsq += x * x;
        }
        let mean = sum / n as f64;
        let var = sumsq / n as f64 - mean * mean;
        assert!(mean.abs() < 0.2, "mean {}", mean);
        assert!((var - sigma * sigma).abs() / (sigma * sigma) < 0.15);
    }

    #[test]
    fn test_noisy_count_clamps_and_rounds() {
        assert_eq!(noisy_count(2.0, -5.0), 0);
        assert_eq!(noisy_count(10.0, 0.4), 10);
        assert_eq!(noisy_count(10.0, 0.6), 11);
    }

    #[test]
    fn test_ci_half_widths() {
        assert!((ci_half_width(Mechanism::Laplace, 1.0) - 20.0f64.ln()).abs() < 1e-12);
        assert!((ci_half_width(Mechanism::Gaussian, 2.0) - 3.92).abs() < 1e-12);
    }
}
