//! Two-proportion z-test between two variants.
//!
//! `p_value` is the coarse `max(0, 1 - z / z_threshold)` approximation, not a normal-CDF
//! tail probability. It is kept for compatibility with previously reported numbers;
//! [`two_tailed_p`] gives the proper value for callers that want it.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantCounts {
    pub users: u64,
    pub conversions: u64,
}

impl VariantCounts {
    pub fn new(users: u64, conversions: u64) -> Self {
        Self { users, conversions }
    }

    pub fn rate(&self) -> f64 {
        if self.users == 0 {
            0.0
        } else {
            self.conversions as f64 / self.users as f64
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SignificanceResult {
    pub is_significant: bool,
    /// 95 when significant, else 0.
    pub confidence_level: u8,
    pub p_value: f64,
    /// `None` when the sample was too small to test.
    pub z_score: Option<f64>,
}

impl SignificanceResult {
    pub fn insufficient() -> Self {
        Self { is_significant: false, confidence_level: 0, p_value: 1.0, z_score: None }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignificanceConfig {
    pub min_sample_size: u64,
    pub z_threshold: f64,
}

impl Default for SignificanceConfig {
    fn default() -> Self {
        Self { min_sample_size: 100, z_threshold: 1.96 }
    }
}

/// Pooled two-proportion z statistic. A zero standard error (both rates 0 or both 1,
/// or an empty arm) yields 0.
pub fn z_score(a: VariantCounts, b: VariantCounts) -> f64 {
    if a.users == 0 || b.users == 0 {
        return 0.0;
    }
    let n1 = a.users as f64;
    let n2 = b.users as f64;
    let pooled = (a.conversions + b.conversions) as f64 / (n1 + n2);
    let se = (pooled * (1.0 - pooled) * (1.0 / n1 + 1.0 / n2)).sqrt();
    if se.is_nan() || se <= 0.0 {
        return 0.0;
    }
    (a.rate() - b.rate()).abs() / se
}

pub fn significance(a: VariantCounts, b: VariantCounts, cfg: &SignificanceConfig) -> SignificanceResult {
    if a.users + b.users < cfg.min_sample_size {
        return SignificanceResult::insufficient();
    }
    let z = z_score(a, b);
    let is_significant = z > cfg.z_threshold;
    SignificanceResult {
        is_significant,
        confidence_level: if is_significant { 95 } else { 0 },
        p_value: (1.0 - z / cfg.z_threshold).max(0.0),
        z_score: Some(z),
    }
}

/// Compares the first two arms; fewer than two is insufficient data.
pub fn compare_arms(arms: &[VariantCounts], cfg: &SignificanceConfig) -> SignificanceResult {
    match arms {
        [a, b, ..] => significance(*a, *b, cfg),
        _ => SignificanceResult::insufficient(),
    }
}

/// Two-tailed p-value from the standard normal CDF.
pub fn two_tailed_p(z: f64) -> f64 {
    (2.0 * (1.0 - normal_cdf(z.abs()))).clamp(0.0, 1.0)
}

// Abramowitz-Stegun 26.2.17
fn normal_cdf(z: f64) -> f64 {
    if z < 0.0 {
        return 1.0 - normal_cdf(-z);
    }
    let t = 1.0 / (1.0 + 0.231_641_9 * z);
    let d = 0.398_942_3 * (-0.5 * z * z).exp();
    let prob = d * t * (0.319_381_5 + t * (-0.356_563_8 + t * (1.781_478 + t * (-1.821_256 + t * 1.330_274))));
    1.0 - prob
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clear_difference_is_significant() {
        let r = significance(VariantCounts::new(120, 30), VariantCounts::new(130, 55), &SignificanceConfig::default());
        assert!(r.is_significant);
        assert_eq!(r.confidence_level, 95);
        assert_eq!(r.p_value, 0.0);
        let z = r.z_score.unwrap();
        assert!(z > 2.8 && z < 3.0, "z = {}", z);
    }

    #[test]
    fn test_small_sample_floor() {
        let r = significance(VariantCounts::new(10, 3), VariantCounts::new(12, 5), &SignificanceConfig::default());
        assert_eq!(r, SignificanceResult::insufficient());
        assert!(!r.is_significant);
        assert_eq!(r.confidence_level, 0);
        assert_eq!(r.p_value, 1.0);
    }

    #[test]
    fn test_floor_holds_for_extreme_small_samples() {
        let cfg = SignificanceConfig::default();
        for users in 1..50u64 {
            let r = significance(VariantCounts::new(users, 0), VariantCounts::new(users, users), &cfg);
            assert!(!r.is_significant);
            assert_eq!(r.confidence_level, 0);
        }
    }

    #[test]
    fn test_identical_rates_not_significant() {
        let r = significance(VariantCounts::new(500, 50), VariantCounts::new(500, 50), &SignificanceConfig::default());
        assert!(!r.is_significant);
        assert_eq!(r.z_score, Some(0.0));
        assert_eq!(r.p_value, 1.0);
    }

    #[test]
    fn test_zero_standard_error() {
        assert_eq!(z_score(VariantCounts::new(100, 0), VariantCounts::new(100, 0)), 0.0);
        assert_eq!(z_score(VariantCounts::new(100, 100), VariantCounts::new(100, 100)), 0.0);
        assert_eq!(z_score(VariantCounts::new(0, 0), VariantCounts::new(200, 10)), 0.0);
    }

    #[test]
    fn test_approximate_p_value_linear_in_z() {
        // 60/600 vs 75/600: z ~ 1.37, below the threshold
        let a = VariantCounts::new(600, 60);
        let b = VariantCounts::new(600, 75);
        let r = significance(a, b, &SignificanceConfig::default());
        let z = r.z_score.unwrap();
        assert!(!r.is_significant);
        assert!((r.p_value - (1.0 - z / 1.96)).abs() < 1e-12);
        assert!(r.p_value > 0.0 && r.p_value < 1.0);
    }

    #[test]
    fn test_compare_arms_needs_two() {
        let cfg = SignificanceConfig::default();
        assert_eq!(compare_arms(&[VariantCounts::new(1_000, 10)], &cfg), SignificanceResult::insufficient());
        assert_eq!(compare_arms(&[], &cfg), SignificanceResult::insufficient());
        assert!(compare_arms(
            &[VariantCounts::new(120, 30), VariantCounts::new(130, 55), VariantCounts::new(5, 5)],
            &cfg
        )
        .is_significant);
    }

    #[test]
    fn test_two_tailed_p() {
        assert!((two_tailed_p(1.96) - 0.05).abs() < 1e-3);
        assert!((two_tailed_p(0.0) - 1.0).abs() < 1e-6);
        assert_eq!(two_tailed_p(-1.96), two_tailed_p(1.96));
    }
}
