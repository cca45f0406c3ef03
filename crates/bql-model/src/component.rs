//! Conjugate component models
//!
//! Continuous columns use a Normal likelihood with a Normal-Gamma prior;
//! multinomial columns use a categorical likelihood with a symmetric
//! Dirichlet prior. Both expose closed-form marginal likelihoods, which the
//! collapsed Gibbs kernels rely on.

use std::f64::consts::PI;

use rand::Rng;
use rand_distr::{Distribution, StudentT};

use crate::types::{DataColumn, Datum};

const DIRICHLET_ALPHA: f64 = 1.0;

/// Hyperparameters for one column, fixed from the data at dataset creation.
#[derive(Debug, Clone, PartialEq)]
pub enum Prior {
    NormalGamma { mu0: f64, kappa0: f64, a0: f64, b0: f64 },
    Dirichlet { alpha: f64, k: usize },
}

impl Prior {
    pub fn for_column(column: &DataColumn) -> Self {
        match column {
            DataColumn::Continuous(values) => {
                let observed: Vec<f64> = values.iter().flatten().copied().collect();
                let n = observed.len() as f64;
                let mu0 = if observed.is_empty() { 0.0 } else { observed.iter().sum::<f64>() / n };
                let var = if observed.len() > 1 {
                    observed.iter().map(|x| (x - mu0).powi(2)).sum::<f64>() / n
                } else {
                    0.0
                };
                let b0 = if var.is_finite() && var > 0.0 { var } else { 1.0 };
                Prior::NormalGamma { mu0, kappa0: 1.0, a0: 1.0, b0 }
            }
            DataColumn::Multinomial { categories, .. } => Prior::Dirichlet {
                alpha: DIRICHLET_ALPHA,
                k: categories.len().max(1),
            },
        }
    }

    /// Spread of the column the prior was fitted to; 1 for categorical columns.
    pub fn scale(&self) -> f64 {
        match self {
            Prior::NormalGamma { b0, .. } => b0.sqrt(),
            Prior::Dirichlet { .. } => 1.0,
        }
    }

    pub fn empty_stats(&self) -> Stats {
        match self {
            Prior::NormalGamma { .. } => Stats::Normal { n: 0.0, sum: 0.0, sumsq: 0.0 },
            Prior::Dirichlet { k, .. } => Stats::Categorical { n: 0.0, counts: vec![0.0; *k] },
        }
    }
}

/// Sufficient statistics of one (cluster, column) component.
#[derive(Debug, Clone, PartialEq)]
pub enum Stats {
    Normal { n: f64, sum: f64, sumsq: f64 },
    Categorical { n: f64, counts: Vec<f64> },
}

/// Posterior Normal-Gamma parameters `(mu_n, kappa_n, a_n, b_n)`.
fn normal_gamma_posterior(prior: &Prior, n: f64, sum: f64, sumsq: f64) -> (f64, f64, f64, f64) {
    let Prior::NormalGamma { mu0, kappa0, a0, b0 } = *prior else {
        return (0.0, 1.0, 1.0, 1.0);
    };
    let kappa_n = kappa0 + n;
    let mu_n = (kappa0 * mu0 + sum) / kappa_n;
    let a_n = a0 + n / 2.0;
    let (ss, xbar) = if n > 0.0 {
        let xbar = sum / n;
        ((sumsq - n * xbar * xbar).max(0.0), xbar)
    } else {
        (0.0, 0.0)
    };
    let b_n = b0 + 0.5 * ss + kappa0 * n * (xbar - mu0).powi(2) / (2.0 * kappa_n);
    (mu_n, kappa_n, a_n, b_n)
}

impl Stats {
    pub fn count(&self) -> f64 {
        match self {
            Stats::Normal { n, .. } | Stats::Categorical { n, .. } => *n,
        }
    }

    pub fn insert(&mut self, datum: Datum) {
        self.update(datum, 1.0);
    }

    pub fn remove(&mut self, datum: Datum) {
        self.update(datum, -1.0);
    }

    fn update(&mut self, datum: Datum, sign: f64) {
        match (self, datum) {
            (Stats::Normal { n, sum, sumsq }, Datum::Real(x)) => {
                *n += sign;
                *sum += sign * x;
                *sumsq += sign * x * x;
            }
            (Stats::Categorical { n, counts }, Datum::Code(k)) => {
                if let Some(c) = counts.get_mut(k) {
                    *c += sign;
                    *n += sign;
                }
            }
            // Type mismatches cannot come from a validated dataset.
            _ => {}
        }
    }

    /// Posterior mean of a continuous component.
    pub fn posterior_mean(&self, prior: &Prior) -> Option<f64> {
        match self {
            Stats::Normal { n, sum, sumsq } => Some(normal_gamma_posterior(prior, *n, *sum, *sumsq).0),
            Stats::Categorical { .. } => None,
        }
    }

    /// Log marginal likelihood of the data summarised by these statistics.
    pub fn log_marginal(&self, prior: &Prior) -> f64 {
        match (self, prior) {
            (Stats::Normal { n, sum, sumsq }, Prior::NormalGamma { kappa0, a0, b0, .. }) => {
                let (_, kappa_n, a_n, b_n) = normal_gamma_posterior(prior, *n, *sum, *sumsq);
                ln_gamma(a_n) - ln_gamma(*a0) + a0 * b0.ln() - a_n * b_n.ln()
                    + 0.5 * (kappa0.ln() - kappa_n.ln())
                    - 0.5 * n * (2.0 * PI).ln()
            }
            (Stats::Categorical { n, counts }, Prior::Dirichlet { alpha, k }) => {
                let k = *k as f64;
                let mut lp = ln_gamma(k * alpha) - ln_gamma(k * alpha + n);
                for c in counts {
                    lp += ln_gamma(alpha + c) - ln_gamma(*alpha);
                }
                lp
            }
            _ => 0.0,
        }
    }

    /// Log predictive probability (or density) of one more datum.
    pub fn log_predictive(&self, prior: &Prior, datum: Datum) -> f64 {
        match (self, prior, datum) {
            (Stats::Normal { n, sum, sumsq }, Prior::NormalGamma { .. }, Datum::Real(x)) => {
                let (mu_n, kappa_n, a_n, b_n) = normal_gamma_posterior(prior, *n, *sum, *sumsq);
                let nu = 2.0 * a_n;
                let scale2 = b_n * (kappa_n + 1.0) / (a_n * kappa_n);
                ln_gamma((nu + 1.0) / 2.0) - ln_gamma(nu / 2.0) - 0.5 * (nu * PI * scale2).ln()
                    - (nu + 1.0) / 2.0 * (1.0 + (x - mu_n).powi(2) / (nu * scale2)).ln()
            }
            (Stats::Categorical { n, counts }, Prior::Dirichlet { alpha, k }, Datum::Code(code)) => {
                let c = counts.get(code).copied().unwrap_or(0.0);
                ((c + alpha) / (n + *k as f64 * alpha)).ln()
            }
            _ => f64::NEG_INFINITY,
        }
    }

    /// Draw one datum from the predictive distribution.
    pub fn sample<R: Rng + ?Sized>(&self, prior: &Prior, rng: &mut R) -> Datum {
        match self {
            Stats::Normal { n, sum, sumsq } => {
                let (mu_n, kappa_n, a_n, b_n) = normal_gamma_posterior(prior, *n, *sum, *sumsq);
                let nu = 2.0 * a_n;
                let scale = (b_n * (kappa_n + 1.0) / (a_n * kappa_n)).sqrt();
                let t = StudentT::new(nu).map(|d| d.sample(rng)).unwrap_or(0.0);
                Datum::Real(mu_n + scale * t)
            }
            Stats::Categorical { counts, .. } => {
                let alpha = match prior {
                    Prior::Dirichlet { alpha, .. } => *alpha,
                    Prior::NormalGamma { .. } => DIRICHLET_ALPHA,
                };
                let weights: Vec<f64> = counts.iter().map(|c| (c + alpha).ln()).collect();
                Datum::Code(sample_log_weights(rng, &weights))
            }
        }
    }
}

/// Build statistics for `column` over the rows for which `member` holds.
pub fn stats_for(prior: &Prior, column: &DataColumn, member: impl Fn(usize) -> bool) -> Stats {
    let mut stats = prior.empty_stats();
    for row in (0..column.len()).filter(|r| member(*r)) {
        if let Some(datum) = column.get(row) {
            stats.insert(datum);
        }
    }
    stats
}

/// Sample an index proportionally to `exp(log_weights)`.
///
/// Entries equal to negative infinity are never chosen unless every entry is.
pub fn sample_log_weights<R: Rng + ?Sized>(rng: &mut R, log_weights: &[f64]) -> usize {
    let max = log_weights.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return rng.gen_range(0..log_weights.len().max(1));
    }
    let weights: Vec<f64> = log_weights.iter().map(|w| (w - max).exp()).collect();
    let total: f64 = weights.iter().sum();
    let mut u = rng.gen::<f64>() * total;
    for (i, w) in weights.iter().enumerate() {
        if u < *w {
            return i;
        }
        u -= w;
    }
    // Rounding can leave `u` marginally above the last weight.
    weights.iter().rposition(|w| *w > 0.0).unwrap_or(0)
}

/// Log probability of a partition with the given block sizes under CRP(alpha).
pub fn crp_log_probability(sizes: &[usize], alpha: f64) -> f64 {
    let total: usize = sizes.iter().sum();
    let blocks = sizes.iter().filter(|s| **s > 0).count() as f64;
    let mut lp = blocks * alpha.ln() + ln_gamma(alpha) - ln_gamma(alpha + total as f64);
    for size in sizes.iter().filter(|s| **s > 0) {
        lp += ln_gamma(*size as f64);
    }
    lp
}

/// Natural log of the gamma function (Lanczos approximation, g = 7).
pub fn ln_gamma(x: f64) -> f64 {
    const COEFFS: [f64; 9] = [
        0.999_999_999_999_809_9,
        676.520_368_121_885_1,
        -1_259.139_216_722_402_8,
        771.323_428_777_653_1,
        -176.615_029_162_140_6,
        12.507_343_278_686_905,
        -0.138_571_095_265_720_12,
        9.984_369_578_019_572e-6,
        1.505_632_735_149_311_6e-7,
    ];
    if x < 0.5 {
        // Reflection formula.
        return (PI / (PI * x).sin()).abs().ln() - ln_gamma(1.0 - x);
    }
    let x = x - 1.0;
    let t = x + 7.5;
    let mut a = COEFFS[0];
    for (i, c) in COEFFS.iter().enumerate().skip(1) {
        a += c / (x + i as f64);
    }
    0.5 * (2.0 * PI).ln() + (x + 0.5) * t.ln() - t + a.ln()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_ln_gamma_matches_factorials() {
        assert!(ln_gamma(1.0).abs() < 1e-10);
        assert!(ln_gamma(2.0).abs() < 1e-10);
        assert!((ln_gamma(5.0) - 24f64.ln()).abs() < 1e-10);
        assert!((ln_gamma(0.5) - PI.sqrt().ln()).abs() < 1e-10);
    }

    #[test]
    fn test_predictive_is_ratio_of_marginals() {
        let prior = Prior::NormalGamma { mu0: 0.0, kappa0: 1.0, a0: 1.0, b0: 1.0 };
        let mut stats = prior.empty_stats();
        for x in [0.3, -1.2, 0.8] {
            stats.insert(Datum::Real(x));
        }
        let before = stats.log_marginal(&prior);
        let predictive = stats.log_predictive(&prior, Datum::Real(0.1));
        stats.insert(Datum::Real(0.1));
        let after = stats.log_marginal(&prior);
        assert!((after - before - predictive).abs() < 1e-9);
    }

    #[test]
    fn test_posterior_mean_shrinks_toward_prior() {
        let prior = Prior::NormalGamma { mu0: 0.0, kappa0: 1.0, a0: 1.0, b0: 4.0 };
        let mut stats = prior.empty_stats();
        assert_eq!(stats.posterior_mean(&prior), Some(0.0));
        for x in [9.0, 10.0, 11.0] {
            stats.insert(Datum::Real(x));
        }
        assert_eq!(stats.posterior_mean(&prior), Some(7.5));
        assert_eq!(prior.scale(), 2.0);
        assert_eq!(Prior::Dirichlet { alpha: 1.0, k: 2 }.empty_stats().posterior_mean(&prior), None);
    }

    #[test]
    fn test_categorical_predictive_sums_to_one() {
        let prior = Prior::Dirichlet { alpha: 1.0, k: 3 };
        let mut stats = prior.empty_stats();
        stats.insert(Datum::Code(0));
        stats.insert(Datum::Code(0));
        stats.insert(Datum::Code(2));
        let total: f64 = (0..3)
            .map(|k| stats.log_predictive(&prior, Datum::Code(k)).exp())
            .sum();
        assert!((total - 1.0).abs() < 1e-12);
        stats.remove(Datum::Code(2));
        assert_eq!(stats.count(), 2.0);
    }

    #[test]
    fn test_sample_log_weights_skips_impossible_entries() {
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..100 {
            let i = sample_log_weights(&mut rng, &[f64::NEG_INFINITY, 0.0, f64::NEG_INFINITY]);
            assert_eq!(i, 1);
        }
    }

    #[test]
    fn test_crp_single_block_probability() {
        // One block of one item under CRP(1) has probability 1.
        assert!(crp_log_probability(&[1], 1.0).abs() < 1e-10);
    }
}
