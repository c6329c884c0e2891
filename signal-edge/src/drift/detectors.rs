//! Rolling buffers and two-sample tests used by the drift monitor.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, StudentsT};
use statrs::statistics::Statistics;

/// Fixed-capacity FIFO; pushing into a full buffer evicts the oldest value.
#[derive(Debug, Clone, PartialEq)]
pub struct RingBuffer<T> {
    values: VecDeque<T>,
    capacity: usize,
}

impl<T: Clone> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            values: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, value: T) {
        if self.values.len() == self.capacity {
            self.values.pop_front();
        }
        self.values.push_back(value);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.values.len() == self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.values.iter()
    }

    pub fn to_vec(&self) -> Vec<T> {
        self.values.iter().cloned().collect()
    }
}

/// Statistical test used for distributional drift.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftTest {
    /// Two-sample Kolmogorov-Smirnov.
    #[default]
    KolmogorovSmirnov,
    /// Welch's unequal-variance t-test on the means.
    WelchT,
}

impl DriftTest {
    /// p-value for the hypothesis that both samples share a distribution.
    pub fn p_value(&self, recent: &[f64], reference: &[f64]) -> f64 {
        match self {
            Self::KolmogorovSmirnov => ks_two_sample(recent, reference).1,
            Self::WelchT => welch_t_test(recent, reference).1,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::KolmogorovSmirnov => "ks",
            Self::WelchT => "welch_t",
        }
    }
}

fn finite_sorted(sample: &[f64]) -> Vec<f64> {
    let mut values: Vec<f64> = sample.iter().copied().filter(|v| v.is_finite()).collect();
    values.sort_by(|a, b| a.total_cmp(b));
    values
}

/// Two-sample Kolmogorov-Smirnov test.
///
/// Returns (D statistic, asymptotic p-value). Empty samples give (0, 1).
pub fn ks_two_sample(sample_a: &[f64], sample_b: &[f64]) -> (f64, f64) {
    let a = finite_sorted(sample_a);
    let b = finite_sorted(sample_b);
    if a.is_empty() || b.is_empty() {
        return (0.0, 1.0);
    }

    let n_a = a.len() as f64;
    let n_b = b.len() as f64;

    // Step both empirical CDFs past each distinct value so ties move together.
    let mut d_max: f64 = 0.0;
    let (mut i, mut j) = (0usize, 0usize);
    while i < a.len() && j < b.len() {
        let x = a[i].min(b[j]);
        while i < a.len() && a[i] <= x {
            i += 1;
        }
        while j < b.len() && b[j] <= x {
            j += 1;
        }
        d_max = d_max.max((i as f64 / n_a - j as f64 / n_b).abs());
    }

    let n_eff = (n_a * n_b) / (n_a + n_b);
    let lambda = (n_eff.sqrt() + 0.12 + 0.11 / n_eff.sqrt()) * d_max;

    (d_max, kolmogorov_q(lambda))
}

/// Survival function of the Kolmogorov distribution,
/// Q(λ) = 2 Σ (-1)^(j-1) exp(-2 j² λ²).
fn kolmogorov_q(lambda: f64) -> f64 {
    const EPS1: f64 = 1e-3;
    const EPS2: f64 = 1e-8;

    let a2 = -2.0 * lambda * lambda;
    let mut fac = 2.0;
    let mut sum = 0.0;
    let mut prev_term: f64 = 0.0;

    for j in 1..=100 {
        let jf = j as f64;
        let term = fac * (a2 * jf * jf).exp();
        sum += term;
        if term.abs() <= EPS1 * prev_term || term.abs() <= EPS2 * sum {
            return sum.clamp(0.0, 1.0);
        }
        fac = -fac;
        prev_term = term.abs();
    }

    // The series only fails to converge for λ near zero, where Q → 1.
    1.0
}

/// Welch's two-sample t-test.
///
/// Returns (t statistic, two-sided p-value). Samples with fewer than two
/// finite values give (0, 1).
pub fn welch_t_test(sample_a: &[f64], sample_b: &[f64]) -> (f64, f64) {
    let a: Vec<f64> = sample_a.iter().copied().filter(|v| v.is_finite()).collect();
    let b: Vec<f64> = sample_b.iter().copied().filter(|v| v.is_finite()).collect();
    if a.len() < 2 || b.len() < 2 {
        return (0.0, 1.0);
    }

    let n_a = a.len() as f64;
    let n_b = b.len() as f64;
    let mean_a = a.iter().mean();
    let mean_b = b.iter().mean();
    let se_a = a.iter().variance() / n_a;
    let se_b = b.iter().variance() / n_b;
    let se2 = se_a + se_b;

    if se2 == 0.0 {
        // Two constant samples: identical or certainly different.
        return if mean_a == mean_b {
            (0.0, 1.0)
        } else {
            (f64::INFINITY.copysign(mean_a - mean_b), 0.0)
        };
    }

    let t = (mean_a - mean_b) / se2.sqrt();
    let df = se2 * se2 / (se_a * se_a / (n_a - 1.0) + se_b * se_b / (n_b - 1.0));

    let p = match StudentsT::new(0.0, 1.0, df) {
        Ok(dist) => 2.0 * (1.0 - dist.cdf(t.abs())),
        Err(_) => 1.0,
    };

    (t, p.clamp(0.0, 1.0))
}
