//! Online adaptation of the proposal kernels.
//!
//! [`CovarianceAdapter`] feeds the Adaptive Metropolis and SCAM kernels with a covariance
//! learned from the chain's own history. [`ScaleTuner`] nudges SCAM's per-dimension step
//! sizes toward the target acceptance rate during burn-in.

use log::warn;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::error::NumericalInstability;
use crate::stats::{cholesky, AcceptanceCounter, RunningMoments};

/// Relative diagonal jitter added before factorising an estimate.
const JITTER: f64 = 1e-10;

/// Running covariance estimate of one chain and the factorised copy the kernels use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CovarianceAdapter {
    moments: RunningMoments,
    covariance: Array2<f64>,
    cholesky: Array2<f64>,
    interval: usize,
    min_samples: usize,
    refreshes: u64,
    failures: u64,
}

impl CovarianceAdapter {
    /**
    Starts from `initial` (identity or user supplied), refreshing every `interval` iterations
    once `min_samples` states have been observed.

    # Examples

    ```rust
    use ndarray::Array2;
    use pt_mcmc::adapt::CovarianceAdapter;

    let mut adapter = CovarianceAdapter::new(Array2::eye(2), 10, 20).unwrap();
    for i in 0..40 {
        let x = [i as f64, (i % 3) as f64];
        adapter.observe(&x, i);
    }
    assert!(adapter.refreshes() > 0);
    ```
    */
    pub fn new(
        initial: Array2<f64>,
        interval: usize,
        min_samples: usize,
    ) -> Result<Self, NumericalInstability> {
        let cholesky = cholesky(&initial)?;
        Ok(Self {
            moments: RunningMoments::new(initial.nrows()),
            covariance: initial,
            cholesky,
            interval: interval.max(1),
            min_samples,
            refreshes: 0,
            failures: 0,
        })
    }

    /// Adds `x` (the state recorded at `iteration`) and refreshes the kernels' covariance when
    /// the adaptation interval ends. Returns `true` if a new covariance was installed.
    pub fn observe(&mut self, x: &[f64], iteration: usize) -> bool {
        self.moments.push(x);
        if (iteration + 1) % self.interval != 0 || self.moments.count() < self.min_samples as u64
        {
            return false;
        }
        self.refresh()
    }

    fn refresh(&mut self) -> bool {
        let Some(mut estimate) = self.moments.covariance() else {
            return false;
        };
        let scale = estimate
            .diag()
            .iter()
            .fold(0.0_f64, |acc, v| acc.max(v.abs()))
            .max(f64::MIN_POSITIVE);
        estimate.diag_mut().mapv_inplace(|v| v + JITTER * scale);

        match cholesky(&estimate) {
            Ok(l) => {
                self.covariance = estimate;
                self.cholesky = l;
                self.refreshes += 1;
                true
            }
            Err(err) => {
                self.failures += 1;
                warn!(
                    "covariance estimate after {} samples rejected ({err}); keeping the last good one",
                    self.moments.count()
                );
                false
            }
        }
    }

    /// The covariance currently used by the kernels.
    pub fn covariance(&self) -> &Array2<f64> {
        &self.covariance
    }

    /// Lower Cholesky factor of [`covariance`](Self::covariance).
    pub fn cholesky(&self) -> &Array2<f64> {
        &self.cholesky
    }

    pub fn std_dev(&self, dim: usize) -> f64 {
        self.covariance[[dim, dim]].sqrt()
    }

    pub fn running_mean(&self) -> &Array1<f64> {
        self.moments.mean()
    }

    pub fn samples_seen(&self) -> u64 {
        self.moments.count()
    }

    pub fn refreshes(&self) -> u64 {
        self.refreshes
    }

    /// Number of estimates rejected as not positive definite.
    pub fn failures(&self) -> u64 {
        self.failures
    }
}

/// Per-dimension step-size factors for the SCAM kernel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaleTuner {
    factors: Vec<f64>,
    counters: Vec<AcceptanceCounter>,
    target: f64,
}

impl ScaleTuner {
    const MIN_FACTOR: f64 = 1e-3;
    const MAX_FACTOR: f64 = 1e3;

    pub fn new(n_params: usize, target: f64) -> Self {
        Self {
            factors: vec![1.0; n_params],
            counters: vec![AcceptanceCounter::default(); n_params],
            target,
        }
    }

    pub fn factor(&self, dim: usize) -> f64 {
        self.factors[dim]
    }

    pub fn factors(&self) -> &[f64] {
        &self.factors
    }

    pub fn record(&mut self, dim: usize, accepted: bool) {
        self.counters[dim].record(accepted);
    }

    /// Moves every factor by `exp(rate - target)` and starts a new counting window.
    pub fn tune(&mut self) {
        for (factor, counter) in self.factors.iter_mut().zip(self.counters.iter_mut()) {
            if counter.proposed == 0 {
                continue;
            }
            *factor = (*factor * (counter.rate() - self.target).exp())
                .clamp(Self::MIN_FACTOR, Self::MAX_FACTOR);
            *counter = AcceptanceCounter::default();
        }
    }
}
