//! Running statistics and small numerical helpers used by the sampler.

use nalgebra::DMatrix;
use ndarray::prelude::*;
use rustfft::num_complex::Complex;
use rustfft::FftPlanner;
use serde::{Deserialize, Serialize};

use crate::error::NumericalInstability;

/// Online mean and covariance (Welford's update), O(D^2) memory regardless of chain length.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunningMoments {
    n: u64,
    mean: Array1<f64>,
    /// Sum of outer products of deviations from the running mean.
    m2: Array2<f64>,
}

impl RunningMoments {
    pub fn new(n_params: usize) -> Self {
        Self {
            n: 0,
            mean: Array1::zeros(n_params),
            m2: Array2::zeros((n_params, n_params)),
        }
    }

    pub fn push(&mut self, x: &[f64]) {
        debug_assert_eq!(x.len(), self.mean.len());
        self.n += 1;
        let n = self.n as f64;
        let x = ArrayView1::from(x);
        let delta_old = &x - &self.mean;
        self.mean.scaled_add(1.0 / n, &delta_old);
        let delta_new = &x - &self.mean;
        let d = self.mean.len();
        for i in 0..d {
            for j in 0..d {
                self.m2[[i, j]] += delta_old[i] * delta_new[j];
            }
        }
    }

    pub fn count(&self) -> u64 {
        self.n
    }

    pub fn mean(&self) -> &Array1<f64> {
        &self.mean
    }

    /// Unbiased sample covariance, `None` with fewer than two observations.
    pub fn covariance(&self) -> Option<Array2<f64>> {
        if self.n < 2 {
            return None;
        }
        let mut cov = &self.m2 / (self.n - 1) as f64;
        // Symmetrise away rounding drift.
        let d = cov.nrows();
        for i in 0..d {
            for j in (i + 1)..d {
                let avg = 0.5 * (cov[[i, j]] + cov[[j, i]]);
                cov[[i, j]] = avg;
                cov[[j, i]] = avg;
            }
        }
        Some(cov)
    }
}

/// Proposed/accepted counts for one kind of move.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptanceCounter {
    pub proposed: u64,
    pub accepted: u64,
}

impl AcceptanceCounter {
    pub fn record(&mut self, accepted: bool) {
        self.proposed += 1;
        if accepted {
            self.accepted += 1;
        }
    }

    /// Acceptance rate, 0 before the first proposal.
    pub fn rate(&self) -> f64 {
        if self.proposed == 0 {
            0.0
        } else {
            self.accepted as f64 / self.proposed as f64
        }
    }
}

/// Copies an ndarray matrix into nalgebra dense storage.
pub fn to_dmatrix(a: &Array2<f64>) -> DMatrix<f64> {
    DMatrix::from_fn(a.nrows(), a.ncols(), |i, j| a[[i, j]])
}

/// Lower Cholesky factor `L` with `L L^T = a`.
///
/// Fails with [`NumericalInstability`] if `a` is not square, has non-finite entries or is not
/// (numerically) positive definite.
pub fn cholesky(a: &Array2<f64>) -> Result<Array2<f64>, NumericalInstability> {
    let n = a.nrows();
    if a.ncols() != n || a.iter().any(|v| !v.is_finite()) {
        return Err(NumericalInstability { dim: n });
    }
    let l = to_dmatrix(a)
        .cholesky()
        .ok_or(NumericalInstability { dim: n })?
        .unpack();
    Ok(Array2::from_shape_fn((n, n), |(i, j)| l[(i, j)]))
}

/// Normalised autocorrelation function of `series` at lags `0..n`, computed with an FFT.
pub fn autocorrelation(series: ArrayView1<f64>) -> Array1<f64> {
    let n = series.len();
    if n == 0 {
        return Array1::zeros(0);
    }
    let mean = series.mean().unwrap_or(0.0);
    let size = (2 * n).next_power_of_two();
    let mut buf: Vec<Complex<f64>> = series
        .iter()
        .map(|&x| Complex::new(x - mean, 0.0))
        .chain(std::iter::repeat(Complex::new(0.0, 0.0)))
        .take(size)
        .collect();

    let mut planner = FftPlanner::<f64>::new();
    planner.plan_fft_forward(size).process(&mut buf);
    for c in buf.iter_mut() {
        *c = Complex::new(c.norm_sqr(), 0.0);
    }
    planner.plan_fft_inverse(size).process(&mut buf);

    let c0 = buf[0].re;
    if c0 <= 0.0 {
        return Array1::zeros(n);
    }
    buf.iter().take(n).map(|c| c.re / c0).collect()
}

/**
Integrated autocorrelation time `tau = 1 + 2 sum_k rho_k`, using Sokal's automatic window
(the smallest `M` with `M >= window * tau(M)`, `window = 5`).

Returns `NaN` for series shorter than two points or with zero variance.

# Examples

```rust
use ndarray::Array1;
use pt_mcmc::stats::integrated_autocorr_time;

let alternating: Array1<f64> = (0..1000).map(|i| if i % 2 == 0 { 1.0 } else { -1.0 }).collect();
assert!(integrated_autocorr_time(alternating.view()) < 1.0);
```
*/
pub fn integrated_autocorr_time(series: ArrayView1<f64>) -> f64 {
    const WINDOW: f64 = 5.0;
    if series.len() < 2 {
        return f64::NAN;
    }
    let rho = autocorrelation(series);
    if rho[0] == 0.0 {
        return f64::NAN;
    }
    let mut tau = 1.0;
    for m in 1..rho.len() {
        tau += 2.0 * rho[m];
        if (m as f64) >= WINDOW * tau {
            break;
        }
    }
    tau
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};
    use rand_distr::StandardNormal;

    #[test]
    fn welford_matches_two_pass() {
        let data = arr2(&[
            [0.0, 1.0, 0.0],
            [1.0, 2.0, 0.0],
            [0.0, 0.0, 0.5],
            [2.0, 1.0, -1.0],
            [1.0, 1.0, 1.0],
        ]);
        let mut moments = RunningMoments::new(3);
        for row in data.rows() {
            moments.push(row.as_slice().unwrap());
        }
        let mean = data.mean_axis(Axis(0)).unwrap();
        let centered = &data - &mean;
        let expected = centered.t().dot(&centered) / 4.0;

        assert_eq!(moments.count(), 5);
        assert_abs_diff_eq!(moments.mean().clone(), mean, epsilon = 1e-12);
        assert_abs_diff_eq!(moments.covariance().unwrap(), expected, epsilon = 1e-12);
    }

    #[test]
    fn welford_stays_accurate_with_large_offset() {
        let mut moments = RunningMoments::new(1);
        for i in 0..1000 {
            moments.push(&[1e9 + (i % 2) as f64]);
        }
        let var = moments.covariance().unwrap()[[0, 0]];
        assert_abs_diff_eq!(var, 0.25 * 1000.0 / 999.0, epsilon = 1e-6);
    }

    #[test]
    fn covariance_needs_two_points() {
        let mut moments = RunningMoments::new(2);
        assert!(moments.covariance().is_none());
        moments.push(&[1.0, 2.0]);
        assert!(moments.covariance().is_none());
    }

    #[test]
    fn cholesky_reconstructs_the_matrix() {
        let a = arr2(&[[4.0, 2.0, 0.4], [2.0, 3.0, 0.1], [0.4, 0.1, 1.0]]);
        let l = cholesky(&a).unwrap();
        assert_abs_diff_eq!(l.dot(&l.t()), a, epsilon = 1e-12);
        assert_eq!(l[[0, 1]], 0.0);
    }

    #[test]
    fn cholesky_rejects_indefinite_and_non_finite_matrices() {
        let indefinite = arr2(&[[1.0, 2.0], [2.0, 1.0]]);
        assert_eq!(
            cholesky(&indefinite).unwrap_err(),
            NumericalInstability { dim: 2 }
        );
        let nan = arr2(&[[1.0, f64::NAN], [f64::NAN, 1.0]]);
        assert!(cholesky(&nan).is_err());
        assert!(cholesky(&Array2::zeros((2, 3))).is_err());
    }

    #[test]
    fn white_noise_has_unit_autocorrelation_time() {
        let mut rng = SmallRng::seed_from_u64(42);
        let noise: Array1<f64> = (0..20_000).map(|_| rng.sample(StandardNormal)).collect();
        let tau = integrated_autocorr_time(noise.view());
        assert!((tau - 1.0).abs() < 0.2, "tau = {tau}");
    }

    #[test]
    fn ar1_autocorrelation_time() {
        // AR(1) with phi = 0.8 has tau = (1 + phi) / (1 - phi) = 9.
        let mut rng = SmallRng::seed_from_u64(3);
        let mut x = 0.0;
        let series: Array1<f64> = (0..100_000)
            .map(|_| {
                x = 0.8 * x + rng.sample::<f64, _>(StandardNormal);
                x
            })
            .collect();
        let tau = integrated_autocorr_time(series.view());
        assert!((tau - 9.0).abs() < 1.5, "tau = {tau}");
    }

    #[test]
    fn acceptance_counter_rate() {
        let mut c = AcceptanceCounter::default();
        assert_eq!(c.rate(), 0.0);
        c.record(true);
        c.record(false);
        c.record(false);
        c.record(true);
        assert_eq!(c.rate(), 0.5);
    }
}
