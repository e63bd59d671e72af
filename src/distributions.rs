/*!
Traits for the user-supplied likelihood and prior, plus a few concrete densities.

The sampler only ever talks to a [`Target`]: a pair of fallible, pure functions returning the
log-likelihood and the log-prior of a parameter vector. [`Posterior`] glues any two
[`LogDensity`] values (including plain closures) into a `Target`. Kernels that need to draw
from the prior use a [`PriorSampler`].

# Examples

```rust
use pt_mcmc::distributions::{Gaussian, LogDensity, Posterior, Target, UniformBox};
use pt_mcmc::error::EvaluationError;

// A closure likelihood with a box prior.
let loglike = |x: &[f64]| -> Result<f64, EvaluationError> {
    Ok(-0.5 * x.iter().map(|v| v * v).sum::<f64>())
};
let target = Posterior::new(loglike, UniformBox::cube(2, -10.0, 10.0));
assert!(target.log_likelihood(&[0.0, 0.0]).unwrap() == 0.0);

// A closed-form Gaussian likelihood.
let gauss = Gaussian::standard(2);
let lp = gauss.log_density(&[0.5, -0.5]).unwrap();
println!("Normalized log-density: {}", lp);
```
*/

use nalgebra::{DMatrix, DVector};
use ndarray::{Array1, Array2};
use rand::rngs::SmallRng;
use rand::Rng;
use rand_distr::StandardNormal;
use std::f64::consts::PI;

use crate::error::{EvaluationError, NumericalInstability};
use crate::stats::to_dmatrix;

/// The density the sampler explores.
///
/// Both methods must be pure and deterministic. Returning `Err` (or `-inf`) for a candidate
/// makes the sampler reject it; it never aborts a run.
pub trait Target: Send + Sync {
    /// Log-likelihood of `theta`.
    fn log_likelihood(&self, theta: &[f64]) -> Result<f64, EvaluationError>;

    /// Log-prior of `theta`. `-inf` outside the prior support.
    fn log_prior(&self, theta: &[f64]) -> Result<f64, EvaluationError>;
}

/// A single log-density, used for either half of a [`Posterior`].
pub trait LogDensity: Send + Sync {
    fn log_density(&self, theta: &[f64]) -> Result<f64, EvaluationError>;
}

impl<F> LogDensity for F
where
    F: Fn(&[f64]) -> Result<f64, EvaluationError> + Send + Sync,
{
    fn log_density(&self, theta: &[f64]) -> Result<f64, EvaluationError> {
        self(theta)
    }
}

/// Draws candidate points for the prior-draw kernel and for random initial states.
pub trait PriorSampler: Send + Sync {
    /// Draws one point.
    fn draw(&self, rng: &mut SmallRng) -> Vec<f64>;

    /// Log density of the draw distribution *relative to the prior*, up to a constant.
    ///
    /// Zero (the default) for samplers that draw exactly from the prior. A sampler that draws
    /// from some other distribution `q` returns `log q(theta) - log prior(theta)`, which turns
    /// the prior-draw kernel into a general independence proposal.
    fn log_proposal_density(&self, _theta: &[f64]) -> f64 {
        0.0
    }
}

/**
A likelihood and a prior bundled into a [`Target`].

# Examples

```rust
use pt_mcmc::distributions::{Gaussian, Posterior, Target, UniformBox};

let target = Posterior::new(Gaussian::standard(1), UniformBox::cube(1, -1.0, 1.0));
assert_eq!(target.log_prior(&[2.0]).unwrap(), f64::NEG_INFINITY);
```
*/
#[derive(Debug, Clone)]
pub struct Posterior<L, P> {
    pub likelihood: L,
    pub prior: P,
}

impl<L: LogDensity, P: LogDensity> Posterior<L, P> {
    pub fn new(likelihood: L, prior: P) -> Self {
        Self { likelihood, prior }
    }
}

impl<L: LogDensity, P: LogDensity> Target for Posterior<L, P> {
    fn log_likelihood(&self, theta: &[f64]) -> Result<f64, EvaluationError> {
        self.likelihood.log_density(theta)
    }

    fn log_prior(&self, theta: &[f64]) -> Result<f64, EvaluationError> {
        self.prior.log_density(theta)
    }
}

impl<L: Send + Sync, P: PriorSampler> PriorSampler for Posterior<L, P> {
    fn draw(&self, rng: &mut SmallRng) -> Vec<f64> {
        self.prior.draw(rng)
    }

    fn log_proposal_density(&self, theta: &[f64]) -> f64 {
        self.prior.log_proposal_density(theta)
    }
}

/**
A multivariate Gaussian density with full covariance.

The Cholesky factor of the covariance is computed once at construction, so evaluation costs
one triangular solve.

# Examples

```rust
use pt_mcmc::distributions::{Gaussian, LogDensity};
use ndarray::{arr1, arr2};

let gauss = Gaussian::new(arr1(&[0.0, 0.0]), arr2(&[[4.0, 2.0], [2.0, 3.0]])).unwrap();
let lp = gauss.log_density(&[1.0, -1.0]).unwrap();
println!("Log probability: {}", lp);
```
*/
#[derive(Debug, Clone)]
pub struct Gaussian {
    pub mean: Array1<f64>,
    pub cov: Array2<f64>,
    chol: DMatrix<f64>,
    log_norm: f64,
}

impl Gaussian {
    /// Builds the density, failing if `cov` is not positive definite.
    pub fn new(mean: Array1<f64>, cov: Array2<f64>) -> Result<Self, NumericalInstability> {
        let n = mean.len();
        if cov.dim() != (n, n) {
            return Err(NumericalInstability { dim: n });
        }
        let chol = to_dmatrix(&cov)
            .cholesky()
            .ok_or(NumericalInstability { dim: n })?
            .unpack();
        let log_det_half: f64 = chol.diagonal().iter().map(|l| l.ln()).sum();
        Ok(Self {
            mean,
            cov,
            chol,
            log_norm: -0.5 * n as f64 * (2.0 * PI).ln() - log_det_half,
        })
    }

    /// Zero-mean, identity-covariance Gaussian in `dim` dimensions.
    pub fn standard(dim: usize) -> Self {
        Self {
            mean: Array1::zeros(dim),
            cov: Array2::eye(dim),
            chol: DMatrix::identity(dim, dim),
            log_norm: -0.5 * dim as f64 * (2.0 * PI).ln(),
        }
    }

    pub fn dim(&self) -> usize {
        self.mean.len()
    }
}

impl LogDensity for Gaussian {
    fn log_density(&self, theta: &[f64]) -> Result<f64, EvaluationError> {
        if theta.len() != self.dim() {
            return Err(EvaluationError::Domain(format!(
                "expected {} parameters, got {}",
                self.dim(),
                theta.len()
            )));
        }
        let diff = DVector::from_iterator(
            self.dim(),
            theta.iter().zip(self.mean.iter()).map(|(x, m)| x - m),
        );
        // L y = theta - mean, so the quadratic form is |y|^2.
        let y = self
            .chol
            .solve_lower_triangular(&diff)
            .ok_or(EvaluationError::NonFinite {
                what: "log likelihood",
            })?;
        Ok(self.log_norm - 0.5 * y.norm_squared())
    }
}

impl PriorSampler for Gaussian {
    fn draw(&self, rng: &mut SmallRng) -> Vec<f64> {
        let z = DVector::from_fn(self.dim(), |_, _| rng.sample::<f64, _>(StandardNormal));
        let step = &self.chol * z;
        self.mean.iter().zip(step.iter()).map(|(m, s)| m + s).collect()
    }
}

/**
A uniform prior on an axis-aligned box.

# Examples

```rust
use pt_mcmc::distributions::{LogDensity, UniformBox};

let prior = UniformBox::cube(2, 0.0, 2.0);
assert!((prior.log_density(&[1.0, 1.0]).unwrap() + 4.0_f64.ln()).abs() < 1e-12);
assert_eq!(prior.log_density(&[3.0, 1.0]).unwrap(), f64::NEG_INFINITY);
```
*/
#[derive(Debug, Clone, PartialEq)]
pub struct UniformBox {
    pub lower: Vec<f64>,
    pub upper: Vec<f64>,
    log_volume: f64,
}

impl UniformBox {
    /// Panics if the bounds differ in length or any `lower >= upper`.
    pub fn new(lower: Vec<f64>, upper: Vec<f64>) -> Self {
        assert_eq!(lower.len(), upper.len(), "bounds must have the same length");
        assert!(
            lower.iter().zip(&upper).all(|(lo, hi)| lo < hi),
            "every lower bound must be below its upper bound"
        );
        let log_volume = lower.iter().zip(&upper).map(|(lo, hi)| (hi - lo).ln()).sum();
        Self {
            lower,
            upper,
            log_volume,
        }
    }

    /// The cube `[low, high]^dim`.
    pub fn cube(dim: usize, low: f64, high: f64) -> Self {
        Self::new(vec![low; dim], vec![high; dim])
    }

    pub fn contains(&self, theta: &[f64]) -> bool {
        theta.len() == self.lower.len()
            && theta
                .iter()
                .zip(self.lower.iter().zip(&self.upper))
                .all(|(x, (lo, hi))| lo <= x && x <= hi)
    }
}

impl LogDensity for UniformBox {
    fn log_density(&self, theta: &[f64]) -> Result<f64, EvaluationError> {
        if self.contains(theta) {
            Ok(-self.log_volume)
        } else {
            Ok(f64::NEG_INFINITY)
        }
    }
}

impl PriorSampler for UniformBox {
    fn draw(&self, rng: &mut SmallRng) -> Vec<f64> {
        self.lower
            .iter()
            .zip(&self.upper)
            .map(|(&lo, &hi)| rng.gen_range(lo..hi))
            .collect()
    }
}

#[cfg(test)]
mod distributions_tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{arr1, arr2};
    use rand::SeedableRng;

    #[test]
    fn standard_gaussian_log_density_1d() {
        let p = Gaussian::standard(1).log_density(&[1.0]).unwrap().exp();
        assert_abs_diff_eq!(p, 0.24197072451914337, epsilon = 1e-12);
    }

    #[test]
    fn full_covariance_matches_closed_form() {
        let cov = arr2(&[[4.0, 2.0], [2.0, 3.0]]);
        let gauss = Gaussian::new(arr1(&[1.0, -1.0]), cov).unwrap();
        // det = 8, inverse = [[3, -2], [-2, 4]] / 8; diff = (1, 1) -> quad = 3/8.
        let expected = -(2.0 * PI).ln() - 0.5 * 8.0_f64.ln() - 0.5 * 3.0 / 8.0;
        let got = gauss.log_density(&[2.0, 0.0]).unwrap();
        assert_abs_diff_eq!(got, expected, epsilon = 1e-12);
    }

    #[test]
    fn wrong_dimension_is_a_domain_error() {
        let err = Gaussian::standard(2).log_density(&[1.0]).unwrap_err();
        assert!(matches!(err, EvaluationError::Domain(_)));
    }

    #[test]
    fn indefinite_covariance_is_rejected() {
        let cov = arr2(&[[1.0, 2.0], [2.0, 1.0]]);
        assert!(Gaussian::new(arr1(&[0.0, 0.0]), cov).is_err());
    }

    #[test]
    fn uniform_draws_stay_in_the_box() {
        let prior = UniformBox::new(vec![-1.0, 10.0], vec![1.0, 11.0]);
        let mut rng = SmallRng::seed_from_u64(42);
        for _ in 0..1000 {
            let x = prior.draw(&mut rng);
            assert!(prior.contains(&x), "{x:?} escaped the box");
        }
    }

    #[test]
    fn gaussian_draws_have_the_right_moments() {
        let gauss = Gaussian::new(arr1(&[1.0, -2.0]), arr2(&[[2.0, 0.5], [0.5, 1.0]])).unwrap();
        let mut rng = SmallRng::seed_from_u64(7);
        let n = 50_000;
        let draws: Vec<Vec<f64>> = (0..n).map(|_| gauss.draw(&mut rng)).collect();
        let mean0 = draws.iter().map(|x| x[0]).sum::<f64>() / n as f64;
        let mean1 = draws.iter().map(|x| x[1]).sum::<f64>() / n as f64;
        let cov01 = draws
            .iter()
            .map(|x| (x[0] - mean0) * (x[1] - mean1))
            .sum::<f64>()
            / (n - 1) as f64;
        assert_abs_diff_eq!(mean0, 1.0, epsilon = 0.05);
        assert_abs_diff_eq!(mean1, -2.0, epsilon = 0.05);
        assert_abs_diff_eq!(cov01, 0.5, epsilon = 0.05);
    }
}
