//! The per-chain sampling state.

use serde::{Deserialize, Serialize};

use crate::distributions::Target;
use crate::error::EvaluationError;

/// A point in parameter space together with its cached log-likelihood and log-prior.
///
/// Both densities are always computed together from `params` (see [`ChainState::evaluate`]),
/// so they can never go stale independently of each other. The temperature is not part of the
/// state: it belongs to the chain that currently holds the state, which is what makes a
/// parallel-tempering swap a plain exchange of two `ChainState`s.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainState {
    pub params: Vec<f64>,
    pub log_likelihood: f64,
    pub log_prior: f64,
}

impl ChainState {
    /**
    Evaluates `target` at `params` and builds the state.

    The prior is evaluated first; if it is `-inf` the likelihood is not called at all and the
    state carries `log_likelihood = -inf`. Any non-finite positive value or NaN is reported as
    an [`EvaluationError`].

    # Examples

    ```rust
    use pt_mcmc::distributions::{Gaussian, Posterior, UniformBox};
    use pt_mcmc::state::ChainState;

    let target = Posterior::new(Gaussian::standard(2), UniformBox::cube(2, -5.0, 5.0));
    let state = ChainState::evaluate(&target, vec![0.0, 0.0]).unwrap();
    assert!(state.log_posterior(1.0).is_finite());
    ```
    */
    pub fn evaluate<D: Target + ?Sized>(
        target: &D,
        params: Vec<f64>,
    ) -> Result<Self, EvaluationError> {
        let log_prior = target.log_prior(&params)?;
        if log_prior.is_nan() || log_prior == f64::INFINITY {
            return Err(EvaluationError::NonFinite { what: "log prior" });
        }
        let log_likelihood = if log_prior == f64::NEG_INFINITY {
            f64::NEG_INFINITY
        } else {
            target.log_likelihood(&params)?
        };
        if log_likelihood.is_nan() || log_likelihood == f64::INFINITY {
            return Err(EvaluationError::NonFinite {
                what: "log likelihood",
            });
        }
        Ok(Self {
            params,
            log_likelihood,
            log_prior,
        })
    }

    /// Tempered log posterior, `log_prior + log_likelihood / temperature`.
    pub fn log_posterior(&self, temperature: f64) -> f64 {
        if self.log_prior == f64::NEG_INFINITY || self.log_likelihood == f64::NEG_INFINITY {
            return f64::NEG_INFINITY;
        }
        self.log_prior + self.log_likelihood / temperature
    }

    pub fn dim(&self) -> usize {
        self.params.len()
    }
}
