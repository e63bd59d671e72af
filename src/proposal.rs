/*!
Proposal kernels for the per-chain Metropolis-Hastings step.

Every kernel maps the current [`ChainState`] to a [`Jump`]: a candidate parameter vector and the
log Hastings correction of the move. Kernels are immutable and shared by all chains; whatever
they learn from a chain's past (covariance, step-size factors, history) arrives through the
[`ProposalContext`] the chain builds for each step.
*/

use std::collections::VecDeque;
use std::sync::Arc;

use ndarray::Array1;
use rand::rngs::SmallRng;
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::adapt::{CovarianceAdapter, ScaleTuner};
use crate::config::ProposalConfig;
use crate::distributions::{PriorSampler, Target};
use crate::error::ConfigError;
use crate::state::ChainState;

/// Optimal-scaling constant for random-walk Metropolis.
pub const OPTIMAL_SCALE: f64 = 2.38;

/// The bundled kernel families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KernelKind {
    AdaptiveMetropolis,
    Scam,
    DifferentialEvolution,
    PriorDraw,
}

impl KernelKind {
    pub const ALL: [KernelKind; 4] = [
        KernelKind::AdaptiveMetropolis,
        KernelKind::Scam,
        KernelKind::DifferentialEvolution,
        KernelKind::PriorDraw,
    ];

    /// Position in [`KernelKind::ALL`], used to index per-kernel counters.
    pub fn index(self) -> usize {
        match self {
            KernelKind::AdaptiveMetropolis => 0,
            KernelKind::Scam => 1,
            KernelKind::DifferentialEvolution => 2,
            KernelKind::PriorDraw => 3,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            KernelKind::AdaptiveMetropolis => "adaptive-metropolis",
            KernelKind::Scam => "scam",
            KernelKind::DifferentialEvolution => "differential-evolution",
            KernelKind::PriorDraw => "prior-draw",
        }
    }
}

/// A proposed move.
#[derive(Debug, Clone, PartialEq)]
pub struct Jump {
    pub candidate: Vec<f64>,
    /// `log q(current | candidate) - log q(candidate | current)`.
    pub log_hastings: f64,
    /// The single coordinate that moved, for component-wise kernels.
    pub component: Option<usize>,
}

impl Jump {
    fn symmetric(candidate: Vec<f64>) -> Self {
        Self {
            candidate,
            log_hastings: 0.0,
            component: None,
        }
    }
}

/// Everything a kernel may read from the chain it proposes for.
pub struct ProposalContext<'a> {
    pub target: &'a dyn Target,
    pub adapter: &'a CovarianceAdapter,
    pub tuner: &'a ScaleTuner,
    pub history: &'a VecDeque<Vec<f64>>,
}

/// A Metropolis-Hastings proposal kernel.
pub trait Proposal: Send + Sync {
    fn kind(&self) -> KernelKind;

    fn propose(&self, current: &ChainState, ctx: &ProposalContext, rng: &mut SmallRng) -> Jump;
}

/**
Adaptive Metropolis: a correlated Gaussian random walk `x + s·L·z`.

`L` is the Cholesky factor of the chain's adapted covariance and `s` defaults to `2.38/√D`.

# Examples

```rust
use pt_mcmc::proposal::AdaptiveMetropolis;

let am = AdaptiveMetropolis::new(4, None);
assert!((am.scale() - 2.38 / 2.0).abs() < 1e-12);
```
*/
#[derive(Debug, Clone, PartialEq)]
pub struct AdaptiveMetropolis {
    scale: f64,
}

impl AdaptiveMetropolis {
    pub fn new(n_params: usize, scale: Option<f64>) -> Self {
        Self {
            scale: scale.unwrap_or(OPTIMAL_SCALE / (n_params as f64).sqrt()),
        }
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    fn jump(&self, current: &ChainState, adapter: &CovarianceAdapter, rng: &mut SmallRng) -> Jump {
        let z: Array1<f64> = (0..current.dim())
            .map(|_| rng.sample::<f64, _>(StandardNormal))
            .collect();
        let step = adapter.cholesky().dot(&z);
        let candidate = current
            .params
            .iter()
            .zip(step.iter())
            .map(|(x, s)| x + self.scale * s)
            .collect();
        Jump::symmetric(candidate)
    }
}

impl Proposal for AdaptiveMetropolis {
    fn kind(&self) -> KernelKind {
        KernelKind::AdaptiveMetropolis
    }

    fn propose(&self, current: &ChainState, ctx: &ProposalContext, rng: &mut SmallRng) -> Jump {
        self.jump(current, ctx.adapter, rng)
    }
}

/// Single-Component Adaptive Metropolis: moves one uniformly chosen coordinate.
#[derive(Debug, Clone, PartialEq)]
pub struct Scam {
    scale: f64,
}

impl Scam {
    pub fn new() -> Self {
        Self {
            scale: OPTIMAL_SCALE,
        }
    }
}

impl Default for Scam {
    fn default() -> Self {
        Self::new()
    }
}

impl Proposal for Scam {
    fn kind(&self) -> KernelKind {
        KernelKind::Scam
    }

    fn propose(&self, current: &ChainState, ctx: &ProposalContext, rng: &mut SmallRng) -> Jump {
        let j = rng.gen_range(0..current.dim());
        let z: f64 = rng.sample(StandardNormal);
        let sigma = ctx.adapter.std_dev(j);
        let mut candidate = current.params.clone();
        candidate[j] += self.scale * sigma * ctx.tuner.factor(j) * z;
        Jump {
            candidate,
            log_hastings: 0.0,
            component: Some(j),
        }
    }
}

/**
Differential Evolution: `x + γ·(X_a − X_b)` for two distinct past states of the same chain.

The chain's history never holds the state the jump starts from. With fewer than two states in
the history, or when the two drawn states are equal, the kernel proposes an Adaptive
Metropolis jump instead. With probability `mode_hop_probability` the jump uses `γ = 1`, which maps one recorded
mode onto another.
*/
#[derive(Debug, Clone, PartialEq)]
pub struct DifferentialEvolution {
    gamma: f64,
    mode_hop_probability: f64,
    fallback: AdaptiveMetropolis,
}

impl DifferentialEvolution {
    pub fn new(
        n_params: usize,
        gamma: Option<f64>,
        mode_hop_probability: f64,
        fallback: AdaptiveMetropolis,
    ) -> Self {
        Self {
            gamma: gamma.unwrap_or(OPTIMAL_SCALE / (2.0 * n_params as f64).sqrt()),
            mode_hop_probability,
            fallback,
        }
    }

    pub fn gamma(&self) -> f64 {
        self.gamma
    }
}

impl Proposal for DifferentialEvolution {
    fn kind(&self) -> KernelKind {
        KernelKind::DifferentialEvolution
    }

    fn propose(&self, current: &ChainState, ctx: &ProposalContext, rng: &mut SmallRng) -> Jump {
        let n = ctx.history.len();
        if n < 2 {
            return self.fallback.jump(current, ctx.adapter, rng);
        }
        let a = rng.gen_range(0..n);
        let mut b = rng.gen_range(0..n - 1);
        if b >= a {
            b += 1;
        }
        let gamma = if self.mode_hop_probability > 0.0 && rng.gen::<f64>() < self.mode_hop_probability
        {
            1.0
        } else {
            self.gamma
        };
        let (xa, xb) = (&ctx.history[a], &ctx.history[b]);
        // Repeated entries from rejected steps give a null move.
        if xa == xb {
            return self.fallback.jump(current, ctx.adapter, rng);
        }
        let candidate = current
            .params
            .iter()
            .zip(xa.iter().zip(xb))
            .map(|(x, (pa, pb))| x + gamma * (pa - pb))
            .collect();
        Jump::symmetric(candidate)
    }
}

/// Independence proposal drawing the candidate from a [`PriorSampler`].
#[derive(Clone)]
pub struct PriorDraw {
    sampler: Arc<dyn PriorSampler>,
}

impl PriorDraw {
    pub fn new(sampler: Arc<dyn PriorSampler>) -> Self {
        Self { sampler }
    }
}

impl std::fmt::Debug for PriorDraw {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriorDraw").finish_non_exhaustive()
    }
}

impl Proposal for PriorDraw {
    fn kind(&self) -> KernelKind {
        KernelKind::PriorDraw
    }

    fn propose(&self, current: &ChainState, ctx: &ProposalContext, rng: &mut SmallRng) -> Jump {
        let candidate = self.sampler.draw(rng);
        let candidate_prior = ctx
            .target
            .log_prior(&candidate)
            .unwrap_or(f64::NEG_INFINITY);
        // Outside the support the candidate is rejected on evaluation anyway.
        let log_hastings = if candidate_prior.is_finite() && current.log_prior.is_finite() {
            current.log_prior - candidate_prior
                + self.sampler.log_proposal_density(&current.params)
                - self.sampler.log_proposal_density(&candidate)
        } else {
            0.0
        };
        Jump {
            candidate,
            log_hastings,
            component: None,
        }
    }
}

/// The kernels in use for a run, one per kind with a positive weight.
pub struct KernelSet {
    kernels: Vec<Box<dyn Proposal>>,
}

impl KernelSet {
    pub fn new(kernels: Vec<Box<dyn Proposal>>) -> Self {
        Self { kernels }
    }

    /// Instantiates every kernel with a positive weight in `config`.
    pub fn from_config(
        config: &ProposalConfig,
        n_params: usize,
        prior_sampler: Option<Arc<dyn PriorSampler>>,
    ) -> Result<Self, ConfigError> {
        let am = AdaptiveMetropolis::new(n_params, config.am_scale);
        let mut kernels: Vec<Box<dyn Proposal>> = Vec::new();
        for (kind, weight) in config.weights.entries() {
            if weight <= 0.0 {
                continue;
            }
            let kernel: Box<dyn Proposal> = match kind {
                KernelKind::AdaptiveMetropolis => Box::new(am.clone()),
                KernelKind::Scam => Box::new(Scam::new()),
                KernelKind::DifferentialEvolution => Box::new(DifferentialEvolution::new(
                    n_params,
                    config.de_gamma,
                    config.mode_hop_probability,
                    am.clone(),
                )),
                KernelKind::PriorDraw => match &prior_sampler {
                    Some(sampler) => Box::new(PriorDraw::new(Arc::clone(sampler))),
                    None => return Err(ConfigError::MissingPriorSampler(weight)),
                },
            };
            kernels.push(kernel);
        }
        Ok(Self { kernels })
    }

    pub fn get(&self, kind: KernelKind) -> Option<&dyn Proposal> {
        self.kernels
            .iter()
            .find(|k| k.kind() == kind)
            .map(|k| k.as_ref())
    }

    pub fn kinds(&self) -> impl Iterator<Item = KernelKind> + '_ {
        self.kernels.iter().map(|k| k.kind())
    }
}
