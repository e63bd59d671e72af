/*!
One rung of the temperature ladder: a Metropolis-Hastings chain with its own adaptation state.

A [`Chain`] owns everything that is local to one temperature: the current [`ChainState`], the
covariance adapter, the SCAM tuner, the kernel cycle, the Differential Evolution history and
the acceptance counters. All of it is serialisable, so a chain can be checkpointed and restored
exactly; the random number generator is not stored but re-derived from the chain's seed at the
start of every block (see [`Chain::begin_block`]).
*/

use std::collections::VecDeque;

use log::warn;
use ndarray::{arr1, Array2};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::adapt::{CovarianceAdapter, ScaleTuner};
use crate::config::RunConfig;
use crate::cycle::ProposalCycle;
use crate::distributions::Target;
use crate::error::{ConfigError, EvaluationError};
use crate::io::{Retention, SampleRecord};
use crate::proposal::{KernelKind, KernelSet, ProposalContext};
use crate::state::ChainState;
use crate::stats::AcceptanceCounter;

/// Seed of chain `chain`'s random stream for block `block`.
///
/// A splitmix64 finaliser over the three inputs, so nearby seeds, chains and blocks give
/// unrelated streams.
pub fn block_seed(seed: u64, chain: usize, block: usize) -> u64 {
    let mut z = seed
        ^ (chain as u64).wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15)
        ^ (block as u64).wrapping_add(1).wrapping_mul(0xD1B5_4A32_D192_ED03);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Why a candidate was not accepted.
#[derive(Debug, Clone, PartialEq)]
pub enum RejectReason {
    /// Lost the Metropolis-Hastings coin flip.
    Metropolis,
    /// The candidate lies outside the prior support.
    OutsideSupport,
    /// The likelihood or prior failed at the candidate.
    Evaluation(EvaluationError),
    /// The cycle picked a kernel the run has no instance of.
    MissingKernel,
}

/// Outcome of one [`Chain::step`].
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Accepted { kernel: KernelKind },
    Rejected { kernel: KernelKind, reason: RejectReason },
}

impl Transition {
    pub fn accepted(&self) -> bool {
        matches!(self, Transition::Accepted { .. })
    }

    pub fn kernel(&self) -> KernelKind {
        match self {
            Transition::Accepted { kernel } | Transition::Rejected { kernel, .. } => *kernel,
        }
    }
}

/// `log_alpha` of a Metropolis-Hastings move at `temperature`.
pub fn log_acceptance(
    current: &ChainState,
    candidate: &ChainState,
    temperature: f64,
    log_hastings: f64,
) -> f64 {
    candidate.log_posterior(temperature) - current.log_posterior(temperature) + log_hastings
}

fn placeholder_rng() -> SmallRng {
    SmallRng::seed_from_u64(0)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chain {
    index: usize,
    temperature: f64,
    state: ChainState,
    adapter: CovarianceAdapter,
    tuner: ScaleTuner,
    cycle: ProposalCycle,
    history: VecDeque<Vec<f64>>,
    history_capacity: usize,
    tune_interval: usize,
    burn_in: usize,
    kernel_stats: [AcceptanceCounter; 4],
    evaluation_failures: u64,
    iteration: usize,
    seed: u64,
    #[serde(skip, default = "placeholder_rng")]
    rng: SmallRng,
    /// Set once `begin_block` has derived the stream.
    #[serde(skip)]
    seeded: bool,
}

impl Chain {
    /**
    Builds chain `index` at `temperature`, starting from an already evaluated `state`.

    The initial proposal covariance comes from `config.adaptation.initial_covariance`, or the
    identity. The kernel cycle uses the positive weights of `config.proposal.weights`.
    */
    pub fn new(
        index: usize,
        temperature: f64,
        state: ChainState,
        config: &RunConfig,
    ) -> Result<Self, ConfigError> {
        let dim = state.dim();
        let initial = initial_covariance(config, dim)?;
        let adapter = CovarianceAdapter::new(
            initial,
            config.adaptation.interval,
            config.adaptation.min_samples,
        )
        .map_err(|_| ConfigError::InitialCovariance { dim })?;

        Ok(Self {
            index,
            temperature,
            state,
            adapter,
            tuner: ScaleTuner::new(dim, config.adaptation.target_acceptance),
            cycle: ProposalCycle::new(
                config.proposal.weights.entries(),
                config.proposal.cycle_length,
            ),
            history: VecDeque::with_capacity(config.proposal.history_capacity.min(4096)),
            history_capacity: config.proposal.history_capacity,
            tune_interval: config.adaptation.interval,
            burn_in: config.burn_in,
            kernel_stats: [AcceptanceCounter::default(); 4],
            evaluation_failures: 0,
            iteration: 0,
            seed: config.seed,
            rng: placeholder_rng(),
            seeded: false,
        })
    }

    /// Re-derives the random stream for `block`. Must be called before a block's first step.
    pub fn begin_block(&mut self, block: usize) {
        self.rng = SmallRng::seed_from_u64(block_seed(self.seed, self.index, block));
        self.seeded = true;
    }

    /**
    Performs one Metropolis-Hastings iteration.

    Selects a kernel from the cycle, proposes, evaluates the candidate and accepts it with
    probability `min(1, exp(log_alpha))`. Evaluation failures count as rejections.

    The state a proposal starts from enters the Differential Evolution history only after that
    proposal is drawn, so a jump never uses its own starting point. The (possibly new) current
    state is recorded in the covariance adapter, and during burn-in the SCAM tuner is updated
    at the end of every adaptation interval.

    The random stream must have been set with [`begin_block`](Self::begin_block); a chain
    fresh from [`new`](Self::new) or deserialisation holds a fixed placeholder stream.
    */
    pub fn step(&mut self, target: &dyn Target, kernels: &KernelSet) -> Transition {
        debug_assert!(self.seeded, "chain {} stepped before begin_block", self.index);
        let kind = self.cycle.select(self.iteration, &mut self.rng);
        let Some(kernel) = kernels.get(kind) else {
            warn!("chain {}: no {} kernel configured", self.index, kind.name());
            self.remember_current();
            self.finish_iteration();
            return Transition::Rejected {
                kernel: kind,
                reason: RejectReason::MissingKernel,
            };
        };

        let ctx = ProposalContext {
            target,
            adapter: &self.adapter,
            tuner: &self.tuner,
            history: &self.history,
        };
        let jump = kernel.propose(&self.state, &ctx, &mut self.rng);
        let component = jump.component;
        self.remember_current();

        let transition = match ChainState::evaluate(target, jump.candidate) {
            Err(err) => {
                self.evaluation_failures += 1;
                Transition::Rejected {
                    kernel: kind,
                    reason: RejectReason::Evaluation(err),
                }
            }
            Ok(candidate) if candidate.log_posterior(self.temperature) == f64::NEG_INFINITY => {
                Transition::Rejected {
                    kernel: kind,
                    reason: RejectReason::OutsideSupport,
                }
            }
            Ok(candidate) => {
                let log_alpha =
                    log_acceptance(&self.state, &candidate, self.temperature, jump.log_hastings);
                let u: f64 = self.rng.gen();
                if log_alpha > u.ln() {
                    self.state = candidate;
                    Transition::Accepted { kernel: kind }
                } else {
                    Transition::Rejected {
                        kernel: kind,
                        reason: RejectReason::Metropolis,
                    }
                }
            }
        };

        let accepted = transition.accepted();
        self.kernel_stats[kind.index()].record(accepted);
        if let Some(j) = component {
            self.tuner.record(j, accepted);
        }
        self.finish_iteration();
        transition
    }

    /// Runs `len` iterations as block `block` and returns the retained samples of this chain.
    pub fn run_block(
        &mut self,
        target: &dyn Target,
        kernels: &KernelSet,
        block: usize,
        len: usize,
        retention: &Retention,
    ) -> Vec<SampleRecord> {
        self.begin_block(block);
        let mut records = Vec::new();
        for _ in 0..len {
            let iteration = self.iteration;
            self.step(target, kernels);
            if retention.keeps(self.index, iteration) {
                records.push(SampleRecord::capture(iteration, self));
            }
        }
        records
    }

    fn remember_current(&mut self) {
        if self.history_capacity == 0 {
            return;
        }
        if self.history.len() == self.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(self.state.params.clone());
    }

    fn finish_iteration(&mut self) {
        self.adapter.observe(&self.state.params, self.iteration);
        if self.iteration < self.burn_in && (self.iteration + 1) % self.tune_interval == 0 {
            self.tuner.tune();
        }
        self.iteration += 1;
    }

    /// Puts `state` into this chain and returns the state it held. Nothing else changes.
    pub fn exchange_state(&mut self, state: ChainState) -> ChainState {
        std::mem::replace(&mut self.state, state)
    }

    /// Exchanges the states of two chains, leaving everything else in place.
    pub fn swap_states(&mut self, other: &mut Chain) {
        std::mem::swap(&mut self.state, &mut other.state);
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn set_seed(&mut self, seed: u64) {
        self.seed = seed;
    }

    pub fn state(&self) -> &ChainState {
        &self.state
    }

    pub fn temperature(&self) -> f64 {
        self.temperature
    }

    pub fn set_temperature(&mut self, temperature: f64) {
        self.temperature = temperature;
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Iterations performed so far.
    pub fn iteration(&self) -> usize {
        self.iteration
    }

    /// Draws the uniform variate for a swap decision this chain is responsible for.
    pub fn draw_uniform(&mut self) -> f64 {
        self.rng.gen()
    }

    pub fn adapter(&self) -> &CovarianceAdapter {
        &self.adapter
    }

    pub fn tuner(&self) -> &ScaleTuner {
        &self.tuner
    }

    pub fn cycle(&self) -> &ProposalCycle {
        &self.cycle
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Past starting points available to Differential Evolution, oldest first.
    pub fn history(&self) -> &VecDeque<Vec<f64>> {
        &self.history
    }

    /// Acceptance counts per kernel, in [`KernelKind::ALL`] order.
    pub fn kernel_stats(&self) -> &[AcceptanceCounter; 4] {
        &self.kernel_stats
    }

    pub fn acceptance(&self) -> AcceptanceCounter {
        self.kernel_stats
            .iter()
            .fold(AcceptanceCounter::default(), |acc, c| AcceptanceCounter {
                proposed: acc.proposed + c.proposed,
                accepted: acc.accepted + c.accepted,
            })
    }

    pub fn evaluation_failures(&self) -> u64 {
        self.evaluation_failures
    }
}

fn initial_covariance(config: &RunConfig, dim: usize) -> Result<Array2<f64>, ConfigError> {
    let Some(rows) = &config.adaptation.initial_covariance else {
        return Ok(Array2::eye(dim));
    };
    if rows.len() != dim || rows.iter().any(|r| r.len() != dim) {
        return Err(ConfigError::InitialCovariance { dim });
    }
    let mut cov = Array2::zeros((dim, dim));
    for (i, row) in rows.iter().enumerate() {
        cov.row_mut(i).assign(&arr1(row));
    }
    Ok(cov)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelWeights;
    use crate::distributions::{Gaussian, Posterior, UniformBox};
    use crate::proposal::{AdaptiveMetropolis, DifferentialEvolution, Proposal, Scam};
    use approx::assert_abs_diff_eq;
    use ndarray::{arr2, Array1};
    use ndarray_stats::CorrelationExt;

    fn single_kernel_config(kind: KernelKind) -> RunConfig {
        let mut config = RunConfig::default();
        config.proposal.weights = KernelWeights {
            adaptive_metropolis: 0.0,
            scam: 0.0,
            differential_evolution: 0.0,
            prior_draw: 0.0,
        };
        match kind {
            KernelKind::AdaptiveMetropolis => config.proposal.weights.adaptive_metropolis = 1.0,
            KernelKind::Scam => config.proposal.weights.scam = 1.0,
            KernelKind::DifferentialEvolution => {
                config.proposal.weights.differential_evolution = 1.0
            }
            KernelKind::PriorDraw => config.proposal.weights.prior_draw = 1.0,
        }
        config.burn_in = 2_000;
        config
    }

    fn kernels_for(kind: KernelKind, dim: usize) -> KernelSet {
        let am = AdaptiveMetropolis::new(dim, None);
        let kernel: Box<dyn Proposal> = match kind {
            KernelKind::Scam => Box::new(Scam::new()),
            KernelKind::DifferentialEvolution => {
                Box::new(DifferentialEvolution::new(dim, None, 0.0, am))
            }
            _ => Box::new(am),
        };
        KernelSet::new(vec![kernel])
    }

    /// Runs a single T = 1 chain with one kernel and returns the post burn-in samples.
    fn run_single(kind: KernelKind, target: &dyn Target, n: usize, seed: u64) -> Array2<f64> {
        let mut config = single_kernel_config(kind);
        config.seed = seed;
        let state = ChainState::evaluate(target, vec![0.0, 0.0]).unwrap();
        let mut chain = Chain::new(0, 1.0, state, &config).unwrap();
        let kernels = kernels_for(kind, 2);
        let mut samples = Array2::zeros((n - config.burn_in, 2));
        for i in 0..n {
            if i % 10 == 0 {
                chain.begin_block(i / 10);
            }
            chain.step(target, &kernels);
            if i >= config.burn_in {
                samples
                    .row_mut(i - config.burn_in)
                    .assign(&arr1(&chain.state().params));
            }
        }
        samples
    }

    fn check_moments(kind: KernelKind) {
        let mean = arr1(&[1.0, -1.0]);
        let cov = arr2(&[[2.0, 0.6], [0.6, 1.0]]);
        let target = Posterior::new(
            Gaussian::new(mean.clone(), cov.clone()).unwrap(),
            UniformBox::cube(2, -20.0, 20.0),
        );
        let samples = run_single(kind, &target, 60_000, 42);
        let got_mean: Array1<f64> = samples.mean_axis(ndarray::Axis(0)).unwrap();
        let got_cov = samples.t().cov(1.0).unwrap();
        assert_abs_diff_eq!(got_mean, mean, epsilon = 0.15);
        assert_abs_diff_eq!(got_cov, cov, epsilon = 0.25);
    }

    #[test]
    fn adaptive_metropolis_recovers_gaussian_moments() {
        check_moments(KernelKind::AdaptiveMetropolis);
    }

    #[test]
    fn scam_recovers_gaussian_moments() {
        check_moments(KernelKind::Scam);
    }

    #[test]
    fn differential_evolution_recovers_gaussian_moments() {
        check_moments(KernelKind::DifferentialEvolution);
    }

    #[test]
    fn one_dimensional_acceptance_is_the_posterior_ratio() {
        let target = Posterior::new(Gaussian::standard(1), UniformBox::cube(1, -10.0, 10.0));
        let pdf = |x: f64| (-0.5 * x * x).exp();
        for (x, y) in [(0.0, 1.0), (1.0, 0.0), (0.5, -2.5), (-3.0, 2.9), (2.0, 2.0)] {
            let current = ChainState::evaluate(&target, vec![x]).unwrap();
            let candidate = ChainState::evaluate(&target, vec![y]).unwrap();
            let alpha = log_acceptance(&current, &candidate, 1.0, 0.0).exp().min(1.0);
            assert_abs_diff_eq!(alpha, (pdf(y) / pdf(x)).min(1.0), epsilon = 1e-12);
        }
    }

    #[test]
    fn de_at_iteration_zero_does_not_fail() {
        let target = Posterior::new(Gaussian::standard(2), UniformBox::cube(2, -10.0, 10.0));
        let config = single_kernel_config(KernelKind::DifferentialEvolution);
        let state = ChainState::evaluate(&target, vec![0.0, 0.0]).unwrap();
        let mut chain = Chain::new(0, 1.0, state, &config).unwrap();
        chain.begin_block(0);
        assert_eq!(chain.history_len(), 0);
        let transition = chain.step(&target, &kernels_for(KernelKind::DifferentialEvolution, 2));
        assert_eq!(transition.kernel(), KernelKind::DifferentialEvolution);
        assert!(!matches!(
            transition,
            Transition::Rejected {
                reason: RejectReason::Evaluation(_),
                ..
            }
        ));
        assert_eq!(chain.history_len(), 1);
    }

    /// Steps by +1 and records whether the history it was handed held the starting point.
    struct HistoryWitness(std::sync::Arc<std::sync::Mutex<Vec<bool>>>);

    impl Proposal for HistoryWitness {
        fn kind(&self) -> KernelKind {
            KernelKind::DifferentialEvolution
        }

        fn propose(
            &self,
            current: &ChainState,
            ctx: &ProposalContext,
            _rng: &mut SmallRng,
        ) -> crate::proposal::Jump {
            self.0
                .lock()
                .unwrap()
                .push(ctx.history.contains(&current.params));
            crate::proposal::Jump {
                candidate: vec![current.params[0] + 1.0],
                log_hastings: 0.0,
                component: None,
            }
        }
    }

    #[test]
    fn de_history_never_holds_the_starting_point() {
        let target = Posterior::new(
            |_: &[f64]| -> Result<f64, EvaluationError> { Ok(0.0) },
            UniformBox::cube(1, -1.0, 1_000.0),
        );
        let mut config = single_kernel_config(KernelKind::DifferentialEvolution);
        config.proposal.history_capacity = 5;
        let state = ChainState::evaluate(&target, vec![0.0]).unwrap();
        let mut chain = Chain::new(0, 1.0, state, &config).unwrap();
        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let kernels = KernelSet::new(vec![Box::new(HistoryWitness(seen.clone()))]);

        chain.begin_block(0);
        for i in 0..20 {
            assert!(chain.step(&target, &kernels).accepted());
            assert_eq!(chain.history().back(), Some(&vec![i as f64]));
        }
        assert_eq!(chain.history_len(), 5);
        assert_eq!(chain.state().params, vec![20.0]);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 20);
        assert!(seen.iter().all(|&held| !held));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "stepped before begin_block")]
    fn restored_chain_must_be_reseeded_before_stepping() {
        let target = Posterior::new(Gaussian::standard(1), UniformBox::cube(1, -10.0, 10.0));
        let config = single_kernel_config(KernelKind::AdaptiveMetropolis);
        let state = ChainState::evaluate(&target, vec![0.0]).unwrap();
        let chain = Chain::new(0, 1.0, state, &config).unwrap();
        let json = serde_json::to_string(&chain).unwrap();
        let mut restored: Chain = serde_json::from_str(&json).unwrap();
        restored.step(&target, &kernels_for(KernelKind::AdaptiveMetropolis, 1));
    }

    #[test]
    fn de_only_chain_with_short_history_keeps_moving() {
        let target = Posterior::new(Gaussian::standard(1), UniformBox::cube(1, -10.0, 10.0));
        let mut config = single_kernel_config(KernelKind::DifferentialEvolution);
        config.proposal.history_capacity = 2;
        let state = ChainState::evaluate(&target, vec![0.0]).unwrap();
        let mut chain = Chain::new(0, 1.0, state, &config).unwrap();
        let kernels = kernels_for(KernelKind::DifferentialEvolution, 1);
        let (mut low, mut high) = (0.0_f64, 0.0_f64);
        for i in 0..400 {
            if i % 10 == 0 {
                chain.begin_block(i / 10);
            }
            chain.step(&target, &kernels);
            low = low.min(chain.state().params[0]);
            high = high.max(chain.state().params[0]);
        }
        assert!(chain.acceptance().accepted > 80);
        assert!(high - low > 2.0);
    }

    #[test]
    fn evaluation_errors_are_rejections() {
        let target = Posterior::new(
            |x: &[f64]| -> Result<f64, EvaluationError> {
                if x[0] > 0.0 {
                    Err(EvaluationError::Domain("positive".into()))
                } else {
                    Ok(0.0)
                }
            },
            UniformBox::cube(1, -5.0, 5.0),
        );
        let config = single_kernel_config(KernelKind::AdaptiveMetropolis);
        let state = ChainState::evaluate(&target, vec![-1.0]).unwrap();
        let mut chain = Chain::new(0, 1.0, state, &config).unwrap();
        chain.begin_block(0);
        let kernels = kernels_for(KernelKind::AdaptiveMetropolis, 1);
        for _ in 0..500 {
            chain.step(&target, &kernels);
            assert!(chain.state().params[0] <= 0.0);
        }
        assert!(chain.evaluation_failures() > 0);
        assert_eq!(chain.acceptance().proposed, 500);
    }

    #[test]
    fn same_block_seed_replays_the_same_steps() {
        let target = Posterior::new(Gaussian::standard(2), UniformBox::cube(2, -10.0, 10.0));
        let config = single_kernel_config(KernelKind::AdaptiveMetropolis);
        let state = ChainState::evaluate(&target, vec![0.0, 0.0]).unwrap();
        let kernels = kernels_for(KernelKind::AdaptiveMetropolis, 2);
        let mut a = Chain::new(0, 1.0, state.clone(), &config).unwrap();
        let mut b = a.clone();
        a.begin_block(3);
        b.begin_block(3);
        for _ in 0..20 {
            assert_eq!(a.step(&target, &kernels), b.step(&target, &kernels));
        }
        assert_eq!(a.state(), b.state());
    }

    #[test]
    fn block_seeds_differ_across_chains_and_blocks() {
        assert_ne!(block_seed(42, 0, 0), block_seed(42, 1, 0));
        assert_ne!(block_seed(42, 0, 0), block_seed(42, 0, 1));
        assert_ne!(block_seed(42, 1, 0), block_seed(42, 0, 1));
        assert_eq!(block_seed(7, 2, 5), block_seed(7, 2, 5));
    }

    #[test]
    fn wrong_initial_covariance_shape_is_rejected() {
        let target = Posterior::new(Gaussian::standard(2), UniformBox::cube(2, -10.0, 10.0));
        let mut config = RunConfig::default();
        config.adaptation.initial_covariance = Some(vec![vec![1.0]]);
        let state = ChainState::evaluate(&target, vec![0.0, 0.0]).unwrap();
        assert_eq!(
            Chain::new(0, 1.0, state, &config).unwrap_err(),
            ConfigError::InitialCovariance { dim: 2 }
        );
    }
}
