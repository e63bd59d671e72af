/*!
# Parallel-Tempering Sampler

[`PtSampler`] runs one adaptive Metropolis-Hastings chain per temperature and periodically
proposes to exchange the states of neighbouring chains. Only the coldest chain (`T = 1`)
samples the posterior; the hotter chains explore flattened versions of it and feed it states
from other modes through the swaps.

## Overview

- **Blocks**: iterations run in blocks of `swap_interval`. Inside a block the chains are
  independent and are stepped in parallel with rayon; after every full block the swap phase
  runs, coldest pair first, and the temperature ladder may adapt.
- **Reproducibility**: each chain's random stream is re-derived from the master seed, the chain
  index and the block index, so a run restored from a [`Checkpoint`] continues exactly like the
  uninterrupted run would have.
- **Output**: the cold chain's state after every retained iteration (burn-in and thinning
  applied) is returned in [`RunOutput`] and streamed to an optional [`SampleSink`].

## Example Usage

```rust
use pt_mcmc::config::{LadderSpacing, RunConfig};
use pt_mcmc::distributions::{Gaussian, Posterior, UniformBox};
use pt_mcmc::sampler::{InitialState, PtSampler};

let target = Posterior::new(Gaussian::standard(2), UniformBox::cube(2, -10.0, 10.0));
let mut config = RunConfig::default();
config.total_iterations = 2_000;
config.burn_in = 500;
config.ladder.spacing = LadderSpacing::Manual { temperatures: vec![1.0, 2.0, 4.0, 8.0] };

let mut sampler = PtSampler::new(target, config, InitialState::Shared(vec![0.5, -0.5]))?;
let output = sampler.run()?;
assert_eq!(output.samples.len(), 1_500);
# Ok::<(), pt_mcmc::error::Error>(())
```
*/

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use ndarray::{Array1, Array2, Axis};
use ndarray_stats::CorrelationExt;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use rayon::prelude::*;

use crate::chain::{block_seed, Chain};
use crate::checkpoint::{checkpoint_path, Checkpoint, CHECKPOINT_VERSION};
use crate::config::RunConfig;
use crate::distributions::{PriorSampler, Target};
use crate::error::{ConfigError, Error, Result, TransportError};
use crate::io::{Retention, SampleRecord, SampleSink};
use crate::ladder::TemperatureLadder;
use crate::proposal::{KernelKind, KernelSet};
use crate::state::ChainState;
use crate::stats::{integrated_autocorr_time, AcceptanceCounter};
use crate::swap::exchange_adjacent;
use crate::transport::ChannelTransport;
use crate::worker::{Worker, WorkerReport};

/// Attempts at drawing an initial state inside the posterior support.
const MAX_INITIAL_DRAWS: usize = 100;

/// Where the chains start.
#[derive(Clone)]
pub enum InitialState {
    /// Every chain starts at the same point.
    Shared(Vec<f64>),
    /// One point per chain, coldest first.
    PerChain(Vec<Vec<f64>>),
    /// Independent draws per chain. The sampler also serves the prior-draw kernel.
    DrawFromPrior(Arc<dyn PriorSampler>),
}

/// Run statistics, computed whenever a run call returns.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostics {
    pub iteration: usize,
    pub temperatures: Vec<f64>,
    /// Swap acceptance rate of each adjacent pair since the start of the run.
    pub swap_acceptance: Vec<f64>,
    /// Metropolis acceptance rate of each chain.
    pub chain_acceptance: Vec<f64>,
    /// Per chain, the counters of every kernel in the mixture.
    pub kernel_acceptance: Vec<Vec<(KernelKind, AcceptanceCounter)>>,
    pub evaluation_failures: Vec<u64>,
    /// Covariance estimates rejected as not positive definite, per chain.
    pub covariance_failures: Vec<u64>,
    pub ladder_adaptations: u64,
    /// Integrated autocorrelation time of each parameter over the returned cold samples.
    pub autocorrelation_times: Vec<f64>,
    pub stopped_early: bool,
}

/// Samples retained during one run call plus diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutput {
    /// Cold-chain samples in iteration order.
    pub samples: Vec<SampleRecord>,
    pub diagnostics: Diagnostics,
}

impl RunOutput {
    /// Samples as an `n_samples x n_params` matrix.
    pub fn params(&self) -> Array2<f64> {
        let n = self.samples.len();
        let d = self.samples.first().map_or(0, |r| r.params.len());
        Array2::from_shape_fn((n, d), |(i, j)| self.samples[i].params[j])
    }

    /// Sample mean, `None` without samples.
    pub fn mean(&self) -> Option<Array1<f64>> {
        self.params().mean_axis(Axis(0))
    }

    /// Unbiased sample covariance, `None` with fewer than two samples.
    pub fn covariance(&self) -> Option<Array2<f64>> {
        self.params().t().cov(1.0).ok()
    }
}

/**
The parallel-tempering sampler.

# Examples

```rust
use pt_mcmc::config::RunConfig;
use pt_mcmc::distributions::{Gaussian, Posterior, UniformBox};
use pt_mcmc::sampler::{InitialState, PtSampler};

let target = Posterior::new(Gaussian::standard(1), UniformBox::cube(1, -5.0, 5.0));
let config = RunConfig { n_chains: 2, total_iterations: 100, burn_in: 0, ..RunConfig::default() };
let sampler = PtSampler::new(target, config, InitialState::Shared(vec![0.0]))
    .unwrap()
    .set_seed(7);
assert_eq!(sampler.chains().len(), 2);
assert_eq!(sampler.ladder().temperature(0), 1.0);
```
*/
pub struct PtSampler<D: Target> {
    target: D,
    config: RunConfig,
    ladder: TemperatureLadder,
    chains: Vec<Chain>,
    kernels: KernelSet,
    iteration: usize,
    stop: Arc<AtomicBool>,
    sink: Option<Box<dyn SampleSink>>,
}

impl<D: Target> PtSampler<D> {
    /// Builds the sampler, validating everything before any sampling happens.
    ///
    /// With [`InitialState::DrawFromPrior`] the given sampler also backs the prior-draw
    /// kernel; otherwise a positive prior-draw weight needs
    /// [`with_prior_sampler`](Self::with_prior_sampler).
    pub fn new(target: D, config: RunConfig, initial: InitialState) -> Result<Self> {
        Self::build(target, config, initial, None)
    }

    /// Like [`new`](Self::new), with an explicit sampler for the prior-draw kernel.
    pub fn with_prior_sampler(
        target: D,
        config: RunConfig,
        initial: InitialState,
        prior_sampler: Arc<dyn PriorSampler>,
    ) -> Result<Self> {
        Self::build(target, config, initial, Some(prior_sampler))
    }

    fn build(
        target: D,
        config: RunConfig,
        initial: InitialState,
        prior_sampler: Option<Arc<dyn PriorSampler>>,
    ) -> Result<Self> {
        config.validate()?;
        let n = config.n_chains;
        let prior_sampler = prior_sampler.or_else(|| match &initial {
            InitialState::DrawFromPrior(sampler) => Some(Arc::clone(sampler)),
            _ => None,
        });

        let states = initial_states(&target, &config, &initial)?;
        let dim = states[0].dim();
        let ladder = TemperatureLadder::from_config(&config, dim)?;
        let kernels = KernelSet::from_config(&config.proposal, dim, prior_sampler)?;
        let chains = states
            .into_iter()
            .enumerate()
            .map(|(i, state)| Chain::new(i, ladder.temperature(i), state, &config))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        info!(
            "parallel tempering: {n} chains, {dim} parameters, temperatures {:?}",
            ladder.temperatures()
        );
        Ok(Self {
            target,
            config,
            ladder,
            chains,
            kernels,
            iteration: 0,
            stop: Arc::new(AtomicBool::new(false)),
            sink: None,
        })
    }

    /// Restores a sampler from a checkpoint. The prior-draw kernel, if weighted, needs
    /// `prior_sampler` again since samplers are not serialised.
    pub fn from_checkpoint(
        target: D,
        checkpoint: Checkpoint,
        prior_sampler: Option<Arc<dyn PriorSampler>>,
    ) -> Result<Self> {
        checkpoint.check()?;
        checkpoint.config.validate()?;
        let Checkpoint {
            iteration,
            config,
            ladder,
            chains,
            ..
        } = checkpoint;
        let dim = chains.first().map_or(0, |c| c.state().dim());
        let kernels = KernelSet::from_config(&config.proposal, dim, prior_sampler)?;
        info!("resuming parallel tempering at iteration {iteration}");
        Ok(Self {
            target,
            config,
            ladder,
            chains,
            kernels,
            iteration,
            stop: Arc::new(AtomicBool::new(false)),
            sink: None,
        })
    }

    /**
    Sets a new master seed for all chain streams.

    Initial states drawn from the prior were already drawn with the configured seed when the
    sampler was built.
    */
    pub fn set_seed(mut self, seed: u64) -> Self {
        self.config.seed = seed;
        for chain in self.chains.iter_mut() {
            chain.set_seed(seed);
        }
        self
    }

    /// Streams retained samples to `sink` as they are produced.
    pub fn with_sink(mut self, sink: impl SampleSink + 'static) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }

    /// A handle that makes the run stop at the next block boundary when set to `true`.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn chains(&self) -> &[Chain] {
        &self.chains
    }

    pub fn ladder(&self) -> &TemperatureLadder {
        &self.ladder
    }

    /// Iterations completed so far.
    pub fn iteration(&self) -> usize {
        self.iteration
    }

    /// Snapshot of the full run state.
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            version: CHECKPOINT_VERSION,
            iteration: self.iteration,
            config: self.config.clone(),
            ladder: self.ladder.clone(),
            chains: self.chains.clone(),
        }
    }

    /// Runs to `total_iterations`.
    pub fn run(&mut self) -> Result<RunOutput> {
        self.run_until(self.config.total_iterations)
    }

    /**
    Runs until every chain has completed `until` iterations (capped at `total_iterations`).

    `until` must be a multiple of `swap_interval` or equal to `total_iterations`, so the run
    always pauses at a block boundary where it can be checkpointed. Returns the samples retained
    during this call.
    */
    pub fn run_until(&mut self, until: usize) -> Result<RunOutput> {
        let until = self.check_target_iteration(until)?;
        self.run_blocks(until, &mut |_: &Self| {})
    }

    /// [`run`](Self::run) with a progress bar showing cold-chain and swap acceptance.
    pub fn run_with_progress(&mut self) -> Result<RunOutput> {
        let until = self.check_target_iteration(self.config.total_iterations)?;
        let pb_style = ProgressStyle::default_bar()
            .template("{prefix} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("##-");
        let pb = ProgressBar::new(until as u64);
        pb.set_prefix(format!("{} chains", self.chains.len()));
        pb.set_style(pb_style);
        pb.set_position(self.iteration as u64);

        let mut last = Instant::now();
        let output = self.run_blocks(until, &mut |sampler: &Self| {
            pb.set_position(sampler.iteration as u64);
            if last.elapsed() >= Duration::from_millis(500) {
                let swap = sampler.ladder.swap_rates();
                let mean_swap = swap.iter().sum::<f64>() / swap.len().max(1) as f64;
                let cold = sampler.chains.first().map_or(0.0, |c| c.acceptance().rate());
                pb.set_message(format!("AcceptRate={cold:.3} SwapRate={mean_swap:.3}"));
                last = Instant::now();
            }
        })?;
        pb.finish_with_message("Done!");
        Ok(output)
    }

    /**
    Runs to `total_iterations` with every chain in its own thread, exchanging states over a
    [`ChannelTransport`] exactly like separate processes would.

    Produces the same samples as [`run`](Self::run). Samples reach the sink when all workers
    have finished, and periodic checkpoints are not written in this mode. If a worker panics
    the sampler is left without its chains and must be discarded.
    */
    pub fn run_threaded(&mut self) -> Result<RunOutput> {
        let until = self.check_target_iteration(self.config.total_iterations)?;
        let from = self.iteration;
        let mesh = ChannelTransport::mesh(self.chains.len(), self.config.transport_timeout());
        let chains = std::mem::take(&mut self.chains);

        let target: &dyn Target = &self.target;
        let kernels = &self.kernels;
        let config = &self.config;
        let ladder = &self.ladder;
        let stop: &AtomicBool = &self.stop;

        type Joined = (
            Option<(Chain, TemperatureLadder)>,
            std::result::Result<WorkerReport, TransportError>,
        );
        let joined: Vec<thread::Result<Joined>> = thread::scope(|s| {
            let handles: Vec<_> = chains
                .into_iter()
                .zip(mesh)
                .map(|(chain, transport)| {
                    let ladder = ladder.clone();
                    s.spawn(move || -> Joined {
                        match Worker::new(chain, ladder, transport) {
                            Ok(mut worker) => {
                                let report = worker.run(target, kernels, config, from, until, stop);
                                (Some(worker.into_parts()), report)
                            }
                            Err(err) => (None, Err(err)),
                        }
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join()).collect()
        });

        let mut reports = Vec::with_capacity(joined.len());
        let mut first_error = None;
        for (rank, result) in joined.into_iter().enumerate() {
            let (parts, report) = result.map_err(|_| Error::WorkerPanic(rank))?;
            if let Some((chain, ladder)) = parts {
                if rank == 0 {
                    self.ladder = ladder;
                }
                self.chains.push(chain);
            }
            match report {
                Ok(report) => reports.push(report),
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }
        if let Some(err) = first_error {
            return Err(err.into());
        }

        self.iteration = reports.first().map_or(until, |r| r.iteration);
        let stopped = reports.iter().any(|r| r.stopped);
        let mut records: Vec<SampleRecord> =
            reports.into_iter().flat_map(|r| r.records).collect();
        records.sort_by_key(|r| (r.iteration, r.chain));
        let samples = self.emit(records);
        self.flush_sink();
        Ok(self.finish(samples, stopped))
    }

    fn check_target_iteration(&self, until: usize) -> Result<usize> {
        let until = until.min(self.config.total_iterations);
        if until < self.iteration {
            return Err(ConfigError::IterationBehind {
                requested: until,
                current: self.iteration,
            }
            .into());
        }
        if until % self.config.swap_interval != 0 && until != self.config.total_iterations {
            return Err(ConfigError::BlockAlignment {
                what: "run_until",
                value: until,
                swap_interval: self.config.swap_interval,
            }
            .into());
        }
        Ok(until)
    }

    fn run_blocks(
        &mut self,
        until: usize,
        on_block: &mut dyn FnMut(&Self),
    ) -> Result<RunOutput> {
        let retention = Retention::from_config(&self.config);
        let swap_interval = self.config.swap_interval;
        let mut samples = Vec::new();
        let mut stopped = false;
        debug!("running iterations {}..{until}", self.iteration);

        while self.iteration < until {
            if self.stop.load(Ordering::Relaxed) {
                info!("stop requested, ending run at iteration {}", self.iteration);
                stopped = true;
                break;
            }
            let block = self.iteration / swap_interval;
            let len = swap_interval.min(until - self.iteration);
            let target: &dyn Target = &self.target;
            let kernels = &self.kernels;
            let per_chain: Vec<Vec<SampleRecord>> = self
                .chains
                .par_iter_mut()
                .map(|chain| chain.run_block(target, kernels, block, len, &retention))
                .collect();
            self.iteration += len;
            if len == swap_interval {
                self.swap_phase();
            }

            let mut records: Vec<SampleRecord> = per_chain.into_iter().flatten().collect();
            records.sort_by_key(|r| (r.iteration, r.chain));
            samples.extend(self.emit(records));
            self.periodic_checkpoint();
            on_block(self);
        }

        self.flush_sink();
        Ok(self.finish(samples, stopped))
    }

    fn swap_phase(&mut self) {
        let records = exchange_adjacent(&mut self.chains);
        for record in &records {
            self.ladder.record(record);
        }
        debug!("swaps after iteration {}: {:?}", self.iteration, records);
        if self
            .ladder
            .close_swap_phase(self.iteration, self.config.burn_in)
        {
            for (chain, &t) in self.chains.iter_mut().zip(self.ladder.temperatures()) {
                chain.set_temperature(t);
            }
        }
    }

    /// Sends `records` to the sink and returns the cold-chain ones.
    fn emit(&mut self, records: Vec<SampleRecord>) -> Vec<SampleRecord> {
        if let Some(sink) = self.sink.as_mut() {
            for record in &records {
                if let Err(err) = sink.write(record) {
                    warn!(
                        "sample sink failed at iteration {} (chain {}): {err}",
                        record.iteration, record.chain
                    );
                }
            }
        }
        records.into_iter().filter(|r| r.chain == 0).collect()
    }

    fn flush_sink(&mut self) {
        if let Some(sink) = self.sink.as_mut() {
            if let Err(err) = sink.flush() {
                warn!("sample sink flush failed: {err}");
            }
        }
    }

    fn periodic_checkpoint(&self) {
        let interval = self.config.checkpoint.interval;
        let Some(dir) = &self.config.checkpoint.directory else {
            return;
        };
        if interval == 0 || self.iteration % interval != 0 {
            return;
        }
        let path = checkpoint_path(dir, self.iteration);
        match self.checkpoint().store(&path) {
            Ok(()) => info!("checkpoint written to {}", path.display()),
            Err(err) => warn!("checkpoint at iteration {} skipped: {err}", self.iteration),
        }
    }

    fn finish(&self, samples: Vec<SampleRecord>, stopped: bool) -> RunOutput {
        let diagnostics = self.diagnostics(&samples, stopped);
        info!(
            "stopped at iteration {}: cold acceptance {:.3}, swap acceptance {:?}",
            self.iteration,
            diagnostics.chain_acceptance.first().copied().unwrap_or(0.0),
            diagnostics.swap_acceptance
        );
        RunOutput {
            samples,
            diagnostics,
        }
    }

    fn diagnostics(&self, samples: &[SampleRecord], stopped: bool) -> Diagnostics {
        let dim = self.chains.first().map_or(0, |c| c.state().dim());
        let autocorrelation_times = (0..dim)
            .map(|j| {
                let series: Array1<f64> = samples.iter().map(|r| r.params[j]).collect();
                integrated_autocorr_time(series.view())
            })
            .collect();
        let kernel_kinds: Vec<KernelKind> = self.kernels.kinds().collect();
        Diagnostics {
            iteration: self.iteration,
            temperatures: self.ladder.temperatures().to_vec(),
            swap_acceptance: self.ladder.swap_rates(),
            chain_acceptance: self.chains.iter().map(|c| c.acceptance().rate()).collect(),
            kernel_acceptance: self
                .chains
                .iter()
                .map(|c| {
                    kernel_kinds
                        .iter()
                        .map(|&k| (k, c.kernel_stats()[k.index()]))
                        .collect()
                })
                .collect(),
            evaluation_failures: self.chains.iter().map(|c| c.evaluation_failures()).collect(),
            covariance_failures: self.chains.iter().map(|c| c.adapter().failures()).collect(),
            ladder_adaptations: self.ladder.adaptations(),
            autocorrelation_times,
            stopped_early: stopped,
        }
    }
}

/// Evaluates the starting point of every chain.
fn initial_states<D: Target>(
    target: &D,
    config: &RunConfig,
    initial: &InitialState,
) -> std::result::Result<Vec<ChainState>, ConfigError> {
    let n = config.n_chains;
    let points: Vec<Vec<f64>> = match initial {
        InitialState::Shared(x) => vec![x.clone(); n],
        InitialState::PerChain(xs) => {
            if xs.len() != n {
                return Err(ConfigError::InitialStateCount {
                    expected: n,
                    got: xs.len(),
                });
            }
            xs.clone()
        }
        InitialState::DrawFromPrior(sampler) => {
            return (0..n)
                .map(|chain| draw_initial(target, sampler.as_ref(), config.seed, chain))
                .collect();
        }
    };

    let dim = points[0].len();
    if dim == 0 {
        return Err(ConfigError::EmptyParameterVector);
    }
    points
        .into_iter()
        .enumerate()
        .map(|(chain, x)| {
            if x.len() != dim {
                return Err(ConfigError::InitialDimension {
                    expected: dim,
                    got: x.len(),
                });
            }
            match ChainState::evaluate(target, x) {
                Ok(state) if state.log_posterior(1.0).is_finite() => Ok(state),
                _ => Err(ConfigError::InitialStateOutsideSupport { chain }),
            }
        })
        .collect()
}

fn draw_initial<D: Target>(
    target: &D,
    sampler: &dyn PriorSampler,
    seed: u64,
    chain: usize,
) -> std::result::Result<ChainState, ConfigError> {
    let mut rng = SmallRng::seed_from_u64(block_seed(seed, chain, usize::MAX));
    for _ in 0..MAX_INITIAL_DRAWS {
        let x = sampler.draw(&mut rng);
        if x.is_empty() {
            return Err(ConfigError::EmptyParameterVector);
        }
        if let Ok(state) = ChainState::evaluate(target, x) {
            if state.log_posterior(1.0).is_finite() {
                return Ok(state);
            }
        }
    }
    Err(ConfigError::InitialStateOutsideSupport { chain })
}
