//! Run configuration, loadable from JSON.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::proposal::KernelKind;

/// Parameters governing a parallel-tempering run. Immutable once the run starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Number of chains, one per temperature.
    #[serde(default = "default_n_chains")]
    pub n_chains: usize,
    /// Iterations every chain performs, burn-in included.
    #[serde(default = "default_total_iterations")]
    pub total_iterations: usize,
    /// Cold-chain iterations discarded before samples are kept.
    #[serde(default = "default_burn_in")]
    pub burn_in: usize,
    /// Keep every `thin`-th sample after burn-in.
    #[serde(default = "default_thin")]
    pub thin: usize,
    /// Iterations between swap phases.
    #[serde(default = "default_swap_interval")]
    pub swap_interval: usize,
    /// Master seed from which every chain's random stream is derived.
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub ladder: LadderConfig,
    #[serde(default)]
    pub proposal: ProposalConfig,
    #[serde(default)]
    pub adaptation: AdaptationConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    /// Also send the retained samples of the hot chains to the sink.
    #[serde(default)]
    pub record_hot_chains: bool,
    /// Bounded wait for swap messages in worker mode. `None` blocks forever.
    #[serde(default)]
    pub transport_timeout_ms: Option<u64>,
}

fn default_n_chains() -> usize {
    4
}

fn default_total_iterations() -> usize {
    10_000
}

fn default_burn_in() -> usize {
    1_000
}

fn default_thin() -> usize {
    1
}

fn default_swap_interval() -> usize {
    10
}

fn default_seed() -> u64 {
    42
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            n_chains: default_n_chains(),
            total_iterations: default_total_iterations(),
            burn_in: default_burn_in(),
            thin: default_thin(),
            swap_interval: default_swap_interval(),
            seed: default_seed(),
            ladder: LadderConfig::default(),
            proposal: ProposalConfig::default(),
            adaptation: AdaptationConfig::default(),
            checkpoint: CheckpointConfig::default(),
            record_hot_chains: false,
            transport_timeout_ms: None,
        }
    }
}

/// Temperature ladder construction and adaptation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LadderConfig {
    #[serde(default)]
    pub spacing: LadderSpacing,
    #[serde(default)]
    pub adapt: LadderAdaptConfig,
}

/// How the initial temperatures are laid out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum LadderSpacing {
    /// `T[i] = c^i`. With `t_max` set, `c` is chosen so the hottest chain sits at `t_max`;
    /// otherwise `c = 1 + sqrt(2 / D)`.
    Geometric {
        #[serde(default)]
        t_max: Option<f64>,
    },
    /// Explicit temperatures, coldest first.
    Manual { temperatures: Vec<f64> },
}

impl Default for LadderSpacing {
    fn default() -> Self {
        LadderSpacing::Geometric { t_max: None }
    }
}

/// Swap-rate driven adjustment of the ladder spacing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LadderAdaptConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Swap phases per adaptation batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_target_low")]
    pub target_low: f64,
    #[serde(default = "default_target_high")]
    pub target_high: f64,
    /// Initial adaptation rate.
    #[serde(default = "default_rate0")]
    pub rate0: f64,
    /// Decay horizon: the rate after `n` adaptations is `rate0 * t0 / (t0 + n)`.
    #[serde(default = "default_t0")]
    pub t0: f64,
    #[serde(default = "default_true")]
    pub freeze_after_burn_in: bool,
}

fn default_true() -> bool {
    true
}

fn default_batch_size() -> usize {
    10
}

fn default_target_low() -> f64 {
    0.2
}

fn default_target_high() -> f64 {
    0.4
}

fn default_rate0() -> f64 {
    0.5
}

fn default_t0() -> f64 {
    100.0
}

impl Default for LadderAdaptConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_size: default_batch_size(),
            target_low: default_target_low(),
            target_high: default_target_high(),
            rate0: default_rate0(),
            t0: default_t0(),
            freeze_after_burn_in: true,
        }
    }
}

/// Base weights of the kernel mixture. Must sum to 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelWeights {
    #[serde(default = "default_am_weight")]
    pub adaptive_metropolis: f64,
    #[serde(default = "default_scam_weight")]
    pub scam: f64,
    #[serde(default = "default_de_weight")]
    pub differential_evolution: f64,
    #[serde(default)]
    pub prior_draw: f64,
}

fn default_am_weight() -> f64 {
    0.4
}

fn default_scam_weight() -> f64 {
    0.3
}

fn default_de_weight() -> f64 {
    0.3
}

impl Default for KernelWeights {
    fn default() -> Self {
        Self {
            adaptive_metropolis: default_am_weight(),
            scam: default_scam_weight(),
            differential_evolution: default_de_weight(),
            prior_draw: 0.0,
        }
    }
}

impl KernelWeights {
    pub fn get(&self, kind: KernelKind) -> f64 {
        match kind {
            KernelKind::AdaptiveMetropolis => self.adaptive_metropolis,
            KernelKind::Scam => self.scam,
            KernelKind::DifferentialEvolution => self.differential_evolution,
            KernelKind::PriorDraw => self.prior_draw,
        }
    }

    pub fn entries(&self) -> Vec<(KernelKind, f64)> {
        KernelKind::ALL.iter().map(|&k| (k, self.get(k))).collect()
    }
}

/// Kernel mixture and kernel-specific scales.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposalConfig {
    #[serde(default)]
    pub weights: KernelWeights,
    /// Iterations between re-permutations of the kernel weights.
    #[serde(default = "default_cycle_length")]
    pub cycle_length: usize,
    /// Overrides the Adaptive Metropolis scale `2.38 / sqrt(D)`.
    #[serde(default)]
    pub am_scale: Option<f64>,
    /// Overrides the Differential Evolution scale `2.38 / sqrt(2 D)`.
    #[serde(default)]
    pub de_gamma: Option<f64>,
    /// Probability of a `gamma = 1` Differential Evolution jump.
    #[serde(default)]
    pub mode_hop_probability: f64,
    /// Past states kept per chain for Differential Evolution.
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
}

fn default_cycle_length() -> usize {
    100
}

fn default_history_capacity() -> usize {
    1_000
}

impl Default for ProposalConfig {
    fn default() -> Self {
        Self {
            weights: KernelWeights::default(),
            cycle_length: default_cycle_length(),
            am_scale: None,
            de_gamma: None,
            mode_hop_probability: 0.0,
            history_capacity: default_history_capacity(),
        }
    }
}

/// Covariance adaptation and SCAM step-size tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptationConfig {
    /// Iterations between covariance refreshes.
    #[serde(default = "default_adaptation_interval")]
    pub interval: usize,
    /// States a chain must have seen before its covariance estimate is used.
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
    /// Row-major initial proposal covariance. Identity when absent.
    #[serde(default)]
    pub initial_covariance: Option<Vec<Vec<f64>>>,
    /// Per-dimension acceptance rate the SCAM tuner aims for during burn-in.
    #[serde(default = "default_target_acceptance")]
    pub target_acceptance: f64,
}

fn default_adaptation_interval() -> usize {
    100
}

fn default_min_samples() -> usize {
    500
}

fn default_target_acceptance() -> f64 {
    0.234
}

impl Default for AdaptationConfig {
    fn default() -> Self {
        Self {
            interval: default_adaptation_interval(),
            min_samples: default_min_samples(),
            initial_covariance: None,
            target_acceptance: default_target_acceptance(),
        }
    }
}

/// Periodic checkpoint writes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Iterations between checkpoint writes (0 disables them). Must be a multiple of
    /// `swap_interval`.
    #[serde(default)]
    pub interval: usize,
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

impl RunConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|err| ConfigError::Parse(err.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)
            .map_err(|err| ConfigError::Parse(format!("{}: {err}", path.display())))?;
        Self::from_json_str(&contents)
    }

    pub fn transport_timeout(&self) -> Option<Duration> {
        self.transport_timeout_ms.map(Duration::from_millis)
    }

    /**
    Checks everything that does not depend on the target. Ladder shape is checked when the
    ladder is built, initial states when the sampler is built.

    # Examples

    ```rust
    use pt_mcmc::config::RunConfig;
    use pt_mcmc::error::ConfigError;

    let mut config = RunConfig::default();
    assert!(config.validate().is_ok());
    config.n_chains = 0;
    assert_eq!(config.validate(), Err(ConfigError::NoChains));
    ```
    */
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.n_chains == 0 {
            return Err(ConfigError::NoChains);
        }
        for (name, value) in [
            ("thin", self.thin),
            ("swap_interval", self.swap_interval),
            ("proposal.cycle_length", self.proposal.cycle_length),
            ("adaptation.interval", self.adaptation.interval),
            ("ladder.adapt.batch_size", self.ladder.adapt.batch_size),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroInterval(name));
            }
        }

        let mut sum = 0.0;
        for (kind, weight) in self.proposal.weights.entries() {
            if !weight.is_finite() || weight < 0.0 {
                return Err(ConfigError::InvalidWeight {
                    kernel: kind.name(),
                    weight,
                });
            }
            sum += weight;
        }
        if (sum - 1.0).abs() > 1e-9 {
            return Err(ConfigError::WeightSum(sum));
        }

        let adapt = &self.ladder.adapt;
        if !(0.0 < adapt.target_low && adapt.target_low < adapt.target_high && adapt.target_high < 1.0)
        {
            return Err(ConfigError::AcceptanceBand {
                low: adapt.target_low,
                high: adapt.target_high,
            });
        }
        for (name, value) in [
            ("proposal.mode_hop_probability", self.proposal.mode_hop_probability),
            ("adaptation.target_acceptance", self.adaptation.target_acceptance),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Probability { name, value });
            }
        }

        if self.checkpoint.interval % self.swap_interval != 0 {
            return Err(ConfigError::BlockAlignment {
                what: "checkpoint.interval",
                value: self.checkpoint.interval,
                swap_interval: self.swap_interval,
            });
        }
        Ok(())
    }
}
