/*!
The temperature ladder and its swap-rate driven spacing schedule.

Temperatures are strictly increasing with `T[0] = 1`. After every `batch_size` swap phases the
gap above each rung whose batch acceptance rate lies outside the target band is stretched
(too many swaps) or shrunk (too few) by `exp(κ_n·(rate − mid))`, where
`κ_n = rate0 · t0 / (t0 + n)` decays with the number `n` of adaptations already made. The
ladder is then rebuilt upwards from `T[0]`, clamping every rung to stay above its colder
neighbour.
*/

use log::debug;
use serde::{Deserialize, Serialize};

use crate::config::{LadderAdaptConfig, LadderSpacing, RunConfig};
use crate::error::ConfigError;
use crate::stats::AcceptanceCounter;
use crate::swap::SwapRecord;

/// Smallest relative gap between neighbouring temperatures.
const MIN_RELATIVE_GAP: f64 = 1e-6;

/// `T[i] = ratio^i` for `n` chains.
pub fn geometric_ladder(n: usize, ratio: f64) -> Vec<f64> {
    (0..n).map(|i| ratio.powi(i as i32)).collect()
}

/// Checks that `temperatures` starts at 1 and is strictly increasing.
pub fn validate_temperatures(temperatures: &[f64]) -> Result<(), ConfigError> {
    let Some(&first) = temperatures.first() else {
        return Err(ConfigError::NoChains);
    };
    if first != 1.0 {
        return Err(ConfigError::ColdTemperature(first));
    }
    for (index, pair) in temperatures.windows(2).enumerate() {
        if pair[1] <= pair[0] || !pair[1].is_finite() {
            return Err(ConfigError::NonIncreasingLadder {
                index: index + 1,
                previous: pair[0],
                value: pair[1],
            });
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemperatureLadder {
    temperatures: Vec<f64>,
    /// Swap counts of the current adaptation batch, one per adjacent pair.
    batch: Vec<AcceptanceCounter>,
    /// Swap counts since the start of the run.
    totals: Vec<AcceptanceCounter>,
    phases_in_batch: usize,
    adaptations: u64,
    settings: LadderAdaptConfig,
    frozen: bool,
}

impl TemperatureLadder {
    /**
    Builds a ladder from explicit temperatures.

    # Examples

    ```rust
    use pt_mcmc::config::LadderAdaptConfig;
    use pt_mcmc::ladder::TemperatureLadder;

    let ladder = TemperatureLadder::new(vec![1.0, 2.0, 4.0], LadderAdaptConfig::default()).unwrap();
    assert_eq!(ladder.temperatures(), &[1.0, 2.0, 4.0]);
    assert!(TemperatureLadder::new(vec![1.0, 1.0], LadderAdaptConfig::default()).is_err());
    ```
    */
    pub fn new(temperatures: Vec<f64>, settings: LadderAdaptConfig) -> Result<Self, ConfigError> {
        validate_temperatures(&temperatures)?;
        let pairs = temperatures.len() - 1;
        Ok(Self {
            temperatures,
            batch: vec![AcceptanceCounter::default(); pairs],
            totals: vec![AcceptanceCounter::default(); pairs],
            phases_in_batch: 0,
            adaptations: 0,
            frozen: !settings.enabled,
            settings,
        })
    }

    /// Builds the initial ladder described by `config` for a target with `n_params` parameters.
    pub fn from_config(config: &RunConfig, n_params: usize) -> Result<Self, ConfigError> {
        let n = config.n_chains;
        if n == 0 {
            return Err(ConfigError::NoChains);
        }
        let temperatures = match &config.ladder.spacing {
            LadderSpacing::Manual { temperatures } => {
                if temperatures.len() != n {
                    return Err(ConfigError::LadderLength {
                        expected: n,
                        got: temperatures.len(),
                    });
                }
                temperatures.clone()
            }
            LadderSpacing::Geometric { t_max: Some(t_max) } => {
                if *t_max <= 1.0 || !t_max.is_finite() {
                    return Err(ConfigError::MaxTemperature(*t_max));
                }
                if n == 1 {
                    vec![1.0]
                } else {
                    geometric_ladder(n, t_max.powf(1.0 / (n - 1) as f64))
                }
            }
            LadderSpacing::Geometric { t_max: None } => {
                geometric_ladder(n, 1.0 + (2.0 / n_params.max(1) as f64).sqrt())
            }
        };
        Self::new(temperatures, config.ladder.adapt.clone())
    }

    pub fn temperatures(&self) -> &[f64] {
        &self.temperatures
    }

    pub fn temperature(&self, chain: usize) -> f64 {
        self.temperatures[chain]
    }

    pub fn len(&self) -> usize {
        self.temperatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.temperatures.is_empty()
    }

    /// Counts one swap attempt.
    pub fn record(&mut self, record: &SwapRecord) {
        if record.cold + 1 != record.hot || record.hot >= self.temperatures.len() {
            return;
        }
        self.batch[record.cold].record(record.accepted);
        self.totals[record.cold].record(record.accepted);
    }

    /// Stops any further spacing changes.
    pub fn freeze(&mut self) {
        if !self.frozen {
            debug!("temperature ladder frozen at {:?}", self.temperatures);
        }
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Closes a swap phase. Returns `true` if the temperatures changed.
    pub fn end_swap_phase(&mut self) -> bool {
        if self.frozen || self.batch.is_empty() {
            return false;
        }
        self.phases_in_batch += 1;
        if self.phases_in_batch < self.settings.batch_size {
            return false;
        }
        let changed = self.adapt();
        self.phases_in_batch = 0;
        self.batch.iter_mut().for_each(|c| *c = AcceptanceCounter::default());
        changed
    }

    /// Closes the swap phase that ended at `iteration`, freezing the ladder first once burn-in
    /// is over (if so configured). Returns `true` if the temperatures changed.
    pub fn close_swap_phase(&mut self, iteration: usize, burn_in: usize) -> bool {
        if self.settings.freeze_after_burn_in && iteration >= burn_in {
            self.freeze();
        }
        self.end_swap_phase()
    }

    fn adapt(&mut self) -> bool {
        let s = &self.settings;
        let mid = 0.5 * (s.target_low + s.target_high);
        let kappa = s.rate0 * s.t0 / (s.t0 + self.adaptations as f64);

        let mut gaps: Vec<f64> = self.temperatures.windows(2).map(|w| w[1] - w[0]).collect();
        let mut changed = false;
        for (gap, counter) in gaps.iter_mut().zip(&self.batch) {
            if counter.proposed == 0 {
                continue;
            }
            let rate = counter.rate();
            if rate < s.target_low || rate > s.target_high {
                *gap *= (kappa * (rate - mid)).exp();
                changed = true;
            }
        }
        self.adaptations += 1;
        if !changed {
            return false;
        }

        let mut rebuilt = Vec::with_capacity(self.temperatures.len());
        rebuilt.push(1.0);
        for gap in gaps {
            let prev = rebuilt[rebuilt.len() - 1];
            rebuilt.push((prev + gap).max(prev * (1.0 + MIN_RELATIVE_GAP)));
        }
        debug!(
            "ladder adaptation {} (kappa = {kappa:.4}): {:?}",
            self.adaptations, rebuilt
        );
        self.temperatures = rebuilt;
        true
    }

    /// Swap acceptance rate of each adjacent pair over the whole run.
    pub fn swap_rates(&self) -> Vec<f64> {
        self.totals.iter().map(|c| c.rate()).collect()
    }

    pub fn swap_counts(&self) -> &[AcceptanceCounter] {
        &self.totals
    }

    pub fn adaptations(&self) -> u64 {
        self.adaptations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn settings(batch_size: usize) -> LadderAdaptConfig {
        LadderAdaptConfig {
            batch_size,
            ..LadderAdaptConfig::default()
        }
    }

    fn record_batch(ladder: &mut TemperatureLadder, accept: &[bool]) {
        for (cold, &accepted) in accept.iter().enumerate() {
            ladder.record(&SwapRecord {
                cold,
                hot: cold + 1,
                accepted,
            });
        }
    }

    #[test]
    fn rejects_bad_ladders() {
        let s = LadderAdaptConfig::default();
        assert_eq!(
            TemperatureLadder::new(vec![2.0, 4.0], s.clone()).unwrap_err(),
            ConfigError::ColdTemperature(2.0)
        );
        assert!(matches!(
            TemperatureLadder::new(vec![1.0, 3.0, 2.0], s.clone()),
            Err(ConfigError::NonIncreasingLadder { index: 2, .. })
        ));
        assert!(matches!(
            TemperatureLadder::new(vec![1.0, f64::NAN], s),
            Err(ConfigError::NonIncreasingLadder { index: 1, .. })
        ));
    }

    #[test]
    fn manual_ladder_must_match_chain_count() {
        let mut config = RunConfig::default();
        config.ladder.spacing = LadderSpacing::Manual {
            temperatures: vec![1.0, 2.0],
        };
        assert_eq!(
            TemperatureLadder::from_config(&config, 2).unwrap_err(),
            ConfigError::LadderLength {
                expected: 4,
                got: 2
            }
        );
    }

    #[test]
    fn geometric_ladders() {
        let mut config = RunConfig::default();
        config.ladder.spacing = LadderSpacing::Geometric { t_max: Some(27.0) };
        let ladder = TemperatureLadder::from_config(&config, 2).unwrap();
        let expected = [1.0, 3.0, 9.0, 27.0];
        for (t, e) in ladder.temperatures().iter().zip(expected) {
            assert_abs_diff_eq!(*t, e, epsilon = 1e-9);
        }

        config.ladder.spacing = LadderSpacing::Geometric { t_max: None };
        let ladder = TemperatureLadder::from_config(&config, 2).unwrap();
        assert_abs_diff_eq!(ladder.temperature(1), 2.0, epsilon = 1e-12);
    }

    #[test]
    fn low_swap_rate_shrinks_the_gap() {
        let mut ladder = TemperatureLadder::new(vec![1.0, 4.0, 16.0], settings(2)).unwrap();
        for _ in 0..2 {
            record_batch(&mut ladder, &[false, true]);
            ladder.end_swap_phase();
        }
        let t = ladder.temperatures();
        assert_eq!(t[0], 1.0);
        assert!(t[1] < 4.0, "{t:?}");
        // The upper pair swapped every time, so its gap grew.
        assert!(t[2] - t[1] > 12.0, "{t:?}");
        assert_eq!(ladder.adaptations(), 1);
    }

    #[test]
    fn rates_inside_the_band_leave_the_ladder_alone() {
        let mut ladder = TemperatureLadder::new(vec![1.0, 2.0], settings(10)).unwrap();
        for i in 0..10 {
            record_batch(&mut ladder, &[i % 10 < 3]);
            assert!(!ladder.end_swap_phase());
        }
        assert_eq!(ladder.temperatures(), &[1.0, 2.0]);
        assert_abs_diff_eq!(ladder.swap_rates()[0], 0.3, epsilon = 1e-12);
    }

    #[test]
    fn adaptation_keeps_order_and_pins_the_cold_chain() {
        let mut ladder = TemperatureLadder::new(vec![1.0, 1.5, 2.0, 2.5], settings(1)).unwrap();
        for _ in 0..500 {
            record_batch(&mut ladder, &[false, false, false]);
            ladder.end_swap_phase();
            let t = ladder.temperatures();
            assert_eq!(t[0], 1.0);
            assert!(t.windows(2).all(|w| w[1] > w[0]), "{t:?}");
        }
    }

    #[test]
    fn frozen_ladder_does_not_move() {
        let mut ladder = TemperatureLadder::new(vec![1.0, 10.0], settings(1)).unwrap();
        ladder.freeze();
        record_batch(&mut ladder, &[false]);
        assert!(!ladder.end_swap_phase());
        assert_eq!(ladder.temperatures(), &[1.0, 10.0]);
        assert_eq!(ladder.swap_counts()[0].proposed, 1);
    }

    #[test]
    fn disabled_adaptation_starts_frozen() {
        let s = LadderAdaptConfig {
            enabled: false,
            ..LadderAdaptConfig::default()
        };
        assert!(TemperatureLadder::new(vec![1.0, 2.0], s).unwrap().is_frozen());
    }
}
