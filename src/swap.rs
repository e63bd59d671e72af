//! Replica exchange between adjacent temperatures.

use serde::{Deserialize, Serialize};

use crate::chain::Chain;

/// Outcome of one swap attempt between `cold` and `hot = cold + 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapRecord {
    pub cold: usize,
    pub hot: usize,
    pub accepted: bool,
}

/**
Log acceptance of exchanging the states of a colder and a hotter chain:
`(1/T_cold − 1/T_hot)·(ll_hot − ll_cold)`.

Only likelihoods enter, the prior terms cancel. Identical likelihoods give 0, i.e. a swap that
is always accepted.

# Examples

```rust
use pt_mcmc::swap::swap_log_alpha;

assert_eq!(swap_log_alpha(1.0, 2.0, -3.0, -3.0), 0.0);
assert!(swap_log_alpha(1.0, 2.0, -1.0, -5.0) < 0.0);
```
*/
pub fn swap_log_alpha(t_cold: f64, t_hot: f64, ll_cold: f64, ll_hot: f64) -> f64 {
    (1.0 / t_cold - 1.0 / t_hot) * (ll_hot - ll_cold)
}

/// Accept iff `ln(u) < log_alpha`.
pub fn accept_swap(log_alpha: f64, u: f64) -> bool {
    log_alpha > u.ln()
}

/// Draws the decision for pair `(cold, cold + 1)` from the colder chain's stream.
///
/// The uniform is drawn even when the outcome is certain, so every attempt consumes exactly
/// one value.
pub fn decide(cold: &mut Chain, hot_log_likelihood: f64, hot_temperature: f64) -> bool {
    let u = cold.draw_uniform();
    let log_alpha = swap_log_alpha(
        cold.temperature(),
        hot_temperature,
        cold.state().log_likelihood,
        hot_log_likelihood,
    );
    accept_swap(log_alpha, u)
}

/// Attempts one exchange per adjacent pair, coldest pair first, between chains that live in
/// the same process. Chains must be ordered by temperature.
pub fn exchange_adjacent(chains: &mut [Chain]) -> Vec<SwapRecord> {
    let mut records = Vec::with_capacity(chains.len().saturating_sub(1));
    for cold in 0..chains.len().saturating_sub(1) {
        let (left, right) = chains.split_at_mut(cold + 1);
        let (cold_chain, hot_chain) = (&mut left[cold], &mut right[0]);
        let accepted = decide(
            cold_chain,
            hot_chain.state().log_likelihood,
            hot_chain.temperature(),
        );
        if accepted {
            cold_chain.swap_states(hot_chain);
        }
        records.push(SwapRecord {
            cold,
            hot: cold + 1,
            accepted,
        });
    }
    records
}
