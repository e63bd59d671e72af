//! Weighted selection of the proposal kernel for each iteration.

use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::proposal::KernelKind;

/**
The kernel mixture of one chain.

Every iteration draws a kernel with probability equal to its current weight. Every
`cycle_length` iterations the fixed base weights are handed out to the kernels again as a
random permutation, so no kernel keeps a small weight for the whole run. Kernels with zero base
weight never enter the cycle.

# Examples

```rust
use pt_mcmc::cycle::ProposalCycle;
use pt_mcmc::proposal::KernelKind;
use rand::{rngs::SmallRng, SeedableRng};

let mut cycle = ProposalCycle::new(
    vec![(KernelKind::AdaptiveMetropolis, 0.5), (KernelKind::Scam, 0.5), (KernelKind::PriorDraw, 0.0)],
    100,
);
let mut rng = SmallRng::seed_from_u64(1);
assert_ne!(cycle.select(0, &mut rng), KernelKind::PriorDraw);
```
*/
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposalCycle {
    kinds: Vec<KernelKind>,
    base_weights: Vec<f64>,
    weights: Vec<f64>,
    cycle_length: usize,
}

impl ProposalCycle {
    pub fn new(entries: Vec<(KernelKind, f64)>, cycle_length: usize) -> Self {
        let (kinds, base_weights): (Vec<_>, Vec<_>) =
            entries.into_iter().filter(|(_, w)| *w > 0.0).unzip();
        Self {
            weights: base_weights.clone(),
            kinds,
            base_weights,
            cycle_length: cycle_length.max(1),
        }
    }

    /// Picks the kernel for `iteration`, permuting the weights first if a new cycle begins.
    pub fn select(&mut self, iteration: usize, rng: &mut SmallRng) -> KernelKind {
        if iteration > 0 && iteration % self.cycle_length == 0 && self.weights.len() > 1 {
            self.weights.clone_from(&self.base_weights);
            self.weights.shuffle(rng);
        }
        if self.kinds.len() == 1 {
            return self.kinds[0];
        }
        let total: f64 = self.weights.iter().sum();
        let u = rng.gen::<f64>() * total;
        let mut acc = 0.0;
        for (kind, w) in self.kinds.iter().zip(&self.weights) {
            acc += w;
            if u < acc {
                return *kind;
            }
        }
        // Rounding can leave u just above the last cumulative weight.
        self.kinds[self.kinds.len() - 1]
    }

    /// Current `(kernel, weight)` assignment.
    pub fn weights(&self) -> impl Iterator<Item = (KernelKind, f64)> + '_ {
        self.kinds.iter().copied().zip(self.weights.iter().copied())
    }

    pub fn kinds(&self) -> &[KernelKind] {
        &self.kinds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn selection_frequencies_follow_weights() {
        let mut cycle = ProposalCycle::new(
            vec![
                (KernelKind::AdaptiveMetropolis, 0.7),
                (KernelKind::Scam, 0.3),
            ],
            usize::MAX,
        );
        let mut rng = SmallRng::seed_from_u64(42);
        let n = 20_000;
        let am = (0..n)
            .filter(|&i| cycle.select(i, &mut rng) == KernelKind::AdaptiveMetropolis)
            .count();
        let frac = am as f64 / n as f64;
        assert!((frac - 0.7).abs() < 0.02, "frac = {frac}");
    }

    #[test]
    fn zero_weight_kernels_are_excluded() {
        let cycle = ProposalCycle::new(
            vec![
                (KernelKind::AdaptiveMetropolis, 1.0),
                (KernelKind::DifferentialEvolution, 0.0),
            ],
            10,
        );
        assert_eq!(cycle.kinds(), &[KernelKind::AdaptiveMetropolis]);
    }

    #[test]
    fn weights_are_permuted_every_cycle() {
        let mut cycle = ProposalCycle::new(
            vec![
                (KernelKind::AdaptiveMetropolis, 0.1),
                (KernelKind::Scam, 0.2),
                (KernelKind::DifferentialEvolution, 0.3),
                (KernelKind::PriorDraw, 0.4),
            ],
            5,
        );
        let mut rng = SmallRng::seed_from_u64(7);
        let mut seen_change = false;
        for i in 0..200 {
            cycle.select(i, &mut rng);
            let mut w: Vec<f64> = cycle.weights().map(|(_, w)| w).collect();
            if w != vec![0.1, 0.2, 0.3, 0.4] {
                seen_change = true;
            }
            w.sort_by(|a, b| a.total_cmp(b));
            assert_eq!(w, vec![0.1, 0.2, 0.3, 0.4]);
        }
        assert!(seen_change);
    }
}
