use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::chain::Chain;
use crate::config::RunConfig;
use crate::error::CheckpointError;
use crate::ladder::TemperatureLadder;

/// Format version written into every checkpoint.
pub const CHECKPOINT_VERSION: u32 = 1;

/// Complete, restorable state of a run at a block boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    /// Iterations completed by every chain.
    pub iteration: usize,
    /// Configuration snapshot of the run.
    pub config: RunConfig,
    pub ladder: TemperatureLadder,
    /// Chains in ladder order.
    pub chains: Vec<Chain>,
}

impl Checkpoint {
    /// Restores the payload from disk.
    pub fn load(path: &Path) -> Result<Self, CheckpointError> {
        let contents = fs::read_to_string(path).map_err(|source| CheckpointError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let checkpoint: Checkpoint = serde_json::from_str(&contents)?;
        if checkpoint.version != CHECKPOINT_VERSION {
            return Err(CheckpointError::Incompatible(format!(
                "version {} (expected {CHECKPOINT_VERSION})",
                checkpoint.version
            )));
        }
        Ok(checkpoint)
    }

    /// Writes the payload to disk, creating parent directories as needed.
    pub fn store(&self, path: &Path) -> Result<(), CheckpointError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| CheckpointError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).map_err(|source| CheckpointError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Checks the internal consistency of a payload before it is turned back into a sampler.
    pub fn check(&self) -> Result<(), CheckpointError> {
        let n = self.config.n_chains;
        if self.chains.len() != n || self.ladder.len() != n {
            return Err(CheckpointError::Incompatible(format!(
                "{} chains and {} temperatures for a run of {n} chains",
                self.chains.len(),
                self.ladder.len()
            )));
        }
        for (i, chain) in self.chains.iter().enumerate() {
            if chain.index() != i || chain.iteration() != self.iteration {
                return Err(CheckpointError::Incompatible(format!(
                    "chain {} at iteration {} stored in slot {i} of a checkpoint at {}",
                    chain.index(),
                    chain.iteration(),
                    self.iteration
                )));
            }
        }
        if self.iteration % self.config.swap_interval.max(1) != 0
            && self.iteration != self.config.total_iterations
        {
            return Err(CheckpointError::Incompatible(format!(
                "iteration {} is not at a block boundary",
                self.iteration
            )));
        }
        Ok(())
    }
}

/// Deterministic file name for the checkpoint taken after `iteration`.
pub fn checkpoint_path(root: &Path, iteration: usize) -> PathBuf {
    root.join(format!("ckpt_{iteration:08}.json"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ChainState;
    use tempfile::tempdir;

    fn sample_checkpoint() -> Checkpoint {
        let config = RunConfig {
            n_chains: 2,
            ..RunConfig::default()
        };
        let chains = (0..2)
            .map(|i| {
                let state = ChainState {
                    params: vec![0.1 * i as f64, 1.0 / 3.0],
                    log_likelihood: -1.0 / 7.0,
                    log_prior: -2.0_f64.ln(),
                };
                Chain::new(i, 1.0 + i as f64, state, &config).unwrap()
            })
            .collect();
        Checkpoint {
            version: CHECKPOINT_VERSION,
            iteration: 0,
            ladder: TemperatureLadder::new(vec![1.0, 2.0], config.ladder.adapt.clone()).unwrap(),
            config,
            chains,
        }
    }

    #[test]
    fn store_then_load_is_lossless() {
        let dir = tempdir().unwrap();
        let path = checkpoint_path(dir.path(), 0);
        let checkpoint = sample_checkpoint();
        checkpoint.store(&path).unwrap();
        let loaded = Checkpoint::load(&path).unwrap();

        assert_eq!(loaded.config, checkpoint.config);
        assert_eq!(loaded.ladder, checkpoint.ladder);
        for (a, b) in loaded.chains.iter().zip(&checkpoint.chains) {
            assert_eq!(a.state(), b.state());
            assert_eq!(a.adapter(), b.adapter());
            assert_eq!(a.cycle(), b.cycle());
        }
        assert!(loaded.check().is_ok());
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempdir().unwrap();
        let err = Checkpoint::load(&dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(err, CheckpointError::Io { .. }));
    }

    #[test]
    fn chain_count_mismatch_is_incompatible() {
        let mut checkpoint = sample_checkpoint();
        checkpoint.chains.pop();
        assert!(matches!(
            checkpoint.check(),
            Err(CheckpointError::Incompatible(_))
        ));
    }

    #[test]
    fn paths_sort_by_iteration() {
        let root = Path::new("/tmp/run");
        assert!(checkpoint_path(root, 90) < checkpoint_path(root, 100));
        assert_eq!(
            checkpoint_path(root, 100),
            PathBuf::from("/tmp/run/ckpt_00000100.json")
        );
    }
}
