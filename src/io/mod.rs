/*!
Where retained samples go.

The sampler hands every retained sample to a [`SampleSink`] as soon as it is produced. A sink
that fails to write is logged and skipped; it never stops the run. [`MemorySink`] collects
records in memory, [`csv::CsvSink`] (feature `csv`) streams them to a CSV file.
*/

use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::chain::Chain;
use crate::config::RunConfig;
use crate::error::SinkError;

#[cfg(feature = "csv")]
pub mod csv;

/// One retained state of one chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleRecord {
    pub iteration: usize,
    pub chain: usize,
    pub temperature: f64,
    pub params: Vec<f64>,
    pub log_likelihood: f64,
    /// Untempered log posterior, `log_prior + log_likelihood`.
    pub log_posterior: f64,
}

impl SampleRecord {
    /// Snapshot of `chain`'s current state, labelled with `iteration`.
    pub fn capture(iteration: usize, chain: &Chain) -> Self {
        let state = chain.state();
        Self {
            iteration,
            chain: chain.index(),
            temperature: chain.temperature(),
            params: state.params.clone(),
            log_likelihood: state.log_likelihood,
            log_posterior: state.log_posterior(1.0),
        }
    }
}

/// Burn-in, thinning and which chains are recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retention {
    pub burn_in: usize,
    pub thin: usize,
    pub hot_chains: bool,
}

impl Retention {
    pub fn from_config(config: &RunConfig) -> Self {
        Self {
            burn_in: config.burn_in,
            thin: config.thin.max(1),
            hot_chains: config.record_hot_chains,
        }
    }

    /// Whether the state of `chain` after `iteration` is kept.
    pub fn keeps(&self, chain: usize, iteration: usize) -> bool {
        (chain == 0 || self.hot_chains)
            && iteration >= self.burn_in
            && (iteration - self.burn_in) % self.thin == 0
    }
}

/// Receives retained samples while the run progresses.
pub trait SampleSink: Send {
    fn write(&mut self, record: &SampleRecord) -> Result<(), SinkError>;

    fn flush(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

/**
Collects records in memory. Clones share the same buffer, so a handle kept by the caller sees
what the sampler wrote.

# Examples

```rust
use pt_mcmc::io::{MemorySink, SampleRecord, SampleSink};

let sink = MemorySink::new();
let mut writer = sink.clone();
writer
    .write(&SampleRecord {
        iteration: 0,
        chain: 0,
        temperature: 1.0,
        params: vec![0.5],
        log_likelihood: -0.1,
        log_posterior: -0.2,
    })
    .unwrap();
assert_eq!(sink.records().len(), 1);
```
*/
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<SampleRecord>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything written so far.
    pub fn records(&self) -> Vec<SampleRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl SampleSink for MemorySink {
    fn write(&mut self, record: &SampleRecord) -> Result<(), SinkError> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
        Ok(())
    }
}
