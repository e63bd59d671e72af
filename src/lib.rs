//! Parallel-tempering MCMC with adaptive proposals and an adaptive temperature ladder.
//!
//! Start with [`sampler::PtSampler`]; the run is configured through [`config::RunConfig`].

pub mod adapt;
pub mod chain;
pub mod checkpoint;
pub mod config;
pub mod cycle;
pub mod distributions;
pub mod error;
pub mod io;
pub mod ladder;
pub mod proposal;
pub mod sampler;
pub mod state;
pub mod stats;
pub mod swap;
pub mod transport;
pub mod worker;
