//! Error types for the sampler.
//!
//! Only [`ConfigError`] and [`CheckpointError`] ever reach the caller of a run. Evaluation,
//! transport and numerical errors are recovered inside the sampling loop and show up in the
//! diagnostics and the log instead.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::transport::MessageTag;

/// A likelihood or prior could not be evaluated at a point.
///
/// Returned by [`Target`](crate::distributions::Target) implementations. The chain driver
/// turns it into an automatic rejection.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvaluationError {
    #[error("domain error: {0}")]
    Domain(String),
    #[error("non-finite {what} at the candidate point")]
    NonFinite { what: &'static str },
}

/// The swap exchange with a peer did not complete.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("no message from rank {peer} within {waited:?}")]
    Timeout { peer: usize, waited: Duration },
    #[error("rank {peer} disconnected")]
    Disconnected { peer: usize },
    #[error("expected a {expected} from rank {peer}")]
    UnexpectedMessage { peer: usize, expected: &'static str },
    #[error("rank {rank} is not part of a transport of size {size}")]
    UnknownRank { rank: usize, size: usize },
    #[error("rank {peer} sent {got:?} while {expected:?} was awaited")]
    OutOfSync {
        peer: usize,
        expected: MessageTag,
        got: MessageTag,
    },
}

/// Invalid run configuration. Always raised before the first iteration.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("at least one chain is required")]
    NoChains,
    #[error("parameter dimension must be at least 1")]
    EmptyParameterVector,
    #[error("ladder has {got} temperatures but there are {expected} chains")]
    LadderLength { expected: usize, got: usize },
    #[error("the coldest temperature must be 1.0, got {0}")]
    ColdTemperature(f64),
    #[error("temperatures must be strictly increasing (T[{index}] = {value} after {previous})")]
    NonIncreasingLadder {
        index: usize,
        previous: f64,
        value: f64,
    },
    #[error("maximum temperature must be greater than 1.0, got {0}")]
    MaxTemperature(f64),
    #[error("kernel weight for {kernel} is negative or not finite ({weight})")]
    InvalidWeight { kernel: &'static str, weight: f64 },
    #[error("kernel weights must sum to 1, got {0}")]
    WeightSum(f64),
    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),
    #[error("swap acceptance band [{low}, {high}] is not a sub-interval of (0, 1)")]
    AcceptanceBand { low: f64, high: f64 },
    #[error("{name} must lie in [0, 1], got {value}")]
    Probability { name: &'static str, value: f64 },
    #[error("prior-draw kernel has weight {0} but no prior sampler was supplied")]
    MissingPriorSampler(f64),
    #[error("initial state has dimension {got}, expected {expected}")]
    InitialDimension { expected: usize, got: usize },
    #[error("{got} initial states supplied for {expected} chains")]
    InitialStateCount { expected: usize, got: usize },
    #[error("initial state of chain {chain} has log posterior -inf or NaN")]
    InitialStateOutsideSupport { chain: usize },
    #[error("initial covariance must be {dim}x{dim} and positive definite")]
    InitialCovariance { dim: usize },
    #[error("{what} = {value} is not a multiple of the swap interval {swap_interval}")]
    BlockAlignment {
        what: &'static str,
        value: usize,
        swap_interval: usize,
    },
    #[error("cannot run to iteration {requested}: sampler is already at {current}")]
    IterationBehind { requested: usize, current: usize },
    #[error("could not read configuration: {0}")]
    Parse(String),
}

/// A covariance estimate could not be factorised.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{dim}x{dim} matrix is not positive definite")]
pub struct NumericalInstability {
    pub dim: usize,
}

/// A checkpoint could not be written or restored.
#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("checkpoint I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("checkpoint (de)serialisation failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("checkpoint does not match the sampler: {0}")]
    Incompatible(String),
}

/// A sample could not be written by a sink.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("sink I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[cfg(feature = "csv")]
    #[error("csv writer failed: {0}")]
    Csv(#[from] csv::Error),
}

/// Top-level error of the sampler API.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("worker thread for chain {0} panicked")]
    WorkerPanic(usize),
}

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;
