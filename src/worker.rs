/*!
Driving one chain per worker, with swaps negotiated over a [`Transport`].

Every worker runs the same block schedule as the in-process sampler and holds a replica of
the temperature ladder. For each adjacent pair `(p, p + 1)`, coldest first:

1. the hot worker `p + 1` sends its state to `p`;
2. the cold worker `p` decides (it alone draws the uniform), sends the decision to every other
   worker and, on acceptance, sends its own state back and adopts the one it received;
3. the hot worker receives the decision and, on acceptance, the cold state;
4. every other worker just receives the decision.

Since every worker records the same decisions, the ladder replicas adapt identically. A pair
whose exchange fails with a [`TransportError`] is logged and skipped on that worker. Every
message is tagged with its block and pair, so a peer that answers after being skipped cannot
leak its stale state into a later exchange.
*/

use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, warn};

use crate::chain::Chain;
use crate::config::RunConfig;
use crate::distributions::Target;
use crate::error::TransportError;
use crate::io::{Retention, SampleRecord};
use crate::ladder::TemperatureLadder;
use crate::proposal::KernelSet;
use crate::swap::{decide, SwapRecord};
use crate::transport::{MessageTag, Transport};

/// What a worker produced between two calls to [`Worker::run`].
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerReport {
    pub records: Vec<SampleRecord>,
    /// Iteration the worker reached.
    pub iteration: usize,
    /// The run ended early on a stop request.
    pub stopped: bool,
}

pub struct Worker<T: Transport> {
    chain: Chain,
    ladder: TemperatureLadder,
    transport: T,
}

impl<T: Transport> Worker<T> {
    /// Pairs `chain` with the transport endpoint of the same rank.
    pub fn new(chain: Chain, ladder: TemperatureLadder, transport: T) -> Result<Self, TransportError> {
        if chain.index() != transport.rank() || ladder.len() != transport.size() {
            return Err(TransportError::UnknownRank {
                rank: chain.index(),
                size: transport.size(),
            });
        }
        Ok(Self {
            chain,
            ladder,
            transport,
        })
    }

    pub fn chain(&self) -> &Chain {
        &self.chain
    }

    pub fn ladder(&self) -> &TemperatureLadder {
        &self.ladder
    }

    pub fn into_parts(self) -> (Chain, TemperatureLadder) {
        (self.chain, self.ladder)
    }

    /// Runs blocks from `from` up to `until`, swapping after every full block.
    ///
    /// Rank 0 polls `stop` at every block boundary and tells the others, so all workers stop
    /// after the same block. A failure of that agreement is returned as an error.
    pub fn run(
        &mut self,
        target: &dyn Target,
        kernels: &KernelSet,
        config: &RunConfig,
        from: usize,
        until: usize,
        stop: &AtomicBool,
    ) -> Result<WorkerReport, TransportError> {
        let retention = Retention::from_config(config);
        let swap_interval = config.swap_interval;
        let mut records = Vec::new();
        let mut iteration = from;
        let mut stopped = false;

        while iteration < until {
            let block = iteration / swap_interval;
            if self.agree_to_stop(block, stop.load(Ordering::Relaxed))? {
                stopped = true;
                break;
            }
            let len = swap_interval.min(until - iteration);
            records.extend(
                self.chain
                    .run_block(target, kernels, block, len, &retention),
            );
            iteration += len;
            if len == swap_interval {
                self.swap_phase(block);
                if self.ladder.close_swap_phase(iteration, config.burn_in) {
                    self.chain
                        .set_temperature(self.ladder.temperature(self.transport.rank()));
                }
            }
        }

        Ok(WorkerReport {
            records,
            iteration,
            stopped,
        })
    }

    /// Rank 0 shares its stop request for `block` with everybody; returns the agreed answer.
    pub fn agree_to_stop(&self, block: usize, requested: bool) -> Result<bool, TransportError> {
        let tag = MessageTag::stop(block);
        let size = self.transport.size();
        if size == 1 {
            return Ok(requested);
        }
        if self.transport.rank() == 0 {
            let peers: Vec<usize> = (1..size).collect();
            if let Err(err) = self.transport.broadcast_decision(&peers, tag, requested) {
                warn!("rank 0: could not share the stop decision: {err}");
            }
            Ok(requested)
        } else {
            self.transport.receive_decision(0, tag)
        }
    }

    /// One swap attempt per adjacent pair after `block`, recorded in this worker's ladder replica.
    pub fn swap_phase(&mut self, block: usize) -> Vec<SwapRecord> {
        let rank = self.transport.rank();
        let mut records = Vec::new();
        for cold in 0..self.transport.size().saturating_sub(1) {
            let hot = cold + 1;
            let tag = MessageTag::swap(block, cold);
            let outcome = if rank == cold {
                self.swap_as_cold(hot, tag)
            } else if rank == hot {
                self.swap_as_hot(cold, tag)
            } else {
                self.transport.receive_decision(cold, tag)
            };
            match outcome {
                Ok(accepted) => {
                    let record = SwapRecord { cold, hot, accepted };
                    self.ladder.record(&record);
                    records.push(record);
                }
                Err(err) => warn!("rank {rank}: block {block} swap {cold} <-> {hot} skipped: {err}"),
            }
        }
        debug!("rank {rank}: swap phase {block} {:?}", records);
        records
    }

    fn swap_as_cold(&mut self, hot: usize, tag: MessageTag) -> Result<bool, TransportError> {
        let rank = self.transport.rank();
        let incoming = self.transport.receive(hot, tag)?;
        let accepted = decide(
            &mut self.chain,
            incoming.log_likelihood,
            self.ladder.temperature(hot),
        );
        self.transport.broadcast_decision(&[hot], tag, accepted)?;
        let bystanders: Vec<usize> = (0..self.transport.size())
            .filter(|&r| r != rank && r != hot)
            .collect();
        if let Err(err) = self.transport.broadcast_decision(&bystanders, tag, accepted) {
            warn!("rank {rank}: decision for pair {rank} <-> {hot} not delivered: {err}");
        }
        if accepted {
            self.transport.send(hot, tag, self.chain.state())?;
            self.chain.exchange_state(incoming);
        }
        Ok(accepted)
    }

    fn swap_as_hot(&mut self, cold: usize, tag: MessageTag) -> Result<bool, TransportError> {
        self.transport.send(cold, tag, self.chain.state())?;
        let accepted = self.transport.receive_decision(cold, tag)?;
        if accepted {
            let incoming = self.transport.receive(cold, tag)?;
            self.chain.exchange_state(incoming);
        }
        Ok(accepted)
    }
}
