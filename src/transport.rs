/*!
Point-to-point messaging between chains that run in separate workers.

The swap protocol only needs four blocking operations, captured by [`Transport`]. Any
message-passing layer can implement it (MPI, sockets, ...); [`ChannelTransport`] is the
in-process implementation on top of `std::sync::mpsc`, used by
[`PtSampler::run_threaded`](crate::sampler::PtSampler::run_threaded).

A transport built with a timeout turns a silent peer into [`TransportError::Timeout`], which
the swap protocol treats as a skipped attempt. Without a timeout a receive blocks until the
peer sends or hangs up.

Every message carries a [`MessageTag`] naming the exchange it belongs to. A peer that was
skipped because it was slow may still deliver later; [`ChannelTransport`] discards such
stale messages instead of handing them to the next exchange.
*/

use std::cell::RefCell;
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};

use log::debug;

use crate::error::TransportError;
use crate::state::ChainState;

/// The exchange a message belongs to. Tags are ordered by block, then by slot within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageTag {
    pub block: usize,
    pub slot: usize,
}

impl MessageTag {
    /// The stop agreement that opens `block`.
    pub fn stop(block: usize) -> Self {
        Self { block, slot: 0 }
    }

    /// The swap attempt of pair `(cold, cold + 1)` after `block`.
    pub fn swap(block: usize, cold: usize) -> Self {
        Self {
            block,
            slot: cold + 1,
        }
    }
}

/// Blocking point-to-point messaging between `size` ranks.
pub trait Transport: Send {
    /// This worker's rank, equal to the index of the chain it runs.
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    fn send(&self, to: usize, tag: MessageTag, state: &ChainState) -> Result<(), TransportError>;

    /// Receives the state `from` sent under `tag`. Messages with earlier tags are discarded.
    fn receive(&self, from: usize, tag: MessageTag) -> Result<ChainState, TransportError>;

    fn broadcast_decision(
        &self,
        to: &[usize],
        tag: MessageTag,
        accepted: bool,
    ) -> Result<(), TransportError>;

    fn receive_decision(&self, from: usize, tag: MessageTag) -> Result<bool, TransportError>;
}

#[derive(Debug)]
enum Body {
    State(ChainState),
    Decision(bool),
}

#[derive(Debug)]
struct Packet {
    tag: MessageTag,
    body: Body,
}

/// One rank of a fully connected mesh of mpsc channels.
///
/// Each sender's tags never decrease, so a packet tagged ahead of the expected exchange proves
/// that exchange will not arrive; it is held back for the receive it belongs to.
#[derive(Debug)]
pub struct ChannelTransport {
    rank: usize,
    size: usize,
    outgoing: Vec<Option<Sender<Packet>>>,
    incoming: Vec<Option<Receiver<Packet>>>,
    held: RefCell<Vec<Option<Packet>>>,
    timeout: Option<Duration>,
}

impl ChannelTransport {
    /**
    Creates `size` connected endpoints; endpoint `i` has rank `i`.

    # Examples

    ```rust
    use pt_mcmc::transport::{ChannelTransport, MessageTag, Transport};

    let mesh = ChannelTransport::mesh(2, None);
    let tag = MessageTag::swap(3, 0);
    mesh[0].broadcast_decision(&[1], tag, true).unwrap();
    assert!(mesh[1].receive_decision(0, tag).unwrap());
    ```
    */
    pub fn mesh(size: usize, timeout: Option<Duration>) -> Vec<ChannelTransport> {
        let mut endpoints: Vec<ChannelTransport> = (0..size)
            .map(|rank| ChannelTransport {
                rank,
                size,
                outgoing: (0..size).map(|_| None).collect(),
                incoming: (0..size).map(|_| None).collect(),
                held: RefCell::new((0..size).map(|_| None).collect()),
                timeout,
            })
            .collect();
        for from in 0..size {
            for to in 0..size {
                if from == to {
                    continue;
                }
                let (tx, rx) = channel();
                endpoints[from].outgoing[to] = Some(tx);
                endpoints[to].incoming[from] = Some(rx);
            }
        }
        endpoints
    }

    fn sender(&self, to: usize) -> Result<&Sender<Packet>, TransportError> {
        self.outgoing
            .get(to)
            .and_then(Option::as_ref)
            .ok_or(TransportError::UnknownRank {
                rank: to,
                size: self.size,
            })
    }

    fn post(&self, to: usize, packet: Packet) -> Result<(), TransportError> {
        self.sender(to)?
            .send(packet)
            .map_err(|_| TransportError::Disconnected { peer: to })
    }

    fn receiver(&self, from: usize) -> Result<&Receiver<Packet>, TransportError> {
        self.incoming
            .get(from)
            .and_then(Option::as_ref)
            .ok_or(TransportError::UnknownRank {
                rank: from,
                size: self.size,
            })
    }

    /// The packet `from` sent under `tag`, skipping stale ones.
    fn next(&self, from: usize, tag: MessageTag) -> Result<Body, TransportError> {
        let rx = self.receiver(from)?;
        let deadline = self.timeout.map(|waited| Instant::now() + waited);
        loop {
            let held = self.held.borrow_mut()[from].take();
            let packet = match held {
                Some(packet) => packet,
                None => self.wait(rx, from, deadline)?,
            };
            if packet.tag < tag {
                debug!(
                    "rank {}: dropping stale message {:?} from rank {from}",
                    self.rank, packet.tag
                );
                continue;
            }
            if packet.tag > tag {
                let got = packet.tag;
                self.held.borrow_mut()[from] = Some(packet);
                return Err(TransportError::OutOfSync {
                    peer: from,
                    expected: tag,
                    got,
                });
            }
            return Ok(packet.body);
        }
    }

    fn wait(
        &self,
        rx: &Receiver<Packet>,
        from: usize,
        deadline: Option<Instant>,
    ) -> Result<Packet, TransportError> {
        match (deadline, self.timeout) {
            (Some(deadline), Some(waited)) => {
                let left = deadline.saturating_duration_since(Instant::now());
                rx.recv_timeout(left).map_err(|err| match err {
                    RecvTimeoutError::Timeout => TransportError::Timeout { peer: from, waited },
                    RecvTimeoutError::Disconnected => TransportError::Disconnected { peer: from },
                })
            }
            _ => rx
                .recv()
                .map_err(|_| TransportError::Disconnected { peer: from }),
        }
    }
}

impl Transport for ChannelTransport {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn send(&self, to: usize, tag: MessageTag, state: &ChainState) -> Result<(), TransportError> {
        self.post(
            to,
            Packet {
                tag,
                body: Body::State(state.clone()),
            },
        )
    }

    fn receive(&self, from: usize, tag: MessageTag) -> Result<ChainState, TransportError> {
        match self.next(from, tag)? {
            Body::State(state) => Ok(state),
            Body::Decision(_) => Err(TransportError::UnexpectedMessage {
                peer: from,
                expected: "state",
            }),
        }
    }

    fn broadcast_decision(
        &self,
        to: &[usize],
        tag: MessageTag,
        accepted: bool,
    ) -> Result<(), TransportError> {
        // Try every peer before reporting the first failure.
        let mut first_error = None;
        for &peer in to {
            let packet = Packet {
                tag,
                body: Body::Decision(accepted),
            };
            if let Err(err) = self.post(peer, packet) {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn receive_decision(&self, from: usize, tag: MessageTag) -> Result<bool, TransportError> {
        match self.next(from, tag)? {
            Body::Decision(accepted) => Ok(accepted),
            Body::State(_) => Err(TransportError::UnexpectedMessage {
                peer: from,
                expected: "decision",
            }),
        }
    }
}
