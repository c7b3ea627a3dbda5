//! # Group Communication
//!
//! The ring protocol only ever talks to its peers through the [`GroupComm`]
//! capability set: blocking point-to-point send/receive, a non-consuming size
//! probe, a barrier, a gather to the coordinator and a best-effort abort.
//!
//! Both transports share the same matching rules, implemented once by
//! [`Group`] on top of a per-rank [`Mailbox`]:
//!
//! - **Local**: every rank is a tokio task, packets travel over mpsc channels
//! - **TCP**: every rank is a process, packets travel as length-prefixed
//!   bincode frames over one connection per ordered pair of ranks
//!
//! Collectives are built from point-to-point packets exchanged with rank 0
//! under reserved tags, so an abort packet wakes a rank regardless of which
//! operation it is blocked in.

use crate::error::{RingError, RingResult};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub mod local;
pub mod mailbox;
pub mod tcp;

pub use local::{local_group, LocalComm, LocalOutbound};
pub use mailbox::Mailbox;
pub use tcp::{TcpComm, TcpGroupConfig, TcpOutbound};

/// Message tag used to match a receive with a send
pub type Tag = i32;

/// Tags reserved for the collectives; user traffic must use non-negative tags
pub mod tags {
    use super::Tag;

    pub const BARRIER_ENTER: Tag = -1;
    pub const BARRIER_RELEASE: Tag = -2;
    pub const GATHER: Tag = -3;
    pub const ABORT: Tag = -4;
}

/// Position of one rank inside the group
///
/// Immutable for the life of a rank and passed explicitly to everything
/// that needs to know who its ring neighbours are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    rank: usize,
    size: usize,
}

impl Topology {
    /// Create a topology, rejecting empty groups and out-of-range ranks
    pub fn new(rank: usize, size: usize) -> RingResult<Self> {
        if size == 0 || rank >= size {
            return Err(RingError::InvalidRank { peer: rank, size });
        }
        Ok(Self { rank, size })
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// The rank this one receives ring traffic from
    pub fn predecessor(&self) -> usize {
        (self.rank + self.size - 1) % self.size
    }

    /// The rank this one forwards ring traffic to
    pub fn successor(&self) -> usize {
        (self.rank + 1) % self.size
    }

    /// The last rank of the ring, which hands the envelope back to rank 0
    pub fn last_rank(&self) -> usize {
        self.size - 1
    }

    /// Rank 0 originates every traversal and aggregates every phase
    pub fn is_coordinator(&self) -> bool {
        self.rank == 0
    }

    /// Validate a peer index
    pub fn check_peer(&self, peer: usize) -> RingResult<()> {
        if peer >= self.size {
            return Err(RingError::InvalidRank {
                peer,
                size: self.size,
            });
        }
        Ok(())
    }
}

/// Unit of transfer between two ranks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    pub source: usize,
    pub tag: Tag,
    pub body: Body,
}

/// Payload carried by a [`Packet`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Body {
    /// Ring traffic: an envelope of integers
    Data(Vec<i32>),
    /// Collective traffic: opaque encoded bytes
    Collective(Vec<u8>),
    /// The sender terminated the run
    Abort(String),
}

impl Packet {
    pub fn data(source: usize, tag: Tag, buf: &[i32]) -> Self {
        Self {
            source,
            tag,
            body: Body::Data(buf.to_vec()),
        }
    }

    pub fn collective(source: usize, tag: Tag, bytes: Vec<u8>) -> Self {
        Self {
            source,
            tag,
            body: Body::Collective(bytes),
        }
    }

    pub fn abort(source: usize, reason: &str) -> Self {
        Self {
            source,
            tag: tags::ABORT,
            body: Body::Abort(reason.to_string()),
        }
    }

    /// Length as seen by a size probe: elements for data, bytes for collectives
    pub fn len(&self) -> usize {
        match &self.body {
            Body::Data(values) => values.len(),
            Body::Collective(bytes) => bytes.len(),
            Body::Abort(_) => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Blocking group-communication capability set consumed by the ring protocol
///
/// Every operation suspends the calling rank until it is satisfied. None of
/// them time out: a peer that disappears without aborting can stall the rank
/// forever, exactly like a blocked MPI call.
#[async_trait]
pub trait GroupComm: Send {
    /// Where this rank sits in the group
    fn topology(&self) -> Topology;

    /// Transport name for identification in logs and reports
    fn name(&self) -> &'static str;

    /// Send a copy of `buf` to `dest` under `tag`
    async fn send(&mut self, dest: usize, tag: Tag, buf: &[i32]) -> RingResult<()>;

    /// Receive the next message from `source` under `tag` into `buf`
    ///
    /// Returns the number of elements written. A message longer than `buf`
    /// fails with [`RingError::Truncated`].
    async fn receive(&mut self, source: usize, tag: Tag, buf: &mut [i32]) -> RingResult<usize>;

    /// Length of the next message from `source` under `tag`, without consuming it
    async fn probe_size(&mut self, source: usize, tag: Tag) -> RingResult<usize>;

    /// Block until every rank of the group has entered the barrier
    async fn barrier(&mut self) -> RingResult<()>;

    /// Collect one byte vector per rank at the coordinator
    ///
    /// Returns `Some` (indexed by rank) on rank 0 and `None` everywhere else.
    async fn gather(&mut self, bytes: Vec<u8>) -> RingResult<Option<Vec<Vec<u8>>>>;

    /// Tell every peer the run is over; delivery is best-effort
    async fn abort(&mut self, reason: &str);
}

/// Gather any serializable value to the coordinator
pub async fn gather_value<C, T>(comm: &mut C, value: &T) -> RingResult<Option<Vec<T>>>
where
    C: GroupComm + ?Sized,
    T: Serialize + DeserializeOwned + Sync,
{
    let bytes = bincode::serialize(value)?;
    match comm.gather(bytes).await? {
        Some(all) => {
            let values = all
                .iter()
                .map(|bytes| bincode::deserialize(bytes))
                .collect::<Result<Vec<T>, _>>()?;
            Ok(Some(values))
        }
        None => Ok(None),
    }
}

/// Delivery half of a transport: moves a packet to a remote rank's mailbox
#[async_trait]
pub trait Outbound: Send {
    async fn post(&mut self, dest: usize, packet: Packet) -> RingResult<()>;

    fn name(&self) -> &'static str;
}

/// A rank's view of the group, generic over how packets leave this rank
pub struct Group<O> {
    topology: Topology,
    mailbox: Mailbox,
    outbound: O,
}

impl<O: Outbound> Group<O> {
    pub fn new(topology: Topology, mailbox: Mailbox, outbound: O) -> Self {
        Self {
            topology,
            mailbox,
            outbound,
        }
    }

    async fn deliver(&mut self, dest: usize, packet: Packet) -> RingResult<()> {
        self.topology.check_peer(dest)?;
        if dest == self.topology.rank() {
            self.mailbox.push_local(packet);
            Ok(())
        } else {
            self.outbound.post(dest, packet).await
        }
    }

    async fn barrier_inner(&mut self) -> RingResult<()> {
        let rank = self.topology.rank();
        let size = self.topology.size();
        if size == 1 {
            return Ok(());
        }

        if self.topology.is_coordinator() {
            for peer in 1..size {
                self.mailbox.take(peer, tags::BARRIER_ENTER).await?;
            }
            for peer in 1..size {
                let release = Packet::collective(rank, tags::BARRIER_RELEASE, Vec::new());
                self.outbound.post(peer, release).await?;
            }
        } else {
            let enter = Packet::collective(rank, tags::BARRIER_ENTER, Vec::new());
            self.outbound.post(0, enter).await?;
            self.mailbox.take(0, tags::BARRIER_RELEASE).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl<O: Outbound> GroupComm for Group<O> {
    fn topology(&self) -> Topology {
        self.topology
    }

    fn name(&self) -> &'static str {
        self.outbound.name()
    }

    async fn send(&mut self, dest: usize, tag: Tag, buf: &[i32]) -> RingResult<()> {
        let packet = Packet::data(self.topology.rank(), tag, buf);
        self.deliver(dest, packet).await
    }

    async fn receive(&mut self, source: usize, tag: Tag, buf: &mut [i32]) -> RingResult<usize> {
        self.topology.check_peer(source)?;
        let packet = self.mailbox.take(source, tag).await?;
        let values = match packet.body {
            Body::Data(values) => values,
            Body::Collective(bytes) => {
                warn!(
                    "Rank {} expected data from rank {} but got a collective packet",
                    self.topology.rank(),
                    source
                );
                return Err(RingError::Truncated {
                    rank: self.topology.rank(),
                    source_rank: source,
                    incoming: bytes.len(),
                    capacity: 0,
                });
            }
            Body::Abort(reason) => {
                return Err(RingError::Aborted { by: source, reason });
            }
        };

        if values.len() > buf.len() {
            return Err(RingError::Truncated {
                rank: self.topology.rank(),
                source_rank: source,
                incoming: values.len(),
                capacity: buf.len(),
            });
        }
        buf[..values.len()].copy_from_slice(&values);
        Ok(values.len())
    }

    async fn probe_size(&mut self, source: usize, tag: Tag) -> RingResult<usize> {
        self.topology.check_peer(source)?;
        self.mailbox.probe(source, tag).await
    }

    async fn barrier(&mut self) -> RingResult<()> {
        let rank = self.topology.rank();
        match self.barrier_inner().await {
            Ok(()) => Ok(()),
            Err(err @ RingError::Aborted { .. }) => Err(err),
            Err(err) => Err(RingError::BarrierFailed {
                rank,
                reason: err.to_string(),
            }),
        }
    }

    async fn gather(&mut self, bytes: Vec<u8>) -> RingResult<Option<Vec<Vec<u8>>>> {
        let rank = self.topology.rank();
        if !self.topology.is_coordinator() {
            let packet = Packet::collective(rank, tags::GATHER, bytes);
            self.outbound.post(0, packet).await?;
            return Ok(None);
        }

        let mut all = Vec::with_capacity(self.topology.size());
        all.push(bytes);
        for peer in 1..self.topology.size() {
            let packet = self.mailbox.take(peer, tags::GATHER).await?;
            match packet.body {
                Body::Collective(bytes) => all.push(bytes),
                Body::Data(values) => {
                    return Err(RingError::Truncated {
                        rank,
                        source_rank: peer,
                        incoming: values.len(),
                        capacity: 0,
                    })
                }
                Body::Abort(reason) => return Err(RingError::Aborted { by: peer, reason }),
            }
        }
        Ok(Some(all))
    }

    async fn abort(&mut self, reason: &str) {
        let rank = self.topology.rank();
        for peer in (0..self.topology.size()).filter(|&p| p != rank) {
            if let Err(e) = self.outbound.post(peer, Packet::abort(rank, reason)).await {
                debug!("Abort notice from rank {} to rank {} not delivered: {}", rank, peer, e);
            }
        }
    }
}
