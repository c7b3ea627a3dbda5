//! In-process transport: every rank is a task, every link is an mpsc channel.

use super::{Group, Mailbox, Outbound, Packet, Topology};
use crate::error::{RingError, RingResult};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Senders into every rank's mailbox
pub struct LocalOutbound {
    rank: usize,
    peers: Vec<mpsc::UnboundedSender<Packet>>,
}

#[async_trait]
impl Outbound for LocalOutbound {
    async fn post(&mut self, dest: usize, packet: Packet) -> RingResult<()> {
        self.peers[dest]
            .send(packet)
            .map_err(|_| RingError::Disconnected { rank: self.rank })
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

/// One rank of an in-process group
pub type LocalComm = Group<LocalOutbound>;

/// Build a fully connected in-process group of `size` ranks
///
/// The returned vector is indexed by rank; hand each element to the task that
/// plays that rank.
pub fn local_group(size: usize) -> RingResult<Vec<LocalComm>> {
    if size == 0 {
        return Err(RingError::InvalidRank { peer: 0, size });
    }

    let (senders, receivers): (Vec<_>, Vec<_>) =
        (0..size).map(|_| mpsc::unbounded_channel::<Packet>()).unzip();

    receivers
        .into_iter()
        .enumerate()
        .map(|(rank, inbox)| {
            let topology = Topology::new(rank, size)?;
            let outbound = LocalOutbound {
                rank,
                peers: senders.clone(),
            };
            Ok(Group::new(topology, Mailbox::new(rank, inbox), outbound))
        })
        .collect()
}
