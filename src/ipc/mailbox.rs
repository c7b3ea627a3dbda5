//! Per-rank inbox with `(source, tag)` matching.
//!
//! Packets arrive in per-sender order on a single channel. Anything that does
//! not match the receive currently posted is parked in `pending` until a later
//! receive or probe asks for it. An abort packet from any rank poisons the
//! mailbox: every blocked and future operation fails with `Aborted`.

use super::{Body, Packet, Tag};
use crate::error::{RingError, RingResult};
use std::collections::VecDeque;
use tokio::sync::mpsc;
use tracing::{debug, trace};

pub struct Mailbox {
    rank: usize,
    inbox: mpsc::UnboundedReceiver<Packet>,
    pending: VecDeque<Packet>,
    aborted: Option<(usize, String)>,
}

impl Mailbox {
    pub fn new(rank: usize, inbox: mpsc::UnboundedReceiver<Packet>) -> Self {
        Self {
            rank,
            inbox,
            pending: VecDeque::new(),
            aborted: None,
        }
    }

    /// Deliver a packet this rank sent to itself
    pub fn push_local(&mut self, packet: Packet) {
        self.pending.push_back(packet);
    }

    /// Number of parked packets
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Length of the next matching packet, leaving it in place
    pub async fn probe(&mut self, source: usize, tag: Tag) -> RingResult<usize> {
        let index = self.wait_for(source, tag).await?;
        Ok(self.pending[index].len())
    }

    /// Remove and return the next matching packet
    pub async fn take(&mut self, source: usize, tag: Tag) -> RingResult<Packet> {
        let index = self.wait_for(source, tag).await?;
        self.pending
            .remove(index)
            .ok_or(RingError::Disconnected { rank: self.rank })
    }

    fn check_aborted(&self) -> RingResult<()> {
        match &self.aborted {
            Some((by, reason)) => Err(RingError::Aborted {
                by: *by,
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    fn position(&self, source: usize, tag: Tag) -> Option<usize> {
        self.pending
            .iter()
            .position(|p| p.source == source && p.tag == tag)
    }

    async fn wait_for(&mut self, source: usize, tag: Tag) -> RingResult<usize> {
        loop {
            self.check_aborted()?;
            if let Some(index) = self.position(source, tag) {
                return Ok(index);
            }

            let packet = self
                .inbox
                .recv()
                .await
                .ok_or(RingError::Disconnected { rank: self.rank })?;

            if let Body::Abort(reason) = &packet.body {
                debug!(
                    "Rank {} received abort from rank {}: {}",
                    self.rank, packet.source, reason
                );
                self.aborted = Some((packet.source, reason.clone()));
                continue;
            }

            trace!(
                "Rank {} parked packet from rank {} tag {} ({} elements)",
                self.rank,
                packet.source,
                packet.tag,
                packet.len()
            );
            self.pending.push_back(packet);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mailbox() -> (mpsc::UnboundedSender<Packet>, Mailbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Mailbox::new(1, rx))
    }

    #[tokio::test]
    async fn test_take_matches_source_and_tag() {
        let (tx, mut mb) = mailbox();
        tx.send(Packet::data(2, 5, &[1])).unwrap();
        tx.send(Packet::data(0, 7, &[2, 2])).unwrap();
        tx.send(Packet::data(0, 5, &[3, 3, 3])).unwrap();

        let packet = mb.take(0, 5).await.unwrap();
        assert_eq!(packet.body, Body::Data(vec![3, 3, 3]));
        assert_eq!(mb.pending_len(), 2);

        let packet = mb.take(2, 5).await.unwrap();
        assert_eq!(packet.body, Body::Data(vec![1]));
    }

    #[tokio::test]
    async fn test_probe_does_not_consume() {
        let (tx, mut mb) = mailbox();
        tx.send(Packet::data(0, 5, &[9; 16])).unwrap();

        assert_eq!(mb.probe(0, 5).await.unwrap(), 16);
        assert_eq!(mb.probe(0, 5).await.unwrap(), 16);
        assert_eq!(mb.take(0, 5).await.unwrap().len(), 16);
        assert_eq!(mb.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_same_pair_is_fifo() {
        let (tx, mut mb) = mailbox();
        tx.send(Packet::data(0, 5, &[1])).unwrap();
        tx.send(Packet::data(0, 5, &[2])).unwrap();

        assert_eq!(mb.take(0, 5).await.unwrap().body, Body::Data(vec![1]));
        assert_eq!(mb.take(0, 5).await.unwrap().body, Body::Data(vec![2]));
    }

    #[tokio::test]
    async fn test_abort_poisons_mailbox() {
        let (tx, mut mb) = mailbox();
        tx.send(Packet::abort(3, "size mismatch")).unwrap();

        match mb.take(0, 5).await {
            Err(RingError::Aborted { by, reason }) => {
                assert_eq!(by, 3);
                assert_eq!(reason, "size mismatch");
            }
            other => panic!("expected abort, got {:?}", other),
        }
        assert!(mb.probe(0, 5).await.is_err());
    }

    #[tokio::test]
    async fn test_closed_inbox_is_disconnect() {
        let (tx, mut mb) = mailbox();
        drop(tx);
        assert!(matches!(
            mb.take(0, 5).await,
            Err(RingError::Disconnected { rank: 1 })
        ));
    }

    #[tokio::test]
    async fn test_local_push_is_matched() {
        let (_tx, mut mb) = mailbox();
        mb.push_local(Packet::data(1, 5, &[4, 5, 6]));
        assert_eq!(mb.probe(1, 5).await.unwrap(), 3);
    }
}
