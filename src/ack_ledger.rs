//! Bookkeeping for reliable packets the proxy is responsible for.

use crate::protocol::{Packet, PacketFlags};
use std::collections::{BTreeMap, VecDeque};

/// Result of feeding an ack ID to an [`AckLedger`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    /// The ID settled a pending packet.
    Matched,
    /// The ID settled a packet earlier and has not been pruned yet.
    Duplicate,
    /// The ledger never waited on this ID.
    NotOwed,
}

/// Reliable packets in one direction that are awaiting an ack from
/// the peer, plus the IDs acked recently.
///
/// Satisfied IDs stay in `seen` across one maintenance interval so
/// that duplicate acks are still recognised, then get pruned.
#[derive(Debug, Default)]
pub struct AckLedger {
    pending: BTreeMap<u32, Packet>,
    seen: VecDeque<u32>,
    /// Number of `seen` entries recorded before the last prune.
    seen_checkpoint: usize,
}

impl AckLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts waiting for an ack of `packet`, keyed by its
    /// (already translated) sequence number.
    pub fn register(&mut self, packet: Packet) {
        self.pending.insert(packet.sequence(), packet);
    }

    pub fn acknowledge(&mut self, id: u32) -> AckOutcome {
        if self.pending.remove(&id).is_some() {
            self.seen.push_back(id);
            AckOutcome::Matched
        } else if self.seen.contains(&id) {
            AckOutcome::Duplicate
        } else {
            AckOutcome::NotOwed
        }
    }

    /// Returns `true` if there is nothing to match acks against.
    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.seen.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Copies of every packet still awaiting an ack, flagged as
    /// resent. Sequence numbers are left untouched.
    pub fn retransmissions(&mut self) -> Vec<Packet> {
        self.pending
            .values_mut()
            .map(|packet| {
                packet.header.flags.insert(PacketFlags::RESENT);
                packet.clone()
            })
            .collect()
    }

    /// Forgets IDs that were acked before the previous prune.
    pub fn prune(&mut self) {
        let stale = self.seen_checkpoint.min(self.seen.len());
        self.seen.drain(..stale);
        self.seen_checkpoint = self.seen.len();
    }
}
