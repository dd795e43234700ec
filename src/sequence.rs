//! Sequence number virtualization.
//!
//! Every packet the proxy injects takes a sequence number in its
//! direction. Real traffic is shifted past those numbers on the way
//! through, and acks coming back are shifted the other way, so that
//! neither peer can tell anything was added.

use crate::{
    ack_ledger::{AckLedger, AckOutcome},
    protocol::{message::PacketAck, Message, Packet},
};

/// Number of maintenance ticks between compactions.
const COMPACTION_INTERVAL: u32 = 60;

/// Direction of travel through a relay.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, strum::Display, strum::AsRefStr)]
pub enum Direction {
    /// Simulator to client.
    Incoming,
    /// Client to simulator.
    Outgoing,
}

impl Direction {
    pub fn opposite(self) -> Self {
        match self {
            Direction::Incoming => Direction::Outgoing,
            Direction::Outgoing => Direction::Incoming,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SequenceError {
    #[error("{direction} packet acks injected sequence {id}, which was never owed an ack")]
    UnissuedAck { id: u32, direction: Direction },
}

/// Sequence state for one direction.
#[derive(Debug, Default)]
struct SequenceSpace {
    /// Highest sequence number emitted so far.
    highest: u32,
    /// Numbers taken by injected packets, ascending.
    injections: Vec<u32>,
    /// Count of injections already folded out of `injections`.
    offset: u32,
    injections_checkpoint: usize,
    /// Reliable packets the proxy sent in this direction and
    /// therefore must see acked itself.
    ledger: AckLedger,
}

impl SequenceSpace {
    /// Maps a peer-assigned sequence number to the number emitted.
    fn forward(&self, sequence: u32) -> u32 {
        let mut translated = sequence.wrapping_add(self.offset);
        for &injection in &self.injections {
            if translated >= injection {
                translated = translated.wrapping_add(1);
            }
        }
        translated
    }

    /// Inverse of [`SequenceSpace::forward`] for any number that is
    /// not itself an injection.
    fn reverse(&self, id: u32) -> u32 {
        let skipped = self.injections.partition_point(|&injection| injection < id);
        id.wrapping_sub(skipped as u32).wrapping_sub(self.offset)
    }

    fn allocate(&mut self) -> u32 {
        self.highest = self.highest.wrapping_add(1);
        self.injections.push(self.highest);
        self.highest
    }

    /// Returns `true` if the ack was for a packet the proxy sent,
    /// meaning it must not be forwarded.
    fn settle(&mut self, id: u32, direction: Direction) -> Result<bool, SequenceError> {
        match self.ledger.acknowledge(id) {
            AckOutcome::Matched | AckOutcome::Duplicate => Ok(true),
            AckOutcome::NotOwed if self.injections.binary_search(&id).is_ok() => {
                Err(SequenceError::UnissuedAck { id, direction })
            }
            AckOutcome::NotOwed => Ok(false),
        }
    }

    fn compact(&mut self) {
        let settled = self.injections_checkpoint.min(self.injections.len());
        self.injections.drain(..settled);
        self.offset = self.offset.wrapping_add(settled as u32);
        self.injections_checkpoint = self.injections.len();
        self.ledger.prune();
    }
}

/// Packets due for retransmission, per direction.
#[derive(Debug, Default)]
pub struct Retransmissions {
    pub incoming: Vec<Packet>,
    pub outgoing: Vec<Packet>,
}

/// Sequence translation state of one relay.
#[derive(Debug, Default)]
pub struct SequenceTranslator {
    incoming: SequenceSpace,
    outgoing: SequenceSpace,
    ticks: u32,
}

impl SequenceTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    fn space(&self, direction: Direction) -> &SequenceSpace {
        match direction {
            Direction::Incoming => &self.incoming,
            Direction::Outgoing => &self.outgoing,
        }
    }

    fn space_mut(&mut self, direction: Direction) -> &mut SequenceSpace {
        match direction {
            Direction::Incoming => &mut self.incoming,
            Direction::Outgoing => &mut self.outgoing,
        }
    }

    /// Gives `packet` the next sequence number in `direction` and,
    /// if it is reliable, starts waiting for its ack.
    pub fn inject(&mut self, packet: &mut Packet, direction: Direction) {
        let space = self.space_mut(direction);
        packet.header.sequence = space.allocate();
        tracing::debug!(
            "Inject {direction} {} #{}",
            packet.kind(),
            packet.sequence()
        );
        if packet.is_reliable() {
            space.ledger.register(packet.clone());
        }
    }

    /// Waits for an ack of a packet that became reliable on its way
    /// through the proxy. `packet` must already be translated.
    pub fn wait_for_ack(&mut self, packet: &Packet, direction: Direction) {
        self.space_mut(direction).ledger.register(packet.clone());
    }

    /// Removes acks the proxy itself is owed from a packet travelling
    /// in `direction`, both from a `PacketAck` body and from the
    /// appended ack list. Must run before [`SequenceTranslator::translate`].
    pub fn check_acks(
        &mut self,
        mut packet: Packet,
        direction: Direction,
    ) -> Result<Packet, SequenceError> {
        let owed = self.space_mut(direction.opposite());
        if owed.ledger.is_idle() && owed.injections.is_empty() {
            return Ok(packet);
        }

        let mut replacement = None;
        if let Message::PacketAck(ack) = &packet.message {
            let mut kept = Vec::with_capacity(ack.packets.len());
            for &id in &ack.packets {
                if !owed.settle(id, direction)? {
                    kept.push(id);
                }
            }
            if kept.len() != ack.packets.len() {
                let mut rebuilt = Packet::new(PacketAck { packets: kept });
                rebuilt.carry_header_from(&packet);
                replacement = Some(rebuilt);
            }
        }
        if let Some(rebuilt) = replacement {
            packet = rebuilt;
        }

        if packet.header.has_acks() {
            let mut kept = Vec::with_capacity(packet.header.acks.len());
            for &id in &packet.header.acks {
                if !owed.settle(id, direction)? {
                    kept.push(id);
                }
            }
            packet.header.set_acks(kept);
        }

        Ok(packet)
    }

    /// Rewrites the sequence number of a packet travelling in
    /// `direction` and the ack IDs it carries.
    pub fn translate(&mut self, packet: &mut Packet, direction: Direction) {
        let ours = self.space_mut(direction);
        let translated = ours.forward(packet.sequence());
        if translated != packet.sequence() {
            tracing::debug!(
                "Translate {direction} {} #{} = {translated}",
                packet.kind(),
                packet.sequence()
            );
        }
        packet.header.sequence = translated;
        if translated > ours.highest {
            ours.highest = translated;
        }

        let theirs = self.space(direction.opposite());
        if theirs.offset == 0 && theirs.injections.is_empty() {
            return;
        }
        for id in &mut packet.header.acks {
            *id = theirs.reverse(*id);
        }
        if let Message::PacketAck(ack) = &mut packet.message {
            for id in &mut ack.packets {
                *id = theirs.reverse(*id);
            }
        }
    }

    /// One maintenance tick: every [`COMPACTION_INTERVAL`] ticks folds
    /// settled injections into the offset and prunes seen acks;
    /// every tick returns the packets still awaiting an ack.
    pub fn tick(&mut self) -> Retransmissions {
        self.ticks = (self.ticks + 1) % COMPACTION_INTERVAL;
        if self.ticks == 0 {
            self.incoming.compact();
            self.outgoing.compact();
        }
        Retransmissions {
            incoming: self.incoming.ledger.retransmissions(),
            outgoing: self.outgoing.ledger.retransmissions(),
        }
    }

    /// Number of reliable packets awaiting an ack in `direction`.
    pub fn pending_acks(&self, direction: Direction) -> usize {
        self.space(direction).ledger.pending_len()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::ChatFromViewer;

    fn chat(sequence: u32) -> Packet {
        let mut packet = Packet::new(ChatFromViewer {
            ignored_data: Vec::new(),
        })
        .reliable();
        packet.header.sequence = sequence;
        packet
    }

    fn relay(translator: &mut SequenceTranslator, packet: Packet, direction: Direction) -> Packet {
        let mut packet = translator.check_acks(packet, direction).unwrap();
        translator.translate(&mut packet, direction);
        packet
    }

    #[test]
    fn injection_shifts_following_traffic() {
        let mut translator = SequenceTranslator::new();
        for sequence in 1..=4 {
            assert_eq!(
                relay(&mut translator, chat(sequence), Direction::Outgoing).sequence(),
                sequence
            );
        }

        let mut injected = chat(0);
        translator.inject(&mut injected, Direction::Outgoing);
        assert_eq!(injected.sequence(), 5);

        let forwarded = relay(&mut translator, chat(5), Direction::Outgoing);
        assert_eq!(forwarded.sequence(), 6);

        let ack = relay(&mut translator, Packet::ack(vec![6]), Direction::Incoming);
        assert_eq!(
            ack.message,
            Message::PacketAck(PacketAck { packets: vec![5] })
        );
    }

    #[test]
    fn acks_of_injected_packets_are_swallowed() {
        let mut translator = SequenceTranslator::new();
        let mut injected = chat(0);
        translator.inject(&mut injected, Direction::Incoming);
        assert_eq!(translator.pending_acks(Direction::Incoming), 1);

        let mut reply = chat(1);
        reply.header.set_acks(vec![injected.sequence()]);
        let reply = relay(&mut translator, reply, Direction::Outgoing);
        assert!(reply.header.acks.is_empty());
        assert!(!reply.header.has_acks());
        assert_eq!(translator.pending_acks(Direction::Incoming), 0);

        // The peer may repeat an ack; it is swallowed again.
        let again = relay(&mut translator, Packet::ack(vec![1]), Direction::Outgoing);
        assert_eq!(
            again.message,
            Message::PacketAck(PacketAck {
                packets: Vec::new()
            })
        );
    }

    #[test]
    fn unowed_ack_of_injection_is_an_error() {
        let mut translator = SequenceTranslator::new();
        let mut injected = Packet::new(ChatFromViewer {
            ignored_data: Vec::new(),
        });
        translator.inject(&mut injected, Direction::Outgoing);

        let result = translator.check_acks(Packet::ack(vec![1]), Direction::Incoming);
        assert!(matches!(
            result,
            Err(SequenceError::UnissuedAck {
                id: 1,
                direction: Direction::Incoming
            })
        ));
    }

    #[test]
    fn retransmissions_stop_after_ack() {
        let mut translator = SequenceTranslator::new();
        let mut injected = chat(0);
        translator.inject(&mut injected, Direction::Outgoing);

        for _ in 0..3 {
            let due = translator.tick();
            assert_eq!(due.outgoing.len(), 1);
            assert_eq!(due.outgoing[0].sequence(), injected.sequence());
            assert!(due.incoming.is_empty());
        }

        relay(&mut translator, Packet::ack(vec![1]), Direction::Incoming);
        assert!(translator.tick().outgoing.is_empty());
    }

    #[test]
    fn maximum_sequence_passes_through() {
        let mut translator = SequenceTranslator::new();
        let forwarded = relay(&mut translator, chat(u32::MAX), Direction::Incoming);
        assert_eq!(forwarded.sequence(), u32::MAX);
    }

    #[test]
    fn compaction_preserves_translation() {
        let mut translator = SequenceTranslator::new();
        relay(&mut translator, chat(1), Direction::Outgoing);
        let mut injected = chat(0);
        translator.inject(&mut injected, Direction::Outgoing);
        relay(&mut translator, Packet::ack(vec![2]), Direction::Incoming);

        for _ in 0..COMPACTION_INTERVAL * 2 {
            translator.tick();
        }
        assert!(translator.outgoing.injections.is_empty());
        assert_eq!(translator.outgoing.offset, 1);

        let forwarded = relay(&mut translator, chat(2), Direction::Outgoing);
        assert_eq!(forwarded.sequence(), 3);
        let ack = relay(&mut translator, Packet::ack(vec![3]), Direction::Incoming);
        assert_eq!(
            ack.message,
            Message::PacketAck(PacketAck { packets: vec![2] })
        );
    }

    /// Small deterministic generator so the sweep is reproducible.
    struct Lcg(u64);

    impl Lcg {
        fn next(&mut self) -> u32 {
            self.0 = self
                .0
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            (self.0 >> 33) as u32
        }
    }

    fn index(direction: Direction) -> usize {
        match direction {
            Direction::Incoming => 0,
            Direction::Outgoing => 1,
        }
    }

    /// Injections and real traffic interleaved in both directions.
    /// Emitted numbers stay gapless and unique, and every ack of a
    /// real packet maps back to the number its sender assigned.
    #[test]
    fn interleaved_traffic_sweep() {
        for seed in 0..64 {
            let mut rng = Lcg(seed);
            let mut translator = SequenceTranslator::new();
            let mut next_real = [1u32; 2];
            let mut delivered: [Vec<u32>; 2] = Default::default();
            // (emitted number, number the sender assigned if real)
            let mut unacked: [Vec<(u32, Option<u32>)>; 2] = Default::default();

            let mut send_real = |translator: &mut SequenceTranslator,
                                 direction: Direction,
                                 standalone: bool,
                                 delivered: &mut [Vec<u32>; 2],
                                 unacked: &mut [Vec<(u32, Option<u32>)>; 2]| {
                let i = index(direction);
                let acked = std::mem::take(&mut unacked[index(direction.opposite())]);
                let ids: Vec<u32> = acked.iter().map(|&(emitted, _)| emitted).collect();
                let expected: Vec<u32> = acked.iter().filter_map(|&(_, real)| real).collect();

                let mut packet = if standalone {
                    Packet::ack(ids)
                } else {
                    let mut packet = chat(0);
                    packet.header.set_acks(ids);
                    packet
                };
                let sequence = next_real[i];
                next_real[i] += 1;
                packet.header.sequence = sequence;

                let packet = relay(translator, packet, direction);
                delivered[i].push(packet.sequence());
                match &packet.message {
                    Message::PacketAck(ack) => assert_eq!(ack.packets, expected, "seed {seed}"),
                    _ => {
                        assert_eq!(packet.header.acks, expected, "seed {seed}");
                        unacked[i].push((packet.sequence(), Some(sequence)));
                    }
                }
            };

            for _ in 0..400 {
                let direction = if rng.next() % 2 == 0 {
                    Direction::Incoming
                } else {
                    Direction::Outgoing
                };
                match rng.next() % 8 {
                    0 | 1 => {
                        let mut injected = chat(0);
                        translator.inject(&mut injected, direction);
                        delivered[index(direction)].push(injected.sequence());
                        unacked[index(direction)].push((injected.sequence(), None));
                    }
                    2 => {
                        for direction in [Direction::Incoming, Direction::Outgoing] {
                            if !unacked[index(direction.opposite())].is_empty() {
                                send_real(&mut translator, direction, true, &mut delivered, &mut unacked);
                            }
                        }
                        for _ in 0..25 {
                            translator.tick();
                        }
                    }
                    _ => send_real(&mut translator, direction, false, &mut delivered, &mut unacked),
                }
            }

            for numbers in &mut delivered {
                numbers.sort_unstable();
                let expected: Vec<u32> = (1..=numbers.len() as u32).collect();
                assert_eq!(*numbers, expected, "seed {seed}");
            }
        }
    }
}
