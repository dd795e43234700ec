//! Per-message packet filters.

use crate::{
    protocol::{MessageKind, Packet},
    sequence::Direction,
};
use ahash::AHashMap;
use std::{
    net::SocketAddr,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

/// What a filter wants done with a packet.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Pass the packet on unchanged.
    Forward,
    /// Pass this packet on instead. It must be the same kind of
    /// message; the sequence number and acks of the original are
    /// kept regardless.
    Replace(Packet),
    /// Suppress the packet.
    Drop,
}

/// A filter sees the packet and the real simulator endpoint of the
/// relay carrying it.
pub type PacketFilter = Arc<dyn Fn(&Packet, SocketAddr) -> anyhow::Result<Verdict> + Send + Sync>;

/// Handle for removing a filter.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct FilterId(u64);

/// Filters keyed by message kind and direction, run in the order
/// they were added.
#[derive(Default)]
pub struct FilterRegistry {
    filters: AHashMap<(MessageKind, Direction), Vec<(FilterId, PacketFilter)>>,
    next_id: u64,
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<F>(&mut self, kind: MessageKind, direction: Direction, filter: F) -> FilterId
    where
        F: Fn(&Packet, SocketAddr) -> anyhow::Result<Verdict> + Send + Sync + 'static,
    {
        let id = FilterId(self.next_id);
        self.next_id += 1;
        self.filters
            .entry((kind, direction))
            .or_default()
            .push((id, Arc::new(filter) as PacketFilter));
        id
    }

    /// Returns `false` if no filter had this id.
    pub fn remove(&mut self, id: FilterId) -> bool {
        let mut removed = false;
        self.filters.retain(|_, chain| {
            let before = chain.len();
            chain.retain(|(filter_id, _)| *filter_id != id);
            removed |= chain.len() != before;
            !chain.is_empty()
        });
        removed
    }

    pub fn has_filters(&self, kind: MessageKind, direction: Direction) -> bool {
        self.filters.contains_key(&(kind, direction))
    }

    /// Runs the chain for the packet's kind. Returns `None` if a
    /// filter suppressed it.
    ///
    /// A filter that fails or panics is logged and treated as
    /// forwarding the packet unchanged. A replacement of a different
    /// kind is rejected and ends the chain.
    pub fn apply(&self, packet: Packet, direction: Direction, remote: SocketAddr) -> Option<Packet> {
        let kind = packet.kind();
        let Some(chain) = self.filters.get(&(kind, direction)) else {
            return Some(packet);
        };

        let mut current = packet;
        for (id, filter) in chain {
            let verdict = panic::catch_unwind(AssertUnwindSafe(|| filter(&current, remote)));
            match verdict {
                Ok(Ok(Verdict::Forward)) => {}
                Ok(Ok(Verdict::Replace(replacement))) => {
                    if replacement.kind() != kind {
                        tracing::error!(
                            "Filter {id:?} replaced {direction} {kind} with {}; keeping {kind}",
                            replacement.kind()
                        );
                        break;
                    }
                    current = replacement;
                }
                Ok(Ok(Verdict::Drop)) => return None,
                Ok(Err(e)) => tracing::error!("Filter {id:?} on {direction} {kind} failed: {e:#}"),
                Err(_) => tracing::error!("Filter {id:?} on {direction} {kind} panicked"),
            }
        }
        Some(current)
    }
}
