use crate::relay::EndpointRelay;
use ahash::AHashMap;
use std::net::SocketAddr;

/// Relays keyed by the real simulator endpoint they front, plus the
/// circuit the client is currently using.
#[derive(Default)]
pub(crate) struct RelayDirectory {
    relays: AHashMap<SocketAddr, EndpointRelay>,
    active: Option<SocketAddr>,
}

impl RelayDirectory {
    pub fn get(&self, real: SocketAddr) -> Option<&EndpointRelay> {
        self.relays.get(&real)
    }

    pub fn get_mut(&mut self, real: SocketAddr) -> Option<&mut EndpointRelay> {
        self.relays.get_mut(&real)
    }

    pub fn insert(&mut self, relay: EndpointRelay) {
        self.relays.insert(relay.real_addr(), relay);
    }

    pub fn active(&self) -> Option<SocketAddr> {
        self.active
    }

    pub fn set_active(&mut self, real: SocketAddr) {
        if self.active != Some(real) {
            tracing::info!("Active circuit is now {real}");
        }
        self.active = Some(real);
    }

    /// Starts a fresh session on every relay. Sockets stay bound so
    /// addresses already handed to the client keep working.
    pub fn reset(&mut self) {
        for relay in self.relays.values_mut() {
            relay.reset();
        }
        self.active = None;
    }
}
