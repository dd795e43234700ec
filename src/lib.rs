//! Man-in-the-middle proxy for the Second Life viewer protocol.
//!
//! The client is pointed at the proxy's login URI. The proxy forwards
//! the login to the real grid and rewrites the reply so the client
//! connects to a local relay instead of the simulator, and fetches
//! capabilities through the proxy instead of from the simulator.
//!
//! # Relaying
//! Every simulator the client learns about, from the login reply,
//! from region-change messages or from event queue events, gets its
//! own relay: a UDP socket the client talks to, paired with one that
//! talks to the simulator. Packets are decoded in full, passed
//! through any registered filters and re-encoded.
//!
//! Filters may drop or replace packets, and plugins may inject new
//! ones. The relays keep both peers consistent by renumbering
//! sequence numbers around injected packets and by acking or
//! resending on behalf of the proxy where a peer would otherwise
//! notice a packet went missing.
//!
//! # Capabilities
//! Capability URLs are rewritten to `{base}{real url}`. Requests to
//! those URLs are forwarded to the real URL. LLSD bodies of known
//! capabilities can be inspected and rewritten by interceptors; the
//! seed capability and event queue are intercepted by the proxy
//! itself to keep addresses pointing at relays.

mod ack_ledger;
mod address_rewrite;
pub mod analyst;
pub mod caps;
mod caps_relay;
pub mod config;
mod directory;
mod event_queue;
pub mod filter;
mod gateway;
pub mod llsd;
pub mod login;
pub mod protocol;
mod proxy;
mod relay;
pub mod sequence;
mod xml;

pub use caps::{CapabilityRecord, CapsExchange, CapsStage, InterceptorId};
pub use config::ProxyConfig;
pub use filter::{FilterId, Verdict};
pub use protocol::{MessageKind, Packet};
pub use proxy::Proxy;
pub use relay::RelayError;
pub use sequence::Direction;
