//! Per-simulator UDP relays.
//!
//! Each relay owns a client-facing socket, which the client treats
//! as the simulator, and a simulator-facing socket. Received
//! datagrams are decoded and processed under the session lock; the
//! results are handed to writer tasks over channels so the lock is
//! never held across a socket write.

use crate::{
    address_rewrite,
    config::ProxyConfig,
    protocol::{Packet, MAX_DATAGRAM_SIZE},
    proxy::{Session, Shared},
    sequence::{Direction, SequenceError, SequenceTranslator},
};
use std::{
    io,
    net::SocketAddr,
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::{
    net::UdpSocket,
    task,
    time::{self, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

/// How often unacked packets are resent and injection bookkeeping
/// is compacted.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(1);

type Datagram = (Vec<u8>, SocketAddr);

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("no relay for simulator {0}")]
    UnknownRelay(SocketAddr),
    #[error(transparent)]
    Sequence(#[from] SequenceError),
}

pub(crate) struct EndpointRelay {
    real: SocketAddr,
    local: SocketAddr,
    pub(crate) translator: SequenceTranslator,
    /// Source address of the client, learned from its first datagram.
    client: Option<SocketAddr>,
    first_receive: bool,
    to_client: flume::Sender<Datagram>,
    to_server: flume::Sender<Datagram>,
}

/// Socket halves of a relay, handed to its tasks by [`spawn`].
pub(crate) struct RelaySockets {
    client: Arc<UdpSocket>,
    server: Arc<UdpSocket>,
    to_client: flume::Receiver<Datagram>,
    to_server: flume::Receiver<Datagram>,
}

impl EndpointRelay {
    /// Binds both sockets of a relay for `real`. Must be called from
    /// within the Tokio runtime.
    pub fn bind(real: SocketAddr, config: &ProxyConfig) -> anyhow::Result<(Self, RelaySockets)> {
        let client = bind_udp(SocketAddr::from((config.client_facing_address, 0)))?;
        let server = bind_remote(config)?;
        let local = client.local_addr()?;
        let (to_client, client_queue) = flume::unbounded();
        let (to_server, server_queue) = flume::unbounded();

        let relay = Self {
            real,
            local,
            translator: SequenceTranslator::new(),
            client: None,
            first_receive: true,
            to_client,
            to_server,
        };
        let sockets = RelaySockets {
            client,
            server,
            to_client: client_queue,
            to_server: server_queue,
        };
        Ok((relay, sockets))
    }

    pub fn real_addr(&self) -> SocketAddr {
        self.real
    }

    /// Address the client should use in place of the simulator.
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn reset(&mut self) {
        self.translator.reset();
        self.first_receive = true;
    }

    /// Records where the client sends from. Returns `true` for the
    /// first datagram since the relay was created or reset.
    pub fn note_client(&mut self, from: SocketAddr) -> bool {
        self.client = Some(from);
        std::mem::replace(&mut self.first_receive, false)
    }

    /// Sequences and sends a packet the proxy originates. Incoming
    /// injections are refused with the packet until the client has
    /// been heard from.
    pub fn inject(&mut self, mut packet: Packet, direction: Direction) -> Result<(), Packet> {
        if direction == Direction::Incoming && self.first_receive {
            return Err(packet);
        }
        self.translator.inject(&mut packet, direction);
        self.send(&packet, direction);
        Ok(())
    }

    /// Acks `sequence` back to the sender of a packet that travelled
    /// in `direction`, on behalf of its receiver.
    fn spoof_ack(&mut self, sequence: u32, direction: Direction) {
        tracing::debug!("Spoofing ack of {direction} #{sequence}");
        if self.inject(Packet::ack(vec![sequence]), direction.opposite()).is_err() {
            tracing::debug!("Relay {} has no client; ack of #{sequence} not sent", self.real);
        }
    }

    pub fn send(&self, packet: &Packet, direction: Direction) {
        let (queue, to) = match direction {
            Direction::Outgoing => (&self.to_server, self.real),
            Direction::Incoming => match self.client {
                Some(client) => (&self.to_client, client),
                None => {
                    tracing::debug!(
                        "Relay {} has no client yet; dropping {}",
                        self.real,
                        packet.kind()
                    );
                    return;
                }
            },
        };
        if queue.send((packet.encode(), to)).is_err() {
            tracing::debug!("Relay {} is shut down", self.real);
        }
    }
}

fn bind_udp(address: SocketAddr) -> io::Result<Arc<UdpSocket>> {
    let socket = std::net::UdpSocket::bind(address)?;
    socket.set_nonblocking(true)?;
    Ok(Arc::new(UdpSocket::from_std(socket)?))
}

fn bind_remote(config: &ProxyConfig) -> anyhow::Result<Arc<UdpSocket>> {
    let Some(range) = config.remote_port_range else {
        return Ok(bind_udp(SocketAddr::from((config.remote_facing_address, 0)))?);
    };
    for port in range.ports() {
        match bind_udp(SocketAddr::from((config.remote_facing_address, port))) {
            Ok(socket) => return Ok(socket),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => continue,
            Err(e) => return Err(e.into()),
        }
    }
    anyhow::bail!("no free port in {}-{}", range.first, range.last)
}

/// Starts the tasks of a relay. They stop when `cancel` fires or the
/// proxy is dropped.
pub(crate) fn spawn(sockets: RelaySockets, real: SocketAddr, shared: Weak<Shared>, cancel: CancellationToken) {
    let RelaySockets {
        client,
        server,
        to_client,
        to_server,
    } = sockets;

    task::spawn(write_datagrams(Arc::clone(&client), to_client, cancel.clone()));
    task::spawn(write_datagrams(Arc::clone(&server), to_server, cancel.clone()));
    task::spawn(receive(client, real, Direction::Outgoing, shared.clone(), cancel.clone()));
    task::spawn(receive(server, real, Direction::Incoming, shared.clone(), cancel.clone()));
    task::spawn(maintain(real, shared, cancel));
}

async fn write_datagrams(socket: Arc<UdpSocket>, queue: flume::Receiver<Datagram>, cancel: CancellationToken) {
    loop {
        let (datagram, to) = tokio::select! {
            _ = cancel.cancelled() => break,
            next = queue.recv_async() => match next {
                Ok(next) => next,
                Err(_) => break,
            },
        };
        if let Err(e) = socket.send_to(&datagram, to).await {
            tracing::warn!("Failed to send datagram to {to}: {e}");
        }
    }
}

async fn receive(
    socket: Arc<UdpSocket>,
    real: SocketAddr,
    direction: Direction,
    shared: Weak<Shared>,
    cancel: CancellationToken,
) {
    let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = socket.recv_from(&mut buffer) => received,
        };
        let (length, from) = match received {
            Ok(received) => received,
            Err(e) => {
                tracing::debug!("Receive on relay {real} failed: {e}");
                continue;
            }
        };
        if direction == Direction::Incoming && from != real {
            tracing::warn!("Dropping datagram from {from} on the socket for {real}");
            continue;
        }

        let Some(shared) = shared.upgrade() else {
            break;
        };
        handle_datagram(&shared, real, direction, &buffer[..length], from);
    }
}

async fn maintain(real: SocketAddr, shared: Weak<Shared>, cancel: CancellationToken) {
    let mut interval = time::interval(MAINTENANCE_INTERVAL);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        let Some(shared) = shared.upgrade() else {
            break;
        };
        let mut session = shared.session.lock();
        let Some(relay) = session.directory.get_mut(real) else {
            break;
        };
        let due = relay.translator.tick();
        for packet in &due.incoming {
            tracing::debug!("Resending incoming {} #{}", packet.kind(), packet.sequence());
            relay.send(packet, Direction::Incoming);
        }
        for packet in &due.outgoing {
            tracing::debug!("Resending outgoing {} #{}", packet.kind(), packet.sequence());
            relay.send(packet, Direction::Outgoing);
        }
    }
}

pub(crate) fn handle_datagram(
    shared: &Shared,
    real: SocketAddr,
    direction: Direction,
    datagram: &[u8],
    from: SocketAddr,
) {
    let packet = match Packet::decode(datagram) {
        Ok(packet) => packet,
        Err(e) => {
            tracing::warn!("Dropping malformed {direction} datagram from {from}: {e}");
            return;
        }
    };

    let mut guard = shared.session.lock();
    let session = &mut *guard;
    if direction == Direction::Outgoing {
        let first = match session.directory.get_mut(real) {
            Some(relay) => relay.note_client(from),
            None => return,
        };
        if first {
            session.flush_incoming(real);
        }
    }

    if let Err(e) = relay_packet(shared, session, real, packet, direction) {
        tracing::error!("Dropping {direction} packet on relay {real}: {e}");
    }
}

/// Runs one decoded packet through ack checking, sequence
/// translation, address rewriting and the filters, then sends it.
fn relay_packet(
    shared: &Shared,
    session: &mut Session,
    real: SocketAddr,
    packet: Packet,
    direction: Direction,
) -> Result<(), RelayError> {
    let relay = session
        .directory
        .get_mut(real)
        .ok_or(RelayError::UnknownRelay(real))?;
    let mut packet = relay.translator.check_acks(packet, direction)?;
    let original_sequence = packet.sequence();
    relay.translator.translate(&mut packet, direction);

    let kind = packet.kind();
    if let Some(rewrite) = address_rewrite::rewriter_for(kind, direction) {
        match rewrite(shared, session, &packet, direction) {
            Ok(Some(rewritten)) => packet = rewritten,
            Ok(None) => {}
            Err(e) => tracing::error!("Failed to rewrite {direction} {kind}: {e:#}"),
        }
    }

    if !session.filters.has_filters(kind, direction) {
        let relay = session
            .directory
            .get_mut(real)
            .ok_or(RelayError::UnknownRelay(real))?;
        relay.send(&packet, direction);
        return Ok(());
    }

    let original = packet.clone();
    let filtered = session.filters.apply(packet, direction, real);
    let relay = session
        .directory
        .get_mut(real)
        .ok_or(RelayError::UnknownRelay(real))?;
    match filtered {
        None => {
            tracing::debug!("Filters suppressed {direction} {kind} #{original_sequence}");
            if original.is_reliable() {
                relay.spoof_ack(original_sequence, direction);
            }
            if original.header.has_acks() {
                relay.send(&original.separate_acks(), direction);
            }
        }
        Some(mut replacement) => {
            replacement.carry_header_from(&original);
            match (original.is_reliable(), replacement.is_reliable()) {
                (true, false) => relay.spoof_ack(original_sequence, direction),
                (false, true) => relay.translator.wait_for_ack(&replacement, direction),
                _ => {}
            }
            relay.send(&replacement, direction);
        }
    }
    Ok(())
}
