//! Rewriting of simulator addresses carried in UDP messages, so the
//! client only ever learns relay addresses.

use crate::{
    protocol::{
        message::{CrossedRegion, EnableSimulator, TeleportFinish},
        Message, MessageKind, Packet,
    },
    proxy::{Session, Shared},
    sequence::Direction,
};
use std::net::SocketAddr;

/// Returns the rewritten packet, or `None` to keep it as is.
pub(crate) type Rewriter =
    fn(&Shared, &mut Session, &Packet, Direction) -> anyhow::Result<Option<Packet>>;

pub(crate) fn rewriter_for(kind: MessageKind, direction: Direction) -> Option<Rewriter> {
    match (kind, direction) {
        (MessageKind::TeleportFinish, Direction::Incoming) => Some(teleport_finish),
        (MessageKind::CrossedRegion, Direction::Incoming) => Some(crossed_region),
        (MessageKind::EnableSimulator, Direction::Incoming) => Some(enable_simulator),
        (MessageKind::OpenCircuit, _) => Some(open_circuit),
        _ => None,
    }
}

/// Keeps the header, flags included, of the packet being replaced.
fn rebuild(packet: &Packet, message: impl Into<Message>) -> Packet {
    Packet {
        header: packet.header.clone(),
        message: message.into(),
    }
}

/// Seed capability URL from a variable-length field, without the
/// trailing NUL.
fn seed_url(field: &[u8]) -> Option<String> {
    let end = field.iter().rposition(|&b| b != 0).map_or(0, |last| last + 1);
    (end > 0).then(|| String::from_utf8_lossy(&field[..end]).into_owned())
}

fn seed_field(rewritten: Option<String>, original: &[u8]) -> Vec<u8> {
    match rewritten {
        Some(url) => {
            let mut field = url.into_bytes();
            if original.last() == Some(&0) {
                field.push(0);
            }
            field
        }
        None => original.to_vec(),
    }
}

fn teleport_finish(
    shared: &Shared,
    session: &mut Session,
    packet: &Packet,
    _direction: Direction,
) -> anyhow::Result<Option<Packet>> {
    let Message::TeleportFinish(finish) = &packet.message else {
        anyhow::bail!("expected TeleportFinish, got {}", packet.kind());
    };
    let real = SocketAddr::from((finish.sim_ip, finish.sim_port));
    let seed = seed_url(&finish.seed_capability);
    let (local, seed) = session.proxy_endpoint(shared, real, seed.as_deref(), true)?;
    tracing::info!("Teleport to {real}, relayed through {local}");

    Ok(Some(rebuild(
        packet,
        TeleportFinish {
            sim_ip: *local.ip(),
            sim_port: local.port(),
            seed_capability: seed_field(seed, &finish.seed_capability),
            ..finish.clone()
        },
    )))
}

fn crossed_region(
    shared: &Shared,
    session: &mut Session,
    packet: &Packet,
    _direction: Direction,
) -> anyhow::Result<Option<Packet>> {
    let Message::CrossedRegion(crossed) = &packet.message else {
        anyhow::bail!("expected CrossedRegion, got {}", packet.kind());
    };
    let real = SocketAddr::from((crossed.sim_ip, crossed.sim_port));
    let seed = seed_url(&crossed.seed_capability);
    let (local, seed) = session.proxy_endpoint(shared, real, seed.as_deref(), true)?;
    tracing::info!("Crossed into {real}, relayed through {local}");

    Ok(Some(rebuild(
        packet,
        CrossedRegion {
            sim_ip: *local.ip(),
            sim_port: local.port(),
            seed_capability: seed_field(seed, &crossed.seed_capability),
            ..crossed.clone()
        },
    )))
}

fn enable_simulator(
    shared: &Shared,
    session: &mut Session,
    packet: &Packet,
    _direction: Direction,
) -> anyhow::Result<Option<Packet>> {
    let Message::EnableSimulator(enable) = &packet.message else {
        anyhow::bail!("expected EnableSimulator, got {}", packet.kind());
    };
    let real = SocketAddr::from((enable.ip, enable.port));
    let (local, _) = session.proxy_endpoint(shared, real, None, false)?;
    tracing::debug!("Neighbour {real} relayed through {local}");

    Ok(Some(rebuild(
        packet,
        EnableSimulator {
            ip: *local.ip(),
            port: local.port(),
            ..enable.clone()
        },
    )))
}

/// OpenCircuit is not seen in normal sessions; log it and pass it on.
fn open_circuit(
    _shared: &Shared,
    _session: &mut Session,
    packet: &Packet,
    direction: Direction,
) -> anyhow::Result<Option<Packet>> {
    if let Message::OpenCircuit(open) = &packet.message {
        tracing::warn!(
            "Unexpected {direction} OpenCircuit for {}:{}; forwarding unchanged",
            open.ip,
            open.port
        );
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_field_keeps_terminator() {
        assert_eq!(seed_url(b"https://sim/cap\0").as_deref(), Some("https://sim/cap"));
        assert_eq!(seed_url(b"\0"), None);
        assert_eq!(seed_url(b""), None);

        assert_eq!(
            seed_field(Some("http://127.0.0.1:8080/https://sim/cap".to_owned()), b"x\0"),
            b"http://127.0.0.1:8080/https://sim/cap\0"
        );
        assert_eq!(seed_field(Some("a".to_owned()), b"x"), b"a");
        assert_eq!(seed_field(None, b"x\0"), b"x\0");
    }

    #[test]
    fn only_address_carriers_are_rewritten() {
        assert!(rewriter_for(MessageKind::TeleportFinish, Direction::Incoming).is_some());
        assert!(rewriter_for(MessageKind::TeleportFinish, Direction::Outgoing).is_none());
        assert!(rewriter_for(MessageKind::OpenCircuit, Direction::Outgoing).is_some());
        assert!(rewriter_for(MessageKind::ChatFromViewer, Direction::Outgoing).is_none());
    }
}
