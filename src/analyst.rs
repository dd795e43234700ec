//! Packet logging plugin: logs every message, or only the kinds
//! named in a whitelist file.

use crate::{
    filter::{FilterId, Verdict},
    protocol::{MessageKind, Packet, PacketFlags},
    proxy::Proxy,
    sequence::Direction,
};
use anyhow::Context;
use std::{net::SocketAddr, path::PathBuf, str::FromStr};
use strum::IntoEnumIterator;

#[derive(Debug, Clone, Default, clap::Args)]
pub struct AnalystArgs {
    /// Log every packet passing through the proxy
    #[arg(long = "log-all")]
    pub log_all: bool,
    /// Log only the message kinds listed in this file, one per line
    #[arg(long = "log-whitelist", value_name = "FILE")]
    pub log_whitelist: Option<PathBuf>,
}

/// Parses a whitelist: one message name per line, `#` starts a
/// comment.
pub fn parse_whitelist(text: &str) -> anyhow::Result<Vec<MessageKind>> {
    text.lines()
        .map(|line| line.split('#').next().unwrap_or_default().trim())
        .filter(|line| !line.is_empty())
        .map(|name| MessageKind::from_str(name).with_context(|| format!("unknown message {name:?}")))
        .collect()
}

fn log_packet(packet: &Packet, direction: Direction, remote: SocketAddr) {
    let flags = packet.header.flags;
    tracing::info!(
        "{} {} #{} {remote}{}{} acks={:?}",
        direction,
        packet.kind(),
        packet.sequence(),
        if flags.contains(PacketFlags::RELIABLE) { " reliable" } else { "" },
        if flags.contains(PacketFlags::RESENT) { " resent" } else { "" },
        packet.header.acks,
    );
    tracing::debug!("{:?}", packet.message);
}

/// Installs logging filters as requested. Returns their ids.
pub fn install(proxy: &Proxy, args: &AnalystArgs) -> anyhow::Result<Vec<FilterId>> {
    let kinds: Vec<MessageKind> = if args.log_all {
        MessageKind::iter().collect()
    } else if let Some(path) = &args.log_whitelist {
        let text = fs_err::read_to_string(path)?;
        parse_whitelist(&text)?
    } else {
        return Ok(Vec::new());
    };

    let mut ids = Vec::with_capacity(kinds.len() * 2);
    for kind in kinds {
        for direction in [Direction::Incoming, Direction::Outgoing] {
            ids.push(proxy.add_filter(kind, direction, move |packet, remote| {
                log_packet(packet, direction, remote);
                Ok(Verdict::Forward)
            }));
        }
    }
    tracing::info!("Logging {} message kinds", ids.len() / 2);
    Ok(ids)
}
