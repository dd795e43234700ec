//! Capability interceptors that keep the client behind the proxy:
//! the seed capability reply is rewritten so every capability it
//! grants routes through the proxy, and event queue events that name
//! simulators are rewritten to relay addresses.

use crate::{
    caps::{self, CapabilityRecord, CapsExchange, CapsInterceptor, CapsStage},
    llsd::Llsd,
    proxy::Proxy,
};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

pub(crate) const EVENT_QUEUE_GET: &str = "EventQueueGet";

/// Response-stage interceptor for seed capabilities.
pub(crate) fn seed_fixup() -> CapsInterceptor {
    caps::interceptor(|exchange, stage| {
        if stage == CapsStage::Response {
            rewrite_seed_reply(exchange);
        }
        Ok(false)
    })
}

/// Response-stage interceptor for event queues.
pub(crate) fn event_queue_fixup() -> CapsInterceptor {
    caps::interceptor(|exchange, stage| {
        if stage == CapsStage::Response {
            rewrite_events(exchange)?;
        }
        Ok(false)
    })
}

fn rewrite_seed_reply(exchange: &mut CapsExchange) {
    let sim = exchange.capability().sim();
    let proxy = exchange.proxy().clone();
    let Some(Llsd::Map(granted)) = &mut exchange.response else {
        return;
    };
    for (name, value) in granted.iter_mut() {
        let (Llsd::String(url) | Llsd::Uri(url)) = value else {
            continue;
        };
        if url.is_empty() {
            continue;
        }
        *url = proxy.register_capability(CapabilityRecord::new(url.as_str(), sim, name.as_str()));
    }
}

fn rewrite_events(exchange: &mut CapsExchange) -> anyhow::Result<()> {
    let proxy = exchange.proxy().clone();
    let active = proxy.active_circuit() == Some(exchange.capability().sim());
    let Some(Llsd::Array(events)) = exchange.response.as_mut().and_then(|reply| reply.get_mut("events"))
    else {
        return Ok(());
    };

    for event in events {
        let Some(name) = event.get("message").and_then(Llsd::as_str).map(str::to_owned) else {
            continue;
        };
        let Some(body) = event.get_mut("body") else {
            continue;
        };
        match name.as_str() {
            "TeleportFinish" => rewrite_region_block(&proxy, body, "Info", active)?,
            "CrossedRegion" => rewrite_region_block(&proxy, body, "RegionData", active)?,
            "EnableSimulator" => rewrite_enable_simulator(&proxy, body)?,
            "EstablishAgentCommunication" => rewrite_agent_communication(&proxy, body)?,
            _ => {}
        }
    }
    Ok(())
}

fn ip_from_binary(value: &Llsd) -> Option<Ipv4Addr> {
    let octets: [u8; 4] = value.as_binary()?.try_into().ok()?;
    Some(Ipv4Addr::from(octets))
}

fn endpoint(ip: Option<&Llsd>, port: Option<&Llsd>) -> Option<SocketAddr> {
    let ip = ip_from_binary(ip?)?;
    let port = u16::try_from(port?.as_integer()?).ok()?;
    Some(SocketAddr::from((ip, port)))
}

fn set_endpoint(block: &mut Llsd, ip_key: &str, port_key: &str, local: SocketAddrV4) {
    if let Llsd::Map(map) = block {
        map.insert(ip_key.to_owned(), Llsd::Binary(local.ip().octets().to_vec()));
        map.insert(port_key.to_owned(), Llsd::Integer(i32::from(local.port())));
    }
}

/// TeleportFinish and CrossedRegion carry `SimIP`, `SimPort` and
/// `SeedCapability` in the first entry of one array.
fn rewrite_region_block(proxy: &Proxy, body: &mut Llsd, array: &str, active: bool) -> anyhow::Result<()> {
    let Some(block) = body.get_mut(array).and_then(|blocks| blocks.index_mut(0)) else {
        return Ok(());
    };
    let Some(real) = endpoint(block.get("SimIP"), block.get("SimPort")) else {
        tracing::warn!("Event block {array} has no usable simulator address");
        return Ok(());
    };
    let seed = block.get("SeedCapability").and_then(Llsd::as_str).map(str::to_owned);
    let (local, seed) = proxy.proxy_endpoint(real, seed.as_deref(), active)?;
    tracing::info!("Event queue moves client to {real}, relayed through {local}");

    set_endpoint(block, "SimIP", "SimPort", local);
    if let (Some(seed), Llsd::Map(map)) = (seed, block) {
        map.insert("SeedCapability".to_owned(), Llsd::String(seed));
    }
    Ok(())
}

fn rewrite_enable_simulator(proxy: &Proxy, body: &mut Llsd) -> anyhow::Result<()> {
    let Some(block) = body.get_mut("SimulatorInfo").and_then(|blocks| blocks.index_mut(0)) else {
        return Ok(());
    };
    let Some(real) = endpoint(block.get("IP"), block.get("Port")) else {
        return Ok(());
    };
    let (local, _) = proxy.proxy_endpoint(real, None, false)?;
    set_endpoint(block, "IP", "Port", local);
    Ok(())
}

fn rewrite_agent_communication(proxy: &Proxy, body: &mut Llsd) -> anyhow::Result<()> {
    let Some(real) = body
        .get("sim-ip-and-port")
        .and_then(Llsd::as_str)
        .and_then(|text| text.parse::<SocketAddr>().ok())
    else {
        return Ok(());
    };
    let seed = body.get("seed-capability").and_then(Llsd::as_str).map(str::to_owned);
    let (local, seed) = proxy.proxy_endpoint(real, seed.as_deref(), false)?;

    if let Llsd::Map(map) = body {
        map.insert("sim-ip-and-port".to_owned(), Llsd::String(local.to_string()));
        if let Some(seed) = seed {
            map.insert("seed-capability".to_owned(), Llsd::String(seed));
        }
    }
    Ok(())
}
