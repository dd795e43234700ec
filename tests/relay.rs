mod common;

use common::{chat, login, login_reply, login_server, member, start_proxy, Peer};
use grid_proxy::{
    protocol::{
        message::{CrossedRegion, PacketAck, UseCircuitCode},
        Message, PacketFlags,
    },
    Direction, MessageKind, Packet, Proxy, Verdict,
};
use std::{
    net::{Ipv4Addr, SocketAddr},
    time::Duration,
};
use uuid::Uuid;

/// A proxy with a completed login, a simulator and a client that has
/// opened its circuit through the relay.
struct Session {
    proxy: Proxy,
    sim: Peer,
    client: Peer,
    /// Client-facing address of the login simulator's relay.
    relay: SocketAddr,
    /// Where the simulator sees relayed traffic come from.
    relay_remote: SocketAddr,
    login_reply: String,
}

async fn logged_in() -> Session {
    let sim = Peer::bind().await;
    let login_server = login_server(login_reply(sim.addr(), "http://127.0.0.1:9/seed")).await;
    let proxy = start_proxy(format!("http://{login_server}/login")).await;

    let reply = login(&proxy).await;
    let relay: SocketAddr = format!("{}:{}", member(&reply, "sim_ip"), member(&reply, "sim_port"))
        .parse()
        .unwrap();

    let client = Peer::bind().await;
    let mut open = Packet::new(UseCircuitCode {
        ignored_data: vec![1, 2, 3],
    })
    .reliable();
    open.header.sequence = 1;
    client.send(&open, relay).await;
    let (received, relay_remote) = sim.recv().await;
    assert_eq!(received, open);

    Session {
        proxy,
        sim,
        client,
        relay,
        relay_remote,
        login_reply: reply,
    }
}

#[tokio::test]
async fn login_points_client_at_relay() {
    let session = logged_in().await;

    assert_eq!(member(&session.login_reply, "sim_ip"), "127.0.0.1");
    assert_ne!(session.relay, session.sim.addr());
    assert_eq!(session.proxy.relay_address(session.sim.addr()), Some(session.relay));
    assert_eq!(session.proxy.active_circuit(), Some(session.sim.addr()));
    assert_eq!(
        member(&session.login_reply, "seed_capability"),
        format!("{}http://127.0.0.1:9/seed", session.proxy.base_url())
    );
    assert!(session.proxy.capability("http://127.0.0.1:9/seed").is_some());
}

#[tokio::test]
async fn crossed_region_is_rewritten_to_new_relay() {
    let session = logged_in().await;
    let neighbour: SocketAddr = "127.0.0.1:13005".parse().unwrap();

    let mut crossed = Packet::new(CrossedRegion {
        agent_id: Uuid::nil(),
        session_id: Uuid::nil(),
        sim_ip: Ipv4Addr::new(127, 0, 0, 1),
        sim_port: neighbour.port(),
        region_handle: 42,
        seed_capability: b"https://sim2/seed\0".to_vec(),
        ignored_data: vec![0; 24],
    })
    .reliable();
    crossed.header.sequence = 1;
    session.sim.send(&crossed, session.relay_remote).await;

    let (received, from) = session.client.recv().await;
    assert_eq!(from, session.relay);
    let Message::CrossedRegion(rewritten) = &received.message else {
        panic!("expected CrossedRegion, got {received:?}");
    };
    let new_relay = session.proxy.relay_address(neighbour).unwrap();
    assert_eq!(SocketAddr::from((rewritten.sim_ip, rewritten.sim_port)), new_relay);
    assert_eq!(
        rewritten.seed_capability,
        format!("{}https://sim2/seed\0", session.proxy.base_url()).into_bytes()
    );
    assert_eq!(rewritten.region_handle, 42);
    assert_eq!(received.sequence(), 1);
    assert_eq!(session.proxy.active_circuit(), Some(neighbour));
    assert!(session.proxy.capability("https://sim2/seed").is_some());
}

#[tokio::test]
async fn injected_packet_shifts_sequence_and_swallows_ack() {
    let session = logged_in().await;

    for sequence in 2..=4 {
        session.client.send(&chat(sequence), session.relay).await;
        assert_eq!(session.sim.recv().await.0.sequence(), sequence);
    }

    session.proxy.inject_packet(chat(0), Direction::Outgoing);
    let (injected, _) = session.sim.recv().await;
    assert_eq!(injected.sequence(), 5);

    session.client.send(&chat(5), session.relay).await;
    assert_eq!(session.sim.recv().await.0.sequence(), 6);

    let mut ack = Packet::ack(vec![5, 6]);
    ack.header.sequence = 1;
    session.sim.send(&ack, session.relay_remote).await;
    let (received, _) = session.client.recv().await;
    assert_eq!(
        received.message,
        Message::PacketAck(PacketAck { packets: vec![5] })
    );
}

#[tokio::test]
async fn suppressed_reliable_packet_is_acked_once() {
    let session = logged_in().await;
    session
        .proxy
        .add_filter(MessageKind::ChatFromViewer, Direction::Outgoing, |_, _| {
            Ok(Verdict::Drop)
        });

    let mut packet = chat(2);
    packet.header.set_acks(vec![7]);
    session.client.send(&packet, session.relay).await;

    // The simulator still gets the acks the dropped packet carried.
    let (separated, _) = session.sim.recv().await;
    assert_eq!(
        separated.message,
        Message::PacketAck(PacketAck { packets: vec![7] })
    );

    let (spoofed, _) = session.client.recv().await;
    assert_eq!(
        spoofed.message,
        Message::PacketAck(PacketAck { packets: vec![2] })
    );
    session.client.expect_silence(Duration::from_millis(300)).await;
    session.sim.expect_silence(Duration::from_millis(300)).await;
}

#[tokio::test]
async fn unreliable_replacement_is_acked_for_the_client() {
    let session = logged_in().await;
    session
        .proxy
        .add_filter(MessageKind::ChatFromViewer, Direction::Outgoing, |packet, _| {
            let mut replacement = packet.clone();
            replacement.header.flags.remove(PacketFlags::RELIABLE);
            Ok(Verdict::Replace(replacement))
        });

    session.client.send(&chat(2), session.relay).await;
    let (forwarded, _) = session.sim.recv().await;
    assert_eq!(forwarded.sequence(), 2);
    assert!(!forwarded.is_reliable());

    // The client still expects its reliable packet to be acked.
    let (spoofed, _) = session.client.recv().await;
    assert_eq!(
        spoofed.message,
        Message::PacketAck(PacketAck { packets: vec![2] })
    );
}

#[tokio::test]
async fn incoming_injection_waits_for_client() {
    let sim = Peer::bind().await;
    let login_server = login_server(login_reply(sim.addr(), "")).await;
    let proxy = start_proxy(format!("http://{login_server}/login")).await;

    // Queued: there is no active circuit yet.
    proxy.inject_packet(chat(0), Direction::Incoming);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let reply = login(&proxy).await;
    let relay: SocketAddr = format!("{}:{}", member(&reply, "sim_ip"), member(&reply, "sim_port"))
        .parse()
        .unwrap();

    let client = Peer::bind().await;
    client.send(&chat(1), relay).await;
    let (injected, from) = client.recv().await;
    assert_eq!(from, relay);
    assert_eq!(injected.kind(), MessageKind::ChatFromViewer);
    assert_eq!(injected.sequence(), 1);

    // The client's own packet still reaches the simulator.
    assert_eq!(sim.recv().await.0.sequence(), 1);
}

#[tokio::test]
async fn upgraded_packet_is_resent_until_simulator_acks() {
    let session = logged_in().await;
    session
        .proxy
        .add_filter(MessageKind::ChatFromViewer, Direction::Outgoing, |packet, _| {
            Ok(Verdict::Replace(packet.clone().reliable()))
        });

    let mut unreliable = chat(2);
    unreliable.header.flags.remove(PacketFlags::RELIABLE);
    session.client.send(&unreliable, session.relay).await;

    let (forwarded, _) = session.sim.recv().await;
    assert_eq!(forwarded.sequence(), 2);
    assert!(forwarded.is_reliable());

    // The proxy owns the reliability it added, so it resends.
    let (resent, _) = session.sim.recv_any().await;
    assert!(resent.header.flags.contains(PacketFlags::RESENT));
    assert_eq!(resent.sequence(), 2);
    assert_eq!(resent.message, forwarded.message);

    let mut ack = Packet::ack(vec![2]);
    ack.header.sequence = 1;
    session.sim.send(&ack, session.relay_remote).await;

    // The client never asked for reliability, so the ack stops here.
    let (received, _) = session.client.recv().await;
    assert_eq!(
        received.message,
        Message::PacketAck(PacketAck { packets: Vec::new() })
    );

    tokio::time::sleep(Duration::from_millis(100)).await;
    session.sim.drain();
    session.sim.expect_quiet(Duration::from_millis(1500)).await;
}

#[tokio::test]
async fn unacked_injection_is_resent() {
    let session = logged_in().await;

    session.proxy.inject_packet(chat(0), Direction::Outgoing);
    let (injected, _) = session.sim.recv().await;
    assert_eq!(injected.sequence(), 2);

    let (resent, from) = session.sim.recv_any().await;
    assert_eq!(from, session.relay_remote);
    assert!(resent.header.flags.contains(PacketFlags::RESENT));
    assert_eq!(resent.sequence(), injected.sequence());
    assert_eq!(resent.message, injected.message);

    let mut ack = Packet::ack(vec![2]);
    ack.header.sequence = 1;
    session.sim.send(&ack, session.relay_remote).await;
    let (received, _) = session.client.recv().await;
    assert_eq!(
        received.message,
        Message::PacketAck(PacketAck { packets: Vec::new() })
    );

    tokio::time::sleep(Duration::from_millis(100)).await;
    session.sim.drain();
    session.sim.expect_quiet(Duration::from_millis(1500)).await;
}

#[tokio::test]
async fn relogin_restarts_sequences_on_same_relay() {
    let session = logged_in().await;

    // Left unacked, so the old session owes the simulator a resend.
    session.proxy.inject_packet(chat(0), Direction::Outgoing);
    assert_eq!(session.sim.recv().await.0.sequence(), 2);

    let reply = login(&session.proxy).await;
    assert_eq!(member(&reply, "sim_port"), session.relay.port().to_string());
    assert_eq!(session.proxy.relay_address(session.sim.addr()), Some(session.relay));
    assert_eq!(session.proxy.active_circuit(), Some(session.sim.addr()));

    // A new viewer session numbers from 1 again and nothing is shifted.
    let mut open = Packet::new(UseCircuitCode {
        ignored_data: vec![4, 5, 6],
    })
    .reliable();
    open.header.sequence = 1;
    session.client.send(&open, session.relay).await;
    let (received, from) = session.sim.recv().await;
    assert_eq!(from, session.relay_remote);
    assert_eq!(received, open);

    session.client.send(&chat(2), session.relay).await;
    assert_eq!(session.sim.recv().await.0.sequence(), 2);

    // The acks owed by the old session were forgotten with it.
    session.sim.expect_quiet(Duration::from_millis(1500)).await;
}

#[tokio::test]
async fn outgoing_injection_waits_for_circuit() {
    let sim = Peer::bind().await;
    let login_server = login_server(login_reply(sim.addr(), "")).await;
    let proxy = start_proxy(format!("http://{login_server}/login")).await;

    proxy.inject_packet(chat(0), Direction::Outgoing);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let reply = login(&proxy).await;
    let relay: SocketAddr = format!("{}:{}", member(&reply, "sim_ip"), member(&reply, "sim_port"))
        .parse()
        .unwrap();

    // Sent as soon as the login made the circuit active.
    let (injected, _) = sim.recv().await;
    assert_eq!(injected.kind(), MessageKind::ChatFromViewer);
    assert_eq!(injected.sequence(), 1);

    let client = Peer::bind().await;
    client.send(&chat(1), relay).await;
    assert_eq!(sim.recv().await.0.sequence(), 2);
}
