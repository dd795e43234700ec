#![allow(dead_code)]

use axum::{routing::post, Router};
use grid_proxy::{
    protocol::{message::ChatFromViewer, PacketFlags},
    Packet, Proxy, ProxyConfig,
};
use std::{net::SocketAddr, time::Duration};
use tokio::{net::UdpSocket, time::timeout};

pub const WAIT: Duration = Duration::from_secs(5);

pub async fn start_proxy(login_uri: String) -> Proxy {
    start_proxy_with(ProxyConfig {
        remote_login_uri: login_uri,
        ..test_config()
    })
    .await
}

pub fn test_config() -> ProxyConfig {
    ProxyConfig {
        login_port: 0,
        client_facing_address: [127, 0, 0, 1].into(),
        remote_facing_address: [127, 0, 0, 1].into(),
        ..ProxyConfig::default()
    }
}

pub async fn start_proxy_with(config: ProxyConfig) -> Proxy {
    Proxy::start(config).await.unwrap()
}

/// Serves `router` on an ephemeral loopback port.
pub async fn serve(router: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    address
}

pub fn login_reply(sim: SocketAddr, seed: &str) -> String {
    format!(
        r#"<?xml version="1.0"?><methodResponse><params><param><value><struct>
            <member><name>login</name><value><string>true</string></value></member>
            <member><name>sim_ip</name><value><string>{}</string></value></member>
            <member><name>sim_port</name><value><i4>{}</i4></value></member>
            <member><name>seed_capability</name><value><string>{seed}</string></value></member>
        </struct></value></param></params></methodResponse>"#,
        sim.ip(),
        sim.port()
    )
}

pub const LOGIN_CALL: &str = r#"<?xml version="1.0"?><methodCall><methodName>login_to_simulator</methodName>
    <params><param><value><struct>
      <member><name>first</name><value><string>Test</string></value></member>
      <member><name>last</name><value><string>Resident</string></value></member>
    </struct></value></param></params></methodCall>"#;

/// A fake login server that always answers with `reply`.
pub async fn login_server(reply: String) -> SocketAddr {
    serve(Router::new().route(
        "/login",
        post(move || {
            let reply = reply.clone();
            async move { ([("content-type", "text/xml")], reply) }
        }),
    ))
    .await
}

/// Value of `<name>{member}</name><value><{kind}>..</{kind}>` in an
/// XML-RPC reply.
pub fn member(reply: &str, member: &str) -> String {
    let start = reply
        .find(&format!("<name>{member}</name>"))
        .unwrap_or_else(|| panic!("no {member} in {reply}"));
    let rest = &reply[start..];
    let open = rest.find("<value><").unwrap() + "<value><".len();
    let rest = &rest[open..];
    let content = rest.find('>').unwrap() + 1;
    let rest = &rest[content..];
    rest[..rest.find('<').unwrap()].to_owned()
}

pub async fn login(proxy: &Proxy) -> String {
    reqwest::Client::new()
        .post(proxy.base_url())
        .header("content-type", "text/xml")
        .body(LOGIN_CALL)
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap()
}

/// One end of a UDP conversation: the fake client or a fake simulator.
pub struct Peer {
    pub socket: UdpSocket,
}

impl Peer {
    pub async fn bind() -> Self {
        Self {
            socket: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.socket.local_addr().unwrap()
    }

    pub async fn send(&self, packet: &Packet, to: SocketAddr) {
        self.socket.send_to(&packet.encode(), to).await.unwrap();
    }

    /// Next packet that is not a retransmission, and its sender.
    pub async fn recv(&self) -> (Packet, SocketAddr) {
        timeout(WAIT, async {
            let mut buffer = vec![0u8; 8192];
            loop {
                let (length, from) = self.socket.recv_from(&mut buffer).await.unwrap();
                let packet = Packet::decode(&buffer[..length]).unwrap();
                if !packet.header.flags.contains(PacketFlags::RESENT) {
                    return (packet, from);
                }
            }
        })
        .await
        .expect("timed out waiting for a packet")
    }

    /// Next packet of any kind, retransmissions included.
    pub async fn recv_any(&self) -> (Packet, SocketAddr) {
        timeout(WAIT, async {
            let mut buffer = vec![0u8; 8192];
            let (length, from) = self.socket.recv_from(&mut buffer).await.unwrap();
            (Packet::decode(&buffer[..length]).unwrap(), from)
        })
        .await
        .expect("timed out waiting for a packet")
    }

    /// Asserts nothing but retransmissions arrive for `period`.
    pub async fn expect_silence(&self, period: Duration) {
        if let Ok((packet, _)) = timeout(period, self.recv()).await {
            panic!("unexpected {packet:?}");
        }
    }

    /// Throws away datagrams already waiting on the socket.
    pub fn drain(&self) {
        let mut buffer = vec![0u8; 8192];
        while self.socket.try_recv_from(&mut buffer).is_ok() {}
    }

    /// Asserts nothing at all arrives for `period`, not even a
    /// retransmission.
    pub async fn expect_quiet(&self, period: Duration) {
        if let Ok((packet, _)) = timeout(period, self.recv_any()).await {
            panic!("unexpected {packet:?}");
        }
    }
}

pub fn chat(sequence: u32) -> Packet {
    let mut packet = Packet::new(ChatFromViewer {
        ignored_data: vec![sequence as u8],
    })
    .reliable();
    packet.header.sequence = sequence;
    packet
}
