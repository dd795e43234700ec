//! The proxy handle and the session state every relay and handler
//! shares.

use crate::{
    caps::{CapabilityRecord, CapabilityRegistry, CapsExchange, CapsInterceptor, CapsStage, InterceptorId, NamedInterceptors},
    config::ProxyConfig,
    directory::RelayDirectory,
    event_queue,
    filter::{FilterId, FilterRegistry, Verdict},
    gateway,
    login::{LoginHooks, LoginRequest, LoginResponse},
    protocol::{MessageKind, Packet},
    relay::{self, EndpointRelay},
    sequence::Direction,
};
use anyhow::Context;
use parking_lot::Mutex;
use std::{
    net::{SocketAddr, SocketAddrV4},
    sync::{Arc, Weak},
};
use tokio::{net::TcpListener, task};
use tokio_util::sync::CancellationToken;

pub(crate) const SEED_CAPABILITY: &str = "SeedCapability";

/// State behind a [`Proxy`] handle.
pub(crate) struct Shared {
    pub config: ProxyConfig,
    /// `http://{login address}/`; capability URLs handed to the
    /// client are this prefix followed by the real URL.
    pub base_url: String,
    pub login_addr: SocketAddr,
    pub session: Mutex<Session>,
    pub http: reqwest::Client,
    injector: flume::Sender<(Packet, Direction)>,
    pub shutdown: CancellationToken,
    this: Weak<Shared>,
}

/// Everything that changes while the proxy runs. One lock guards it
/// all; socket writes happen outside it.
#[derive(Default)]
pub(crate) struct Session {
    pub directory: RelayDirectory,
    pub caps: CapabilityRegistry,
    pub named_interceptors: NamedInterceptors,
    pub filters: FilterRegistry,
    pub login_hooks: LoginHooks,
    /// Incoming injections waiting for a relay to hear from the client.
    queued_incoming: Vec<Packet>,
    /// Outgoing injections waiting for an active circuit.
    queued_outgoing: Vec<Packet>,
}

impl Session {
    /// Returns the client-facing address of the relay for `real`,
    /// creating the relay if needed.
    pub fn proxy_sim(&mut self, shared: &Shared, real: SocketAddr) -> anyhow::Result<SocketAddr> {
        if let Some(relay) = self.directory.get(real) {
            return Ok(relay.local_addr());
        }

        let (relay, sockets) = EndpointRelay::bind(real, &shared.config)
            .with_context(|| format!("failed to bind relay for {real}"))?;
        let local = relay.local_addr();
        relay::spawn(sockets, real, shared.this.clone(), shared.shutdown.child_token());
        self.directory.insert(relay);
        tracing::info!("Relaying simulator {real} through {local}");
        Ok(local)
    }

    /// Relays `real` and registers its seed capability, if any,
    /// returning the addresses to give the client instead.
    pub fn proxy_endpoint(
        &mut self,
        shared: &Shared,
        real: SocketAddr,
        seed: Option<&str>,
        active: bool,
    ) -> anyhow::Result<(SocketAddrV4, Option<String>)> {
        let SocketAddr::V4(local) = self.proxy_sim(shared, real)? else {
            anyhow::bail!("relay for {real} is not on an IPv4 address");
        };
        let seed = seed
            .filter(|url| !url.is_empty())
            .map(|url| self.register_seed(shared, url, real));
        if active {
            self.set_active(real);
        }
        Ok((local, seed))
    }

    /// Registers a seed capability and returns its proxied URL.
    pub fn register_seed(&mut self, shared: &Shared, url: &str, sim: SocketAddr) -> String {
        let record = CapabilityRecord::new(url, sim, SEED_CAPABILITY);
        record.push_interceptor(event_queue::seed_fixup());
        self.caps.register(record);
        format!("{}{url}", shared.base_url)
    }

    pub fn set_active(&mut self, real: SocketAddr) {
        self.directory.set_active(real);
        let queued = std::mem::take(&mut self.queued_outgoing);
        if let Some(relay) = self.directory.get_mut(real) {
            for packet in queued {
                // Outgoing injections are never refused.
                let _ = relay.inject(packet, Direction::Outgoing);
            }
        }
    }

    /// Sends injections queued before any relay heard from the client.
    pub fn flush_incoming(&mut self, real: SocketAddr) {
        let queued = std::mem::take(&mut self.queued_incoming);
        let Some(relay) = self.directory.get_mut(real) else {
            self.queued_incoming = queued;
            return;
        };
        for packet in queued {
            if let Err(packet) = relay.inject(packet, Direction::Incoming) {
                self.queued_incoming.push(packet);
            }
        }
    }

    /// Injects into the active circuit, queueing when that is not
    /// yet possible.
    pub fn inject(&mut self, packet: Packet, direction: Direction) {
        let relay = self
            .directory
            .active()
            .and_then(|active| self.directory.get_mut(active));
        let Some(relay) = relay else {
            tracing::debug!("No active circuit; queueing {direction} {}", packet.kind());
            match direction {
                Direction::Incoming => self.queued_incoming.push(packet),
                Direction::Outgoing => self.queued_outgoing.push(packet),
            }
            return;
        };
        if let Err(packet) = relay.inject(packet, direction) {
            tracing::debug!("Client not heard from yet; queueing {}", packet.kind());
            self.queued_incoming.push(packet);
        }
    }

    /// Starts a new login session. Queued injections are kept so
    /// that packets injected before the login reach its circuit.
    pub fn reset(&mut self) {
        self.directory.reset();
        self.caps.clear();
    }
}

/// Handle to a running proxy. Cheap to clone.
#[derive(Clone)]
pub struct Proxy {
    shared: Arc<Shared>,
}

impl Proxy {
    /// Binds the login listener and starts serving. Relays are
    /// created as the login and region traffic names simulators.
    pub async fn start(config: ProxyConfig) -> anyhow::Result<Self> {
        let listener = TcpListener::bind((config.client_facing_address, config.login_port))
            .await
            .with_context(|| {
                format!(
                    "failed to bind login listener on {}:{}",
                    config.client_facing_address, config.login_port
                )
            })?;
        let login_addr = listener.local_addr()?;
        let base_url = format!("http://{login_addr}/");
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()?;
        let (injector, injections) = flume::unbounded();
        let shutdown = CancellationToken::new();

        let shared = Arc::new_cyclic(|this| Shared {
            config,
            base_url,
            login_addr,
            session: Mutex::new(Session::default()),
            http,
            injector,
            shutdown: shutdown.clone(),
            this: this.clone(),
        });
        shared
            .session
            .lock()
            .named_interceptors
            .add(event_queue::EVENT_QUEUE_GET, event_queue::event_queue_fixup());

        let proxy = Proxy { shared };
        task::spawn(run_injector(
            Arc::downgrade(&proxy.shared),
            injections,
            shutdown.clone(),
        ));
        task::spawn(gateway::serve(listener, proxy.clone(), shutdown));
        tracing::info!(
            "Proxy listening on {}, forwarding logins to {}",
            proxy.shared.base_url,
            proxy.shared.config.remote_login_uri
        );
        Ok(proxy)
    }

    pub(crate) fn shared(&self) -> &Shared {
        &self.shared
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.shared.config
    }

    /// URL the client should use as its login URI.
    pub fn base_url(&self) -> &str {
        &self.shared.base_url
    }

    pub fn login_addr(&self) -> SocketAddr {
        self.shared.login_addr
    }

    /// Adds a filter for `kind` packets travelling in `direction`.
    ///
    /// Filters run while the session is locked, so they must not call
    /// back into the proxy, except for [`Proxy::inject_packet`].
    pub fn add_filter<F>(&self, kind: MessageKind, direction: Direction, filter: F) -> FilterId
    where
        F: Fn(&Packet, SocketAddr) -> anyhow::Result<Verdict> + Send + Sync + 'static,
    {
        self.shared.session.lock().filters.add(kind, direction, filter)
    }

    pub fn remove_filter(&self, id: FilterId) -> bool {
        self.shared.session.lock().filters.remove(id)
    }

    /// Adds an interceptor to every capability named `name`,
    /// including ones discovered later.
    pub fn add_caps_interceptor<F>(&self, name: &str, interceptor: F) -> InterceptorId
    where
        F: Fn(&mut CapsExchange, CapsStage) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        self.shared
            .session
            .lock()
            .named_interceptors
            .add(name, crate::caps::interceptor(interceptor))
    }

    pub fn remove_caps_interceptor(&self, id: InterceptorId) -> bool {
        self.shared.session.lock().named_interceptors.remove(id)
    }

    pub fn set_login_request_hook<F>(&self, hook: F)
    where
        F: Fn(&mut LoginRequest) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.shared.session.lock().login_hooks.request = Some(Arc::new(hook));
    }

    pub fn set_login_response_hook<F>(&self, hook: F)
    where
        F: Fn(&mut LoginResponse) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.shared.session.lock().login_hooks.response = Some(Arc::new(hook));
    }

    /// Queues a packet to be sent over the active circuit. Safe to
    /// call from anywhere, filters included.
    pub fn inject_packet(&self, packet: Packet, direction: Direction) {
        if self.shared.injector.send((packet, direction)).is_err() {
            tracing::debug!("Proxy shut down; injection dropped");
        }
    }

    /// Returns the client-facing address of the relay for `real`,
    /// creating one if needed. Must be called within the runtime.
    pub fn proxy_sim(&self, real: SocketAddr) -> anyhow::Result<SocketAddr> {
        self.shared.session.lock().proxy_sim(&self.shared, real)
    }

    pub(crate) fn proxy_endpoint(
        &self,
        real: SocketAddr,
        seed: Option<&str>,
        active: bool,
    ) -> anyhow::Result<(SocketAddrV4, Option<String>)> {
        self.shared
            .session
            .lock()
            .proxy_endpoint(&self.shared, real, seed, active)
    }

    /// Real endpoint of the simulator the client is attached to.
    pub fn active_circuit(&self) -> Option<SocketAddr> {
        self.shared.session.lock().directory.active()
    }

    pub fn relay_address(&self, real: SocketAddr) -> Option<SocketAddr> {
        self.shared
            .session
            .lock()
            .directory
            .get(real)
            .map(EndpointRelay::local_addr)
    }

    pub fn capability(&self, url: &str) -> Option<Arc<CapabilityRecord>> {
        self.shared.session.lock().caps.get(url)
    }

    /// Registers a capability and returns the URL the client should
    /// use for it.
    pub fn register_capability(&self, record: CapabilityRecord) -> String {
        let proxied = format!("{}{}", self.shared.base_url, record.url());
        self.shared.session.lock().caps.register(record);
        proxied
    }

    /// Interceptors that apply to `record`: its own, then those
    /// registered for its name.
    pub(crate) fn interceptors_for(&self, record: &CapabilityRecord) -> Vec<CapsInterceptor> {
        let mut interceptors = record.interceptors();
        interceptors.extend(
            self.shared
                .session
                .lock()
                .named_interceptors
                .for_name(record.name()),
        );
        interceptors
    }

    /// Forgets per-login state: sequence translation and known
    /// capabilities. Relays stay bound.
    pub fn reset(&self) {
        self.shared.session.lock().reset();
    }

    /// Stops the listener and every relay task.
    pub fn shutdown(&self) {
        tracing::info!("Shutting down");
        self.shared.shutdown.cancel();
    }
}

async fn run_injector(
    shared: Weak<Shared>,
    injections: flume::Receiver<(Packet, Direction)>,
    cancel: CancellationToken,
) {
    loop {
        let (packet, direction) = tokio::select! {
            _ = cancel.cancelled() => break,
            next = injections.recv_async() => match next {
                Ok(next) => next,
                Err(_) => break,
            },
        };
        let Some(shared) = shared.upgrade() else {
            break;
        };
        shared.session.lock().inject(packet, direction);
    }
}
