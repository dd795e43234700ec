//! Capabilities the proxy has learned about, and the interceptors
//! attached to them.

use crate::{llsd::Llsd, proxy::Proxy};
use ahash::AHashMap;
use parking_lot::Mutex;
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

/// Capabilities whose bodies are opaque asset data rather than LLSD.
const BINARY_CAPABILITIES: &[&str] = &["GetTexture", "GetMesh", "GetMesh2", "ViewerAsset"];

static NEXT_INTERCEPTOR_ID: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CapsEncoding {
    Llsd,
    Binary,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, strum::Display)]
pub enum CapsStage {
    Request,
    Response,
}

/// Handle for removing a capability interceptor.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct InterceptorId(u64);

impl InterceptorId {
    fn next() -> Self {
        Self(NEXT_INTERCEPTOR_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// One request/response pair flowing through a capability.
pub struct CapsExchange {
    /// Decoded request body, if there was one and it was LLSD.
    pub request: Option<Llsd>,
    /// Decoded response body. Set by a request-stage interceptor
    /// to answer the client without contacting the server.
    pub response: Option<Llsd>,
    capability: Arc<CapabilityRecord>,
    proxy: Proxy,
}

impl CapsExchange {
    pub(crate) fn new(capability: Arc<CapabilityRecord>, proxy: Proxy, request: Option<Llsd>) -> Self {
        Self {
            request,
            response: None,
            capability,
            proxy,
        }
    }

    pub fn capability(&self) -> &Arc<CapabilityRecord> {
        &self.capability
    }

    pub fn proxy(&self) -> &Proxy {
        &self.proxy
    }
}

/// Inspects or rewrites an exchange. At the request stage,
/// returning `true` answers the client with `response` and skips
/// the server; at the response stage the return value is ignored.
pub type CapsInterceptor =
    Arc<dyn Fn(&mut CapsExchange, CapsStage) -> anyhow::Result<bool> + Send + Sync>;

pub(crate) fn interceptor<F>(f: F) -> CapsInterceptor
where
    F: Fn(&mut CapsExchange, CapsStage) -> anyhow::Result<bool> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// A capability URL discovered in login or seed traffic.
pub struct CapabilityRecord {
    url: String,
    sim: SocketAddr,
    name: String,
    request_encoding: CapsEncoding,
    response_encoding: CapsEncoding,
    interceptors: Mutex<Vec<(InterceptorId, CapsInterceptor)>>,
}

impl CapabilityRecord {
    pub fn new(url: impl Into<String>, sim: SocketAddr, name: impl Into<String>) -> Self {
        let name = name.into();
        let encoding = if BINARY_CAPABILITIES.contains(&name.as_str()) {
            CapsEncoding::Binary
        } else {
            CapsEncoding::Llsd
        };
        Self {
            url: url.into(),
            sim,
            name,
            request_encoding: encoding,
            response_encoding: encoding,
            interceptors: Mutex::new(Vec::new()),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Real endpoint of the simulator that issued the capability.
    pub fn sim(&self) -> SocketAddr {
        self.sim
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn request_encoding(&self) -> CapsEncoding {
        self.request_encoding
    }

    pub fn response_encoding(&self) -> CapsEncoding {
        self.response_encoding
    }

    pub fn add_interceptor<F>(&self, f: F) -> InterceptorId
    where
        F: Fn(&mut CapsExchange, CapsStage) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        self.push_interceptor(interceptor(f))
    }

    pub(crate) fn push_interceptor(&self, interceptor: CapsInterceptor) -> InterceptorId {
        let id = InterceptorId::next();
        self.interceptors.lock().push((id, interceptor));
        id
    }

    pub fn remove_interceptor(&self, id: InterceptorId) -> bool {
        let mut interceptors = self.interceptors.lock();
        let before = interceptors.len();
        interceptors.retain(|(existing, _)| *existing != id);
        interceptors.len() != before
    }

    pub(crate) fn interceptors(&self) -> Vec<CapsInterceptor> {
        self.interceptors
            .lock()
            .iter()
            .map(|(_, interceptor)| interceptor.clone())
            .collect()
    }
}

impl std::fmt::Debug for CapabilityRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityRecord")
            .field("url", &self.url)
            .field("sim", &self.sim)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Capabilities keyed by URL. Query strings are ignored when
/// matching, so `.../cap/1?x=2` finds the record for `.../cap/1`.
#[derive(Debug, Default)]
pub struct CapabilityRegistry {
    records: AHashMap<String, Arc<CapabilityRecord>>,
}

fn key(url: &str) -> &str {
    url.split_once('?').map_or(url, |(path, _)| path)
}

impl CapabilityRegistry {
    /// Registers `record` unless its URL is already known, in which
    /// case the existing record, interceptors included, is kept and
    /// returned.
    pub fn register(&mut self, record: CapabilityRecord) -> Arc<CapabilityRecord> {
        let entry = self.records.entry(key(&record.url).to_owned()).or_insert_with(|| {
            tracing::debug!("Capability {} = {}", record.name, record.url);
            Arc::new(record)
        });
        Arc::clone(entry)
    }

    pub fn get(&self, url: &str) -> Option<Arc<CapabilityRecord>> {
        self.records.get(key(url)).cloned()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}

/// Interceptors to attach to any capability with a given name,
/// whenever and wherever it is discovered.
#[derive(Default)]
pub(crate) struct NamedInterceptors {
    by_name: AHashMap<String, Vec<(InterceptorId, CapsInterceptor)>>,
}

impl NamedInterceptors {
    pub fn add(&mut self, name: &str, interceptor: CapsInterceptor) -> InterceptorId {
        let id = InterceptorId::next();
        self.by_name
            .entry(name.to_owned())
            .or_default()
            .push((id, interceptor));
        id
    }

    pub fn remove(&mut self, id: InterceptorId) -> bool {
        let mut removed = false;
        self.by_name.retain(|_, chain| {
            let before = chain.len();
            chain.retain(|(existing, _)| *existing != id);
            removed |= chain.len() != before;
            !chain.is_empty()
        });
        removed
    }

    pub fn for_name(&self, name: &str) -> Vec<CapsInterceptor> {
        self.by_name
            .get(name)
            .map(|chain| chain.iter().map(|(_, interceptor)| interceptor.clone()).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sim() -> SocketAddr {
        "10.0.0.5:13000".parse().unwrap()
    }

    #[test]
    fn lookup_ignores_query() {
        let mut registry = CapabilityRegistry::default();
        registry.register(CapabilityRecord::new("https://sim:12043/cap/abc", sim(), "EventQueueGet"));

        let found = registry.get("https://sim:12043/cap/abc?ack=3").unwrap();
        assert_eq!(found.name(), "EventQueueGet");
        assert!(registry.get("https://sim:12043/cap/abd").is_none());

        registry.clear();
        assert!(registry.is_empty());
    }

    #[test]
    fn rediscovered_capability_keeps_interceptors() {
        let mut registry = CapabilityRegistry::default();
        let url = "https://sim:12043/cap/eq";
        let first = registry.register(CapabilityRecord::new(url, sim(), "EventQueueGet"));
        first.add_interceptor(|_, _| Ok(false));

        let again = registry.register(CapabilityRecord::new(url, sim(), "EventQueueGet"));
        assert!(Arc::ptr_eq(&first, &again));
        let found = registry.get(url).unwrap();
        assert_eq!(found.interceptors().len(), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn asset_capabilities_are_binary() {
        let texture = CapabilityRecord::new("https://sim/t", sim(), "GetTexture");
        assert_eq!(texture.response_encoding(), CapsEncoding::Binary);
        let seed = CapabilityRecord::new("https://sim/s", sim(), "SeedCapability");
        assert_eq!(seed.request_encoding(), CapsEncoding::Llsd);
    }

    #[test]
    fn interceptors_can_be_removed() {
        let record = CapabilityRecord::new("https://sim/s", sim(), "SeedCapability");
        let id = record.add_interceptor(|_, _| Ok(false));
        record.add_interceptor(|_, _| Ok(true));
        assert_eq!(record.interceptors().len(), 2);
        assert!(record.remove_interceptor(id));
        assert!(!record.remove_interceptor(id));
        assert_eq!(record.interceptors().len(), 1);

        let mut named = NamedInterceptors::default();
        let id = named.add("EventQueueGet", interceptor(|_, _| Ok(false)));
        assert_eq!(named.for_name("EventQueueGet").len(), 1);
        assert!(named.for_name("SeedCapability").is_empty());
        assert!(named.remove(id));
        assert!(named.for_name("EventQueueGet").is_empty());
    }
}
