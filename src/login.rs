//! Login front door. The client logs in through the proxy, which
//! forwards to the real login server and rewrites the simulator
//! address and seed capability in the reply.

pub mod xmlrpc;

use crate::{llsd::Llsd, proxy::Proxy};
use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use std::{
    net::{IpAddr, SocketAddr, SocketAddrV4},
    sync::Arc,
};
use xmlrpc::{MethodCall, MethodResponse, Value};

/// A login request on its way to the login server.
#[derive(Debug, Clone, PartialEq)]
pub enum LoginRequest {
    XmlRpc(MethodCall),
    Llsd(Llsd),
}

/// A login reply on its way to the client, after address rewriting.
#[derive(Debug, Clone, PartialEq)]
pub enum LoginResponse {
    XmlRpc(MethodResponse),
    Llsd(Llsd),
}

pub type LoginRequestHook = Arc<dyn Fn(&mut LoginRequest) -> anyhow::Result<()> + Send + Sync>;
pub type LoginResponseHook = Arc<dyn Fn(&mut LoginResponse) -> anyhow::Result<()> + Send + Sync>;

#[derive(Default)]
pub(crate) struct LoginHooks {
    pub request: Option<LoginRequestHook>,
    pub response: Option<LoginResponseHook>,
}

#[derive(Debug, thiserror::Error)]
enum LoginError {
    #[error("malformed login request: {0}")]
    BadRequest(#[source] xmlrpc::XmlRpcError),
    #[error("login server timed out")]
    Timeout,
    #[error("login server unreachable: {0}")]
    Upstream(#[source] reqwest::Error),
    #[error("malformed login reply: {0}")]
    BadReply(String),
    #[error("login reply lacks {0}")]
    MissingField(&'static str),
    #[error(transparent)]
    Relay(#[from] anyhow::Error),
}

impl From<reqwest::Error> for LoginError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            LoginError::Timeout
        } else {
            LoginError::Upstream(e)
        }
    }
}

impl LoginError {
    fn status(&self, llsd: bool) -> StatusCode {
        match self {
            LoginError::BadRequest(_) => StatusCode::BAD_REQUEST,
            // LLSD logins report every upstream failure as a 500.
            _ if llsd => StatusCode::INTERNAL_SERVER_ERROR,
            LoginError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            LoginError::Upstream(_) | LoginError::BadReply(_) => StatusCode::BAD_GATEWAY,
            LoginError::MissingField(_) | LoginError::Relay(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

fn is_llsd(content_type: &str) -> bool {
    let essence = content_type.split(';').next().unwrap_or_default().trim();
    ["application/xml+llsd", "application/llsd+xml", "application/xml"]
        .iter()
        .any(|llsd| essence.eq_ignore_ascii_case(llsd))
}

pub(crate) async fn handle(State(proxy): State<Proxy>, headers: HeaderMap, body: Bytes) -> Response {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    let llsd = is_llsd(content_type);

    let result = if llsd {
        login_llsd(&proxy, content_type, body).await
    } else {
        login_xmlrpc(&proxy, body).await
    };
    match result {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!("Login failed: {e}");
            e.status(llsd).into_response()
        }
    }
}

async fn login_xmlrpc(proxy: &Proxy, body: Bytes) -> Result<Response, LoginError> {
    let call = MethodCall::parse(&body).map_err(LoginError::BadRequest)?;
    let mut request = LoginRequest::XmlRpc(call);
    run_request_hook(proxy, &mut request);
    let body = match request {
        LoginRequest::XmlRpc(call) => call.to_xml(),
        LoginRequest::Llsd(document) => document.to_xml(),
    };

    let reply = forward(proxy, "text/xml", body).await?;
    if !reply.status.is_success() {
        return Ok(passthrough(reply));
    }
    let mut response = MethodResponse::parse(&reply.body).map_err(|e| LoginError::BadReply(e.to_string()))?;

    if let Some(login) = response.login_struct_mut() {
        let sim = match (
            login.member("sim_ip").and_then(Value::as_str),
            login.member("sim_port").and_then(Value::as_int),
        ) {
            (Some(ip), Some(port)) => Some(sim_address(ip, port)?),
            _ => None,
        };
        let seed = login.member("seed_capability").and_then(Value::as_str);
        let (local, seed) = start_session(proxy, sim, seed)?;
        if let Some(local) = local {
            login.set_member("sim_ip", Value::String(local.ip().to_string()));
            login.set_member("sim_port", Value::Int(i32::from(local.port())));
        }
        if let Some(seed) = seed {
            login.set_member("seed_capability", Value::String(seed));
        }
    } else {
        tracing::info!("Login server refused the login");
    }

    let mut response = LoginResponse::XmlRpc(response);
    run_response_hook(proxy, &mut response);
    let body = match response {
        LoginResponse::XmlRpc(response) => response.to_xml(),
        LoginResponse::Llsd(document) => document.to_xml(),
    };
    Ok((StatusCode::OK, [(header::CONTENT_TYPE, "text/xml")], body).into_response())
}

async fn login_llsd(proxy: &Proxy, content_type: &str, body: Bytes) -> Result<Response, LoginError> {
    let body = match Llsd::from_xml(&body) {
        Ok(document) => {
            let mut request = LoginRequest::Llsd(document);
            run_request_hook(proxy, &mut request);
            match request {
                LoginRequest::Llsd(document) => document.to_xml(),
                LoginRequest::XmlRpc(call) => call.to_xml(),
            }
        }
        Err(e) => {
            tracing::debug!("LLSD login request did not parse ({e}); forwarding as is");
            String::from_utf8_lossy(&body).into_owned()
        }
    };

    let reply = forward(proxy, content_type, body).await?;
    let mut document = Llsd::from_xml(&reply.body).map_err(|e| LoginError::BadReply(e.to_string()))?;
    if !matches!(document, Llsd::Map(_)) {
        return Err(LoginError::BadReply("reply is not a map".to_owned()));
    }

    let text = |key: &str| document.get(key).and_then(llsd_text);
    let (Some(ip), Some(port), Some(seed)) = (text("sim_ip"), text("sim_port"), text("seed_capability"))
    else {
        tracing::warn!("LLSD login reply lacks a simulator: {document:?}");
        return Err(LoginError::MissingField("sim_ip, sim_port or seed_capability"));
    };
    let port = port
        .trim()
        .parse()
        .map_err(|_| LoginError::BadReply(format!("bad sim_port {port:?}")))?;
    let sim = sim_address(&ip, port)?;
    let (local, seed) = start_session(proxy, Some(sim), Some(&seed))?;

    if let Llsd::Map(map) = &mut document {
        if let Some(local) = local {
            map.insert("sim_ip".to_owned(), Llsd::String(local.ip().to_string()));
            map.insert("sim_port".to_owned(), Llsd::Integer(i32::from(local.port())));
        }
        if let Some(seed) = seed {
            map.insert("seed_capability".to_owned(), Llsd::String(seed));
        }
    }

    let mut response = LoginResponse::Llsd(document);
    run_response_hook(proxy, &mut response);
    let body = match response {
        LoginResponse::Llsd(document) => document.to_xml(),
        LoginResponse::XmlRpc(response) => response.to_xml(),
    };
    Ok((StatusCode::OK, [(header::CONTENT_TYPE, "application/llsd+xml")], body).into_response())
}

fn llsd_text(value: &Llsd) -> Option<String> {
    match value {
        Llsd::String(text) | Llsd::Uri(text) => Some(text.clone()),
        Llsd::Integer(number) => Some(number.to_string()),
        _ => None,
    }
}

fn sim_address(ip: &str, port: i32) -> Result<SocketAddr, LoginError> {
    let ip: IpAddr = ip
        .trim()
        .parse()
        .map_err(|_| LoginError::BadReply(format!("bad sim_ip {ip:?}")))?;
    let port = u16::try_from(port).map_err(|_| LoginError::BadReply(format!("bad sim_port {port}")))?;
    Ok(SocketAddr::new(ip, port))
}

/// Resets the session for a new login, relays the login simulator
/// and makes it the active circuit.
fn start_session(
    proxy: &Proxy,
    sim: Option<SocketAddr>,
    seed: Option<&str>,
) -> Result<(Option<SocketAddrV4>, Option<String>), LoginError> {
    let shared = proxy.shared();
    let mut session = shared.session.lock();
    session.reset();
    match sim {
        Some(sim) => {
            let (local, seed) = session.proxy_endpoint(shared, sim, seed, true)?;
            tracing::info!("Login to {sim}, relayed through {local}");
            Ok((Some(local), seed))
        }
        None => {
            let seed = seed
                .filter(|url| !url.is_empty())
                .map(|url| session.register_seed(shared, url, SocketAddr::from(([0, 0, 0, 0], 0))));
            Ok((None, seed))
        }
    }
}

struct Reply {
    status: StatusCode,
    content_type: Option<String>,
    body: Bytes,
}

async fn forward(proxy: &Proxy, content_type: &str, body: String) -> Result<Reply, LoginError> {
    let config = proxy.config();
    let response = proxy
        .shared()
        .http
        .post(&config.remote_login_uri)
        .header(header::CONTENT_TYPE, content_type)
        .timeout(config.login_timeout())
        .body(body)
        .send()
        .await?;
    let status = response.status();
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);
    let body = response.bytes().await?;
    Ok(Reply {
        status,
        content_type,
        body,
    })
}

fn passthrough(reply: Reply) -> Response {
    tracing::warn!("Login server answered {}", reply.status);
    let content_type = reply.content_type.unwrap_or_else(|| "text/plain".to_owned());
    (reply.status, [(header::CONTENT_TYPE, content_type)], reply.body).into_response()
}

fn run_request_hook(proxy: &Proxy, request: &mut LoginRequest) {
    let hook = proxy.shared().session.lock().login_hooks.request.clone();
    if let Some(hook) = hook {
        if let Err(e) = hook(request) {
            tracing::error!("Login request hook failed: {e:#}");
        }
    }
}

fn run_response_hook(proxy: &Proxy, response: &mut LoginResponse) {
    let hook = proxy.shared().session.lock().login_hooks.response.clone();
    if let Some(hook) = hook {
        if let Err(e) = hook(response) {
            tracing::error!("Login response hook failed: {e:#}");
        }
    }
}
