//! Forwarding of capability requests. The client requests
//! `{base}{real url}`; the real URL is requested on its behalf,
//! with interceptors given a look at LLSD bodies on the way.

use crate::{
    caps::{CapabilityRecord, CapsEncoding, CapsExchange, CapsInterceptor, CapsStage},
    llsd::Llsd,
    proxy::Proxy,
};
use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode, Uri},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures::TryStreamExt;
use std::{
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

/// Largest request body accepted from the client.
const MAX_REQUEST_BODY: usize = 16 * 1024 * 1024;

/// Request headers that describe the client's connection to us
/// rather than the request itself.
const DROPPED_REQUEST_HEADERS: [HeaderName; 10] = [
    header::CONNECTION,
    header::HOST,
    header::CONTENT_LENGTH,
    header::TRANSFER_ENCODING,
    header::TE,
    header::TRAILER,
    header::UPGRADE,
    header::EXPECT,
    header::PROXY_AUTHORIZATION,
    header::RANGE,
];

const DROPPED_RESPONSE_HEADERS: [HeaderName; 3] = [
    header::CONNECTION,
    header::CONTENT_LENGTH,
    header::TRANSFER_ENCODING,
];

/// Extracts the real capability URL from a request path, repairing
/// `/https:/host` where a client collapsed the double slash.
fn capability_url(uri: &Uri) -> Option<String> {
    let path = uri.path().strip_prefix('/')?;
    let mut url = ["https:/", "http:/"]
        .iter()
        .find_map(|scheme| {
            let rest = path.strip_prefix(scheme)?;
            Some(match rest.strip_prefix('/') {
                Some(_) => path.to_owned(),
                None => format!("{scheme}/{rest}"),
            })
        })?;
    if let Some(query) = uri.query() {
        url.push('?');
        url.push_str(query);
    }
    Some(url)
}

/// Normalizes a single `bytes=first-last` or `bytes=first-` range.
fn parse_range(value: &HeaderValue) -> Option<HeaderValue> {
    let spec = value.to_str().ok()?.trim().strip_prefix("bytes=")?;
    let (first, last) = spec.split_once('-')?;
    let first: u64 = first.trim().parse().ok()?;
    let normalized = match last.trim() {
        "" => format!("bytes={first}-"),
        last => {
            let last: u64 = last.parse().ok()?;
            if last < first {
                return None;
            }
            format!("bytes={first}-{last}")
        }
    };
    HeaderValue::from_str(&normalized).ok()
}

fn forwarded_headers(headers: &HeaderMap, intercepted: bool) -> HeaderMap {
    let mut forwarded = HeaderMap::new();
    for (name, value) in headers {
        if DROPPED_REQUEST_HEADERS.contains(name)
            || name.as_str() == "keep-alive"
            || name.as_str() == "proxy-connection"
        {
            continue;
        }
        // Intercepted bodies must arrive uncompressed to be decoded.
        if intercepted && *name == header::ACCEPT_ENCODING {
            continue;
        }
        forwarded.append(name.clone(), value.clone());
    }
    if let Some(range) = headers.get(header::RANGE) {
        match parse_range(range) {
            Some(range) => {
                forwarded.insert(header::RANGE, range);
            }
            None => tracing::warn!("Ignoring unsupported Range {range:?}"),
        }
    }
    forwarded
}

fn llsd_response(document: &Llsd) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/llsd+xml")],
        document.to_xml(),
    )
        .into_response()
}

/// Runs interceptors for one stage. Returns `true` if one of them
/// answered the request itself.
fn run_interceptors(interceptors: &[CapsInterceptor], exchange: &mut CapsExchange, stage: CapsStage) -> bool {
    for interceptor in interceptors {
        let result = panic::catch_unwind(AssertUnwindSafe(|| interceptor(exchange, stage)));
        match result {
            Ok(Ok(true)) if stage == CapsStage::Request => return true,
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::error!(
                "{stage} interceptor on {} failed: {e:#}",
                exchange.capability().name()
            ),
            Err(_) => tracing::error!(
                "{stage} interceptor on {} panicked",
                exchange.capability().name()
            ),
        }
    }
    false
}

fn upstream_failure(url: &str, error: reqwest::Error) -> Response {
    if error.is_timeout() {
        tracing::warn!("Capability {url} timed out");
        StatusCode::GATEWAY_TIMEOUT.into_response()
    } else {
        tracing::warn!("Capability {url} failed: {error}");
        StatusCode::BAD_GATEWAY.into_response()
    }
}

pub(crate) async fn handle(State(proxy): State<Proxy>, request: Request) -> Response {
    let Some(url) = capability_url(request.uri()) else {
        tracing::debug!("No capability at {}", request.uri());
        return StatusCode::NOT_FOUND.into_response();
    };
    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, MAX_REQUEST_BODY).await {
        Ok(body) => body,
        Err(e) => {
            tracing::warn!("Failed to read request for {url}: {e}");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    let record = proxy.capability(&url);
    let interceptors = record
        .as_deref()
        .map(|record| proxy.interceptors_for(record))
        .unwrap_or_default();
    match &record {
        Some(record) => tracing::debug!("{} {} ({})", parts.method, url, record.name()),
        None => tracing::debug!("{} {} (unknown capability)", parts.method, url),
    }

    let mut exchange = None;
    let mut body = body;
    if let (Some(record), false) = (&record, interceptors.is_empty()) {
        let (intercepted, short_circuit) = intercept_request(&proxy, record, &interceptors, &body);
        if short_circuit {
            return llsd_response(&intercepted.exchange.response.unwrap_or_default());
        }
        if let Some(rewritten) = intercepted.request_rewritten {
            body = Bytes::from(rewritten);
        }
        exchange = Some(intercepted.exchange);
    }

    let upstream = proxy
        .shared()
        .http
        .request(parts.method.clone(), &url)
        .headers(forwarded_headers(&parts.headers, exchange.is_some()))
        .timeout(proxy.config().caps_timeout())
        .body(body)
        .send()
        .await;
    let upstream = match upstream {
        Ok(upstream) => upstream,
        Err(e) => return upstream_failure(&url, e),
    };

    let status = upstream.status();
    let mut headers = upstream.headers().clone();
    for name in DROPPED_RESPONSE_HEADERS {
        headers.remove(name);
    }

    let decode = exchange.is_some()
        && status.is_success()
        && record
            .as_deref()
            .is_some_and(|record| record.response_encoding() == CapsEncoding::Llsd);
    let body = match exchange.take().filter(|_| decode) {
        Some(mut exchange) => {
            let raw = match upstream.bytes().await {
                Ok(raw) => raw,
                Err(e) => return upstream_failure(&url, e),
            };
            match Llsd::from_xml(&raw) {
                Ok(document) => {
                    exchange.response = Some(document);
                    run_interceptors(&interceptors, &mut exchange, CapsStage::Response);
                    match exchange.response {
                        Some(document) => Body::from(document.to_xml()),
                        None => Body::from(raw),
                    }
                }
                Err(e) => {
                    tracing::warn!("Reply from {url} is not LLSD ({e}); passing it through");
                    Body::from(raw)
                }
            }
        }
        None => Body::from_stream(
            upstream
                .bytes_stream()
                .inspect_err(move |e| tracing::warn!("Stream from {url} broke off: {e}")),
        ),
    };

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

struct InterceptedRequest {
    exchange: CapsExchange,
    /// Re-encoded body, if an interceptor changed the request.
    request_rewritten: Option<String>,
}

/// Decodes the request body if the capability speaks LLSD and runs
/// the request stage. The second value is `true` when an interceptor
/// answered on the server's behalf.
fn intercept_request(
    proxy: &Proxy,
    record: &Arc<CapabilityRecord>,
    interceptors: &[CapsInterceptor],
    body: &Bytes,
) -> (InterceptedRequest, bool) {
    let request = if record.request_encoding() == CapsEncoding::Llsd && !body.is_empty() {
        match Llsd::from_xml(body) {
            Ok(document) => Some(document),
            Err(e) => {
                tracing::debug!("Request to {} is not LLSD: {e}", record.name());
                None
            }
        }
    } else {
        None
    };

    let mut exchange = CapsExchange::new(Arc::clone(record), proxy.clone(), request.clone());
    let short_circuit = run_interceptors(interceptors, &mut exchange, CapsStage::Request);
    let request_rewritten = match (&request, &exchange.request) {
        (Some(before), Some(after)) if before != after => Some(after.to_xml()),
        (None, Some(after)) => Some(after.to_xml()),
        _ => None,
    };
    (
        InterceptedRequest {
            exchange,
            request_rewritten,
        },
        short_circuit,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_capability_url() {
        let uri: Uri = "/https://sim.example:12043/cap/abc?x=1".parse().unwrap();
        assert_eq!(
            capability_url(&uri).as_deref(),
            Some("https://sim.example:12043/cap/abc?x=1")
        );

        let collapsed: Uri = "/https:/sim.example:12043/cap/abc".parse().unwrap();
        assert_eq!(
            capability_url(&collapsed).as_deref(),
            Some("https://sim.example:12043/cap/abc")
        );

        let plain: Uri = "/http://sim/cap".parse().unwrap();
        assert_eq!(capability_url(&plain).as_deref(), Some("http://sim/cap"));

        let elsewhere: Uri = "/favicon.ico".parse().unwrap();
        assert_eq!(capability_url(&elsewhere), None);
    }

    #[test]
    fn normalizes_ranges() {
        let parse = |text: &str| parse_range(&HeaderValue::from_str(text).unwrap());
        assert_eq!(parse("bytes=0-99").unwrap(), "bytes=0-99");
        assert_eq!(parse("bytes= 100 -").unwrap(), "bytes=100-");
        assert!(parse("bytes=99-0").is_none());
        assert!(parse("items=0-1").is_none());
        assert!(parse("bytes=0-1,5-6").is_none());
    }

    #[test]
    fn strips_connection_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("127.0.0.1:8080"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
        headers.insert(header::RANGE, HeaderValue::from_static("bytes=0-9"));
        headers.insert("x-custom", HeaderValue::from_static("1"));

        let forwarded = forwarded_headers(&headers, false);
        assert!(forwarded.get(header::HOST).is_none());
        assert!(forwarded.get(header::CONNECTION).is_none());
        assert_eq!(forwarded.get(header::RANGE).unwrap(), "bytes=0-9");
        assert_eq!(forwarded.get("x-custom").unwrap(), "1");
        assert_eq!(forwarded.get(header::ACCEPT_ENCODING).unwrap(), "gzip");

        let intercepted = forwarded_headers(&headers, true);
        assert!(intercepted.get(header::ACCEPT_ENCODING).is_none());
    }
}
