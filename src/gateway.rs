//! HTTP listener for logins and capability requests.

use crate::{caps_relay, login, proxy::Proxy};
use axum::{routing::post, Router};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

fn router(proxy: Proxy) -> Router {
    Router::new()
        .route("/", post(login::handle))
        .fallback(caps_relay::handle)
        .with_state(proxy)
}

/// Serves until `shutdown` fires.
pub(crate) async fn serve(listener: TcpListener, proxy: Proxy, shutdown: CancellationToken) {
    let app = router(proxy);
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await;
    if let Err(e) = result {
        tracing::error!("Login listener failed: {e}");
    }
}
