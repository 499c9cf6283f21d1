//! Tunnels carried by HTTP `CONNECT`.
//!
//! A `CONNECT` request whose `Proxy-Authorization` header holds a known key,
//! bare or behind `Basic `, is answered with 200 and upgraded. The upgraded
//! stream then carries the tunnel request header and payload, exactly like
//! the bytes after the key's CR LF on the sniffing listener. Every other
//! request reaches the wrapped site router untouched.

use std::io;
use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header::PROXY_AUTHORIZATION, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    Router,
};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn, Instrument};
use veil_credentials::{CredentialKey, CredentialLedger, KEY_LEN};

use crate::proxy::{HandshakeRelay, RelayError};

#[derive(Clone)]
struct ConnectState {
    ledger: Arc<CredentialLedger>,
    relay: HandshakeRelay,
    verbose: bool,
}

/// Wrap `site` so authenticated `CONNECT` requests become tunnels.
pub fn router(
    site: Router,
    ledger: Arc<CredentialLedger>,
    relay: HandshakeRelay,
    verbose: bool,
) -> Router {
    let state = ConnectState {
        ledger,
        relay,
        verbose,
    };
    site.layer(middleware::from_fn_with_state(state, connect_tunnel))
        .layer(TraceLayer::new_for_http())
}

/// Serve `app` until `shutdown` flips to true.
///
/// Tunnels already upgraded keep running after shutdown.
pub async fn serve(
    listener: TcpListener,
    app: Router,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    info!(bind_addr = %listener.local_addr()?, "CONNECT front listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
            info!("CONNECT front shutting down");
        })
        .await
}

/// Key presented by a tunnel `CONNECT`, if it is one.
fn tunnel_key(request: &Request, ledger: &CredentialLedger) -> Option<CredentialKey> {
    if request.method() != Method::CONNECT {
        return None;
    }
    let auth = request.headers().get(PROXY_AUTHORIZATION)?.as_bytes();
    let auth = auth.strip_prefix(b"Basic ").unwrap_or(auth);
    if auth.len() != KEY_LEN || !ledger.validate(auth) {
        return None;
    }
    CredentialKey::from_bytes(auth).ok()
}

async fn connect_tunnel(
    State(state): State<ConnectState>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(key) = tunnel_key(&request, &state.ledger) else {
        return next.run(request).await;
    };

    let version = request.version();
    if state.verbose {
        info!(key = %key, ?version, "Authenticated CONNECT tunnel");
    } else {
        debug!(key = %key, ?version, "Authenticated CONNECT tunnel");
    }

    let upgrade = hyper::upgrade::on(&mut request);
    tokio::spawn(
        async move {
            match upgrade.await {
                Ok(upgraded) => serve_tunnel(&state, key, TokioIo::new(upgraded)).await,
                Err(e) => debug!(key = %key, error = %e, "CONNECT upgrade failed"),
            }
        }
        .instrument(tracing::info_span!("connect_tunnel")),
    );

    StatusCode::OK.into_response()
}

async fn serve_tunnel<S>(state: &ConnectState, key: CredentialKey, mut stream: S)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let result = state.relay.run(&mut stream).await;

    let traffic = match &result {
        Ok(traffic) => *traffic,
        Err(e) => e.traffic(),
    };
    state
        .ledger
        .consume(&key, traffic.uploaded, traffic.downloaded);

    match result {
        Ok(traffic) => debug!(key = %key, %traffic, "CONNECT tunnel closed"),
        Err(e @ RelayError::Decode(_)) => {
            warn!(key = %key, error = %e, "Rejected CONNECT tunnel request")
        }
        Err(e) => debug!(key = %key, error = %e, "CONNECT tunnel failed"),
    }

    let _ = stream.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn request(method: Method, auth: Option<&str>) -> Request {
        let mut builder = axum::http::Request::builder()
            .method(method)
            .uri("example.com:443");
        if let Some(auth) = auth {
            builder = builder.header(PROXY_AUTHORIZATION, auth);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn test_basic_and_bare_keys_are_accepted() {
        let ledger = CredentialLedger::new();
        let key = ledger.add("hunter2");

        let basic = format!("Basic {key}");
        assert_eq!(
            tunnel_key(&request(Method::CONNECT, Some(&basic)), &ledger),
            Some(key)
        );
        assert_eq!(
            tunnel_key(&request(Method::CONNECT, Some(key.as_str())), &ledger),
            Some(key)
        );
    }

    #[test]
    fn test_other_requests_pass_through() {
        let ledger = CredentialLedger::new();
        let key = ledger.add("hunter2");
        let basic = format!("Basic {key}");
        let unknown = format!("Basic {}", CredentialKey::derive("letmein"));

        assert!(tunnel_key(&request(Method::GET, Some(&basic)), &ledger).is_none());
        assert!(tunnel_key(&request(Method::CONNECT, None), &ledger).is_none());
        assert!(tunnel_key(&request(Method::CONNECT, Some(&unknown)), &ledger).is_none());
        assert!(tunnel_key(&request(Method::CONNECT, Some("Basic dXNlcjpwYXNz")), &ledger).is_none());
    }
}
