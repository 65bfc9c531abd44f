use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::header::{self, HeaderName, HeaderValue};
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use crate::auth::AuthError;
use crate::pac::{Candidate, ProxyServer};
use crate::proxy::context::{next_request_id, RequestContext};
use crate::proxy::transport::{self, Body, ProxyRequest, RoundTripper, TransportError, Upstream};
use crate::proxy::ProxyState;

/// Entry point for every inbound request.
///
/// A request is a proxy request iff it is a `CONNECT` or its target is in
/// absolute-URI form; anything else belongs to the local mux. One log line
/// is emitted per completed request, carrying the id for correlation.
pub async fn handle(
    request: Request<Incoming>,
    state: std::sync::Arc<ProxyState>,
) -> Result<Response<Body>, hyper::Error> {
    let ctx = RequestContext::new(next_request_id());
    let method = request.method().clone();
    let uri = request.uri().clone();

    let (response, proxy) = if request.method() == Method::CONNECT {
        handle_connect(request, &state, &ctx).await?
    } else if request.uri().scheme().is_some() {
        handle_forward(request, &state, &ctx).await?
    } else {
        (handle_local(request), None)
    };

    info!(
        id = ctx.id,
        status = response.status().as_u16(),
        method = %method,
        url = %uri,
        proxy = proxy.map(|p| p.to_string()).unwrap_or_default(),
        "request complete"
    );
    Ok(response)
}

/// Seam for the local (non-proxy) handler. The core mounts nothing here.
fn handle_local(_request: Request<Incoming>) -> Response<Body> {
    status_response(StatusCode::NOT_FOUND)
}

/// Forwards an absolute-URI request through each candidate in turn: an
/// ordinary origin round trip for DIRECT, the authentication chain for a
/// proxy. Unreachable proxies are blocklisted and the next candidate tried.
async fn handle_forward(
    request: Request<Incoming>,
    state: &ProxyState,
    ctx: &RequestContext,
) -> Result<(Response<Body>, Option<ProxyServer>), hyper::Error> {
    let url = request.uri().to_string();
    let candidates = state.finder.find(&url).await;

    let Some(origin) = origin_target(request.uri()) else {
        debug!(id = ctx.id, "absolute-URI request without a usable host");
        return Ok((status_response(StatusCode::BAD_REQUEST), None));
    };

    // Buffer the body so the exchange can be replayed: the authentication
    // chain may need to send it more than once.
    let (parts, body) = request.into_parts();
    let body = body.collect().await?.to_bytes();
    let mut headers = parts.headers;
    strip_hop_by_hop(&mut headers);
    headers.remove(header::CONTENT_LENGTH); // re-framed from the buffered body
    let proxy_request = ProxyRequest {
        method: parts.method,
        uri: parts.uri,
        headers,
        body,
    };

    let mut last_error: Option<AuthError> = None;
    for candidate in candidates {
        match candidate {
            Candidate::Direct => match forward_direct(&proxy_request, &origin).await {
                Ok(response) => return Ok((finish_response(response), None)),
                Err(err) => {
                    debug!(id = ctx.id, "direct connection to {} failed: {err}", origin.0);
                    last_error = Some(err.into());
                }
            },
            Candidate::Proxy(proxy) => {
                let attempt = ctx.with_proxy(proxy.clone());
                match forward_via_proxy(&proxy_request, state, &attempt, &proxy).await {
                    Ok(response) => return Ok((finish_response(response), Some(proxy))),
                    Err(err) => {
                        warn!(id = ctx.id, "upstream proxy {proxy} failed: {err}");
                        state.finder.blocklist().block(&proxy.host);
                        last_error = Some(err);
                    }
                }
            }
        }
    }
    Ok((gateway_error_response(last_error.as_ref()), None))
}

async fn forward_direct(
    request: &ProxyRequest,
    (host, port, tls): &(String, u16, bool),
) -> Result<Response<Body>, TransportError> {
    let mut upstream = Upstream::open(host, *port, *tls).await?;

    // The origin sees an origin-form request target, not the absolute URI
    // the client sent to us.
    let mut origin_request = request.clone();
    if !origin_request.headers.contains_key(header::HOST) {
        if let Some(authority) = request.uri.authority() {
            if let Ok(value) = HeaderValue::from_str(authority.as_str()) {
                origin_request.headers.insert(header::HOST, value);
            }
        }
    }
    origin_request.uri = origin_form(&request.uri);

    upstream.round_trip(origin_request.to_request(None)?).await
}

async fn forward_via_proxy(
    request: &ProxyRequest,
    state: &ProxyState,
    ctx: &RequestContext,
    proxy: &ProxyServer,
) -> Result<Response<Body>, AuthError> {
    let mut upstream = state.pool.checkout(proxy).await?;
    match &state.auth {
        Some(auth) => auth.authenticate(request, ctx, &mut upstream).await,
        None => Ok(upstream.round_trip(request.to_request(None)?).await?),
    }
}

/// Establishes a CONNECT tunnel. On success the inbound connection is
/// hijacked via the upgrade mechanism and bytes are spliced in both
/// directions until either side closes.
async fn handle_connect(
    request: Request<Incoming>,
    state: &ProxyState,
    ctx: &RequestContext,
) -> Result<(Response<Body>, Option<ProxyServer>), hyper::Error> {
    let Some(authority) = request.uri().authority().cloned() else {
        debug!(id = ctx.id, "CONNECT without an authority target");
        return Ok((status_response(StatusCode::BAD_REQUEST), None));
    };
    let host = authority.host().to_string();
    let port = authority.port_u16().unwrap_or(443);

    let candidates = state.finder.find(&format!("https://{host}:{port}/")).await;
    let mut last_error: Option<AuthError> = None;
    for candidate in candidates {
        match candidate {
            Candidate::Direct => match transport::dial(&host, port, false).await {
                Ok(stream) => {
                    spawn_tunnel(request, stream, ctx.id);
                    return Ok((status_response(StatusCode::OK), None));
                }
                Err(err) => {
                    debug!(id = ctx.id, "direct connection to {host}:{port} failed: {err}");
                    last_error = Some(err.into());
                }
            },
            Candidate::Proxy(proxy) => {
                let attempt = ctx.with_proxy(proxy.clone());
                match connect_via_proxy(state, &attempt, &authority, &proxy).await {
                    Ok(ConnectOutcome::Established(upgraded)) => {
                        spawn_tunnel(request, TokioIo::new(upgraded), ctx.id);
                        return Ok((status_response(StatusCode::OK), Some(proxy)));
                    }
                    Ok(ConnectOutcome::Refused(response)) => {
                        // The upstream answered the CONNECT with a real
                        // response (407 and friends): relay it.
                        return Ok((finish_response(response), Some(proxy)));
                    }
                    Err(err) => {
                        warn!(id = ctx.id, "upstream proxy {proxy} failed: {err}");
                        state.finder.blocklist().block(&proxy.host);
                        last_error = Some(err);
                    }
                }
            }
        }
    }
    Ok((gateway_error_response(last_error.as_ref()), None))
}

enum ConnectOutcome {
    Established(hyper::upgrade::Upgraded),
    Refused(Response<Body>),
}

async fn connect_via_proxy(
    state: &ProxyState,
    ctx: &RequestContext,
    authority: &hyper::http::uri::Authority,
    proxy: &ProxyServer,
) -> Result<ConnectOutcome, AuthError> {
    let mut upstream = state.pool.checkout(proxy).await.map_err(AuthError::from)?;

    let uri = Uri::try_from(authority.as_str())
        .map_err(|e| AuthError::Transport(TransportError::Request(e.into())))?;
    let mut headers = hyper::HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(authority.as_str()) {
        headers.insert(header::HOST, value);
    }
    let connect_request = ProxyRequest {
        method: Method::CONNECT,
        uri,
        headers,
        body: Bytes::new(),
    };

    let mut response = match &state.auth {
        Some(auth) => auth.authenticate(&connect_request, ctx, &mut upstream).await?,
        None => {
            upstream
                .round_trip(connect_request.to_request(None)?)
                .await?
        }
    };

    if response.status().is_success() {
        let upgraded = hyper::upgrade::on(&mut response)
            .await
            .map_err(TransportError::Http)?;
        return Ok(ConnectOutcome::Established(upgraded));
    }

    // Failure responses are small; buffering them leaves the connection
    // idle so it can go back to the pool for the next attempt.
    let (parts, body) = response.into_parts();
    let response = match body.collect().await {
        Ok(collected) => {
            state.pool.checkin(upstream);
            Response::from_parts(parts, full_body(collected.to_bytes()))
        }
        Err(_) => Response::from_parts(parts, empty_body()),
    };
    Ok(ConnectOutcome::Refused(response))
}

/// Splices bytes between the (upgraded) inbound connection and the tunnel
/// to the origin or upstream. Runs detached; the 200 goes back to the
/// client while this task waits for the upgrade to complete.
fn spawn_tunnel<T>(request: Request<Incoming>, mut tunnel: T, id: u64)
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        match hyper::upgrade::on(request).await {
            Ok(upgraded) => {
                let mut client = TokioIo::new(upgraded);
                match tokio::io::copy_bidirectional(&mut client, &mut tunnel).await {
                    Ok((up, down)) => {
                        debug!(id, "tunnel closed ({up} bytes out, {down} bytes back)")
                    }
                    Err(err) => debug!(id, "tunnel error: {err}"),
                }
            }
            Err(err) => debug!(id, "client upgrade failed: {err}"),
        }
    });
}

/// Host, port, and TLS flag for dialing an origin directly.
fn origin_target(uri: &Uri) -> Option<(String, u16, bool)> {
    let host = uri.host()?;
    let tls = uri.scheme_str() == Some("https");
    let port = uri.port_u16().unwrap_or(if tls { 443 } else { 80 });
    Some((host.to_string(), port, tls))
}

fn origin_form(uri: &Uri) -> Uri {
    match uri.path_and_query() {
        Some(pq) => Uri::try_from(pq.as_str()).unwrap_or_else(|_| Uri::from_static("/")),
        None => Uri::from_static("/"),
    }
}

const HOP_BY_HOP_HEADERS: [&str; 7] = [
    "connection",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Removes hop-by-hop headers, including any header named in the
/// `Connection` list, per RFC 7230 §6.1.
fn strip_hop_by_hop(headers: &mut hyper::HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| name.trim().parse::<HeaderName>().ok())
        .collect();
    for name in listed {
        headers.remove(&name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

fn finish_response(mut response: Response<Body>) -> Response<Body> {
    strip_hop_by_hop(response.headers_mut());
    response
}

fn status_response(status: StatusCode) -> Response<Body> {
    let mut response = Response::new(empty_body());
    *response.status_mut() = status;
    response
}

/// All-candidates-failed response: 504 when the last failure was a dial
/// timeout, 502 otherwise. Internal error details never reach the client.
fn gateway_error_response(last_error: Option<&AuthError>) -> Response<Body> {
    let timed_out = matches!(last_error, Some(AuthError::Transport(t)) if t.is_timeout());
    status_response(if timed_out {
        StatusCode::GATEWAY_TIMEOUT
    } else {
        StatusCode::BAD_GATEWAY
    })
}

fn empty_body() -> Body {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

fn full_body(bytes: Bytes) -> Body {
    Full::new(bytes).map_err(|never| match never {}).boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_hop_by_hop_removes_standard_headers() {
        let mut headers = hyper::HeaderMap::new();
        headers.insert("proxy-connection", "keep-alive".parse().unwrap());
        headers.insert("proxy-authorization", "Basic xxx".parse().unwrap());
        headers.insert("transfer-encoding", "chunked".parse().unwrap());
        headers.insert("te", "trailers".parse().unwrap());
        headers.insert("upgrade", "websocket".parse().unwrap());
        headers.insert("accept", "*/*".parse().unwrap());
        strip_hop_by_hop(&mut headers);
        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key("accept"));
    }

    #[test]
    fn test_strip_hop_by_hop_removes_connection_listed_headers() {
        let mut headers = hyper::HeaderMap::new();
        headers.insert("connection", "close, x-session-token".parse().unwrap());
        headers.insert("x-session-token", "secret".parse().unwrap());
        headers.insert("x-other", "kept".parse().unwrap());
        strip_hop_by_hop(&mut headers);
        assert!(!headers.contains_key("connection"));
        assert!(!headers.contains_key("x-session-token"));
        assert!(headers.contains_key("x-other"));
    }

    #[test]
    fn test_origin_form_strips_scheme_and_authority() {
        let uri = Uri::from_static("http://www.example.com/a/b?q=1");
        assert_eq!(origin_form(&uri), Uri::from_static("/a/b?q=1"));
        let bare = Uri::from_static("http://www.example.com");
        assert_eq!(origin_form(&bare), Uri::from_static("/"));
    }

    #[test]
    fn test_origin_target_defaults_ports_by_scheme() {
        let http = Uri::from_static("http://www.example.com/x");
        assert_eq!(
            origin_target(&http),
            Some(("www.example.com".to_string(), 80, false))
        );
        let https = Uri::from_static("https://www.example.com/x");
        assert_eq!(
            origin_target(&https),
            Some(("www.example.com".to_string(), 443, true))
        );
        let explicit = Uri::from_static("http://www.example.com:8080/x");
        assert_eq!(
            origin_target(&explicit),
            Some(("www.example.com".to_string(), 8080, false))
        );
    }
}
