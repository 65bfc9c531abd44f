use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::client::conn::http1::SendRequest;
use hyper::header::{self, HeaderValue};
use hyper::{HeaderMap, Method, Request, Response, Uri};
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::pac::ProxyServer;

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Response body type used throughout the proxy.
pub type Body = BoxBody<Bytes, hyper::Error>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to dial {0}: {1}")]
    Dial(String, #[source] io::Error),
    #[error("timed out dialing {0}")]
    DialTimeout(String),
    #[error("TLS handshake with {0} failed: {1}")]
    Tls(String, #[source] io::Error),
    #[error("{0} is not a valid TLS server name")]
    InvalidHost(String),
    #[error("HTTP exchange failed: {0}")]
    Http(#[from] hyper::Error),
    #[error("invalid outbound request: {0}")]
    Request(#[from] hyper::http::Error),
}

impl TransportError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::DialTimeout(_))
    }
}

/// Workaround for `only auto traits can be used as additional traits in a
/// trait object`.
pub trait OutboundStreamIo: tokio::io::AsyncRead + tokio::io::AsyncWrite {}
impl<T: tokio::io::AsyncRead + tokio::io::AsyncWrite> OutboundStreamIo for T {}

pub type OutboundStream = Box<dyn OutboundStreamIo + Send + Unpin>;

/// Opens a TCP connection, optionally wrapped in TLS (for `HTTPS` PAC
/// entries, where the proxy itself is reached over TLS).
pub async fn dial(host: &str, port: u16, tls: bool) -> Result<OutboundStream, TransportError> {
    let addr = format!("{host}:{port}");
    let tcp = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&addr))
        .await
        .map_err(|_| TransportError::DialTimeout(addr.clone()))?
        .map_err(|e| TransportError::Dial(addr.clone(), e))?;
    if !tls {
        return Ok(Box::new(tcp));
    }

    let domain = ServerName::try_from(host.to_string())
        .map_err(|_| TransportError::InvalidHost(host.to_string()))?;
    debug!("performing a TLS handshake with {addr}");
    let stream = tls_connector()
        .connect(domain, tcp)
        .await
        .map_err(|e| TransportError::Tls(addr, e))?;
    Ok(Box::new(stream))
}

/// TLS configuration for reaching HTTPS upstream proxies, verified against
/// the system trust store.
fn tls_connector() -> &'static TlsConnector {
    static CONNECTOR: OnceLock<TlsConnector> = OnceLock::new();
    CONNECTOR.get_or_init(|| {
        let loaded = rustls_native_certs::load_native_certs();
        for err in &loaded.errors {
            warn!("failed to load a system root certificate: {err}");
        }
        let mut roots = RootCertStore::empty();
        let (added, ignored) = roots.add_parsable_certificates(loaded.certs);
        debug!("loaded {added} system root certificates ({ignored} ignored)");
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        TlsConnector::from(std::sync::Arc::new(config))
    })
}

/// The request an authenticator (re)sends to an upstream: the inbound
/// request with hop-by-hop headers removed and the body buffered so the
/// exchange can be replayed with different credentials.
#[derive(Clone)]
pub struct ProxyRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ProxyRequest {
    pub fn to_request(
        &self,
        proxy_authorization: Option<HeaderValue>,
    ) -> Result<Request<Full<Bytes>>, TransportError> {
        let mut request = Request::builder()
            .method(self.method.clone())
            .uri(self.uri.clone())
            .body(Full::new(self.body.clone()))
            .map_err(TransportError::Request)?;
        *request.headers_mut() = self.headers.clone();
        if let Some(value) = proxy_authorization {
            request
                .headers_mut()
                .insert(header::PROXY_AUTHORIZATION, value);
        }
        Ok(request)
    }
}

/// One HTTP exchange over some transport. Implemented by [`Upstream`] (a
/// real connection) and by scripted stand-ins in tests.
pub trait RoundTripper: Send {
    fn round_trip(
        &mut self,
        request: Request<Full<Bytes>>,
    ) -> impl Future<Output = Result<Response<Body>, TransportError>> + Send;
}

/// A single pinned connection to an upstream.
///
/// All round trips on one `Upstream` value use the same TCP connection,
/// which is what NTLM's connection-bound handshake requires: the Type 3
/// message must travel on the socket that received the Type 2 challenge.
pub struct Upstream {
    host: String,
    port: u16,
    sender: SendRequest<Full<Bytes>>,
}

impl Upstream {
    pub async fn open(host: &str, port: u16, tls: bool) -> Result<Self, TransportError> {
        let stream = dial(host, port, tls).await?;
        let io = TokioIo::new(stream);
        let (sender, conn) = hyper::client::conn::http1::Builder::new()
            .handshake(io)
            .await?;
        // The connection task must be polled for requests to make progress,
        // and `with_upgrades` lets a 2xx CONNECT response hand the socket
        // back as a tunnel.
        let peer = format!("{host}:{port}");
        tokio::spawn(async move {
            if let Err(err) = conn.with_upgrades().await {
                debug!("connection to {peer} ended: {err}");
            }
        });
        Ok(Upstream {
            host: host.to_string(),
            port,
            sender,
        })
    }
}

impl RoundTripper for Upstream {
    fn round_trip(
        &mut self,
        request: Request<Full<Bytes>>,
    ) -> impl Future<Output = Result<Response<Body>, TransportError>> + Send {
        async move {
            self.sender.ready().await?;
            let response = self.sender.send_request(request).await?;
            Ok(response.map(|body| body.boxed()))
        }
    }
}

/// Connection pool keyed by upstream address. No pipelining: a checked-out
/// connection serves one logical operation (which may be several round
/// trips during an authentication handshake) before it is returned or
/// dropped.
pub struct Pool {
    idle: Mutex<HashMap<(String, u16), Vec<SendRequest<Full<Bytes>>>>>,
}

impl Pool {
    pub fn new() -> Self {
        Pool {
            idle: Mutex::new(HashMap::new()),
        }
    }

    /// Returns an unused-or-new connection to the given proxy.
    pub async fn checkout(&self, proxy: &ProxyServer) -> Result<Upstream, TransportError> {
        let key = (proxy.host.clone(), proxy.port);
        loop {
            let sender = {
                let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
                idle.get_mut(&key).and_then(Vec::pop)
            };
            match sender {
                Some(sender) if !sender.is_closed() => {
                    debug!("reusing pooled connection to {proxy}");
                    return Ok(Upstream {
                        host: proxy.host.clone(),
                        port: proxy.port,
                        sender,
                    });
                }
                Some(_) => continue, // peer hung up while pooled
                None => break,
            }
        }
        Upstream::open(&proxy.host, proxy.port, proxy.tls).await
    }

    /// Returns a connection that is known idle (its last response fully
    /// consumed and not upgraded to a tunnel).
    pub fn checkin(&self, upstream: Upstream) {
        if upstream.sender.is_closed() {
            return;
        }
        let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
        idle.entry((upstream.host, upstream.port))
            .or_default()
            .push(upstream.sender);
    }
}
