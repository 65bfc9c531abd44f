use std::collections::HashMap;

use http_body_util::BodyExt;
use hyper::{Response, StatusCode};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

use crate::proxy::context::RequestContext;
use crate::proxy::transport::{Body, ProxyRequest, RoundTripper, TransportError};

mod basic;
#[cfg(all(unix, feature = "negotiate"))]
mod negotiate;
mod ntlm;

pub use basic::BasicAuthenticator;
#[cfg(all(unix, feature = "negotiate"))]
pub use negotiate::NegotiateAuthenticator;
#[cfg(test)]
pub(crate) use ntlm::challenge_message;
pub use ntlm::{nt_hash, NtlmAuthenticator};

#[derive(Debug, Error)]
pub enum AuthError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("no authentication methods configured")]
    Unauthenticated,
    #[error("malformed NTLM challenge: {0}")]
    BadChallenge(String),
    #[allow(dead_code)] // constructed only with the negotiate feature
    #[error("Negotiate authentication failed: {0}")]
    Negotiate(String),
}

/// Reads an interim response body to completion so its connection can carry
/// the next attempt.
pub(crate) async fn drain(response: Response<Body>) {
    let _ = response.into_body().collect().await;
}

/// One way of answering a 407: all variants share the same contract, "given
/// a request and a round-tripper, produce a response".
pub enum AuthMethod {
    #[cfg(all(unix, feature = "negotiate"))]
    Negotiate(NegotiateAuthenticator),
    Basic(BasicAuthenticator),
    Ntlm(NtlmAuthenticator),
}

impl AuthMethod {
    pub fn name(&self) -> &'static str {
        match self {
            #[cfg(all(unix, feature = "negotiate"))]
            AuthMethod::Negotiate(_) => "Negotiate",
            AuthMethod::Basic(_) => "Basic",
            AuthMethod::Ntlm(_) => "NTLM",
        }
    }

    #[cfg_attr(not(all(unix, feature = "negotiate")), allow(unused_variables))]
    async fn execute<R: RoundTripper>(
        &self,
        request: &ProxyRequest,
        ctx: &RequestContext,
        transport: &mut R,
    ) -> Result<Response<Body>, AuthError> {
        match self {
            #[cfg(all(unix, feature = "negotiate"))]
            AuthMethod::Negotiate(authenticator) => {
                let host = ctx.proxy.as_ref().map(|p| p.host.as_str()).ok_or_else(|| {
                    AuthError::Negotiate("no upstream proxy selected for this request".to_string())
                })?;
                authenticator.authenticate(request, host, transport).await
            }
            AuthMethod::Basic(authenticator) => authenticator.authenticate(request, transport).await,
            AuthMethod::Ntlm(authenticator) => authenticator.authenticate(request, transport).await,
        }
    }
}

/// Tries the configured methods in order and remembers, per upstream host,
/// the first one the upstream accepted.
///
/// Enterprise proxies tend to log failed NTLM attempts, so once a method
/// works for a host we stop offering the others: the cached method is
/// sticky until the process exits.
pub struct MultiAuthenticator {
    methods: Vec<AuthMethod>,
    cache: RwLock<HashMap<String, usize>>,
}

impl MultiAuthenticator {
    pub fn new(methods: Vec<AuthMethod>) -> Self {
        MultiAuthenticator {
            methods,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Produces an authenticated response for `request` over `transport`.
    ///
    /// A transport error aborts immediately; a non-407 response caches the
    /// method that produced it; interim 407 bodies are drained before the
    /// next attempt; the final method's 407 is returned untouched so the
    /// client sees it.
    pub async fn authenticate<R: RoundTripper>(
        &self,
        request: &ProxyRequest,
        ctx: &RequestContext,
        transport: &mut R,
    ) -> Result<Response<Body>, AuthError> {
        if self.methods.is_empty() {
            return Err(AuthError::Unauthenticated);
        }
        let proxy_host = ctx.proxy.as_ref().map(|p| p.host.clone());

        if let Some(host) = &proxy_host {
            let cached = self.cache.read().await.get(host).copied();
            if let Some(index) = cached {
                return self.methods[index].execute(request, ctx, transport).await;
            }
        }

        for (index, method) in self.methods.iter().enumerate() {
            let response = method.execute(request, ctx, transport).await?;
            if response.status() != StatusCode::PROXY_AUTHENTICATION_REQUIRED {
                if let Some(host) = &proxy_host {
                    self.cache.write().await.insert(host.clone(), index);
                    debug!("cached auth method {} for proxy {host}", method.name());
                }
                return Ok(response);
            }
            if index + 1 < self.methods.len() {
                debug!("{} rejected by upstream, trying next method", method.name());
                drain(response).await;
            } else {
                return Ok(response);
            }
        }
        Err(AuthError::Unauthenticated)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::future::Future;

    use bytes::Bytes;
    use http_body_util::Full;
    use hyper::header::PROXY_AUTHORIZATION;
    use hyper::{Method, Request, Uri};

    use super::*;
    use crate::config::BasicCredentials;
    use crate::pac::ProxyServer;

    fn boxed(bytes: &'static [u8]) -> Body {
        Full::new(Bytes::from_static(bytes))
            .map_err(|never| match never {})
            .boxed()
    }

    fn response(status: StatusCode) -> Response<Body> {
        Response::builder()
            .status(status)
            .body(boxed(b"interim body"))
            .unwrap()
    }

    fn request() -> ProxyRequest {
        ProxyRequest {
            method: Method::GET,
            uri: Uri::from_static("http://origin.example.com/"),
            headers: hyper::HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    fn ctx() -> RequestContext {
        RequestContext::new(1).with_proxy(ProxyServer {
            host: "up.example.com".to_string(),
            port: 8080,
            tls: false,
        })
    }

    fn basic(login: &str) -> AuthMethod {
        AuthMethod::Basic(BasicAuthenticator::new(
            BasicCredentials::parse(login).unwrap(),
        ))
    }

    /// Round-tripper answering from a queue, recording each request's
    /// Proxy-Authorization header.
    struct ScriptedTransport {
        responses: VecDeque<Result<Response<Body>, TransportError>>,
        seen: Vec<Option<String>>,
    }

    impl ScriptedTransport {
        fn new(responses: Vec<Result<Response<Body>, TransportError>>) -> Self {
            ScriptedTransport {
                responses: responses.into(),
                seen: Vec::new(),
            }
        }
    }

    impl RoundTripper for ScriptedTransport {
        fn round_trip(
            &mut self,
            request: Request<Full<Bytes>>,
        ) -> impl Future<Output = Result<Response<Body>, TransportError>> + Send {
            self.seen.push(
                request
                    .headers()
                    .get(PROXY_AUTHORIZATION)
                    .and_then(|v| v.to_str().ok())
                    .map(String::from),
            );
            let next = self
                .responses
                .pop_front()
                .unwrap_or_else(|| Ok(response(StatusCode::OK)));
            std::future::ready(next)
        }
    }

    #[tokio::test]
    async fn test_first_success_is_cached_and_sticky() {
        let auth = MultiAuthenticator::new(vec![basic("alice:a"), basic("bob:b")]);
        let mut transport = ScriptedTransport::new(vec![
            Ok(response(StatusCode::PROXY_AUTHENTICATION_REQUIRED)),
            Ok(response(StatusCode::OK)),
            Ok(response(StatusCode::OK)),
        ]);

        let resp = auth
            .authenticate(&request(), &ctx(), &mut transport)
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(transport.seen.len(), 2);

        // Second request must invoke only the cached method.
        let resp = auth
            .authenticate(&request(), &ctx(), &mut transport)
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(transport.seen.len(), 3);
        assert_eq!(transport.seen[2], transport.seen[1]);
    }

    #[tokio::test]
    async fn test_exhausted_chain_returns_final_407() {
        let auth = MultiAuthenticator::new(vec![basic("alice:a"), basic("bob:b")]);
        let mut transport = ScriptedTransport::new(vec![
            Ok(response(StatusCode::PROXY_AUTHENTICATION_REQUIRED)),
            Ok(response(StatusCode::PROXY_AUTHENTICATION_REQUIRED)),
        ]);

        let resp = auth
            .authenticate(&request(), &ctx(), &mut transport)
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::PROXY_AUTHENTICATION_REQUIRED);
        // Every method tried exactly once, in order, with distinct headers.
        assert_eq!(transport.seen.len(), 2);
        assert_ne!(transport.seen[0], transport.seen[1]);

        // Nothing was cached: the next call walks the chain again.
        let mut transport = ScriptedTransport::new(vec![
            Ok(response(StatusCode::PROXY_AUTHENTICATION_REQUIRED)),
            Ok(response(StatusCode::OK)),
        ]);
        let resp = auth
            .authenticate(&request(), &ctx(), &mut transport)
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(transport.seen.len(), 2);
    }

    #[tokio::test]
    async fn test_non_407_rejection_is_passed_through_and_cached() {
        let auth = MultiAuthenticator::new(vec![basic("alice:a"), basic("bob:b")]);
        let mut transport =
            ScriptedTransport::new(vec![Ok(response(StatusCode::FORBIDDEN))]);
        let resp = auth
            .authenticate(&request(), &ctx(), &mut transport)
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        assert_eq!(transport.seen.len(), 1);
        assert_eq!(auth.cache.read().await.get("up.example.com"), Some(&0));
    }

    #[tokio::test]
    async fn test_transport_error_propagates_immediately() {
        let auth = MultiAuthenticator::new(vec![basic("alice:a"), basic("bob:b")]);
        let mut transport = ScriptedTransport::new(vec![Err(TransportError::DialTimeout(
            "up.example.com:8080".to_string(),
        ))]);
        let err = auth
            .authenticate(&request(), &ctx(), &mut transport)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Transport(_)));
        assert_eq!(transport.seen.len(), 1);
        assert!(auth.cache.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_empty_chain_is_unauthenticated() {
        let auth = MultiAuthenticator::new(vec![]);
        let mut transport = ScriptedTransport::new(vec![]);
        let err = auth
            .authenticate(&request(), &ctx(), &mut transport)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Unauthenticated));
    }

    #[tokio::test]
    async fn test_ntlm_handshake_over_scripted_transport() {
        use crate::config::NtlmCredentials;

        let challenge = super::ntlm::challenge_message(&[7; 8], &[]);
        let interim = Response::builder()
            .status(StatusCode::PROXY_AUTHENTICATION_REQUIRED)
            .header(
                hyper::header::PROXY_AUTHENTICATE,
                format!(
                    "NTLM {}",
                    base64::Engine::encode(&base64::engine::general_purpose::STANDARD, &challenge)
                ),
            )
            .body(boxed(b""))
            .unwrap();

        let auth = MultiAuthenticator::new(vec![AuthMethod::Ntlm(NtlmAuthenticator::new(
            NtlmCredentials {
                domain: "CORP".to_string(),
                username: "user".to_string(),
                nt_hash: nt_hash("hunter2"),
            },
        ))]);
        let mut transport =
            ScriptedTransport::new(vec![Ok(interim), Ok(response(StatusCode::OK))]);
        let resp = auth
            .authenticate(&request(), &ctx(), &mut transport)
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        // Type 1 then Type 3, both NTLM, on the same transport.
        assert_eq!(transport.seen.len(), 2);
        assert!(transport.seen[0].as_deref().unwrap().starts_with("NTLM "));
        assert!(transport.seen[1].as_deref().unwrap().starts_with("NTLM "));
        assert_ne!(transport.seen[0], transport.seen[1]);
    }
}
