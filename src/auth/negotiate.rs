use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hyper::header::HeaderValue;
use hyper::Response;
use libgssapi::context::{ClientCtx, CtxFlags};
use libgssapi::credential::{Cred, CredUsage};
use libgssapi::name::Name;
use libgssapi::oid::{GSS_MECH_SPNEGO, GSS_NT_HOSTBASED_SERVICE};
use tracing::{debug, info, warn};

use crate::auth::AuthError;
use crate::proxy::transport::{Body, ProxyRequest, RoundTripper};

const TICKET_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Negotiate/SPNEGO proxy authentication backed by the OS Kerberos ticket
/// cache. We hold no credentials of our own; a token is minted per request
/// for the service principal `HTTP@<proxy host>`.
pub struct NegotiateAuthenticator {
    _private: (),
}

impl NegotiateAuthenticator {
    /// Returns an authenticator if a Kerberos ticket is observed, polling
    /// for up to `wait` seconds before giving up. Once absent, Negotiate
    /// stays out of the chain for the life of the process.
    pub async fn new(wait: Duration) -> Option<Self> {
        if ticket_available().await {
            info!("Kerberos ticket found");
            return Some(NegotiateAuthenticator { _private: () });
        }
        if wait.is_zero() {
            return None;
        }
        info!("no Kerberos ticket found, waiting up to {wait:?}");
        let deadline = tokio::time::Instant::now() + wait;
        while tokio::time::Instant::now() < deadline {
            tokio::time::sleep(TICKET_POLL_INTERVAL).await;
            if ticket_available().await {
                info!("Kerberos ticket found");
                return Some(NegotiateAuthenticator { _private: () });
            }
        }
        info!("no Kerberos ticket found after waiting");
        None
    }

    pub(crate) async fn authenticate<R: RoundTripper>(
        &self,
        request: &ProxyRequest,
        proxy_host: &str,
        transport: &mut R,
    ) -> Result<Response<Body>, AuthError> {
        let host = proxy_host.to_string();
        let token = tokio::task::spawn_blocking(move || spnego_token(&host))
            .await
            .map_err(|e| AuthError::Negotiate(e.to_string()))?
            .inspect_err(|e| warn!("failed to generate a SPNEGO token for {proxy_host}: {e}"))?;
        let value = format!("Negotiate {}", BASE64.encode(&token));
        let value = HeaderValue::from_str(&value).expect("base64 is always a valid header value");
        Ok(transport.round_trip(request.to_request(Some(value))?).await?)
    }
}

/// Whether the current user has a usable Kerberos credential, checked by
/// acquiring the default initiator credential.
async fn ticket_available() -> bool {
    tokio::task::spawn_blocking(|| {
        match Cred::acquire(None, None, CredUsage::Initiate, None) {
            Ok(_) => true,
            Err(err) => {
                debug!("no GSS credential available: {err}");
                false
            }
        }
    })
    .await
    .unwrap_or(false)
}

/// Mints a SPNEGO token for `HTTP@<host>` from the user's ticket cache.
fn spnego_token(host: &str) -> Result<Vec<u8>, AuthError> {
    let principal = format!("HTTP@{host}");
    let name = Name::new(principal.as_bytes(), Some(&GSS_NT_HOSTBASED_SERVICE))
        .map_err(|e| AuthError::Negotiate(e.to_string()))?;
    let mut ctx = ClientCtx::new(None, name, CtxFlags::empty(), Some(&GSS_MECH_SPNEGO));
    match ctx.step(None, None) {
        Ok(Some(token)) => Ok(token.to_vec()),
        Ok(None) => Err(AuthError::Negotiate(
            "GSS returned an empty token".to_string(),
        )),
        Err(e) => Err(AuthError::Negotiate(e.to_string())),
    }
}
