use hyper::Response;

use crate::auth::AuthError;
use crate::config::BasicCredentials;
use crate::proxy::transport::{Body, ProxyRequest, RoundTripper};

/// Basic proxy authentication: one round trip with a pre-encoded
/// `Proxy-Authorization` header. Never retries; a 407 goes back to the
/// chain so it can try the next method.
pub struct BasicAuthenticator {
    credentials: BasicCredentials,
}

impl BasicAuthenticator {
    pub fn new(credentials: BasicCredentials) -> Self {
        BasicAuthenticator { credentials }
    }

    pub(crate) async fn authenticate<R: RoundTripper>(
        &self,
        request: &ProxyRequest,
        transport: &mut R,
    ) -> Result<Response<Body>, AuthError> {
        let request = request.to_request(Some(self.credentials.header_value()))?;
        Ok(transport.round_trip(request).await?)
    }
}
