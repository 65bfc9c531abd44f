use std::sync::Arc;

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::debug;

use crate::auth::MultiAuthenticator;
use crate::pac::ProxyFinder;
use crate::proxy::transport::Pool;

pub mod context;
mod handler;
pub mod transport;


/// Everything a request needs: upstream selection, the authentication
/// chain, and the connection pool. Shared across all connections.
pub struct ProxyState {
    pub finder: ProxyFinder,
    pub auth: Option<MultiAuthenticator>,
    pub pool: Pool,
}

impl ProxyState {
    pub fn new(finder: ProxyFinder, auth: Option<MultiAuthenticator>) -> Self {
        ProxyState {
            finder,
            auth,
            pool: Pool::new(),
        }
    }
}

/// Accept loop: each inbound connection is served on its own task. Closing
/// the client connection unwinds everything spawned for its requests.
pub async fn serve(listener: TcpListener, state: Arc<ProxyState>) -> anyhow::Result<()> {
    loop {
        let (socket, addr) = listener.accept().await?;
        let state = state.clone();
        tokio::spawn(async move {
            let io = TokioIo::new(socket);
            let service = service_fn(move |request| handler::handle(request, state.clone()));
            if let Err(err) = http1::Builder::new()
                .serve_connection(io, service)
                .with_upgrades()
                .await
            {
                debug!("connection from {addr} ended: {err}");
            }
        });
    }
}
