use std::sync::atomic::{AtomicU64, Ordering};

use crate::pac::ProxyServer;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Allocates the next request id. Ids are process-wide and monotonically
/// increasing; they exist purely for log correlation.
pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

/// Immutable per-request bag threaded through the handler and the
/// authenticators: the request id and, once selection has happened, the
/// upstream the current attempt targets (`None` for DIRECT).
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub id: u64,
    pub proxy: Option<ProxyServer>,
}

impl RequestContext {
    pub fn new(id: u64) -> Self {
        RequestContext { id, proxy: None }
    }

    pub fn with_proxy(&self, proxy: ProxyServer) -> Self {
        RequestContext {
            id: self.id,
            proxy: Some(proxy),
        }
    }
}
