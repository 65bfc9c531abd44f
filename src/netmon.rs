use std::net::{IpAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::blocklist::Blocklist;

const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Watches for changes in the host's network configuration and clears the
/// blocklist when one is observed, so upstreams get another chance right
/// after a VPN or Wi-Fi transition instead of waiting out their expiry.
///
/// The observation is the local address the kernel picks for the default
/// route. This is advisory only; correctness never depends on it.
pub fn spawn(blocklist: Arc<Blocklist>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut last = default_route_addr();
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let current = default_route_addr();
            if current != last {
                info!(
                    "network change detected ({:?} -> {:?}), clearing blocklist",
                    last, current
                );
                blocklist.clear();
                last = current;
            } else {
                debug!("network unchanged ({current:?})");
            }
        }
    })
}

/// The local address used to reach a well-known public destination. No
/// packets are sent; connecting a UDP socket only asks the kernel for a
/// route.
fn default_route_addr() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:53").ok()?;
    Some(socket.local_addr().ok()?.ip())
}
