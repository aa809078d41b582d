use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::{probe_local_address, LinkError, LinkInfo, LinkSettings, NetworkLink};

/// Longest pause between two route checks.
const MAX_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Link managed outside this process (Ethernet, or Wi-Fi set up by the OS).
/// Association means the broker has become routable.
#[derive(Debug, Clone, Default)]
pub struct RouteLink;

/// Checks at least a few times within `wait`.
fn retry_interval(wait: Duration) -> Duration {
    (wait / 4).min(MAX_RETRY_INTERVAL)
}

impl NetworkLink for RouteLink {
    fn associate(&mut self, settings: &LinkSettings) -> Result<LinkInfo, LinkError> {
        info!(
            "Waiting for a route to {}:{}",
            settings.probe_host, settings.probe_port
        );
        let deadline = Instant::now() + settings.wait;
        let interval = retry_interval(settings.wait);

        loop {
            match probe_local_address(&settings.probe_host, settings.probe_port) {
                Ok(address) => {
                    info!("Network ready, local address {}", address);
                    return Ok(LinkInfo { address });
                }
                Err(e) if Instant::now() + interval < deadline => {
                    debug!("Link not ready yet: {}", e);
                    thread::sleep(interval);
                }
                Err(e) => return Err(e),
            }
        }
    }
}
