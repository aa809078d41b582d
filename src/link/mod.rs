//! Network link bring-up.
//!
//! [`NetworkLink::associate`] blocks until the device has a usable link and
//! reports the local address. Two implementations:
//!
//! - [`nmcli::NmcliLink`] joins the configured Wi-Fi network through
//!   NetworkManager
//! - [`route::RouteLink`] waits until the broker is routable, for wired or
//!   externally managed networks

pub mod nmcli;
pub mod route;

use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("Failed to run {command}: {source}")]
    Spawn {
        command: &'static str,
        source: io::Error,
    },

    #[error("{command} failed (exit code {code:?}): {stderr}")]
    CommandFailed {
        command: &'static str,
        code: Option<i32>,
        stderr: String,
    },

    #[error("No route to {target}: {source}")]
    NoRoute { target: String, source: io::Error },

    #[error("Network link not configured: {0}")]
    NotConfigured(&'static str),
}

/// Everything a link needs to come up.
#[derive(Clone, PartialEq, Eq)]
pub struct LinkSettings {
    pub ssid: Option<String>,
    pub password: Option<String>,
    pub hostname: String,
    pub interface: String,
    pub wait: Duration,
    /// Broker address, used to find the outgoing interface.
    pub probe_host: String,
    pub probe_port: u16,
}

impl fmt::Debug for LinkSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkSettings")
            .field("ssid", &self.ssid)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("hostname", &self.hostname)
            .field("interface", &self.interface)
            .field("wait", &self.wait)
            .field("probe_host", &self.probe_host)
            .field("probe_port", &self.probe_port)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkInfo {
    pub address: IpAddr,
}

pub trait NetworkLink: fmt::Debug {
    /// Blocks until the link is up or fails.
    fn associate(&mut self, settings: &LinkSettings) -> Result<LinkInfo, LinkError>;
}

/// Picks the link implementation for the given settings.
pub fn for_settings(settings: &LinkSettings) -> Box<dyn NetworkLink> {
    if settings.ssid.is_some() {
        Box::new(nmcli::NmcliLink::default())
    } else {
        Box::new(route::RouteLink::default())
    }
}

/// Local address the kernel would use to reach `host:port`.
///
/// Connecting a UDP socket only selects a route, no packet is sent.
pub fn probe_local_address(host: &str, port: u16) -> Result<IpAddr, LinkError> {
    let target = format!("{}:{}", host, port);
    let no_route = |source| LinkError::NoRoute {
        target: target.clone(),
        source,
    };

    let mut last_error = io::Error::new(io::ErrorKind::NotFound, "host did not resolve");
    for remote in (host, port).to_socket_addrs().map_err(no_route)? {
        match local_address_towards(remote) {
            Ok(address) => return Ok(address),
            Err(e) => last_error = e,
        }
    }
    Err(no_route(last_error))
}

fn local_address_towards(remote: SocketAddr) -> io::Result<IpAddr> {
    let bind: SocketAddr = match remote {
        SocketAddr::V4(_) => (IpAddr::from([0, 0, 0, 0]), 0).into(),
        SocketAddr::V6(_) => (IpAddr::from([0u16; 8]), 0).into(),
    };
    let socket = UdpSocket::bind(bind)?;
    socket.connect(remote)?;
    Ok(socket.local_addr()?.ip())
}
