use std::fmt;
use std::time::Duration;

use crate::config::MqttConfig;
use crate::device::Topics;
use crate::identity::DeviceIdentity;

use super::message_manager::STATUS_DISCONNECTED;

/// Message the broker publishes on our behalf if we vanish uncleanly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWillMessage {
    pub topic: String,
    pub payload: String,
}

#[derive(Clone, PartialEq, Eq)]
pub struct SessionSettings {
    pub client_id: String,
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub credentials: Option<(String, String)>,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    pub last_will: Option<LastWillMessage>,
}

impl SessionSettings {
    pub fn new(config: &MqttConfig, identity: &DeviceIdentity, topics: &Topics) -> Self {
        let credentials = config.username.as_ref().map(|user| {
            (
                user.clone(),
                config.password.clone().unwrap_or_default(),
            )
        });

        let last_will = topics.debug.as_ref().map(|topic| LastWillMessage {
            topic: topic.clone(),
            payload: STATUS_DISCONNECTED.to_string(),
        });

        Self {
            client_id: identity.to_string(),
            host: config.host.clone(),
            port: config.port,
            tls: config.tls,
            credentials,
            keep_alive: config.keep_alive(),
            connect_timeout: config.connect_timeout(),
            last_will,
        }
    }
}

impl fmt::Debug for SessionSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionSettings")
            .field("client_id", &self.client_id)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("tls", &self.tls)
            .field(
                "credentials",
                &self.credentials.as_ref().map(|(user, _)| (user, "<redacted>")),
            )
            .field("keep_alive", &self.keep_alive)
            .field("connect_timeout", &self.connect_timeout)
            .field("last_will", &self.last_will)
            .finish()
    }
}
