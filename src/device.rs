//! Process context: everything the supervisor owns for the lifetime of the
//! process, built once at startup.

use crate::actuator::ActuatorState;
use crate::config::{ConfigError, Configuration};
use crate::identity::DeviceIdentity;
use crate::link::LinkSettings;
use crate::mqtt::SessionSettings;
use crate::watchdog::LivenessGuard;

/// Topics with `{uid}` already expanded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub command: String,
    pub debug: Option<String>,
}

impl Topics {
    pub fn resolve(config: &Configuration, identity: &DeviceIdentity) -> Result<Self, ConfigError> {
        let command = config
            .mqtt
            .topic
            .as_deref()
            .map(str::trim)
            .filter(|topic| !topic.is_empty())
            .ok_or(ConfigError::Missing("mqtt.topic"))?;

        Ok(Self {
            command: identity.expand(command),
            debug: config
                .mqtt
                .debug_topic_template()
                .map(|template| identity.expand(template)),
        })
    }
}

#[derive(Debug)]
pub struct DeviceContext {
    pub config: Configuration,
    pub identity: DeviceIdentity,
    pub topics: Topics,
    pub actuator: ActuatorState,
    pub guard: LivenessGuard,
}

impl DeviceContext {
    pub fn new(
        config: Configuration,
        identity: DeviceIdentity,
        actuator: ActuatorState,
        guard: LivenessGuard,
    ) -> Result<Self, ConfigError> {
        let topics = Topics::resolve(&config, &identity)?;
        Ok(Self {
            config,
            identity,
            topics,
            actuator,
            guard,
        })
    }

    pub fn link_settings(&self) -> LinkSettings {
        let network = &self.config.network;
        LinkSettings {
            ssid: network.ssid.clone(),
            password: network.password.clone(),
            hostname: self.identity.expand(&network.hostname),
            interface: network.interface.clone(),
            wait: network.wait(),
            probe_host: self.config.mqtt.host.clone(),
            probe_port: self.config.mqtt.port,
        }
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings::new(&self.config.mqtt, &self.identity, &self.topics)
    }
}
