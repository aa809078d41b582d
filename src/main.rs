pub mod actuator;
pub mod config;
pub mod device;
pub mod handlers;
pub mod identity;
pub mod link;
pub mod mqtt;
pub mod supervisor;
pub mod watchdog;

#[cfg(test)]
mod testing;

use crate::actuator::gpio::RelayPin;
use crate::actuator::ActuatorState;
use crate::config::Configuration;
use crate::device::DeviceContext;
use crate::identity::DeviceIdentity;
use crate::mqtt::mqtt_handler::MqttConnector;
use crate::supervisor::ConnectivitySupervisor;
use crate::watchdog::LivenessGuard;
use color_eyre::{eyre::eyre, Result};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

fn main() -> Result<()> {
    setup()?;

    let config = Configuration::load()?;
    let identity = DeviceIdentity::detect()?;

    // Armed before any network activity
    let mut guard = LivenessGuard::new(watchdog::open(&config.watchdog)?);
    guard.configure(config.watchdog.timeout())?;

    let pin = RelayPin::open(config.relay.pin, config.relay.active_low)?;
    let actuator = ActuatorState::new(Box::new(pin));

    let device = DeviceContext::new(config, identity, actuator, guard)?;
    let link = link::for_settings(&device.link_settings());

    info!("Starting relay node {}", device.identity);
    let supervisor = ConnectivitySupervisor::create(device, link, Box::new(MqttConnector));
    match supervisor.run() {
        Ok(never) => match never {},
        Err(e) => Err(eyre!("Supervisor gave up: {}", e)),
    }
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}
