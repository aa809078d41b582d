//! # Broker session
//!
//! The supervisor talks to the broker through three small traits so the
//! control loop can be exercised without a network:
//!
//! ```text
//! SessionConnector::open ──► BrokerSession ──connect/service──► SessionEvents
//!                                   ▲                              │
//!                                   └──── SessionControl ◄─────────┘
//!                                        (subscribe / publish)
//! ```
//!
//! ## Module layout
//!
//! ```text
//! mqtt/
//! ├── config.rs           - per-session connection settings and last will
//! ├── message_manager.rs  - inbound message representation, status payloads
//! └── mqtt_handler.rs     - rumqttc-backed session and connector
//! ```
//!
//! A session is single-use: once it faults or disconnects it is dropped and
//! the supervisor opens a new one.

pub mod config;
pub mod message_manager;
pub mod mqtt_handler;

use std::fmt;
use std::time::Duration;

pub use config::SessionSettings;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Broker connection failed: {0}")]
    Connection(#[from] rumqttc::ConnectionError),

    #[error("Broker request failed: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("Broker did not acknowledge the connection within {0:?}")]
    ConnectTimeout(Duration),

    #[error("Broker rejected subscription to {0}")]
    SubscribeRejected(String),

    #[error("Broker closed the session")]
    Disconnected,

    #[error("Session event channel closed")]
    ChannelClosed,

    #[error("Session is not connected")]
    NotConnected,
}

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Faulted,
}

/// Requests a handler may issue while reacting to an event.
pub trait SessionControl {
    fn subscribe(&mut self, topic: &str) -> Result<(), SessionError>;

    fn publish(&mut self, topic: &str, payload: &str) -> Result<(), SessionError>;
}

/// Callbacks invoked synchronously from [`BrokerSession::connect`] and
/// [`BrokerSession::service`].
pub trait SessionEvents {
    /// Runs once per successful handshake. An error aborts the connection.
    fn on_connect(&mut self, session: &mut dyn SessionControl) -> Result<(), SessionError>;

    fn on_disconnect(&mut self, session: &mut dyn SessionControl);

    fn on_message(&mut self, session: &mut dyn SessionControl, topic: &str, payload: &[u8]);
}

pub trait BrokerSession: SessionControl + fmt::Debug {
    fn state(&self) -> ConnectionState;

    /// Performs the handshake and fires `on_connect` on success.
    fn connect(&mut self, events: &mut dyn SessionEvents) -> Result<(), SessionError>;

    /// Waits at most `timeout` for one event and dispatches it.
    fn service(
        &mut self,
        timeout: Duration,
        events: &mut dyn SessionEvents,
    ) -> Result<(), SessionError>;

    fn disconnect(&mut self) -> Result<(), SessionError>;
}

/// Builds a fresh, unconnected session.
pub trait SessionConnector: fmt::Debug {
    fn open(&mut self, settings: &SessionSettings) -> Result<Box<dyn BrokerSession>, SessionError>;
}
