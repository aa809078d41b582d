use tracing::{debug, info, warn};

use crate::actuator::{ActuatorState, RelayState};
use crate::device::Topics;
use crate::mqtt::{SessionControl, SessionError, SessionEvents};

/// Glue between one broker session and the relay.
///
/// Lives only for the duration of a connect or service call; the relay state
/// itself survives in [`ActuatorState`].
pub struct SessionHandlers<'a> {
    actuator: &'a mut ActuatorState,
    topics: &'a Topics,
    announcement: Option<&'a str>,
    handled: usize,
}

impl<'a> SessionHandlers<'a> {
    pub fn new(actuator: &'a mut ActuatorState, topics: &'a Topics) -> Self {
        Self {
            actuator,
            topics,
            announcement: None,
            handled: 0,
        }
    }

    /// Status published on the debug topic once the subscription is placed.
    pub fn with_announcement(mut self, announcement: &'a str) -> Self {
        self.announcement = Some(announcement);
        self
    }

    /// Number of command messages dispatched so far.
    pub fn handled(&self) -> usize {
        self.handled
    }

    fn publish_status(&self, session: &mut dyn SessionControl, status: &str) {
        let Some(topic) = self.topics.debug.as_deref() else {
            return;
        };
        if let Err(e) = session.publish(topic, status) {
            warn!("Failed to publish status '{}' to {}: {}", status, topic, e);
        }
    }
}

impl SessionEvents for SessionHandlers<'_> {
    fn on_connect(&mut self, session: &mut dyn SessionControl) -> Result<(), SessionError> {
        session.subscribe(&self.topics.command)?;
        info!("Subscribed to {}", self.topics.command);

        if let Some(announcement) = self.announcement {
            self.publish_status(session, announcement);
        }
        Ok(())
    }

    fn on_disconnect(&mut self, _session: &mut dyn SessionControl) {
        warn!(
            "Broker session lost, relay stays {}",
            self.actuator.state()
        );
    }

    fn on_message(&mut self, session: &mut dyn SessionControl, topic: &str, payload: &[u8]) {
        self.handled += 1;
        if topic != self.topics.command {
            debug!("Message on {} treated as relay command", topic);
        }

        let requested = RelayState::from_payload(payload);
        if let Some(effect) = self.actuator.transition(requested) {
            self.publish_status(session, effect.description);
        }
    }
}
