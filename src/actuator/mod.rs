//! Relay output and its logical state.
//!
//! [`ActuatorState`] owns the single output line and only writes to it when
//! the requested state differs from the current one. Repeated identical
//! commands therefore cause at most one hardware write and one [`Effect`].
//!
//! ```text
//! payload ──► RelayState::from_payload ──► ActuatorState::transition ──► OutputLine
//!                                                  │
//!                                                  └──► Option<Effect>
//! ```

pub mod gpio;

use std::fmt;
use tracing::{debug, info};

/// Logical relay state. The wire mapping is total: `"1"` is on, everything
/// else is off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RelayState {
    On,
    #[default]
    Off,
}

impl RelayState {
    pub fn from_payload(payload: &[u8]) -> Self {
        if payload == b"1" {
            Self::On
        } else {
            Self::Off
        }
    }

    pub fn is_on(self) -> bool {
        self == Self::On
    }

    /// Status string published on the debug topic.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::On => "on",
            Self::Off => "off",
        }
    }
}

impl fmt::Display for RelayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A digital output. Writes are assumed infallible at this layer.
pub trait OutputLine: fmt::Debug {
    fn set_level(&mut self, on: bool);
}

/// Result of a transition that actually changed the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Effect {
    pub state: RelayState,
    pub description: &'static str,
}

#[derive(Debug)]
pub struct ActuatorState {
    line: Box<dyn OutputLine>,
    state: RelayState,
}

impl ActuatorState {
    /// Takes ownership of `line` and drives it to off.
    pub fn new(mut line: Box<dyn OutputLine>) -> Self {
        line.set_level(false);
        debug!("Relay line initialized to off");
        Self {
            line,
            state: RelayState::Off,
        }
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    pub fn transition(&mut self, requested: RelayState) -> Option<Effect> {
        if requested == self.state {
            debug!("Relay already {}, ignoring repeated command", requested);
            return None;
        }

        self.line.set_level(requested.is_on());
        self.state = requested;
        info!("Relay switched {}", requested);

        Some(Effect {
            state: requested,
            description: requested.as_str(),
        })
    }
}
