//! Top-level control loop.
//!
//! Every cycle walks the same typestate path and ends in a fault:
//!
//! ```text
//! Idle ──associate──► LinkUp ──open+connect──► SessionOpen ──► Servicing
//!  ▲                    │                          │               │
//!  │                    └──────────────┬───────────┴───────────────┘
//!  │                                   ▼
//!  └──────── recover (self-healing) ── Faulted ── propagate (fail-fast) ──►
//! ```
//!
//! The session is owned here and dropped on every fault; the relay state
//! lives in the [`DeviceContext`] and survives across sessions.

use std::convert::Infallible;
use std::thread;

use statum::{machine, state};
use tracing::{debug, error, info, warn};

use crate::config::RetryPolicy;
use crate::device::DeviceContext;
use crate::handlers::SessionHandlers;
use crate::link::{LinkError, LinkInfo, NetworkLink};
use crate::mqtt::message_manager::connected_status;
use crate::mqtt::{BrokerSession, ConnectionState, SessionConnector, SessionError};

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Network link failed: {0}")]
    Link(#[from] LinkError),

    #[error("Failed to open broker session: {0}")]
    Open(SessionError),

    #[error("Broker handshake failed: {0}")]
    Connect(SessionError),

    #[error("Broker session failed: {0}")]
    Service(SessionError),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SupervisorStats {
    pub cycles: u64,
    pub faults: u64,
    pub messages: u64,
}

#[state]
#[derive(Debug, Clone)]
pub enum SupervisorState {
    Idle,
    LinkUp(LinkInfo),
    SessionOpen,
    Servicing,
    Faulted,
}

#[machine]
#[derive(Debug)]
pub struct ConnectivitySupervisor<S: SupervisorState> {
    device: DeviceContext,
    link: Box<dyn NetworkLink>,
    connector: Box<dyn SessionConnector>,

    // Current broker session, if one is open
    session: Option<Box<dyn BrokerSession>>,

    stats: SupervisorStats,

    // Error that ended the previous session, reported on reconnect
    last_fault: Option<String>,
}

/// A supervisor that left the happy path, together with the reason.
#[derive(Debug)]
pub struct Fault {
    supervisor: ConnectivitySupervisor<Faulted>,
    error: SupervisorError,
}

impl<S: SupervisorState> ConnectivitySupervisor<S> {
    pub fn stats(&self) -> &SupervisorStats {
        &self.stats
    }

    pub fn device(&self) -> &DeviceContext {
        &self.device
    }

    pub fn last_fault(&self) -> Option<&str> {
        self.last_fault.as_deref()
    }
}

impl ConnectivitySupervisor<Idle> {
    pub fn create(
        device: DeviceContext,
        link: Box<dyn NetworkLink>,
        connector: Box<dyn SessionConnector>,
    ) -> Self {
        info!(
            "Creating supervisor for {} (policy: {})",
            device.identity, device.config.supervisor.retry_policy
        );
        Self::new(
            device,
            link,
            connector,
            None,
            SupervisorStats::default(),
            None,
        )
    }

    /// Runs cycles until one fails under the fail-fast policy. Under
    /// self-healing this never returns.
    pub fn run(mut self) -> Result<Infallible, SupervisorError> {
        loop {
            self = self.run_cycle()?;
        }
    }

    /// One pass from link bring-up to the fault that ends the session.
    pub fn run_cycle(self) -> Result<Self, SupervisorError> {
        let fault = match self.bring_up_link().and_then(|linked| linked.open_session()) {
            Ok(open) => open.start_servicing().serve(),
            Err(fault) => fault,
        };
        fault.settle()
    }

    pub fn bring_up_link(mut self) -> Result<ConnectivitySupervisor<LinkUp>, Fault> {
        self.stats.cycles += 1;
        self.device.guard.feed();
        debug!("Cycle {}: bringing up network link", self.stats.cycles);

        let settings = self.device.link_settings();
        match self.link.associate(&settings) {
            Ok(info) => {
                info!("Network link up, local address {}", info.address);
                // Association may take up to the link wait
                self.device.guard.feed();
                Ok(self.transition_with(info))
            }
            Err(e) => Err(Fault::new(self.transition(), e.into())),
        }
    }
}

impl ConnectivitySupervisor<LinkUp> {
    /// Opens a fresh session and runs the handshake, which subscribes and
    /// announces the connection.
    pub fn open_session(mut self) -> Result<ConnectivitySupervisor<SessionOpen>, Fault> {
        let address = self.get_state_data().map(|info| info.address);
        let settings = self.device.session_settings();
        debug!("Opening broker session from {:?}", address);

        let mut session = match self.connector.open(&settings) {
            Ok(session) => session,
            Err(e) => return Err(Fault::new(self.transition(), SupervisorError::Open(e))),
        };

        let announcement = connected_status(
            self.device.guard.reset_reason(),
            self.last_fault.as_deref(),
        );
        let mut handlers = SessionHandlers::new(&mut self.device.actuator, &self.device.topics)
            .with_announcement(&announcement);
        let result = session.connect(&mut handlers);
        self.session = Some(session);

        match result {
            Ok(()) => {
                info!(
                    "Session established with {}:{} as {}",
                    settings.host, settings.port, settings.client_id
                );
                Ok(self.transition())
            }
            Err(e) => Err(Fault::new(self.transition(), SupervisorError::Connect(e))),
        }
    }
}

impl ConnectivitySupervisor<SessionOpen> {
    pub fn start_servicing(self) -> ConnectivitySupervisor<Servicing> {
        debug!(
            "Servicing session, relay is {}",
            self.device.actuator.state()
        );
        self.transition()
    }
}

impl ConnectivitySupervisor<Servicing> {
    /// Feeds the guard and services the session until it fails.
    pub fn serve(mut self) -> Fault {
        let timeout = self.device.config.mqtt.socket_timeout();

        loop {
            self.device.guard.feed();

            let Some(session) = self.session.as_mut() else {
                return Fault::new(
                    self.transition(),
                    SupervisorError::Service(SessionError::NotConnected),
                );
            };
            let mut handlers =
                SessionHandlers::new(&mut self.device.actuator, &self.device.topics);
            let result = session.service(timeout, &mut handlers);
            self.stats.messages += handlers.handled() as u64;

            if let Err(e) = result {
                return Fault::new(self.transition(), SupervisorError::Service(e));
            }
        }
    }
}

impl ConnectivitySupervisor<Faulted> {
    /// Drops the current session, disconnecting it first if it still
    /// thinks it is connected.
    fn discard_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            if session.state() == ConnectionState::Connected {
                if let Err(e) = session.disconnect() {
                    warn!("Failed to disconnect discarded session: {}", e);
                }
            }
            debug!("Session discarded");
        }
    }

    pub fn recover(mut self, error: &SupervisorError) -> ConnectivitySupervisor<Idle> {
        self.last_fault = Some(error.to_string());

        // The failed phase may have used up to its own bound
        self.device.guard.feed();

        let delay = self.device.config.supervisor.retry_delay();
        if !delay.is_zero() {
            info!("Retrying in {:?}", delay);
            thread::sleep(delay);
        }
        self.transition()
    }
}

impl Fault {
    fn new(supervisor: ConnectivitySupervisor<Faulted>, error: SupervisorError) -> Self {
        Self { supervisor, error }
    }

    pub fn error(&self) -> &SupervisorError {
        &self.error
    }

    /// Applies the retry policy: fail-fast hands the error back, self-healing
    /// returns an idle supervisor ready for the next cycle.
    pub fn settle(self) -> Result<ConnectivitySupervisor<Idle>, SupervisorError> {
        let Fault {
            mut supervisor,
            error,
        } = self;
        supervisor.discard_session();
        supervisor.stats.faults += 1;

        let stats = &supervisor.stats;
        error!(
            "{} (cycles: {}, faults: {}, messages: {}, watchdog feeds: {})",
            error,
            stats.cycles,
            stats.faults,
            stats.messages,
            supervisor.device.guard.feeds()
        );

        match supervisor.device.config.supervisor.retry_policy {
            RetryPolicy::FailFast => Err(error),
            RetryPolicy::SelfHealing => Ok(supervisor.recover(&error)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::RelayState;
    use crate::testing::{device, Call, FakeConnector, FakeLink, FakeLine, Journal, SessionPlan, Step};

    const COMMAND: &str = "relay/00c0ffee/set";
    const DEBUG: &str = "debug/relay-00c0ffee";

    fn supervisor(
        journal: &Journal,
        policy: RetryPolicy,
        link_script: &[bool],
        plans: Vec<SessionPlan>,
    ) -> (ConnectivitySupervisor<Idle>, FakeLine) {
        let (device, line) = device(journal, |config| config.supervisor.retry_policy = policy);
        let supervisor = ConnectivitySupervisor::create(
            device,
            Box::new(FakeLink::new(journal).with_script(link_script)),
            Box::new(FakeConnector::new(journal, plans)),
        );
        (supervisor, line)
    }

    fn publish(topic: &str, payload: &str) -> Call {
        Call::Publish(topic.to_string(), payload.to_string())
    }

    #[test]
    fn test_fail_fast_propagates_service_fault() {
        let journal = Journal::default();
        let (supervisor, _) = supervisor(
            &journal,
            RetryPolicy::FailFast,
            &[],
            vec![SessionPlan::steps(vec![Step::Idle, Step::Fail])],
        );

        let result = supervisor.run_cycle();
        assert!(matches!(
            result,
            Err(SupervisorError::Service(SessionError::ChannelClosed))
        ));
        assert_eq!(
            journal.calls(),
            vec![
                Call::Feed,
                Call::Associate,
                Call::Feed,
                Call::Open(1),
                Call::Connect(1),
                Call::Subscribe(COMMAND.to_string()),
                publish(DEBUG, "connected, power-on startup"),
                Call::Feed,
                Call::Service(1),
                Call::Feed,
                Call::Service(1),
            ]
        );
    }

    #[test]
    fn test_fail_fast_link_fault_opens_nothing() {
        let journal = Journal::default();
        let (supervisor, _) = supervisor(&journal, RetryPolicy::FailFast, &[true], vec![]);

        assert!(matches!(supervisor.run(), Err(SupervisorError::Link(_))));
        assert_eq!(journal.calls(), vec![Call::Feed, Call::Associate]);
    }

    #[test]
    fn test_fail_fast_run_stops_at_first_fault() {
        let journal = Journal::default();
        let (supervisor, _) = supervisor(&journal, RetryPolicy::FailFast, &[], vec![]);

        assert!(matches!(supervisor.run(), Err(SupervisorError::Open(_))));
        assert_eq!(journal.count(|call| matches!(call, Call::Open(_))), 1);
        assert_eq!(journal.count(|call| *call == Call::Associate), 1);
    }

    #[test]
    fn test_subscribe_failure_is_a_handshake_fault() {
        let journal = Journal::default();
        let plan = SessionPlan {
            fail_subscribe: true,
            ..SessionPlan::default()
        };
        let (supervisor, _) = supervisor(&journal, RetryPolicy::FailFast, &[], vec![plan]);

        assert!(matches!(
            supervisor.run_cycle(),
            Err(SupervisorError::Connect(SessionError::SubscribeRejected(_)))
        ));
        assert!(!journal.calls().iter().any(|call| matches!(call, Call::Service(_))));
    }

    #[test]
    fn test_self_healing_retries_without_bound() {
        let journal = Journal::default();
        let (mut supervisor, _) = supervisor(
            &journal,
            RetryPolicy::SelfHealing,
            &[true, false, true],
            vec![],
        );

        for _ in 0..25 {
            supervisor = supervisor.run_cycle().unwrap();
        }

        assert_eq!(supervisor.stats().cycles, 25);
        assert_eq!(supervisor.stats().faults, 25);
        assert_eq!(journal.count(|call| *call == Call::Associate), 25);
        // Two link failures never reach the connector.
        assert_eq!(journal.count(|call| matches!(call, Call::Open(_))), 23);
        assert!(supervisor.last_fault().is_some());
    }

    #[test]
    fn test_fresh_session_after_each_fault() {
        let journal = Journal::default();
        let (supervisor, line) = supervisor(
            &journal,
            RetryPolicy::SelfHealing,
            &[],
            vec![
                SessionPlan::steps(vec![Step::Message(b"1".to_vec()), Step::Drop]),
                SessionPlan::steps(vec![Step::Message(b"0".to_vec()), Step::Fail]),
            ],
        );

        let supervisor = supervisor.run_cycle().unwrap();
        assert_eq!(
            journal.calls(),
            vec![
                Call::Feed,
                Call::Associate,
                Call::Feed,
                Call::Open(1),
                Call::Connect(1),
                Call::Subscribe(COMMAND.to_string()),
                publish(DEBUG, "connected, power-on startup"),
                Call::Feed,
                Call::Service(1),
                publish(DEBUG, "on"),
                Call::Feed,
                Call::Service(1),
                Call::Feed,
            ]
        );
        assert_eq!(supervisor.device().actuator.state(), RelayState::On);

        journal.clear();
        let supervisor = supervisor.run_cycle().unwrap();
        assert_eq!(
            journal.calls(),
            vec![
                Call::Feed,
                Call::Associate,
                Call::Feed,
                Call::Open(2),
                Call::Connect(2),
                Call::Subscribe(COMMAND.to_string()),
                publish(
                    DEBUG,
                    "connected, power-on recovered from: Broker session failed: Broker closed the session"
                ),
                Call::Feed,
                Call::Service(2),
                publish(DEBUG, "off"),
                Call::Feed,
                Call::Service(2),
                Call::Feed,
            ]
        );

        // The relay is never reset by a reconnect.
        assert_eq!(line.writes(), vec![true, false]);
        assert_eq!(supervisor.stats().messages, 2);
        assert_eq!(supervisor.stats().faults, 2);
    }

    #[test]
    fn test_each_blocking_phase_is_bracketed_by_feeds() {
        let journal = Journal::default();
        let failed_handshake = SessionPlan {
            fail_connect: true,
            ..SessionPlan::default()
        };
        let (mut supervisor, _) = supervisor(
            &journal,
            RetryPolicy::SelfHealing,
            &[true],
            vec![
                failed_handshake,
                SessionPlan::steps(vec![Step::Idle, Step::Drop]),
            ],
        );

        // Link fault, handshake fault, service fault.
        supervisor = supervisor.run_cycle().unwrap();
        assert_eq!(
            journal.calls(),
            vec![Call::Feed, Call::Associate, Call::Feed]
        );

        journal.clear();
        supervisor = supervisor.run_cycle().unwrap();
        assert_eq!(
            journal.calls(),
            vec![
                Call::Feed,
                Call::Associate,
                Call::Feed,
                Call::Open(1),
                Call::Connect(1),
                Call::Feed,
            ]
        );

        journal.clear();
        supervisor.run_cycle().unwrap();

        // Link wait, handshake and service calls are validated against the
        // watchdog timeout one at a time, so no two may share a feed.
        let mut blocking_since_feed = 0;
        for call in journal.calls() {
            match call {
                Call::Feed => blocking_since_feed = 0,
                Call::Associate | Call::Connect(_) | Call::Service(_) => {
                    blocking_since_feed += 1;
                    assert!(blocking_since_feed <= 1, "{:?}", journal.calls());
                }
                _ => {}
            }
        }
        assert_eq!(journal.calls().last(), Some(&Call::Feed));
    }

    #[test]
    fn test_feed_precedes_faulting_service_call() {
        let journal = Journal::default();
        let (supervisor, _) = supervisor(
            &journal,
            RetryPolicy::FailFast,
            &[],
            vec![SessionPlan::steps(vec![
                Step::Idle,
                Step::Message(b"1".to_vec()),
                Step::Idle,
                Step::Drop,
            ])],
        );

        assert!(supervisor.run_cycle().is_err());

        let calls = journal.calls();
        let services: Vec<usize> = calls
            .iter()
            .enumerate()
            .filter(|(_, call)| matches!(call, Call::Service(_)))
            .map(|(index, _)| index)
            .collect();
        assert_eq!(services.len(), 4);
        for index in services {
            assert_eq!(calls[index - 1], Call::Feed, "call {} in {:?}", index, calls);
        }
    }

    #[test]
    fn test_session_settings_carry_identity_and_will() {
        let journal = Journal::default();
        let (device, _) = device(&journal, |_| {});
        let connector = FakeConnector::new(&journal, vec![]);
        let seen = connector.settings.clone();
        let supervisor = ConnectivitySupervisor::create(
            device,
            Box::new(FakeLink::new(&journal)),
            Box::new(connector),
        );

        assert!(supervisor.run_cycle().is_err());

        let seen = seen.borrow();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].client_id, "00c0ffee");
        assert_eq!(
            seen[0].last_will.as_ref().map(|will| will.payload.as_str()),
            Some("disconnected")
        );
    }
}
