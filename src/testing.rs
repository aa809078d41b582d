//! In-process fakes for the collaborator traits. Every fake writes to a
//! shared [`Journal`] so tests can assert on the order of side effects.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr};
use std::rc::Rc;
use std::time::Duration;

use crate::actuator::{ActuatorState, OutputLine};
use crate::config::Configuration;
use crate::device::DeviceContext;
use crate::identity::DeviceIdentity;
use crate::link::{LinkError, LinkInfo, LinkSettings, NetworkLink};
use crate::mqtt::{
    BrokerSession, ConnectionState, SessionConnector, SessionControl, SessionError,
    SessionEvents, SessionSettings,
};
use crate::watchdog::{LivenessGuard, ResetReason, Watchdog, WatchdogError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Configure(u64),
    Feed,
    Associate,
    Open(u32),
    Connect(u32),
    Subscribe(String),
    Publish(String, String),
    Service(u32),
    Disconnect(u32),
}

#[derive(Debug, Clone, Default)]
pub struct Journal(Rc<RefCell<Vec<Call>>>);

impl Journal {
    pub fn record(&self, call: Call) {
        self.0.borrow_mut().push(call);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.0.borrow().clone()
    }

    pub fn clear(&self) {
        self.0.borrow_mut().clear();
    }

    pub fn count(&self, matches: impl Fn(&Call) -> bool) -> usize {
        self.0.borrow().iter().filter(|call| matches(*call)).count()
    }
}

/// Output line recording every level written to it.
#[derive(Debug, Clone, Default)]
pub struct FakeLine(Rc<RefCell<Vec<bool>>>);

impl FakeLine {
    pub fn writes(&self) -> Vec<bool> {
        self.0.borrow().clone()
    }

    pub fn level(&self) -> Option<bool> {
        self.0.borrow().last().copied()
    }

    pub fn clear(&self) {
        self.0.borrow_mut().clear();
    }
}

impl OutputLine for FakeLine {
    fn set_level(&mut self, on: bool) {
        self.0.borrow_mut().push(on);
    }
}

#[derive(Debug)]
pub struct FakeWatchdog {
    journal: Journal,
    pub fail_feeds: bool,
    pub reset_reason: ResetReason,
}

impl FakeWatchdog {
    pub fn new(journal: &Journal) -> Self {
        Self {
            journal: journal.clone(),
            fail_feeds: false,
            reset_reason: ResetReason::PowerOn,
        }
    }
}

impl Watchdog for FakeWatchdog {
    fn configure(&mut self, timeout: Duration) -> Result<Duration, WatchdogError> {
        self.journal.record(Call::Configure(timeout.as_secs()));
        Ok(timeout)
    }

    fn feed(&mut self) -> Result<(), WatchdogError> {
        self.journal.record(Call::Feed);
        if self.fail_feeds {
            return Err(WatchdogError::NotConfigured);
        }
        Ok(())
    }

    fn reset_reason(&self) -> ResetReason {
        self.reset_reason
    }
}

/// Link that comes up unless told otherwise. Scripted failures are consumed
/// in order.
#[derive(Debug)]
pub struct FakeLink {
    journal: Journal,
    failures: VecDeque<bool>,
}

impl FakeLink {
    pub fn new(journal: &Journal) -> Self {
        Self {
            journal: journal.clone(),
            failures: VecDeque::new(),
        }
    }

    /// `true` entries fail the corresponding associate call.
    pub fn with_script(mut self, script: &[bool]) -> Self {
        self.failures = script.iter().copied().collect();
        self
    }
}

impl NetworkLink for FakeLink {
    fn associate(&mut self, _settings: &LinkSettings) -> Result<LinkInfo, LinkError> {
        self.journal.record(Call::Associate);
        if self.failures.pop_front().unwrap_or(false) {
            return Err(LinkError::NotConfigured("scripted failure"));
        }
        Ok(LinkInfo {
            address: IpAddr::V4(Ipv4Addr::new(192, 168, 1, 50)),
        })
    }
}

/// What happens on one `service` call.
#[derive(Debug, Clone)]
pub enum Step {
    Idle,
    /// Delivered on the first subscribed topic; dropped when nothing is
    /// subscribed.
    Message(Vec<u8>),
    /// Broker closes the connection.
    Drop,
    Fail,
}

/// Script for one session. An exhausted step list fails the next service
/// call.
#[derive(Debug, Clone, Default)]
pub struct SessionPlan {
    pub fail_open: bool,
    pub fail_connect: bool,
    pub fail_subscribe: bool,
    pub fail_publish: bool,
    pub steps: Vec<Step>,
}

impl SessionPlan {
    pub fn steps(steps: Vec<Step>) -> Self {
        Self {
            steps,
            ..Self::default()
        }
    }
}

/// Hands out numbered [`FakeSession`]s following the queued plans. When
/// the queue runs dry every open fails.
#[derive(Debug)]
pub struct FakeConnector {
    journal: Journal,
    plans: VecDeque<SessionPlan>,
    opened: u32,
    pub settings: Rc<RefCell<Vec<SessionSettings>>>,
}

impl FakeConnector {
    pub fn new(journal: &Journal, plans: Vec<SessionPlan>) -> Self {
        Self {
            journal: journal.clone(),
            plans: plans.into(),
            opened: 0,
            settings: Rc::default(),
        }
    }
}

impl SessionConnector for FakeConnector {
    fn open(&mut self, settings: &SessionSettings) -> Result<Box<dyn BrokerSession>, SessionError> {
        self.opened += 1;
        self.journal.record(Call::Open(self.opened));
        self.settings.borrow_mut().push(settings.clone());

        match self.plans.pop_front() {
            Some(plan) if !plan.fail_open => Ok(Box::new(FakeSession {
                id: self.opened,
                journal: self.journal.clone(),
                state: ConnectionState::Disconnected,
                subscriptions: Vec::new(),
                steps: plan.steps.clone().into(),
                plan,
            })),
            _ => Err(SessionError::ChannelClosed),
        }
    }
}

#[derive(Debug)]
pub struct FakeSession {
    id: u32,
    journal: Journal,
    state: ConnectionState,
    subscriptions: Vec<String>,
    steps: VecDeque<Step>,
    plan: SessionPlan,
}

impl SessionControl for FakeSession {
    fn subscribe(&mut self, topic: &str) -> Result<(), SessionError> {
        self.journal.record(Call::Subscribe(topic.to_string()));
        if self.plan.fail_subscribe {
            return Err(SessionError::SubscribeRejected(topic.to_string()));
        }
        self.subscriptions.push(topic.to_string());
        Ok(())
    }

    fn publish(&mut self, topic: &str, payload: &str) -> Result<(), SessionError> {
        self.journal
            .record(Call::Publish(topic.to_string(), payload.to_string()));
        if self.plan.fail_publish {
            return Err(SessionError::NotConnected);
        }
        Ok(())
    }
}

impl BrokerSession for FakeSession {
    fn state(&self) -> ConnectionState {
        self.state
    }

    fn connect(&mut self, events: &mut dyn SessionEvents) -> Result<(), SessionError> {
        self.journal.record(Call::Connect(self.id));
        if self.plan.fail_connect {
            self.state = ConnectionState::Faulted;
            return Err(SessionError::ConnectTimeout(Duration::from_secs(10)));
        }
        self.state = ConnectionState::Connected;
        let result = events.on_connect(self);
        if result.is_err() {
            self.state = ConnectionState::Faulted;
            events.on_disconnect(self);
        }
        result
    }

    fn service(
        &mut self,
        _timeout: Duration,
        events: &mut dyn SessionEvents,
    ) -> Result<(), SessionError> {
        self.journal.record(Call::Service(self.id));
        if self.state != ConnectionState::Connected {
            return Err(SessionError::NotConnected);
        }

        match self.steps.pop_front() {
            Some(Step::Idle) => Ok(()),
            Some(Step::Message(payload)) => {
                if let Some(topic) = self.subscriptions.first().cloned() {
                    events.on_message(self, &topic, &payload);
                }
                Ok(())
            }
            Some(Step::Drop) => {
                self.state = ConnectionState::Faulted;
                events.on_disconnect(self);
                Err(SessionError::Disconnected)
            }
            Some(Step::Fail) | None => {
                self.state = ConnectionState::Faulted;
                Err(SessionError::ChannelClosed)
            }
        }
    }

    fn disconnect(&mut self) -> Result<(), SessionError> {
        self.journal.record(Call::Disconnect(self.id));
        self.state = ConnectionState::Disconnected;
        Ok(())
    }
}

/// Bare [`SessionControl`] for driving handlers directly.
#[derive(Debug)]
pub struct RecordingControl {
    journal: Journal,
    pub fail_subscribe: bool,
    pub fail_publish: bool,
}

impl RecordingControl {
    pub fn new(journal: &Journal) -> Self {
        Self {
            journal: journal.clone(),
            fail_subscribe: false,
            fail_publish: false,
        }
    }
}

impl SessionControl for RecordingControl {
    fn subscribe(&mut self, topic: &str) -> Result<(), SessionError> {
        self.journal.record(Call::Subscribe(topic.to_string()));
        if self.fail_subscribe {
            return Err(SessionError::SubscribeRejected(topic.to_string()));
        }
        Ok(())
    }

    fn publish(&mut self, topic: &str, payload: &str) -> Result<(), SessionError> {
        self.journal
            .record(Call::Publish(topic.to_string(), payload.to_string()));
        if self.fail_publish {
            return Err(SessionError::NotConnected);
        }
        Ok(())
    }
}

/// A configured device context over fakes. The journal is cleared after
/// the guard is armed, so tests only see what happens afterwards.
pub fn device(
    journal: &Journal,
    customize: impl FnOnce(&mut Configuration),
) -> (DeviceContext, FakeLine) {
    let mut config = Configuration::default();
    config.mqtt.topic = Some("relay/{uid}/set".to_string());
    config.supervisor.retry_delay_ms = 0;
    customize(&mut config);

    let identity = DeviceIdentity::from_raw(b"00c0ffee").unwrap();
    let line = FakeLine::default();
    let actuator = ActuatorState::new(Box::new(line.clone()));
    line.clear();

    let mut guard = LivenessGuard::new(Box::new(FakeWatchdog::new(journal)));
    guard.configure(config.watchdog.timeout()).unwrap();
    journal.clear();

    let device = DeviceContext::new(config, identity, actuator, guard).unwrap();
    (device, line)
}
