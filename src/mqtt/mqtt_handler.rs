use std::fmt;
use std::time::{Duration, Instant};

use rumqttc::{
    Client, Connection, Event, LastWill, MqttOptions, Packet, QoS, RecvTimeoutError,
    SubscribeReasonCode, Transport,
};
use tracing::{debug, info, warn};

use super::message_manager::InboundMessage;
use super::{
    BrokerSession, ConnectionState, SessionConnector, SessionControl, SessionError,
    SessionEvents, SessionSettings,
};

/// Capacity of the request queue between client and event loop.
const REQUEST_CAPACITY: usize = 16;

/// Opens rumqttc-backed sessions.
#[derive(Debug, Default, Clone, Copy)]
pub struct MqttConnector;

impl SessionConnector for MqttConnector {
    fn open(&mut self, settings: &SessionSettings) -> Result<Box<dyn BrokerSession>, SessionError> {
        Ok(Box::new(MqttHandler::new(settings)))
    }
}

/// One broker connection over rumqttc's blocking client.
pub struct MqttHandler {
    client: Client,
    connection: Connection,
    state: ConnectionState,
    connect_timeout: Duration,
    subscriptions: Vec<String>,
}

impl fmt::Debug for MqttHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MqttHandler")
            .field("state", &self.state)
            .field("subscriptions", &self.subscriptions)
            .finish_non_exhaustive()
    }
}

impl MqttHandler {
    pub fn new(settings: &SessionSettings) -> Self {
        let (client, connection) = Client::new(mqtt_options(settings), REQUEST_CAPACITY);
        debug!("Session created for {:?}", settings);

        MqttHandler {
            client,
            connection,
            state: ConnectionState::Disconnected,
            connect_timeout: settings.connect_timeout,
            subscriptions: Vec::new(),
        }
    }

    fn fault(&mut self, error: SessionError) -> SessionError {
        self.state = ConnectionState::Faulted;
        error
    }

    /// Marks the session lost and tells the handlers about it.
    fn lost(&mut self, events: &mut dyn SessionEvents, error: SessionError) -> SessionError {
        self.state = ConnectionState::Faulted;
        events.on_disconnect(self);
        error
    }
}

pub fn mqtt_options(settings: &SessionSettings) -> MqttOptions {
    let mut options = MqttOptions::new(&settings.client_id, &settings.host, settings.port);
    options
        .set_keep_alive(settings.keep_alive)
        .set_clean_session(true);

    if let Some((username, password)) = &settings.credentials {
        options.set_credentials(username, password);
    }
    if let Some(will) = &settings.last_will {
        options.set_last_will(LastWill::new(
            &will.topic,
            will.payload.as_bytes().to_vec(),
            QoS::AtMostOnce,
            false,
        ));
    }
    if settings.tls {
        options.set_transport(Transport::tls_with_default_config());
    }
    options
}

impl SessionControl for MqttHandler {
    fn subscribe(&mut self, topic: &str) -> Result<(), SessionError> {
        self.client.try_subscribe(topic, QoS::AtMostOnce)?;
        self.subscriptions.push(topic.to_string());
        debug!("Subscription to {} requested", topic);
        Ok(())
    }

    fn publish(&mut self, topic: &str, payload: &str) -> Result<(), SessionError> {
        self.client
            .try_publish(topic, QoS::AtMostOnce, false, payload.as_bytes().to_vec())?;
        debug!("Published {:?} to {}", payload, topic);
        Ok(())
    }
}

impl BrokerSession for MqttHandler {
    fn state(&self) -> ConnectionState {
        self.state
    }

    fn connect(&mut self, events: &mut dyn SessionEvents) -> Result<(), SessionError> {
        self.state = ConnectionState::Connecting;
        let deadline = Instant::now() + self.connect_timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(self.fault(SessionError::ConnectTimeout(self.connect_timeout)));
            }

            match self.connection.recv_timeout(remaining) {
                Ok(Ok(Event::Incoming(Packet::ConnAck(ack)))) => {
                    info!("Connected to MQTT broker ({:?})", ack.code);
                    self.state = ConnectionState::Connected;
                    return match events.on_connect(self) {
                        Ok(()) => Ok(()),
                        Err(e) => Err(self.lost(events, e)),
                    };
                }
                Ok(Ok(event)) => debug!("Event before ConnAck: {:?}", event),
                Ok(Err(e)) => return Err(self.fault(e.into())),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(self.fault(SessionError::ChannelClosed))
                }
            }
        }
    }

    fn service(
        &mut self,
        timeout: Duration,
        events: &mut dyn SessionEvents,
    ) -> Result<(), SessionError> {
        if self.state != ConnectionState::Connected {
            return Err(SessionError::NotConnected);
        }

        match self.connection.recv_timeout(timeout) {
            Ok(Ok(Event::Incoming(Packet::Publish(publish)))) => {
                let message = InboundMessage::from_publish(&publish);
                debug!("Received {}", message);
                events.on_message(self, &message.topic, &message.payload);
                Ok(())
            }
            Ok(Ok(Event::Incoming(Packet::SubAck(ack)))) => {
                let rejected = ack
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure));
                if rejected {
                    let topics = self.subscriptions.join(", ");
                    return Err(self.lost(events, SessionError::SubscribeRejected(topics)));
                }
                debug!("Subscription acknowledged: {:?}", ack.return_codes);
                Ok(())
            }
            Ok(Ok(Event::Incoming(Packet::Disconnect))) => {
                Err(self.lost(events, SessionError::Disconnected))
            }
            Ok(Ok(event)) => {
                debug!("Broker event: {:?}", event);
                Ok(())
            }
            Ok(Err(e)) => Err(self.lost(events, e.into())),
            Err(RecvTimeoutError::Timeout) => Ok(()),
            Err(RecvTimeoutError::Disconnected) => {
                Err(self.lost(events, SessionError::ChannelClosed))
            }
        }
    }

    fn disconnect(&mut self) -> Result<(), SessionError> {
        if let Err(e) = self.client.try_disconnect() {
            warn!("Disconnect request not queued: {}", e);
            self.state = ConnectionState::Faulted;
            return Err(e.into());
        }
        self.state = ConnectionState::Disconnected;
        info!("Disconnected from MQTT broker");
        Ok(())
    }
}
