//! Broker transport seam
//!
//! The session worker drives the broker through [`BrokerTransport`] and learns
//! about connection progress through [`BrokerEvent`]s pushed into a channel,
//! the same shape as callback-style client libraries. Every event carries the
//! attempt number it belongs to so a superseded connection cannot disturb the
//! current one.

use rumqttc::{
    AsyncClient, ClientError, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet,
    QoS, Transport,
};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::config::BrokerConfig;

pub type EventSink = mpsc::UnboundedSender<BrokerEvent>;

#[derive(Clone, Debug, PartialEq)]
pub struct BrokerEvent {
    pub attempt: u64,
    pub kind: BrokerEventKind,
}

#[derive(Clone, Debug, PartialEq)]
pub enum BrokerEventKind {
    /// The broker accepted the connection
    Connected,
    /// The connect attempt was rejected or the endpoint was unreachable
    ConnectFailed(String),
    /// An established connection ended; code 0 is a clean local close
    ConnectionLost { code: i32, reason: String },
    Message { topic: String, payload: String },
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("no client, connect first")]
    NoClient,

    #[error("client request failed: {0}")]
    Client(#[from] ClientError),

    #[error("transport rejected request: {0}")]
    Rejected(String),
}

/// Operations the session needs from a broker client
///
/// All calls are non-blocking: they enqueue the request and return. The
/// outcome of `connect` arrives later as a [`BrokerEvent`].
pub trait BrokerTransport: Send + 'static {
    fn connect(&mut self, attempt: u64, events: EventSink) -> Result<(), TransportError>;
    fn subscribe(&mut self, topic: &str) -> Result<(), TransportError>;
    fn unsubscribe(&mut self, topic: &str) -> Result<(), TransportError>;
    fn publish(&mut self, topic: &str, payload: &str) -> Result<(), TransportError>;
    fn disconnect(&mut self) -> Result<(), TransportError>;
}

/// [`BrokerTransport`] backed by rumqttc
pub struct RumqttTransport {
    config: BrokerConfig,
    client: Option<AsyncClient>,
    poller: Option<JoinHandle<()>>,
}

impl RumqttTransport {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            client: None,
            poller: None,
        }
    }

    fn options(&self) -> MqttOptions {
        let client_id = format!("petfeeder_{:08x}", rand::random::<u32>());
        let mut options = MqttOptions::new(client_id, self.config.host.clone(), self.config.port);
        options
            .set_keep_alive(Duration::from_secs(self.config.keep_alive_secs))
            .set_clean_session(true);
        if let Some((user, pw)) = self.config.credentials() {
            options.set_credentials(user, pw);
        }
        if self.config.tls {
            options.set_transport(Transport::tls_with_default_config());
        }
        options
    }

    fn client(&self) -> Result<&AsyncClient, TransportError> {
        self.client.as_ref().ok_or(TransportError::NoClient)
    }

    fn stop_poller(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
    }
}

impl BrokerTransport for RumqttTransport {
    fn connect(&mut self, attempt: u64, events: EventSink) -> Result<(), TransportError> {
        self.stop_poller();
        let options = self.options();
        info!(
            "Connecting to {} as {} (tls: {})",
            self.config.endpoint(),
            options.client_id(),
            self.config.tls
        );

        let (client, event_loop) = AsyncClient::new(options, self.config.request_capacity);
        self.client = Some(client);
        self.poller = Some(tokio::spawn(poll_events(attempt, event_loop, events)));
        Ok(())
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        self.client()?.try_subscribe(topic, QoS::AtMostOnce)?;
        Ok(())
    }

    fn unsubscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        self.client()?.try_unsubscribe(topic)?;
        Ok(())
    }

    fn publish(&mut self, topic: &str, payload: &str) -> Result<(), TransportError> {
        self.client()?
            .try_publish(topic, QoS::AtMostOnce, false, payload.as_bytes().to_vec())?;
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        match self.client.take() {
            Some(client) => client.try_disconnect().map_err(|e| {
                warn!("Disconnect request failed, dropping the event loop: {}", e);
                self.stop_poller();
                TransportError::from(e)
            }),
            None => {
                self.stop_poller();
                Ok(())
            }
        }
    }
}

impl Drop for RumqttTransport {
    fn drop(&mut self) {
        self.stop_poller();
    }
}

/// Drives one rumqttc event loop until the connection ends.
///
/// rumqttc would silently reconnect on the next poll; the session owns the
/// reconnect policy, so the loop stops at the first error.
async fn poll_events(attempt: u64, mut event_loop: EventLoop, events: EventSink) {
    let mut connected = false;
    loop {
        let kind = match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    connected = true;
                    BrokerEventKind::Connected
                } else {
                    BrokerEventKind::ConnectFailed(format!("{:?}", ack.code))
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => BrokerEventKind::Message {
                topic: publish.topic.clone(),
                payload: String::from_utf8_lossy(&publish.payload).into_owned(),
            },
            Ok(Event::Incoming(Packet::Disconnect)) => BrokerEventKind::ConnectionLost {
                code: 1,
                reason: "broker closed the connection".to_string(),
            },
            Ok(Event::Outgoing(Outgoing::Disconnect)) => BrokerEventKind::ConnectionLost {
                code: 0,
                reason: "disconnected locally".to_string(),
            },
            Ok(other) => {
                debug!("Broker event: {:?}", other);
                continue;
            }
            Err(e) if connected => BrokerEventKind::ConnectionLost {
                code: 1,
                reason: e.to_string(),
            },
            Err(e) => BrokerEventKind::ConnectFailed(e.to_string()),
        };

        let terminal = !matches!(
            kind,
            BrokerEventKind::Connected | BrokerEventKind::Message { .. }
        );
        if events.send(BrokerEvent { attempt, kind }).is_err() {
            warn!("Session gone, stopping event loop for attempt {}", attempt);
            break;
        }
        if terminal {
            break;
        }
    }
    debug!("Event loop for attempt {} finished", attempt);
}

#[cfg(test)]
pub(crate) mod mock {
    //! Recording transport for driving the session without a broker

    use super::*;
    use std::sync::{Arc, Mutex, MutexGuard};

    #[derive(Clone, Debug, PartialEq)]
    pub enum Call {
        Connect(u64),
        Subscribe(String),
        Unsubscribe(String),
        Publish(String, String),
        Disconnect,
    }

    #[derive(Default)]
    struct MockState {
        calls: Vec<Call>,
        events: Option<(u64, EventSink)>,
        auto_ack: bool,
        fail_publish: bool,
    }

    #[derive(Clone, Default)]
    pub struct MockTransport {
        state: Arc<Mutex<MockState>>,
    }

    impl MockTransport {
        /// Never answers connect attempts on its own
        pub fn silent() -> Self {
            Self::default()
        }

        /// Accepts every connect attempt immediately
        pub fn auto_ack() -> Self {
            let mock = Self::default();
            mock.lock().auto_ack = true;
            mock
        }

        pub fn fail_publishes(&self) {
            self.lock().fail_publish = true;
        }

        fn lock(&self) -> MutexGuard<'_, MockState> {
            self.state.lock().unwrap()
        }

        pub fn calls(&self) -> Vec<Call> {
            self.lock().calls.clone()
        }

        pub fn connects(&self) -> usize {
            self.count(|c| matches!(c, Call::Connect(_)))
        }

        pub fn subscribes(&self) -> Vec<String> {
            self.calls()
                .into_iter()
                .filter_map(|c| match c {
                    Call::Subscribe(topic) => Some(topic),
                    _ => None,
                })
                .collect()
        }

        pub fn published(&self) -> Vec<(String, String)> {
            self.calls()
                .into_iter()
                .filter_map(|c| match c {
                    Call::Publish(topic, payload) => Some((topic, payload)),
                    _ => None,
                })
                .collect()
        }

        pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
            self.lock().calls.iter().filter(|c| pred(c)).count()
        }

        /// Emits an event for the most recent connect attempt
        pub fn emit(&self, kind: BrokerEventKind) {
            let state = self.lock();
            let (attempt, sink) = state.events.as_ref().expect("connect was never called");
            sink.send(BrokerEvent {
                attempt: *attempt,
                kind,
            })
            .unwrap();
        }

        pub fn deliver(&self, topic: &str, payload: &str) {
            self.emit(BrokerEventKind::Message {
                topic: topic.to_string(),
                payload: payload.to_string(),
            });
        }
    }

    impl BrokerTransport for MockTransport {
        fn connect(&mut self, attempt: u64, events: EventSink) -> Result<(), TransportError> {
            let mut state = self.lock();
            state.calls.push(Call::Connect(attempt));
            if state.auto_ack {
                let _ = events.send(BrokerEvent {
                    attempt,
                    kind: BrokerEventKind::Connected,
                });
            }
            state.events = Some((attempt, events));
            Ok(())
        }

        fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
            self.lock().calls.push(Call::Subscribe(topic.to_string()));
            Ok(())
        }

        fn unsubscribe(&mut self, topic: &str) -> Result<(), TransportError> {
            self.lock().calls.push(Call::Unsubscribe(topic.to_string()));
            Ok(())
        }

        fn publish(&mut self, topic: &str, payload: &str) -> Result<(), TransportError> {
            let mut state = self.lock();
            if state.fail_publish {
                return Err(TransportError::Rejected("queue full".to_string()));
            }
            state
                .calls
                .push(Call::Publish(topic.to_string(), payload.to_string()));
            Ok(())
        }

        fn disconnect(&mut self) -> Result<(), TransportError> {
            self.lock().calls.push(Call::Disconnect);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_carry_credentials_and_random_id() {
        let transport = RumqttTransport::new(BrokerConfig {
            host: "broker.example".to_string(),
            port: 8883,
            username: Some("feeder".to_string()),
            password: Some("secret".to_string()),
            ..BrokerConfig::default()
        });

        let first = transport.options();
        let second = transport.options();
        assert!(first.client_id().starts_with("petfeeder_"));
        assert_eq!(first.client_id().len(), "petfeeder_".len() + 8);
        assert_ne!(first.client_id(), second.client_id());
        assert_eq!(
            first.credentials(),
            Some(("feeder".to_string(), "secret".to_string()))
        );
        assert_eq!(first.broker_address(), ("broker.example".to_string(), 8883));
    }

    #[tokio::test]
    async fn failed_disconnect_still_stops_the_event_loop() {
        let mut transport = RumqttTransport::new(BrokerConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            tls: false,
            request_capacity: 1,
            ..BrokerConfig::default()
        });
        let (events, _events_rx) = mpsc::unbounded_channel();
        transport.connect(1, events).unwrap();
        // the event loop has not run yet, so this fills the request queue
        transport.publish("drive/msg", "queued").unwrap();

        assert!(matches!(
            transport.disconnect(),
            Err(TransportError::Client(_))
        ));
        assert!(transport.client.is_none());
        assert!(transport.poller.is_none());
    }

    #[test]
    fn requests_without_client_fail() {
        let mut transport = RumqttTransport::new(BrokerConfig::default());
        assert!(matches!(
            transport.publish("drive/msg", "hi"),
            Err(TransportError::NoClient)
        ));
        assert!(transport.disconnect().is_ok());
    }
}
