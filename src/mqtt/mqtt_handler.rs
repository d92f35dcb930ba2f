//! Broker session: connection state machine and outbound send contract
//!
//! One [`SessionWorker`] task owns the transport, the routing table and the
//! [`ConnectionState`]. Everything that can change them (operator calls,
//! broker events, the reconnect timer) is funnelled into that task, so there is
//! a single writer and no lost update between a connection-lost event and a
//! concurrent send.
//!
//! ```text
//! Session (cloneable) ─[SessionCommand]─┐
//! Transport           ─[BrokerEvent]────┼─► SessionWorker ─[SessionStatus]─► watch
//! Reconnect timer     ─[attempt id]─────┘
//! ```

use chrono::{DateTime, Local};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::SessionSettings;
use super::message_manager::{InboundMessage, PayloadHandler, SharedHandler, TopicRouter};
use super::transport::{BrokerEvent, BrokerEventKind, BrokerTransport};

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Snapshot of the session published after every change
#[derive(Clone, Debug, Default)]
pub struct SessionStatus {
    pub connection_state: ConnectionState,
    /// Reason of the last failure or loss, cleared once connected
    pub last_error: Option<String>,
    pub messages_received: usize,
    pub messages_sent: usize,
    pub last_activity: Option<DateTime<Local>>,
}

impl SessionStatus {
    /// Human-readable status line for the operator
    pub fn describe(&self) -> String {
        match (self.connection_state, &self.last_error) {
            (ConnectionState::Connected, _) => "connected".to_string(),
            (ConnectionState::Connecting, _) => "connecting...".to_string(),
            (ConnectionState::Reconnecting, Some(reason)) => {
                format!("connection lost ({reason}), reconnecting...")
            }
            (ConnectionState::Reconnecting, None) => "connection lost, reconnecting...".to_string(),
            (ConnectionState::Disconnected, Some(reason)) => format!("disconnected: {reason}"),
            (ConnectionState::Disconnected, None) => "disconnected".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendFailure {
    NotConnected,
    PublishError(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("send failed: not connected")]
    NotConnected,

    #[error("send failed: {0}")]
    PublishError(String),

    #[error("session is closed")]
    SessionClosed,
}

impl SendError {
    pub fn failure(&self) -> Option<SendFailure> {
        match self {
            SendError::NotConnected => Some(SendFailure::NotConnected),
            SendError::PublishError(reason) => Some(SendFailure::PublishError(reason.clone())),
            SendError::SessionClosed => None,
        }
    }
}

enum SessionCommand {
    /// Answered once the worker has acted on the request
    Connect {
        response_tx: oneshot::Sender<()>,
    },
    Register {
        topic: String,
        handler: SharedHandler,
        response_tx: oneshot::Sender<()>,
    },
    Publish {
        topic: String,
        payload: String,
        response_tx: oneshot::Sender<Result<(), SendError>>,
    },
    Disconnect {
        response_tx: oneshot::Sender<()>,
    },
    Shutdown {
        response_tx: oneshot::Sender<()>,
    },
}

/// Cloneable handle to the process-wide broker session
#[derive(Clone)]
pub struct Session {
    commands: mpsc::Sender<SessionCommand>,
    status: watch::Receiver<SessionStatus>,
    settings: SessionSettings,
}

impl Session {
    /// Starts the worker task; the session begins `Disconnected`.
    pub fn spawn<T: BrokerTransport>(
        transport: T,
        settings: SessionSettings,
    ) -> (Self, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::channel(settings.command_capacity);
        let (status_tx, status_rx) = watch::channel(SessionStatus::default());

        let worker = SessionWorker::new(transport, settings.clone(), command_rx, status_tx);
        let handle = tokio::spawn(worker.run());

        let session = Self {
            commands: command_tx,
            status: status_rx,
            settings,
        };
        (session, handle)
    }

    pub fn state(&self) -> ConnectionState {
        self.status.borrow().connection_state
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// Requests a connect attempt unless one is already in flight.
    pub async fn connect(&self) -> Result<(), SendError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.command(SessionCommand::Connect { response_tx }).await?;
        response_rx.await.map_err(|_| SendError::SessionClosed)
    }

    /// Routes `topic` to `handler`; the broker subscription is issued once
    /// per topic and re-issued after every reconnect.
    pub async fn register<H>(&self, topic: &str, handler: H) -> Result<(), SendError>
    where
        H: PayloadHandler + 'static,
    {
        let (response_tx, response_rx) = oneshot::channel();
        self.command(SessionCommand::Register {
            topic: topic.to_string(),
            handler: Arc::new(handler),
            response_tx,
        })
        .await?;
        response_rx.await.map_err(|_| SendError::SessionClosed)
    }

    /// Publishes `payload`, connecting first if needed.
    ///
    /// When the session is not connected this triggers (or joins) a connect
    /// attempt and waits for its outcome, at most the configured send timeout.
    /// A connection that drops between the state check and the publish gets
    /// the same treatment within the same deadline. Dropping the future
    /// abandons only this wait; the attempt carries on.
    pub async fn send(&self, topic: &str, payload: &str) -> Result<(), SendError> {
        let deadline = Instant::now() + self.settings.send_timeout();
        let mut waited = false;
        if self.state() != ConnectionState::Connected {
            debug!("Send to {} while {:?}, waiting for connection", topic, self.state());
            self.connect_and_wait(topic, deadline).await?;
            waited = true;
        }

        match self.publish(topic, payload).await {
            Err(SendError::NotConnected) if !waited => {
                debug!("Connection dropped before publishing to {}, waiting for it", topic);
                self.connect_and_wait(topic, deadline).await?;
                self.publish(topic, payload).await
            }
            result => result,
        }
    }

    async fn connect_and_wait(&self, topic: &str, deadline: Instant) -> Result<(), SendError> {
        self.connect().await?;

        // after the connect ack, Disconnected can only mean this attempt failed
        let mut status = self.status.clone();
        let settled = timeout_at(deadline, async {
            status
                .wait_for(|s| {
                    matches!(
                        s.connection_state,
                        ConnectionState::Connected | ConnectionState::Disconnected
                    )
                })
                .await
                .map(|s| s.connection_state)
        })
        .await;

        match settled {
            Ok(Ok(ConnectionState::Connected)) => Ok(()),
            Ok(Ok(_)) => {
                warn!("Connect attempt failed, message to {} not sent", topic);
                Err(SendError::NotConnected)
            }
            Ok(Err(_)) => Err(SendError::SessionClosed),
            Err(_) => {
                warn!(
                    "No connection within {:?}, message to {} not sent",
                    self.settings.send_timeout(),
                    topic
                );
                Err(SendError::NotConnected)
            }
        }
    }

    async fn publish(&self, topic: &str, payload: &str) -> Result<(), SendError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.command(SessionCommand::Publish {
            topic: topic.to_string(),
            payload: payload.to_string(),
            response_tx,
        })
        .await?;
        response_rx.await.map_err(|_| SendError::SessionClosed)?
    }

    /// Unsubscribes everything and closes the connection. Registered routes
    /// are kept for the next `connect`.
    pub async fn disconnect(&self) -> Result<(), SendError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.command(SessionCommand::Disconnect { response_tx }).await?;
        response_rx.await.map_err(|_| SendError::SessionClosed)
    }

    /// Disconnects and stops the worker; later calls fail with `SessionClosed`.
    pub async fn shutdown(&self) -> Result<(), SendError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.command(SessionCommand::Shutdown { response_tx }).await?;
        response_rx.await.map_err(|_| SendError::SessionClosed)
    }

    async fn command(&self, command: SessionCommand) -> Result<(), SendError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SendError::SessionClosed)
    }
}

struct SessionWorker<T> {
    transport: T,
    settings: SessionSettings,
    router: TopicRouter,
    status_tx: watch::Sender<SessionStatus>,
    command_rx: mpsc::Receiver<SessionCommand>,
    event_tx: mpsc::UnboundedSender<BrokerEvent>,
    event_rx: mpsc::UnboundedReceiver<BrokerEvent>,
    timer_tx: mpsc::UnboundedSender<u64>,
    timer_rx: mpsc::UnboundedReceiver<u64>,
    state: ConnectionState,
    /// Set while a connect attempt is outstanding or scheduled
    connect_guard: bool,
    /// Id of the current attempt; events and timers for other ids are stale
    attempt: u64,
    reconnect_timer: Option<CancellationToken>,
}

impl<T: BrokerTransport> SessionWorker<T> {
    fn new(
        transport: T,
        settings: SessionSettings,
        command_rx: mpsc::Receiver<SessionCommand>,
        status_tx: watch::Sender<SessionStatus>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        Self {
            transport,
            settings,
            router: TopicRouter::new(),
            status_tx,
            command_rx,
            event_tx,
            event_rx,
            timer_tx,
            timer_rx,
            state: ConnectionState::Disconnected,
            connect_guard: false,
            attempt: 0,
            reconnect_timer: None,
        }
    }

    async fn run(mut self) {
        info!("Session worker started");
        loop {
            tokio::select! {
                command = self.command_rx.recv() => match command {
                    Some(command) => {
                        if !self.on_command(command) {
                            break;
                        }
                    }
                    None => {
                        self.close("all session handles dropped");
                        break;
                    }
                },
                Some(event) = self.event_rx.recv() => self.on_broker_event(event),
                Some(attempt) = self.timer_rx.recv() => self.on_reconnect_due(attempt),
            }
        }
        info!("Session worker stopped");
    }

    /// Returns `false` once the worker should stop.
    fn on_command(&mut self, command: SessionCommand) -> bool {
        match command {
            SessionCommand::Connect { response_tx } => {
                self.request_connect();
                let _ = response_tx.send(());
            }
            SessionCommand::Register {
                topic,
                handler,
                response_tx,
            } => {
                let needs_subscription = self.router.register(&topic, handler);
                debug!("Registered handler for {}", topic);
                if needs_subscription && self.state == ConnectionState::Connected {
                    if let Err(e) = self.transport.subscribe(&topic) {
                        warn!("Subscribing to {} failed: {}", topic, e);
                    }
                }
                let _ = response_tx.send(());
            }
            SessionCommand::Publish {
                topic,
                payload,
                response_tx,
            } => {
                let result = self.publish(&topic, &payload);
                if response_tx.send(result).is_err() {
                    debug!("Sender of message to {} stopped waiting", topic);
                }
            }
            SessionCommand::Disconnect { response_tx } => {
                self.close("disconnected by operator");
                let _ = response_tx.send(());
            }
            SessionCommand::Shutdown { response_tx } => {
                self.close("shut down");
                let _ = response_tx.send(());
                return false;
            }
        }
        true
    }

    fn publish(&mut self, topic: &str, payload: &str) -> Result<(), SendError> {
        if self.state != ConnectionState::Connected {
            return Err(SendError::NotConnected);
        }
        match self.transport.publish(topic, payload) {
            Ok(()) => {
                debug!("Published to {}: {}", topic, payload);
                self.status_tx.send_modify(|s| {
                    s.messages_sent += 1;
                    s.last_activity = Some(Local::now());
                });
                Ok(())
            }
            Err(e) => {
                // a failed publish alone is no proof the connection is gone
                error!("Publishing to {} failed: {}", topic, e);
                Err(SendError::PublishError(e.to_string()))
            }
        }
    }

    /// Starts a connect attempt unless one is outstanding. A pending
    /// reconnect is brought forward instead of adding a second attempt.
    fn request_connect(&mut self) {
        match self.state {
            ConnectionState::Connected => debug!("Already connected"),
            ConnectionState::Connecting => debug!("Connect attempt already in flight"),
            ConnectionState::Reconnecting => {
                debug!("Bringing scheduled reconnect forward");
                self.cancel_reconnect_timer();
                self.connect_guard = false;
                self.begin_connect();
            }
            ConnectionState::Disconnected => self.begin_connect(),
        }
    }

    fn begin_connect(&mut self) {
        if self.connect_guard {
            debug!("Connect guard set, not starting another attempt");
            return;
        }
        self.attempt += 1;
        self.connect_guard = true;
        self.set_state(ConnectionState::Connecting, None);

        if let Err(e) = self.transport.connect(self.attempt, self.event_tx.clone()) {
            error!("Connect attempt {} could not start: {}", self.attempt, e);
            self.connect_guard = false;
            self.set_state(ConnectionState::Disconnected, Some(e.to_string()));
        }
    }

    fn on_broker_event(&mut self, event: BrokerEvent) {
        if event.attempt != self.attempt {
            debug!(
                "Ignoring {:?} from stale attempt {} (current {})",
                event.kind, event.attempt, self.attempt
            );
            return;
        }

        match event.kind {
            BrokerEventKind::Connected => {
                if self.state != ConnectionState::Connecting {
                    debug!("Unexpected connect ack while {:?}", self.state);
                    return;
                }
                self.connect_guard = false;
                self.set_state(ConnectionState::Connected, None);
                self.resubscribe();
            }
            BrokerEventKind::ConnectFailed(reason) => {
                if self.state != ConnectionState::Connecting {
                    debug!("Connect failure while {:?}: {}", self.state, reason);
                    return;
                }
                warn!("Connect attempt {} failed: {}", self.attempt, reason);
                self.connect_guard = false;
                self.set_state(ConnectionState::Disconnected, Some(reason));
            }
            BrokerEventKind::ConnectionLost { code, reason } => self.on_connection_lost(code, reason),
            BrokerEventKind::Message { topic, payload } => {
                if self.state != ConnectionState::Connected {
                    debug!("Message on {} while {:?}", topic, self.state);
                }
                let message = InboundMessage::from_topic(topic, payload);
                self.router.dispatch(&message);
                self.status_tx.send_modify(|s| {
                    s.messages_received += 1;
                    s.last_activity = Some(Local::now());
                });
            }
        }
    }

    fn on_connection_lost(&mut self, code: i32, reason: String) {
        match self.state {
            ConnectionState::Connected if code == 0 => {
                info!("Connection closed cleanly");
                self.set_state(ConnectionState::Disconnected, None);
            }
            ConnectionState::Connected => {
                warn!("Connection lost (code {}): {}", code, reason);
                self.set_state(ConnectionState::Reconnecting, Some(reason));
                self.schedule_reconnect();
            }
            ConnectionState::Reconnecting => {
                debug!("Already reconnecting, ignoring loss: {}", reason);
            }
            ConnectionState::Connecting => {
                warn!("Connection dropped during connect: {}", reason);
                self.connect_guard = false;
                self.set_state(ConnectionState::Disconnected, Some(reason));
            }
            ConnectionState::Disconnected => {
                debug!("Loss reported while disconnected: {}", reason);
            }
        }
    }

    fn schedule_reconnect(&mut self) {
        if self.connect_guard {
            debug!("Reconnect already scheduled");
            return;
        }
        self.connect_guard = true;

        let token = CancellationToken::new();
        let delay = self.settings.reconnect_delay();
        let attempt = self.attempt;
        let timer_tx = self.timer_tx.clone();
        let cancelled = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {}
                _ = sleep(delay) => {
                    let _ = timer_tx.send(attempt);
                }
            }
        });
        self.reconnect_timer = Some(token);
        info!("Reconnect scheduled in {:?}", delay);
    }

    fn on_reconnect_due(&mut self, attempt: u64) {
        if attempt != self.attempt || self.state != ConnectionState::Reconnecting {
            debug!("Dropping stale reconnect timer for attempt {}", attempt);
            return;
        }
        self.reconnect_timer = None;
        self.connect_guard = false;
        self.begin_connect();
    }

    fn cancel_reconnect_timer(&mut self) {
        if let Some(token) = self.reconnect_timer.take() {
            token.cancel();
        }
    }

    fn resubscribe(&mut self) {
        let topics = self.router.topics();
        info!("Subscribing to {} topics", topics.len());
        for topic in topics {
            if let Err(e) = self.transport.subscribe(&topic) {
                warn!("Subscribing to {} failed: {}", topic, e);
            }
        }
    }

    /// Brings the session to `Disconnected` from any state.
    fn close(&mut self, reason: &str) {
        self.cancel_reconnect_timer();
        self.connect_guard = false;
        // invalidates events still queued for the old connection
        self.attempt += 1;

        if self.state == ConnectionState::Disconnected {
            debug!("Close requested while already disconnected");
            return;
        }
        if self.state == ConnectionState::Connected {
            for topic in self.router.topics() {
                if let Err(e) = self.transport.unsubscribe(&topic) {
                    debug!("Unsubscribing from {} failed: {}", topic, e);
                }
            }
        }
        if let Err(e) = self.transport.disconnect() {
            if self.state == ConnectionState::Connected {
                warn!("Closing the connection failed: {}", e);
            } else {
                debug!("Closing the connection failed: {}", e);
            }
        }
        info!("Session closed: {}", reason);
        self.set_state(ConnectionState::Disconnected, None);
    }

    fn set_state(&mut self, state: ConnectionState, last_error: Option<String>) {
        if self.state != state {
            info!("Connection state {:?} -> {:?}", self.state, state);
        }
        self.state = state;
        self.status_tx.send_modify(|s| {
            s.connection_state = state;
            s.last_error = last_error;
        });
    }
}
