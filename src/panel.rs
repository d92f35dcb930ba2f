//! # Feeder Panel
//!
//! Glue between the broker session, the telemetry codec and the series store.
//! [`FeederPanel::attach`] registers one handler per device topic; handlers
//! decode payloads, append readings to the store and fold everything else
//! into a [`PanelState`] that front ends observe through a `watch` channel.
//!
//! Outbound commands validate operator input first and only then go through
//! [`Session::send`], so the caller gets either a validation error or the
//! session's send result.

use crate::mqtt::config::TopicConfig;
use crate::mqtt::message_manager::{HandlerError, InboundMessage};
use crate::mqtt::mqtt_handler::{SendError, Session};
use crate::persistence::series_store::SeriesStore;
use crate::telemetry::codec::{self, ImageFrame, MetricKind, Reading};
use crate::telemetry::command::{
    operator_message, FeedTime, Setpoint, Toggle, ValidationError, REFRESH_REQUEST,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub const WATER_LEVEL_SERIES: &str = "waterLevel";
pub const PET_WEIGHT_SERIES: &str = "petWeight";

/// Device state derived from inbound telemetry
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PanelState {
    pub dispenser_running: bool,
    pub water_level: Option<Reading>,
    /// Last raw payload per topic
    pub last_payloads: BTreeMap<String, String>,
    pub latest_frame: Option<ImageFrame>,
    /// Outcome of the last operator command, if it failed
    pub last_notice: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum PanelError {
    #[error("invalid input: {0}")]
    Validation(#[from] ValidationError),

    #[error("command not delivered: {0}")]
    Send(#[from] SendError),
}

#[derive(Clone)]
pub struct FeederPanel {
    session: Session,
    store: SeriesStore,
    topics: TopicConfig,
    state: Arc<watch::Sender<PanelState>>,
}

impl FeederPanel {
    /// Registers all telemetry handlers on `session`.
    pub async fn attach(
        session: Session,
        store: SeriesStore,
        topics: TopicConfig,
    ) -> Result<Self, SendError> {
        let (state_tx, _) = watch::channel(PanelState::default());
        let state = Arc::new(state_tx);

        let dispenser_state = state.clone();
        session
            .register(
                &topics.dispenser,
                move |msg: &InboundMessage| -> Result<(), HandlerError> {
                    let running = codec::parse_switch(&msg.content)?;
                    dispenser_state.send_modify(|s| {
                        s.dispenser_running = running;
                        s.last_payloads.insert(msg.topic.clone(), msg.content.clone());
                    });
                    Ok(())
                },
            )
            .await?;

        let board_state = state.clone();
        session
            .register(
                &topics.operator_message,
                move |msg: &InboundMessage| -> Result<(), HandlerError> {
                    board_state.send_modify(|s| {
                        s.last_payloads.insert(msg.topic.clone(), msg.content.clone());
                    });
                    Ok(())
                },
            )
            .await?;

        let level_state = state.clone();
        let level_store = store.clone();
        session
            .register(
                &topics.water_level,
                move |msg: &InboundMessage| -> Result<(), HandlerError> {
                    let reading = codec::parse(MetricKind::Level, &msg.content)?;
                    level_store.append(WATER_LEVEL_SERIES, reading.clone());
                    level_state.send_modify(|s| {
                        s.water_level = Some(reading);
                        s.last_payloads.insert(msg.topic.clone(), msg.content.clone());
                    });
                    Ok(())
                },
            )
            .await?;

        let weight_state = state.clone();
        let weight_store = store.clone();
        session
            .register(
                &topics.pet_weight,
                move |msg: &InboundMessage| -> Result<(), HandlerError> {
                    let reading = codec::parse(MetricKind::DatedWeight, &msg.content)?;
                    debug!("Pet weight {}", reading);
                    weight_store.append(PET_WEIGHT_SERIES, reading);
                    weight_state.send_modify(|s| {
                        s.last_payloads.insert(msg.topic.clone(), msg.content.clone());
                    });
                    Ok(())
                },
            )
            .await?;

        let frame_state = state.clone();
        session
            .register(
                &topics.webcam,
                move |msg: &InboundMessage| -> Result<(), HandlerError> {
                    let frame = ImageFrame::decode(&msg.content)?;
                    frame_state.send_modify(|s| {
                        s.last_payloads
                            .insert(msg.topic.clone(), format!("<frame {} bytes>", frame.byte_len));
                        s.latest_frame = Some(frame);
                    });
                    Ok(())
                },
            )
            .await?;

        info!("Feeder panel attached");
        Ok(Self {
            session,
            store,
            topics,
            state,
        })
    }

    pub fn state(&self) -> PanelState {
        self.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<PanelState> {
        self.state.subscribe()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub async fn set_dispenser(&self, on: bool) -> Result<(), PanelError> {
        let toggle = Toggle::from_bool(on);
        self.deliver(&self.topics.dispenser, toggle.payload()).await?;
        self.state.send_modify(|s| s.dispenser_running = on);
        info!("Food dispenser switched {}", toggle);
        Ok(())
    }

    pub async fn toggle_dispenser(&self) -> Result<(), PanelError> {
        let running = self.state.borrow().dispenser_running;
        self.set_dispenser(!running).await
    }

    pub async fn send_message(&self, text: &str) -> Result<(), PanelError> {
        let text = self.validated(operator_message(text))?;
        self.deliver(&self.topics.operator_message, text).await
    }

    pub async fn request_water_level(&self) -> Result<(), PanelError> {
        self.deliver(&self.topics.water_level_request, REFRESH_REQUEST).await
    }

    pub async fn request_pet_weight(&self) -> Result<(), PanelError> {
        self.deliver(&self.topics.pet_weight_request, REFRESH_REQUEST).await
    }

    pub async fn set_portion(&self, raw: &str) -> Result<(), PanelError> {
        let portion = self.validated(Setpoint::parse(raw))?;
        self.deliver(&self.topics.portion, &portion.payload()).await
    }

    pub async fn set_feed_time(&self, raw: &str) -> Result<(), PanelError> {
        let time = self.validated(FeedTime::parse(raw))?;
        self.deliver(&self.topics.feed_time, &time.payload()).await
    }

    pub fn store(&self) -> &SeriesStore {
        &self.store
    }

    fn validated<T>(&self, input: Result<T, ValidationError>) -> Result<T, PanelError> {
        input.map_err(|e| {
            warn!("Rejected operator input: {}", e);
            self.state.send_modify(|s| s.last_notice = Some(e.to_string()));
            PanelError::from(e)
        })
    }

    async fn deliver(&self, topic: &str, payload: &str) -> Result<(), PanelError> {
        match self.session.send(topic, payload).await {
            Ok(()) => {
                self.state.send_modify(|s| s.last_notice = None);
                Ok(())
            }
            Err(e) => {
                warn!("Command to {} failed: {}", topic, e);
                self.state.send_modify(|s| s.last_notice = Some(e.to_string()));
                Err(e.into())
            }
        }
    }
}
