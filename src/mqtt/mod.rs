//! # MQTT Session Module
//!
//! Owns the single broker connection of the feeder panel. The session is a
//! small state machine running on its own task; everything else talks to it
//! through a cloneable [`mqtt_handler::Session`] handle.
//!
//! ```text
//! mqtt/
//! ├── config.rs           - Broker, timing and topic settings
//! ├── message_manager.rs  - Inbound messages and topic routing
//! ├── mqtt_handler.rs     - Connection state machine, send/reconnect policy
//! └── transport.rs        - Broker client seam and the rumqttc backend
//! ```
//!
//! ## Connection policy
//!
//! - A connect request while an attempt is in flight is a no-op.
//! - An unexpected loss schedules exactly one reconnect after a fixed delay.
//!   A failed reconnect ends in `Disconnected`; further attempts happen only
//!   when something asks for them (an explicit connect or a `send`).
//! - `send` while not connected triggers a connect and waits a bounded time
//!   for it before failing with `NotConnected`.
//! - Subscriptions are tracked in the router and re-issued on every connect.

pub mod config;
pub mod message_manager;
pub mod mqtt_handler;
pub mod transport;
