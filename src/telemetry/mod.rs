//! Telemetry payload handling
//!
//! - [`codec`] - inbound sensor payloads into [`codec::Reading`]s
//! - [`command`] - validated outbound command payloads

pub mod codec;
pub mod command;
