use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Broker endpoint and credentials
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub keep_alive_secs: u64,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Capacity of the client request queue
    pub request_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8883,
            tls: true,
            keep_alive_secs: 30,
            username: None,
            password: None,
            request_capacity: 64,
        }
    }
}

impl BrokerConfig {
    pub fn credentials(&self) -> Option<(String, String)> {
        match (&self.username, &self.password) {
            (Some(user), Some(pw)) => Some((user.clone(), pw.clone())),
            (Some(user), None) => Some((user.clone(), String::new())),
            _ => None,
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Timing of the session state machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Delay before the single reconnect attempt after an unexpected loss
    pub reconnect_delay_ms: u64,
    /// How long `send` waits for a connection before giving up
    pub send_timeout_ms: u64,
    pub command_capacity: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: 3000,
            send_timeout_ms: 3000,
            command_capacity: 100,
        }
    }
}

impl SessionSettings {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

/// Topic names used by the feeder firmware
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicConfig {
    pub dispenser: String,
    pub operator_message: String,
    pub water_level: String,
    pub pet_weight: String,
    pub webcam: String,
    pub water_level_request: String,
    pub pet_weight_request: String,
    pub portion: String,
    pub feed_time: String,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            dispenser: "drive/foodDispenser".to_string(),
            operator_message: "drive/msg".to_string(),
            water_level: "sensor/waterLevel".to_string(),
            pet_weight: "sensor/petWeight".to_string(),
            webcam: "sensor/Webcam".to_string(),
            water_level_request: "msg/waterLevelRequest".to_string(),
            pet_weight_request: "msg/petWeightRequest".to_string(),
            portion: "drive/portion".to_string(),
            feed_time: "drive/feedTime".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_without_username_is_ignored() {
        let mut broker = BrokerConfig {
            password: Some("secret".to_string()),
            ..BrokerConfig::default()
        };
        assert_eq!(broker.credentials(), None);

        broker.username = Some("feeder".to_string());
        assert_eq!(
            broker.credentials(),
            Some(("feeder".to_string(), "secret".to_string()))
        );
        assert_eq!(broker.endpoint(), "localhost:8883");
    }

    #[test]
    fn partial_session_section_keeps_defaults() {
        let settings: SessionSettings = toml::from_str("reconnect_delay_ms = 100").unwrap();
        assert_eq!(settings.reconnect_delay(), Duration::from_millis(100));
        assert_eq!(settings.send_timeout(), Duration::from_secs(3));
    }
}
