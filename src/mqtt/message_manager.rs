//! Inbound message representation and topic routing

use chrono::NaiveDateTime;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::telemetry::codec::FormatError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub content: String,
    pub timestamp: NaiveDateTime,
}

impl fmt::Display for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let preview: String = self.content.chars().take(10).collect();
        write!(f, "{} - {}", self.timestamp, preview)
    }
}

impl InboundMessage {
    pub fn from_topic(topic: String, content: String) -> Self {
        InboundMessage {
            topic,
            content,
            timestamp: chrono::Local::now().naive_local(),
        }
    }

    pub fn render(&self) -> String {
        format!("{}: {}\n{}", self.timestamp, self.topic, self.content)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("malformed payload: {0}")]
    Format(#[from] FormatError),

    #[error("handler rejected message: {0}")]
    Rejected(String),
}

/// Consumer of messages delivered on one topic
///
/// Handlers run on the session worker, in delivery order; they must return
/// quickly and hand anything slow to a background task.
pub trait PayloadHandler: Send + Sync {
    fn handle(&self, message: &InboundMessage) -> Result<(), HandlerError>;
}

impl<F> PayloadHandler for F
where
    F: Fn(&InboundMessage) -> Result<(), HandlerError> + Send + Sync,
{
    fn handle(&self, message: &InboundMessage) -> Result<(), HandlerError> {
        self(message)
    }
}

pub type SharedHandler = Arc<dyn PayloadHandler>;

/// Exact-match routing table from topic to handlers
#[derive(Default)]
pub struct TopicRouter {
    routes: HashMap<String, Vec<SharedHandler>>,
}

impl TopicRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a handler; returns `true` when the topic was not routed before
    /// and therefore still needs a broker subscription.
    pub fn register(&mut self, topic: &str, handler: SharedHandler) -> bool {
        let handlers = self.routes.entry(topic.to_string()).or_default();
        handlers.push(handler);
        handlers.len() == 1
    }

    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.routes.keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Runs every handler registered for the message topic and returns how
    /// many of them accepted it. Failures are logged and skipped.
    pub fn dispatch(&self, message: &InboundMessage) -> usize {
        let Some(handlers) = self.routes.get(&message.topic) else {
            debug!("No handler for topic {}, dropping message", message.topic);
            return 0;
        };

        let mut accepted = 0;
        for handler in handlers {
            match handler.handle(message) {
                Ok(()) => accepted += 1,
                Err(e) => warn!("Dropped message on {}: {}", message.topic, e),
            }
        }
        accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_handler(counter: Arc<AtomicUsize>) -> SharedHandler {
        Arc::new(move |_: &InboundMessage| -> Result<(), HandlerError> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn message(topic: &str, content: &str) -> InboundMessage {
        InboundMessage::from_topic(topic.to_string(), content.to_string())
    }

    #[test]
    fn dispatch_reaches_exact_topic_only() {
        let mut router = TopicRouter::new();
        let hits = Arc::new(AtomicUsize::new(0));
        router.register("sensor/petWeight", counting_handler(hits.clone()));

        assert_eq!(router.dispatch(&message("sensor/petWeight", "1")), 1);
        assert_eq!(router.dispatch(&message("sensor/+", "1")), 0);
        assert_eq!(router.dispatch(&message("sensor/petWeight/raw", "1")), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unregistered_topic_is_a_noop() {
        let router = TopicRouter::new();
        assert_eq!(router.dispatch(&message("drive/msg", "hi")), 0);
    }

    #[test]
    fn registration_is_additive() {
        let mut router = TopicRouter::new();
        let hits = Arc::new(AtomicUsize::new(0));

        assert!(router.register("drive/foodDispenser", counting_handler(hits.clone())));
        assert!(!router.register("drive/foodDispenser", counting_handler(hits.clone())));
        assert_eq!(router.topics(), vec!["drive/foodDispenser".to_string()]);

        assert_eq!(router.dispatch(&message("drive/foodDispenser", "ON")), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failing_handler_does_not_block_others() {
        let mut router = TopicRouter::new();
        let hits = Arc::new(AtomicUsize::new(0));
        router.register(
            "sensor/waterLevel",
            Arc::new(|_: &InboundMessage| -> Result<(), HandlerError> {
                Err(HandlerError::Rejected("broken".to_string()))
            }),
        );
        router.register("sensor/waterLevel", counting_handler(hits.clone()));

        assert_eq!(router.dispatch(&message("sensor/waterLevel", "3")), 1);
        assert_eq!(router.dispatch(&message("sensor/waterLevel", "4")), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn display_truncates_long_content() {
        let msg = message("sensor/Webcam", "aGVsbG8gd29ybGQgZnJvbSB0aGUgY2FtZXJh");
        let shown = msg.to_string();
        assert!(shown.ends_with(" - aGVsbG8gd2"));
        assert!(msg.render().contains("sensor/Webcam"));
    }
}
