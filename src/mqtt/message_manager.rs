use chrono::NaiveDateTime;
use std::fmt;

use crate::watchdog::ResetReason;

/// Last will payload, published by the broker when the device drops off.
pub const STATUS_DISCONNECTED: &str = "disconnected";

const PREVIEW_LEN: usize = 32;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub received_at: NaiveDateTime,
}

impl InboundMessage {
    pub fn from_publish(publish: &rumqttc::Publish) -> Self {
        Self::new(publish.topic.clone(), publish.payload.to_vec())
    }

    pub fn new(topic: String, payload: Vec<u8>) -> Self {
        InboundMessage {
            topic,
            payload,
            received_at: chrono::Local::now().naive_local(),
        }
    }

    /// Payload as text, truncated for logging.
    pub fn preview(&self) -> String {
        let text = String::from_utf8_lossy(&self.payload);
        let mut preview: String = text.chars().take(PREVIEW_LEN).collect();
        if text.chars().count() > PREVIEW_LEN {
            preview.push_str("...");
        }
        preview
    }
}

impl fmt::Display for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} - {}: {:?}",
            self.received_at.format("%H:%M:%S%.3f"),
            self.topic,
            self.preview()
        )
    }
}

/// Announcement published on the debug topic after each successful connect.
///
/// `previous_fault` carries the error that ended the previous session when
/// the process recovered by itself.
pub fn connected_status(reset_reason: ResetReason, previous_fault: Option<&str>) -> String {
    match previous_fault {
        Some(fault) => format!("connected, {} recovered from: {}", reset_reason, fault),
        None => format!("connected, {} startup", reset_reason),
    }
}
