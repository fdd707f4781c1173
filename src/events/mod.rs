//! State-change events and the in-process bus producers publish onto.

mod bus;

pub use bus::EventBus;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const STATUS_CHANGED: &str = "status-changed";
pub const AUDIT_ENTRY_CREATED: &str = "audit-entry-created";
pub const USER_STATE_CHANGED: &str = "user-state-changed";
pub const TERMINAL_SESSION_OPENED: &str = "terminal.session-opened";
pub const TERMINAL_SESSION_CLOSED: &str = "terminal.session-closed";

/// An immutable notification that something changed.
///
/// `event_type` is an open set; the payload is never interpreted here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    pub origin_id: String,
}

impl Event {
    pub fn new(event_type: impl Into<String>, payload: Value, origin_id: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            timestamp: Utc::now(),
            origin_id: origin_id.into(),
        }
    }
}
