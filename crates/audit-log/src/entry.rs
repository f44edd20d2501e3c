use serde::{Deserialize, Serialize};

/// One line of the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: uuid::Uuid,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub event: AuditEvent,
    pub peer: AuditPeer,
    pub details: serde_json::Value,
}

impl AuditEntry {
    /// Stamp a new entry with a fresh id and the current UTC time.
    pub fn new(event: AuditEvent, peer: AuditPeer, details: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            timestamp: chrono::Utc::now(),
            event,
            peer,
            details,
        }
    }
}

/// Lifecycle events recorded for tunnel connections and the process itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEvent {
    /// The requested target could not be decoded or a verify hook vetoed it.
    ConnectionRejected,
    SessionOpened,
    SessionClosed,
    ProcessStarted,
    ProcessStopped,
}

/// Who the event is about.
///
/// Process-level events only carry the component name; connection events
/// also carry the client address and, once known, the session id and the
/// requested target.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditPeer {
    pub component: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_addr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

impl AuditPeer {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            ..Self::default()
        }
    }

    pub fn with_remote_addr(mut self, addr: impl ToString) -> Self {
        self.remote_addr = Some(addr.to_string());
        self
    }

    pub fn with_session_id(mut self, id: impl ToString) -> Self {
        self.session_id = Some(id.to_string());
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }
}
