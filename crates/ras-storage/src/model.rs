use chrono::{DateTime, Utc};
use ras_types::{
    AccessSession, ActorContext, AuditAction, MemorialId, Payment, RequestId, RequestStatus,
    SessionId,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Audit append payload. Entry id, sequence, and chain hashes are assigned by
/// storage at append time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditAppend {
    pub request_id: RequestId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    pub action: AuditAction,
    pub actor: ActorContext,
    #[serde(default)]
    pub metadata: Value,
    pub timestamp: DateTime<Utc>,
}

impl AuditAppend {
    pub fn new(
        request_id: RequestId,
        action: AuditAction,
        actor: ActorContext,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            request_id,
            session_id: None,
            action,
            actor,
            metadata: Value::Null,
            timestamp,
        }
    }

    pub fn with_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Generic query window for paged reads. A zero limit means unbounded.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryWindow {
    pub limit: usize,
    pub offset: usize,
}

/// Filters for request listings.
#[derive(Debug, Clone, Default)]
pub struct RequestFilter {
    pub status: Option<RequestStatus>,
    pub memorial_id: Option<MemorialId>,
}

/// Outcome of a conditional payment confirmation.
#[derive(Debug, Clone)]
pub enum ConfirmOutcome {
    /// The pending payment was confirmed by this call.
    Confirmed(Payment),
    /// The payment was already confirmed; nothing was written.
    AlreadyConfirmed(Payment),
}

impl ConfirmOutcome {
    pub fn payment(&self) -> &Payment {
        match self {
            Self::Confirmed(payment) | Self::AlreadyConfirmed(payment) => payment,
        }
    }
}

/// Outcome of the atomic token lookup-and-touch.
#[derive(Debug, Clone)]
pub enum TokenTouch {
    /// The session was active and unexpired; `last_accessed_at` was updated.
    Validated(AccessSession),
    /// A row matched the hash but was inactive or expired. Left untouched.
    Rejected(AccessSession),
    /// No row matched the hash.
    Unknown,
}

/// Outcome of a session deactivation.
#[derive(Debug, Clone)]
pub enum DeactivateOutcome {
    Deactivated(AccessSession),
    /// The session was already inactive; nothing was written.
    AlreadyInactive(AccessSession),
}

impl DeactivateOutcome {
    pub fn session(&self) -> &AccessSession {
        match self {
            Self::Deactivated(session) | Self::AlreadyInactive(session) => session,
        }
    }
}
