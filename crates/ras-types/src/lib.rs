//! RAS Types - shared domain types for the restricted access workflow.
//!
//! Every status in this subsystem is a closed enum with an explicit transition
//! table. Free-form status strings never cross a component boundary.

#![deny(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::RwLock;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub String);
impl RequestId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}
impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VerificationId(pub String);
impl VerificationId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PaymentId(pub String);
impl PaymentId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);
impl SessionId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}
impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemorialId(pub String);
impl MemorialId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}
impl std::fmt::Display for MemorialId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FacilityId(pub String);
impl FacilityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AuditEntryId(pub String);
impl AuditEntryId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

/// Lifecycle of an access request.
///
/// The happy path is `Pending -> UnderReview -> Verified -> PaymentPending ->
/// Approved`. `Rejected` and `Expired` are terminal and reachable from any
/// non-terminal state; `Expired` is driven by an external caller since this
/// subsystem runs no scheduler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    UnderReview,
    Verified,
    PaymentPending,
    Approved,
    Rejected,
    Expired,
}

impl RequestStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Approved | Self::Rejected | Self::Expired)
    }

    /// The transition table. Anything not listed here is rejected.
    pub fn can_transition_to(self, next: RequestStatus) -> bool {
        use RequestStatus::*;
        match (self, next) {
            (Pending, UnderReview)
            | (UnderReview, Verified)
            | (Verified, PaymentPending)
            | (PaymentPending, Approved) => true,
            (from, Rejected) | (from, Expired) => !from.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::UnderReview => "UNDER_REVIEW",
            Self::Verified => "VERIFIED",
            Self::PaymentPending => "PAYMENT_PENDING",
            Self::Approved => "APPROVED",
            Self::Rejected => "REJECTED",
            Self::Expired => "EXPIRED",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationType {
    Identity,
    Relationship,
    FacilityAuthorization,
}

impl VerificationType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Identity => "IDENTITY",
            Self::Relationship => "RELATIONSHIP",
            Self::FacilityAuthorization => "FACILITY_AUTHORIZATION",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Pending,
    Passed,
    Failed,
}

impl VerificationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Passed => "PASSED",
            Self::Failed => "FAILED",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Confirmed,
    Failed,
}

/// An applicant's ask for time-bound access to a private memorial.
///
/// Requests are never hard-deleted; terminal states are retained for audit.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AccessRequest {
    pub request_id: RequestId,
    pub memorial_id: MemorialId,
    pub requested_by_email: String,
    pub inmate_name: String,
    pub facility_id: FacilityId,
    pub relationship: String,
    pub status: RequestStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin_notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One eligibility check recorded against a request. Immutable once written;
/// corrections are new rows.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Verification {
    pub verification_id: VerificationId,
    pub request_id: RequestId,
    pub verification_type: VerificationType,
    pub status: VerificationStatus,
    pub verified_by: String,
    pub verification_data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Payment {
    pub payment_id: PaymentId,
    pub request_id: RequestId,
    /// Integer cents. No floating-point money.
    pub amount_cents: i64,
    pub payer_email: String,
    pub payment_method: String,
    pub status: PaymentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A time-bound, revocable access grant.
///
/// Only the blake3 hash of the opaque token is stored; the plaintext is
/// returned once at creation and cannot be recovered afterwards.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AccessSession {
    pub session_id: SessionId,
    pub request_id: RequestId,
    pub memorial_id: MemorialId,
    pub token_hash: String,
    pub expires_at: DateTime<Utc>,
    pub is_active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_accessed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// The closed taxonomy of auditable actions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    RequestCreated,
    StatusChanged(RequestStatus),
    StatusChangeDenied,
    VerificationRecorded(VerificationType, VerificationStatus),
    PaymentInitiated,
    PaymentConfirmed,
    SessionCreated,
    SessionDenied,
    SessionDeactivated,
    TokenValidated,
    TokenDenied,
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RequestCreated => write!(f, "REQUEST_CREATED"),
            Self::StatusChanged(status) => write!(f, "STATUS_CHANGED_TO_{}", status.as_str()),
            Self::StatusChangeDenied => write!(f, "STATUS_CHANGE_DENIED"),
            Self::VerificationRecorded(vtype, status) => {
                write!(f, "VERIFICATION_{}_{}", vtype.as_str(), status.as_str())
            }
            Self::PaymentInitiated => write!(f, "PAYMENT_INITIATED"),
            Self::PaymentConfirmed => write!(f, "PAYMENT_CONFIRMED"),
            Self::SessionCreated => write!(f, "ACCESS_SESSION_CREATED"),
            Self::SessionDenied => write!(f, "ACCESS_SESSION_DENIED"),
            Self::SessionDeactivated => write!(f, "ACCESS_SESSION_DEACTIVATED"),
            Self::TokenValidated => write!(f, "ACCESS_TOKEN_VALIDATED"),
            Self::TokenDenied => write!(f, "ACCESS_TOKEN_DENIED"),
        }
    }
}

/// One entry in the append-only audit ledger. Hashes and sequencing are
/// assigned by storage; entries are never updated or deleted.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub entry_id: AuditEntryId,
    pub sequence: u64,
    pub request_id: RequestId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    pub action: AuditAction,
    pub performed_by: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_hash: Option<String>,
    pub hash: String,
}

/// Correctional facility reference data. Looked up, never written, by this
/// subsystem.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Facility {
    pub facility_id: FacilityId,
    pub name: String,
    pub is_active: bool,
    /// Whether requests naming this facility must pass a
    /// facility_authorization check before they count as ready.
    pub requires_authorization: bool,
}

/// Who performed a mutating operation, for the audit trail.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActorContext {
    pub performed_by: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

impl ActorContext {
    pub fn new(performed_by: impl Into<String>) -> Self {
        Self {
            performed_by: performed_by.into(),
            ip_address: None,
            user_agent: None,
        }
    }

    pub fn system() -> Self {
        Self::new("system")
    }
}

/// Time source seam so components never reach for the ambient clock directly.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Settable clock for tests.
pub struct FixedClock {
    now: RwLock<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: RwLock::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        if let Ok(mut guard) = self.now.write() {
            *guard = now;
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        if let Ok(mut guard) = self.now.write() {
            *guard += by;
        }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.read().map(|guard| *guard).unwrap_or_else(|e| *e.into_inner())
    }
}
