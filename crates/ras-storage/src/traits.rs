use crate::model::{
    AuditAppend, ConfirmOutcome, DeactivateOutcome, QueryWindow, RequestFilter, TokenTouch,
};
use crate::StorageResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ras_types::{
    AccessRequest, AccessSession, ActorContext, AuditLogEntry, Payment, PaymentId, RequestId,
    RequestStatus, SessionId, Verification,
};

/// Storage interface for access request records.
///
/// Every mutating method takes the accompanying audit event and must apply
/// mutation and append as one unit: if the audit append cannot be recorded,
/// the mutation must not become visible.
#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Insert a newly created request.
    async fn insert_request(
        &self,
        request: AccessRequest,
        audit: AuditAppend,
    ) -> StorageResult<()>;

    /// Conditionally move a request between statuses. Fails with an invariant
    /// violation when the stored status no longer matches `expected_from`.
    async fn update_request_status(
        &self,
        request_id: &RequestId,
        expected_from: RequestStatus,
        to: RequestStatus,
        admin_notes: Option<String>,
        updated_at: DateTime<Utc>,
        audit: AuditAppend,
    ) -> StorageResult<AccessRequest>;

    async fn get_request(&self, request_id: &RequestId) -> StorageResult<Option<AccessRequest>>;

    /// List requests newest-first.
    async fn list_requests(
        &self,
        filter: RequestFilter,
        window: QueryWindow,
    ) -> StorageResult<Vec<AccessRequest>>;
}

/// Storage interface for append-only verification rows.
#[async_trait]
pub trait VerificationStore: Send + Sync {
    async fn insert_verification(
        &self,
        verification: Verification,
        audit: AuditAppend,
    ) -> StorageResult<()>;

    /// All rows for a request, oldest-first in insertion order.
    async fn list_verifications(&self, request_id: &RequestId)
        -> StorageResult<Vec<Verification>>;
}

/// Storage interface for payment records.
#[async_trait]
pub trait PaymentStore: Send + Sync {
    async fn insert_payment(&self, payment: Payment, audit: AuditAppend) -> StorageResult<()>;

    /// Conditional pending-to-confirmed update. Already-confirmed rows report
    /// `AlreadyConfirmed` without writing anything; failed rows are not
    /// confirmable.
    async fn confirm_payment(
        &self,
        payment_id: &PaymentId,
        paid_at: DateTime<Utc>,
        audit: AuditAppend,
    ) -> StorageResult<ConfirmOutcome>;

    async fn get_payment(&self, payment_id: &PaymentId) -> StorageResult<Option<Payment>>;

    async fn find_confirmed_payment(
        &self,
        request_id: &RequestId,
    ) -> StorageResult<Option<Payment>>;

    async fn list_payments(&self, request_id: &RequestId) -> StorageResult<Vec<Payment>>;
}

/// Storage interface for access sessions.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Conditional insert. Conflicts when an active session already exists
    /// for the request (expiry never flips `is_active`, so a stale session
    /// must be deactivated before a replacement is issued), or when the token
    /// hash is already in use. Token hashes are never reused.
    async fn insert_session(&self, session: AccessSession, audit: AuditAppend)
        -> StorageResult<()>;

    /// Atomic lookup-and-touch by token hash. On a usable session this sets
    /// `last_accessed_at` and appends an `ACCESS_TOKEN_VALIDATED` entry in the
    /// same unit; any other outcome leaves the store untouched. The audit
    /// event is synthesized here because the caller holds only the token.
    async fn touch_session(
        &self,
        token_hash: &str,
        now: DateTime<Utc>,
        actor: ActorContext,
    ) -> StorageResult<TokenTouch>;

    /// Flip `is_active` off, appending `ACCESS_SESSION_DEACTIVATED` with the
    /// reason in metadata. Idempotent: already-inactive rows report
    /// `AlreadyInactive` without writing anything.
    async fn deactivate_session(
        &self,
        session_id: &SessionId,
        reason: Option<String>,
        actor: ActorContext,
        now: DateTime<Utc>,
    ) -> StorageResult<DeactivateOutcome>;

    async fn get_session(&self, session_id: &SessionId) -> StorageResult<Option<AccessSession>>;

    async fn find_sessions_for_request(
        &self,
        request_id: &RequestId,
    ) -> StorageResult<Vec<AccessSession>>;
}

/// Storage interface for the append-only audit ledger.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Append an event and return the canonical, hash-linked stored entry.
    async fn append_audit(&self, event: AuditAppend) -> StorageResult<AuditLogEntry>;

    /// Read entries newest-first, optionally filtered by request or session.
    async fn query_audit(
        &self,
        request_id: Option<&RequestId>,
        session_id: Option<&SessionId>,
        window: QueryWindow,
    ) -> StorageResult<Vec<AuditLogEntry>>;

    /// Latest hash anchor of the chain.
    async fn latest_audit_hash(&self) -> StorageResult<Option<String>>;
}

/// Unified storage bundle used by the restricted access components.
pub trait AccessStore:
    RequestStore + VerificationStore + PaymentStore + SessionStore + AuditStore + Send + Sync
{
}

impl<T> AccessStore for T where
    T: RequestStore + VerificationStore + PaymentStore + SessionStore + AuditStore + Send + Sync
{
}
