//! RAS Service - the orchestration facade over the restricted access
//! workflow.
//!
//! `AccessService` owns the request lifecycle and delegates verification,
//! payment, session, and ledger concerns to their components, which all share
//! one `AccessStore`. Status moves are driven by the transition table on
//! `RequestStatus`; a rejected move is audited as a denial, never silently
//! dropped.

#![deny(unsafe_code)]

use chrono::{DateTime, Utc};
use ras_ledger::{AuditLedger, ChainVerification, LedgerError, LedgerStatistics};
use ras_payment::{PaymentError, PaymentGate};
use ras_session::{IssuedSession, SessionError, SessionIssuer};
use ras_storage::{
    AccessStore, AuditAppend, AuditStore, QueryWindow, RequestFilter, RequestStore, StorageError,
};
use ras_types::{
    AccessRequest, AccessSession, ActorContext, AuditAction, AuditLogEntry, Clock, FacilityId,
    MemorialId, Payment, PaymentId, RequestId, RequestStatus, SessionId, Verification,
    VerificationStatus, VerificationType,
};
use ras_verification::{FacilityDirectory, VerificationEngine, VerificationError};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Memorial reference data lookup. Read-only collaborator; memorial records
/// live outside this subsystem.
pub trait MemorialDirectory: Send + Sync {
    fn exists(&self, memorial_id: &MemorialId) -> bool;
}

/// Static in-memory directory, for tests and seeded deployments.
#[derive(Default)]
pub struct StaticMemorialDirectory {
    memorials: HashSet<MemorialId>,
}

impl StaticMemorialDirectory {
    pub fn new(memorials: impl IntoIterator<Item = MemorialId>) -> Self {
        Self {
            memorials: memorials.into_iter().collect(),
        }
    }
}

impl MemorialDirectory for StaticMemorialDirectory {
    fn exists(&self, memorial_id: &MemorialId) -> bool {
        self.memorials.contains(memorial_id)
    }
}

/// A request submission as it arrives at the boundary, before any identifiers
/// or timestamps are assigned.
#[derive(Debug, Clone)]
pub struct NewAccessRequest {
    pub memorial_id: MemorialId,
    pub requested_by_email: String,
    pub inmate_name: String,
    pub facility_id: FacilityId,
    pub relationship: String,
}

/// Orchestrates the restricted access workflow end to end.
pub struct AccessService {
    store: Arc<dyn AccessStore>,
    memorials: Arc<dyn MemorialDirectory>,
    facilities: Arc<dyn FacilityDirectory>,
    verification: Arc<VerificationEngine>,
    payments: Arc<PaymentGate>,
    sessions: SessionIssuer,
    ledger: AuditLedger,
    clock: Arc<dyn Clock>,
}

impl AccessService {
    pub fn new(
        store: Arc<dyn AccessStore>,
        memorials: Arc<dyn MemorialDirectory>,
        facilities: Arc<dyn FacilityDirectory>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let verification = Arc::new(VerificationEngine::new(
            store.clone(),
            facilities.clone(),
            clock.clone(),
        ));
        let payments = Arc::new(PaymentGate::new(store.clone(), clock.clone()));
        let sessions = SessionIssuer::new(
            store.clone(),
            verification.clone(),
            payments.clone(),
            clock.clone(),
        );
        let ledger = AuditLedger::new(store.clone());
        Self {
            store,
            memorials,
            facilities,
            verification,
            payments,
            sessions,
            ledger,
            clock,
        }
    }

    // ---- Request lifecycle --------------------------------------------------

    /// Accept a new request into `pending`.
    pub async fn create_request(
        &self,
        submission: NewAccessRequest,
        actor: ActorContext,
    ) -> Result<AccessRequest, AccessError> {
        validate_submission(&submission)?;
        if !self.memorials.exists(&submission.memorial_id) {
            return Err(AccessError::MemorialNotFound(
                submission.memorial_id.0.clone(),
            ));
        }
        let facility = self
            .facilities
            .get(&submission.facility_id)
            .ok_or_else(|| AccessError::FacilityNotFound(submission.facility_id.0.clone()))?;
        if !facility.is_active {
            return Err(AccessError::Validation(format!(
                "facility {} is not accepting requests",
                facility.facility_id.0
            )));
        }

        let now = self.clock.now();
        let request = AccessRequest {
            request_id: RequestId::generate(),
            memorial_id: submission.memorial_id,
            requested_by_email: submission.requested_by_email,
            inmate_name: submission.inmate_name,
            facility_id: submission.facility_id,
            relationship: submission.relationship,
            status: RequestStatus::Pending,
            admin_notes: None,
            created_at: now,
            updated_at: now,
        };

        let audit = AuditAppend::new(
            request.request_id.clone(),
            AuditAction::RequestCreated,
            actor,
            now,
        )
        .with_metadata(serde_json::json!({
            "memorial_id": request.memorial_id.0,
            "facility_id": request.facility_id.0,
        }));

        self.store.insert_request(request.clone(), audit).await?;

        info!(
            request_id = %request.request_id,
            memorial_id = %request.memorial_id,
            "access request created"
        );
        Ok(request)
    }

    /// Move a request along the lifecycle. A move the transition table
    /// rejects fails with `InvalidTransition` and is audited as a denial.
    pub async fn update_status(
        &self,
        request_id: &RequestId,
        new_status: RequestStatus,
        admin_notes: Option<String>,
        actor: ActorContext,
    ) -> Result<AccessRequest, AccessError> {
        let request = self
            .store
            .get_request(request_id)
            .await?
            .ok_or_else(|| AccessError::RequestNotFound(request_id.0.clone()))?;

        let now = self.clock.now();
        if !request.status.can_transition_to(new_status) {
            self.store
                .append_audit(
                    AuditAppend::new(
                        request.request_id.clone(),
                        AuditAction::StatusChangeDenied,
                        actor,
                        now,
                    )
                    .with_metadata(serde_json::json!({
                        "from": request.status.as_str(),
                        "to": new_status.as_str(),
                    })),
                )
                .await?;
            warn!(
                request_id = %request.request_id,
                from = request.status.as_str(),
                to = new_status.as_str(),
                "status change denied"
            );
            return Err(AccessError::InvalidTransition {
                from: request.status,
                to: new_status,
            });
        }

        let audit = AuditAppend::new(
            request.request_id.clone(),
            AuditAction::StatusChanged(new_status),
            actor,
            now,
        );

        // The expected-from guard closes the race against a concurrent move:
        // if the stored status changed under us, the update fails rather than
        // skipping a state.
        let updated = self
            .store
            .update_request_status(request_id, request.status, new_status, admin_notes, now, audit)
            .await
            .map_err(|err| match err {
                StorageError::InvariantViolation(msg) => AccessError::Conflict(msg),
                other => AccessError::from(other),
            })?;

        info!(
            request_id = %updated.request_id,
            status = updated.status.as_str(),
            "request status changed"
        );
        Ok(updated)
    }

    pub async fn get_request(
        &self,
        request_id: &RequestId,
    ) -> Result<Option<AccessRequest>, AccessError> {
        self.store
            .get_request(request_id)
            .await
            .map_err(AccessError::from)
    }

    pub async fn list_requests(
        &self,
        filter: RequestFilter,
        window: QueryWindow,
    ) -> Result<Vec<AccessRequest>, AccessError> {
        self.store
            .list_requests(filter, window)
            .await
            .map_err(AccessError::from)
    }

    // ---- Verification -------------------------------------------------------

    pub async fn record_verification(
        &self,
        request_id: &RequestId,
        verification_type: VerificationType,
        status: VerificationStatus,
        verified_by: impl Into<String>,
        verification_data: serde_json::Value,
        actor: ActorContext,
    ) -> Result<Verification, AccessError> {
        Ok(self
            .verification
            .record_verification(
                request_id,
                verification_type,
                status,
                verified_by,
                verification_data,
                actor,
            )
            .await?)
    }

    pub async fn is_ready(&self, request_id: &RequestId) -> Result<bool, AccessError> {
        Ok(self.verification.is_ready(request_id).await?)
    }

    pub async fn list_verifications(
        &self,
        request_id: &RequestId,
    ) -> Result<Vec<Verification>, AccessError> {
        Ok(self.verification.list_verifications(request_id).await?)
    }

    // ---- Payments -----------------------------------------------------------

    pub async fn create_payment(
        &self,
        request_id: &RequestId,
        amount_cents: i64,
        payer_email: impl Into<String>,
        payment_method: impl Into<String>,
        actor: ActorContext,
    ) -> Result<Payment, AccessError> {
        Ok(self
            .payments
            .create_payment(request_id, amount_cents, payer_email, payment_method, actor)
            .await?)
    }

    pub async fn confirm_payment(
        &self,
        payment_id: &PaymentId,
        actor: ActorContext,
    ) -> Result<Payment, AccessError> {
        Ok(self.payments.confirm_payment(payment_id, actor).await?)
    }

    pub async fn has_confirmed_payment(
        &self,
        request_id: &RequestId,
    ) -> Result<bool, AccessError> {
        Ok(self.payments.has_confirmed_payment(request_id).await?)
    }

    pub async fn list_payments(
        &self,
        request_id: &RequestId,
    ) -> Result<Vec<Payment>, AccessError> {
        Ok(self.payments.list_payments(request_id).await?)
    }

    // ---- Sessions -----------------------------------------------------------

    pub async fn create_session(
        &self,
        request_id: &RequestId,
        memorial_id: &MemorialId,
        expires_at: DateTime<Utc>,
        actor: ActorContext,
    ) -> Result<IssuedSession, AccessError> {
        Ok(self
            .sessions
            .create_session(request_id, memorial_id, expires_at, actor)
            .await?)
    }

    pub async fn validate_token(
        &self,
        token: &str,
        actor: ActorContext,
    ) -> Result<AccessSession, AccessError> {
        Ok(self.sessions.validate_token(token, actor).await?)
    }

    pub async fn deactivate_session(
        &self,
        session_id: &SessionId,
        reason: Option<String>,
        actor: ActorContext,
    ) -> Result<AccessSession, AccessError> {
        Ok(self
            .sessions
            .deactivate_session(session_id, reason, actor)
            .await?)
    }

    pub async fn list_sessions(
        &self,
        request_id: &RequestId,
    ) -> Result<Vec<AccessSession>, AccessError> {
        Ok(self.sessions.list_sessions(request_id).await?)
    }

    // ---- Audit ledger -------------------------------------------------------

    pub async fn audit_trail(
        &self,
        request_id: Option<&RequestId>,
        session_id: Option<&SessionId>,
        window: QueryWindow,
    ) -> Result<Vec<AuditLogEntry>, AccessError> {
        Ok(self.ledger.query(request_id, session_id, window).await?)
    }

    pub async fn verify_ledger(&self) -> Result<ChainVerification, AccessError> {
        Ok(self.ledger.verify_chain().await?)
    }

    pub async fn ledger_statistics(&self) -> Result<LedgerStatistics, AccessError> {
        Ok(self.ledger.statistics().await?)
    }
}

fn validate_submission(submission: &NewAccessRequest) -> Result<(), AccessError> {
    if submission.requested_by_email.trim().is_empty()
        || !submission.requested_by_email.contains('@')
    {
        return Err(AccessError::Validation(
            "requested_by_email must be a non-empty email address".to_string(),
        ));
    }
    if submission.inmate_name.trim().is_empty() {
        return Err(AccessError::Validation(
            "inmate_name must not be blank".to_string(),
        ));
    }
    if submission.relationship.trim().is_empty() {
        return Err(AccessError::Validation(
            "relationship must not be blank".to_string(),
        ));
    }
    Ok(())
}

/// Service-level errors, composed from the component errors.
#[derive(Debug, Error)]
pub enum AccessError {
    #[error("memorial not found: {0}")]
    MemorialNotFound(String),

    #[error("facility not found: {0}")]
    FacilityNotFound(String),

    #[error("request not found: {0}")]
    RequestNotFound(String),

    #[error("invalid submission: {0}")]
    Validation(String),

    #[error("invalid transition: {} -> {}", .from.as_str(), .to.as_str())]
    InvalidTransition {
        from: RequestStatus,
        to: RequestStatus,
    },

    #[error("conflicting concurrent update: {0}")]
    Conflict(String),

    #[error(transparent)]
    Verification(#[from] VerificationError),

    #[error(transparent)]
    Payment(#[from] PaymentError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("backend error: {0}")]
    Backend(String),
}

impl From<StorageError> for AccessError {
    fn from(value: StorageError) -> Self {
        match value {
            StorageError::NotFound(msg) => Self::RequestNotFound(msg),
            StorageError::Conflict(msg) => Self::Conflict(msg),
            StorageError::InvariantViolation(msg)
            | StorageError::Serialization(msg)
            | StorageError::Backend(msg) => Self::Backend(msg),
        }
    }
}
