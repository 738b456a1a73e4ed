//! In-memory reference implementation for the access storage traits.
//!
//! Deterministic and test-friendly. Production deployments should back this
//! contract with a transactional store; the invariants here (conditional
//! updates, mutation-coupled audit appends) map directly onto transactions.

use crate::model::{
    AuditAppend, ConfirmOutcome, DeactivateOutcome, QueryWindow, RequestFilter, TokenTouch,
};
use crate::traits::{AuditStore, PaymentStore, RequestStore, SessionStore, VerificationStore};
use crate::{StorageError, StorageResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ras_types::{
    AccessRequest, AccessSession, ActorContext, AuditAction, AuditEntryId, AuditLogEntry, Payment,
    PaymentId, PaymentStatus, RequestId, RequestStatus, SessionId, Verification,
};
use std::collections::HashMap;
use std::sync::RwLock;

/// In-memory access storage adapter.
///
/// Lock ordering is entity lock first, audit lock second, everywhere. Each
/// mutating operation validates its precondition, appends the audit entry,
/// and only then applies the mutation, so a failed append never leaves an
/// unaudited state change behind.
#[derive(Default)]
pub struct InMemoryAccessStore {
    requests: RwLock<HashMap<RequestId, AccessRequest>>,
    verifications: RwLock<HashMap<RequestId, Vec<Verification>>>,
    payments: RwLock<HashMap<PaymentId, Payment>>,
    sessions: RwLock<HashMap<SessionId, AccessSession>>,
    token_index: RwLock<HashMap<String, SessionId>>,
    audit: RwLock<Vec<AuditLogEntry>>,
}

impl InMemoryAccessStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RequestStore for InMemoryAccessStore {
    async fn insert_request(
        &self,
        request: AccessRequest,
        audit: AuditAppend,
    ) -> StorageResult<()> {
        let mut requests = self
            .requests
            .write()
            .map_err(|_| StorageError::Backend("requests lock poisoned".to_string()))?;

        if requests.contains_key(&request.request_id) {
            return Err(StorageError::Conflict(format!(
                "request {} already exists",
                request.request_id
            )));
        }

        let mut log = self
            .audit
            .write()
            .map_err(|_| StorageError::Backend("audit lock poisoned".to_string()))?;
        append_locked(&mut log, audit)?;

        requests.insert(request.request_id.clone(), request);
        Ok(())
    }

    async fn update_request_status(
        &self,
        request_id: &RequestId,
        expected_from: RequestStatus,
        to: RequestStatus,
        admin_notes: Option<String>,
        updated_at: DateTime<Utc>,
        audit: AuditAppend,
    ) -> StorageResult<AccessRequest> {
        let mut requests = self
            .requests
            .write()
            .map_err(|_| StorageError::Backend("requests lock poisoned".to_string()))?;
        let record = requests
            .get_mut(request_id)
            .ok_or_else(|| StorageError::NotFound(format!("request {request_id} not found")))?;

        if record.status != expected_from {
            return Err(StorageError::InvariantViolation(format!(
                "request {} moved concurrently: expected {:?}, found {:?}",
                request_id, expected_from, record.status
            )));
        }

        let mut log = self
            .audit
            .write()
            .map_err(|_| StorageError::Backend("audit lock poisoned".to_string()))?;
        append_locked(&mut log, audit)?;

        record.status = to;
        if admin_notes.is_some() {
            record.admin_notes = admin_notes;
        }
        record.updated_at = updated_at;
        Ok(record.clone())
    }

    async fn get_request(&self, request_id: &RequestId) -> StorageResult<Option<AccessRequest>> {
        let requests = self
            .requests
            .read()
            .map_err(|_| StorageError::Backend("requests lock poisoned".to_string()))?;
        Ok(requests.get(request_id).cloned())
    }

    async fn list_requests(
        &self,
        filter: RequestFilter,
        window: QueryWindow,
    ) -> StorageResult<Vec<AccessRequest>> {
        let requests = self
            .requests
            .read()
            .map_err(|_| StorageError::Backend("requests lock poisoned".to_string()))?;

        let mut values = requests
            .values()
            .filter(|request| {
                filter
                    .status
                    .map_or(true, |status| request.status == status)
            })
            .filter(|request| {
                filter
                    .memorial_id
                    .as_ref()
                    .map_or(true, |memorial| &request.memorial_id == memorial)
            })
            .cloned()
            .collect::<Vec<_>>();

        values.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(apply_window(values, window))
    }
}

#[async_trait]
impl VerificationStore for InMemoryAccessStore {
    async fn insert_verification(
        &self,
        verification: Verification,
        audit: AuditAppend,
    ) -> StorageResult<()> {
        let mut verifications = self
            .verifications
            .write()
            .map_err(|_| StorageError::Backend("verifications lock poisoned".to_string()))?;

        let mut log = self
            .audit
            .write()
            .map_err(|_| StorageError::Backend("audit lock poisoned".to_string()))?;
        append_locked(&mut log, audit)?;

        verifications
            .entry(verification.request_id.clone())
            .or_default()
            .push(verification);
        Ok(())
    }

    async fn list_verifications(
        &self,
        request_id: &RequestId,
    ) -> StorageResult<Vec<Verification>> {
        let verifications = self
            .verifications
            .read()
            .map_err(|_| StorageError::Backend("verifications lock poisoned".to_string()))?;
        Ok(verifications.get(request_id).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl PaymentStore for InMemoryAccessStore {
    async fn insert_payment(&self, payment: Payment, audit: AuditAppend) -> StorageResult<()> {
        let mut payments = self
            .payments
            .write()
            .map_err(|_| StorageError::Backend("payments lock poisoned".to_string()))?;

        if payments.contains_key(&payment.payment_id) {
            return Err(StorageError::Conflict(format!(
                "payment {} already exists",
                payment.payment_id.0
            )));
        }

        let mut log = self
            .audit
            .write()
            .map_err(|_| StorageError::Backend("audit lock poisoned".to_string()))?;
        append_locked(&mut log, audit)?;

        payments.insert(payment.payment_id.clone(), payment);
        Ok(())
    }

    async fn confirm_payment(
        &self,
        payment_id: &PaymentId,
        paid_at: DateTime<Utc>,
        audit: AuditAppend,
    ) -> StorageResult<ConfirmOutcome> {
        let mut payments = self
            .payments
            .write()
            .map_err(|_| StorageError::Backend("payments lock poisoned".to_string()))?;
        let record = payments
            .get_mut(payment_id)
            .ok_or_else(|| StorageError::NotFound(format!("payment {} not found", payment_id.0)))?;

        match record.status {
            PaymentStatus::Confirmed => Ok(ConfirmOutcome::AlreadyConfirmed(record.clone())),
            PaymentStatus::Failed => Err(StorageError::InvariantViolation(format!(
                "payment {} already failed and cannot be confirmed",
                payment_id.0
            ))),
            PaymentStatus::Pending => {
                let mut log = self
                    .audit
                    .write()
                    .map_err(|_| StorageError::Backend("audit lock poisoned".to_string()))?;
                append_locked(&mut log, audit)?;

                record.status = PaymentStatus::Confirmed;
                record.paid_at = Some(paid_at);
                Ok(ConfirmOutcome::Confirmed(record.clone()))
            }
        }
    }

    async fn get_payment(&self, payment_id: &PaymentId) -> StorageResult<Option<Payment>> {
        let payments = self
            .payments
            .read()
            .map_err(|_| StorageError::Backend("payments lock poisoned".to_string()))?;
        Ok(payments.get(payment_id).cloned())
    }

    async fn find_confirmed_payment(
        &self,
        request_id: &RequestId,
    ) -> StorageResult<Option<Payment>> {
        let payments = self
            .payments
            .read()
            .map_err(|_| StorageError::Backend("payments lock poisoned".to_string()))?;
        Ok(payments
            .values()
            .find(|payment| {
                payment.request_id == *request_id && payment.status == PaymentStatus::Confirmed
            })
            .cloned())
    }

    async fn list_payments(&self, request_id: &RequestId) -> StorageResult<Vec<Payment>> {
        let payments = self
            .payments
            .read()
            .map_err(|_| StorageError::Backend("payments lock poisoned".to_string()))?;
        let mut values = payments
            .values()
            .filter(|payment| payment.request_id == *request_id)
            .cloned()
            .collect::<Vec<_>>();
        values.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(values)
    }
}

#[async_trait]
impl SessionStore for InMemoryAccessStore {
    async fn insert_session(
        &self,
        session: AccessSession,
        audit: AuditAppend,
    ) -> StorageResult<()> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|_| StorageError::Backend("sessions lock poisoned".to_string()))?;
        let mut tokens = self
            .token_index
            .write()
            .map_err(|_| StorageError::Backend("token index lock poisoned".to_string()))?;

        // Token hashes are globally unique and never reused, even after
        // deactivation: the index keeps every hash ever inserted.
        if tokens.contains_key(&session.token_hash) {
            return Err(StorageError::Conflict(
                "token hash already in use".to_string(),
            ));
        }

        // Keyed on the flag alone: an expired session stays active until it
        // is deactivated, and it blocks a replacement until then.
        let active_exists = sessions
            .values()
            .any(|existing| existing.request_id == session.request_id && existing.is_active);
        if active_exists {
            return Err(StorageError::Conflict(format!(
                "request {} already has an active session",
                session.request_id
            )));
        }

        let mut log = self
            .audit
            .write()
            .map_err(|_| StorageError::Backend("audit lock poisoned".to_string()))?;
        append_locked(&mut log, audit)?;

        tokens.insert(session.token_hash.clone(), session.session_id.clone());
        sessions.insert(session.session_id.clone(), session);
        Ok(())
    }

    async fn touch_session(
        &self,
        token_hash: &str,
        now: DateTime<Utc>,
        actor: ActorContext,
    ) -> StorageResult<TokenTouch> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|_| StorageError::Backend("sessions lock poisoned".to_string()))?;
        let tokens = self
            .token_index
            .read()
            .map_err(|_| StorageError::Backend("token index lock poisoned".to_string()))?;

        let Some(session_id) = tokens.get(token_hash) else {
            return Ok(TokenTouch::Unknown);
        };
        let record = sessions.get_mut(session_id).ok_or_else(|| {
            StorageError::Backend(format!("token index points at missing session {session_id}"))
        })?;

        if !record.is_active || record.expires_at <= now {
            return Ok(TokenTouch::Rejected(record.clone()));
        }

        let event = AuditAppend::new(
            record.request_id.clone(),
            AuditAction::TokenValidated,
            actor,
            now,
        )
        .with_session(record.session_id.clone());

        let mut log = self
            .audit
            .write()
            .map_err(|_| StorageError::Backend("audit lock poisoned".to_string()))?;
        append_locked(&mut log, event)?;

        record.last_accessed_at = Some(now);
        Ok(TokenTouch::Validated(record.clone()))
    }

    async fn deactivate_session(
        &self,
        session_id: &SessionId,
        reason: Option<String>,
        actor: ActorContext,
        now: DateTime<Utc>,
    ) -> StorageResult<DeactivateOutcome> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|_| StorageError::Backend("sessions lock poisoned".to_string()))?;
        let record = sessions
            .get_mut(session_id)
            .ok_or_else(|| StorageError::NotFound(format!("session {session_id} not found")))?;

        if !record.is_active {
            return Ok(DeactivateOutcome::AlreadyInactive(record.clone()));
        }

        let event = AuditAppend::new(
            record.request_id.clone(),
            AuditAction::SessionDeactivated,
            actor,
            now,
        )
        .with_session(record.session_id.clone())
        .with_metadata(serde_json::json!({ "reason": reason }));

        let mut log = self
            .audit
            .write()
            .map_err(|_| StorageError::Backend("audit lock poisoned".to_string()))?;
        append_locked(&mut log, event)?;

        record.is_active = false;
        Ok(DeactivateOutcome::Deactivated(record.clone()))
    }

    async fn get_session(&self, session_id: &SessionId) -> StorageResult<Option<AccessSession>> {
        let sessions = self
            .sessions
            .read()
            .map_err(|_| StorageError::Backend("sessions lock poisoned".to_string()))?;
        Ok(sessions.get(session_id).cloned())
    }

    async fn find_sessions_for_request(
        &self,
        request_id: &RequestId,
    ) -> StorageResult<Vec<AccessSession>> {
        let sessions = self
            .sessions
            .read()
            .map_err(|_| StorageError::Backend("sessions lock poisoned".to_string()))?;
        let mut values = sessions
            .values()
            .filter(|session| session.request_id == *request_id)
            .cloned()
            .collect::<Vec<_>>();
        values.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(values)
    }
}

#[async_trait]
impl AuditStore for InMemoryAccessStore {
    async fn append_audit(&self, event: AuditAppend) -> StorageResult<AuditLogEntry> {
        let mut log = self
            .audit
            .write()
            .map_err(|_| StorageError::Backend("audit lock poisoned".to_string()))?;
        append_locked(&mut log, event)
    }

    async fn query_audit(
        &self,
        request_id: Option<&RequestId>,
        session_id: Option<&SessionId>,
        window: QueryWindow,
    ) -> StorageResult<Vec<AuditLogEntry>> {
        let log = self
            .audit
            .read()
            .map_err(|_| StorageError::Backend("audit lock poisoned".to_string()))?;

        let mut values = log
            .iter()
            .filter(|entry| request_id.map_or(true, |id| &entry.request_id == id))
            .filter(|entry| session_id.map_or(true, |id| entry.session_id.as_ref() == Some(id)))
            .cloned()
            .collect::<Vec<_>>();

        values.sort_by(|a, b| b.sequence.cmp(&a.sequence));
        Ok(apply_window(values, window))
    }

    async fn latest_audit_hash(&self) -> StorageResult<Option<String>> {
        let log = self
            .audit
            .read()
            .map_err(|_| StorageError::Backend("audit lock poisoned".to_string()))?;
        Ok(log.last().map(|entry| entry.hash.clone()))
    }
}

/// Append under an already-held audit lock, assigning sequence and chain hash.
fn append_locked(
    log: &mut Vec<AuditLogEntry>,
    event: AuditAppend,
) -> StorageResult<AuditLogEntry> {
    let previous_hash = log.last().map(|entry| entry.hash.clone());
    let sequence = log.len() as u64 + 1;

    let mut entry = AuditLogEntry {
        entry_id: AuditEntryId::generate(),
        sequence,
        request_id: event.request_id,
        session_id: event.session_id,
        action: event.action,
        performed_by: event.actor.performed_by,
        ip_address: event.actor.ip_address,
        user_agent: event.actor.user_agent,
        metadata: event.metadata,
        created_at: event.timestamp,
        previous_hash,
        hash: String::new(),
    };
    entry.hash = compute_entry_hash(&entry)?;

    log.push(entry.clone());
    Ok(entry)
}

/// Chain hash over an entry's recorded fields. Verifiers recompute this from
/// a stored entry and compare against `entry.hash`.
pub fn compute_entry_hash(entry: &AuditLogEntry) -> StorageResult<String> {
    let serializable = serde_json::json!({
        "previous_hash": entry.previous_hash,
        "sequence": entry.sequence,
        "request_id": entry.request_id.0,
        "session_id": entry.session_id.as_ref().map(|id| id.0.clone()),
        "action": entry.action.to_string(),
        "performed_by": entry.performed_by,
        "metadata": entry.metadata,
        "timestamp": entry.created_at,
    });
    let serialized = serde_json::to_vec(&serializable)
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    Ok(blake3::hash(&serialized).to_hex().to_string())
}

fn apply_window<T>(items: Vec<T>, window: QueryWindow) -> Vec<T> {
    let iter = items.into_iter().skip(window.offset);
    if window.limit == 0 {
        iter.collect()
    } else {
        iter.take(window.limit).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use ras_types::MemorialId;

    fn sample_request(id: &RequestId) -> AccessRequest {
        AccessRequest {
            request_id: id.clone(),
            memorial_id: MemorialId::new("memorial-1"),
            requested_by_email: "kin@example.org".to_string(),
            inmate_name: "J. Doe".to_string(),
            facility_id: ras_types::FacilityId::new("facility-1"),
            relationship: "sibling".to_string(),
            status: RequestStatus::Pending,
            admin_notes: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn event(request_id: &RequestId, action: AuditAction) -> AuditAppend {
        AuditAppend::new(
            request_id.clone(),
            action,
            ActorContext::system(),
            Utc::now(),
        )
    }

    fn sample_session(request_id: &RequestId, token_hash: &str, now: DateTime<Utc>) -> AccessSession {
        AccessSession {
            session_id: SessionId::generate(),
            request_id: request_id.clone(),
            memorial_id: MemorialId::new("memorial-1"),
            token_hash: token_hash.to_string(),
            expires_at: now + Duration::hours(24),
            is_active: true,
            last_accessed_at: None,
            created_at: now,
        }
    }

    #[tokio::test]
    async fn audit_chain_hashes_are_linked() {
        let store = InMemoryAccessStore::new();
        let request_id = RequestId::generate();
        let first = store
            .append_audit(event(&request_id, AuditAction::RequestCreated))
            .await
            .unwrap();
        let second = store
            .append_audit(event(&request_id, AuditAction::PaymentInitiated))
            .await
            .unwrap();

        assert_eq!(second.previous_hash, Some(first.hash));
        assert_eq!(second.sequence, first.sequence + 1);
    }

    #[tokio::test]
    async fn status_update_checks_expected_state() {
        let store = InMemoryAccessStore::new();
        let request_id = RequestId::generate();
        store
            .insert_request(
                sample_request(&request_id),
                event(&request_id, AuditAction::RequestCreated),
            )
            .await
            .unwrap();

        let result = store
            .update_request_status(
                &request_id,
                RequestStatus::UnderReview,
                RequestStatus::Verified,
                None,
                Utc::now(),
                event(
                    &request_id,
                    AuditAction::StatusChanged(RequestStatus::Verified),
                ),
            )
            .await;
        assert!(matches!(result, Err(StorageError::InvariantViolation(_))));
    }

    #[tokio::test]
    async fn confirm_payment_is_conditional_and_idempotent() {
        let store = InMemoryAccessStore::new();
        let request_id = RequestId::generate();
        let payment_id = PaymentId::generate();
        store
            .insert_payment(
                Payment {
                    payment_id: payment_id.clone(),
                    request_id: request_id.clone(),
                    amount_cents: 2500,
                    payer_email: "kin@example.org".to_string(),
                    payment_method: "card".to_string(),
                    status: PaymentStatus::Pending,
                    paid_at: None,
                    created_at: Utc::now(),
                },
                event(&request_id, AuditAction::PaymentInitiated),
            )
            .await
            .unwrap();

        let first = store
            .confirm_payment(
                &payment_id,
                Utc::now(),
                event(&request_id, AuditAction::PaymentConfirmed),
            )
            .await
            .unwrap();
        assert!(matches!(first, ConfirmOutcome::Confirmed(_)));

        let second = store
            .confirm_payment(
                &payment_id,
                Utc::now(),
                event(&request_id, AuditAction::PaymentConfirmed),
            )
            .await
            .unwrap();
        assert!(matches!(second, ConfirmOutcome::AlreadyConfirmed(_)));

        // Exactly one PAYMENT_CONFIRMED entry despite two calls.
        let entries = store
            .query_audit(Some(&request_id), None, QueryWindow::default())
            .await
            .unwrap();
        let confirmed = entries
            .iter()
            .filter(|entry| entry.action == AuditAction::PaymentConfirmed)
            .count();
        assert_eq!(confirmed, 1);
    }

    #[tokio::test]
    async fn second_active_session_conflicts() {
        let store = InMemoryAccessStore::new();
        let request_id = RequestId::generate();
        let now = Utc::now();

        store
            .insert_session(
                sample_session(&request_id, "hash-a", now),
                event(&request_id, AuditAction::SessionCreated),
            )
            .await
            .unwrap();

        let result = store
            .insert_session(
                sample_session(&request_id, "hash-b", now),
                event(&request_id, AuditAction::SessionCreated),
            )
            .await;
        assert!(matches!(result, Err(StorageError::Conflict(_))));
    }

    #[tokio::test]
    async fn expired_active_session_still_blocks_a_replacement() {
        let store = InMemoryAccessStore::new();
        let request_id = RequestId::generate();
        let now = Utc::now();
        let mut stale = sample_session(&request_id, "hash-a", now);
        stale.expires_at = now - Duration::hours(1);
        let stale_id = stale.session_id.clone();

        store
            .insert_session(stale, event(&request_id, AuditAction::SessionCreated))
            .await
            .unwrap();

        // Expiry does not clear the flag, so the slot is still taken.
        let result = store
            .insert_session(
                sample_session(&request_id, "hash-b", now),
                event(&request_id, AuditAction::SessionCreated),
            )
            .await;
        assert!(matches!(result, Err(StorageError::Conflict(_))));

        // Deactivating the stale session frees the slot.
        store
            .deactivate_session(&stale_id, None, ActorContext::system(), now)
            .await
            .unwrap();
        store
            .insert_session(
                sample_session(&request_id, "hash-b", now),
                event(&request_id, AuditAction::SessionCreated),
            )
            .await
            .unwrap();

        let sessions = store.find_sessions_for_request(&request_id).await.unwrap();
        let active = sessions.iter().filter(|session| session.is_active).count();
        assert_eq!(active, 1);
    }

    #[tokio::test]
    async fn token_hashes_are_never_reused() {
        let store = InMemoryAccessStore::new();
        let request_id = RequestId::generate();
        let now = Utc::now();
        let session = sample_session(&request_id, "hash-a", now);
        let session_id = session.session_id.clone();

        store
            .insert_session(session, event(&request_id, AuditAction::SessionCreated))
            .await
            .unwrap();
        store
            .deactivate_session(&session_id, None, ActorContext::system(), now)
            .await
            .unwrap();

        // The hash stays reserved even though its session is inactive.
        let other_request = RequestId::generate();
        let result = store
            .insert_session(
                sample_session(&other_request, "hash-a", now),
                event(&other_request, AuditAction::SessionCreated),
            )
            .await;
        assert!(matches!(result, Err(StorageError::Conflict(_))));
    }

    #[tokio::test]
    async fn touch_rejects_expired_without_mutation() {
        let store = InMemoryAccessStore::new();
        let request_id = RequestId::generate();
        let now = Utc::now();
        let mut session = sample_session(&request_id, "hash-a", now);
        session.expires_at = now - Duration::seconds(1);

        store
            .insert_session(session, event(&request_id, AuditAction::SessionCreated))
            .await
            .unwrap();

        let touch = store
            .touch_session("hash-a", now, ActorContext::system())
            .await
            .unwrap();
        match touch {
            TokenTouch::Rejected(session) => {
                assert!(session.last_accessed_at.is_none());
                assert!(session.is_active);
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn deactivate_is_idempotent_with_single_audit_entry() {
        let store = InMemoryAccessStore::new();
        let request_id = RequestId::generate();
        let now = Utc::now();
        let session = sample_session(&request_id, "hash-a", now);
        let session_id = session.session_id.clone();

        store
            .insert_session(session, event(&request_id, AuditAction::SessionCreated))
            .await
            .unwrap();

        let first = store
            .deactivate_session(
                &session_id,
                Some("revoked by admin".to_string()),
                ActorContext::system(),
                now,
            )
            .await
            .unwrap();
        assert!(matches!(first, DeactivateOutcome::Deactivated(_)));

        let second = store
            .deactivate_session(&session_id, None, ActorContext::system(), now)
            .await
            .unwrap();
        assert!(matches!(second, DeactivateOutcome::AlreadyInactive(_)));

        let entries = store
            .query_audit(Some(&request_id), None, QueryWindow::default())
            .await
            .unwrap();
        let deactivations = entries
            .iter()
            .filter(|entry| entry.action == AuditAction::SessionDeactivated)
            .count();
        assert_eq!(deactivations, 1);
    }
}
