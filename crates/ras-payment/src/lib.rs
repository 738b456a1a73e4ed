//! RAS Payment - the payment gate in front of session issuance.
//!
//! The payment-capture provider is an external collaborator; this crate only
//! records the attempt and its confirmed/failed outcome. Confirmation is a
//! conditional pending-to-confirmed update so retried provider callbacks
//! cannot double-confirm, and a repeat confirmation is a deliberate no-op.

#![deny(unsafe_code)]

use ras_storage::{
    AccessStore, AuditAppend, ConfirmOutcome, PaymentStore, RequestStore, StorageError,
};
use ras_types::{
    ActorContext, AuditAction, Clock, Payment, PaymentId, PaymentStatus, RequestId,
};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// Records payment attempts and confirmation outcomes against requests.
pub struct PaymentGate {
    store: Arc<dyn AccessStore>,
    clock: Arc<dyn Clock>,
}

impl PaymentGate {
    pub fn new(store: Arc<dyn AccessStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Record a new payment attempt in `pending`.
    pub async fn create_payment(
        &self,
        request_id: &RequestId,
        amount_cents: i64,
        payer_email: impl Into<String>,
        payment_method: impl Into<String>,
        actor: ActorContext,
    ) -> Result<Payment, PaymentError> {
        if amount_cents <= 0 {
            return Err(PaymentError::InvalidAmount(amount_cents));
        }

        let request = self
            .store
            .get_request(request_id)
            .await?
            .ok_or_else(|| PaymentError::RequestNotFound(request_id.0.clone()))?;

        let payment = Payment {
            payment_id: PaymentId::generate(),
            request_id: request.request_id.clone(),
            amount_cents,
            payer_email: payer_email.into(),
            payment_method: payment_method.into(),
            status: PaymentStatus::Pending,
            paid_at: None,
            created_at: self.clock.now(),
        };

        let audit = AuditAppend::new(
            request.request_id.clone(),
            AuditAction::PaymentInitiated,
            actor,
            payment.created_at,
        )
        .with_metadata(serde_json::json!({
            "payment_id": payment.payment_id.0,
            "amount_cents": amount_cents,
        }));

        self.store.insert_payment(payment.clone(), audit).await?;

        info!(
            request_id = %request.request_id,
            payment_id = %payment.payment_id.0,
            amount_cents,
            "payment initiated"
        );
        Ok(payment)
    }

    /// Confirm a pending payment. Confirming an already-confirmed payment is
    /// a no-op success so provider retries cannot corrupt state; a failed
    /// payment is not confirmable.
    pub async fn confirm_payment(
        &self,
        payment_id: &PaymentId,
        actor: ActorContext,
    ) -> Result<Payment, PaymentError> {
        let payment = self
            .store
            .get_payment(payment_id)
            .await?
            .ok_or_else(|| PaymentError::PaymentNotFound(payment_id.0.clone()))?;

        let paid_at = self.clock.now();
        let audit = AuditAppend::new(
            payment.request_id.clone(),
            AuditAction::PaymentConfirmed,
            actor,
            paid_at,
        )
        .with_metadata(serde_json::json!({ "payment_id": payment_id.0 }));

        let outcome = self.store.confirm_payment(payment_id, paid_at, audit).await?;
        if let ConfirmOutcome::Confirmed(payment) = &outcome {
            info!(
                request_id = %payment.request_id,
                payment_id = %payment_id.0,
                "payment confirmed"
            );
        }
        Ok(outcome.payment().clone())
    }

    /// True when the request has a confirmed payment on record.
    pub async fn has_confirmed_payment(
        &self,
        request_id: &RequestId,
    ) -> Result<bool, PaymentError> {
        Ok(self
            .store
            .find_confirmed_payment(request_id)
            .await?
            .is_some())
    }

    pub async fn get_payment(
        &self,
        payment_id: &PaymentId,
    ) -> Result<Option<Payment>, PaymentError> {
        self.store
            .get_payment(payment_id)
            .await
            .map_err(PaymentError::from)
    }

    pub async fn list_payments(
        &self,
        request_id: &RequestId,
    ) -> Result<Vec<Payment>, PaymentError> {
        self.store
            .list_payments(request_id)
            .await
            .map_err(PaymentError::from)
    }
}

/// Payment-related errors.
#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("request not found: {0}")]
    RequestNotFound(String),

    #[error("payment not found: {0}")]
    PaymentNotFound(String),

    #[error("payment amount must be positive, got {0} cents")]
    InvalidAmount(i64),

    #[error("payment is not confirmable: {0}")]
    NotConfirmable(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl From<StorageError> for PaymentError {
    fn from(value: StorageError) -> Self {
        match value {
            StorageError::NotFound(msg) => Self::PaymentNotFound(msg),
            StorageError::InvariantViolation(msg) => Self::NotConfirmable(msg),
            StorageError::Conflict(msg)
            | StorageError::Serialization(msg)
            | StorageError::Backend(msg) => Self::Backend(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ras_storage::memory::InMemoryAccessStore;
    use ras_storage::{AuditStore, QueryWindow, RequestStore};
    use ras_types::{AccessRequest, FacilityId, MemorialId, RequestStatus, SystemClock};

    async fn gate_with_request() -> (PaymentGate, RequestId) {
        let store = Arc::new(InMemoryAccessStore::new());
        let gate = PaymentGate::new(store.clone(), Arc::new(SystemClock));

        let request_id = RequestId::generate();
        store
            .insert_request(
                AccessRequest {
                    request_id: request_id.clone(),
                    memorial_id: MemorialId::new("memorial-1"),
                    requested_by_email: "kin@example.org".to_string(),
                    inmate_name: "J. Doe".to_string(),
                    facility_id: FacilityId::new("facility-1"),
                    relationship: "sibling".to_string(),
                    status: RequestStatus::PaymentPending,
                    admin_notes: None,
                    created_at: Utc::now(),
                    updated_at: Utc::now(),
                },
                AuditAppend::new(
                    request_id.clone(),
                    AuditAction::RequestCreated,
                    ActorContext::system(),
                    Utc::now(),
                ),
            )
            .await
            .unwrap();
        (gate, request_id)
    }

    #[tokio::test]
    async fn non_positive_amounts_are_rejected() {
        let (gate, request_id) = gate_with_request().await;

        for amount in [0, -1, -2500] {
            let result = gate
                .create_payment(
                    &request_id,
                    amount,
                    "kin@example.org",
                    "card",
                    ActorContext::system(),
                )
                .await;
            assert!(matches!(result, Err(PaymentError::InvalidAmount(_))));
        }
    }

    #[tokio::test]
    async fn confirm_twice_yields_one_confirmed_state_and_one_audit_entry() {
        let (gate, request_id) = gate_with_request().await;
        let payment = gate
            .create_payment(
                &request_id,
                2500,
                "kin@example.org",
                "card",
                ActorContext::system(),
            )
            .await
            .unwrap();

        let first = gate
            .confirm_payment(&payment.payment_id, ActorContext::system())
            .await
            .unwrap();
        assert_eq!(first.status, PaymentStatus::Confirmed);
        assert!(first.paid_at.is_some());

        let second = gate
            .confirm_payment(&payment.payment_id, ActorContext::system())
            .await
            .unwrap();
        assert_eq!(second.status, PaymentStatus::Confirmed);
        // paid_at does not move on the retried confirmation.
        assert_eq!(second.paid_at, first.paid_at);

        let entries = gate
            .store
            .query_audit(Some(&request_id), None, QueryWindow::default())
            .await
            .unwrap();
        let confirmations = entries
            .iter()
            .filter(|entry| entry.action == AuditAction::PaymentConfirmed)
            .count();
        assert_eq!(confirmations, 1);
    }

    #[tokio::test]
    async fn confirmed_payment_satisfies_the_gate_predicate() {
        let (gate, request_id) = gate_with_request().await;
        assert!(!gate.has_confirmed_payment(&request_id).await.unwrap());

        let payment = gate
            .create_payment(
                &request_id,
                2500,
                "kin@example.org",
                "card",
                ActorContext::system(),
            )
            .await
            .unwrap();
        assert!(!gate.has_confirmed_payment(&request_id).await.unwrap());

        gate.confirm_payment(&payment.payment_id, ActorContext::system())
            .await
            .unwrap();
        assert!(gate.has_confirmed_payment(&request_id).await.unwrap());
    }

    #[tokio::test]
    async fn confirming_missing_payment_fails() {
        let (gate, _) = gate_with_request().await;
        let result = gate
            .confirm_payment(&PaymentId::generate(), ActorContext::system())
            .await;
        assert!(matches!(result, Err(PaymentError::PaymentNotFound(_))));
    }

    #[tokio::test]
    async fn payment_against_missing_request_fails() {
        let (gate, _) = gate_with_request().await;
        let result = gate
            .create_payment(
                &RequestId::generate(),
                2500,
                "kin@example.org",
                "card",
                ActorContext::system(),
            )
            .await;
        assert!(matches!(result, Err(PaymentError::RequestNotFound(_))));
    }
}
