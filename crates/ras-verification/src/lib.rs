//! RAS Verification - eligibility checks recorded against access requests.
//!
//! Readiness is computed from the latest row per required verification type,
//! never from "any passed row": a later failed re-check revokes readiness
//! without deleting history, which keeps the audit trail intact.

#![deny(unsafe_code)]

use ras_storage::{AccessStore, AuditAppend, RequestStore, StorageError, VerificationStore};
use ras_types::{
    ActorContext, AuditAction, Clock, Facility, FacilityId, RequestId, Verification,
    VerificationId, VerificationStatus, VerificationType,
};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// Facility reference data lookup. Read-only collaborator; this subsystem
/// never writes facility records.
pub trait FacilityDirectory: Send + Sync {
    fn get(&self, facility_id: &FacilityId) -> Option<Facility>;
}

/// Static in-memory directory, for tests and seeded deployments.
#[derive(Default)]
pub struct StaticFacilityDirectory {
    facilities: HashMap<FacilityId, Facility>,
}

impl StaticFacilityDirectory {
    pub fn new(facilities: impl IntoIterator<Item = Facility>) -> Self {
        Self {
            facilities: facilities
                .into_iter()
                .map(|facility| (facility.facility_id.clone(), facility))
                .collect(),
        }
    }
}

impl FacilityDirectory for StaticFacilityDirectory {
    fn get(&self, facility_id: &FacilityId) -> Option<Facility> {
        self.facilities.get(facility_id).cloned()
    }
}

/// Records eligibility checks and computes readiness.
pub struct VerificationEngine {
    store: Arc<dyn AccessStore>,
    facilities: Arc<dyn FacilityDirectory>,
    clock: Arc<dyn Clock>,
}

impl VerificationEngine {
    pub fn new(
        store: Arc<dyn AccessStore>,
        facilities: Arc<dyn FacilityDirectory>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            facilities,
            clock,
        }
    }

    /// Insert a new verification row. Rows are never overwritten; a re-check
    /// is a new row and readiness follows the latest one.
    pub async fn record_verification(
        &self,
        request_id: &RequestId,
        verification_type: VerificationType,
        status: VerificationStatus,
        verified_by: impl Into<String>,
        verification_data: serde_json::Value,
        actor: ActorContext,
    ) -> Result<Verification, VerificationError> {
        let request = self
            .store
            .get_request(request_id)
            .await?
            .ok_or_else(|| VerificationError::RequestNotFound(request_id.0.clone()))?;

        let verification = Verification {
            verification_id: VerificationId::generate(),
            request_id: request.request_id.clone(),
            verification_type,
            status,
            verified_by: verified_by.into(),
            verification_data,
            created_at: self.clock.now(),
        };

        let audit = AuditAppend::new(
            request.request_id.clone(),
            AuditAction::VerificationRecorded(verification_type, status),
            actor,
            verification.created_at,
        );

        self.store
            .insert_verification(verification.clone(), audit)
            .await?;

        info!(
            request_id = %request.request_id,
            verification_type = verification_type.as_str(),
            status = status.as_str(),
            "verification recorded"
        );
        Ok(verification)
    }

    /// The verification types this request must pass. Identity and
    /// relationship always; facility authorization only when the facility
    /// named by the request requires it.
    pub async fn required_types(
        &self,
        request_id: &RequestId,
    ) -> Result<Vec<VerificationType>, VerificationError> {
        let request = self
            .store
            .get_request(request_id)
            .await?
            .ok_or_else(|| VerificationError::RequestNotFound(request_id.0.clone()))?;

        let mut required = vec![VerificationType::Identity, VerificationType::Relationship];
        if self
            .facilities
            .get(&request.facility_id)
            .is_some_and(|facility| facility.requires_authorization)
        {
            required.push(VerificationType::FacilityAuthorization);
        }
        Ok(required)
    }

    /// True only when the latest row per required type has status `passed`.
    pub async fn is_ready(&self, request_id: &RequestId) -> Result<bool, VerificationError> {
        let required = self.required_types(request_id).await?;
        let rows = self.store.list_verifications(request_id).await?;

        // Rows are insertion-ordered, so the last row per type wins.
        let mut latest: HashMap<VerificationType, VerificationStatus> = HashMap::new();
        for row in &rows {
            latest.insert(row.verification_type, row.status);
        }

        Ok(required
            .iter()
            .all(|vtype| latest.get(vtype) == Some(&VerificationStatus::Passed)))
    }

    /// All verification rows for a request, oldest-first.
    pub async fn list_verifications(
        &self,
        request_id: &RequestId,
    ) -> Result<Vec<Verification>, VerificationError> {
        self.store
            .list_verifications(request_id)
            .await
            .map_err(VerificationError::from)
    }
}

/// Verification-related errors.
#[derive(Debug, Error)]
pub enum VerificationError {
    #[error("request not found: {0}")]
    RequestNotFound(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl From<StorageError> for VerificationError {
    fn from(value: StorageError) -> Self {
        match value {
            StorageError::NotFound(msg) => Self::RequestNotFound(msg),
            StorageError::Conflict(msg)
            | StorageError::InvariantViolation(msg)
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
    use ras_storage::{AuditStore, QueryWindow};
    use ras_types::{AccessRequest, MemorialId, RequestStatus, SystemClock};

    fn facility(id: &str, requires_authorization: bool) -> Facility {
        Facility {
            facility_id: FacilityId::new(id),
            name: format!("Facility {id}"),
            is_active: true,
            requires_authorization,
        }
    }

    async fn engine_with_request(
        facility_id: &str,
        requires_authorization: bool,
    ) -> (VerificationEngine, RequestId) {
        let store = Arc::new(InMemoryAccessStore::new());
        let directory = Arc::new(StaticFacilityDirectory::new([facility(
            facility_id,
            requires_authorization,
        )]));
        let engine = VerificationEngine::new(
            store.clone(),
            directory,
            Arc::new(SystemClock),
        );

        let request_id = RequestId::generate();
        let request = AccessRequest {
            request_id: request_id.clone(),
            memorial_id: MemorialId::new("memorial-1"),
            requested_by_email: "kin@example.org".to_string(),
            inmate_name: "J. Doe".to_string(),
            facility_id: FacilityId::new(facility_id),
            relationship: "sibling".to_string(),
            status: RequestStatus::Pending,
            admin_notes: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        store
            .insert_request(
                request,
                AuditAppend::new(
                    request_id.clone(),
                    AuditAction::RequestCreated,
                    ActorContext::system(),
                    Utc::now(),
                ),
            )
            .await
            .unwrap();
        (engine, request_id)
    }

    #[tokio::test]
    async fn readiness_requires_all_required_types() {
        let (engine, request_id) = engine_with_request("facility-1", false).await;

        assert!(!engine.is_ready(&request_id).await.unwrap());

        engine
            .record_verification(
                &request_id,
                VerificationType::Identity,
                VerificationStatus::Passed,
                "reviewer-1",
                serde_json::Value::Null,
                ActorContext::new("reviewer-1"),
            )
            .await
            .unwrap();
        assert!(!engine.is_ready(&request_id).await.unwrap());

        engine
            .record_verification(
                &request_id,
                VerificationType::Relationship,
                VerificationStatus::Passed,
                "reviewer-1",
                serde_json::Value::Null,
                ActorContext::new("reviewer-1"),
            )
            .await
            .unwrap();
        assert!(engine.is_ready(&request_id).await.unwrap());
    }

    #[tokio::test]
    async fn later_failed_recheck_revokes_readiness_without_deleting_history() {
        let (engine, request_id) = engine_with_request("facility-1", false).await;

        for vtype in [VerificationType::Identity, VerificationType::Relationship] {
            engine
                .record_verification(
                    &request_id,
                    vtype,
                    VerificationStatus::Passed,
                    "reviewer-1",
                    serde_json::Value::Null,
                    ActorContext::new("reviewer-1"),
                )
                .await
                .unwrap();
        }
        assert!(engine.is_ready(&request_id).await.unwrap());

        engine
            .record_verification(
                &request_id,
                VerificationType::Identity,
                VerificationStatus::Failed,
                "reviewer-2",
                serde_json::json!({"note": "document mismatch"}),
                ActorContext::new("reviewer-2"),
            )
            .await
            .unwrap();

        assert!(!engine.is_ready(&request_id).await.unwrap());
        // History survives the re-check.
        let rows = engine.list_verifications(&request_id).await.unwrap();
        assert_eq!(rows.len(), 3);
    }

    #[tokio::test]
    async fn facility_authorization_required_only_when_facility_demands_it() {
        let (engine, request_id) = engine_with_request("strict-facility", true).await;

        let required = engine.required_types(&request_id).await.unwrap();
        assert!(required.contains(&VerificationType::FacilityAuthorization));

        for vtype in [VerificationType::Identity, VerificationType::Relationship] {
            engine
                .record_verification(
                    &request_id,
                    vtype,
                    VerificationStatus::Passed,
                    "reviewer-1",
                    serde_json::Value::Null,
                    ActorContext::new("reviewer-1"),
                )
                .await
                .unwrap();
        }
        // Identity and relationship alone are not enough here.
        assert!(!engine.is_ready(&request_id).await.unwrap());

        engine
            .record_verification(
                &request_id,
                VerificationType::FacilityAuthorization,
                VerificationStatus::Passed,
                "facility-liaison",
                serde_json::Value::Null,
                ActorContext::new("facility-liaison"),
            )
            .await
            .unwrap();
        assert!(engine.is_ready(&request_id).await.unwrap());
    }

    #[tokio::test]
    async fn recording_against_missing_request_fails() {
        let (engine, _) = engine_with_request("facility-1", false).await;
        let missing = RequestId::generate();

        let result = engine
            .record_verification(
                &missing,
                VerificationType::Identity,
                VerificationStatus::Passed,
                "reviewer-1",
                serde_json::Value::Null,
                ActorContext::new("reviewer-1"),
            )
            .await;
        assert!(matches!(result, Err(VerificationError::RequestNotFound(_))));
    }

    #[tokio::test]
    async fn each_recorded_verification_writes_one_audit_entry() {
        let (engine, request_id) = engine_with_request("facility-1", false).await;
        let store = engine.store.clone();

        let before = store
            .query_audit(Some(&request_id), None, QueryWindow::default())
            .await
            .unwrap()
            .len();
        engine
            .record_verification(
                &request_id,
                VerificationType::Identity,
                VerificationStatus::Passed,
                "reviewer-1",
                serde_json::Value::Null,
                ActorContext::new("reviewer-1"),
            )
            .await
            .unwrap();
        let after = store
            .query_audit(Some(&request_id), None, QueryWindow::default())
            .await
            .unwrap();

        assert_eq!(after.len(), before + 1);
        assert_eq!(
            after[0].action,
            AuditAction::VerificationRecorded(
                VerificationType::Identity,
                VerificationStatus::Passed
            )
        );
    }
}
