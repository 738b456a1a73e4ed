//! RAS Session - issuance, validation, and revocation of time-bound access
//! sessions.
//!
//! A session is minted only after both gates hold: verification readiness and
//! a confirmed payment. The opaque token is generated from OS randomness,
//! handed back exactly once, and persisted only as its blake3 hash, so a
//! storage dump never yields a usable credential. Validation failures are
//! uniformly `TokenInvalid` - expired, revoked, and unknown tokens are
//! indistinguishable to the caller.

#![deny(unsafe_code)]

use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use ras_payment::{PaymentError, PaymentGate};
use ras_storage::{
    AccessStore, AuditAppend, AuditStore, DeactivateOutcome, RequestStore, SessionStore,
    StorageError, TokenTouch,
};
use ras_types::{
    AccessSession, ActorContext, AuditAction, Clock, MemorialId, RequestId, SessionId,
};
use ras_verification::{VerificationEngine, VerificationError};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

const TOKEN_BYTES: usize = 32;

/// A freshly minted session together with its plaintext token. The token is
/// not recoverable after this value is dropped.
#[derive(Debug, Clone)]
pub struct IssuedSession {
    pub session: AccessSession,
    pub token: String,
}

/// Mints, validates, and revokes access sessions.
pub struct SessionIssuer {
    store: Arc<dyn AccessStore>,
    verification: Arc<VerificationEngine>,
    payments: Arc<PaymentGate>,
    clock: Arc<dyn Clock>,
}

impl SessionIssuer {
    pub fn new(
        store: Arc<dyn AccessStore>,
        verification: Arc<VerificationEngine>,
        payments: Arc<PaymentGate>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            verification,
            payments,
            clock,
        }
    }

    /// Mint a session for a request whose gates all hold.
    ///
    /// The conditional insert in the store closes the race between two
    /// concurrent issuance attempts: at most one active session exists per
    /// request at any time.
    pub async fn create_session(
        &self,
        request_id: &RequestId,
        memorial_id: &MemorialId,
        expires_at: DateTime<Utc>,
        actor: ActorContext,
    ) -> Result<IssuedSession, SessionError> {
        let request = self
            .store
            .get_request(request_id)
            .await?
            .ok_or_else(|| SessionError::RequestNotFound(request_id.0.clone()))?;

        if request.memorial_id != *memorial_id {
            return Err(SessionError::MemorialMismatch);
        }

        let now = self.clock.now();
        if expires_at <= now {
            return Err(SessionError::ExpiryNotInFuture);
        }

        let ready = self.verification.is_ready(request_id).await?;
        let paid = self.payments.has_confirmed_payment(request_id).await?;
        if !ready || !paid {
            let reason = if !ready && !paid {
                "verification and payment gates not satisfied"
            } else if !ready {
                "verification gate not satisfied"
            } else {
                "payment gate not satisfied"
            };
            self.store
                .append_audit(
                    AuditAppend::new(
                        request.request_id.clone(),
                        AuditAction::SessionDenied,
                        actor,
                        now,
                    )
                    .with_metadata(serde_json::json!({ "reason": reason })),
                )
                .await?;
            warn!(request_id = %request.request_id, reason, "session issuance denied");
            return Err(SessionError::PreconditionFailed(reason.to_string()));
        }

        let token = generate_token();
        let session = AccessSession {
            session_id: SessionId::generate(),
            request_id: request.request_id.clone(),
            memorial_id: memorial_id.clone(),
            token_hash: hash_token(&token),
            expires_at,
            is_active: true,
            last_accessed_at: None,
            created_at: now,
        };

        let audit = AuditAppend::new(
            request.request_id.clone(),
            AuditAction::SessionCreated,
            actor,
            now,
        )
        .with_session(session.session_id.clone())
        .with_metadata(serde_json::json!({ "expires_at": expires_at }));

        self.store.insert_session(session.clone(), audit).await?;

        info!(
            request_id = %request.request_id,
            session_id = %session.session_id,
            %expires_at,
            "access session created"
        );
        Ok(IssuedSession { session, token })
    }

    /// Validate a presented token and touch `last_accessed_at`.
    ///
    /// Lookup-and-touch is a single atomic store operation, so a validation
    /// cannot succeed against a session a concurrent deactivation has just
    /// invalidated. Every failure path returns the same `TokenInvalid`.
    pub async fn validate_token(
        &self,
        token: &str,
        actor: ActorContext,
    ) -> Result<AccessSession, SessionError> {
        let now = self.clock.now();
        let touch = self
            .store
            .touch_session(&hash_token(token), now, actor.clone())
            .await?;

        match touch {
            TokenTouch::Validated(session) => Ok(session),
            TokenTouch::Rejected(session) => {
                // The row stays in place as a historical record; only the
                // denial is written.
                self.store
                    .append_audit(
                        AuditAppend::new(
                            session.request_id.clone(),
                            AuditAction::TokenDenied,
                            actor,
                            now,
                        )
                        .with_session(session.session_id.clone()),
                    )
                    .await?;
                warn!(session_id = %session.session_id, "token rejected");
                Err(SessionError::TokenInvalid)
            }
            TokenTouch::Unknown => Err(SessionError::TokenInvalid),
        }
    }

    /// Revoke a session. Idempotent: an already-inactive session succeeds
    /// without a second audit entry.
    pub async fn deactivate_session(
        &self,
        session_id: &SessionId,
        reason: Option<String>,
        actor: ActorContext,
    ) -> Result<AccessSession, SessionError> {
        let outcome = self
            .store
            .deactivate_session(session_id, reason, actor, self.clock.now())
            .await?;

        if let DeactivateOutcome::Deactivated(session) = &outcome {
            info!(session_id = %session.session_id, "access session deactivated");
        }
        Ok(outcome.session().clone())
    }

    pub async fn get_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<AccessSession>, SessionError> {
        self.store
            .get_session(session_id)
            .await
            .map_err(SessionError::from)
    }

    /// All sessions ever issued for a request, oldest-first. Inactive and
    /// expired rows are included; they are historical records.
    pub async fn list_sessions(
        &self,
        request_id: &RequestId,
    ) -> Result<Vec<AccessSession>, SessionError> {
        self.store
            .find_sessions_for_request(request_id)
            .await
            .map_err(SessionError::from)
    }
}

fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    encode_hex(&bytes)
}

fn encode_hex(bytes: &[u8]) -> String {
    const TABLE: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for &byte in bytes {
        out.push(TABLE[usize::from(byte >> 4)] as char);
        out.push(TABLE[usize::from(byte & 0x0f)] as char);
    }
    out
}

fn hash_token(token: &str) -> String {
    blake3::hash(token.as_bytes()).to_hex().to_string()
}

/// Session-related errors.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("request not found: {0}")]
    RequestNotFound(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session preconditions not met: {0}")]
    PreconditionFailed(String),

    #[error("an active session already exists for this request")]
    ActiveSessionExists,

    #[error("session expiry must be in the future")]
    ExpiryNotInFuture,

    #[error("session memorial does not match the request")]
    MemorialMismatch,

    /// Deliberately generic: expired, revoked, and unknown tokens are not
    /// distinguished to the caller.
    #[error("access token invalid")]
    TokenInvalid,

    #[error(transparent)]
    Verification(#[from] VerificationError),

    #[error(transparent)]
    Payment(#[from] PaymentError),

    #[error("backend error: {0}")]
    Backend(String),
}

impl From<StorageError> for SessionError {
    fn from(value: StorageError) -> Self {
        match value {
            StorageError::NotFound(msg) => Self::SessionNotFound(msg),
            StorageError::Conflict(_) => Self::ActiveSessionExists,
            StorageError::InvariantViolation(msg)
            | StorageError::Serialization(msg)
            | StorageError::Backend(msg) => Self::Backend(msg),
        }
    }
}
