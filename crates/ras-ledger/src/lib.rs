//! RAS Ledger - the append-only audit history of the restricted access
//! workflow.
//!
//! This crate provides the operator-facing ledger API while delegating
//! persistence to `ras-storage`. No update or delete path exists anywhere:
//! entries are written once, hash-linked to their predecessor, and read back
//! newest-first for review.

#![deny(unsafe_code)]

use ras_storage::{AccessStore, AuditAppend, AuditStore, QueryWindow, StorageError};
use ras_types::{AuditLogEntry, RequestId, SessionId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// The audit ledger facade.
pub struct AuditLedger {
    store: Arc<dyn AccessStore>,
}

impl AuditLedger {
    pub fn new(store: Arc<dyn AccessStore>) -> Self {
        Self { store }
    }

    /// Append an event. Components normally audit through their own store
    /// operations; this direct path exists for denial entries that accompany
    /// no mutation.
    pub async fn append(&self, event: AuditAppend) -> Result<AuditLogEntry, LedgerError> {
        self.store.append_audit(event).await.map_err(LedgerError::from)
    }

    /// Read entries newest-first, optionally scoped to a request or session.
    pub async fn query(
        &self,
        request_id: Option<&RequestId>,
        session_id: Option<&SessionId>,
        window: QueryWindow,
    ) -> Result<Vec<AuditLogEntry>, LedgerError> {
        self.store
            .query_audit(request_id, session_id, window)
            .await
            .map_err(LedgerError::from)
    }

    /// Latest hash anchor of the chain.
    pub async fn latest_hash(&self) -> Result<Option<String>, LedgerError> {
        self.store.latest_audit_hash().await.map_err(LedgerError::from)
    }

    /// Recompute the hash chain over the full ledger and report the first
    /// broken link, if any.
    pub async fn verify_chain(&self) -> Result<ChainVerification, LedgerError> {
        let mut entries = self
            .store
            .query_audit(None, None, QueryWindow::default())
            .await
            .map_err(LedgerError::from)?;
        entries.sort_by(|a, b| a.sequence.cmp(&b.sequence));

        let mut previous: Option<&str> = None;
        for entry in &entries {
            if entry.previous_hash.as_deref() != previous {
                return Ok(ChainVerification::Broken {
                    sequence: entry.sequence,
                    reason: "previous_hash does not match predecessor".to_string(),
                });
            }
            let recomputed = ras_storage::compute_entry_hash(entry)
                .map_err(LedgerError::from)?;
            if recomputed != entry.hash {
                return Ok(ChainVerification::Broken {
                    sequence: entry.sequence,
                    reason: "entry hash does not match recorded fields".to_string(),
                });
            }
            previous = Some(entry.hash.as_str());
        }

        Ok(ChainVerification::Intact {
            entries: entries.len(),
        })
    }

    /// Entry counts by action, for operator review.
    pub async fn statistics(&self) -> Result<LedgerStatistics, LedgerError> {
        let entries = self
            .store
            .query_audit(None, None, QueryWindow::default())
            .await
            .map_err(LedgerError::from)?;

        let total_entries = entries.len();
        let mut by_action: HashMap<String, usize> = HashMap::new();
        for entry in entries {
            *by_action.entry(entry.action.to_string()).or_insert(0) += 1;
        }

        Ok(LedgerStatistics {
            total_entries,
            by_action,
        })
    }
}

/// Result of a full-chain verification pass.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChainVerification {
    Intact { entries: usize },
    Broken { sequence: u64, reason: String },
}

impl ChainVerification {
    pub fn is_intact(&self) -> bool {
        matches!(self, Self::Intact { .. })
    }
}

/// Statistics about the ledger.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LedgerStatistics {
    pub total_entries: usize,
    pub by_action: HashMap<String, usize>,
}

/// Ledger-related errors.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("entry not found: {0}")]
    NotFound(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl From<StorageError> for LedgerError {
    fn from(value: StorageError) -> Self {
        match value {
            StorageError::NotFound(msg) => Self::NotFound(msg),
            StorageError::Conflict(msg)
            | StorageError::InvariantViolation(msg)
            | StorageError::Serialization(msg)
            | StorageError::Backend(msg) => Self::Backend(msg),
        }
    }
}
