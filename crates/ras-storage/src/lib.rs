//! Storage abstractions for the restricted access workflow.
//!
//! This crate defines the storage contract the access components share:
//! - request/verification/payment/session records (system of record)
//! - the append-only, hash-linked audit ledger
//!
//! Design stance:
//! - Conditional updates, not read-then-write: status moves, payment
//!   confirmation, and session issuance all carry their precondition into
//!   the store so concurrent callers cannot both win.
//! - The audit append travels with its mutation as one unit of work. A state
//!   change that cannot be audited does not happen.

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

mod error;
pub mod memory;
mod model;
mod traits;

pub use error::{StorageError, StorageResult};
pub use memory::compute_entry_hash;
pub use model::{
    AuditAppend, ConfirmOutcome, DeactivateOutcome, QueryWindow, RequestFilter, TokenTouch,
};
pub use traits::{
    AccessStore, AuditStore, PaymentStore, RequestStore, SessionStore, VerificationStore,
};
