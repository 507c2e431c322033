//! Verification / sync coordination.
//!
//! Human corrections are the only writes that touch all three views of a
//! fact: the authoritative store, the search projection, and the answer
//! cache. The coordinator applies them in that order; the reconciliation
//! job heals any drift the online path lost.

pub mod background;
pub mod coordinator;
pub mod reconcile;

pub use background::{start_reconciler, ReconcilerConfig, ReconcilerHandle};
pub use coordinator::{FieldCorrection, SyncCoordinator, VerifyOutcome};
pub use reconcile::{reconcile, ReconcileReport};

use thiserror::Error;
use uuid::Uuid;

use crate::backend::BackendError;
use crate::cache::CacheError;
use crate::db::DatabaseError;
use crate::projection::ProjectionError;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Projection error: {0}")]
    Projection(#[from] ProjectionError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Field not found: {0}")]
    FieldNotFound(Uuid),
}
