//! Typed access to per-reconciler state.
//!
//! Each reconciler owns one state type. The store persists it as a JSON
//! payload next to the type's schema version. Decoding ignores unknown
//! fields so that older binaries can read state written by newer ones.

use serde::Serialize;
use serde::de::DeserializeOwned;
use teamsync_core::{ReconcilerName, Slug};

use crate::error::StorageError;
use crate::traits::StoreTransaction;

/// State a reconciler persists per team between runs.
pub trait ReconcilerState: Serialize + DeserializeOwned + Default + Send + Sync {
    /// Version of the payload layout, stored alongside the payload.
    const SCHEMA_VERSION: u32;
}

/// Loads the state of `reconciler` for `slug`.
///
/// Returns `None` if the pair has never been observed.
pub async fn load_state<S: ReconcilerState>(
    tx: &mut dyn StoreTransaction,
    reconciler: &ReconcilerName,
    slug: &Slug,
) -> Result<Option<S>, StorageError> {
    let Some(record) = tx.get_reconciler_state(reconciler, slug).await? else {
        return Ok(None);
    };

    if record.schema_version > S::SCHEMA_VERSION {
        tracing::debug!(
            reconciler = %reconciler,
            team = %slug,
            stored = record.schema_version,
            known = S::SCHEMA_VERSION,
            "Reading reconciler state written by a newer schema"
        );
    }

    serde_json::from_value(record.payload).map(Some).map_err(|e| {
        StorageError::internal(format!(
            "Failed to decode state of {reconciler} for team {slug}: {e}"
        ))
    })
}

/// Persists the state of `reconciler` for `slug`.
pub async fn save_state<S: ReconcilerState>(
    tx: &mut dyn StoreTransaction,
    reconciler: &ReconcilerName,
    slug: &Slug,
    state: &S,
) -> Result<(), StorageError> {
    let payload = serde_json::to_value(state).map_err(|e| {
        StorageError::internal(format!(
            "Failed to encode state of {reconciler} for team {slug}: {e}"
        ))
    })?;
    tx.set_reconciler_state(reconciler, slug, S::SCHEMA_VERSION, &payload)
        .await
}
