//! # teamsync-storage
//!
//! Storage abstraction layer for teamsync.
//!
//! This crate defines the traits and types that every authoritative store
//! backend implements. It does not contain any implementations; those live
//! in `teamsync-db-memory` and `teamsync-db-postgres`.
//!
//! ## Overview
//!
//! [`Store`] begins transactions. [`StoreTransaction`] carries every read and
//! write: teams, members, users, roles, service accounts, reconciler
//! descriptors, per-reconciler state, reconciler errors, audit records and the
//! first-run flag.
//!
//! ## Example
//!
//! ```ignore
//! use teamsync_storage::{DynStore, StorageError};
//!
//! async fn member_count(store: &DynStore, slug: Slug) -> Result<usize, StorageError> {
//!     store
//!         .transaction(move |tx| {
//!             Box::pin(async move { Ok(tx.list_team_members(&slug).await?.len()) })
//!         })
//!         .await
//! }
//! ```

mod error;
mod state;
mod traits;
mod types;

pub use error::{ErrorCategory, StorageError};
pub use state::{ReconcilerState, load_state, save_state};
pub use traits::{Store, StoreTransaction};
pub use types::{Page, ReconcilerStateRecord};

/// Type alias for a storage result.
pub type StorageResult<T> = Result<T, StorageError>;

/// Type alias for a shared store trait object.
pub type DynStore = std::sync::Arc<dyn Store>;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::error::{ErrorCategory, StorageError};
    pub use crate::state::{ReconcilerState, load_state, save_state};
    pub use crate::traits::{Store, StoreTransaction};
    pub use crate::types::{Page, ReconcilerStateRecord};
    pub use crate::{DynStore, StorageResult};
}
