//! In-memory authoritative store backend for teamsync.
//!
//! This crate provides an in-memory implementation of the `Store` trait from
//! `teamsync-storage`. It backs `DATABASE_URL=memory://` and the test suites
//! of the scheduler and the user synchronizer.
//!
//! # Example
//!
//! ```ignore
//! use teamsync_db_memory::MemoryStore;
//! use teamsync_storage::Store;
//!
//! let store = MemoryStore::new();
//! let mut tx = store.begin().await?;
//! tx.create_team(&new_team).await?;
//! tx.commit().await?;
//! ```

mod storage;

pub use storage::{MemoryStore, MemoryTransaction};

/// Type alias for a shareable store instance.
pub type DynStore = teamsync_storage::DynStore;

/// Creates a new in-memory store behind the shared trait object.
pub fn create_memory_store() -> DynStore {
    std::sync::Arc::new(MemoryStore::new())
}
