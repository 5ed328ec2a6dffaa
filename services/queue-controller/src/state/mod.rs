//! Work item records and their persistence.
//!
//! This module provides:
//! - The `WorkItem` model and its lifecycle transitions
//! - The `RequestStore` interface the scheduler consumes
//! - A SQLite-backed `StateStore`, so the queue survives controller restarts

mod item;
mod store;

pub use item::{UnknownState, WorkItem, WorkItemState};
pub use store::{RequestStore, StateStore, StoreError};
