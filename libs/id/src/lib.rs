//! # slotq-id
//!
//! Identifier types for slotq work items.
//!
//! Work item IDs use the prefixed format `wi_{ulid}`, e.g.
//! `wi_01HV4Z2WQXKJNM8GPQY6VBKC3D`. The ULID part is time-ordered, so IDs
//! minted later sort after earlier ones (at millisecond granularity).

mod error;
mod types;

pub use error::IdError;
pub use types::WorkItemId;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
