//! # proactive-id
//!
//! Identity and location types shared by every active-object component.
//!
//! ## Design Principles
//!
//! - A body identity is assigned once at creation and never changes, even
//!   when the body migrates between nodes
//! - Locations are separate values that change on migration; each migration
//!   bumps the location epoch so stale announcements can be recognised
//! - All identities have a canonical string form with strict parsing
//!
//! ## ID Format
//!
//! Identities use a prefixed format: `{prefix}_{ulid}`
//!
//! Examples:
//! - `body_01HV4Z2WQXKJNM8GPQY6VBKC3D`
//! - `job_01HV4Z3MXNKPQR9HSTZ7WCLD4E`
//!
//! Node locations use `pa://{host}/{node-name}`.

mod error;
mod location;
mod macros;
mod types;

pub use error::IdError;
pub use location::{Location, NodeUrl};
pub use types::*;

#[doc(hidden)]
pub use serde as __serde;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
