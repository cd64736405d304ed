//! Core types for the AuthEdge gateway authorization cache.
//!
//! This crate holds everything the cache and server layers agree on:
//! - [`model`]: user contexts, actions and permission keys
//! - [`pattern`]: resource pattern matching
//! - [`events`]: invalidation events and their wire format
//! - [`authority`]: the Identity Authority seam
//! - [`error`]: the gateway error taxonomy

pub mod authority;
pub mod error;
pub mod events;
pub mod model;
pub mod pattern;

pub use authority::{AuthorityCalls, IdentityAuthority, InMemoryAuthority};
pub use error::{AuthError, AuthResult, AuthorityError};
pub use events::{EventKind, InvalidationEvent, PermissionChange};
pub use model::{Action, PermissionKey, UserContext};
