//! Shared types for the appforge runtime platform.
//!
//! Identifiers, the environment data model, and the status event plumbing
//! used by the sandbox and server crates.

pub mod events;
pub mod types;

pub use events::*;
pub use types::*;
