//! `optti-core`: shared primitives for the Optti background services.
//!
//! Identifiers and the small text helpers used when persisting error messages
//! and tags. No I/O lives here.

pub mod error;
pub mod id;
pub mod text;

pub use error::CoreError;
pub use id::{EntityId, JobId};
pub use text::{sanitize_key, strip_tags, trim_words};
