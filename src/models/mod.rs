//! Core data models for the tiering engine.
//!
//! `blob` carries what the stores hold; `entry` carries what a merge pass
//! derives from two listings.

pub mod blob;
pub mod entry;

pub use blob::{Blob, BlobMetadata, Payload, etags_equal};
pub use entry::{MergedEntry, Region, TaggedEntry};
