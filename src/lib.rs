//! Storage tiering between a fast "near" object store and a cheap "far"
//! one.
//!
//! Policies decide where each object's content should live and intercept
//! client traffic so that moves stay invisible to readers. The
//! [`services::BounceService`] walks containers and applies the policy to
//! every object.

pub mod clock;
pub mod config;
pub mod errors;
pub mod link;
pub mod locker;
pub mod marker;
pub mod merge;
pub mod models;
pub mod policy;
pub mod scheduler;
pub mod services;
pub mod store;

pub use errors::{TierError, TierResult};
pub use policy::{BouncePolicy, BounceResult, PolicyContext, build_policy};
pub use services::{BounceService, TaskStatus};
