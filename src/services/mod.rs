pub mod bounce_service;
pub mod task_status;

pub use bounce_service::BounceService;
pub use task_status::{ContainerStats, StoreStats, TaskSnapshot, TaskStatus};
