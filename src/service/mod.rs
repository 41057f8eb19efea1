//! Service layer
//!
//! Contains the logic behind the federation endpoint and startup
//! provisioning, separated from HTTP handlers.

mod activity;
pub mod provision;
pub mod visibility;

pub use activity::{ActivityService, PostOutcome, StoreActivityService};
pub use provision::ensure_actor;
