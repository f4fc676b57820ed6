//! API route modules.

pub mod assistant;
pub mod sessions;
