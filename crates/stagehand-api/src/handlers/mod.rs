//! Request handlers organized by resource.

pub mod agents;
pub mod health;
pub mod instances;
pub mod jobs;
pub mod pipelines;
pub mod schema;
