//! CLI command implementations

pub mod build;
pub mod ls;
pub mod prune;
