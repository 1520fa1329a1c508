//! img core library
//!
//! Daemonless container image builder: parses Dockerfile-syntax build
//! scripts, executes them with layer caching for one or more platforms and
//! exports the result.

pub mod builder;
pub mod config;
pub mod error;
pub mod observability;
pub mod paths;

// Re-export commonly used items
pub use config::Config;
pub use error::{ConfigError, ImgError, Result};
pub use observability::init as init_observability;
