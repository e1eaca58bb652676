//! SQAaaS Common Library
//!
//! Shared configuration, error taxonomy, data model and pipeline store for
//! the SQAaaS control plane.

pub mod config;
pub mod error;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use config::{ApiConfig, BadgeConfig, CiConfig, LimitsConfig, RepositoryConfig, StoreConfig};
pub use error::{Error, Result};
pub use store::PipelineStore;
pub use types::*;

/// SQAaaS API version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
