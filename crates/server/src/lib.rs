//! SQAaaS API server
//!
//! Pipeline orchestration engine: renders JePL artifacts from declarative
//! requests, materializes them in controlled repositories, drives the CI
//! engine and issues quality badges.

pub mod badgr;
pub mod git;
pub mod github;
pub mod jenkins;
pub mod jepl;
pub mod orchestrator;
pub mod server;

pub use orchestrator::Orchestrator;
pub use server::{serve, AppState};
