//! Google Drive MCP server and owner-scoped project registry.

pub mod auth;
pub mod config;
pub mod credentials;
pub mod drive;
pub mod error;
pub mod registry;
pub mod tools;

pub use registry::{CreateProject, Identity, Project, ProjectRegistry, RegistryError};
