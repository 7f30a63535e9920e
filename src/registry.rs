//! Owner-scoped project registry.
//!
//! A single `projects` table with a `by_owner` secondary index. Creating a
//! project requires an authenticated caller; listing without one yields an
//! empty collection rather than an error.
//!
//! The registry is a library surface: the embedding host resolves the
//! caller's [`Identity`] from its own session layer and shares one
//! [`ProjectRegistry`] (behind an `Arc`) across its request handlers. The
//! `gdrive-mcp` binary does not expose it.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Unauthorized")]
    Unauthorized,
}

/// Authenticated caller, as reported by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub subject: String,
}

impl Identity {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportStatus {
    Importing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(Uuid);

impl std::fmt::Display for ProjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    pub owner_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub import_status: Option<ImportStatus>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateProject {
    pub name: String,
}

#[derive(Debug, Default)]
struct Table {
    rows: HashMap<ProjectId, Project>,
    /// owner subject -> ids in insertion order
    by_owner: HashMap<String, Vec<ProjectId>>,
}

#[derive(Debug, Default)]
pub struct ProjectRegistry {
    table: RwLock<Table>,
}

impl ProjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a project owned by `caller` and return its id.
    pub async fn create(
        &self,
        caller: Option<&Identity>,
        args: CreateProject,
    ) -> Result<ProjectId, RegistryError> {
        let caller = caller.ok_or(RegistryError::Unauthorized)?;

        let project = Project {
            id: ProjectId(Uuid::new_v4()),
            name: args.name,
            owner_id: caller.subject.clone(),
            import_status: None,
        };
        let id = project.id;

        let mut table = self.table.write().await;
        table
            .by_owner
            .entry(project.owner_id.clone())
            .or_default()
            .push(id);
        table.rows.insert(id, project);
        tracing::debug!("project {id} created for {}", caller.subject);
        Ok(id)
    }

    /// All projects owned by `caller`, in insertion order.
    pub async fn list(&self, caller: Option<&Identity>) -> Vec<Project> {
        let Some(caller) = caller else {
            return Vec::new();
        };

        let table = self.table.read().await;
        table
            .by_owner
            .get(&caller.subject)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| table.rows.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }
}
