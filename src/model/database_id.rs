use serde::{Deserialize, Serialize};

pub const DEFAULT_DATABASE: &str = "(default)";

/// Identifies the remote database a client synchronizes with. Used to build
/// fully qualified resource names on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatabaseId {
    project_id: String,
    database: String,
}

impl DatabaseId {
    pub fn new(project_id: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            database: database.into(),
        }
    }

    pub fn for_project(project_id: impl Into<String>) -> Self {
        Self::new(project_id, DEFAULT_DATABASE)
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    /// `projects/{project}/databases/{database}`
    pub fn database_name(&self) -> String {
        format!("projects/{}/databases/{}", self.project_id, self.database)
    }

    /// Prefix shared by every document name in this database.
    pub fn documents_root(&self) -> String {
        format!("{}/documents", self.database_name())
    }
}

impl Default for DatabaseId {
    fn default() -> Self {
        Self::for_project("local")
    }
}
