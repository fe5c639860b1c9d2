//! In-process registry: a project tree plus records held in memory.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::RegistryClient;
use crate::error::LimitError;
use crate::model::{ProjectRecords, RegistryRecord, Scope};

#[derive(Default)]
struct Tree {
    parents: HashMap<String, Option<String>>,
    records: Vec<RegistryRecord>,
}

/// Serves limits from memory. Records can be replaced at runtime with
/// [`StaticRegistry::upsert_record`]; callers must invalidate cached sets themselves.
#[derive(Default)]
pub struct StaticRegistry {
    tree: RwLock<Tree>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a project under `parent` (`None` for a root project).
    pub fn with_project(mut self, project_id: &str, parent: Option<&str>) -> Self {
        self.tree
            .get_mut()
            .parents
            .insert(project_id.to_string(), parent.map(str::to_string));
        self
    }

    pub fn with_record(mut self, record: RegistryRecord) -> Self {
        self.tree.get_mut().records.push(record);
        self
    }

    /// Replaces the record for the same scope and resource, or adds it.
    pub async fn upsert_record(&self, record: RegistryRecord) {
        let mut tree = self.tree.write().await;
        tree.records
            .retain(|r| !(r.scope == record.scope && r.resource_name == record.resource_name));
        tree.records.push(record);
    }
}

#[async_trait]
impl RegistryClient for StaticRegistry {
    async fn fetch(&self, project_id: &str) -> Result<ProjectRecords, LimitError> {
        let tree = self.tree.read().await;
        if !tree.parents.contains_key(project_id) {
            return Err(LimitError::RegistryNotFound {
                project_id: project_id.to_string(),
            });
        }

        let mut lineage = vec![project_id.to_string()];
        let mut cursor = tree.parents.get(project_id).cloned().flatten();
        while let Some(parent) = cursor {
            if lineage.contains(&parent) {
                return Err(LimitError::ResolutionConflict {
                    resource_name: "*".to_string(),
                    scope: Scope::Project(parent).to_string(),
                    records: vec![format!("cyclic parent chain {lineage:?}")],
                });
            }
            cursor = tree.parents.get(&parent).cloned().flatten();
            lineage.push(parent);
        }

        let records = tree
            .records
            .iter()
            .filter(|r| match &r.scope {
                Scope::Default => true,
                Scope::Project(id) => lineage.contains(id),
            })
            .cloned()
            .collect();

        Ok(ProjectRecords {
            project_id: project_id.to_string(),
            lineage,
            records,
        })
    }
}
