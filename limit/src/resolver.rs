//! Effective-limit resolution over a project's lineage.
//!
//! The chain is walked as a plain ordered slice: the project itself, each ancestor up to the
//! root, then the default scope. For each resource the first scope holding an explicit record
//! wins. A silent scope inherits; it never means zero.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};

use crate::error::LimitError;
use crate::model::{ProjectLimitSet, ProjectRecords, RegistryRecord, ResourceLimit, Scope};

/// Scopes from most specific to least: project, ancestors, default.
fn scope_chain(records: &ProjectRecords) -> Result<Vec<Scope>, LimitError> {
    let mut chain = Vec::with_capacity(records.lineage.len() + 2);
    if records.lineage.first() != Some(&records.project_id) {
        chain.push(Scope::Project(records.project_id.clone()));
    }
    chain.extend(records.lineage.iter().cloned().map(Scope::Project));

    let mut seen = BTreeSet::new();
    for scope in &chain {
        if !seen.insert(scope) {
            return Err(LimitError::ResolutionConflict {
                resource_name: "*".to_string(),
                scope: scope.to_string(),
                records: vec![format!("lineage {:?}", records.lineage)],
            });
        }
    }
    chain.push(Scope::Default);
    Ok(chain)
}

/// Computes the effective limit per resource. Resources with no record at any scope are
/// left out of the map and are therefore unlimited.
pub fn resolve(records: &ProjectRecords) -> Result<BTreeMap<String, ResourceLimit>, LimitError> {
    let chain = scope_chain(records)?;

    let mut by_scope: HashMap<(&Scope, &str), Vec<&RegistryRecord>> = HashMap::new();
    for record in &records.records {
        if !chain.contains(&record.scope) {
            return Err(LimitError::ResolutionConflict {
                resource_name: record.resource_name.clone(),
                scope: record.scope.to_string(),
                records: vec![record.to_string()],
            });
        }
        by_scope
            .entry((&record.scope, record.resource_name.as_str()))
            .or_default()
            .push(record);
    }

    // Report conflicts deterministically regardless of record order.
    let mut conflicts: Vec<_> = by_scope.iter().filter(|(_, rs)| rs.len() > 1).collect();
    conflicts.sort_by(|a, b| a.0.cmp(b.0));
    if let Some(((scope, resource_name), rs)) = conflicts.first() {
        return Err(LimitError::ResolutionConflict {
            resource_name: resource_name.to_string(),
            scope: scope.to_string(),
            records: rs.iter().map(|r| r.to_string()).collect(),
        });
    }

    let names: BTreeSet<&str> = records
        .records
        .iter()
        .map(|r| r.resource_name.as_str())
        .collect();

    let mut out = BTreeMap::new();
    for name in names {
        let winner = chain
            .iter()
            .find_map(|scope| by_scope.get(&(scope, name)).and_then(|rs| rs.first()));
        if let Some(record) = winner {
            out.insert(
                name.to_string(),
                ResourceLimit {
                    resource_name: name.to_string(),
                    limit_value: record.limit_value,
                    is_strict: record.is_strict,
                },
            );
        }
    }
    Ok(out)
}

/// [`resolve`] wrapped into a [`ProjectLimitSet`] stamped with `now`.
pub fn resolve_limit_set(
    records: &ProjectRecords,
    now: DateTime<Utc>,
) -> Result<ProjectLimitSet, LimitError> {
    let limits = resolve(records)?;
    tracing::debug!(
        project_id = %records.project_id,
        depth = records.lineage.len(),
        resources = limits.len(),
        "resolved project limits"
    );
    Ok(ProjectLimitSet {
        project_id: records.project_id.clone(),
        limits,
        resolved_at: now,
    })
}
