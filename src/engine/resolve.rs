use std::collections::BTreeMap;

use crate::blueprint::{Blueprint, TaskEntry, TaskIndex};
use crate::engine::scope::{ExportRef, ScopeIndex};
use crate::error::DependencyError;
use crate::provider::ProviderDependency;

/// A dependency bound to the export that satisfies it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDependency {
    pub task: TaskIndex,
    pub export: String,
    pub read_only: bool,
    pub modified_in_build: bool,
}

/// For every task, its dependency keys mapped onto producing exports, or
/// `None` for unpinned optional dependencies nothing satisfied.
#[derive(Debug, Default)]
pub struct DependencyMap {
    tasks: Vec<BTreeMap<String, Option<ResolvedDependency>>>,
}

impl DependencyMap {
    pub(crate) fn build(blueprint: &Blueprint, scopes: &ScopeIndex) -> Result<Self, DependencyError> {
        let mut tasks = Vec::with_capacity(blueprint.tasks.len());

        for task in &blueprint.tasks {
            let mut resolved = BTreeMap::new();

            for (key, dependency) in &task.dependencies {
                let found = match nearest(blueprint, scopes, task, dependency) {
                    Some(found) => found,
                    // a pinned reference is required even when optional
                    None if dependency.optional && dependency.export.is_none() => {
                        tracing::debug!("{}: optional '{}' is absent", task.id, key);
                        resolved.insert(key.clone(), None);
                        continue;
                    }
                    None => {
                        return Err(DependencyError::UnresolvedDependency {
                            task: task.id.clone(),
                            generator: task.generator.clone(),
                            dependency: key.clone(),
                            provider: dependency.key(),
                        });
                    }
                };

                let producer = blueprint.task(found.task);
                let export = &producer.exports[&found.export];
                if export.provider.type_id != dependency.provider.type_id {
                    return Err(DependencyError::TypeMismatch {
                        task: task.id.clone(),
                        dependency: key.clone(),
                        producer: producer.id.clone(),
                        expected: dependency.provider.type_name,
                        found: export.provider.type_name,
                    });
                }

                resolved.insert(
                    key.clone(),
                    Some(ResolvedDependency {
                        task: found.task,
                        export: found.export.clone(),
                        read_only: dependency.provider.read_only,
                        modified_in_build: dependency.modified_in_build,
                    }),
                );
            }

            tasks.push(resolved);
        }

        Ok(Self { tasks })
    }

    pub fn get(&self, task: TaskIndex) -> &BTreeMap<String, Option<ResolvedDependency>> {
        &self.tasks[task.0]
    }

    pub fn resolved(&self, task: TaskIndex, key: &str) -> Option<&ResolvedDependency> {
        self.tasks[task.0].get(key).and_then(Option::as_ref)
    }

    /// Every resolved dependency edge, as `(consumer, dependency)`, in task
    /// order.
    pub fn edges(&self) -> impl Iterator<Item = (TaskIndex, &ResolvedDependency)> {
        self.tasks.iter().enumerate().flat_map(|(index, deps)| {
            deps.values()
                .flatten()
                .map(move |dependency| (TaskIndex(index), dependency))
        })
    }
}

/// Walks up from the task's entry. The first ancestor holding any variant of
/// the provider ends the search, matching or not.
fn nearest<'a>(
    blueprint: &Blueprint,
    scopes: &'a ScopeIndex,
    task: &TaskEntry,
    dependency: &ProviderDependency,
) -> Option<&'a ExportRef> {
    let key = dependency.key();

    for ancestor in blueprint.ancestors(task.entry) {
        if let Some(found) = scopes.lookup(ancestor, &key) {
            return Some(found);
        }
        if scopes.has_provider(ancestor, &key.provider) {
            return None;
        }
    }

    None
}
