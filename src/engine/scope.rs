use std::collections::{BTreeMap, BTreeSet};

use crate::blueprint::{Blueprint, EntryIndex, TaskIndex};
use crate::error::ScopeError;
use crate::provider::{ProviderKey, ProviderRegistry};

/// The export a provider key resolves to at an anchor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportRef {
    pub task: TaskIndex,
    /// Export key of the producing task.
    pub export: String,
}

#[derive(Debug, Default)]
struct EntryScopes {
    offered: BTreeSet<String>,
    providers: BTreeMap<ProviderKey, ExportRef>,
}

/// Offered scopes and anchored exports of every entry of a blueprint.
#[derive(Debug, Default)]
pub struct ScopeIndex {
    entries: Vec<EntryScopes>,
}

impl ScopeIndex {
    /// Anchors every export at the nearest ancestor (inclusive) offering the
    /// scope it names. Entries are visited in pre-order.
    pub(crate) fn build(blueprint: &Blueprint) -> Result<Self, ScopeError> {
        let mut registry = ProviderRegistry::default();
        let mut entries: Vec<EntryScopes> = blueprint
            .entries
            .iter()
            .map(|entry| EntryScopes {
                offered: entry.scopes.iter().map(|s| s.name().to_string()).collect(),
                providers: BTreeMap::new(),
            })
            .collect();

        for (index, entry) in blueprint.entries.iter().enumerate() {
            for &task_index in &entry.tasks {
                let task = blueprint.task(task_index);

                for (key, export) in &task.exports {
                    registry.register(&export.provider, &task.id)?;
                    let provider = export.key();

                    for scope in &export.scopes {
                        let anchor = blueprint
                            .ancestors(EntryIndex(index))
                            .find(|a| entries[a.0].offered.contains(scope.name()))
                            .ok_or_else(|| ScopeError::UnknownScope {
                                task: task.id.clone(),
                                export: key.clone(),
                                scope: scope.to_string(),
                            })?;

                        let providers = &mut entries[anchor.0].providers;
                        match providers.get(&provider) {
                            // the same export reaching one anchor through two scopes
                            Some(existing) if existing.task == task_index && existing.export == *key => {}
                            Some(existing) => {
                                return Err(ScopeError::DuplicateProviderExport {
                                    provider,
                                    scope: scope.to_string(),
                                    anchor: blueprint.entry(anchor).id.clone(),
                                    first: blueprint.task(existing.task).id.clone(),
                                    second: task.id.clone(),
                                });
                            }
                            None => {
                                tracing::debug!(
                                    "{} anchored at {} by {}",
                                    provider,
                                    blueprint.entry(anchor).id,
                                    task.id
                                );
                                providers.insert(
                                    provider.clone(),
                                    ExportRef {
                                        task: task_index,
                                        export: key.clone(),
                                    },
                                );
                            }
                        }
                    }
                }
            }
        }

        Ok(Self { entries })
    }

    pub fn offered(&self, entry: EntryIndex) -> impl Iterator<Item = &str> {
        self.entries[entry.0].offered.iter().map(String::as_str)
    }

    /// Exact match of a provider key anchored at `entry`.
    pub fn lookup(&self, entry: EntryIndex, key: &ProviderKey) -> Option<&ExportRef> {
        self.entries[entry.0].providers.get(key)
    }

    /// Whether any variant of the provider is anchored at `entry`.
    pub fn has_provider(&self, entry: EntryIndex, provider: &str) -> bool {
        self.entries[entry.0]
            .providers
            .keys()
            .any(|key| key.provider == provider)
    }

    pub fn providers(&self, entry: EntryIndex) -> impl Iterator<Item = (&ProviderKey, &ExportRef)> {
        self.entries[entry.0].providers.iter()
    }
}
