//! The expanded generator tree.
//!
//! Starting from the root descriptor, every entry is validated by its
//! generator, its child slots are resolved (loading referenced descriptor
//! files) and expanded recursively. Sibling subtrees are independent, so
//! they are expanded in parallel. The result is flattened into an arena in
//! pre-order, which makes the traversal order of everything downstream
//! deterministic.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use camino::Utf8PathBuf;
use rayon::iter::{IntoParallelIterator, ParallelIterator};

use crate::descriptor::{ChildEntry, ChildSlot, Descriptor, DescriptorLoader};
use crate::error::DescriptorError;
use crate::generator::{
    ExpandError, Generator, GeneratorRegistry, GeneratorTask, RunFn, template_dir,
};
use crate::provider::{ProviderDependency, ProviderExport, ProviderExportScope};

/// Id of the root entry.
pub const ROOT_ID: &str = "root";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryIndex(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskIndex(pub(crate) usize);

impl TaskIndex {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// One instantiation of a generator in the tree.
#[derive(Debug)]
pub struct GeneratorEntry {
    pub(crate) id: String,
    pub(crate) generator: String,
    pub(crate) descriptor: Descriptor,
    pub(crate) scopes: Vec<ProviderExportScope>,
    pub(crate) parent: Option<EntryIndex>,
    pub(crate) children: Vec<EntryIndex>,
    pub(crate) tasks: Vec<TaskIndex>,
    pub(crate) templates: Option<Utf8PathBuf>,
}

impl GeneratorEntry {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn generator(&self) -> &str {
        &self.generator
    }

    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    pub fn scopes(&self) -> &[ProviderExportScope] {
        &self.scopes
    }

    pub fn parent(&self) -> Option<EntryIndex> {
        self.parent
    }

    pub fn children(&self) -> &[EntryIndex] {
        &self.children
    }

    pub fn tasks(&self) -> &[TaskIndex] {
        &self.tasks
    }
}

/// A task bound to the entry that contributed it.
pub struct TaskEntry {
    pub(crate) id: String,
    pub(crate) name: String,
    pub(crate) entry: EntryIndex,
    pub(crate) generator: String,
    pub(crate) dependencies: std::collections::BTreeMap<String, ProviderDependency>,
    pub(crate) exports: std::collections::BTreeMap<String, ProviderExport>,
    pub(crate) after: Vec<TaskIndex>,
    pub(crate) run: Box<RunFn>,
}

impl TaskEntry {
    /// Globally unique id, `<entry id>#<task name>`.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entry(&self) -> EntryIndex {
        self.entry
    }

    pub fn generator(&self) -> &str {
        &self.generator
    }
}

impl std::fmt::Debug for TaskEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskEntry")
            .field("id", &self.id)
            .field("dependencies", &self.dependencies.keys())
            .field("exports", &self.exports.keys())
            .field("after", &self.after)
            .finish()
    }
}

/// The generator tree flattened in pre-order, with the tasks of every entry.
#[derive(Debug, Default)]
pub struct Blueprint {
    pub(crate) entries: Vec<GeneratorEntry>,
    pub(crate) tasks: Vec<TaskEntry>,
    entry_ids: HashMap<String, EntryIndex>,
    task_ids: HashMap<String, TaskIndex>,
}

/// An expanded subtree that has not been placed in the arena yet.
struct Pending {
    id: String,
    descriptor: Descriptor,
    generator: Arc<dyn Generator>,
    scopes: Vec<ProviderExportScope>,
    tasks: Vec<GeneratorTask>,
    children: Vec<Pending>,
}

impl Blueprint {
    pub fn build(
        registry: &GeneratorRegistry,
        loader: &DescriptorLoader,
        root: Descriptor,
    ) -> Result<Self, DescriptorError> {
        let tree = expand(registry, loader, ROOT_ID.to_string(), root)?;

        let mut blueprint = Blueprint::default();
        blueprint.place(tree, None, loader)?;

        tracing::debug!(
            "expanded {} entries with {} tasks",
            blueprint.entries.len(),
            blueprint.tasks.len()
        );

        Ok(blueprint)
    }

    pub fn entries(&self) -> &[GeneratorEntry] {
        &self.entries
    }

    pub fn tasks(&self) -> &[TaskEntry] {
        &self.tasks
    }

    pub fn entry(&self, index: EntryIndex) -> &GeneratorEntry {
        &self.entries[index.0]
    }

    pub fn task(&self, index: TaskIndex) -> &TaskEntry {
        &self.tasks[index.0]
    }

    pub fn find_entry(&self, id: &str) -> Option<EntryIndex> {
        self.entry_ids.get(id).copied()
    }

    pub fn find_task(&self, id: &str) -> Option<TaskIndex> {
        self.task_ids.get(id).copied()
    }

    pub fn task_indices(&self) -> impl Iterator<Item = TaskIndex> + use<> {
        (0..self.tasks.len()).map(TaskIndex)
    }

    /// The entry itself, then its parent, up to the root.
    pub fn ancestors(&self, index: EntryIndex) -> impl Iterator<Item = EntryIndex> + '_ {
        std::iter::successors(Some(index), |current| self.entries[current.0].parent)
    }

    fn place(
        &mut self,
        pending: Pending,
        parent: Option<EntryIndex>,
        loader: &DescriptorLoader,
    ) -> Result<EntryIndex, DescriptorError> {
        let index = EntryIndex(self.entries.len());

        if self.entry_ids.contains_key(&pending.id) {
            let entry = parent
                .map(|p| self.entries[p.0].id.clone())
                .unwrap_or_else(|| ROOT_ID.to_string());
            return Err(DescriptorError::DuplicateChildId {
                entry,
                child: pending.id,
            });
        }
        self.entry_ids.insert(pending.id.clone(), index);

        if let Some(parent) = parent {
            self.entries[parent.0].children.push(index);
        }

        let generator = pending.descriptor.generator.clone();
        self.entries.push(GeneratorEntry {
            id: pending.id.clone(),
            generator: generator.clone(),
            templates: template_dir(pending.generator.as_ref(), loader.project_dir()),
            descriptor: pending.descriptor,
            scopes: pending.scopes,
            parent,
            children: Vec::new(),
            tasks: Vec::new(),
        });

        let mut names = HashMap::new();
        let mut ordering = Vec::new();

        for task in pending.tasks {
            let id = format!("{}#{}", pending.id, task.name);

            if names.contains_key(&task.name) {
                return Err(DescriptorError::DuplicateTaskName {
                    entry: pending.id,
                    task: task.name,
                });
            }

            for (key, dependency) in &task.dependencies {
                if let Some(second) = &dependency.conflicting_export {
                    return Err(DescriptorError::ConflictingReference {
                        task: id,
                        dependency: key.clone(),
                        first: dependency.export.clone().unwrap_or_default(),
                        second: second.clone(),
                    });
                }
            }

            let task_index = TaskIndex(self.tasks.len());
            names.insert(task.name.clone(), task_index);
            ordering.push((task_index, task.task_dependencies));
            self.task_ids.insert(id.clone(), task_index);
            self.entries[index.0].tasks.push(task_index);

            self.tasks.push(TaskEntry {
                id,
                name: task.name,
                entry: index,
                generator: generator.clone(),
                dependencies: task.dependencies,
                exports: task.exports,
                after: Vec::new(),
                run: task.run,
            });
        }

        for (task_index, dependencies) in ordering {
            for dependency in dependencies {
                let Some(&target) = names.get(&dependency) else {
                    return Err(DescriptorError::UnknownTaskDependency {
                        task: self.tasks[task_index.0].id.clone(),
                        dependency,
                    });
                };

                let after = &mut self.tasks[task_index.0].after;
                if !after.contains(&target) {
                    after.push(target);
                }
            }
        }

        for child in pending.children {
            self.place(child, Some(index), loader)?;
        }

        Ok(index)
    }
}

fn expand(
    registry: &GeneratorRegistry,
    loader: &DescriptorLoader,
    id: String,
    descriptor: Descriptor,
) -> Result<Pending, DescriptorError> {
    let generator = registry
        .get(&descriptor.generator)
        .cloned()
        .ok_or_else(|| DescriptorError::UnknownGenerator {
            entry: id.clone(),
            generator: descriptor.generator.clone(),
        })?;

    let expansion = generator.expand(&descriptor).map_err(|error| match error {
        ExpandError::Validation(error) => DescriptorError::Validation {
            entry: id.clone(),
            generator: descriptor.generator.clone(),
            error,
        },
        ExpandError::Factory(error) => DescriptorError::Factory {
            entry: id.clone(),
            generator: descriptor.generator.clone(),
            error,
        },
    })?;

    let children = resolve_children(loader, &id, expansion.children)?;

    // Collected in order first, so the reported error doesn't depend on
    // which thread finished first.
    let children = children
        .into_par_iter()
        .map(|(child_id, child)| expand(registry, loader, child_id, child))
        .collect::<Vec<_>>()
        .into_iter()
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Pending {
        id,
        descriptor,
        generator,
        scopes: expansion.scopes,
        tasks: expansion.tasks,
        children,
    })
}

/// Turns the child slots of an entry into `(id, descriptor)` pairs.
fn resolve_children(
    loader: &DescriptorLoader,
    parent: &str,
    slots: std::collections::BTreeMap<String, ChildSlot>,
) -> Result<Vec<(String, Descriptor)>, DescriptorError> {
    let mut children = Vec::new();
    let mut seen = HashSet::new();

    let mut push = |id: String, descriptor: Descriptor| {
        if !seen.insert(id.clone()) {
            return Err(DescriptorError::DuplicateChildId {
                entry: parent.to_string(),
                child: id,
            });
        }
        children.push((id, descriptor));
        Ok(())
    };

    for (slot, value) in slots {
        match value {
            ChildSlot::Reference(reference) => {
                push(format!("{parent}:{slot}"), loader.load(&reference)?)?;
            }
            ChildSlot::One(descriptor) => {
                push(format!("{parent}:{slot}"), *descriptor)?;
            }
            ChildSlot::Many(items) => {
                for (position, item) in items.into_iter().enumerate() {
                    let descriptor = match item {
                        ChildEntry::Reference(reference) => loader.load(&reference)?,
                        ChildEntry::Inline(descriptor) => descriptor,
                    };

                    let Some(name) = descriptor.name.clone() else {
                        return Err(DescriptorError::MissingInstanceName {
                            entry: parent.to_string(),
                            slot,
                            position,
                        });
                    };

                    push(format!("{parent}:{slot}.{name}"), descriptor)?;
                }
            }
        }
    }

    Ok(children)
}
