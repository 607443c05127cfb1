//! The contracts implemented by concrete generators.
//!
//! A generator is registered under a name in the [`GeneratorRegistry`]. When
//! a descriptor names it, the generator validates the descriptor into its
//! typed configuration, may contribute default child slots and offered
//! scopes, and returns the list of [`GeneratorTask`]s of the entry.
//!
//! Tasks have a two-phase lifecycle. At `init` the task's run function is
//! called with its resolved [`Dependencies`] and returns a [`TaskInstance`],
//! which hands out the [`Providers`] the task exports. At `build` the
//! instance writes files through an [`OutputBuilder`].

use std::any::{TypeId, type_name};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use serde::de::DeserializeOwned;

use crate::core::Dynamic;
use crate::descriptor::{ChildSlot, Descriptor};
use crate::output::OutputBuilder;
use crate::provider::{ProviderDependency, ProviderExport, ProviderExportScope};

/// A generator with a strongly typed configuration.
///
/// The configuration is deserialized from the descriptor fields other than
/// `generator`, `name` and `children`; a failure to deserialize is reported
/// as a validation error of the entry.
pub trait TypedGenerator: Send + Sync {
    type Config: DeserializeOwned + Send + Sync + 'static;

    /// Scopes offered by entries of this generator.
    fn scopes(&self, _config: &Self::Config) -> Vec<ProviderExportScope> {
        vec![]
    }

    /// Child slots added to every entry, overridden by the descriptor's own.
    fn children(&self, _config: &Self::Config) -> BTreeMap<String, ChildSlot> {
        BTreeMap::new()
    }

    /// Directory templates are read from.
    fn templates(&self) -> Option<&Utf8Path> {
        None
    }

    fn tasks(&self, config: &Self::Config) -> anyhow::Result<Vec<GeneratorTask>>;
}

/// Everything a generator contributes to one entry.
pub(crate) struct Expansion {
    pub scopes: Vec<ProviderExportScope>,
    pub children: BTreeMap<String, ChildSlot>,
    pub tasks: Vec<GeneratorTask>,
}

pub(crate) enum ExpandError {
    Validation(serde_json::Error),
    Factory(anyhow::Error),
}

/// Type-erased counterpart of [`TypedGenerator`] stored in the registry.
pub(crate) trait Generator: Send + Sync {
    fn expand(&self, descriptor: &Descriptor) -> Result<Expansion, ExpandError>;

    fn templates(&self) -> Option<&Utf8Path>;
}

// A blanket implementation to automatically bridge the two. This is where the
// configuration type gets erased.
impl<T> Generator for T
where
    T: TypedGenerator,
{
    fn expand(&self, descriptor: &Descriptor) -> Result<Expansion, ExpandError> {
        let config: T::Config =
            serde_json::from_value(descriptor.config_value()).map_err(ExpandError::Validation)?;

        let mut children = self.children(&config);
        children.extend(descriptor.children.clone());

        Ok(Expansion {
            scopes: self.scopes(&config),
            children,
            tasks: self.tasks(&config).map_err(ExpandError::Factory)?,
        })
    }

    fn templates(&self) -> Option<&Utf8Path> {
        TypedGenerator::templates(self)
    }
}

/// Generators addressable by the name used in descriptors.
#[derive(Default, Clone)]
pub struct GeneratorRegistry {
    generators: HashMap<String, Arc<dyn Generator>>,
}

impl GeneratorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<T>(&mut self, name: impl Into<String>, generator: T) -> &mut Self
    where
        T: TypedGenerator + 'static,
    {
        let name = name.into();
        if self.generators.contains_key(&name) {
            tracing::warn!("generator '{}' registered twice, replacing", name);
        }
        self.generators.insert(name, Arc::new(generator));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.generators.contains_key(name)
    }

    pub(crate) fn get(&self, name: &str) -> Option<&Arc<dyn Generator>> {
        self.generators.get(name)
    }
}

impl std::fmt::Debug for GeneratorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.generators.keys().collect();
        names.sort();
        f.debug_struct("GeneratorRegistry")
            .field("generators", &names)
            .finish()
    }
}

pub(crate) type RunFn =
    dyn Fn(&Dependencies, &TaskOutputs) -> anyhow::Result<Box<dyn TaskInstance>> + Send + Sync;

/// A named unit of work contributed by a generator.
pub struct GeneratorTask {
    pub(crate) name: String,
    pub(crate) dependencies: BTreeMap<String, ProviderDependency>,
    pub(crate) exports: BTreeMap<String, ProviderExport>,
    pub(crate) task_dependencies: Vec<String>,
    pub(crate) run: Box<RunFn>,
}

impl GeneratorTask {
    /// Starts the definition of a task.
    ///
    /// ```rust
    /// use genweave::{GeneratorTask, Instance};
    ///
    /// let task = GeneratorTask::new("main").run(|_, _| Ok(Instance::new()));
    /// assert_eq!(task.name(), "main");
    /// ```
    pub fn new(name: impl Into<String>) -> TaskDef {
        TaskDef {
            name: name.into(),
            dependencies: BTreeMap::new(),
            exports: BTreeMap::new(),
            task_dependencies: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for GeneratorTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeneratorTask")
            .field("name", &self.name)
            .field("dependencies", &self.dependencies.keys())
            .field("exports", &self.exports.keys())
            .field("task_dependencies", &self.task_dependencies)
            .finish()
    }
}

pub struct TaskDef {
    name: String,
    dependencies: BTreeMap<String, ProviderDependency>,
    exports: BTreeMap<String, ProviderExport>,
    task_dependencies: Vec<String>,
}

impl TaskDef {
    pub fn depends(mut self, key: impl Into<String>, dependency: ProviderDependency) -> Self {
        self.dependencies.insert(key.into(), dependency);
        self
    }

    pub fn exports(mut self, key: impl Into<String>, export: ProviderExport) -> Self {
        self.exports.insert(key.into(), export);
        self
    }

    /// Runs only after the named task of the same entry has been built, and
    /// receives its build output.
    pub fn after(mut self, task: impl Into<String>) -> Self {
        self.task_dependencies.push(task.into());
        self
    }

    pub fn run<F, I>(self, callback: F) -> GeneratorTask
    where
        F: Fn(&Dependencies, &TaskOutputs) -> anyhow::Result<I> + Send + Sync + 'static,
        I: TaskInstance + 'static,
    {
        GeneratorTask {
            name: self.name,
            dependencies: self.dependencies,
            exports: self.exports,
            task_dependencies: self.task_dependencies,
            run: Box::new(move |dependencies: &Dependencies, outputs: &TaskOutputs| {
                let instance = callback(dependencies, outputs)?;
                Ok(Box::new(instance) as Box<dyn TaskInstance>)
            }),
        }
    }
}

/// The live state of a task between its `init` and `build` steps.
pub trait TaskInstance: Send {
    /// Provider values, one per export key of the task.
    fn providers(&mut self) -> anyhow::Result<Option<Providers>> {
        Ok(None)
    }

    /// Produces files and commands. The returned value becomes the task's
    /// output, visible to tasks ordered after it.
    fn build(&mut self, _builder: &mut OutputBuilder<'_>) -> anyhow::Result<Option<Dynamic>> {
        Ok(None)
    }
}

type BuildFn = dyn FnOnce(&mut OutputBuilder<'_>) -> anyhow::Result<Option<Dynamic>> + Send;

/// A ready-made [`TaskInstance`] assembled from values and a closure.
#[derive(Default)]
pub struct Instance {
    providers: Option<Providers>,
    build: Option<Box<BuildFn>>,
}

impl Instance {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn provide<T>(self, key: impl Into<String>, value: T) -> Self
    where
        T: Send + Sync + 'static,
    {
        self.provide_shared(key, Arc::new(value))
    }

    /// Exposes a value the task keeps a handle to, so that mutations made by
    /// consumers are visible to the task's own build step.
    pub fn provide_shared<T>(mut self, key: impl Into<String>, value: Arc<T>) -> Self
    where
        T: Send + Sync + 'static,
    {
        self.providers
            .get_or_insert_with(Providers::default)
            .insert_shared(key, value);
        self
    }

    pub fn build<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&mut OutputBuilder<'_>) -> anyhow::Result<()> + Send + 'static,
    {
        self.build = Some(Box::new(move |builder: &mut OutputBuilder<'_>| {
            callback(builder)?;
            Ok(None)
        }));
        self
    }

    /// Like [`Instance::build`], but the closure's result is kept as the
    /// task's output.
    pub fn build_with_output<F, R>(mut self, callback: F) -> Self
    where
        F: FnOnce(&mut OutputBuilder<'_>) -> anyhow::Result<R> + Send + 'static,
        R: Send + Sync + 'static,
    {
        self.build = Some(Box::new(move |builder: &mut OutputBuilder<'_>| {
            let output = callback(builder)?;
            Ok(Some(Arc::new(output) as Dynamic))
        }));
        self
    }
}

impl TaskInstance for Instance {
    fn providers(&mut self) -> anyhow::Result<Option<Providers>> {
        Ok(self.providers.take())
    }

    fn build(&mut self, builder: &mut OutputBuilder<'_>) -> anyhow::Result<Option<Dynamic>> {
        match self.build.take() {
            Some(callback) => callback(builder),
            None => Ok(None),
        }
    }
}

/// A type-erased provider value together with the type it was created as.
#[derive(Clone)]
pub(crate) struct Provided {
    pub type_id: TypeId,
    pub type_name: &'static str,
    pub value: Dynamic,
}

impl Provided {
    fn downcast<T: Send + Sync + 'static>(&self, key: &str) -> anyhow::Result<Arc<T>> {
        Arc::downcast::<T>(self.value.clone()).map_err(|_| {
            anyhow::anyhow!(
                "Provider '{}' is {}, not {}",
                key,
                self.type_name,
                type_name::<T>()
            )
        })
    }
}

/// Provider values returned by a task instance, keyed by export key.
#[derive(Default, Clone)]
pub struct Providers {
    pub(crate) values: BTreeMap<String, Provided>,
}

impl Providers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T>(&mut self, key: impl Into<String>, value: T)
    where
        T: Send + Sync + 'static,
    {
        self.insert_shared(key, Arc::new(value));
    }

    pub fn insert_shared<T>(&mut self, key: impl Into<String>, value: Arc<T>)
    where
        T: Send + Sync + 'static,
    {
        self.values.insert(
            key.into(),
            Provided {
                type_id: TypeId::of::<T>(),
                type_name: type_name::<T>(),
                value,
            },
        );
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }
}

/// Resolved providers handed to a task's run function, keyed by the
/// dependency keys the task declared.
#[derive(Default)]
pub struct Dependencies {
    pub(crate) values: BTreeMap<String, Option<Provided>>,
}

impl Dependencies {
    /// A required dependency.
    pub fn get<T>(&self, key: &str) -> anyhow::Result<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        self.optional(key)?
            .ok_or_else(|| anyhow::anyhow!("Dependency '{}' was not resolved", key))
    }

    /// An optional dependency, `None` when nothing matched.
    pub fn optional<T>(&self, key: &str) -> anyhow::Result<Option<Arc<T>>>
    where
        T: Send + Sync + 'static,
    {
        match self.values.get(key) {
            Some(Some(provided)) => provided.downcast(key).map(Some),
            Some(None) => Ok(None),
            None => anyhow::bail!("Dependency '{}' was not declared", key),
        }
    }

    pub fn is_resolved(&self, key: &str) -> bool {
        matches!(self.values.get(key), Some(Some(_)))
    }
}

/// Build outputs of the tasks this task is ordered after, keyed by task name.
#[derive(Default)]
pub struct TaskOutputs {
    pub(crate) values: BTreeMap<String, Option<Dynamic>>,
}

impl TaskOutputs {
    pub fn get<T>(&self, task: &str) -> anyhow::Result<Option<Arc<T>>>
    where
        T: Send + Sync + 'static,
    {
        match self.values.get(task) {
            Some(Some(value)) => Arc::downcast::<T>(value.clone())
                .map(Some)
                .map_err(|_| {
                    anyhow::anyhow!("Output of task '{}' is not {}", task, type_name::<T>())
                }),
            Some(None) => Ok(None),
            None => anyhow::bail!("Task '{}' is not a declared task dependency", task),
        }
    }
}

/// Resolves the template directory of a generator against the project.
pub(crate) fn template_dir(generator: &dyn Generator, project_dir: &Utf8Path) -> Option<Utf8PathBuf> {
    generator.templates().map(|dir| project_dir.join(dir))
}
