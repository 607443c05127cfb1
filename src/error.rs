use std::fmt::{Display, Formatter};

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::provider::ProviderKey;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Error while loading descriptors:\n{0}")]
    Descriptor(#[from] DescriptorError),

    #[error("Error while indexing provider scopes:\n{0}")]
    Scope(#[from] ScopeError),

    #[error("Error while resolving dependencies:\n{0}")]
    Dependency(#[from] DependencyError),

    #[error("Error while scheduling run-steps:\n{0}")]
    Schedule(#[from] ScheduleError),

    #[error("Error while running tasks:\n{0}")]
    Execution(#[from] ExecutionError),

    #[error("Error while assembling output:\n{0}")]
    Output(#[from] OutputError),
}

#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("Entry '{entry}': unknown generator '{generator}'")]
    UnknownGenerator { entry: String, generator: String },

    #[error("Entry '{entry}': invalid descriptor for generator '{generator}'.\n{error}")]
    Validation {
        entry: String,
        generator: String,
        error: serde_json::Error,
    },

    #[error("Entry '{entry}': generator '{generator}' failed to create tasks.\n{error:#}")]
    Factory {
        entry: String,
        generator: String,
        error: anyhow::Error,
    },

    #[error("Couldn't read descriptor file '{path}'.\n{error}")]
    Read {
        path: Utf8PathBuf,
        error: std::io::Error,
    },

    #[error("Couldn't parse descriptor file '{path}'.\n{error}")]
    Parse {
        path: Utf8PathBuf,
        error: serde_json::Error,
    },

    #[error("Entry '{entry}': element {position} of child slot '{slot}' has no instance name")]
    MissingInstanceName {
        entry: String,
        slot: String,
        position: usize,
    },

    #[error("Entry '{entry}': duplicate child id '{child}'")]
    DuplicateChildId { entry: String, child: String },

    #[error("Entry '{entry}': duplicate task name '{task}'")]
    DuplicateTaskName { entry: String, task: String },

    #[error("Task '{task}': unknown task dependency '{dependency}'")]
    UnknownTaskDependency { task: String, dependency: String },

    #[error("Task '{task}': dependency '{dependency}' is pinned to both '{first}' and '{second}'")]
    ConflictingReference {
        task: String,
        dependency: String,
        first: String,
        second: String,
    },
}

#[derive(Debug, Error)]
pub enum ScopeError {
    #[error("Task '{task}': export '{export}' names scope '{scope}', which no ancestor offers")]
    UnknownScope {
        task: String,
        export: String,
        scope: String,
    },

    #[error(
        "Duplicate export of provider '{provider}' in scope '{scope}' at entry '{anchor}': \
         tasks '{first}' and '{second}'"
    )]
    DuplicateProviderExport {
        provider: ProviderKey,
        scope: String,
        anchor: String,
        first: String,
        second: String,
    },

    #[error("Provider '{provider}' is declared with type {found} by task '{task}', but {expected} elsewhere")]
    ProviderTypeMismatch {
        provider: String,
        task: String,
        expected: &'static str,
        found: &'static str,
    },
}

#[derive(Debug, Error)]
pub enum DependencyError {
    #[error(
        "Task '{task}' of generator '{generator}': could not resolve dependency '{dependency}' \
         on provider '{provider}'"
    )]
    UnresolvedDependency {
        task: String,
        generator: String,
        dependency: String,
        provider: ProviderKey,
    },

    #[error(
        "Task '{task}': dependency '{dependency}' expects {expected}, but '{producer}' exports {found}"
    )]
    TypeMismatch {
        task: String,
        dependency: String,
        producer: String,
        expected: &'static str,
        found: &'static str,
    },
}

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("Cyclic dependency between run-steps: {}", .members.join(", "))]
    CyclicDependency { members: Vec<String> },

    #[error("Task '{task}': export '{export}' depends on unknown export '{dependency}'")]
    UnknownExportDependency {
        task: String,
        export: String,
        dependency: String,
    },
}

/// The lifecycle phase a run-step belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StepKind {
    Init,
    Build,
}

impl Display for StepKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            StepKind::Init => f.write_str("init"),
            StepKind::Build => f.write_str("build"),
        }
    }
}

/// A failure while running a single step, annotated with where it happened.
#[derive(Debug, Error)]
#[error("Failed to {step} task '{task}' of generator '{generator}':\n{kind}")]
pub struct ExecutionError {
    pub step: StepKind,
    pub task: String,
    pub generator: String,
    pub kind: ExecutionErrorKind,
}

#[derive(Debug, Error)]
pub enum ExecutionErrorKind {
    #[error("{0:#}")]
    Task(anyhow::Error),

    #[error("task declares exports but returned no providers")]
    MissingProviders,

    #[error("missing exported provider '{0}'")]
    MissingExportedProvider(String),

    #[error("exported provider '{export}' has type {found}, expected {expected}")]
    ProviderTypeMismatch {
        export: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("producer task '{0}' has not been initialized")]
    ProducerNotInitialized(String),

    #[error("task dependency '{0}' has not been built")]
    DependencyNotBuilt(String),

    #[error(transparent)]
    Output(#[from] OutputError),
}

impl ExecutionErrorKind {
    /// Looks for an [`OutputError`] either directly or inside a task error.
    pub fn output_error(&self) -> Option<&OutputError> {
        match self {
            ExecutionErrorKind::Output(error) => Some(error),
            ExecutionErrorKind::Task(error) => error.downcast_ref::<OutputError>(),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("Duplicate file write to '/{path}' by task '{second}', already written by '{first}'")]
    DuplicateFileWrite {
        /// Relative to the project root.
        path: Utf8PathBuf,
        first: String,
        second: String,
    },

    #[error("Task '{task}' has no template directory to read '{path}' from")]
    NoTemplateDirectory { task: String, path: Utf8PathBuf },

    #[error("Task '{task}' can't read template '{path}' outside its template directory")]
    TemplateOutsideDirectory { task: String, path: Utf8PathBuf },

    #[error("Couldn't read template '{path}'.\n{error}")]
    Template {
        path: Utf8PathBuf,
        error: std::io::Error,
    },

    #[error("Path '{0}' escapes the project directory")]
    PathOutsideProject(Utf8PathBuf),

    #[error("Couldn't write output.\n{0}")]
    Io(#[from] std::io::Error),

    #[error("Command '{command}' failed with {status}")]
    Command { command: String, status: String },
}
