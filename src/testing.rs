//! Small generators and providers shared by the unit tests.

use std::sync::Mutex;

use serde_json::Value;

use crate::generator::{GeneratorTask, Instance, TypedGenerator};
use crate::provider::{ProviderExportScope, ProviderType};

/// A provider tasks append lines to.
#[derive(Debug, Default)]
pub(crate) struct Lines(pub Mutex<Vec<String>>);

impl Lines {
    pub(crate) fn push(&self, line: impl Into<String>) {
        if let Ok(mut lines) = self.0.lock() {
            lines.push(line.into());
        }
    }

    pub(crate) fn get(&self) -> Vec<String> {
        self.0.lock().map(|lines| lines.clone()).unwrap_or_default()
    }
}

pub(crate) const NODE: ProviderType<Lines> = ProviderType::new("core/node");
pub(crate) const CONFIG: ProviderType<Lines> = ProviderType::new("core/config").read_only();

pub(crate) const APP: ProviderExportScope = ProviderExportScope::new("core/app");
pub(crate) const PROJECT: ProviderExportScope = ProviderExportScope::new("core/project");

/// A generator that accepts any configuration and returns the tasks built by
/// a closure.
pub(crate) struct FnGenerator<F> {
    scopes: Vec<ProviderExportScope>,
    tasks: F,
}

impl<F> TypedGenerator for FnGenerator<F>
where
    F: Fn() -> Vec<GeneratorTask> + Send + Sync,
{
    type Config = Value;

    fn scopes(&self, _config: &Value) -> Vec<ProviderExportScope> {
        self.scopes.clone()
    }

    fn tasks(&self, _config: &Value) -> anyhow::Result<Vec<GeneratorTask>> {
        Ok((self.tasks)())
    }
}

pub(crate) fn generator<F>(scopes: &[ProviderExportScope], tasks: F) -> FnGenerator<F>
where
    F: Fn() -> Vec<GeneratorTask> + Send + Sync,
{
    FnGenerator {
        scopes: scopes.to_vec(),
        tasks,
    }
}

/// A task that does nothing in either step.
pub(crate) fn noop(name: &str) -> GeneratorTask {
    GeneratorTask::new(name).run(|_, _| Ok(Instance::new()))
}
