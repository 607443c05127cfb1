#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod blueprint;
mod core;
mod descriptor;
mod engine;
mod error;
mod generator;
pub mod output;
mod provider;
#[cfg(test)]
mod testing;
pub mod utils;

pub use crate::blueprint::{Blueprint, EntryIndex, GeneratorEntry, ROOT_ID, TaskEntry, TaskIndex};
pub use crate::core::Dynamic;
pub use crate::descriptor::{ChildEntry, ChildSlot, Descriptor, DescriptorLoader};
pub use crate::engine::{
    DependencyMap, Diagnostics, Engine, ExportRef, Generation, Plan, ResolvedDependency, RunStep,
    Schedule, ScopeIndex, StepExecution,
};
pub use crate::error::*;
pub use crate::generator::{
    Dependencies, GeneratorRegistry, GeneratorTask, Instance, Providers, TaskDef, TaskInstance,
    TaskOutputs, TypedGenerator,
};
pub use crate::output::{
    BuilderAction, CommandOptions, CommandType, GeneratorOutput, OutputBuilder, OutputData,
    WriteFileOptions,
};
pub use crate::provider::{
    ProviderDependency, ProviderExport, ProviderExportScope, ProviderInfo, ProviderKey,
    ProviderType,
};
