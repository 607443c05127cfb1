mod diagnostics;

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::blueprint::{Blueprint, TaskEntry, TaskIndex};
use crate::core::Dynamic;
use crate::engine::resolve::DependencyMap;
use crate::engine::schedule::{RunStep, Schedule};
use crate::error::{ExecutionError, ExecutionErrorKind};
use crate::generator::{Dependencies, Provided, TaskInstance, TaskOutputs};
use crate::output::{GeneratorOutput, OutputAssembler, OutputBuilder};

pub use diagnostics::Diagnostics;

#[derive(Debug, Clone)]
pub struct StepExecution {
    pub start: Instant,
    pub duration: Duration,
}

/// Per-task state carried between the steps of a run.
#[derive(Default)]
struct TaskState {
    instance: Option<Box<dyn TaskInstance>>,
    /// Set once the task has been initialized.
    providers: Option<BTreeMap<String, Provided>>,
    /// Set once the task has been built.
    output: Option<Option<Dynamic>>,
}

/// Walks the scheduled run-steps once, in order. The first failing step
/// aborts the run.
pub(crate) fn run(
    blueprint: &Blueprint,
    dependencies: &DependencyMap,
    schedule: &Schedule,
) -> Result<(GeneratorOutput, Diagnostics), ExecutionError> {
    let mut states: Vec<TaskState> = blueprint.tasks.iter().map(|_| TaskState::default()).collect();
    let mut assembler = OutputAssembler::new();
    let mut execution_times = HashMap::new();

    let root_span = tracing::span!(Level::INFO, "running_steps");
    root_span.pb_set_length(schedule.steps().len() as u64);
    if let Ok(style) = crate::utils::get_style_steps() {
        root_span.pb_set_style(&style);
    }
    root_span.pb_set_message("Running tasks...");
    let _enter = root_span.enter();

    let pb_style = crate::utils::get_style_task().ok();

    for &step in schedule.steps() {
        let task = blueprint.task(step.task());

        let span = tracing::span!(Level::INFO, "step", task = task.id.as_str());
        if let Some(style) = &pb_style {
            span.pb_set_style(style);
        }
        span.pb_set_message(&format!("{} {}", step.kind(), task.id));
        let _step = span.enter();

        let start = Instant::now();
        let result = match step {
            RunStep::Init(index) => init(blueprint, dependencies, &mut states, index),
            RunStep::Build(index) => build(blueprint, &mut assembler, &mut states, index),
        };

        result.map_err(|kind| ExecutionError {
            step: step.kind(),
            task: task.id.clone(),
            generator: task.generator.clone(),
            kind,
        })?;

        execution_times.insert(
            step,
            StepExecution {
                start,
                duration: start.elapsed(),
            },
        );
        root_span.pb_inc(1);
    }

    let output = assembler.finish();
    tracing::info!(
        "Generated {} files and {} commands",
        output.files.len(),
        output.commands.len()
    );

    Ok((output, Diagnostics { execution_times }))
}

fn init(
    blueprint: &Blueprint,
    dependencies: &DependencyMap,
    states: &mut [TaskState],
    index: TaskIndex,
) -> Result<(), ExecutionErrorKind> {
    let task = blueprint.task(index);

    let mut resolved = Dependencies::default();
    for (key, dependency) in dependencies.get(index) {
        let value = match dependency {
            Some(dependency) => {
                let producer = blueprint.task(dependency.task);
                let provided = states[dependency.task.0]
                    .providers
                    .as_ref()
                    .and_then(|providers| providers.get(&dependency.export))
                    .ok_or_else(|| ExecutionErrorKind::ProducerNotInitialized(producer.id.clone()))?;
                Some(provided.clone())
            }
            None => None,
        };
        resolved.values.insert(key.clone(), value);
    }

    let outputs = task_outputs(blueprint, task, states)?;

    let mut instance = (task.run)(&resolved, &outputs).map_err(ExecutionErrorKind::Task)?;
    let providers = collect_providers(task, instance.as_mut())?;

    let state = &mut states[index.0];
    state.providers = Some(providers);
    state.instance = Some(instance);

    Ok(())
}

fn task_outputs(
    blueprint: &Blueprint,
    task: &TaskEntry,
    states: &[TaskState],
) -> Result<TaskOutputs, ExecutionErrorKind> {
    let mut outputs = TaskOutputs::default();

    for &before in &task.after {
        let name = &blueprint.task(before).name;
        let output = states[before.0]
            .output
            .clone()
            .ok_or_else(|| ExecutionErrorKind::DependencyNotBuilt(name.clone()))?;
        outputs.values.insert(name.clone(), output);
    }

    Ok(outputs)
}

/// Checks the providers of a fresh instance against the declared exports.
fn collect_providers(
    task: &TaskEntry,
    instance: &mut dyn TaskInstance,
) -> Result<BTreeMap<String, Provided>, ExecutionErrorKind> {
    if task.exports.is_empty() {
        return Ok(BTreeMap::new());
    }

    let providers = instance
        .providers()
        .map_err(ExecutionErrorKind::Task)?
        .ok_or(ExecutionErrorKind::MissingProviders)?;

    for (key, export) in &task.exports {
        let provided = providers
            .values
            .get(key)
            .ok_or_else(|| ExecutionErrorKind::MissingExportedProvider(key.clone()))?;

        if provided.type_id != export.provider.type_id {
            return Err(ExecutionErrorKind::ProviderTypeMismatch {
                export: key.clone(),
                expected: export.provider.type_name,
                found: provided.type_name,
            });
        }
    }

    Ok(providers.values)
}

fn build(
    blueprint: &Blueprint,
    assembler: &mut OutputAssembler,
    states: &mut [TaskState],
    index: TaskIndex,
) -> Result<(), ExecutionErrorKind> {
    let task = blueprint.task(index);
    let templates = blueprint.entry(task.entry).templates.as_deref();

    let state = &mut states[index.0];
    let instance = state
        .instance
        .as_mut()
        .ok_or_else(|| ExecutionErrorKind::ProducerNotInitialized(task.id.clone()))?;

    let mut builder = OutputBuilder::new(assembler, &task.id, templates);
    let result = instance.build(&mut builder);

    // a conflict is fatal even if the task swallowed the error
    if let Some(conflict) = assembler.take_conflict() {
        return Err(ExecutionErrorKind::Output(conflict));
    }

    state.output = Some(result.map_err(ExecutionErrorKind::Task)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::descriptor::{Descriptor, DescriptorLoader};
    use crate::engine::scope::ScopeIndex;
    use crate::error::{OutputError, StepKind};
    use crate::generator::{GeneratorRegistry, GeneratorTask, Instance};
    use crate::testing::{APP, Lines, NODE, generator};

    fn execute(registry: &GeneratorRegistry) -> Result<(GeneratorOutput, Diagnostics), ExecutionError> {
        let blueprint = Blueprint::build(
            registry,
            &DescriptorLoader::new("/nonexistent"),
            Descriptor::new("root"),
        )
        .expect("blueprint");
        let scopes = ScopeIndex::build(&blueprint).expect("scopes");
        let dependencies = DependencyMap::build(&blueprint, &scopes).expect("dependencies");
        let schedule = Schedule::build(&blueprint, &dependencies).expect("schedule");
        run(&blueprint, &dependencies, &schedule)
    }

    fn single(task: fn() -> Vec<GeneratorTask>) -> GeneratorRegistry {
        let mut registry = GeneratorRegistry::new();
        registry.add("root", generator(&[APP], task));
        registry
    }

    #[test]
    fn test_providers_flow_between_tasks() {
        let registry = single(|| {
            vec![
                GeneratorTask::new("consumer")
                    .depends("node", NODE.dependency())
                    .run(|deps, _| {
                        let node = deps.get::<Lines>("node")?;
                        node.push("consumer init");
                        Ok(Instance::new().build(move |builder| {
                            node.push("consumer build");
                            builder.write_file("consumer.txt", "c")?;
                            Ok(())
                        }))
                    }),
                GeneratorTask::new("producer")
                    .exports("node", NODE.export(&APP))
                    .run(|_, _| {
                        let lines = Arc::new(Lines::default());
                        let shared = lines.clone();
                        Ok(Instance::new()
                            .provide_shared("node", lines)
                            .build(move |builder| {
                                builder.write_file("lines.txt", shared.get().join("\n"))?;
                                Ok(())
                            }))
                    }),
            ]
        });

        let (output, diagnostics) = execute(&registry).unwrap();
        let lines = output.file("lines.txt").unwrap();
        assert_eq!(lines.contents.as_ref(), b"consumer init\nconsumer build");
        assert_eq!(lines.task, "root#producer");
        assert!(output.file("consumer.txt").is_some());
        assert_eq!(diagnostics.execution_times.len(), 4);
    }

    #[test]
    fn test_task_outputs_are_passed_along() {
        let registry = single(|| {
            vec![
                GeneratorTask::new("second")
                    .after("first")
                    .run(|_, outputs| {
                        let value = outputs.get::<String>("first")?;
                        Ok(Instance::new().build(move |builder| {
                            let value = value.as_deref().map(String::as_str).unwrap_or("none");
                            builder.write_file("second.txt", value)?;
                            Ok(())
                        }))
                    }),
                GeneratorTask::new("first").run(|_, _| {
                    Ok(Instance::new().build_with_output(|_| Ok("from first".to_string())))
                }),
            ]
        });

        let (output, _) = execute(&registry).unwrap();
        assert_eq!(
            output.file("second.txt").unwrap().contents.as_ref(),
            b"from first"
        );
    }

    #[test]
    fn test_missing_exported_provider() {
        let registry = single(|| {
            vec![
                GeneratorTask::new("producer")
                    .exports("node", NODE.export(&APP))
                    .run(|_, _| Ok(Instance::new().provide("other", Lines::default()))),
            ]
        });

        let err = execute(&registry).unwrap_err();
        assert_eq!(err.step, StepKind::Init);
        assert_eq!(err.task, "root#producer");
        assert_eq!(err.generator, "root");
        assert!(matches!(
            err.kind,
            ExecutionErrorKind::MissingExportedProvider(ref key) if key == "node"
        ));
    }

    #[test]
    fn test_missing_providers() {
        let registry = single(|| {
            vec![
                GeneratorTask::new("producer")
                    .exports("node", NODE.export(&APP))
                    .run(|_, _| Ok(Instance::new())),
            ]
        });

        let err = execute(&registry).unwrap_err();
        assert!(matches!(err.kind, ExecutionErrorKind::MissingProviders));
    }

    #[test]
    fn test_wrong_provider_type() {
        let registry = single(|| {
            vec![
                GeneratorTask::new("producer")
                    .exports("node", NODE.export(&APP))
                    .run(|_, _| Ok(Instance::new().provide("node", 42u32))),
            ]
        });

        let err = execute(&registry).unwrap_err();
        assert!(matches!(err.kind, ExecutionErrorKind::ProviderTypeMismatch { .. }));
    }

    #[test]
    fn test_task_error_is_annotated() {
        let registry = single(|| {
            vec![GeneratorTask::new("broken").run(|_, _| {
                Ok(Instance::new().build(|_| anyhow::bail!("template exploded")))
            })]
        });

        let err = execute(&registry).unwrap_err();
        assert_eq!(err.step, StepKind::Build);
        let message = err.to_string();
        assert!(message.contains("Failed to build task 'root#broken' of generator 'root'"));
        assert!(message.contains("template exploded"));
    }

    #[test]
    fn test_swallowed_conflict_still_fails() {
        let registry = single(|| {
            vec![
                GeneratorTask::new("a").run(|_, _| {
                    Ok(Instance::new().build(|builder| {
                        builder.write_file("/src/app.ts", "same")?;
                        Ok(())
                    }))
                }),
                GeneratorTask::new("b").run(|_, _| {
                    Ok(Instance::new().build(|builder| {
                        let _ = builder.write_file("/src/app.ts", "same");
                        Ok(())
                    }))
                }),
            ]
        });

        let err = execute(&registry).unwrap_err();
        assert_eq!(err.task, "root#b");
        match err.kind.output_error() {
            Some(OutputError::DuplicateFileWrite { path, first, .. }) => {
                assert_eq!(path.as_str(), "src/app.ts");
                assert_eq!(first, "root#a");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
