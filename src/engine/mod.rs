//! The pipeline from a root descriptor to a finalized output.
//!
//! [`Engine::plan`] expands the generator tree, anchors exports, resolves
//! dependencies and orders the run-steps. These are pure computations over
//! the tree; nothing runs yet. [`Plan::execute`] then walks the run-steps
//! and returns the assembled [`GeneratorOutput`].

mod resolve;
mod runner;
mod schedule;
mod scope;

use camino::{Utf8Path, Utf8PathBuf};

use crate::blueprint::Blueprint;
use crate::descriptor::{Descriptor, DescriptorLoader};
use crate::error::{EngineError, OutputError};
use crate::generator::GeneratorRegistry;
use crate::output::{GeneratorOutput, WriteOptions, WriteReport, write_output};

pub use resolve::{DependencyMap, ResolvedDependency};
pub use runner::{Diagnostics, StepExecution};
pub use schedule::{RunStep, Schedule};
pub use scope::{ExportRef, ScopeIndex};

/// Entry point of the library.
///
/// ```rust,no_run
/// use genweave::{Descriptor, Engine, GeneratorRegistry};
///
/// let registry = GeneratorRegistry::new();
/// let engine = Engine::new(registry).project_dir("my-app");
/// let generation = engine.generate(Descriptor::new("core/app"))?;
/// # Ok::<(), genweave::EngineError>(())
/// ```
#[derive(Debug, Clone)]
pub struct Engine {
    registry: GeneratorRegistry,
    project_dir: Utf8PathBuf,
}

impl Engine {
    pub fn new(registry: GeneratorRegistry) -> Self {
        Self {
            registry,
            project_dir: Utf8PathBuf::from("."),
        }
    }

    /// Directory descriptor references and output paths are relative to.
    pub fn project_dir(mut self, project_dir: impl Into<Utf8PathBuf>) -> Self {
        self.project_dir = project_dir.into();
        self
    }

    pub fn registry(&self) -> &GeneratorRegistry {
        &self.registry
    }

    pub fn loader(&self) -> DescriptorLoader {
        DescriptorLoader::new(self.project_dir.clone())
    }

    pub fn plan(&self, root: Descriptor) -> Result<Plan, EngineError> {
        let blueprint = Blueprint::build(&self.registry, &self.loader(), root)?;
        let scopes = ScopeIndex::build(&blueprint)?;
        let dependencies = DependencyMap::build(&blueprint, &scopes)?;
        let schedule = Schedule::build(&blueprint, &dependencies)?;

        tracing::info!(
            "Planned {} tasks in {} entries",
            blueprint.tasks().len(),
            blueprint.entries().len()
        );

        Ok(Plan {
            blueprint,
            scopes,
            dependencies,
            schedule,
        })
    }

    /// Plans from a descriptor file, given as a reference relative to the
    /// project directory.
    pub fn plan_file(&self, reference: &str) -> Result<Plan, EngineError> {
        let root = self.loader().load(reference)?;
        self.plan(root)
    }

    pub fn generate(&self, root: Descriptor) -> Result<Generation, EngineError> {
        self.plan(root)?.execute()
    }
}

/// Everything known about a run before any task executes.
#[derive(Debug)]
pub struct Plan {
    blueprint: Blueprint,
    scopes: ScopeIndex,
    dependencies: DependencyMap,
    schedule: Schedule,
}

impl Plan {
    pub fn blueprint(&self) -> &Blueprint {
        &self.blueprint
    }

    pub fn scopes(&self) -> &ScopeIndex {
        &self.scopes
    }

    pub fn dependencies(&self) -> &DependencyMap {
        &self.dependencies
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    /// The run order as `init|<task id>` and `build|<task id>` tokens.
    pub fn steps(&self) -> Vec<String> {
        self.schedule.tokens(&self.blueprint)
    }

    pub fn render_mermaid(&self) -> String {
        self.schedule.render_mermaid(&self.blueprint)
    }

    pub fn execute(&self) -> Result<Generation, EngineError> {
        let (output, diagnostics) = runner::run(&self.blueprint, &self.dependencies, &self.schedule)?;
        Ok(Generation {
            output,
            diagnostics,
        })
    }
}

/// The result of a successful run.
#[derive(Debug)]
pub struct Generation {
    pub output: GeneratorOutput,
    pub diagnostics: Diagnostics,
}

impl Generation {
    /// Applies the output to the project directory.
    pub fn write(
        &self,
        project_dir: &Utf8Path,
        options: &WriteOptions,
    ) -> Result<WriteReport, OutputError> {
        write_output(&self.output, project_dir, options)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::error::{DependencyError, ExecutionErrorKind, ScheduleError};
    use crate::generator::{GeneratorTask, Instance, TypedGenerator};
    use crate::output::{CommandOptions, CommandType};
    use crate::provider::ProviderExportScope;
    use crate::testing::{APP, Lines, NODE, generator, noop};
    use serde::Deserialize;

    /// Writes a file named after its configuration and registers commands.
    struct FileGenerator;

    #[derive(Deserialize)]
    struct FileConfig {
        path: String,
        contents: String,
        #[serde(default)]
        command: Option<String>,
    }

    impl TypedGenerator for FileGenerator {
        type Config = FileConfig;

        fn scopes(&self, _: &FileConfig) -> Vec<ProviderExportScope> {
            vec![APP]
        }

        fn tasks(&self, config: &FileConfig) -> anyhow::Result<Vec<GeneratorTask>> {
            let path = config.path.clone();
            let contents = config.contents.clone();
            let command = config.command.clone();

            Ok(vec![GeneratorTask::new("write").run(move |_, _| {
                let path = path.clone();
                let contents = contents.clone();
                let command = command.clone();

                Ok(Instance::new().build(move |builder| {
                    builder.write_file(&path, contents)?;
                    if let Some(command) = command {
                        builder.add_post_write_command(
                            command,
                            CommandType::Script,
                            CommandOptions::default().only_if_changed(path.clone()),
                        )?;
                    }
                    Ok(())
                }))
            })])
        }
    }

    fn registry() -> GeneratorRegistry {
        let mut registry = GeneratorRegistry::new();
        registry
            .add("file", FileGenerator)
            .add("root", generator(&[APP], || vec![noop("main")]))
            .add(
                "producer",
                generator(&[], || {
                    vec![
                        GeneratorTask::new("node")
                            .exports("node", NODE.export(&APP))
                            .run(|_, _| {
                                let lines = std::sync::Arc::new(Lines::default());
                                let shared = lines.clone();
                                Ok(Instance::new().provide_shared("node", lines).build(
                                    move |builder| {
                                        builder.write_file("lines.txt", shared.get().join(","))?;
                                        Ok(())
                                    },
                                ))
                            }),
                    ]
                }),
            )
            .add(
                "consumer",
                generator(&[], || {
                    vec![
                        GeneratorTask::new("use")
                            .depends("node", NODE.dependency())
                            .run(|deps, _| {
                                deps.get::<Lines>("node")?.push("used");
                                Ok(Instance::new())
                            }),
                    ]
                }),
            );
        registry
    }

    fn file(path: &str, contents: &str) -> Descriptor {
        Descriptor::new("file")
            .with("path", path)
            .with("contents", contents)
    }

    #[test]
    fn test_generate_end_to_end() {
        let engine = Engine::new(registry());
        let root = Descriptor::new("root")
            .child("producer", Descriptor::new("producer"))
            .child(
                "consumers",
                vec![
                    Descriptor::new("consumer").named("a"),
                    Descriptor::new("consumer").named("b"),
                ],
            );

        let generation = engine.generate(root).unwrap();
        let lines = generation.output.file("lines.txt").unwrap();
        assert_eq!(lines.contents.as_ref(), b"used,used");
    }

    #[test]
    fn test_runs_are_deterministic() {
        let engine = Engine::new(registry());
        let root = || {
            Descriptor::new("root")
                .child("producer", Descriptor::new("producer"))
                .child(
                    "consumers",
                    (0..8)
                        .map(|i| Descriptor::new("consumer").named(format!("c{i}")))
                        .collect::<Vec<_>>(),
                )
        };

        let first = engine.plan(root()).unwrap();
        let second = engine.plan(root()).unwrap();
        assert_eq!(first.steps(), second.steps());
        assert_eq!(first.render_mermaid(), second.render_mermaid());

        let a = first.execute().unwrap();
        let b = second.execute().unwrap();
        assert_eq!(a.output, b.output);

        // a plan can run more than once
        assert_eq!(first.execute().unwrap().output, a.output);
    }

    #[test]
    fn test_duplicate_file_write() {
        let engine = Engine::new(registry());
        let root = Descriptor::new("root").child(
            "files",
            vec![
                file("/src/app.ts", "export const a = 1;").named("a"),
                file("/src/app.ts", "export const b = 2;").named("b"),
            ],
        );

        match engine.generate(root) {
            Err(EngineError::Execution(error)) => {
                assert_eq!(error.task, "root:files.b#write");
                assert!(matches!(
                    error.kind.output_error(),
                    Some(OutputError::DuplicateFileWrite { path, .. }) if path.as_str() == "src/app.ts"
                ));
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn test_pipeline_errors_are_wrapped() {
        let engine = Engine::new(registry());

        let unresolved = engine.plan(Descriptor::new("root").child("c", Descriptor::new("consumer")));
        assert!(matches!(
            unresolved,
            Err(EngineError::Dependency(DependencyError::UnresolvedDependency { .. }))
        ));

        let mut registry = registry();
        registry.add(
            "loop",
            generator(&[APP], || {
                vec![
                    GeneratorTask::new("a").after("b").run(|_, _| Ok(Instance::new())),
                    GeneratorTask::new("b").after("a").run(|_, _| Ok(Instance::new())),
                ]
            }),
        );
        let cyclic = Engine::new(registry).plan(Descriptor::new("loop"));
        assert!(matches!(
            cyclic,
            Err(EngineError::Schedule(ScheduleError::CyclicDependency { .. }))
        ));
    }

    #[test]
    fn test_plan_file_and_write() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        fs::write(
            root.join("app.json"),
            r#"{
                "generator": "root",
                "children": {
                    "readme": {
                        "generator": "file",
                        "path": "/a.txt",
                        "contents": "hello",
                        "command": "echo ran >> log.txt"
                    }
                }
            }"#,
        )
        .unwrap();

        let engine = Engine::new(registry()).project_dir(root.clone());
        let plan = engine.plan_file("app").unwrap();
        let generation = plan.execute().unwrap();

        // new file, the command runs
        let report = generation.write(&root, &WriteOptions::default()).unwrap();
        assert_eq!(report.commands_run.len(), 1);
        assert_eq!(fs::read_to_string(root.join("a.txt")).unwrap(), "hello");

        // same contents, the command is skipped
        let report = generation.write(&root, &WriteOptions::default()).unwrap();
        assert!(report.commands_run.is_empty());

        // changed on disk, the command runs again
        fs::write(root.join("a.txt"), "edited").unwrap();
        let report = generation.write(&root, &WriteOptions::default()).unwrap();
        assert_eq!(report.commands_run.len(), 1);
        assert_eq!(fs::read_to_string(root.join("log.txt")).unwrap(), "ran\nran\n");
    }

    #[test]
    fn test_execution_error_names_step() {
        let mut registry = GeneratorRegistry::new();
        registry.add(
            "root",
            generator(&[], || {
                vec![GeneratorTask::new("fail")
                    .run(|_, _| -> anyhow::Result<Instance> { anyhow::bail!("no config") })]
            }),
        );

        match Engine::new(registry).generate(Descriptor::new("root")) {
            Err(EngineError::Execution(error)) => {
                assert!(matches!(error.kind, ExecutionErrorKind::Task(_)));
                assert_eq!(error.to_string(), "Failed to init task 'root#fail' of generator 'root':\nno config");
            }
            other => panic!("unexpected result {other:?}"),
        }
    }
}
