use std::sync::{Arc, Mutex};

use camino::Utf8PathBuf;
use clap::{Parser, ValueEnum};
use genweave::output::{WriteOptions, write_output};
use genweave::*;
use serde::Deserialize;

// -----------------------------------------------------------------------------
// Scaffolding example
//
// A tiny TypeScript project generator:
//
// - demo/app      -> offers the `demo/app` scope and owns package.json
// - demo/feature  -> writes one module and adds its dependencies to package.json
// - demo/index    -> re-exports every feature, runs after the features
//
// -----------------------------------------------------------------------------

#[derive(ValueEnum, Debug, Clone, Copy)]
enum Mode {
    /// Print the run order and the ordering graph.
    Plan,
    /// Run the tasks and list the generated files.
    Generate,
    /// Run the tasks and write the project to disk.
    Write,
}

#[derive(Parser, Debug, Clone)]
struct Args {
    #[clap(value_enum, index = 1, default_value = "plan")]
    mode: Mode,
    /// Project directory.
    #[clap(long, default_value = "scaffold-out")]
    project: Utf8PathBuf,
    /// Descriptor file relative to the project, the built-in one otherwise.
    #[clap(long)]
    descriptor: Option<String>,
    /// Don't run post-write commands.
    #[clap(long)]
    no_commands: bool,
    /// Save an SVG waterfall of the step timings here.
    #[clap(long)]
    waterfall: Option<Utf8PathBuf>,
}

const APP: ProviderExportScope = ProviderExportScope::new("demo/app");

/// package.json under construction.
#[derive(Default)]
struct Package {
    dependencies: Mutex<Vec<(String, String)>>,
}

const PACKAGE: ProviderType<Package> = ProviderType::new("demo/package");

/// Names of the feature modules, filled in by the features.
#[derive(Default)]
struct Modules(Mutex<Vec<String>>);

const MODULES: ProviderType<Modules> = ProviderType::new("demo/modules");

#[derive(Deserialize)]
struct AppConfig {
    name: String,
    #[serde(default)]
    install: bool,
}

struct App;

impl TypedGenerator for App {
    type Config = AppConfig;

    fn scopes(&self, _: &AppConfig) -> Vec<ProviderExportScope> {
        vec![APP]
    }

    fn children(&self, _: &AppConfig) -> std::collections::BTreeMap<String, ChildSlot> {
        let mut children = std::collections::BTreeMap::new();
        children.insert("index".to_string(), Descriptor::new("demo/index").into());
        children
    }

    fn tasks(&self, config: &AppConfig) -> anyhow::Result<Vec<GeneratorTask>> {
        let name = config.name.clone();
        let install = config.install;

        let package = GeneratorTask::new("package")
            .exports("package", PACKAGE.export(&APP))
            .run(move |_, _| {
                let package = Arc::new(Package::default());
                let shared = package.clone();
                let name = name.clone();

                Ok(Instance::new()
                    .provide_shared("package", package)
                    .build(move |builder| {
                        let mut dependencies = shared
                            .dependencies
                            .lock()
                            .map_err(|_| anyhow::anyhow!("package lock poisoned"))?
                            .clone();
                        dependencies.sort();

                        let dependencies = dependencies
                            .iter()
                            .map(|(name, version)| format!("    \"{name}\": \"{version}\""))
                            .collect::<Vec<_>>()
                            .join(",\n");

                        builder.write_file(
                            "/package.json",
                            format!(
                                "{{\n  \"name\": \"{name}\",\n  \"dependencies\": {{\n{dependencies}\n  }}\n}}\n"
                            ),
                        )?;

                        if install {
                            builder.add_post_write_command(
                                "npm install",
                                CommandType::Dependencies,
                                CommandOptions::default().only_if_changed("/package.json"),
                            )?;
                        }
                        Ok(())
                    }))
            });

        // "final" is settled once every feature has added its module
        let modules = GeneratorTask::new("modules")
            .exports("modules", MODULES.export(&APP))
            .exports(
                "final",
                MODULES.export(&APP).named("final").depends_on("modules"),
            )
            .run(|_, _| {
                let modules = Arc::new(Modules::default());
                Ok(Instance::new()
                    .provide_shared("modules", modules.clone())
                    .provide_shared("final", modules))
            });

        Ok(vec![package, modules])
    }
}

#[derive(Deserialize)]
struct FeatureConfig {
    #[serde(default)]
    dependencies: Vec<String>,
}

struct Feature;

impl TypedGenerator for Feature {
    type Config = FeatureConfig;

    fn tasks(&self, config: &FeatureConfig) -> anyhow::Result<Vec<GeneratorTask>> {
        let dependencies = config.dependencies.clone();

        Ok(vec![
            GeneratorTask::new("module")
                .depends("package", PACKAGE.dependency().modified_in_build())
                .depends("modules", MODULES.dependency().modified_in_build())
                .run(move |deps, _| {
                    let package = deps.get::<Package>("package")?;
                    let modules = deps.get::<Modules>("modules")?;
                    let dependencies = dependencies.clone();

                    Ok(Instance::new().build(move |builder| {
                        let name = builder
                            .task()
                            .rsplit_once(['.', ':'])
                            .map(|(_, rest)| rest.trim_end_matches("#module"))
                            .unwrap_or("feature")
                            .to_string();

                        builder.set_base_directory("/src/features")?;
                        builder.write_file(
                            format!("{name}.ts"),
                            format!("export const {name} = () => \"{name}\";\n"),
                        )?;

                        if let Ok(mut modules) = modules.0.lock() {
                            modules.push(name);
                        }
                        if let Ok(mut package) = package.dependencies.lock() {
                            for dependency in dependencies {
                                package.push((dependency, "latest".to_string()));
                            }
                        }
                        Ok(())
                    }))
                }),
        ])
    }
}

struct Index;

impl TypedGenerator for Index {
    type Config = serde_json::Value;

    fn tasks(&self, _: &serde_json::Value) -> anyhow::Result<Vec<GeneratorTask>> {
        Ok(vec![
            GeneratorTask::new("index")
                .depends("modules", MODULES.dependency().reference("final"))
                .run(|deps, _| {
                    let modules = deps.get::<Modules>("modules")?;

                    Ok(Instance::new().build(move |builder| {
                        builder.apply(|builder: &mut OutputBuilder<'_>| {
                            builder.set_base_directory("/src")?;
                            let mut names = modules
                                .0
                                .lock()
                                .map_err(|_| anyhow::anyhow!("modules lock poisoned"))?
                                .clone();
                            names.sort();

                            let index = names
                                .iter()
                                .map(|name| format!("export * from \"./features/{name}\";\n"))
                                .collect::<String>();
                            builder.write_file("index.ts", index)?;
                            Ok(())
                        })
                    }))
                }),
        ])
    }
}

fn default_descriptor() -> Descriptor {
    Descriptor::new("demo/app")
        .with("name", "scaffolded")
        .with("install", false)
        .child(
            "features",
            vec![
                Descriptor::new("demo/feature")
                    .named("auth")
                    .with("dependencies", vec!["jose"]),
                Descriptor::new("demo/feature")
                    .named("billing")
                    .with("dependencies", vec!["stripe"]),
            ],
        )
}

fn main() -> anyhow::Result<()> {
    genweave::utils::init_logging();
    let args = Args::parse();

    let mut registry = GeneratorRegistry::new();
    registry
        .add("demo/app", App)
        .add("demo/feature", Feature)
        .add("demo/index", Index);

    let engine = Engine::new(registry).project_dir(args.project.clone());

    let plan = match &args.descriptor {
        Some(reference) => engine.plan_file(reference),
        None => engine.plan(default_descriptor()),
    };
    let plan = match plan {
        Ok(plan) => plan,
        Err(error) => {
            eprintln!("{}", genweave::utils::report(&error.into()));
            std::process::exit(1);
        }
    };

    match args.mode {
        Mode::Plan => {
            for step in plan.steps() {
                println!("{step}");
            }
            println!();
            println!("{}", plan.render_mermaid());
        }
        Mode::Generate => {
            let generation = plan.execute()?;
            for (path, file) in &generation.output.files {
                println!("{path} ({})", file.task);
            }
            for command in &generation.output.commands {
                println!("$ {} ({:?})", command.command, command.command_type);
            }
            if let Some(path) = &args.waterfall {
                std::fs::write(path, generation.diagnostics.render_waterfall(plan.blueprint()))?;
                println!("timings saved to {path}");
            }
        }
        Mode::Write => {
            let generation = plan.execute()?;
            let options = WriteOptions {
                run_commands: !args.no_commands,
                ..WriteOptions::default()
            };
            let report = write_output(&generation.output, &args.project, &options)?;
            for path in report.changes.changed() {
                println!("wrote {path}");
            }
            for command in &report.commands_skipped {
                println!("skipped {command}");
            }
        }
    }

    Ok(())
}
