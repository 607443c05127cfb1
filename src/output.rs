//! Files and commands produced by the build steps of all tasks.
//!
//! Every build step receives an [`OutputBuilder`] bound to the task that
//! runs. All builders of a run write into one [`OutputAssembler`], which
//! refuses a second write to the same path. Once the last step has run, the
//! assembler is turned into a [`GeneratorOutput`] whose post-write commands
//! are grouped by [`CommandType`].
//!
//! Output paths are relative to the project directory. A leading `/` means
//! the project root, so `/src/app.ts` and `src/app.ts` name the same file.

mod write;

use std::collections::BTreeMap;
use std::fs;

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};

use crate::error::OutputError;

pub use write::{ChangeSet, FileChange, WriteOptions, WriteReport, write_output};

/// Normalize a path, removing things like `.` and `..`.
///
/// CAUTION: This does not resolve symlinks (unlike [`std::fs::canonicalize`]).
///
/// Adapted from
/// <https://github.com/rust-lang/cargo/blob/f7acf448fc127df9a77c52cc2bba027790ac4931/crates/cargo-util/src/paths.rs#L76-L116>
pub(crate) fn normalize_path(path: &Utf8Path) -> Utf8PathBuf {
    let mut components = path.components().peekable();
    let mut ret = if let Some(c @ Utf8Component::Prefix(..)) = components.peek().cloned() {
        components.next();
        Utf8PathBuf::from(c.as_str())
    } else {
        Utf8PathBuf::new()
    };

    for component in components {
        match component {
            Utf8Component::Prefix(..) => unreachable!(),
            Utf8Component::RootDir => {
                ret.push(Utf8Component::RootDir);
            }
            Utf8Component::CurDir => {}
            Utf8Component::ParentDir => {
                if ret.ends_with(Utf8Component::ParentDir) {
                    ret.push(Utf8Component::ParentDir);
                } else {
                    let popped = ret.pop();
                    if !popped && !ret.has_root() {
                        ret.push(Utf8Component::ParentDir);
                    }
                }
            }
            Utf8Component::Normal(c) => {
                ret.push(c);
            }
        }
    }
    ret
}

/// Turns any output path into its canonical, project-relative form.
pub(crate) fn project_path(path: &Utf8Path) -> Result<Utf8PathBuf, OutputError> {
    let normalized = normalize_path(path);
    let relative = normalized
        .strip_prefix("/")
        .map(Utf8Path::to_path_buf)
        .unwrap_or(normalized);

    match relative.components().next() {
        Some(Utf8Component::ParentDir | Utf8Component::Prefix(..)) => {
            Err(OutputError::PathOutsideProject(path.to_path_buf()))
        }
        _ => Ok(relative),
    }
}

/// The content of an output file.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub enum OutputData {
    /// Text content (UTF-8).
    Utf8(String),
    /// Binary content (raw bytes).
    Binary(Vec<u8>),
}

impl AsRef<[u8]> for OutputData {
    fn as_ref(&self) -> &[u8] {
        match self {
            OutputData::Utf8(s) => s.as_bytes(),
            OutputData::Binary(b) => b.as_slice(),
        }
    }
}

impl From<String> for OutputData {
    fn from(value: String) -> Self {
        OutputData::Utf8(value)
    }
}

impl From<&str> for OutputData {
    fn from(value: &str) -> Self {
        OutputData::Utf8(value.to_string())
    }
}

impl From<Vec<u8>> for OutputData {
    fn from(value: Vec<u8>) -> Self {
        OutputData::Binary(value)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct WriteFileOptions {
    /// Leave the file alone if it already exists on disk.
    pub never_overwrite: bool,
}

/// A single file of the output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileData {
    pub contents: OutputData,
    pub options: WriteFileOptions,
    /// Id of the task that wrote the file.
    pub task: String,
}

/// Command groups, in the order they are run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CommandType {
    /// Installs dependencies, e.g. `pnpm install`.
    Dependencies,
    /// Generates code from the written files, e.g. `prisma generate`.
    Generation,
    /// Anything else.
    Script,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOptions {
    /// Directory the command runs in, relative to the project.
    pub working_directory: Option<Utf8PathBuf>,
    /// Only run when one of these files was created or modified.
    pub only_if_changed: Vec<Utf8PathBuf>,
}

impl CommandOptions {
    pub fn working_directory(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.working_directory = Some(path.into());
        self
    }

    pub fn only_if_changed(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.only_if_changed.push(path.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostWriteCommand {
    pub command: String,
    pub command_type: CommandType,
    pub options: CommandOptions,
    /// Id of the task that registered the command.
    pub task: String,
}

/// The finalized result of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GeneratorOutput {
    pub files: BTreeMap<Utf8PathBuf, FileData>,
    /// Commands grouped by [`CommandType`], in registration order within a
    /// group.
    pub commands: Vec<PostWriteCommand>,
}

impl GeneratorOutput {
    pub fn file(&self, path: impl AsRef<Utf8Path>) -> Option<&FileData> {
        self.files.get(path.as_ref())
    }

    /// Commands allowed to run given what the write actually changed.
    pub fn eligible_commands(&self, changes: &ChangeSet) -> Vec<&PostWriteCommand> {
        self.commands
            .iter()
            .filter(|command| {
                command.options.only_if_changed.is_empty()
                    || command
                        .options
                        .only_if_changed
                        .iter()
                        .any(|path| changes.is_changed(path))
            })
            .collect()
    }
}

/// Accumulates the writes of all build steps of a run.
#[derive(Debug, Default)]
pub struct OutputAssembler {
    files: BTreeMap<Utf8PathBuf, FileData>,
    commands: Vec<PostWriteCommand>,
    conflicts: Vec<(Utf8PathBuf, String, String)>,
}

impl OutputAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_file(
        &mut self,
        task: &str,
        path: Utf8PathBuf,
        contents: OutputData,
        options: WriteFileOptions,
    ) -> Result<(), OutputError> {
        if let Some(existing) = self.files.get(&path) {
            let first = existing.task.clone();
            self.conflicts
                .push((path.clone(), first.clone(), task.to_string()));

            return Err(OutputError::DuplicateFileWrite {
                path,
                first,
                second: task.to_string(),
            });
        }

        tracing::debug!("{} writes {}", task, path);
        self.files.insert(
            path,
            FileData {
                contents,
                options,
                task: task.to_string(),
            },
        );

        Ok(())
    }

    pub fn add_command(&mut self, command: PostWriteCommand) {
        self.commands.push(command);
    }

    /// The first write conflict, even if the task that caused it swallowed
    /// the error.
    pub(crate) fn take_conflict(&mut self) -> Option<OutputError> {
        if self.conflicts.is_empty() {
            return None;
        }

        let (path, first, second) = self.conflicts.remove(0);
        self.conflicts.clear();
        Some(OutputError::DuplicateFileWrite {
            path,
            first,
            second,
        })
    }

    pub fn finish(self) -> GeneratorOutput {
        let mut commands = self.commands;
        // stable, keeps registration order within a group
        commands.sort_by_key(|command| command.command_type);

        GeneratorOutput {
            files: self.files,
            commands,
        }
    }
}

/// A reusable composite of builder calls.
pub trait BuilderAction {
    fn execute(self, builder: &mut OutputBuilder<'_>) -> anyhow::Result<()>;
}

impl<F> BuilderAction for F
where
    F: FnOnce(&mut OutputBuilder<'_>) -> anyhow::Result<()>,
{
    fn execute(self, builder: &mut OutputBuilder<'_>) -> anyhow::Result<()> {
        self(builder)
    }
}

/// The view of the output a single task gets during its build step.
pub struct OutputBuilder<'a> {
    assembler: &'a mut OutputAssembler,
    task: &'a str,
    templates: Option<&'a Utf8Path>,
    base_dir: Utf8PathBuf,
}

impl<'a> OutputBuilder<'a> {
    pub fn new(
        assembler: &'a mut OutputAssembler,
        task: &'a str,
        templates: Option<&'a Utf8Path>,
    ) -> Self {
        Self {
            assembler,
            task,
            templates,
            base_dir: Utf8PathBuf::new(),
        }
    }

    /// Id of the task this builder belongs to.
    pub fn task(&self) -> &str {
        self.task
    }

    pub fn base_directory(&self) -> &Utf8Path {
        &self.base_dir
    }

    /// Sets the directory relative paths are resolved against. The path is
    /// relative to the project directory.
    pub fn set_base_directory(&mut self, path: impl AsRef<Utf8Path>) -> Result<(), OutputError> {
        self.base_dir = project_path(path.as_ref())?;
        Ok(())
    }

    pub fn resolve_path(&self, path: impl AsRef<Utf8Path>) -> Result<Utf8PathBuf, OutputError> {
        project_path(&self.base_dir.join(path.as_ref()))
    }

    pub fn write_file(
        &mut self,
        path: impl AsRef<Utf8Path>,
        contents: impl Into<OutputData>,
    ) -> Result<(), OutputError> {
        self.write_file_with(path, contents, WriteFileOptions::default())
    }

    pub fn write_file_with(
        &mut self,
        path: impl AsRef<Utf8Path>,
        contents: impl Into<OutputData>,
        options: WriteFileOptions,
    ) -> Result<(), OutputError> {
        let path = self.resolve_path(path)?;
        self.assembler
            .write_file(self.task, path, contents.into(), options)
    }

    /// Reads a file from the template directory of the task's generator.
    pub fn read_template(&self, path: impl AsRef<Utf8Path>) -> Result<String, OutputError> {
        let path = path.as_ref();
        let templates = self
            .templates
            .ok_or_else(|| OutputError::NoTemplateDirectory {
                task: self.task.to_string(),
                path: path.to_path_buf(),
            })?;

        let relative = normalize_path(path);
        if relative.has_root()
            || matches!(
                relative.components().next(),
                Some(Utf8Component::ParentDir | Utf8Component::Prefix(..))
            )
        {
            return Err(OutputError::TemplateOutsideDirectory {
                task: self.task.to_string(),
                path: path.to_path_buf(),
            });
        }

        let full = templates.join(relative);
        fs::read_to_string(&full).map_err(|error| OutputError::Template { path: full, error })
    }

    /// Registers a command to run after the output has been written. The
    /// working directory and `only_if_changed` paths are resolved against the
    /// base directory.
    pub fn add_post_write_command(
        &mut self,
        command: impl Into<String>,
        command_type: CommandType,
        options: CommandOptions,
    ) -> Result<(), OutputError> {
        let working_directory = options
            .working_directory
            .map(|dir| self.resolve_path(dir))
            .transpose()?;

        let only_if_changed = options
            .only_if_changed
            .iter()
            .map(|path| self.resolve_path(path))
            .collect::<Result<Vec<_>, _>>()?;

        self.assembler.add_command(PostWriteCommand {
            command: command.into(),
            command_type,
            options: CommandOptions {
                working_directory,
                only_if_changed,
            },
            task: self.task.to_string(),
        });

        Ok(())
    }

    /// Runs an action against this builder. The base directory is restored
    /// afterwards.
    pub fn apply(&mut self, action: impl BuilderAction) -> anyhow::Result<()> {
        let base_dir = self.base_dir.clone();
        let result = action.execute(self);
        self.base_dir = base_dir;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_path() {
        assert_eq!(
            project_path(Utf8Path::new("/src/app.ts")).unwrap(),
            Utf8PathBuf::from("src/app.ts")
        );
        assert_eq!(
            project_path(Utf8Path::new("src/./lib/../app.ts")).unwrap(),
            Utf8PathBuf::from("src/app.ts")
        );
        assert!(matches!(
            project_path(Utf8Path::new("../outside.ts")),
            Err(OutputError::PathOutsideProject(_))
        ));
        assert!(matches!(
            project_path(Utf8Path::new("src/../../outside.ts")),
            Err(OutputError::PathOutsideProject(_))
        ));
    }

    #[test]
    fn test_duplicate_write_is_rejected() {
        let mut assembler = OutputAssembler::new();

        let mut builder = OutputBuilder::new(&mut assembler, "root#a", None);
        builder.write_file("/src/app.ts", "a").unwrap();

        let mut builder = OutputBuilder::new(&mut assembler, "root#b", None);
        let err = builder.write_file("src/app.ts", "b").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Duplicate file write to '/src/app.ts' by task 'root#b', already written by 'root#a'"
        );

        match err {
            OutputError::DuplicateFileWrite {
                path,
                first,
                second,
            } => {
                assert_eq!(path, Utf8PathBuf::from("src/app.ts"));
                assert_eq!(first, "root#a");
                assert_eq!(second, "root#b");
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn test_duplicate_write_with_equal_contents_is_rejected() {
        let mut assembler = OutputAssembler::new();

        let mut builder = OutputBuilder::new(&mut assembler, "root#a", None);
        builder.write_file("/src/app.ts", "same").unwrap();

        let mut builder = OutputBuilder::new(&mut assembler, "root#b", None);
        assert!(builder.write_file("/src/app.ts", "same").is_err());

        assert!(matches!(
            assembler.take_conflict(),
            Some(OutputError::DuplicateFileWrite { .. })
        ));
        assert!(assembler.take_conflict().is_none());
    }

    #[test]
    fn test_base_directory() {
        let mut assembler = OutputAssembler::new();
        let mut builder = OutputBuilder::new(&mut assembler, "root#a", None);

        builder.set_base_directory("packages/web").unwrap();
        assert_eq!(
            builder.resolve_path("src/index.ts").unwrap(),
            Utf8PathBuf::from("packages/web/src/index.ts")
        );
        assert_eq!(
            builder.resolve_path("/README.md").unwrap(),
            Utf8PathBuf::from("README.md")
        );

        builder.write_file("package.json", "{}").unwrap();
        let output = assembler.finish();
        assert!(output.file("packages/web/package.json").is_some());
    }

    #[test]
    fn test_apply_restores_base_directory() {
        let mut assembler = OutputAssembler::new();
        let mut builder = OutputBuilder::new(&mut assembler, "root#a", None);

        builder
            .apply(|builder: &mut OutputBuilder<'_>| {
                builder.set_base_directory("nested")?;
                builder.write_file("inner.txt", "inner")?;
                Ok(())
            })
            .unwrap();

        assert_eq!(builder.base_directory(), Utf8Path::new(""));
        builder.write_file("outer.txt", "outer").unwrap();

        let output = assembler.finish();
        let paths: Vec<_> = output.files.keys().map(|p| p.as_str()).collect();
        assert_eq!(paths, vec!["nested/inner.txt", "outer.txt"]);
    }

    #[test]
    fn test_commands_are_grouped() {
        let mut assembler = OutputAssembler::new();
        let mut builder = OutputBuilder::new(&mut assembler, "root#a", None);

        builder
            .add_post_write_command("lint", CommandType::Script, CommandOptions::default())
            .unwrap();
        builder
            .add_post_write_command("codegen", CommandType::Generation, CommandOptions::default())
            .unwrap();
        builder
            .add_post_write_command("install", CommandType::Dependencies, CommandOptions::default())
            .unwrap();
        builder
            .add_post_write_command("format", CommandType::Script, CommandOptions::default())
            .unwrap();

        let output = assembler.finish();
        let commands: Vec<_> = output.commands.iter().map(|c| c.command.as_str()).collect();
        assert_eq!(commands, vec!["install", "codegen", "lint", "format"]);
    }

    #[test]
    fn test_command_paths_are_resolved() {
        let mut assembler = OutputAssembler::new();
        let mut builder = OutputBuilder::new(&mut assembler, "root#a", None);

        builder.set_base_directory("web").unwrap();
        builder
            .add_post_write_command(
                "pnpm install",
                CommandType::Dependencies,
                CommandOptions::default()
                    .working_directory(".")
                    .only_if_changed("package.json"),
            )
            .unwrap();

        let output = assembler.finish();
        let options = &output.commands[0].options;
        assert_eq!(options.working_directory, Some(Utf8PathBuf::from("web")));
        assert_eq!(options.only_if_changed, vec![Utf8PathBuf::from("web/package.json")]);
    }

    #[test]
    fn test_read_template() {
        let dir = tempfile::tempdir().unwrap();
        let templates = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        fs::write(templates.join("index.ts"), "export {};").unwrap();

        let mut assembler = OutputAssembler::new();
        let builder = OutputBuilder::new(&mut assembler, "root#a", Some(&templates));
        assert_eq!(builder.read_template("index.ts").unwrap(), "export {};");
        assert!(matches!(
            builder.read_template("missing.ts"),
            Err(OutputError::Template { .. })
        ));

        // stays inside the template directory
        fs::create_dir(templates.join("web")).unwrap();
        fs::write(templates.join("web/app.ts"), "app").unwrap();
        assert_eq!(builder.read_template("web/./../web/app.ts").unwrap(), "app");
        for path in ["../secret.txt", "web/../../secret.txt", "/etc/passwd"] {
            assert!(
                matches!(
                    builder.read_template(path),
                    Err(OutputError::TemplateOutsideDirectory { .. })
                ),
                "{path} was read"
            );
        }

        let mut assembler = OutputAssembler::new();
        let builder = OutputBuilder::new(&mut assembler, "root#a", None);
        assert!(matches!(
            builder.read_template("index.ts"),
            Err(OutputError::NoTemplateDirectory { .. })
        ));
    }
}
