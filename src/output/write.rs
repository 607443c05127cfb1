use std::collections::BTreeMap;
use std::fs;
use std::process::Command;

use camino::{Utf8Path, Utf8PathBuf};
use console::style;

use crate::core::Hash32;
use crate::error::OutputError;
use crate::output::{GeneratorOutput, WriteFileOptions};

/// What writing a file does to the file already on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileChange {
    Created,
    Modified,
    Unchanged,
    /// Exists and was written with `never_overwrite`, left untouched.
    Preserved,
}

impl FileChange {
    fn classify(options: &WriteFileOptions, new: Hash32, old: Option<Hash32>) -> Self {
        match old {
            None => FileChange::Created,
            Some(_) if options.never_overwrite => FileChange::Preserved,
            Some(old) if old == new => FileChange::Unchanged,
            Some(_) => FileChange::Modified,
        }
    }
}

/// The effect of an output on a previous state of the project.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    changes: BTreeMap<Utf8PathBuf, FileChange>,
}

impl ChangeSet {
    /// Compares the output against previously written contents, as returned
    /// by `prior` for a project-relative path.
    pub fn from_prior<F>(output: &GeneratorOutput, mut prior: F) -> Self
    where
        F: FnMut(&Utf8Path) -> Option<Vec<u8>>,
    {
        let changes = output
            .files
            .iter()
            .map(|(path, file)| {
                let new = Hash32::hash(&file.contents);
                let old = prior(path).map(Hash32::hash);
                (path.clone(), FileChange::classify(&file.options, new, old))
            })
            .collect();

        Self { changes }
    }

    /// Compares the output against the files in the project directory.
    pub fn from_disk(output: &GeneratorOutput, project_dir: &Utf8Path) -> Result<Self, OutputError> {
        let mut changes = BTreeMap::new();

        for (path, file) in &output.files {
            let disk = project_dir.join(path);
            let old = if disk.is_file() {
                Some(Hash32::hash_file(&disk)?)
            } else {
                None
            };

            let new = Hash32::hash(&file.contents);
            changes.insert(path.clone(), FileChange::classify(&file.options, new, old));
        }

        Ok(Self { changes })
    }

    pub fn get(&self, path: impl AsRef<Utf8Path>) -> Option<FileChange> {
        self.changes.get(path.as_ref()).copied()
    }

    /// Whether the file was created or modified.
    pub fn is_changed(&self, path: impl AsRef<Utf8Path>) -> bool {
        matches!(
            self.get(path),
            Some(FileChange::Created | FileChange::Modified)
        )
    }

    pub fn changed(&self) -> impl Iterator<Item = &Utf8Path> {
        self.changes
            .iter()
            .filter(|(_, change)| matches!(change, FileChange::Created | FileChange::Modified))
            .map(|(path, _)| path.as_path())
    }
}

#[derive(Debug, Clone)]
pub struct WriteOptions {
    /// Run the eligible post-write commands after writing.
    pub run_commands: bool,
    /// Compute the changes, but don't touch the disk.
    pub dry_run: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            run_commands: true,
            dry_run: false,
        }
    }
}

#[derive(Debug, Default)]
pub struct WriteReport {
    pub changes: ChangeSet,
    pub commands_run: Vec<String>,
    pub commands_skipped: Vec<String>,
}

/// Writes the output into the project directory, then runs the commands
/// whose `only_if_changed` files actually changed, group by group.
pub fn write_output(
    output: &GeneratorOutput,
    project_dir: &Utf8Path,
    options: &WriteOptions,
) -> Result<WriteReport, OutputError> {
    let changes = ChangeSet::from_disk(output, project_dir)?;

    if !options.dry_run {
        for (path, file) in &output.files {
            if !changes.is_changed(path) {
                continue;
            }

            let disk = project_dir.join(path);
            if let Some(parent) = disk.parent() {
                fs::create_dir_all(parent)?;
            }

            tracing::debug!("writing {}", disk);
            fs::write(&disk, &file.contents)?;
        }
    }

    let eligible = output.eligible_commands(&changes);
    let mut report = WriteReport::default();

    for command in &output.commands {
        let allowed = eligible.iter().any(|e| std::ptr::eq(*e, command));
        if !allowed || !options.run_commands || options.dry_run {
            report.commands_skipped.push(command.command.clone());
            continue;
        }

        let dir = match &command.options.working_directory {
            Some(dir) => project_dir.join(dir),
            None => project_dir.to_path_buf(),
        };

        tracing::info!("{} {}", style("Running").cyan(), command.command);
        let status = Command::new("sh")
            .arg("-c")
            .arg(&command.command)
            .current_dir(&dir)
            .status()?;

        if !status.success() {
            return Err(OutputError::Command {
                command: command.command.clone(),
                status: status.to_string(),
            });
        }

        report.commands_run.push(command.command.clone());
    }

    report.changes = changes;
    Ok(report)
}
