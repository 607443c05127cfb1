//! Typed capability tags shared between tasks.
//!
//! A [`ProviderType<T>`] names a capability and carries the Rust type `T` of
//! the value that implements it. Producers turn it into a
//! [`ProviderExport`], consumers into a [`ProviderDependency`]. Both views are
//! type-erased into a [`ProviderInfo`] so the engine can store them side by
//! side, while the [`TypeId`] of `T` is kept around to validate that a
//! consumer receives exactly the type the producer exports.

use std::any::{TypeId, type_name};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::marker::PhantomData;

use crate::error::ScopeError;

/// Type-erased description of a provider type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderInfo {
    pub name: Cow<'static, str>,
    pub read_only: bool,
    pub(crate) type_id: TypeId,
    pub(crate) type_name: &'static str,
}

/// An immutable capability tag.
///
/// ```rust
/// use genweave::ProviderType;
///
/// struct NodeProvider;
///
/// const NODE: ProviderType<NodeProvider> = ProviderType::new("core/node");
/// let dependency = NODE.dependency().optional();
/// assert!(dependency.is_optional());
/// ```
pub struct ProviderType<T> {
    name: &'static str,
    read_only: bool,
    _phantom: PhantomData<fn() -> T>,
}

impl<T> Clone for ProviderType<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ProviderType<T> {}

impl<T> std::fmt::Debug for ProviderType<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderType")
            .field("name", &self.name)
            .field("read_only", &self.read_only)
            .finish()
    }
}

impl<T: Send + Sync + 'static> ProviderType<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            read_only: false,
            _phantom: PhantomData,
        }
    }

    /// Marks consumers of this provider as unable to mutate it.
    pub const fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn info(&self) -> ProviderInfo {
        ProviderInfo {
            name: Cow::Borrowed(self.name),
            read_only: self.read_only,
            type_id: TypeId::of::<T>(),
            type_name: type_name::<T>(),
        }
    }

    /// Consumer-side view of this provider.
    pub fn dependency(&self) -> ProviderDependency {
        ProviderDependency {
            provider: self.info(),
            optional: false,
            export: None,
            conflicting_export: None,
            modified_in_build: false,
        }
    }

    /// Producer-side view of this provider, visible in `scope`.
    pub fn export(&self, scope: &ProviderExportScope) -> ProviderExport {
        ProviderExport {
            provider: self.info(),
            scopes: vec![scope.clone()],
            export: None,
            depends_on: Vec::new(),
        }
    }
}

/// A request for a provider made by a task.
#[derive(Debug, Clone)]
pub struct ProviderDependency {
    pub(crate) provider: ProviderInfo,
    pub(crate) optional: bool,
    pub(crate) export: Option<String>,
    pub(crate) conflicting_export: Option<String>,
    pub(crate) modified_in_build: bool,
}

impl ProviderDependency {
    /// Absence of a matching export is not an error.
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Only an export tagged with `export` satisfies this dependency.
    pub fn reference(mut self, export: impl Into<String>) -> Self {
        let export = export.into();

        match &self.export {
            Some(pinned) if *pinned != export => self.conflicting_export = Some(export),
            _ => self.export = Some(export),
        }

        self
    }

    pub fn optional_reference(self, export: impl Into<String>) -> Self {
        self.reference(export).optional()
    }

    /// The consumer mutates the provider during its build step rather than
    /// during its init step.
    pub fn modified_in_build(mut self) -> Self {
        self.modified_in_build = true;
        self
    }

    pub fn provider(&self) -> &ProviderInfo {
        &self.provider
    }

    pub fn is_optional(&self) -> bool {
        self.optional
    }

    pub fn export_name(&self) -> Option<&str> {
        self.export.as_deref()
    }

    pub fn is_modified_in_build(&self) -> bool {
        self.modified_in_build
    }

    pub(crate) fn key(&self) -> ProviderKey {
        ProviderKey {
            provider: self.provider.name.to_string(),
            export: self.export.clone(),
        }
    }
}

/// A named visibility boundary offered by generator entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProviderExportScope {
    name: Cow<'static, str>,
}

impl ProviderExportScope {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name: Cow::Borrowed(name),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl From<String> for ProviderExportScope {
    fn from(name: String) -> Self {
        Self {
            name: Cow::Owned(name),
        }
    }
}

impl Display for ProviderExportScope {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

/// A grant of a provider within one or more scopes.
#[derive(Debug, Clone)]
pub struct ProviderExport {
    pub(crate) provider: ProviderInfo,
    pub(crate) scopes: Vec<ProviderExportScope>,
    pub(crate) export: Option<String>,
    pub(crate) depends_on: Vec<String>,
}

impl ProviderExport {
    /// Also make the provider visible in `scope`.
    pub fn and_scope(mut self, scope: &ProviderExportScope) -> Self {
        if !self.scopes.contains(scope) {
            self.scopes.push(scope.clone());
        }
        self
    }

    /// Tags this export with a variant name, so several exports of the same
    /// provider can coexist in one scope.
    pub fn named(mut self, export: impl Into<String>) -> Self {
        self.export = Some(export.into());
        self
    }

    /// This export is only final once the export under `key` of the same
    /// task has been settled by all of its mutators.
    pub fn depends_on(mut self, key: impl Into<String>) -> Self {
        self.depends_on.push(key.into());
        self
    }

    pub fn provider(&self) -> &ProviderInfo {
        &self.provider
    }

    pub fn scopes(&self) -> &[ProviderExportScope] {
        &self.scopes
    }

    pub fn export_name(&self) -> Option<&str> {
        self.export.as_deref()
    }

    pub(crate) fn key(&self) -> ProviderKey {
        ProviderKey {
            provider: self.provider.name.to_string(),
            export: self.export.clone(),
        }
    }
}

/// Lookup key of an export at its anchor: provider name plus variant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProviderKey {
    pub provider: String,
    pub export: Option<String>,
}

impl ProviderKey {
    pub fn new(provider: impl Into<String>, export: Option<&str>) -> Self {
        Self {
            provider: provider.into(),
            export: export.map(str::to_string),
        }
    }
}

impl Display for ProviderKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.export {
            Some(export) => write!(f, "{}({})", self.provider, export),
            None => f.write_str(&self.provider),
        }
    }
}

/// Maps provider names to the capability type they were declared with.
#[derive(Debug, Default)]
pub(crate) struct ProviderRegistry {
    types: HashMap<String, (TypeId, &'static str)>,
}

impl ProviderRegistry {
    pub(crate) fn register(&mut self, info: &ProviderInfo, task: &str) -> Result<(), ScopeError> {
        let (type_id, type_name) = *self
            .types
            .entry(info.name.to_string())
            .or_insert((info.type_id, info.type_name));

        if type_id != info.type_id {
            return Err(ScopeError::ProviderTypeMismatch {
                provider: info.name.to_string(),
                task: task.to_string(),
                expected: type_name,
                found: info.type_name,
            });
        }

        Ok(())
    }
}
