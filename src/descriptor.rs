//! Generator descriptors and the loader for descriptor files.
//!
//! A descriptor is a JSON document naming the generator to instantiate, an
//! optional instance name, the child slots of the entry and any other fields,
//! which are handed over to the generator as its configuration:
//!
//! ```json
//! {
//!   "generator": "core/app",
//!   "port": 3000,
//!   "children": {
//!     "server": { "generator": "core/server" },
//!     "features": [
//!       { "generator": "core/feature", "name": "auth" },
//!       "features/billing"
//!     ]
//!   }
//! }
//! ```
//!
//! String values are references to other descriptor files, resolved relative
//! to the project directory (`.json` is appended when the reference has no
//! extension).

use std::collections::BTreeMap;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::DescriptorError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    /// Name of the registered generator.
    pub generator: String,
    /// Instance name, required for elements of multi-valued child slots.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub children: BTreeMap<String, ChildSlot>,
    /// Everything else, validated by the generator itself.
    #[serde(flatten)]
    pub config: Map<String, Value>,
}

impl Descriptor {
    pub fn new(generator: impl Into<String>) -> Self {
        Self {
            generator: generator.into(),
            name: None,
            children: BTreeMap::new(),
            config: Map::new(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    pub fn child(mut self, slot: impl Into<String>, child: impl Into<ChildSlot>) -> Self {
        self.children.insert(slot.into(), child.into());
        self
    }

    /// The generator configuration as a JSON object.
    pub fn config_value(&self) -> Value {
        Value::Object(self.config.clone())
    }
}

/// The value of a child slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChildSlot {
    /// Reference to an external descriptor file.
    Reference(String),
    /// Multi-valued slot, every element needs an instance name.
    Many(Vec<ChildEntry>),
    One(Box<Descriptor>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChildEntry {
    Reference(String),
    Inline(Descriptor),
}

impl From<Descriptor> for ChildSlot {
    fn from(descriptor: Descriptor) -> Self {
        ChildSlot::One(Box::new(descriptor))
    }
}

impl From<Vec<Descriptor>> for ChildSlot {
    fn from(descriptors: Vec<Descriptor>) -> Self {
        ChildSlot::Many(descriptors.into_iter().map(ChildEntry::Inline).collect())
    }
}

impl From<&str> for ChildSlot {
    fn from(reference: &str) -> Self {
        ChildSlot::Reference(reference.to_string())
    }
}

/// Reads descriptor files relative to the project directory.
#[derive(Debug, Clone)]
pub struct DescriptorLoader {
    project_dir: Utf8PathBuf,
}

impl DescriptorLoader {
    pub fn new(project_dir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
        }
    }

    pub fn project_dir(&self) -> &Utf8Path {
        &self.project_dir
    }

    /// Maps a reference onto the file it points to.
    pub fn resolve(&self, reference: &str) -> Utf8PathBuf {
        let path = self.project_dir.join(reference);

        match path.extension() {
            Some(_) => path,
            None => path.with_extension("json"),
        }
    }

    pub fn load(&self, reference: &str) -> Result<Descriptor, DescriptorError> {
        self.load_file(&self.resolve(reference))
    }

    pub fn load_file(&self, path: &Utf8Path) -> Result<Descriptor, DescriptorError> {
        tracing::debug!("loading descriptor {}", path);

        let text = fs::read_to_string(path).map_err(|error| DescriptorError::Read {
            path: path.to_path_buf(),
            error,
        })?;

        Self::parse(&text, path)
    }

    pub fn parse(text: &str, origin: &Utf8Path) -> Result<Descriptor, DescriptorError> {
        serde_json::from_str(text).map_err(|error| DescriptorError::Parse {
            path: origin.to_path_buf(),
            error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_children() {
        let descriptor: Descriptor = serde_json::from_value(json!({
            "generator": "core/app",
            "port": 3000,
            "children": {
                "server": { "generator": "core/server" },
                "shared": "shared/config",
                "features": [
                    { "generator": "core/feature", "name": "auth" },
                    "features/billing"
                ]
            }
        }))
        .unwrap();

        assert_eq!(descriptor.generator, "core/app");
        assert_eq!(descriptor.config.get("port"), Some(&json!(3000)));
        assert!(!descriptor.config.contains_key("children"));

        assert!(matches!(
            descriptor.children.get("server"),
            Some(ChildSlot::One(child)) if child.generator == "core/server"
        ));
        assert_eq!(
            descriptor.children.get("shared"),
            Some(&ChildSlot::Reference("shared/config".into()))
        );

        match descriptor.children.get("features") {
            Some(ChildSlot::Many(items)) => {
                assert_eq!(items.len(), 2);
                assert!(matches!(&items[0], ChildEntry::Inline(d) if d.name.as_deref() == Some("auth")));
                assert_eq!(items[1], ChildEntry::Reference("features/billing".into()));
            }
            other => panic!("unexpected slot {other:?}"),
        }
    }

    #[test]
    fn test_missing_generator_is_rejected() {
        let result = DescriptorLoader::parse(r#"{ "name": "x" }"#, Utf8Path::new("x.json"));
        assert!(matches!(result, Err(DescriptorError::Parse { .. })));
    }

    #[test]
    fn test_resolve_appends_extension() {
        let loader = DescriptorLoader::new("/project");
        assert_eq!(
            loader.resolve("features/auth"),
            Utf8PathBuf::from("/project/features/auth.json")
        );
        assert_eq!(
            loader.resolve("features/auth.json"),
            Utf8PathBuf::from("/project/features/auth.json")
        );
    }

    #[test]
    fn test_load_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        fs::create_dir_all(root.join("features")).unwrap();
        fs::write(
            root.join("features/auth.json"),
            r#"{ "generator": "core/feature", "name": "auth" }"#,
        )
        .unwrap();

        let loader = DescriptorLoader::new(root.clone());
        let descriptor = loader.load("features/auth").unwrap();
        assert_eq!(descriptor, Descriptor::new("core/feature").named("auth"));

        let missing = loader.load("features/none");
        assert!(matches!(missing, Err(DescriptorError::Read { .. })));
    }

    #[test]
    fn test_builder_roundtrip() {
        let descriptor = Descriptor::new("core/app")
            .with("port", 3000)
            .child("server", Descriptor::new("core/server"));

        let value = serde_json::to_value(&descriptor).unwrap();
        assert_eq!(
            value,
            json!({
                "generator": "core/app",
                "port": 3000,
                "children": { "server": { "generator": "core/server" } }
            })
        );
    }
}
