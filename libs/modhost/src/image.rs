//! Reflection over loaded code units.
//!
//! A [`ModuleImage`] is what a module file decodes into: a name, the names of
//! the images it references, and the types it exports. An [`ImageFormat`]
//! turns raw file bytes into an image; the loader never touches the file again
//! after reading it.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::object::ScriptObject;

/// Field names starting with this prefix are generated plumbing and never serialized.
pub const GENERATED_PREFIX: &str = "GENERATED_";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeKind {
    /// Scripted entity bound to a native entity id.
    Entity,
    /// Component attached to an entity.
    Component,
    #[default]
    Plain,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub name: String,
    pub public: bool,
    /// Explicitly marked for serialization even if not public.
    pub serialize: bool,
}

impl FieldDescriptor {
    pub fn public(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            public: true,
            serialize: false,
        }
    }

    pub fn private(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            public: false,
            serialize: false,
        }
    }

    #[must_use]
    pub fn serialized(mut self) -> Self {
        self.serialize = true;
        self
    }

    pub fn is_generated(&self) -> bool {
        self.name.starts_with(GENERATED_PREFIX)
    }

    pub fn is_serializable(&self) -> bool {
        (self.public || self.serialize) && !self.is_generated()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDescriptor {
    pub name: String,
    pub kind: TypeKind,
    pub unique_id: Option<i64>,
    pub fields: Vec<FieldDescriptor>,
}

impl TypeDescriptor {
    pub fn new(name: impl Into<String>, kind: TypeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            unique_id: None,
            fields: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_unique_id(mut self, id: i64) -> Self {
        self.unique_id = Some(id);
        self
    }

    #[must_use]
    pub fn with_field(mut self, field: FieldDescriptor) -> Self {
        self.fields.push(field);
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn serializable_fields(&self) -> impl Iterator<Item = &str> + '_ {
        self.fields
            .iter()
            .filter(|f| f.is_serializable())
            .map(|f| f.name.as_str())
    }

    pub fn is_instantiable(&self) -> bool {
        matches!(self.kind, TypeKind::Entity | TypeKind::Component)
    }
}

/// A decoded code unit.
pub trait ModuleImage: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Names of other images this one needs; resolved when the image is loaded.
    fn references(&self) -> &[String];

    fn types(&self) -> &[TypeDescriptor];

    /// Creates a fresh instance of an exported type.
    fn instantiate(&self, type_name: &str) -> Option<Box<dyn ScriptObject>>;

    fn find_type(&self, name: &str) -> Option<&TypeDescriptor> {
        self.types().iter().find(|t| t.name == name)
    }
}

/// Decodes module files of one on-disk format.
pub trait ImageFormat: Send + Sync + 'static {
    /// File extension (without the dot) used when probing for dependencies by name.
    fn extension(&self) -> &str;

    fn decode(&self, origin: &Path, bytes: &[u8]) -> anyhow::Result<Box<dyn ModuleImage>>;
}
