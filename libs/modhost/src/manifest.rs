//! YAML manifest image format.
//!
//! A manifest declares a module's name, its references and its exported
//! types with their fields and methods. Instances are plain field bags: a
//! declared method is found by name and argument count, and only records
//! that it was called.
//!
//! ```yaml
//! name: Game.Client
//! references: [CoreScripts]
//! types:
//!   - name: Game.Player
//!     kind: entity
//!     unique_id: 7
//!     methods:
//!       - { name: on_update, args: 1 }
//!     fields:
//!       - { name: speed, default: 2.5 }
//!       - { name: health, public: false, serialize: true, default: 100 }
//! ```

use std::any::Any;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::image::{FieldDescriptor, ImageFormat, ModuleImage, TypeDescriptor, TypeKind};
use crate::object::{EntityBinding, InvokeError, ScriptObject};

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("invalid manifest")]
    Parse(#[from] serde_yaml::Error),

    #[error("manifest has an empty module name")]
    EmptyName,

    #[error("type '{0}' is declared more than once")]
    DuplicateType(String),

    #[error("type '{type_name}' declares field '{field}' more than once")]
    DuplicateField { type_name: String, field: String },

    #[error("type '{type_name}' declares method '{method}' with {arity} args more than once")]
    DuplicateMethod {
        type_name: String,
        method: String,
        arity: usize,
    },
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawManifest {
    name: String,
    #[serde(default)]
    references: Vec<String>,
    #[serde(default)]
    types: Vec<RawType>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawType {
    name: String,
    #[serde(default)]
    kind: TypeKind,
    #[serde(default)]
    unique_id: Option<i64>,
    #[serde(default)]
    fields: Vec<RawField>,
    #[serde(default)]
    methods: Vec<MethodSignature>,
}

/// A callable method: name plus argument count.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MethodSignature {
    pub name: String,
    #[serde(default, rename = "args")]
    pub arity: usize,
}

impl MethodSignature {
    fn matches(&self, name: &str, arity: usize) -> bool {
        self.name == name && self.arity == arity
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawField {
    name: String,
    #[serde(default = "default_public")]
    public: bool,
    #[serde(default)]
    serialize: bool,
    #[serde(default)]
    default: Value,
}

fn default_public() -> bool {
    true
}

struct TypeTemplate {
    defaults: BTreeMap<String, Value>,
    methods: Vec<MethodSignature>,
}

pub struct ManifestImage {
    name: String,
    references: Vec<String>,
    types: Vec<TypeDescriptor>,
    templates: Vec<TypeTemplate>,
}

impl ManifestImage {
    pub fn parse(bytes: &[u8]) -> Result<Self, ManifestError> {
        let raw: RawManifest = serde_yaml::from_slice(bytes)?;
        if raw.name.trim().is_empty() {
            return Err(ManifestError::EmptyName);
        }

        let mut seen = HashSet::new();
        let mut types = Vec::with_capacity(raw.types.len());
        let mut templates = Vec::with_capacity(raw.types.len());

        for raw_type in raw.types {
            if !seen.insert(raw_type.name.clone()) {
                return Err(ManifestError::DuplicateType(raw_type.name));
            }

            let mut descriptor = TypeDescriptor::new(raw_type.name.clone(), raw_type.kind);
            descriptor.unique_id = raw_type.unique_id;
            let mut defaults = BTreeMap::new();

            for field in raw_type.fields {
                if defaults.contains_key(&field.name) {
                    return Err(ManifestError::DuplicateField {
                        type_name: raw_type.name,
                        field: field.name,
                    });
                }
                descriptor.fields.push(FieldDescriptor {
                    name: field.name.clone(),
                    public: field.public,
                    serialize: field.serialize,
                });
                defaults.insert(field.name, field.default);
            }

            {
                let mut signatures = HashSet::new();
                for method in &raw_type.methods {
                    if !signatures.insert((method.name.as_str(), method.arity)) {
                        return Err(ManifestError::DuplicateMethod {
                            type_name: raw_type.name.clone(),
                            method: method.name.clone(),
                            arity: method.arity,
                        });
                    }
                }
            }

            types.push(descriptor);
            templates.push(TypeTemplate {
                defaults,
                methods: raw_type.methods,
            });
        }

        Ok(Self {
            name: raw.name,
            references: raw.references,
            types,
            templates,
        })
    }
}

impl ModuleImage for ManifestImage {
    fn name(&self) -> &str {
        &self.name
    }

    fn references(&self) -> &[String] {
        &self.references
    }

    fn types(&self) -> &[TypeDescriptor] {
        &self.types
    }

    fn instantiate(&self, type_name: &str) -> Option<Box<dyn ScriptObject>> {
        let index = self.types.iter().position(|t| t.name == type_name)?;
        let template = &self.templates[index];
        Some(Box::new(ManifestObject {
            fields: template.defaults.clone(),
            methods: template.methods.clone(),
            invocations: BTreeMap::new(),
            binding: None,
        }))
    }
}

/// Instance of a manifest-declared type.
#[derive(Debug, Clone, Default)]
pub struct ManifestObject {
    fields: BTreeMap<String, Value>,
    methods: Vec<MethodSignature>,
    invocations: BTreeMap<String, u64>,
    binding: Option<EntityBinding>,
}

impl ManifestObject {
    pub fn binding(&self) -> Option<EntityBinding> {
        self.binding
    }

    pub fn methods(&self) -> &[MethodSignature] {
        &self.methods
    }

    /// How many times `method` has been invoked on this instance.
    pub fn invocations(&self, method: &str) -> u64 {
        self.invocations.get(method).copied().unwrap_or(0)
    }
}

impl ScriptObject for ManifestObject {
    fn get_field(&self, name: &str) -> Option<Value> {
        self.fields.get(name).cloned()
    }

    fn set_field(&mut self, name: &str, value: Value) -> bool {
        match self.fields.get_mut(name) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    fn invoke(&mut self, name: &str, args: &[Value]) -> Result<Option<Value>, InvokeError> {
        if !self.methods.iter().any(|m| m.matches(name, args.len())) {
            return Err(InvokeError::MethodNotFound {
                name: name.to_owned(),
                arity: args.len(),
            });
        }
        *self.invocations.entry(name.to_owned()).or_default() += 1;
        Ok(None)
    }

    fn bind(&mut self, binding: EntityBinding) {
        self.binding = Some(binding);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// [`ImageFormat`] for `.yaml` manifests.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManifestFormat;

impl ImageFormat for ManifestFormat {
    fn extension(&self) -> &str {
        "yaml"
    }

    fn decode(&self, _origin: &Path, bytes: &[u8]) -> anyhow::Result<Box<dyn ModuleImage>> {
        Ok(Box::new(ManifestImage::parse(bytes)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const CLIENT: &str = r#"
name: Game.Client
references: [CoreScripts]
types:
  - name: Game.Player
    kind: entity
    unique_id: 7
    methods:
      - { name: on_update, args: 1 }
      - { name: jump }
    fields:
      - { name: speed, default: 2.5 }
      - { name: health, public: false, serialize: true, default: 100 }
      - { name: GENERATED_UniqueId, default: 7 }
  - name: Game.Helpers
"#;

    #[test]
    fn parse_reads_types_and_defaults() {
        let image = ManifestImage::parse(CLIENT.as_bytes()).unwrap();
        assert_eq!(image.name(), "Game.Client");
        assert_eq!(image.references(), ["CoreScripts".to_owned()]);
        assert_eq!(image.types().len(), 2);

        let player = image.find_type("Game.Player").unwrap();
        assert_eq!(player.kind, TypeKind::Entity);
        assert_eq!(player.unique_id, Some(7));
        assert_eq!(
            player.serializable_fields().collect::<Vec<_>>(),
            vec!["speed", "health"]
        );

        let helpers = image.find_type("Game.Helpers").unwrap();
        assert_eq!(helpers.kind, TypeKind::Plain);
    }

    #[test]
    fn instances_start_from_defaults_and_record_calls() {
        let image = ManifestImage::parse(CLIENT.as_bytes()).unwrap();
        let mut player = image.instantiate("Game.Player").unwrap();
        assert_eq!(player.get_field("speed"), Some(json!(2.5)));
        assert!(player.set_field("speed", json!(4.0)));
        assert!(!player.set_field("mana", json!(1)));

        player.invoke("on_update", &[json!(0.016)]).unwrap();
        player.invoke("jump", &[]).unwrap();
        assert!(player.invoke("fly", &[]).is_err());

        let calls = player
            .as_any()
            .downcast_ref::<ManifestObject>()
            .map(|p| p.invocations("on_update"));
        assert_eq!(calls, Some(1));
        assert!(image.instantiate("Game.Missing").is_none());
    }

    #[test]
    fn methods_are_matched_by_name_and_arity() {
        let image = ManifestImage::parse(CLIENT.as_bytes()).unwrap();
        let mut player = image.instantiate("Game.Player").unwrap();

        match player.invoke("on_update", &[json!(1), json!(2), json!(3)]) {
            Err(InvokeError::MethodNotFound { name, arity }) => {
                assert_eq!(name, "on_update");
                assert_eq!(arity, 3);
            }
            other => panic!("expected MethodNotFound, got {other:?}"),
        }
        assert!(player.invoke("on_update", &[]).is_err());
        assert!(player.invoke("jump", &[json!(1)]).is_err());

        let player = player.as_any().downcast_ref::<ManifestObject>().unwrap();
        assert_eq!(player.invocations("on_update"), 0);
        assert_eq!(
            player.methods()[0],
            MethodSignature {
                name: "on_update".into(),
                arity: 1
            }
        );
    }

    #[test]
    fn duplicate_method_signatures_are_rejected() {
        let yaml = "name: M\ntypes:\n  - name: A\n    methods:\n      - { name: go, args: 1 }\n      - { name: go, args: 1 }\n      - { name: go }\n";
        match ManifestImage::parse(yaml.as_bytes()) {
            Err(ManifestError::DuplicateMethod { method, arity, .. }) => {
                assert_eq!(method, "go");
                assert_eq!(arity, 1);
            }
            other => panic!("expected DuplicateMethod, got {:?}", other.err()),
        }
    }

    #[test]
    fn duplicate_types_are_rejected() {
        let yaml = "name: M\ntypes:\n  - name: A\n  - name: A\n";
        match ManifestImage::parse(yaml.as_bytes()) {
            Err(ManifestError::DuplicateType(name)) => assert_eq!(name, "A"),
            other => panic!("expected DuplicateType, got {:?}", other.err()),
        }
    }

    #[test]
    fn duplicate_fields_are_rejected() {
        let yaml = "name: M\ntypes:\n  - name: A\n    fields:\n      - { name: x }\n      - { name: x }\n";
        assert!(matches!(
            ManifestImage::parse(yaml.as_bytes()),
            Err(ManifestError::DuplicateField { .. })
        ));
    }

    #[test]
    fn unknown_keys_and_empty_names_are_rejected() {
        assert!(matches!(
            ManifestImage::parse(b"name: M\nflavour: x\n"),
            Err(ManifestError::Parse(_))
        ));
        assert!(matches!(
            ManifestImage::parse(b"name: '  '\n"),
            Err(ManifestError::EmptyName)
        ));
    }
}
