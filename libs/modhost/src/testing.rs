//! Shared fixtures for unit tests.

use std::any::Any;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{json, Value};
use tempfile::TempDir;

use crate::loader::{Module, ModuleLoader};
use crate::manifest::ManifestFormat;
use crate::object::{EntityBinding, InvokeError, ScriptObject};

pub(crate) const CORE_MANIFEST: &str = r#"
name: CoreScripts
types:
  - name: Core.Transform
    kind: component
    unique_id: 1
    fields:
      - { name: x, default: 0.0 }
      - { name: y, default: 0.0 }
"#;

pub(crate) const CLIENT_MANIFEST: &str = r#"
name: Game.Client
references: [CoreScripts]
types:
  - name: Game.Player
    kind: entity
    unique_id: 42
    methods:
      - { name: on_update, args: 1 }
      - { name: jump }
    fields:
      - { name: speed, default: 2.5 }
      - { name: cache, public: false }
      - { name: health, public: false, serialize: true, default: 100 }
      - { name: GENERATED_UniqueId, default: 42 }
  - name: Game.Health
    kind: component
    unique_id: 43
    fields:
      - { name: value, default: 100 }
"#;

pub(crate) fn write_manifest(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(format!("{name}.yaml"));
    fs::write(&path, contents).unwrap();
    path
}

/// Core in `core/`, client in `client/` with a stray copy of the core next to it.
pub(crate) struct Fixture {
    pub(crate) dir: TempDir,
    pub(crate) loader: ModuleLoader,
}

impl Fixture {
    pub(crate) fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let core = dir.path().join("core");
        let client = dir.path().join("client");
        fs::create_dir_all(&core).unwrap();
        fs::create_dir_all(&client).unwrap();

        write_manifest(&core, "CoreScripts", CORE_MANIFEST);
        write_manifest(&client, "CoreScripts", CORE_MANIFEST);
        write_manifest(&client, "Game.Client", CLIENT_MANIFEST);

        let loader = ModuleLoader::new(Arc::new(ManifestFormat));
        loader.register_shared("CoreScripts");
        Self { dir, loader }
    }

    pub(crate) fn core_path(&self) -> PathBuf {
        self.dir.path().join("core").join("CoreScripts.yaml")
    }

    pub(crate) fn client_path(&self) -> PathBuf {
        self.dir.path().join("client").join("Game.Client.yaml")
    }

    pub(crate) fn load_core(&self) -> Module {
        self.loader.load(self.core_path()).unwrap()
    }

    pub(crate) fn load_client(&self) -> Module {
        self.loader.load(self.client_path()).unwrap()
    }
}

/// Minimal host-side object.
#[derive(Debug, Default)]
pub(crate) struct Counter {
    pub(crate) count: i64,
    pub(crate) binding: Option<EntityBinding>,
}

impl ScriptObject for Counter {
    fn get_field(&self, name: &str) -> Option<Value> {
        (name == "count").then(|| json!(self.count))
    }

    fn set_field(&mut self, name: &str, value: Value) -> bool {
        match (name, value.as_i64()) {
            ("count", Some(count)) => {
                self.count = count;
                true
            }
            _ => false,
        }
    }

    fn invoke(&mut self, name: &str, args: &[Value]) -> Result<Option<Value>, InvokeError> {
        match (name, args) {
            ("increment", [by]) => {
                self.count += by.as_i64().unwrap_or(1);
                Ok(Some(json!(self.count)))
            }
            _ => Err(InvokeError::MethodNotFound {
                name: name.to_owned(),
                arity: args.len(),
            }),
        }
    }

    fn bind(&mut self, binding: EntityBinding) {
        self.binding = Some(binding);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
