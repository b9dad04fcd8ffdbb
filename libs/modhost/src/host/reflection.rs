use serde::Serialize;

use super::ModuleHost;
use crate::image::TypeKind;
use crate::loader::Module;

/// Entity and component types a client module exports, with their unique ids.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InstantiableClasses {
    pub entities: Vec<(String, i64)>,
    pub components: Vec<(String, i64)>,
}

impl InstantiableClasses {
    pub fn of(module: &Module) -> Self {
        let mut classes = Self::default();
        for ty in module.exported_types() {
            let descriptor = ty.descriptor();
            if !descriptor.is_instantiable() {
                continue;
            }
            let entry = (descriptor.name.clone(), descriptor.unique_id.unwrap_or(0));
            if descriptor.kind == TypeKind::Entity {
                classes.entities.push(entry);
            } else {
                classes.components.push(entry);
            }
        }
        classes
    }
}

impl ModuleHost {
    pub fn instantiable_classes(&self) -> Option<InstantiableClasses> {
        self.client().map(InstantiableClasses::of)
    }

    /// Serializable field names of a client type; empty if the type is unknown,
    /// `None` if no client is loaded.
    pub fn serializable_fields(&self, type_name: &str) -> Option<Vec<String>> {
        let client = self.client()?;
        let fields = client
            .find_type(type_name)
            .map(|ty| {
                ty.descriptor()
                    .serializable_fields()
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();
        Some(fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HostConfig;
    use crate::loader::ExportTable;
    use crate::testing::{write_manifest, Fixture};
    use std::sync::Arc;

    #[test]
    fn lists_client_entities_and_components() {
        let fixture = Fixture::new();
        let mut host = ModuleHost::new(HostConfig {
            core_module: fixture.core_path(),
            ..HostConfig::default()
        });
        host.initialize(Arc::new(ExportTable::new())).unwrap();
        assert!(host.instantiable_classes().is_none());

        host.load_core().unwrap();
        host.load_client(fixture.client_path()).unwrap();

        let classes = host.instantiable_classes().unwrap();
        assert_eq!(classes.entities, vec![("Game.Player".to_owned(), 42)]);
        assert_eq!(classes.components, vec![("Game.Health".to_owned(), 43)]);

        assert_eq!(
            host.serializable_fields("Game.Player"),
            Some(vec!["speed".to_owned(), "health".to_owned()])
        );
        assert_eq!(host.serializable_fields("Game.Nobody"), Some(Vec::new()));
    }

    #[test]
    fn plain_types_are_not_instantiable() {
        let fixture = Fixture::new();
        let client = write_manifest(
            &fixture.dir.path().join("client"),
            "Game.Tools",
            "name: Game.Tools\nreferences: [CoreScripts]\ntypes:\n  - { name: Game.Math, unique_id: 7 }\n  - { name: Game.Door, kind: component, unique_id: 8 }\n",
        );
        let mut host = ModuleHost::new(HostConfig {
            core_module: fixture.core_path(),
            ..HostConfig::default()
        });
        host.initialize(Arc::new(ExportTable::new())).unwrap();
        host.load_core().unwrap();
        host.load_client(&client).unwrap();

        let classes = host.instantiable_classes().unwrap();
        assert!(classes.entities.is_empty());
        assert_eq!(classes.components, vec![("Game.Door".to_owned(), 8)]);
    }
}
