//! Handle-based object operations for native callers.
//!
//! Everything except instantiation only needs the handle table, so native
//! threads can use objects while the host is busy loading or unloading.

use serde_json::Value;

use super::ModuleHost;
use crate::handles::{Handle, HandleTable};
use crate::object::{EntityBinding, InvokeError};

pub(crate) const ON_UPDATE: &str = "on_update";

/// Invokes a method by name; `false` if the handle is dead, the method does
/// not exist with that many arguments or it failed.
pub(crate) fn invoke_function(handles: &HandleTable, handle: Handle, name: &str, args: &[Value]) -> bool {
    let Some(object) = handles.resolve(handle) else {
        return false;
    };
    match object.invoke(name, args) {
        Ok(_) => true,
        Err(err @ InvokeError::MethodNotFound { .. }) => {
            tracing::debug!(%handle, type_name = object.type_name(), error = %err, "invoke failed");
            false
        }
        Err(err) => {
            tracing::error!(
                %handle,
                type_name = object.type_name(),
                function = name,
                error = ?anyhow::Error::from(err),
                "scripted function failed"
            );
            false
        }
    }
}

pub(crate) fn get_field_value(handles: &HandleTable, handle: Handle, name: &str) -> Option<Value> {
    handles.resolve(handle)?.get_field(name)
}

pub(crate) fn set_field_value(handles: &HandleTable, handle: Handle, name: &str, value: Value) -> bool {
    handles
        .resolve(handle)
        .is_some_and(|object| object.set_field(name, value))
}

impl ModuleHost {
    /// Creates an instance of a client entity type bound to a native entity.
    ///
    /// Returns a strong handle, or `None` if there is no client or no such type.
    pub fn instantiate_client_entity(&self, type_name: &str, entity: u32, scene: u64) -> Option<Handle> {
        let client = self.client()?;
        let Some(ty) = client.find_type(type_name) else {
            tracing::warn!(type_name, module = %client.name(), "entity type not found in client module");
            return None;
        };
        let object = ty.instantiate(Some(EntityBinding { entity, scene }))?;
        let handle = self.handles.alloc_strong(&object);
        tracing::trace!(type_name, entity, scene, %handle, "client entity instantiated");
        Some(handle)
    }

    pub fn destroy_object(&self, handle: Handle) {
        self.handles.free(handle);
    }

    pub fn invoke_function(&self, handle: Handle, name: &str, args: &[Value]) -> bool {
        invoke_function(&self.handles, handle, name, args)
    }

    pub fn get_field_value(&self, handle: Handle, name: &str) -> Option<Value> {
        get_field_value(&self.handles, handle, name)
    }

    pub fn set_field_value(&self, handle: Handle, name: &str, value: Value) -> bool {
        set_field_value(&self.handles, handle, name, value)
    }

    /// Per-frame update hook for an entity object.
    pub fn call_on_update(&self, handle: Handle, timestep: f64) -> bool {
        self.invoke_function(handle, ON_UPDATE, &[Value::from(timestep)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HostConfig;
    use crate::loader::ExportTable;
    use crate::manifest::ManifestObject;
    use crate::testing::Fixture;
    use serde_json::json;
    use std::sync::Arc;

    fn running_host(fixture: &Fixture) -> ModuleHost {
        let mut host = ModuleHost::new(HostConfig {
            core_module: fixture.core_path(),
            unload_timeout_ms: 300,
            poll_interval_ms: 5,
            ..HostConfig::default()
        });
        host.initialize(Arc::new(ExportTable::new())).unwrap();
        host.load_core().unwrap();
        host.load_client(fixture.client_path()).unwrap();
        host
    }

    #[test]
    fn entity_lifecycle_through_handles() {
        let fixture = Fixture::new();
        let host = running_host(&fixture);

        let handle = host.instantiate_client_entity("Game.Player", 12, 3).unwrap();
        let object = host.handles().resolve(handle).unwrap();
        let binding = object.downcast_with(|p: &ManifestObject| p.binding());
        assert_eq!(binding, Some(Some(EntityBinding { entity: 12, scene: 3 })));
        drop(object);

        assert!(host.call_on_update(handle, 0.016));
        assert!(host.call_on_update(handle, 0.016));
        assert!(!host.invoke_function(handle, "fly", &[]));
        assert!(!host.invoke_function(handle, "on_update", &[json!(1), json!(2), json!(3)]));
        assert!(host.invoke_function(handle, "jump", &[]));
        let calls = host
            .handles()
            .resolve(handle)
            .and_then(|o| o.downcast_with(|p: &ManifestObject| p.invocations("on_update")));
        assert_eq!(calls, Some(2));

        assert_eq!(host.get_field_value(handle, "speed"), Some(json!(2.5)));
        assert!(host.set_field_value(handle, "speed", json!(5.0)));
        assert_eq!(host.get_field_value(handle, "speed"), Some(json!(5.0)));
        assert!(!host.set_field_value(handle, "mana", json!(1)));

        host.destroy_object(handle);
        host.destroy_object(handle);
        assert!(!host.call_on_update(handle, 0.016));
        assert_eq!(host.get_field_value(handle, "speed"), None);
    }

    #[test]
    fn unknown_type_or_missing_client_yields_no_handle() {
        let fixture = Fixture::new();
        let mut host = running_host(&fixture);
        assert!(host.instantiate_client_entity("Game.Nobody", 1, 0).is_none());

        host.unload_client().unwrap();
        assert!(host.instantiate_client_entity("Game.Player", 1, 0).is_none());
    }

    #[test]
    fn client_unload_invalidates_entity_handles() {
        let fixture = Fixture::new();
        let mut host = running_host(&fixture);
        let handle = host.instantiate_client_entity("Game.Player", 1, 0).unwrap();

        host.unload_client().unwrap();
        assert!(!host.handles().is_alive(handle));
        assert!(!host.call_on_update(handle, 0.016));
    }
}
