//! Objects that live inside a module and can be referenced from native code.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use thiserror::Error;

use crate::loader::{ModuleContext, ModuleId};

/// Shared reference to a managed object.
pub type ObjectRef = Arc<ManagedObject>;

/// Native-side identity an entity object is bound to at construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct EntityBinding {
    pub entity: u32,
    pub scene: u64,
}

#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("no method '{name}' taking {arity} argument(s)")]
    MethodNotFound { name: String, arity: usize },

    #[error("method '{name}' failed")]
    Failed {
        name: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Behaviour of an instance created from a module type.
///
/// Field and method lookups are by name; arguments and results travel as
/// JSON values so the native bridge never needs to know concrete types.
pub trait ScriptObject: Send + Sync + 'static {
    fn get_field(&self, name: &str) -> Option<Value>;

    /// Returns `false` if the object has no field with that name.
    fn set_field(&mut self, name: &str, value: Value) -> bool;

    fn invoke(&mut self, name: &str, args: &[Value]) -> Result<Option<Value>, InvokeError>;

    /// Called once, right after construction, for objects created for a native entity.
    fn bind(&mut self, _binding: EntityBinding) {}

    fn as_any(&self) -> &dyn Any;
}

/// A script object together with the module it was instantiated from.
///
/// Holding a `ManagedObject` keeps its defining module context alive.
pub struct ManagedObject {
    // Declared before `origin`: the object drops while its module is still reachable.
    inner: RwLock<Box<dyn ScriptObject>>,
    type_name: String,
    origin: Option<Arc<ModuleContext>>,
}

impl ManagedObject {
    /// Wraps an object that belongs to no collectible module (host-owned).
    pub fn detached(type_name: impl Into<String>, object: impl ScriptObject) -> ObjectRef {
        Arc::new(Self {
            inner: RwLock::new(Box::new(object)),
            type_name: type_name.into(),
            origin: None,
        })
    }

    pub(crate) fn from_module(
        origin: Arc<ModuleContext>,
        type_name: impl Into<String>,
        object: Box<dyn ScriptObject>,
    ) -> ObjectRef {
        Arc::new(Self {
            inner: RwLock::new(object),
            type_name: type_name.into(),
            origin: Some(origin),
        })
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Id of the module that defines this object's type, if any.
    pub fn module_id(&self) -> Option<ModuleId> {
        self.origin.as_ref().map(|ctx| ctx.id())
    }

    pub(crate) fn origin(&self) -> Option<&Arc<ModuleContext>> {
        self.origin.as_ref()
    }

    /// True once the defining module has started unloading.
    pub fn is_module_unloading(&self) -> bool {
        self.origin.as_ref().is_some_and(|ctx| ctx.is_unloading())
    }

    pub fn get_field(&self, name: &str) -> Option<Value> {
        self.inner.read().get_field(name)
    }

    pub fn set_field(&self, name: &str, value: Value) -> bool {
        self.inner.write().set_field(name, value)
    }

    pub fn invoke(&self, name: &str, args: &[Value]) -> Result<Option<Value>, InvokeError> {
        self.inner.write().invoke(name, args)
    }

    pub fn bind(&self, binding: EntityBinding) {
        self.inner.write().bind(binding);
    }

    /// Runs `f` against the concrete object if it is a `T`.
    pub fn downcast_with<T: 'static, R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        let inner = self.inner.read();
        inner.as_any().downcast_ref::<T>().map(f)
    }
}

impl fmt::Debug for ManagedObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedObject")
            .field("type_name", &self.type_name)
            .field("module_id", &self.module_id())
            .finish_non_exhaustive()
    }
}
