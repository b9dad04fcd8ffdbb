//! # ModHost - Hot-Reloadable Module Host
//!
//! Loads units of code ("modules") into isolated, collectible execution
//! contexts inside a long-running host process and lets native code refer to
//! objects living inside those modules through plain integer handles.
//!
//! ## Features
//!
//! - **Two roles**: one resident *core* module and at most one *client* module
//!   that can be swapped repeatedly during iterative development
//! - **Shared dependencies**: names in the [`SharedModuleSet`] always resolve to
//!   the registered main module, so core and client see the same instances
//! - **Handle bridge**: strong (keep-alive) and weak handles whose liveness is
//!   checked and dereferenced in one step
//! - **Bounded unload**: the [`UnloadMonitor`] drains pending drops pass by pass
//!   until the module context is gone, or reports a timeout
//!
//! ## Reachability model
//!
//! A module context stays alive while anything references it: the owning
//! [`Module`], an [`ImageRef`]/[`TypeRef`] view, or any [`ManagedObject`]
//! instantiated from one of its types. Strong handles pin objects in a
//! per-module keep-alive registry that is dropped wholesale when unload begins,
//! so only references held *outside* the handle table can keep an unloading
//! module alive.
//!
//! ## Example
//!
//! ```rust,ignore
//! use modhost::{ExportTable, HostConfig, ModuleHost};
//! use std::sync::Arc;
//!
//! let mut host = ModuleHost::new(HostConfig::default());
//! host.initialize(Arc::new(ExportTable::new()))?;
//! host.load_core()?;
//! host.load_client("game/Client.yaml")?;
//!
//! let player = host.instantiate_client_entity("Game.Player", 1, 0).unwrap();
//! host.call_on_update(player, 0.016);
//! host.destroy_object(player);
//!
//! host.unload_client()?;
//! ```

#![deny(unsafe_code)]

pub use serde_json::Value;

pub mod config;
pub mod entry;
pub mod handles;
pub mod host;
pub mod image;
pub mod loader;
pub mod manifest;
pub mod monitor;
pub mod object;
mod reclaim;

pub use config::{ConfigError, HostConfig};
pub use handles::{Handle, HandleKind, HandleTable};
pub use host::{HostError, InstantiableClasses, ModuleHost, Role, SlotState};
pub use image::{FieldDescriptor, ImageFormat, ModuleImage, TypeDescriptor, TypeKind};
pub use loader::{
    DependencyResolver, ExportTable, HostExports, ImageRef, LoadError, Module, ModuleId,
    ModuleLoader, NativeSymbol, SharedModuleSet, TypeRef, UnloadTicket,
};
pub use manifest::{ManifestError, ManifestFormat, ManifestImage, ManifestObject, MethodSignature};
pub use monitor::{UnloadError, UnloadMonitor, UnloadReport};
pub use object::{EntityBinding, InvokeError, ManagedObject, ObjectRef, ScriptObject};

#[cfg(test)]
pub(crate) mod testing;
