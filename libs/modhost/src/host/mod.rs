//! Core/client lifecycle over one loader and one handle table.
//!
//! The core module is loaded once and registered as the main module, so every
//! shared name resolves into it. The client module can only exist while a
//! core is loaded, and is always unloaded before the core.

pub(crate) mod bridge;
mod reflection;

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;

use crate::config::HostConfig;
use crate::handles::HandleTable;
use crate::image::ImageFormat;
use crate::loader::{HostExports, LoadError, Module, ModuleLoader};
use crate::manifest::ManifestFormat;
use crate::monitor::{UnloadError, UnloadMonitor};

pub use reflection::InstantiableClasses;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Core,
    Client,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Core => "core",
            Role::Client => "client",
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SlotState {
    #[default]
    Unloaded,
    Loading,
    Loaded,
    Unloading,
}

#[derive(Debug, Error)]
pub enum HostError {
    #[error("module host is not initialized")]
    NotInitialized,

    #[error("module host is already initialized")]
    AlreadyInitialized,

    #[error("a core module must be loaded before a client module")]
    NoCoreModule,

    #[error("{0} module is already loaded")]
    AlreadyLoaded(Role),

    #[error("failed to load {role} module")]
    Load {
        role: Role,
        #[source]
        source: LoadError,
    },

    #[error("failed to unload {role} module")]
    Unload {
        role: Role,
        #[source]
        source: UnloadError,
    },
}

#[derive(Default)]
struct RoleSlot {
    state: SlotState,
    module: Option<Module>,
}

pub struct ModuleHost {
    config: HostConfig,
    handles: Arc<HandleTable>,
    loader: ModuleLoader,
    monitor: UnloadMonitor,
    core: RoleSlot,
    client: RoleSlot,
    initialized: bool,
}

impl ModuleHost {
    pub fn new(config: HostConfig) -> Self {
        Self::with_format(config, Arc::new(ManifestFormat))
    }

    pub fn with_format(config: HostConfig, format: Arc<dyn ImageFormat>) -> Self {
        let handles = Arc::new(HandleTable::new());
        let loader = ModuleLoader::new(format).with_module_dir_probing(config.probe_module_dir);
        let monitor = UnloadMonitor::new(Arc::clone(&handles))
            .with_budget(config.unload_timeout())
            .with_poll_interval(config.poll_interval());
        Self {
            config,
            handles,
            loader,
            monitor,
            core: RoleSlot::default(),
            client: RoleSlot::default(),
            initialized: false,
        }
    }

    /// Installs the host's native exports and fixes the shared-name set.
    pub fn initialize(&mut self, exports: Arc<dyn HostExports>) -> Result<(), HostError> {
        if self.initialized {
            return Err(HostError::AlreadyInitialized);
        }

        self.loader.set_host_exports(exports);
        if let Some(core_name) = self.config.core_module_name() {
            self.loader.register_shared(core_name);
        }
        for name in &self.config.shared_modules {
            self.loader.register_shared(name.clone());
        }
        self.initialized = true;

        tracing::info!(
            core_module = %self.config.core_module.display(),
            shared = ?self.loader.shared_modules().names(),
            "module host initialized"
        );
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Loads the configured core module.
    pub fn load_core(&mut self) -> Result<(), HostError> {
        let path = self.config.core_module.clone();
        self.load_core_from(&path)
    }

    pub fn load_core_from(&mut self, path: &Path) -> Result<(), HostError> {
        self.ensure_initialized()?;
        if self.core.module.is_some() {
            return Err(HostError::AlreadyLoaded(Role::Core));
        }

        let module = self.load_into(Role::Core, path)?;
        // The declared name is what clients reference, whatever the file is called.
        if self.loader.register_shared(module.name()) {
            tracing::info!(module = %module.name(), "core module name added to the shared set");
        }
        self.loader.set_main(Some(&module));
        self.finish_load(Role::Core, module);
        Ok(())
    }

    /// Unloads the client (if any), then the core.
    ///
    /// Both slots end up empty even if an unload times out.
    pub fn unload_core(&mut self) -> Result<(), HostError> {
        let client = self.unload_client();
        self.loader.set_main(None);
        let core = self.unload_role(Role::Core);
        client.and(core)
    }

    pub fn load_client(&mut self, path: impl AsRef<Path>) -> Result<(), HostError> {
        self.ensure_initialized()?;
        if self.core.module.is_none() {
            return Err(HostError::NoCoreModule);
        }
        if self.client.module.is_some() {
            return Err(HostError::AlreadyLoaded(Role::Client));
        }

        let module = self.load_into(Role::Client, path.as_ref())?;
        self.finish_load(Role::Client, module);
        Ok(())
    }

    pub fn unload_client(&mut self) -> Result<(), HostError> {
        self.unload_role(Role::Client)
    }

    pub fn state(&self, role: Role) -> SlotState {
        self.slot(role).state
    }

    pub fn module(&self, role: Role) -> Option<&Module> {
        self.slot(role).module.as_ref()
    }

    pub fn core(&self) -> Option<&Module> {
        self.module(Role::Core)
    }

    pub fn client(&self) -> Option<&Module> {
        self.module(Role::Client)
    }

    pub fn handles(&self) -> &Arc<HandleTable> {
        &self.handles
    }

    pub fn loader(&self) -> &ModuleLoader {
        &self.loader
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    fn ensure_initialized(&self) -> Result<(), HostError> {
        if self.initialized {
            Ok(())
        } else {
            Err(HostError::NotInitialized)
        }
    }

    fn slot(&self, role: Role) -> &RoleSlot {
        match role {
            Role::Core => &self.core,
            Role::Client => &self.client,
        }
    }

    fn slot_mut(&mut self, role: Role) -> &mut RoleSlot {
        match role {
            Role::Core => &mut self.core,
            Role::Client => &mut self.client,
        }
    }

    fn load_into(&mut self, role: Role, path: &Path) -> Result<Module, HostError> {
        self.slot_mut(role).state = SlotState::Loading;
        tracing::info!(%role, path = %path.display(), "loading module");

        self.loader.load(path).map_err(|source| {
            self.slot_mut(role).state = SlotState::Unloaded;
            tracing::error!(%role, path = %path.display(), error = %source, "module load failed");
            HostError::Load { role, source }
        })
    }

    fn finish_load(&mut self, role: Role, module: Module) {
        let slot = self.slot_mut(role);
        slot.module = Some(module);
        slot.state = SlotState::Loaded;
    }

    fn unload_role(&mut self, role: Role) -> Result<(), HostError> {
        let slot = self.slot_mut(role);
        let Some(module) = slot.module.take() else {
            return Ok(());
        };
        slot.state = SlotState::Unloading;

        let result = self.monitor.unload(&self.loader, module);
        self.slot_mut(role).state = SlotState::Unloaded;

        result
            .map(|report| {
                tracing::info!(%role, passes = report.passes, elapsed_ms = report.elapsed.as_millis() as u64, "unload complete");
            })
            .map_err(|source| HostError::Unload { role, source })
    }
}
