//! Module loading into isolated, collectible contexts.
//!
//! Each [`ModuleLoader::load`] creates a fresh context for one module file.
//! The file is read into memory once and decoded by the configured
//! [`ImageFormat`], so the file on disk can be replaced while the module is
//! loaded. Dependencies are resolved when the module loads:
//!
//! 1. a name in the [`SharedModuleSet`] resolves to the registered main
//!    module (its own images, or loaded into it on first use);
//! 2. any other name is loaded privately from the module's own directory.
//!
//! A reference that cannot be resolved fails the whole load.

mod context;
pub mod native;
mod resolver;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Instant;

use arc_swap::ArcSwapOption;
use parking_lot::RwLock;
use thiserror::Error;

use crate::image::{ImageFormat, ModuleImage};
use crate::object::{EntityBinding, ObjectRef};
use crate::reclaim::Finalizer;

pub(crate) use context::ModuleContext;
pub use context::{ImageRef, ModuleId, TypeRef};
pub use native::{ExportTable, HostExports, NativeSymbol};
pub use resolver::DependencyResolver;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read module file '{}'", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode module file '{}'", path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("module '{module}' references '{reference}', which could not be resolved")]
    UnresolvedReference { module: String, reference: String },
}

/// Names that every context resolves through the main module.
#[derive(Debug, Default)]
pub struct SharedModuleSet {
    names: RwLock<BTreeSet<String>>,
}

impl SharedModuleSet {
    pub(crate) fn insert(&self, name: impl Into<String>) -> bool {
        self.names.write().insert(name.into())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.read().contains(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.names.read().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.names.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.read().is_empty()
    }
}

#[derive(Default)]
pub(crate) struct MainModule {
    current: ArcSwapOption<ModuleContext>,
}

impl MainModule {
    pub(crate) fn current(&self) -> Option<Arc<ModuleContext>> {
        self.current.load_full()
    }

    fn id(&self) -> Option<ModuleId> {
        self.current.load_full().map(|ctx| ctx.id())
    }

    fn set(&self, ctx: Option<Arc<ModuleContext>>) {
        self.current.store(ctx);
    }
}

/// State every context of one loader shares. Contexts hold it weakly.
pub(crate) struct LoaderServices {
    format: Arc<dyn ImageFormat>,
    pub(crate) shared: SharedModuleSet,
    pub(crate) main: MainModule,
    exports: RwLock<Option<Arc<dyn HostExports>>>,
    pub(crate) probe_module_dir: bool,
}

impl LoaderServices {
    pub(crate) fn host_exports(&self) -> Option<Arc<dyn HostExports>> {
        self.exports.read().clone()
    }

    pub(crate) fn read_image(&self, path: &Path) -> Result<Arc<dyn ModuleImage>, LoadError> {
        let bytes = std::fs::read(path).map_err(|source| LoadError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let image = self
            .format
            .decode(path, &bytes)
            .map_err(|source| LoadError::Decode {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Arc::from(image))
    }
}

/// Creates module contexts and tears them down.
pub struct ModuleLoader {
    services: Arc<LoaderServices>,
}

impl ModuleLoader {
    pub fn new(format: Arc<dyn ImageFormat>) -> Self {
        Self {
            services: Arc::new(LoaderServices {
                format,
                shared: SharedModuleSet::default(),
                main: MainModule::default(),
                exports: RwLock::new(None),
                probe_module_dir: true,
            }),
        }
    }

    /// Whether native imports are first looked up next to the module file.
    #[must_use]
    pub fn with_module_dir_probing(mut self, enabled: bool) -> Self {
        if let Some(services) = Arc::get_mut(&mut self.services) {
            services.probe_module_dir = enabled;
        }
        self
    }

    pub fn shared_modules(&self) -> &SharedModuleSet {
        &self.services.shared
    }

    pub(crate) fn register_shared(&self, name: impl Into<String>) -> bool {
        self.services.shared.insert(name)
    }

    pub fn set_host_exports(&self, exports: Arc<dyn HostExports>) {
        *self.services.exports.write() = Some(exports);
    }

    /// Registers (or clears) the module that shared names resolve to.
    pub fn set_main(&self, module: Option<&Module>) {
        self.services.main.set(module.map(|m| Arc::clone(&m.ctx)));
    }

    pub fn main(&self) -> Option<ModuleId> {
        self.services.main.id()
    }

    pub fn load(&self, origin: impl AsRef<Path>) -> Result<Module, LoadError> {
        let origin = origin.as_ref();
        let started = Instant::now();

        let primary = self.services.read_image(origin)?;
        let resolver = DependencyResolver::for_origin(origin, self.services.format.extension());
        let ctx = ModuleContext::new(
            Arc::clone(&primary),
            origin,
            resolver,
            Arc::downgrade(&self.services),
        );

        if let Err(reference) = ctx.resolve_references(&primary) {
            return Err(LoadError::UnresolvedReference {
                module: ctx.name().to_owned(),
                reference,
            });
        }

        tracing::info!(
            module = %ctx.name(),
            module_id = %ctx.id(),
            origin = %origin.display(),
            images = ctx.loaded_images().len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "module loaded"
        );
        Ok(Module { ctx })
    }

    /// Starts unloading `module` and returns a ticket to observe its reclamation.
    ///
    /// Does not wait: the context goes away once the last reference to it drops.
    pub fn unload(&self, module: Module) -> UnloadTicket {
        let ctx = module.ctx;
        if self.services.main.id() == Some(ctx.id()) {
            tracing::warn!(module = %ctx.name(), "unloading the registered main module; clearing registration");
            self.services.main.set(None);
        }

        let hooks = ctx.begin_unload();
        let ticket = UnloadTicket {
            id: ctx.id(),
            name: ctx.name().to_owned(),
            context: Arc::downgrade(&ctx),
            hooks,
        };
        tracing::info!(module = %ticket.name, module_id = %ticket.id, "module unload requested");
        ticket
    }
}

/// A loaded module. Dropping it without [`ModuleLoader::unload`] leaves the
/// context to die with its last reference, without running unloading hooks.
pub struct Module {
    ctx: Arc<ModuleContext>,
}

impl Module {
    pub fn id(&self) -> ModuleId {
        self.ctx.id()
    }

    pub fn name(&self) -> &str {
        self.ctx.name()
    }

    pub fn origin(&self) -> &Path {
        self.ctx.origin()
    }

    pub fn is_unloading(&self) -> bool {
        self.ctx.is_unloading()
    }

    pub(crate) fn context(&self) -> &Arc<ModuleContext> {
        &self.ctx
    }

    /// The module's own image.
    pub fn primary(&self) -> Option<ImageRef> {
        self.ctx
            .primary()
            .map(|image| ImageRef::new(Arc::clone(&self.ctx), image))
    }

    pub fn exported_types(&self) -> Vec<TypeRef> {
        self.primary().map(|image| image.types()).unwrap_or_default()
    }

    pub fn find_type(&self, name: &str) -> Option<TypeRef> {
        self.primary()?.find_type(name)
    }

    pub fn instantiate(&self, type_name: &str, binding: Option<EntityBinding>) -> Option<ObjectRef> {
        self.find_type(type_name)?.instantiate(binding)
    }

    /// Resolves a dependency the way a reference from this module would.
    pub fn resolve_dependency(&self, name: &str) -> Option<ImageRef> {
        self.ctx.resolve_dependency(name)
    }

    pub fn resolve_native(&self, library: &str, symbol: &str) -> Option<NativeSymbol> {
        self.ctx.resolve_native(library, symbol)
    }

    /// Names of images loaded into this module's own context, primary first.
    pub fn loaded_images(&self) -> Vec<String> {
        self.ctx.loaded_images()
    }

    /// Names resolved through the main module.
    pub fn shared_dependencies(&self) -> Vec<String> {
        self.ctx.shared_dependencies()
    }

    /// Registers work to run on the first collection pass after unload begins,
    /// typically severing references other modules hold into this one.
    pub fn on_unloading(&self, hook: impl FnOnce() + Send + 'static) {
        self.ctx.push_hook(Box::new(hook));
    }
}

impl std::fmt::Debug for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Module")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("origin", &self.origin())
            .finish()
    }
}

/// Weak observation of a module whose unload has begun.
pub struct UnloadTicket {
    id: ModuleId,
    name: String,
    context: Weak<ModuleContext>,
    pub(crate) hooks: Vec<Finalizer>,
}

impl UnloadTicket {
    pub fn id(&self) -> ModuleId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True once nothing references the context any more.
    pub fn is_reclaimed(&self) -> bool {
        self.context.strong_count() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ManifestFormat;
    use crate::testing::{write_manifest, Fixture};

    #[test]
    fn load_reads_name_and_types() {
        let fixture = Fixture::new();
        let module = fixture.load_client();

        assert_eq!(module.name(), "Game.Client");
        assert!(!module.is_unloading());
        assert!(module.find_type("Game.Player").is_some());
        assert_eq!(module.exported_types().len(), 2);
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let loader = ModuleLoader::new(Arc::new(ManifestFormat));
        match loader.load("/definitely/not/here.yaml") {
            Err(LoadError::Read { path, .. }) => assert!(path.ends_with("here.yaml")),
            other => panic!("expected Read error, got {other:?}"),
        }
    }

    #[test]
    fn garbage_file_is_a_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_manifest(dir.path(), "Broken", "types: [ not closed");
        let loader = ModuleLoader::new(Arc::new(ManifestFormat));
        assert!(matches!(loader.load(&path), Err(LoadError::Decode { .. })));
    }

    #[test]
    fn unresolved_reference_fails_the_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_manifest(dir.path(), "Lonely", "name: Lonely\nreferences: [Ghost]\n");
        let loader = ModuleLoader::new(Arc::new(ManifestFormat));
        match loader.load(&path) {
            Err(LoadError::UnresolvedReference { module, reference }) => {
                assert_eq!(module, "Lonely");
                assert_eq!(reference, "Ghost");
            }
            other => panic!("expected UnresolvedReference, got {other:?}"),
        }
    }

    #[test]
    fn private_dependencies_load_into_the_module_context() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path(), "Util.Math", "name: Util.Math\n");
        let path = write_manifest(dir.path(), "Tool", "name: Tool\nreferences: [Util.Math]\n");

        let loader = ModuleLoader::new(Arc::new(ManifestFormat));
        let first = loader.load(&path).unwrap();
        let second = loader.load(&path).unwrap();

        assert_eq!(first.loaded_images(), vec!["Tool", "Util.Math"]);
        let a = first.resolve_dependency("Util.Math").unwrap();
        let b = second.resolve_dependency("Util.Math").unwrap();
        assert!(!a.same_instance(&b), "private dependencies are per context");
        assert_ne!(first.id(), second.id());
    }

    #[test]
    fn reference_cycles_terminate() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path(), "B", "name: B\nreferences: [A]\n");
        let path = write_manifest(dir.path(), "A", "name: A\nreferences: [B]\n");

        let loader = ModuleLoader::new(Arc::new(ManifestFormat));
        let module = loader.load(&path).unwrap();
        assert_eq!(module.loaded_images(), vec!["A", "B"]);
    }

    #[test]
    fn shared_names_resolve_to_the_main_module() {
        let fixture = Fixture::new();
        let core = fixture.load_core();
        fixture.loader.set_main(Some(&core));
        let client = fixture.load_client();

        let from_client = client.resolve_dependency("CoreScripts").unwrap();
        let from_core = core.primary().unwrap();
        assert!(from_client.same_instance(&from_core));
        assert_eq!(from_client.module_id(), core.id());
        assert_eq!(client.shared_dependencies(), vec!["CoreScripts"]);
        // The client directory has its own copy, which must not be used.
        assert_eq!(client.loaded_images(), vec!["Game.Client"]);
    }

    #[test]
    fn shared_names_without_main_resolve_in_isolation() {
        let fixture = Fixture::new();
        let client = fixture.load_client();
        assert!(client.shared_dependencies().is_empty());
        assert_eq!(client.loaded_images(), vec!["Game.Client", "CoreScripts"]);
    }

    #[test]
    fn unloading_module_stops_servicing_lookups() {
        let fixture = Fixture::new();
        let client = fixture.load_client();
        let player = client.find_type("Game.Player").unwrap();

        let ticket = fixture.loader.unload(client);
        assert!(player.instantiate(None).is_none());
        assert!(!ticket.is_reclaimed());
        drop(player);
        assert!(ticket.is_reclaimed());
    }

    #[test]
    fn unloading_the_main_module_clears_the_registration() {
        let fixture = Fixture::new();
        let core = fixture.load_core();
        fixture.loader.set_main(Some(&core));
        assert_eq!(fixture.loader.main(), Some(core.id()));

        let ticket = fixture.loader.unload(core);
        assert_eq!(fixture.loader.main(), None);
        assert!(ticket.is_reclaimed());
    }

    #[test]
    fn file_can_be_replaced_while_loaded() {
        let fixture = Fixture::new();
        let client = fixture.load_client();

        std::fs::write(fixture.client_path(), "name: Game.Client\ntypes: []\n").unwrap();
        assert!(client.find_type("Game.Player").is_some());

        let reloaded = fixture.load_client();
        assert!(reloaded.find_type("Game.Player").is_none());
    }

    #[test]
    fn host_exports_take_precedence_for_natives() {
        let fixture = Fixture::new();
        fixture
            .loader
            .set_host_exports(Arc::new(ExportTable::new().with_symbol("heart_log", 0x10)));
        let client = fixture.load_client();

        let symbol = client.resolve_native("__Internal", "heart_log").unwrap();
        assert_eq!(symbol.address(), 0x10);
        assert!(symbol.is_host_export());
        assert!(client.resolve_native("modhost_no_such_library", "x").is_none());
    }
}
