use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, ReentrantMutex, RwLock};
use uuid::Uuid;

use super::native::{NativeLibrary, NativeSymbol};
use super::resolver::DependencyResolver;
use super::LoaderServices;
use crate::image::{ModuleImage, TypeDescriptor};
use crate::object::{EntityBinding, ManagedObject, ObjectRef};
use crate::reclaim::Finalizer;

/// Per-load identity of a module. A reloaded file gets a new id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(Uuid);

impl ModuleId {
    pub(crate) fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Isolated, collectible execution context of one loaded module.
///
/// Alive while anything holds an `Arc` to it: the owning `Module`, image and
/// type views, objects instantiated from its types, and other contexts that
/// delegated a shared dependency to it.
pub(crate) struct ModuleContext {
    id: ModuleId,
    name: String,
    origin: PathBuf,
    unloading: AtomicBool,
    resolver: DependencyResolver,
    images: RwLock<Vec<Arc<dyn ModuleImage>>>,
    shared: RwLock<HashMap<String, ImageRef>>,
    natives: Mutex<HashMap<String, Arc<NativeLibrary>>>,
    hooks: Mutex<Vec<Finalizer>>,
    loading: ReentrantMutex<()>,
    services: Weak<LoaderServices>,
}

impl ModuleContext {
    pub(super) fn new(
        primary: Arc<dyn ModuleImage>,
        origin: &Path,
        resolver: DependencyResolver,
        services: Weak<LoaderServices>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: ModuleId::new(),
            name: primary.name().to_owned(),
            origin: origin.to_path_buf(),
            unloading: AtomicBool::new(false),
            resolver,
            images: RwLock::new(vec![primary]),
            shared: RwLock::new(HashMap::new()),
            natives: Mutex::new(HashMap::new()),
            hooks: Mutex::new(Vec::new()),
            loading: ReentrantMutex::new(()),
            services,
        })
    }

    pub(crate) fn id(&self) -> ModuleId {
        self.id
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn origin(&self) -> &Path {
        &self.origin
    }

    pub(crate) fn is_unloading(&self) -> bool {
        self.unloading.load(Ordering::SeqCst)
    }

    /// Raises the unloading flag; returns `false` if it was already raised.
    pub(crate) fn mark_unloading(&self) -> bool {
        !self.unloading.swap(true, Ordering::SeqCst)
    }

    pub(super) fn primary(&self) -> Option<Arc<dyn ModuleImage>> {
        self.images.read().first().cloned()
    }

    fn find_loaded(&self, name: &str) -> Option<Arc<dyn ModuleImage>> {
        self.images
            .read()
            .iter()
            .find(|image| image.name() == name)
            .cloned()
    }

    pub(super) fn loaded_images(&self) -> Vec<String> {
        self.images
            .read()
            .iter()
            .map(|image| image.name().to_owned())
            .collect()
    }

    pub(super) fn shared_dependencies(&self) -> Vec<String> {
        let mut names: Vec<_> = self.shared.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Resolves every reference of `image`; returns the first name that failed.
    pub(super) fn resolve_references(
        self: &Arc<Self>,
        image: &Arc<dyn ModuleImage>,
    ) -> Result<(), String> {
        for reference in image.references() {
            if self.resolve_dependency(reference).is_none() {
                return Err(reference.clone());
            }
        }
        Ok(())
    }

    /// Resolves a dependency by name.
    ///
    /// Shared names go to the main module so every context sees one instance;
    /// everything else is loaded privately into this context.
    pub(crate) fn resolve_dependency(self: &Arc<Self>, name: &str) -> Option<ImageRef> {
        if self.is_unloading() {
            return None;
        }
        let services = self.services.upgrade()?;

        if services.shared.contains(name) {
            match services.main.current() {
                Some(main) if !Arc::ptr_eq(&main, self) => {
                    return self.resolve_shared(&main, name);
                }
                Some(_) => {}
                None => {
                    tracing::debug!(
                        module = %self.name,
                        dependency = name,
                        "no main module registered; resolving shared dependency in isolation"
                    );
                }
            }
        }

        self.resolve_isolated(&services, name)
    }

    fn resolve_shared(self: &Arc<Self>, main: &Arc<ModuleContext>, name: &str) -> Option<ImageRef> {
        if let Some(found) = self.shared.read().get(name) {
            return Some(found.clone());
        }

        let found = main.resolve_dependency(name)?;
        let mut shared = self.shared.write();
        // begin_unload clears this cache under the same lock.
        if self.is_unloading() {
            return None;
        }
        tracing::debug!(
            module = %self.name,
            dependency = name,
            main = %main.name,
            "shared dependency delegated to main module"
        );
        Some(shared.entry(name.to_owned()).or_insert(found).clone())
    }

    fn resolve_isolated(self: &Arc<Self>, services: &LoaderServices, name: &str) -> Option<ImageRef> {
        let _loading = self.loading.lock();

        if let Some(image) = self.find_loaded(name) {
            return Some(ImageRef::new(Arc::clone(self), image));
        }

        let path = self.resolver.resolve_to_path(name)?;
        let image = match services.read_image(&path) {
            Ok(image) => image,
            Err(err) => {
                tracing::warn!(module = %self.name, dependency = name, error = %err, "dependency failed to load");
                return None;
            }
        };
        if image.name() != name {
            tracing::warn!(
                module = %self.name,
                dependency = name,
                declared = image.name(),
                path = %path.display(),
                "dependency file declares a different name"
            );
            return None;
        }

        // Registered before its references resolve so reference cycles terminate.
        self.images.write().push(Arc::clone(&image));
        if let Err(missing) = self.resolve_references(&image) {
            tracing::warn!(module = %self.name, dependency = name, missing = %missing, "dependency has unresolved references");
            self.images.write().retain(|loaded| !Arc::ptr_eq(loaded, &image));
            return None;
        }

        tracing::debug!(module = %self.name, dependency = name, path = %path.display(), "dependency loaded");
        Some(ImageRef::new(Arc::clone(self), image))
    }

    /// Resolves one exported native function for code in this module.
    pub(crate) fn resolve_native(self: &Arc<Self>, library: &str, symbol: &str) -> Option<NativeSymbol> {
        if self.is_unloading() {
            return None;
        }
        let services = self.services.upgrade()?;

        if let Some(address) = services
            .host_exports()
            .and_then(|exports| exports.resolve(library, symbol))
        {
            return Some(NativeSymbol::from_host(address));
        }

        self.native_library(&services, library)?.symbol(symbol)
    }

    fn native_library(&self, services: &LoaderServices, library: &str) -> Option<Arc<NativeLibrary>> {
        let mut natives = self.natives.lock();
        if let Some(opened) = natives.get(library) {
            return Some(Arc::clone(opened));
        }

        let local = services
            .probe_module_dir
            .then(|| self.resolver.resolve_native_to_path(library))
            .flatten()
            .and_then(|path| NativeLibrary::open(library, path));
        let opened = local.or_else(|| NativeLibrary::open(library, libloading::library_filename(library)))?;

        let opened = Arc::new(opened);
        natives.insert(library.to_owned(), Arc::clone(&opened));
        Some(opened)
    }

    pub(super) fn push_hook(&self, hook: Finalizer) {
        self.hooks.lock().push(hook);
    }

    /// Tears down caches that reference other contexts and hands back the unloading hooks.
    pub(super) fn begin_unload(&self) -> Vec<Finalizer> {
        self.mark_unloading();
        self.shared.write().clear();
        std::mem::take(&mut *self.hooks.lock())
    }
}

impl Drop for ModuleContext {
    fn drop(&mut self) {
        tracing::debug!(module = %self.name, module_id = %self.id, "module context reclaimed");
    }
}

/// A loaded image together with the context that loaded it.
#[derive(Clone)]
pub struct ImageRef {
    module: Arc<ModuleContext>,
    image: Arc<dyn ModuleImage>,
}

impl ImageRef {
    pub(super) fn new(module: Arc<ModuleContext>, image: Arc<dyn ModuleImage>) -> Self {
        Self { module, image }
    }

    pub fn name(&self) -> &str {
        self.image.name()
    }

    /// Id of the module whose context loaded this image.
    pub fn module_id(&self) -> ModuleId {
        self.module.id()
    }

    pub fn module_name(&self) -> &str {
        self.module.name()
    }

    pub fn image(&self) -> &dyn ModuleImage {
        self.image.as_ref()
    }

    /// Whether both refer to the very same loaded instance.
    pub fn same_instance(&self, other: &ImageRef) -> bool {
        Arc::ptr_eq(&self.image, &other.image)
    }

    pub fn types(&self) -> Vec<TypeRef> {
        (0..self.image.types().len())
            .map(|index| TypeRef {
                image: self.clone(),
                index,
            })
            .collect()
    }

    pub fn find_type(&self, name: &str) -> Option<TypeRef> {
        let index = self.image.types().iter().position(|t| t.name == name)?;
        Some(TypeRef {
            image: self.clone(),
            index,
        })
    }
}

impl fmt::Debug for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageRef")
            .field("name", &self.name())
            .field("module", &self.module.name())
            .field("module_id", &self.module.id())
            .finish()
    }
}

/// An exported type of a loaded image.
#[derive(Clone, Debug)]
pub struct TypeRef {
    image: ImageRef,
    index: usize,
}

impl TypeRef {
    pub fn descriptor(&self) -> &TypeDescriptor {
        &self.image.image().types()[self.index]
    }

    pub fn name(&self) -> &str {
        &self.descriptor().name
    }

    pub fn image(&self) -> &ImageRef {
        &self.image
    }

    /// Creates an instance owned by the defining module; `None` once it is unloading.
    pub fn instantiate(&self, binding: Option<EntityBinding>) -> Option<ObjectRef> {
        let module = &self.image.module;
        if module.is_unloading() {
            return None;
        }
        let type_name = self.name();
        let mut object = self.image.image.instantiate(type_name)?;
        if let Some(binding) = binding {
            object.bind(binding);
        }
        Some(ManagedObject::from_module(Arc::clone(module), type_name, object))
    }
}
