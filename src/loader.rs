//! Class loaders with parent delegation and shared-class aware definition.
//!
//! `find_class` asks the bridge before touching the search path. A usable
//! hit is defined straight from the cached bytes and recorded metadata; any
//! other outcome falls through to the resource lookup, after which the
//! freshly defined class is offered back to the provider.

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, instrument, warn};

use crate::bridge::{CacheLookup, ModuleLookup, SharedClassBridge};
use crate::class::{
    Class, ClassOrigin, ClassRef, CodeSource, LoaderId, class_name_to_class_path, package_name,
};
use crate::config::SharedClassSettings;
use crate::error::LoadError;
use crate::metadata::MetadataRecord;
use crate::module::ModuleLocation;
use crate::package::{Package, PackageTable};
use crate::provider::ProviderOwner;
use crate::resource::{ClassPath, Resource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoaderKind {
    Bootstrap,
    Platform,
    Application,
    User,
}

impl LoaderKind {
    pub fn is_builtin(self) -> bool {
        !matches!(self, Self::User)
    }
}

type UnloadListener = Box<dyn FnOnce(LoaderId) + Send>;

/// Handle for removing a listener registered with `ClassLoader::on_unload`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

pub struct ClassLoader {
    id: LoaderId,
    name: String,
    kind: LoaderKind,
    parent: Option<Arc<ClassLoader>>,
    me: Weak<ClassLoader>,
    class_path: ClassPath,
    modules: Vec<ModuleLocation>,
    packages: PackageTable,
    bridge: SharedClassBridge,
    classes: RwLock<HashMap<String, ClassRef>>,
    loading_locks: DashMap<String, Arc<Mutex<()>>>,
    unload_listeners: Mutex<Vec<(ListenerId, UnloadListener)>>,
    next_listener: AtomicU64,
}

impl std::fmt::Debug for ClassLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassLoader")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("parent", &self.parent.as_ref().map(|p| p.id))
            .finish()
    }
}

pub struct ClassLoaderBuilder {
    name: String,
    kind: LoaderKind,
    parent: Option<Arc<ClassLoader>>,
    class_path: Vec<PathBuf>,
    modules: Vec<ModuleLocation>,
}

impl ClassLoaderBuilder {
    pub fn parent(mut self, parent: &Arc<ClassLoader>) -> Self {
        self.parent = Some(Arc::clone(parent));
        self
    }

    pub fn kind(mut self, kind: LoaderKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn class_path(mut self, paths: impl IntoIterator<Item = PathBuf>) -> Self {
        self.class_path.extend(paths);
        self
    }

    pub fn module(mut self, module: ModuleLocation) -> Self {
        self.modules.push(module);
        self
    }

    pub fn build(self, settings: &SharedClassSettings) -> Arc<ClassLoader> {
        let loader = Arc::new_cyclic(|me| ClassLoader {
            id: LoaderId::next(),
            name: self.name,
            kind: self.kind,
            parent: self.parent,
            me: me.clone(),
            class_path: ClassPath::new(self.class_path),
            modules: self.modules,
            packages: PackageTable::default(),
            bridge: SharedClassBridge::new(),
            classes: RwLock::new(HashMap::new()),
            loading_locks: DashMap::new(),
            unload_listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(0),
        });
        loader.initialize_sharing(settings);
        loader
    }
}

impl ClassLoader {
    pub fn builder(name: impl Into<String>) -> ClassLoaderBuilder {
        ClassLoaderBuilder {
            name: name.into(),
            kind: LoaderKind::User,
            parent: None,
            class_path: Vec::new(),
            modules: Vec::new(),
        }
    }

    /// Attaches a provider when sharing is enabled. Built-in loaders ask
    /// for the boot and cache-directory behaviour, user loaders do not.
    pub fn initialize_sharing(&self, settings: &SharedClassSettings) {
        if !settings.enabled {
            return;
        }
        let Some(factory) = settings.factory.as_deref() else {
            return;
        };
        let builtin = self.kind.is_builtin();
        self.bridge.initialize(
            factory,
            ProviderOwner {
                id: self.id,
                name: &self.name,
            },
            &self.class_path.urls(),
            builtin,
            builtin,
        );
    }

    pub fn id(&self) -> LoaderId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> LoaderKind {
        self.kind
    }

    pub fn parent(&self) -> Option<&Arc<ClassLoader>> {
        self.parent.as_ref()
    }

    pub fn bridge(&self) -> &SharedClassBridge {
        &self.bridge
    }

    pub fn class_path(&self) -> &ClassPath {
        &self.class_path
    }

    pub fn package(&self, name: &str) -> Option<Arc<Package>> {
        self.packages.get(name)
    }

    pub(crate) fn weak_self(&self) -> Weak<ClassLoader> {
        self.me.clone()
    }

    /// This loader followed by its parents up to the root.
    pub fn ancestors(self: &Arc<Self>) -> impl Iterator<Item = Arc<ClassLoader>> {
        std::iter::successors(Some(Arc::clone(self)), |l| l.parent.clone())
    }

    /// Appends an entry to the search path and returns its classpath index.
    /// The provider hears about appends in index order.
    pub fn add_class_path(&self, path: impl Into<PathBuf>) -> usize {
        self.class_path
            .push_with(path, |_, url| self.bridge.search_path_appended(url))
    }

    /// Registers a callback run once when this loader is dropped.
    pub fn on_unload(&self, listener: impl FnOnce(LoaderId) + Send + 'static) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.unload_listeners.lock().push((id, Box::new(listener)));
        id
    }

    /// Drops a listener without running it. False if it was not registered.
    pub fn remove_unload_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.unload_listeners.lock();
        let before = listeners.len();
        listeners.retain(|(registered, _)| *registered != id);
        listeners.len() != before
    }

    pub fn unload_listener_count(&self) -> usize {
        self.unload_listeners.lock().len()
    }

    pub fn find_loaded_class(&self, name: &str) -> Option<ClassRef> {
        self.classes.read().get(name).cloned()
    }

    pub fn loaded_classes(&self) -> usize {
        self.classes.read().len()
    }

    /// Parent-first lookup without initialization.
    pub fn load_class(&self, name: &str) -> Result<ClassRef, LoadError> {
        if let Some(class) = self.find_loaded_class(name) {
            return Ok(class);
        }

        let lock = Arc::clone(
            self.loading_locks
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        );
        let _guard = lock.lock();
        if let Some(class) = self.find_loaded_class(name) {
            return Ok(class);
        }

        if let Some(parent) = self.parent.as_ref() {
            match parent.load_class(name) {
                Ok(class) => return Ok(class),
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }
        }
        self.find_class(name)
    }

    /// Finds `name` in this loader only.
    #[instrument(skip(self), fields(loader = %self.id))]
    pub fn find_class(&self, name: &str) -> Result<ClassRef, LoadError> {
        let found = match package_name(name).and_then(|p| self.module_for(p)) {
            Some(module) => self.find_in_module(module, name)?,
            None => self.find_on_class_path(name)?,
        };
        found.ok_or_else(|| LoadError::ClassNotFound(name.to_string()))
    }

    fn module_for(&self, package: &str) -> Option<&ModuleLocation> {
        self.modules.iter().find(|m| m.owns(package))
    }

    fn find_on_class_path(&self, name: &str) -> Result<Option<ClassRef>, LoadError> {
        let entry = class_name_to_class_path(name);
        match self.bridge.lookup_classpath(name) {
            // A root searched earlier now holds the class too and wins.
            CacheLookup::Hit { index, .. } if self.class_path.is_shadowed(&entry, index) => {
                debug!(name, index, "cached class shadowed by an earlier entry");
            }
            CacheLookup::Hit {
                bytes,
                index,
                metadata,
            } => match self.define_from_cache(name, &bytes, &metadata, index) {
                Ok(class) => return Ok(Some(class)),
                Err(err) if err.is_cache_recoverable() => {
                    warn!(name, error = %err, "cached definition failed; loading from class path");
                }
                Err(err) => return Err(err),
            },
            CacheLookup::Orphan { .. } | CacheLookup::Miss | CacheLookup::Failed(_) => {}
        }

        let Some(res) = self.class_path.get_resource(&entry)? else {
            return Ok(None);
        };
        self.define_from_resource(name, res).map(Some)
    }

    fn define_from_cache(
        &self,
        name: &str,
        bytes: &[u8],
        metadata: &MetadataRecord,
        index: usize,
    ) -> Result<ClassRef, LoadError> {
        let package = match package_name(name) {
            Some(pkg) => Some(self.packages.define_or_verify(
                pkg,
                metadata.manifest.as_deref(),
                metadata.code_source.location.as_deref(),
            )?),
            None => None,
        };
        debug!(name, index, "defining class from shared cache");
        self.define_class(
            name,
            bytes,
            metadata.code_source.clone(),
            package,
            ClassOrigin::SharedCache { index },
        )
    }

    fn define_from_resource(&self, name: &str, res: Resource) -> Result<ClassRef, LoadError> {
        let url = res.code_source_url.as_str();
        let package = match package_name(name) {
            Some(pkg) => Some(self.packages.define_or_verify(
                pkg,
                res.manifest.as_deref(),
                Some(url),
            )?),
            None => None,
        };
        let code_source = CodeSource::new(url, res.signers.clone());
        let class = self.define_class(
            name,
            &res.bytes,
            code_source.clone(),
            package,
            ClassOrigin::ClassPath { index: res.index },
        )?;

        let manifest = res.manifest.clone();
        let _ = self
            .bridge
            .store_classpath(name, &res.bytes, res.index, || MetadataRecord {
                code_source,
                manifest,
            });
        Ok(class)
    }

    fn find_in_module(
        &self,
        module: &ModuleLocation,
        name: &str,
    ) -> Result<Option<ClassRef>, LoadError> {
        if !module.is_patched() {
            match self.bridge.lookup_url(module.file_url(), name) {
                ModuleLookup::Hit(bytes) => {
                    let code_source = CodeSource::new(module.code_source_url(), Vec::new());
                    let origin = ClassOrigin::SharedModule {
                        module: module.name().to_string(),
                    };
                    match self.define_class(name, &bytes, code_source, None, origin) {
                        Ok(class) => return Ok(Some(class)),
                        Err(err) if err.is_cache_recoverable() => {
                            warn!(name, error = %err, "cached definition failed; reading module");
                        }
                        Err(err) => return Err(err),
                    }
                }
                ModuleLookup::Miss | ModuleLookup::Failed(_) => {}
            }
        }

        let Some((found, patched)) = module.read(&class_name_to_class_path(name))? else {
            return Ok(None);
        };
        let location = match module.patch_url() {
            Some(url) if patched => url,
            _ => module.code_source_url(),
        };
        let class = self.define_class(
            name,
            &found.bytes,
            CodeSource::new(location, Vec::new()),
            None,
            ClassOrigin::Module {
                module: module.name().to_string(),
                patched,
            },
        )?;
        if !patched {
            let _ = self.bridge.store_url(module.file_url(), name, &found.bytes);
        }
        Ok(Some(class))
    }

    fn define_class(
        &self,
        name: &str,
        bytes: &[u8],
        code_source: CodeSource,
        package: Option<Arc<Package>>,
        origin: ClassOrigin,
    ) -> Result<ClassRef, LoadError> {
        let class = Arc::new(Class::define(
            name,
            bytes,
            self,
            code_source,
            package,
            origin,
        )?);
        let mut classes = self.classes.write();
        Ok(Arc::clone(
            classes.entry(name.to_string()).or_insert(class),
        ))
    }
}

impl Drop for ClassLoader {
    fn drop(&mut self) {
        let listeners = std::mem::take(self.unload_listeners.get_mut());
        for (_, listener) in listeners {
            listener(self.id);
        }
    }
}

/// bootstrap <- platform <- application. The application loader is the
/// system loader.
#[derive(Debug, Clone)]
pub struct LoaderHierarchy {
    pub boot: Arc<ClassLoader>,
    pub platform: Arc<ClassLoader>,
    pub app: Arc<ClassLoader>,
}

#[derive(Default)]
pub struct HierarchyBuilder {
    boot_class_path: Vec<PathBuf>,
    boot_modules: Vec<ModuleLocation>,
    platform_class_path: Vec<PathBuf>,
    platform_modules: Vec<ModuleLocation>,
    app_class_path: Vec<PathBuf>,
}

impl HierarchyBuilder {
    pub fn boot_class_path(mut self, paths: impl IntoIterator<Item = PathBuf>) -> Self {
        self.boot_class_path.extend(paths);
        self
    }

    pub fn boot_module(mut self, module: ModuleLocation) -> Self {
        self.boot_modules.push(module);
        self
    }

    pub fn platform_class_path(mut self, paths: impl IntoIterator<Item = PathBuf>) -> Self {
        self.platform_class_path.extend(paths);
        self
    }

    pub fn platform_module(mut self, module: ModuleLocation) -> Self {
        self.platform_modules.push(module);
        self
    }

    pub fn app_class_path(mut self, paths: impl IntoIterator<Item = PathBuf>) -> Self {
        self.app_class_path.extend(paths);
        self
    }

    pub fn build(self, settings: &SharedClassSettings) -> LoaderHierarchy {
        let mut boot = ClassLoader::builder("bootstrap")
            .kind(LoaderKind::Bootstrap)
            .class_path(self.boot_class_path);
        for module in self.boot_modules {
            boot = boot.module(module);
        }
        let boot = boot.build(settings);

        let mut platform = ClassLoader::builder("platform")
            .kind(LoaderKind::Platform)
            .parent(&boot)
            .class_path(self.platform_class_path);
        for module in self.platform_modules {
            platform = platform.module(module);
        }
        let platform = platform.build(settings);

        let app = ClassLoader::builder("app")
            .kind(LoaderKind::Application)
            .parent(&platform)
            .class_path(self.app_class_path)
            .build(settings);

        LoaderHierarchy {
            boot,
            platform,
            app,
        }
    }
}

impl LoaderHierarchy {
    pub fn builder() -> HierarchyBuilder {
        HierarchyBuilder::default()
    }

    pub fn system_loader(&self) -> &Arc<ClassLoader> {
        &self.app
    }

    /// A user loader delegating to the system loader.
    pub fn user_loader(
        &self,
        name: &str,
        class_path: impl IntoIterator<Item = PathBuf>,
        settings: &SharedClassSettings,
    ) -> Arc<ClassLoader> {
        ClassLoader::builder(name)
            .parent(&self.app)
            .class_path(class_path)
            .build(settings)
    }
}
