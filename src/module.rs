//! Module locations owned by a loader.
//!
//! No module graph here: a module is a named root, the packages it owns and
//! an optional patch root searched before it. Classes found in a module are
//! shared with the provider by location URL rather than by classpath index.

use ignore::WalkBuilder;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::error::LoadError;
use crate::resource::{Located, ResourceRoot};

#[derive(Debug)]
pub struct ModuleLocation {
    name: String,
    root: ResourceRoot,
    packages: HashSet<String>,
    patch: Option<ResourceRoot>,
    code_source_url: String,
    file_url: String,
}

impl ModuleLocation {
    pub fn new(
        name: impl Into<String>,
        root: impl Into<PathBuf>,
        packages: impl IntoIterator<Item = String>,
    ) -> Self {
        let root = ResourceRoot::new(root);
        let code_source_url = root.url().to_string();
        Self {
            name: name.into(),
            file_url: code_source_url.clone(),
            code_source_url,
            root,
            packages: packages.into_iter().collect(),
            patch: None,
        }
    }

    /// A module served from the runtime image. Its code source is
    /// `jrt:/<name>`; the provider is handed the jimage file instead when one
    /// is configured.
    pub fn runtime_image(
        name: impl Into<String>,
        root: impl Into<PathBuf>,
        packages: impl IntoIterator<Item = String>,
        jimage: Option<&Path>,
    ) -> Self {
        let mut module = Self::new(name, root, packages);
        module.code_source_url = format!("jrt:/{}", module.name);
        module.file_url = convert_jrt_to_file_url(&module.code_source_url, jimage);
        module
    }

    pub fn with_patch(mut self, patch: impl Into<PathBuf>) -> Self {
        self.patch = Some(ResourceRoot::new(patch));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owns(&self, package: &str) -> bool {
        self.packages.contains(package)
    }

    pub fn is_patched(&self) -> bool {
        self.patch.is_some()
    }

    pub fn code_source_url(&self) -> &str {
        &self.code_source_url
    }

    pub fn patch_url(&self) -> Option<&str> {
        self.patch.as_ref().map(ResourceRoot::url)
    }

    /// Location handed to the shared-class provider.
    pub fn file_url(&self) -> &str {
        &self.file_url
    }

    /// Reads `name`, patch root first. The flag is true when the bytes came
    /// from the patch root and must not be shared.
    pub fn read(&self, name: &str) -> Result<Option<(Located, bool)>, LoadError> {
        if let Some(patch) = self.patch.as_ref()
            && let Some(found) = patch.read(name)?
        {
            return Ok(Some((found, true)));
        }
        Ok(self.root.read(name)?.map(|found| (found, false)))
    }
}

/// Packages with at least one class file under `root`.
pub fn discover_packages(root: &Path) -> HashSet<String> {
    WalkBuilder::new(root)
        .hidden(false)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .build()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_some_and(|t| t.is_file()))
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "class"))
        .filter_map(|e| {
            let dir = e.path().strip_prefix(root).ok()?.parent()?;
            if dir.as_os_str().is_empty() {
                return None;
            }
            Some(dir.to_string_lossy().replace(['/', '\\'], "."))
        })
        .collect()
}

pub fn convert_jrt_to_file_url(code_source_url: &str, jimage: Option<&Path>) -> String {
    match jimage {
        Some(image) if code_source_url.starts_with("jrt:") => {
            crate::resource::file_url(image, false)
        }
        _ => code_source_url.to_string(),
    }
}
