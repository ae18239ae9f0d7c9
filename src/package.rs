//! Per-loader package table and sealing checks.
//!
//! The checks run the same way whether a class comes from the shared cache
//! or from a fresh resource lookup.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::LoadError;
use crate::manifest::{self, Manifest, package_entry};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Package {
    pub name: String,
    pub spec_title: Option<String>,
    pub spec_version: Option<String>,
    pub spec_vendor: Option<String>,
    pub impl_title: Option<String>,
    pub impl_version: Option<String>,
    pub impl_vendor: Option<String>,
    /// Code-source URL the package is sealed to.
    pub seal_base: Option<String>,
}

impl Package {
    pub fn unnamed(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn from_manifest(name: &str, man: &Manifest, url: Option<&str>) -> Self {
        let entry = package_entry(name);
        let attr = |key: &str| man.lookup(&entry, key).map(str::to_string);
        let seal_base = if man.is_sealed(name) {
            url.map(str::to_string)
        } else {
            None
        };
        Self {
            name: name.to_string(),
            spec_title: attr(manifest::SPECIFICATION_TITLE),
            spec_version: attr(manifest::SPECIFICATION_VERSION),
            spec_vendor: attr(manifest::SPECIFICATION_VENDOR),
            impl_title: attr(manifest::IMPLEMENTATION_TITLE),
            impl_version: attr(manifest::IMPLEMENTATION_VERSION),
            impl_vendor: attr(manifest::IMPLEMENTATION_VENDOR),
            seal_base,
        }
    }

    pub fn is_sealed(&self) -> bool {
        self.seal_base.is_some()
    }

    pub fn is_sealed_to(&self, url: Option<&str>) -> bool {
        self.seal_base.as_deref() == url
    }
}

#[derive(Debug, Default)]
pub struct PackageTable {
    packages: RwLock<HashMap<String, Arc<Package>>>,
}

impl PackageTable {
    pub fn get(&self, name: &str) -> Option<Arc<Package>> {
        self.packages.read().get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.packages.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the package `name`, defining it from `man` if this loader has
    /// not seen it yet, and verifies sealing against `url` otherwise.
    pub fn define_or_verify(
        &self,
        name: &str,
        man: Option<&Manifest>,
        url: Option<&str>,
    ) -> Result<Arc<Package>, LoadError> {
        if let Some(existing) = self.get(name) {
            verify(&existing, man, url)?;
            return Ok(existing);
        }

        let mut packages = self.packages.write();
        if let Some(existing) = packages.get(name) {
            // Lost a definition race; the winner's package still has to match.
            verify(existing, man, url)?;
            return Ok(Arc::clone(existing));
        }
        let package = Arc::new(match man {
            Some(man) => Package::from_manifest(name, man, url),
            None => Package::unnamed(name),
        });
        packages.insert(name.to_string(), Arc::clone(&package));
        Ok(package)
    }
}

fn verify(pkg: &Package, man: Option<&Manifest>, url: Option<&str>) -> Result<(), LoadError> {
    if pkg.is_sealed() {
        if !pkg.is_sealed_to(url) {
            return Err(LoadError::sealed(&pkg.name));
        }
    } else if man.is_some_and(|m| m.is_sealed(&pkg.name)) {
        return Err(LoadError::cannot_seal(&pkg.name));
    }
    Ok(())
}
