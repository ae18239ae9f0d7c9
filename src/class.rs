use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::error::LoadError;
use crate::loader::ClassLoader;
use crate::package::Package;

pub const CLASS_MAGIC: [u8; 4] = [0xCA, 0xFE, 0xBA, 0xBE];

static NEXT_LOADER_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique loader identity. Never reused, so it is safe to keep in a
/// table after the loader itself is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct LoaderId(u64);

impl LoaderId {
    pub(crate) fn next() -> Self {
        Self(NEXT_LOADER_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for LoaderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "loader#{}", self.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize)]
pub struct CodeSource {
    pub location: Option<String>,
    pub signers: Vec<String>,
}

impl CodeSource {
    pub fn new(location: impl Into<String>, signers: Vec<String>) -> Self {
        Self {
            location: Some(location.into()),
            signers,
        }
    }
}

/// Where the bytes of a defined class came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClassOrigin {
    SharedCache { index: usize },
    SharedModule { module: String },
    ClassPath { index: usize },
    Module { module: String, patched: bool },
}

impl ClassOrigin {
    pub fn is_shared(&self) -> bool {
        matches!(self, Self::SharedCache { .. } | Self::SharedModule { .. })
    }
}

pub type ClassRef = Arc<Class>;

#[derive(Debug)]
pub struct Class {
    name: String,
    loader_id: LoaderId,
    loader: Weak<ClassLoader>,
    code_source: CodeSource,
    package: Option<Arc<Package>>,
    origin: ClassOrigin,
    size: usize,
}

impl Class {
    pub(crate) fn define(
        name: &str,
        bytes: &[u8],
        loader: &ClassLoader,
        code_source: CodeSource,
        package: Option<Arc<Package>>,
        origin: ClassOrigin,
    ) -> Result<Self, LoadError> {
        if bytes.len() < CLASS_MAGIC.len() || bytes[..4] != CLASS_MAGIC {
            return Err(LoadError::ClassFormat {
                name: name.to_string(),
                reason: "bad magic number".to_string(),
            });
        }
        Ok(Self {
            name: name.to_string(),
            loader_id: loader.id(),
            loader: loader.weak_self(),
            code_source,
            package,
            origin,
            size: bytes.len(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn loader_id(&self) -> LoaderId {
        self.loader_id
    }

    /// The defining loader, if it is still alive.
    pub fn loader(&self) -> Option<Arc<ClassLoader>> {
        self.loader.upgrade()
    }

    pub fn code_source(&self) -> &CodeSource {
        &self.code_source
    }

    pub fn package(&self) -> Option<&Arc<Package>> {
        self.package.as_ref()
    }

    pub fn origin(&self) -> &ClassOrigin {
        &self.origin
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

pub fn package_name(class_name: &str) -> Option<&str> {
    class_name.rfind('.').map(|i| &class_name[..i])
}

pub fn class_name_to_class_path(class_name: &str) -> String {
    format!("{}.class", class_name.replace('.', "/"))
}
