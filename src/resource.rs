//! Resource resolution over an ordered search path of directories and jars.
//!
//! The position of a root in the search path is its classpath index; it is
//! what the shared-class provider and the metadata store are keyed by.

use ignore::WalkBuilder;
use memmap2::Mmap;
use parking_lot::{Mutex, RwLock};
use std::fs::File;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};
use zip::ZipArchive;

use crate::error::LoadError;
use crate::manifest::{MANIFEST_PATH, Manifest};

pub fn file_url(path: &Path, directory: bool) -> String {
    let abs = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    let mut s = abs.to_string_lossy().replace('\\', "/");
    if !s.starts_with('/') {
        s.insert(0, '/');
    }
    if directory && !s.ends_with('/') {
        s.push('/');
    }
    format!("file:{s}")
}

/// Inverse of `file_url`; `None` for anything but a `file:` URL.
pub fn file_url_to_path(url: &str) -> Option<PathBuf> {
    let rest = url.strip_prefix("file:")?;
    let rest = rest.strip_suffix('/').unwrap_or(rest);
    // `/C:/dir` on Windows.
    let rest = match rest.as_bytes() {
        [b'/', _, b':', ..] => &rest[1..],
        _ => rest,
    };
    Some(PathBuf::from(rest))
}

#[derive(Debug, Clone)]
pub struct Resource {
    pub name: String,
    pub bytes: Vec<u8>,
    pub code_source_url: String,
    pub manifest: Option<Arc<Manifest>>,
    pub signers: Vec<String>,
    pub index: usize,
}

struct JarArchive {
    archive: ZipArchive<Cursor<Mmap>>,
    manifest: Option<Arc<Manifest>>,
    signers: Vec<String>,
}

enum JarState {
    Unopened,
    Open(JarArchive),
    Broken,
}

enum RootKind {
    Directory,
    Jar(Mutex<JarState>),
}

/// One search-path entry: a directory tree or a jar opened on first use.
pub struct ResourceRoot {
    path: PathBuf,
    url: String,
    kind: RootKind,
}

impl std::fmt::Debug for ResourceRoot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ResourceRoot").field(&self.url).finish()
    }
}

/// Bytes plus the per-root context a `Resource` is built from.
pub struct Located {
    pub bytes: Vec<u8>,
    pub manifest: Option<Arc<Manifest>>,
    pub signers: Vec<String>,
}

// Upper bound on the buffer reserved from a zip header's declared size.
const MAX_PREALLOC: usize = 1 << 20;

impl ResourceRoot {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        if path.is_dir() {
            let url = file_url(&path, true);
            Self {
                path,
                url,
                kind: RootKind::Directory,
            }
        } else {
            let url = file_url(&path, false);
            Self {
                path,
                url,
                kind: RootKind::Jar(Mutex::new(JarState::Unopened)),
            }
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether `name` is present, without reading it.
    pub fn contains(&self, name: &str) -> bool {
        match &self.kind {
            RootKind::Directory => self.path.join(name).is_file(),
            RootKind::Jar(state) => {
                let mut state = state.lock();
                let Some(jar) = self.open(&mut state) else {
                    return false;
                };
                jar.archive.by_name(name).is_ok()
            }
        }
    }

    pub fn read(&self, name: &str) -> Result<Option<Located>, LoadError> {
        match &self.kind {
            RootKind::Directory => {
                let file = self.path.join(name);
                if !file.is_file() {
                    return Ok(None);
                }
                Ok(Some(Located {
                    bytes: std::fs::read(&file)?,
                    manifest: None,
                    signers: Vec::new(),
                }))
            }
            RootKind::Jar(state) => {
                let mut state = state.lock();
                let Some(jar) = self.open(&mut state) else {
                    return Ok(None);
                };
                let mut entry = match jar.archive.by_name(name) {
                    Ok(entry) => entry,
                    Err(zip::result::ZipError::FileNotFound) => return Ok(None),
                    Err(err) => return Err(err.into()),
                };
                let hint = usize::try_from(entry.size()).unwrap_or(usize::MAX);
                let mut bytes = Vec::with_capacity(hint.min(MAX_PREALLOC));
                entry.read_to_end(&mut bytes)?;
                Ok(Some(Located {
                    bytes,
                    manifest: jar.manifest.clone(),
                    signers: jar.signers.clone(),
                }))
            }
        }
    }

    fn open<'s>(&self, state: &'s mut JarState) -> Option<&'s mut JarArchive> {
        if let JarState::Unopened = *state {
            *state = match open_jar(&self.path) {
                Ok(jar) => JarState::Open(jar),
                Err(err) => {
                    warn!(jar = %self.path.display(), error = %err, "skipping unreadable jar");
                    JarState::Broken
                }
            };
        }
        match state {
            JarState::Open(jar) => Some(jar),
            JarState::Unopened | JarState::Broken => None,
        }
    }
}

fn open_jar(path: &Path) -> Result<JarArchive, LoadError> {
    let file = File::open(path)?;
    // SAFETY: The file is opened read-only and the mapping lives inside the
    // archive for as long as the archive is used.
    let mmap = unsafe { Mmap::map(&file)? };
    let mut archive = ZipArchive::new(Cursor::new(mmap))?;

    let manifest = match archive.by_name(MANIFEST_PATH) {
        Ok(mut entry) => {
            let mut raw = String::new();
            entry.read_to_string(&mut raw)?;
            Some(Arc::new(Manifest::parse(&raw)))
        }
        Err(_) => None,
    };

    let mut signers: Vec<String> = archive
        .file_names()
        .filter_map(|n| n.strip_prefix("META-INF/"))
        .filter_map(|n| n.strip_suffix(".SF"))
        .filter(|n| !n.contains('/'))
        .map(str::to_string)
        .collect();
    signers.sort();

    debug!(jar = %path.display(), entries = archive.len(), "opened jar");
    Ok(JarArchive {
        archive,
        manifest,
        signers,
    })
}

#[derive(Debug, Default)]
pub struct ClassPath {
    roots: RwLock<Vec<Arc<ResourceRoot>>>,
}

impl ClassPath {
    pub fn new(paths: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            roots: RwLock::new(
                paths
                    .into_iter()
                    .map(|p| Arc::new(ResourceRoot::new(p)))
                    .collect(),
            ),
        }
    }

    /// Appends a root and returns its classpath index.
    pub fn push(&self, path: impl Into<PathBuf>) -> usize {
        self.push_with(path, |_, _| {})
    }

    /// Appends a root and runs `appended(index, url)` before any other
    /// append can take the next index.
    pub fn push_with(
        &self,
        path: impl Into<PathBuf>,
        appended: impl FnOnce(usize, &str),
    ) -> usize {
        let root = Arc::new(ResourceRoot::new(path));
        let mut roots = self.roots.write();
        let index = roots.len();
        appended(index, root.url());
        roots.push(root);
        index
    }

    pub fn len(&self) -> usize {
        self.roots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn urls(&self) -> Vec<String> {
        self.roots.read().iter().map(|r| r.url().to_string()).collect()
    }

    pub fn root(&self, index: usize) -> Option<Arc<ResourceRoot>> {
        self.roots.read().get(index).cloned()
    }

    /// Whether a root before `index` also holds `name`.
    pub fn is_shadowed(&self, name: &str, index: usize) -> bool {
        let roots: Vec<Arc<ResourceRoot>> = self.roots.read().iter().take(index).cloned().collect();
        roots.iter().any(|root| root.contains(name))
    }

    /// First match in search-path order.
    pub fn get_resource(&self, name: &str) -> Result<Option<Resource>, LoadError> {
        let roots: Vec<Arc<ResourceRoot>> = self.roots.read().clone();
        for (index, root) in roots.iter().enumerate() {
            if let Some(found) = root.read(name)? {
                return Ok(Some(Resource {
                    name: name.to_string(),
                    bytes: found.bytes,
                    code_source_url: root.url().to_string(),
                    manifest: found.manifest,
                    signers: found.signers,
                    index,
                }));
            }
        }
        Ok(None)
    }
}

/// Splits a platform path list and expands `dir/*` into the jars of `dir`.
pub fn parse_path_list(raw: &str) -> Vec<PathBuf> {
    let mut out = Vec::new();
    for part in std::env::split_paths(raw) {
        if part.as_os_str().is_empty() {
            continue;
        }
        if part.file_name().is_some_and(|n| n == "*") {
            let dir = part.parent().unwrap_or_else(|| Path::new("."));
            out.extend(jars_in(dir));
        } else {
            out.push(part);
        }
    }
    out
}

fn jars_in(dir: &Path) -> Vec<PathBuf> {
    let mut jars: Vec<PathBuf> = WalkBuilder::new(dir)
        .max_depth(Some(1))
        .hidden(false)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .build()
        .filter_map(Result::ok)
        .map(|e| e.into_path())
        .filter(|p| p.extension().is_some_and(|e| e.eq_ignore_ascii_case("jar")))
        .collect();
    jars.sort();
    jars
}
