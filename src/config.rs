use anyhow::{Context, Result};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use crate::cli::Cli;
use crate::provider::ProviderFactory;
use crate::provider::lmdb::lock_path;

pub const ENABLED_ENV: &str = "CLASS_SHARE_ENABLED";
pub const JIMAGE_ENV: &str = "CLASS_SHARE_JIMAGE";

static ENABLED: OnceLock<bool> = OnceLock::new();

/// The process-wide sharing toggle, read from the environment on first use
/// and fixed afterwards.
pub fn shared_classes_enabled() -> bool {
    *ENABLED.get_or_init(|| parse_flag(env::var(ENABLED_ENV).ok().as_deref()))
}

pub fn parse_flag(raw: Option<&str>) -> bool {
    raw.map(str::trim).is_some_and(|v| {
        v == "1" || v.eq_ignore_ascii_case("true") || v.eq_ignore_ascii_case("yes")
    })
}

/// What a loader needs to attach to a shared-class provider.
#[derive(Clone, Default)]
pub struct SharedClassSettings {
    pub enabled: bool,
    pub factory: Option<Arc<dyn ProviderFactory>>,
}

impl std::fmt::Debug for SharedClassSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedClassSettings")
            .field("enabled", &self.enabled)
            .field("factory", &self.factory.is_some())
            .finish()
    }
}

impl SharedClassSettings {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn with_factory(factory: Arc<dyn ProviderFactory>) -> Self {
        Self {
            enabled: true,
            factory: Some(factory),
        }
    }

    pub fn from_env(factory: Option<Arc<dyn ProviderFactory>>) -> Self {
        Self {
            enabled: shared_classes_enabled(),
            factory,
        }
    }
}

pub fn jimage_path() -> Option<PathBuf> {
    env::var_os(JIMAGE_ENV)
        .map(PathBuf::from)
        .filter(|p| p.is_file())
}

pub fn resolve_db_path(cli: &Cli) -> Result<PathBuf> {
    if let Some(p) = cli.db.clone() {
        return Ok(p);
    }

    Ok(class_share_home()?.join("classes.lmdb"))
}

pub fn clear_db(db_path: &Path) -> Result<()> {
    remove_file_if_exists(db_path, "db")?;
    remove_file_if_exists(&lock_path(db_path), "db lock")?;
    Ok(())
}

fn class_share_home() -> Result<PathBuf> {
    let base = dirs::data_local_dir()
        .or_else(dirs::cache_dir)
        .or_else(dirs::home_dir)
        .ok_or_else(|| anyhow::anyhow!("Failed to resolve data directory"))?;
    Ok(base.join("class-share"))
}

fn remove_file_if_exists(path: &Path, kind: &str) -> Result<()> {
    if path.exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("Failed to remove {kind} file: {}", path.display()))?;
    }
    Ok(())
}
