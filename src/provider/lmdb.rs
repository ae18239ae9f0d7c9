//! Persistent class store backed by LMDB (via heed).
//!
//! Entries survive the process, so a new loader can get a cache hit for an
//! index it has no metadata for yet.

use anyhow::{Context, Result};
use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvFlags, EnvOpenOptions};
use std::path::{Path, PathBuf};

use super::ClassStore;
use crate::error::ProviderError;

pub const SHARED_CLASSES_DB: &str = "shared_classes";

const DEFAULT_MAP_SIZE: usize = 512 * 1024 * 1024;
const DEFAULT_MAX_DBS: u32 = 4;

#[derive(Debug)]
pub struct LmdbStore {
    env: Env,
    db_path: PathBuf,
    classes: Database<Str, Bytes>,
}

impl LmdbStore {
    pub fn open(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create cache directory: {}", parent.display())
            })?;
        }

        let env = open_env(&db_path)?;
        let mut wtxn = env.write_txn()?;
        let classes = env.create_database::<Str, Bytes>(&mut wtxn, Some(SHARED_CLASSES_DB))?;
        wtxn.commit()?;

        Ok(Self {
            env,
            db_path,
            classes,
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }
}

impl ClassStore for LmdbStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ProviderError> {
        let rtxn = self.env.read_txn()?;
        Ok(self.classes.get(&rtxn, key)?.map(<[u8]>::to_vec))
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), ProviderError> {
        let mut wtxn = self.env.write_txn()?;
        self.classes.put(&mut wtxn, key, bytes)?;
        wtxn.commit()?;
        Ok(())
    }

    fn len(&self) -> Result<u64, ProviderError> {
        let rtxn = self.env.read_txn()?;
        Ok(self.classes.len(&rtxn)?)
    }
}

fn open_env(db_path: &Path) -> Result<Env> {
    let mut options = EnvOpenOptions::new();
    options.map_size(DEFAULT_MAP_SIZE);
    options.max_dbs(DEFAULT_MAX_DBS);
    // SAFETY: Default LMDB locking stays on. NO_SUB_DIR keeps the store a
    // single file at `db_path`.
    unsafe {
        options.flags(EnvFlags::NO_SUB_DIR);
        options
            .open(db_path)
            .with_context(|| format!("Failed to create/open db env: {}", db_path.display()))
    }
}

pub fn lock_path(db_path: &Path) -> PathBuf {
    let mut os = db_path.as_os_str().to_os_string();
    os.push("-lock");
    PathBuf::from(os)
}
