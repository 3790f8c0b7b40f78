//! Hash-keyed cache directory.
//!
//! An item `<name>` is valid iff `<dir>/<name>.hash` holds the SHA-256 of
//! the JSON encoding of the current key. `check` never writes the hash;
//! `mark_valid` does, and only callers that finished recomputing call it.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::{debug, info, warn};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::PipelineError;

pub fn config_hash<K: Serialize>(key: &K) -> Result<String, PipelineError> {
    let json = serde_json::to_vec(key).map_err(|e| PipelineError::Cache {
        path: PathBuf::from("<cache key>"),
        source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
    })?;
    let mut hasher = Sha256::new();
    hasher.update(&json);
    Ok(format!("{:x}", hasher.finalize()))
}

#[derive(Debug)]
pub struct CacheManager {
    dir: PathBuf,
    reset: bool,
    pending: Mutex<HashMap<String, String>>,
}

impl CacheManager {
    pub fn new(dir: impl AsRef<Path>, reset: bool) -> Result<Self, PipelineError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| PipelineError::Cache {
            path: dir.clone(),
            source: e,
        })?;
        Ok(CacheManager {
            dir,
            reset,
            pending: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn hash_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.hash"))
    }

    /// Returns the item path and whether its cached contents may be used.
    pub fn check<K: Serialize>(&self, name: &str, key: &K) -> Result<(PathBuf, bool), PipelineError> {
        let hash = config_hash(key)?;
        let path = self.dir.join(name);
        let stored = fs::read_to_string(self.hash_path(name)).ok();
        let valid = !self.reset && stored.as_deref().map(str::trim) == Some(hash.as_str());
        if valid {
            debug!("cache hit for {name}");
        } else {
            info!("cache miss for {name}, will recompute");
        }
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(name.to_string(), hash);
        }
        Ok((path, valid))
    }

    /// Records the key of the last `check` for `name` as valid.
    pub fn mark_valid(&self, name: &str) -> Result<(), PipelineError> {
        let hash = match self.pending.lock() {
            Ok(mut pending) => pending.remove(name),
            Err(_) => None,
        };
        let Some(hash) = hash else {
            warn!("mark_valid({name}) without a preceding check; ignored");
            return Ok(());
        };
        let path = self.hash_path(name);
        fs::write(&path, hash).map_err(|e| PipelineError::Cache { path, source: e })
    }

    pub fn invalidate(&self, name: &str) -> Result<(), PipelineError> {
        let path = self.hash_path(name);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PipelineError::Cache { path, source: e }),
        }
    }
}
