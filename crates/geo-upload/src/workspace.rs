use std::fs;
use std::path::Component;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

fn default_root_dir() -> String {
    ".geo-upload".into()
}

fn default_counter_file() -> String {
    "upload_tracker.json".into()
}

fn default_cache_dir() -> String {
    "UploadQueue".into()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    #[serde(default = "default_root_dir")]
    pub root_dir: String,
    #[serde(default = "default_counter_file")]
    pub counter_file: String,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            counter_file: default_counter_file(),
            cache_dir: default_cache_dir(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoragePaths {
    pub root: PathBuf,
    pub counter_file: PathBuf,
    pub cache_dir: PathBuf,
}

impl StoragePaths {
    /// Lays out the default file names under an explicit root.
    pub fn under(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            counter_file: root.join(default_counter_file()),
            cache_dir: root.join(default_cache_dir()),
            root,
        }
    }
}

pub fn load_paths(cfg: &StorageConfig) -> Result<StoragePaths> {
    let cwd = std::env::current_dir().map_err(|e| Error::msg(format!("cwd error: {e}")))?;
    let root = resolve_user_path(&cwd, &cfg.root_dir)?;
    let counter_file = resolve_under_root(&root, &cfg.counter_file)?;
    let cache_dir = resolve_under_root(&root, &cfg.cache_dir)?;
    Ok(StoragePaths {
        root,
        counter_file,
        cache_dir,
    })
}

pub fn init_dirs(cfg: &StorageConfig) -> Result<StoragePaths> {
    let paths = load_paths(cfg)?;

    fs::create_dir_all(&paths.root).map_err(|e| {
        Error::msg(format!(
            "failed to create storage root {}: {e}",
            paths.root.display()
        ))
    })?;
    fs::create_dir_all(&paths.cache_dir).map_err(|e| {
        Error::msg(format!(
            "failed to create cache_dir {}: {e}",
            paths.cache_dir.display()
        ))
    })?;

    Ok(paths)
}

fn resolve_user_path(base: &Path, p: &str) -> Result<PathBuf> {
    let p = p.trim();
    if p.is_empty() {
        return Err(Error::msg("empty storage root_dir"));
    }
    let pb = PathBuf::from(p);
    Ok(if pb.is_absolute() { pb } else { base.join(pb) })
}

// Storage entries must stay inside the root; absolute values are rejected.
fn resolve_under_root(root: &Path, rel: &str) -> Result<PathBuf> {
    let rel = rel.trim();
    if rel.is_empty() {
        return Err(Error::msg("empty storage path"));
    }
    let rel_pb = Path::new(rel);
    if rel_pb.is_absolute()
        || rel_pb
            .components()
            .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(Error::msg(format!(
            "invalid storage path '{}' (must be relative to root_dir, without '..')",
            rel
        )));
    }
    Ok(root.join(rel_pb))
}
