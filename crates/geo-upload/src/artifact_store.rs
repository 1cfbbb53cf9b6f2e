use std::fs;
use std::path::{Path, PathBuf};

pub const ARTIFACT_EXTENSION: &str = "jpg";

/// Path of one persisted artifact awaiting upload.
pub type Location = PathBuf;

/// One file per pending artifact inside a dedicated cache directory.
///
/// I/O failures never propagate out of this type: they are logged and
/// reported as `None`, `false` or an empty listing.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn save(&self, bytes: &[u8]) -> Option<Location> {
        if let Err(e) = fs::create_dir_all(&self.dir) {
            tracing::warn!(dir = %self.dir.display(), error = %e, "failed to create artifact cache dir");
            return None;
        }
        // v7 ids sort in creation order, which `enumerate` relies on.
        let name = format!("{}.{}", uuid::Uuid::now_v7(), ARTIFACT_EXTENSION);
        let path = self.dir.join(name);
        match fs::write(&path, bytes) {
            Ok(()) => Some(path),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to persist artifact");
                None
            }
        }
    }

    /// Persisted artifacts in save order.
    pub fn enumerate(&self) -> Vec<Location> {
        let rd = match fs::read_dir(&self.dir) {
            Ok(rd) => rd,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(dir = %self.dir.display(), error = %e, "failed to list artifact cache dir");
                }
                return Vec::new();
            }
        };
        let mut found = rd
            .filter_map(|ent| ent.ok())
            .map(|ent| ent.path())
            .filter(|p| is_artifact_file(p))
            .collect::<Vec<_>>();
        found.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
        found
    }

    pub fn load(&self, location: &Path) -> Option<Vec<u8>> {
        match fs::read(location) {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                tracing::warn!(path = %location.display(), error = %e, "artifact unreadable");
                None
            }
        }
    }

    pub fn contains(&self, bytes: &[u8]) -> bool {
        self.find_matching(bytes).is_some()
    }

    /// Deletes the first persisted artifact whose content equals `bytes`.
    pub fn remove_matching(&self, bytes: &[u8]) -> bool {
        match self.find_matching(bytes) {
            Some(path) => self.remove(&path),
            None => false,
        }
    }

    pub fn remove(&self, location: &Path) -> bool {
        match fs::remove_file(location) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(path = %location.display(), error = %e, "failed to remove artifact");
                false
            }
        }
    }

    fn find_matching(&self, bytes: &[u8]) -> Option<Location> {
        let rd = fs::read_dir(&self.dir).ok()?;
        for ent in rd.filter_map(|e| e.ok()) {
            let path = ent.path();
            if !is_artifact_file(&path) {
                continue;
            }
            // Length check first so most candidates are skipped without a read.
            let same_len = ent
                .metadata()
                .map(|m| m.len() == bytes.len() as u64)
                .unwrap_or(false);
            if !same_len {
                continue;
            }
            if fs::read(&path).is_ok_and(|data| data == bytes) {
                return Some(path);
            }
        }
        None
    }
}

fn is_artifact_file(path: &Path) -> bool {
    path.is_file() && path.extension().and_then(|e| e.to_str()) == Some(ARTIFACT_EXTENSION)
}
