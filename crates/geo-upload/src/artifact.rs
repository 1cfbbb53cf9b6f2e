use std::fs;
use std::io::Cursor;
use std::path::Path;

use exif::{Context, Reader};

use crate::error::{Error, Rejection, Result};

/// One captured image payload.
#[derive(Clone, PartialEq, Eq)]
pub struct Artifact {
    bytes: Vec<u8>,
}

impl std::fmt::Debug for Artifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Artifact")
            .field("size", &self.bytes.len())
            .finish()
    }
}

impl Artifact {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)
            .map_err(|e| Error::msg(format!("failed to read {}: {e}", path.display())))?;
        Ok(Self::new(bytes))
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_geotagged(&self) -> bool {
        is_geotagged(&self.bytes)
    }
}

/// True when the image carries at least one EXIF GPS field.
pub fn is_geotagged(bytes: &[u8]) -> bool {
    let mut cursor = Cursor::new(bytes);
    match Reader::new().read_from_container(&mut cursor) {
        Ok(exif) => exif.fields().any(|f| f.tag.context() == Context::Gps),
        Err(e) => {
            tracing::trace!(error = %e, "no readable exif block");
            false
        }
    }
}

/// Enqueue-time checks. The absent case is ordinary, the rest are permanent.
pub fn validate(artifact: Option<&Artifact>, max_bytes: usize) -> std::result::Result<(), Rejection> {
    let Some(artifact) = artifact else {
        return Err(Rejection::Missing);
    };
    if !artifact.is_geotagged() {
        return Err(Rejection::NotGeotagged);
    }
    if artifact.size() > max_bytes {
        return Err(Rejection::TooLarge {
            size: artifact.size(),
            limit: max_bytes,
        });
    }
    Ok(())
}
