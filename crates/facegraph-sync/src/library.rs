//! Photo library access: file listing and bitmap decode.

use facegraph_core::types::FileId;
use image::RgbImage;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp", "bmp", "gif", "tif", "tiff"];

#[derive(Error, Debug)]
pub enum LibraryError {
    #[error("library root not found: {0}")]
    RootNotFound(PathBuf),
    #[error("file not in library: {0}")]
    NotFound(FileId),
    #[error("walk: {0}")]
    Walk(#[from] walkdir::Error),
    #[error("decode {file}: {source}")]
    Decode {
        file: FileId,
        #[source]
        source: image::ImageError,
    },
}

pub trait PhotoLibrary: Send + Sync {
    /// All files, sorted by id. The order is the sync job's traversal order.
    fn files(&self) -> Result<Vec<FileId>, LibraryError>;

    fn decode(&self, file_id: &FileId) -> Result<RgbImage, LibraryError>;
}

/// A directory tree of images. File ids are `/`-separated paths relative to
/// the root.
pub struct DirectoryLibrary {
    root: PathBuf,
}

impl DirectoryLibrary {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, LibraryError> {
        let root = root.into();
        if !root.is_dir() {
            return Err(LibraryError::RootNotFound(root));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, file_id: &FileId) -> PathBuf {
        file_id
            .as_str()
            .split('/')
            .fold(self.root.clone(), |path, part| path.join(part))
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

impl PhotoLibrary for DirectoryLibrary {
    fn files(&self) -> Result<Vec<FileId>, LibraryError> {
        let mut files = Vec::new();
        for entry in WalkDir::new(&self.root).follow_links(true) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(error = %e, "skipping unreadable library entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() || !is_image(entry.path()) {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            let id = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            files.push(FileId::new(id));
        }
        files.sort();
        tracing::debug!(root = %self.root.display(), count = files.len(), "listed library");
        Ok(files)
    }

    fn decode(&self, file_id: &FileId) -> Result<RgbImage, LibraryError> {
        let path = self.path_of(file_id);
        if !path.is_file() {
            return Err(LibraryError::NotFound(file_id.clone()));
        }
        let image = image::open(&path).map_err(|source| LibraryError::Decode {
            file: file_id.clone(),
            source,
        })?;
        Ok(image.to_rgb8())
    }
}
