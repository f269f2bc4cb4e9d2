use crate::audio_data::{AudioReader, SymphoniaReader};
use crate::error::Result;
use std::path::{Path, PathBuf};

/// Opens decode readers for asset URIs.
///
/// The registry calls [`open_now`](Self::open_now) from its background load
/// thread for new assets, and directly when a second independent reader is
/// needed for an asset whose reader is already in use.
pub trait AssetLoader: Send + Sync {
    fn open_now(&self, uri: &str) -> Result<Box<dyn AudioReader>>;
}

impl<F> AssetLoader for F
where
    F: Fn(&str) -> Result<Box<dyn AudioReader>> + Send + Sync,
{
    fn open_now(&self, uri: &str) -> Result<Box<dyn AudioReader>> {
        self(uri)
    }
}

/// Loads assets from the file system with Symphonia.
///
/// Relative URIs are resolved against `root` when one is set.
#[derive(Debug, Clone, Default)]
pub struct FileAssetLoader {
    root: Option<PathBuf>,
}

impl FileAssetLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    fn resolve(&self, uri: &str) -> PathBuf {
        let path = Path::new(uri);
        match &self.root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path.to_path_buf(),
        }
    }
}

impl AssetLoader for FileAssetLoader {
    fn open_now(&self, uri: &str) -> Result<Box<dyn AudioReader>> {
        let path = self.resolve(uri);
        log::debug!("Opening audio file {}", path.display());
        Ok(Box::new(SymphoniaReader::open(&path)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_relative_to_root() {
        let loader = FileAssetLoader::with_root("/assets");
        assert_eq!(loader.resolve("music/a.wav"), PathBuf::from("/assets/music/a.wav"));
        assert_eq!(loader.resolve("/abs/b.wav"), PathBuf::from("/abs/b.wav"));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let loader = FileAssetLoader::new();
        assert!(loader.open_now("/definitely/not/here.wav").is_err());
    }
}
