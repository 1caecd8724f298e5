//! Sources for locally served values and the file-name to path mapping.

use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::config::LinkConfig;
use crate::wait::lock;

/// A local reading could not be taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("value unavailable")]
pub struct Unavailable;

/// Answers the peer's degree and light requests.
pub trait ValueProvider: Send + Sync {
    fn degree(&self) -> Result<f32, Unavailable>;
    fn light_value(&self) -> Result<f32, Unavailable>;
}

/// Maps a wire file name to a local path. `None` refuses the name.
pub trait FileLocalizer: Send + Sync {
    fn path_for(&self, name: &str) -> Option<PathBuf>;
}

/// Resolves plain file names inside one directory.
#[derive(Debug, Clone)]
pub struct DirectoryLocalizer {
    root: PathBuf,
}

impl DirectoryLocalizer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl FileLocalizer for DirectoryLocalizer {
    fn path_for(&self, name: &str) -> Option<PathBuf> {
        let mut parts = Path::new(name).components();
        match (parts.next(), parts.next()) {
            (Some(Component::Normal(_)), None) => Some(self.root.join(name)),
            _ => None,
        }
    }
}

/// Last set readings; useful when values are pushed in from elsewhere.
#[derive(Debug, Default)]
pub struct SharedReadings {
    degree: Mutex<Option<f32>>,
    light: Mutex<Option<f32>>,
}

impl SharedReadings {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_degree(&self, v: f32) {
        *lock(&self.degree) = Some(v);
    }

    pub fn set_light_value(&self, v: f32) {
        *lock(&self.light) = Some(v);
    }
}

impl ValueProvider for SharedReadings {
    fn degree(&self) -> Result<f32, Unavailable> {
        lock(&self.degree).ok_or(Unavailable)
    }

    fn light_value(&self) -> Result<f32, Unavailable> {
        lock(&self.light).ok_or(Unavailable)
    }
}

/// Providers a link consults when answering requests.
#[derive(Clone)]
pub struct Providers {
    pub values: Option<Arc<dyn ValueProvider>>,
    pub files: Arc<dyn FileLocalizer>,
}

impl Providers {
    /// No value provider; files resolve inside `config.file_dir`.
    pub fn new(config: &LinkConfig) -> Self {
        Self {
            values: None,
            files: Arc::new(DirectoryLocalizer::new(config.file_dir.clone())),
        }
    }

    /// Degree to answer with; the sentinel -1 when nothing can be read.
    pub fn degree_or_sentinel(&self) -> f32 {
        self.values
            .as_ref()
            .and_then(|v| v.degree().ok())
            .unwrap_or(-1.0)
    }

    pub fn light_or_sentinel(&self) -> f32 {
        self.values
            .as_ref()
            .and_then(|v| v.light_value().ok())
            .unwrap_or(-1.0)
    }
}
