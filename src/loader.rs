//! Template resource loaders.

use std::collections::HashMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use crate::error::TemplateError;

/// Source of raw template text, addressed by a logical path such as
/// `rdb/v1_3/createTripTable`.
pub trait TemplateLoader {
    /// Return the raw markup for `path`.
    fn load(&self, path: &str) -> Result<String, TemplateError>;

    /// Whether `path` can be loaded.
    fn contains(&self, path: &str) -> bool {
        self.load(path).is_ok()
    }
}

impl<T: TemplateLoader + ?Sized> TemplateLoader for &T {
    fn load(&self, path: &str) -> Result<String, TemplateError> {
        (**self).load(path)
    }

    fn contains(&self, path: &str) -> bool {
        (**self).contains(path)
    }
}

impl<T: TemplateLoader + ?Sized> TemplateLoader for Arc<T> {
    fn load(&self, path: &str) -> Result<String, TemplateError> {
        (**self).load(path)
    }

    fn contains(&self, path: &str) -> bool {
        (**self).contains(path)
    }
}

/// An absent loader holds nothing.
impl<T: TemplateLoader> TemplateLoader for Option<T> {
    fn load(&self, path: &str) -> Result<String, TemplateError> {
        match self {
            Some(loader) => loader.load(path),
            None => Err(TemplateError::NotFound {
                path: path.to_string(),
            }),
        }
    }

    fn contains(&self, path: &str) -> bool {
        self.as_ref().is_some_and(|loader| loader.contains(path))
    }
}

/// Loads `<root>/<path>.sql` from disk.
#[derive(Debug, Clone)]
pub struct DirectoryLoader {
    root: PathBuf,
}

impl DirectoryLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a logical path to a file, refusing anything that would escape
    /// the root directory.
    fn file_for(&self, path: &str) -> Option<PathBuf> {
        let relative = Path::new(path);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if path.is_empty() || escapes {
            return None;
        }
        Some(self.root.join(format!("{}.sql", path)))
    }
}

impl TemplateLoader for DirectoryLoader {
    fn load(&self, path: &str) -> Result<String, TemplateError> {
        let not_found = || TemplateError::NotFound {
            path: path.to_string(),
        };
        let file = self.file_for(path).ok_or_else(not_found)?;
        fs::read_to_string(&file).map_err(|_| not_found())
    }

    fn contains(&self, path: &str) -> bool {
        self.file_for(path).is_some_and(|f| f.is_file())
    }
}

/// Templates held in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryLoader {
    templates: HashMap<String, String>,
}

impl MemoryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a template (builder style).
    pub fn with(mut self, path: impl Into<String>, text: impl Into<String>) -> Self {
        self.insert(path, text);
        self
    }

    pub fn insert(&mut self, path: impl Into<String>, text: impl Into<String>) {
        self.templates.insert(path.into(), text.into());
    }

    /// Registered paths, sorted.
    pub fn paths(&self) -> Vec<&str> {
        let mut paths: Vec<&str> = self.templates.keys().map(String::as_str).collect();
        paths.sort_unstable();
        paths
    }
}

impl TemplateLoader for MemoryLoader {
    fn load(&self, path: &str) -> Result<String, TemplateError> {
        self.templates
            .get(path)
            .cloned()
            .ok_or_else(|| TemplateError::NotFound {
                path: path.to_string(),
            })
    }

    fn contains(&self, path: &str) -> bool {
        self.templates.contains_key(path)
    }
}

/// Looks in `primary` first, then `fallback`. Used to let a templates
/// directory override individual built-in templates.
#[derive(Debug, Clone)]
pub struct LayeredLoader<A, B> {
    primary: A,
    fallback: B,
}

impl<A, B> LayeredLoader<A, B> {
    pub fn new(primary: A, fallback: B) -> Self {
        Self { primary, fallback }
    }
}

impl<A: TemplateLoader, B: TemplateLoader> TemplateLoader for LayeredLoader<A, B> {
    fn load(&self, path: &str) -> Result<String, TemplateError> {
        if self.primary.contains(path) {
            self.primary.load(path)
        } else {
            self.fallback.load(path)
        }
    }

    fn contains(&self, path: &str) -> bool {
        self.primary.contains(path) || self.fallback.contains(path)
    }
}
