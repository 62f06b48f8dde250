//! Where model files come from
//!
//! The factory never walks the filesystem itself; it asks a [`ModelSource`]
//! to resolve ids and to enumerate candidates.

use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::runtime::loaders::detect::{detect_format, model_id_for};
use crate::models::ModelFormat;

const MODEL_FILE_EXTENSIONS: &[&str] = &["gguf", "safetensors", "bin", "pt", "pth", "onnx", "npz"];

/// Resolves model ids to on-disk paths.
pub trait ModelSource: Send + Sync {
    /// Path for `model_id`, if the source knows it
    fn resolve(&self, model_id: &str) -> Option<PathBuf>;

    /// Lazily enumerate `(model_id, path)` pairs. Each call starts a fresh
    /// scan.
    fn candidates(&self) -> Box<dyn Iterator<Item = (String, PathBuf)> + Send + '_>;
}

/// Models laid out under one directory: either a model directory per id or
/// single weight files named `<id>.<ext>`.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
    extra_extensions: Vec<String>,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            extra_extensions: Vec::new(),
        }
    }

    /// Also treat files with these extensions as models (plugins that
    /// bring their own loader use this).
    pub fn with_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_extensions
            .extend(extensions.into_iter().map(Into::into));
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn is_model_file(&self, path: &Path) -> bool {
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            return false;
        };
        let ext = ext.to_ascii_lowercase();
        MODEL_FILE_EXTENSIONS.contains(&ext.as_str())
            || self.extra_extensions.iter().any(|e| e.eq_ignore_ascii_case(&ext))
    }

    fn is_candidate(&self, path: &Path) -> bool {
        if path.is_dir() {
            detect_format(path) != ModelFormat::Unknown
        } else {
            self.is_model_file(path)
        }
    }
}

/// Ids are single path components; anything that could escape the root is
/// rejected outright.
fn is_safe_id(model_id: &str) -> bool {
    !model_id.is_empty()
        && !model_id.contains(|c| c == '/' || c == '\\')
        && Path::new(model_id)
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
}

impl ModelSource for DirectorySource {
    fn resolve(&self, model_id: &str) -> Option<PathBuf> {
        if !is_safe_id(model_id) {
            return None;
        }
        let direct = self.root.join(model_id);
        if direct.exists() {
            return Some(direct);
        }
        let mut matches: Vec<PathBuf> = self
            .candidates()
            .filter(|(id, _)| id == model_id)
            .map(|(_, path)| path)
            .collect();
        matches.sort();
        matches.into_iter().next()
    }

    fn candidates(&self) -> Box<dyn Iterator<Item = (String, PathBuf)> + Send + '_> {
        let entries = fs::read_dir(&self.root).into_iter().flatten();
        Box::new(
            entries
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .filter(move |path| self.is_candidate(path))
                .filter_map(|path| model_id_for(&path).map(|id| (id, path))),
        )
    }
}
