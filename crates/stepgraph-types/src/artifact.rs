//! Artifact handles and ordered path catalogs.
//!
//! A handle is an immutable pointer to a file set. The core never reads or
//! writes storage keys itself: it only hands locators (and, for sliced data,
//! an ordered [`PathManifest`]) to whichever adapter moves the bytes.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Where an artifact's bytes live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ArtifactLocator {
    /// File or directory on the local machine.
    Local { path: PathBuf },
    /// Object-storage key.
    Storage { key: String },
    /// Inline text.
    Raw { data: String },
    /// A named entry inside another artifact.
    SubPath {
        parent: Box<ArtifactLocator>,
        sub_path: String,
    },
    /// Ordered fan-in of per-slice artifacts.
    Collection { items: Vec<ArtifactHandle> },
}

/// Immutable pointer to a file set, optionally carrying an ordered catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactHandle {
    pub locator: ArtifactLocator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog: Option<PathManifest>,
}

impl ArtifactHandle {
    pub fn new(locator: ArtifactLocator) -> Self {
        Self {
            locator,
            catalog: None,
        }
    }

    pub fn local(path: impl Into<PathBuf>) -> Self {
        Self::new(ArtifactLocator::Local { path: path.into() })
    }

    pub fn storage(key: impl Into<String>) -> Self {
        Self::new(ArtifactLocator::Storage { key: key.into() })
    }

    pub fn raw(data: impl Into<String>) -> Self {
        Self::new(ArtifactLocator::Raw { data: data.into() })
    }

    /// Ordered collection; the catalog lists each item's path in order.
    pub fn collection(items: Vec<ArtifactHandle>) -> Self {
        let catalog = PathManifest::from_paths(items.iter().map(|h| h.locator.display_path()));
        Self {
            locator: ArtifactLocator::Collection { items },
            catalog: Some(catalog),
        }
    }

    pub fn with_catalog(mut self, catalog: PathManifest) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Borrowed view of one entry inside this artifact.
    pub fn slice<'a>(&'a self, sub_path: &'a str) -> ArtifactSlice<'a> {
        ArtifactSlice {
            parent: self,
            sub_path,
        }
    }

    /// Filesystem path when the artifact is (a sub-path of) a local file set.
    pub fn local_path(&self) -> Option<PathBuf> {
        self.locator.local_path()
    }

    /// Items of a collection handle.
    pub fn items(&self) -> Option<&[ArtifactHandle]> {
        match &self.locator {
            ArtifactLocator::Collection { items } => Some(items),
            _ => None,
        }
    }
}

impl ArtifactLocator {
    pub fn local_path(&self) -> Option<PathBuf> {
        match self {
            ArtifactLocator::Local { path } => Some(path.clone()),
            ArtifactLocator::SubPath { parent, sub_path } => {
                parent.local_path().map(|p| p.join(sub_path))
            }
            _ => None,
        }
    }

    /// Human-readable path used in catalogs and logs.
    pub fn display_path(&self) -> String {
        match self {
            ArtifactLocator::Local { path } => path.display().to_string(),
            ArtifactLocator::Storage { key } => key.clone(),
            ArtifactLocator::Raw { .. } => "<raw>".to_string(),
            ArtifactLocator::SubPath { parent, sub_path } => {
                format!("{}/{}", parent.display_path().trim_end_matches('/'), sub_path)
            }
            ArtifactLocator::Collection { items } => format!("<collection of {}>", items.len()),
        }
    }
}

/// Borrowed sub-path view; cannot outlive the handle it points into.
#[derive(Debug, Clone, Copy)]
pub struct ArtifactSlice<'a> {
    parent: &'a ArtifactHandle,
    sub_path: &'a str,
}

impl<'a> ArtifactSlice<'a> {
    pub fn parent(&self) -> &'a ArtifactHandle {
        self.parent
    }

    pub fn sub_path(&self) -> &'a str {
        self.sub_path
    }

    pub fn local_path(&self) -> Option<PathBuf> {
        self.parent.local_path().map(|p| p.join(self.sub_path))
    }

    /// Owned handle to hand to a run; embeds a copy of the parent locator.
    pub fn to_handle(&self) -> ArtifactHandle {
        ArtifactHandle::new(ArtifactLocator::SubPath {
            parent: Box::new(self.parent.locator.clone()),
            sub_path: self.sub_path.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// PathManifest
// ---------------------------------------------------------------------------

/// One catalog entry: a relative path and its position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub order: usize,
    pub path: String,
}

/// Ordered catalog of relative paths inside one artifact.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathManifest {
    entries: Vec<ManifestEntry>,
}

impl PathManifest {
    /// Catalog in the given order.
    pub fn from_paths<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let entries = paths
            .into_iter()
            .enumerate()
            .map(|(order, p)| ManifestEntry {
                order,
                path: p.into(),
            })
            .collect();
        Self { entries }
    }

    /// Catalog from paths sorted lexicographically (stable across platforms).
    pub fn sorted<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut paths: Vec<String> = paths.into_iter().map(Into::into).collect();
        paths.sort();
        Self::from_paths(paths)
    }

    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.path.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Path relative to `root` with forward slashes, for catalog entries.
    pub fn relative_entry(root: &Path, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(root).ok()?;
        let parts: Vec<String> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Some(parts.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slice_resolves_under_parent() {
        let shared = ArtifactHandle::local("/data/shared");
        let slice = shared.slice("part-1/a.txt");
        assert_eq!(
            slice.local_path(),
            Some(PathBuf::from("/data/shared/part-1/a.txt"))
        );
        let owned = slice.to_handle();
        assert_eq!(owned.local_path(), slice.local_path());
    }

    #[test]
    fn test_storage_slice_has_no_local_path() {
        let shared = ArtifactHandle::storage("bucket/run-1/data");
        let owned = shared.slice("x").to_handle();
        assert!(owned.local_path().is_none());
        assert_eq!(owned.locator.display_path(), "bucket/run-1/data/x");
    }

    #[test]
    fn test_collection_catalog_preserves_order() {
        let handle = ArtifactHandle::collection(vec![
            ArtifactHandle::storage("k/2"),
            ArtifactHandle::storage("k/1"),
        ]);
        let catalog = handle.catalog.as_ref().unwrap();
        let paths: Vec<&str> = catalog.paths().collect();
        assert_eq!(paths, vec!["k/2", "k/1"]);
        assert_eq!(catalog.entries()[1].order, 1);
    }

    #[test]
    fn test_sorted_manifest() {
        let m = PathManifest::sorted(["b.txt", "a.txt", "c/d.txt"]);
        let paths: Vec<&str> = m.paths().collect();
        assert_eq!(paths, vec!["a.txt", "b.txt", "c/d.txt"]);
        assert_eq!(m.len(), 3);
    }

    #[test]
    fn test_relative_entry_uses_forward_slashes() {
        let root = Path::new("/r");
        let p = Path::new("/r/x/y.txt");
        assert_eq!(PathManifest::relative_entry(root, p).as_deref(), Some("x/y.txt"));
        assert!(PathManifest::relative_entry(root, Path::new("/other")).is_none());
    }
}
