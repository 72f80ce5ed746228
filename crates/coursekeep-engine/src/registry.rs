use std::path::PathBuf;

use coursekeep_core::ids::PackageId;

/// Answers whether a content package is known. Consulted before a session
/// is initialized.
pub trait PackageRegistry: Send + Sync {
    fn exists(&self, package_id: &PackageId) -> bool;
}

/// Packages are sub-directories of `root`, one per extracted package.
pub struct DirectoryRegistry {
    root: PathBuf,
}

impl DirectoryRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl PackageRegistry for DirectoryRegistry {
    fn exists(&self, package_id: &PackageId) -> bool {
        let id = package_id.as_str();
        // Ids name a single directory entry; anything that could walk out of
        // `root` is unknown.
        if id.is_empty() || id == "." || id == ".." || id.contains(['/', '\\']) {
            return false;
        }
        self.root.join(id).is_dir()
    }
}

/// Accepts every package id. Used when no package directory is configured.
pub struct OpenRegistry;

impl PackageRegistry for OpenRegistry {
    fn exists(&self, _package_id: &PackageId) -> bool {
        true
    }
}
