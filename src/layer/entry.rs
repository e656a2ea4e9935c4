use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;

/// Modification time given to entries that don't specify one: epoch + 1 second.
pub const DEFAULT_MODIFICATION_TIME: i64 = 1;
pub const DEFAULT_FILE_PERMISSIONS: u32 = 0o644;
pub const DEFAULT_FOLDER_PERMISSIONS: u32 = 0o755;

#[derive(Debug, Error, PartialEq)]
pub enum LayerEntryError {
    #[error("extraction path '{0}' must be an absolute unix path")]
    RelativePath(String),
    #[error("permissions {0:o} are not valid octal file permissions")]
    InvalidPermissions(u32),
}

/// A normalized absolute unix path, e.g. `/app/lib`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct AbsoluteUnixPath(String);

impl AbsoluteUnixPath {
    pub fn parse(raw: &str) -> Result<AbsoluteUnixPath, LayerEntryError> {
        if !raw.starts_with('/') {
            return Err(LayerEntryError::RelativePath(raw.to_string()));
        }
        let components = raw.split('/').filter(|component| !component.is_empty() && *component != ".").collect::<Vec<&str>>();
        Ok(AbsoluteUnixPath(format!("/{}", components.join("/"))))
    }

    pub fn root() -> AbsoluteUnixPath {
        AbsoluteUnixPath("/".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    pub fn resolve(&self, relative: &str) -> AbsoluteUnixPath {
        let joined = format!("{}/{}", self.0.trim_end_matches('/'), relative.trim_start_matches('/'));
        AbsoluteUnixPath::parse(&joined).unwrap_or_else(|_| self.clone())
    }

    pub fn parent(&self) -> Option<AbsoluteUnixPath> {
        if self.is_root() {
            return None;
        }
        let index = self.0.rfind('/')?;
        Some(if index == 0 {
            AbsoluteUnixPath::root()
        } else {
            AbsoluteUnixPath(self.0[..index].to_string())
        })
    }

    /// The path as stored in a tar archive: no leading slash.
    pub fn tar_name(&self) -> &str {
        self.0.trim_start_matches('/')
    }
}

impl Display for AbsoluteUnixPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One file system item destined for a layer.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerEntry {
    source_file: PathBuf,
    extraction_path: AbsoluteUnixPath,
    permissions: u32,
    /// Seconds since the unix epoch.
    modification_time: i64,
}

impl LayerEntry {
    pub fn new(
        source_file: impl Into<PathBuf>,
        extraction_path: AbsoluteUnixPath,
        permissions: Option<u32>,
        modification_time: Option<i64>,
    ) -> Result<LayerEntry, LayerEntryError> {
        let source_file = source_file.into();
        let permissions = match permissions {
            Some(permissions) if permissions > 0o7777 => return Err(LayerEntryError::InvalidPermissions(permissions)),
            Some(permissions) => permissions,
            None if source_file.is_dir() => DEFAULT_FOLDER_PERMISSIONS,
            None => DEFAULT_FILE_PERMISSIONS,
        };
        Ok(LayerEntry {
            source_file,
            extraction_path,
            permissions,
            modification_time: modification_time.unwrap_or(DEFAULT_MODIFICATION_TIME),
        })
    }

    pub fn source_file(&self) -> &Path {
        &self.source_file
    }

    pub fn extraction_path(&self) -> &AbsoluteUnixPath {
        &self.extraction_path
    }

    pub fn permissions(&self) -> u32 {
        self.permissions
    }

    pub fn modification_time(&self) -> i64 {
        self.modification_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_paths() {
        assert_eq!(AbsoluteUnixPath::parse("/app//lib/./x/").unwrap().as_str(), "/app/lib/x");
        assert_eq!(AbsoluteUnixPath::parse("/").unwrap(), AbsoluteUnixPath::root());
        assert_eq!(
            AbsoluteUnixPath::parse("app").unwrap_err(),
            LayerEntryError::RelativePath("app".to_string())
        );
    }

    #[test]
    fn parent_walks_to_root() {
        let path = AbsoluteUnixPath::parse("/a/b").unwrap();
        let parent = path.parent().unwrap();
        assert_eq!(parent.as_str(), "/a");
        assert_eq!(parent.parent().unwrap(), AbsoluteUnixPath::root());
        assert_eq!(AbsoluteUnixPath::root().parent(), None);
        assert_eq!(path.tar_name(), "a/b");
        assert_eq!(AbsoluteUnixPath::root().resolve("x/y").as_str(), "/x/y");
    }

    #[test]
    fn entry_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let entry = LayerEntry::new(dir.path(), AbsoluteUnixPath::parse("/d").unwrap(), None, None).unwrap();
        assert_eq!(entry.permissions(), DEFAULT_FOLDER_PERMISSIONS);
        assert_eq!(entry.modification_time(), DEFAULT_MODIFICATION_TIME);

        let file = dir.path().join("f");
        std::fs::write(&file, b"x").unwrap();
        let entry = LayerEntry::new(&file, AbsoluteUnixPath::parse("/f").unwrap(), None, Some(42)).unwrap();
        assert_eq!(entry.permissions(), DEFAULT_FILE_PERMISSIONS);
        assert_eq!(entry.modification_time(), 42);

        assert!(LayerEntry::new(&file, AbsoluteUnixPath::root(), Some(0o17777), None).is_err());
    }
}
