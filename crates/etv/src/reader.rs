//! Strictly read-only filesystem access.
//!
//! Every path must be absolute and is lexically normalized before the open.
//! No function in this module (or this crate) opens a file for writing,
//! renames, removes, or changes permissions. The External Truth Verifier's
//! safety claims rest on that.

use std::fs;
use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::EtvError;

/// A source file read for the resolver: contents plus the extension the
/// language selector keys on.
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub path: PathBuf,
    pub extension: Option<String>,
    pub content: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FsReader;

impl FsReader {
    pub fn new() -> Self {
        Self
    }

    /// Read the file at `path`. Rejects non-absolute paths outright.
    pub fn read_file(&self, path: &Path) -> Result<String, EtvError> {
        let path = self.normalize(path)?;
        fs::read_to_string(&path).map_err(|source| EtvError::Read { path, source })
    }

    /// SHA-256 hex of the file's contents, the same hash the vault computes
    /// over artifact text, so equality means the bytes match.
    pub fn hash_file(&self, path: &Path) -> Result<String, EtvError> {
        let content = self.read_file(path)?;
        let mut hasher = Sha256::new();
        hasher.update(content.as_bytes());
        Ok(format!("{:x}", hasher.finalize()))
    }

    /// Read a file for syntax-level inspection, carrying its extension along
    /// for language selection.
    pub fn parse_file(&self, path: &Path) -> Result<SourceFile, EtvError> {
        let normalized = self.normalize(path)?;
        let content = self.read_file(&normalized)?;
        let extension = normalized
            .extension()
            .map(|ext| ext.to_string_lossy().to_lowercase());
        Ok(SourceFile {
            path: normalized,
            extension,
            content,
        })
    }

    /// Lexical normalization: resolve `.` and `..` components without
    /// touching the filesystem. Errors when `..` escapes the root or the
    /// path is relative.
    fn normalize(&self, path: &Path) -> Result<PathBuf, EtvError> {
        if !path.is_absolute() {
            return Err(EtvError::NotAbsolute(path.to_path_buf()));
        }
        let mut normalized = PathBuf::new();
        for component in path.components() {
            match component {
                Component::CurDir => {}
                Component::ParentDir => {
                    if !normalized.pop() {
                        return Err(EtvError::NotAbsolute(path.to_path_buf()));
                    }
                }
                other => normalized.push(other.as_os_str()),
            }
        }
        Ok(normalized)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn fixture(content: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("add.go");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        (dir, path)
    }

    #[test]
    fn relative_paths_are_rejected() {
        let reader = FsReader::new();
        let err = reader.read_file(Path::new("src/add.go")).unwrap_err();
        assert!(matches!(err, EtvError::NotAbsolute(_)));
    }

    #[test]
    fn dot_components_are_normalized_before_access() {
        let (_dir, path) = fixture("package math\n");
        let reader = FsReader::new();
        let dotted = path.parent().unwrap().join(".").join("add.go");
        assert_eq!(reader.read_file(&dotted).unwrap(), "package math\n");
    }

    #[test]
    fn hash_matches_vault_content_hash() {
        let (_dir, path) = fixture("func Add(a, b int) int { return a + b }");
        let reader = FsReader::new();
        assert_eq!(
            reader.hash_file(&path).unwrap(),
            tinymem_store::content_hash("func Add(a, b int) int { return a + b }")
        );
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let reader = FsReader::new();
        let err = reader
            .read_file(&dir.path().join("absent.go"))
            .unwrap_err();
        assert!(matches!(err, EtvError::Read { .. }));
    }

    #[test]
    fn parse_file_carries_the_extension() {
        let (_dir, path) = fixture("def add(a, b):\n    return a + b\n");
        let renamed = path.with_extension("py");
        std::fs::rename(&path, &renamed).unwrap();

        let reader = FsReader::new();
        let source = reader.parse_file(&renamed).unwrap();
        assert_eq!(source.extension.as_deref(), Some("py"));
        assert!(source.content.starts_with("def add"));
    }
}
