use crate::error::{Error, Result};
use std::{
    ffi::OsString,
    fs,
    io::Write,
    path::{Path, PathBuf},
    time::SystemTime,
};
use tracing::debug;

/// Builds the output path mirroring `file`'s location under `input_root`.
///
/// `extension` (with or without a leading dot) replaces the file's last
/// extension; files without one get it appended. `None` keeps the name.
///
/// # Examples
///
/// ```
/// use flatgem::output_path_for;
/// use std::path::Path;
///
/// let out = output_path_for(
///     Path::new("/books/in"),
///     Path::new("/books/out"),
///     Path::new("/books/in/part1/chapter.txt"),
///     Some(".md"),
/// );
/// assert_eq!(out, Path::new("/books/out/part1/chapter.md"));
/// ```
#[must_use]
pub fn output_path_for(
    input_root: &Path,
    output_root: &Path,
    file: &Path,
    extension: Option<&str>,
) -> PathBuf {
    let relative = file
        .strip_prefix(input_root)
        .map(Path::to_path_buf)
        .ok()
        .or_else(|| pathdiff::diff_paths(file, input_root).filter(|p| !p.starts_with("..")))
        .unwrap_or_else(|| PathBuf::from(file.file_name().unwrap_or(file.as_os_str())));

    let relative = match extension.map(|e| e.trim().trim_start_matches('.')) {
        Some(ext) if !ext.is_empty() => relative.with_extension(ext),
        _ => relative,
    };

    output_root.join(relative)
}

/// Persists generated text with atomic replacement.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct OutputWriter {
    backup_existing: bool,
}

impl OutputWriter {
    pub(crate) const fn new(backup_existing: bool) -> Self {
        Self { backup_existing }
    }

    /// Writes `content` to `path`, creating parent folders as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if a folder, the backup, or the file cannot be written.
    pub(crate) fn write(&self, path: &Path, content: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }

        self.write_file_atomic(path, content)?;
        debug!("Wrote {} bytes to {}", content.len(), path.display());
        Ok(())
    }

    /// Writes a file atomically with optional backup.
    ///
    /// # Process
    ///
    /// 1. Creates backup if file exists and backup is enabled
    /// 2. Writes content to temporary file
    /// 3. Syncs temporary file to disk
    /// 4. Atomically renames temporary file to target path
    fn write_file_atomic(&self, path: &Path, content: &str) -> Result<()> {
        if path.exists() && self.backup_existing {
            Self::backup_file(path)?;
        }

        let temp_path = temp_path_for(path);
        let mut temp_file = fs::File::create(&temp_path).map_err(|e| Error::io(&temp_path, e))?;

        temp_file
            .write_all(content.as_bytes())
            .map_err(|e| Error::io(&temp_path, e))?;

        temp_file
            .sync_all()
            .map_err(|e| Error::io(&temp_path, e))?;

        drop(temp_file);

        if let Err(e) = fs::rename(&temp_path, path) {
            let _ = fs::remove_file(&temp_path);
            return Err(Error::io(path, e));
        }

        Ok(())
    }

    /// Creates a timestamped backup of an existing file.
    fn backup_file(path: &Path) -> Result<PathBuf> {
        let timestamp = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)?
            .as_nanos();

        let filename = path
            .file_name()
            .ok_or_else(|| Error::config("Invalid file path"))?
            .to_string_lossy();

        let backup_path = path.with_file_name(format!("{filename}.backup.{timestamp}"));

        fs::copy(path, &backup_path).map_err(|e| Error::io(&backup_path, e))?;

        debug!("Created backup: {}", backup_path.display());
        Ok(backup_path)
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().map_or_else(OsString::new, ToOwned::to_owned);
    name.push(".flatgem.tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_fs::prelude::*;

    #[test]
    fn test_output_path_keeps_name_without_extension() {
        let out = output_path_for(
            Path::new("in"),
            Path::new("out"),
            Path::new("in/chapter.txt"),
            None,
        );
        assert_eq!(out, PathBuf::from("out/chapter.txt"));
    }

    #[test]
    fn test_output_path_mirrors_subfolders() {
        let out = output_path_for(
            Path::new("/data/in"),
            Path::new("/data/out"),
            Path::new("/data/in/a/b/notes.txt"),
            Some("md"),
        );
        assert_eq!(out, PathBuf::from("/data/out/a/b/notes.md"));
    }

    #[test]
    fn test_output_path_extension_edge_cases() {
        let root = Path::new("in");
        let out = Path::new("out");

        assert_eq!(
            output_path_for(root, out, Path::new("in/README"), Some(".md")),
            PathBuf::from("out/README.md")
        );
        assert_eq!(
            output_path_for(root, out, Path::new("in/archive.tar.gz"), Some(".txt")),
            PathBuf::from("out/archive.tar.txt")
        );
        assert_eq!(
            output_path_for(root, out, Path::new("in/.env"), Some("txt")),
            PathBuf::from("out/.env.txt")
        );
        assert_eq!(
            output_path_for(root, out, Path::new("in/a.txt"), Some("  ")),
            PathBuf::from("out/a.txt")
        );
    }

    #[test]
    fn test_output_path_outside_root_uses_file_name() {
        let out = output_path_for(
            Path::new("/data/in"),
            Path::new("/data/out"),
            Path::new("/elsewhere/x.txt"),
            None,
        );
        assert_eq!(out, PathBuf::from("/data/out/x.txt"));
    }

    #[test]
    fn test_writer_creates_parent_directories() {
        let temp = assert_fs::TempDir::new().unwrap();
        let target = temp.child("deep/nested/file.md");

        OutputWriter::new(false).write(target.path(), "hello").unwrap();

        target.assert("hello");
        assert!(!temp.child("deep/nested/file.md.flatgem.tmp").path().exists());
    }

    #[test]
    fn test_writer_overwrites_without_backup() {
        let temp = assert_fs::TempDir::new().unwrap();
        let target = temp.child("file.md");
        target.write_str("old").unwrap();

        OutputWriter::new(false).write(target.path(), "new").unwrap();

        target.assert("new");
        assert_eq!(fs::read_dir(temp.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_writer_creates_backup() {
        let temp = assert_fs::TempDir::new().unwrap();
        let target = temp.child("file.md");
        target.write_str("old content").unwrap();

        OutputWriter::new(true).write(target.path(), "new").unwrap();

        let entries: Vec<_> = fs::read_dir(temp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();

        assert!(entries.iter().any(|name| name.starts_with("file.md.backup.")));
        target.assert("new");
    }
}
