use crate::error::{Error, Result};
use once_cell::sync::Lazy;
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

static BINARY_EXTENSIONS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "exe", "dll", "so", "dylib", "a", "o", "obj", "png", "jpg", "jpeg", "gif", "bmp", "ico",
        "webp", "mp3", "mp4", "avi", "mkv", "mov", "wav", "flac", "pdf", "doc", "docx", "xls",
        "xlsx", "ppt", "pptx", "zip", "tar", "gz", "bz2", "xz", "7z", "rar", "wasm", "pyc",
        "class", "epub", "odt",
    ]
    .into_iter()
    .collect()
});

/// Label used for files without an extension in pre-flight reports.
pub const NO_EXTENSION: &str = ".no_extension";

/// Returns the lowercased extension with its dot, or [`NO_EXTENSION`].
///
/// Dotfiles such as `.env` have no extension.
#[must_use]
pub fn extension_label(path: &Path) -> String {
    path.extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty())
        .map_or_else(
            || NO_EXTENSION.to_string(),
            |ext| format!(".{}", ext.to_lowercase()),
        )
}

/// Determines if a file is likely binary by analyzing its content.
///
/// # Algorithm
///
/// 1. Reads the first 8KB of the file
/// 2. Checks for null bytes (binary indicator)
/// 3. Calculates the ratio of ASCII characters
/// 4. Files with null bytes or low ASCII ratio are considered binary
///
/// Non-ASCII UTF-8 text (Cyrillic, CJK) can fall under the ratio, so the
/// sample is accepted as text whenever it decodes as UTF-8.
///
/// # Errors
///
/// Returns an error if the file cannot be opened or read.
pub(crate) fn is_likely_binary(path: &Path) -> Result<bool> {
    const BUFFER_SIZE: usize = 8192;
    const ASCII_THRESHOLD: f64 = 0.85;

    let file = File::open(path).map_err(|e| Error::io(path, e))?;
    let mut reader = BufReader::with_capacity(BUFFER_SIZE, file);
    let mut buffer = [0u8; BUFFER_SIZE];

    let bytes_read = reader.read(&mut buffer).map_err(|e| Error::io(path, e))?;

    if bytes_read == 0 {
        return Ok(false);
    }

    let sample = &buffer[..bytes_read];

    if memchr::memchr(0, sample).is_some() {
        return Ok(true);
    }

    match std::str::from_utf8(sample) {
        Ok(_) => return Ok(false),
        // A multi-byte character cut off by the buffer end is still text.
        Err(e) if e.error_len().is_none() => return Ok(false),
        Err(_) => {}
    }

    let ascii_count = sample.iter().filter(|&&b| b < 128).count();
    let ascii_ratio = ascii_count as f64 / bytes_read as f64;

    Ok(ascii_ratio < ASCII_THRESHOLD)
}

/// Checks if a file extension suggests a binary file.
#[must_use]
pub(crate) fn has_binary_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| BINARY_EXTENSIONS.contains(ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Extension check first, content sniffing second. Unreadable files count as text
/// so the failure surfaces when the run reads them.
pub(crate) fn looks_binary(path: &Path) -> bool {
    has_binary_extension(path) || is_likely_binary(path).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_fs::prelude::*;
    use std::io::Write;

    #[test]
    fn test_extension_label() {
        assert_eq!(extension_label(Path::new("a/notes.TXT")), ".txt");
        assert_eq!(extension_label(Path::new("archive.tar.gz")), ".gz");
        assert_eq!(extension_label(Path::new("README")), NO_EXTENSION);
        assert_eq!(extension_label(Path::new(".env")), NO_EXTENSION);
    }

    #[test]
    fn test_is_likely_binary_text_file() {
        let temp = assert_fs::TempDir::new().unwrap();
        let file = temp.child("test.txt");
        file.write_str("Hello, world!").unwrap();

        assert!(!is_likely_binary(file.path()).unwrap());
    }

    #[test]
    fn test_is_likely_binary_non_ascii_text() {
        let temp = assert_fs::TempDir::new().unwrap();
        let file = temp.child("ru.txt");
        file.write_str("Привет, мир! Это обычный текст.").unwrap();

        assert!(!is_likely_binary(file.path()).unwrap());
    }

    #[test]
    fn test_is_likely_binary_binary_file() {
        let temp = assert_fs::TempDir::new().unwrap();
        let file = temp.child("test.bin");

        let mut f = File::create(file.path()).unwrap();
        f.write_all(&[0u8; 100]).unwrap();

        assert!(is_likely_binary(file.path()).unwrap());
    }

    #[test]
    fn test_is_likely_binary_empty_file() {
        let temp = assert_fs::TempDir::new().unwrap();
        let file = temp.child("empty.txt");
        file.touch().unwrap();

        assert!(!is_likely_binary(file.path()).unwrap());
    }

    #[test]
    fn test_has_binary_extension() {
        assert!(has_binary_extension(Path::new("app.exe")));
        assert!(has_binary_extension(Path::new("image.PNG")));
        assert!(has_binary_extension(Path::new("archive.zip")));
        assert!(!has_binary_extension(Path::new("chapter.txt")));
        assert!(!has_binary_extension(Path::new("no_extension")));
    }
}
