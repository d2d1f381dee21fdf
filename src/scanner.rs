use crate::{
    error::{Error, Result},
    file::{extension_label, looks_binary},
    filter::FileFilter,
};
use serde::Serialize;
use std::collections::BTreeSet;
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::{debug, trace, warn};
use walkdir::{DirEntry, WalkDir};

/// Result of a pre-flight inspection of the input and output folders.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    /// Files that a run with the same settings would process
    pub files_found: usize,

    /// Whether the input folder has at least one subfolder
    pub subfolders_found: bool,

    /// Distinct lowercased extensions of the counted files
    pub formats: BTreeSet<String>,

    /// Whether the output folder exists and already has entries
    pub output_has_files: bool,

    /// Counted files that look binary
    pub binary_files: usize,

    /// Human-readable warnings, in display order
    pub warnings: Vec<String>,
}

impl ScanReport {
    /// Returns true when there is at least one file to process.
    #[must_use]
    pub const fn has_files(&self) -> bool {
        self.files_found > 0
    }
}

/// Inspects the folders a run would use without touching any file content
/// beyond a binary sniff.
///
/// An input path that is not a folder yields a report with a single warning
/// rather than an error.
///
/// # Errors
///
/// Returns an error only if an exclude pattern is invalid.
pub fn preflight(
    input_dir: &Path,
    output_dir: &Path,
    process_subfolders: bool,
    exclude: &[String],
) -> Result<ScanReport> {
    let filter = FileFilter::new(exclude)?;
    Ok(Scanner::new(input_dir, process_subfolders, filter).preflight(output_dir))
}

/// Lists the files a run processes, sorted by path.
///
/// # Errors
///
/// Returns an error if the input folder cannot be read or an exclude pattern
/// is invalid. Unreadable entries below the input folder are skipped.
pub fn collect_files(
    input_dir: &Path,
    process_subfolders: bool,
    exclude: &[String],
) -> Result<Vec<PathBuf>> {
    let filter = FileFilter::new(exclude)?;
    Scanner::new(input_dir, process_subfolders, filter).collect()
}

/// Walks the input folder, honouring the recursion setting and exclusions.
pub(crate) struct Scanner {
    root_dir: PathBuf,
    recursive: bool,
    filter: FileFilter,
}

impl Scanner {
    pub(crate) fn new(root_dir: impl Into<PathBuf>, recursive: bool, filter: FileFilter) -> Self {
        Self {
            root_dir: root_dir.into(),
            recursive,
            filter,
        }
    }

    fn walker(&self) -> impl Iterator<Item = walkdir::Result<DirEntry>> + '_ {
        let mut walk = WalkDir::new(&self.root_dir)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name();
        if !self.recursive {
            walk = walk.max_depth(1);
        }

        walk.into_iter()
            .filter_entry(move |entry| self.filter.should_process(self.relative(entry.path())))
    }

    fn relative<'a>(&self, path: &'a Path) -> &'a Path {
        path.strip_prefix(&self.root_dir).unwrap_or(path)
    }

    /// Builds the pre-flight report against `output_dir`.
    pub(crate) fn preflight(&self, output_dir: &Path) -> ScanReport {
        let mut report = ScanReport::default();

        if !self.root_dir.is_dir() {
            report
                .warnings
                .push("Input path is not a valid folder.".to_string());
            return report;
        }

        debug!("Pre-flight scan of {}", self.root_dir.display());

        for result in self.walker() {
            let entry = match result {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Walk error: {}", e);
                    continue;
                }
            };

            // Non-recursive walks still yield the top-level folders themselves.
            if entry.file_type().is_dir() {
                report.subfolders_found = true;
                continue;
            }

            if !is_file(&entry) {
                continue;
            }

            trace!("Counting file: {}", entry.path().display());
            report.files_found += 1;
            report.formats.insert(extension_label(entry.path()));
            if looks_binary(entry.path()) {
                report.binary_files += 1;
            }
        }

        report.output_has_files = fs::read_dir(output_dir)
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false);

        report.warnings = self.warnings(&report);

        debug!(
            "Pre-flight complete: {} files, {} formats, {} binary",
            report.files_found,
            report.formats.len(),
            report.binary_files
        );

        report
    }

    fn warnings(&self, report: &ScanReport) -> Vec<String> {
        let mut warnings = Vec::new();

        if report.subfolders_found && !self.recursive {
            warnings.push(
                "• Input folder contains subfolders. They will be ignored. \
                (Use --subfolders to include them)."
                    .to_string(),
            );
        }

        if report.formats.len() > 1 {
            let formats: Vec<&str> = report.formats.iter().map(String::as_str).collect();
            warnings.push(format!(
                "• Multiple file formats found: {}.",
                formats.join(", ")
            ));
        }

        if report.output_has_files {
            warnings.push(
                "• Output folder is not empty. Existing files may be overwritten.".to_string(),
            );
        }

        if report.binary_files > 0 {
            warnings.push(format!(
                "• {} file(s) look binary and will likely fail to process.",
                report.binary_files
            ));
        }

        if report.files_found == 0 {
            warnings.push("• No files found in the input folder.".to_string());
        }

        warnings
    }

    /// Lists processable files, sorted by path.
    pub(crate) fn collect(&self) -> Result<Vec<PathBuf>> {
        // Surface an unreadable root as an error even when the walk would yield nothing.
        fs::read_dir(&self.root_dir).map_err(|e| Error::io(&self.root_dir, e))?;

        let mut files = Vec::new();
        for result in self.walker() {
            let entry = match result {
                Ok(entry) => entry,
                Err(e) => {
                    // Unreadable entries below the root are skipped like in the pre-flight scan.
                    warn!(
                        "Skipping unreadable entry {}: {}",
                        e.path().unwrap_or(&self.root_dir).display(),
                        e
                    );
                    continue;
                }
            };

            if is_file(&entry) {
                files.push(entry.into_path());
            }
        }

        // Sort for deterministic ordering
        files.sort();

        debug!("Collected {} files from {}", files.len(), self.root_dir.display());
        Ok(files)
    }
}

fn is_file(entry: &DirEntry) -> bool {
    entry.file_type().is_file() || (entry.path_is_symlink() && entry.path().is_file())
}
