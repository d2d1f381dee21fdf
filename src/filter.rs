//! Glob-based exclusion of input files.

use crate::error::{Error, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::Path;

/// Skips files whose path relative to the input folder, or any ancestor
/// folder of it, matches one of the configured patterns.
#[derive(Debug, Clone)]
pub(crate) struct FileFilter {
    excluded: GlobSet,
}

impl FileFilter {
    /// Compiles the exclusion patterns.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an invalid glob.
    pub(crate) fn new(patterns: &[String]) -> Result<Self> {
        Ok(Self {
            excluded: Self::build_globset(patterns)?,
        })
    }

    fn build_globset(patterns: &[String]) -> Result<GlobSet> {
        let mut builder = GlobSetBuilder::new();

        for pattern in patterns {
            let glob = Glob::new(pattern)
                .map_err(|e| Error::config(format!("Invalid glob pattern '{pattern}': {e}")))?;
            builder.add(glob);
        }

        builder
            .build()
            .map_err(|e| Error::config(format!("Failed to build glob set: {e}")))
    }

    /// Returns false when `relative` or one of its parent folders is excluded.
    pub(crate) fn should_process(&self, relative: &Path) -> bool {
        if self.excluded.is_empty() {
            return true;
        }

        !relative
            .ancestors()
            .filter(|p| !p.as_os_str().is_empty())
            .any(|p| self.excluded.is_match(p))
    }
}
