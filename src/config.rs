use crate::error::{Error, Result};
use crate::filter::FileFilter;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Model used when none is configured.
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";

const DEFAULT_PROCESSING_DELAY: Duration = Duration::from_secs(1);

/// Longest accepted pause between files, in seconds.
pub const MAX_PROCESSING_DELAY_SECS: u64 = 300;

/// Prefix prepended to the system prompt when thinking mode is enabled.
pub const THINKING_INSTRUCTION: &str = "Before you begin, first think step-by-step to thoroughly \
understand the user's request below. Formulate a detailed, internal plan to process the text \
according to all the provided rules. After you have a clear plan, execute it on the text. \
CRITICAL INSTRUCTION: Your final output must contain ONLY the fully processed text itself. \
Do NOT include your thoughts, your plan, or any other conversational phrases or markdown \
formatting in your response.";

const THINKING_SEPARATOR: &str = "\n\n---\n\n";

/// Configuration for a batch run.
///
/// Use [`RunConfig::builder()`] to construct a new configuration.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct RunConfig {
    /// Folder whose files are sent to the model
    pub input_dir: PathBuf,

    /// Folder receiving the generated files, mirroring the input layout
    pub output_dir: PathBuf,

    /// Instruction text sent with every request
    pub system_prompt: String,

    /// Model name without the `models/` prefix
    pub model: String,

    /// Replacement extension for output files; `None` keeps the original
    pub output_extension: Option<String>,

    /// Pause between two consecutive files
    pub processing_delay: Duration,

    /// Prefix the system prompt with [`THINKING_INSTRUCTION`]
    pub thinking_mode: bool,

    /// Descend into subfolders of the input folder
    pub process_subfolders: bool,

    /// Glob patterns, relative to the input folder, to skip
    pub exclude: Vec<String>,

    /// Plan the run without calling the API or writing files
    pub dry_run: bool,

    /// Keep a timestamped copy of output files before overwriting them
    pub backup_existing: bool,
}

impl RunConfig {
    /// Creates a new configuration builder.
    ///
    /// # Examples
    ///
    /// ```
    /// use flatgem::RunConfig;
    ///
    /// let config = RunConfig::builder()
    ///     .input_dir("./src")
    ///     .output_dir("./translated")
    ///     .system_prompt("Translate to French.")
    ///     .build()
    ///     .expect("valid configuration");
    /// ```
    #[must_use]
    pub fn builder() -> RunConfigBuilder {
        RunConfigBuilder::default()
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - A required setting is missing or blank
    /// - The input folder doesn't exist
    /// - Input and output resolve to the same folder
    /// - The delay exceeds [`MAX_PROCESSING_DELAY_SECS`]
    /// - An exclude pattern is not a valid glob
    pub fn validate(&self) -> Result<()> {
        let mut missing = Vec::new();
        if self.input_dir.as_os_str().is_empty() {
            missing.push("input folder");
        }
        if self.output_dir.as_os_str().is_empty() {
            missing.push("output folder");
        }
        if self.system_prompt.trim().is_empty() {
            missing.push("system prompt");
        }
        if self.model.trim().is_empty() {
            missing.push("model");
        }
        if !missing.is_empty() {
            return Err(Error::config(format!(
                "Missing required settings: {}",
                missing.join(", ")
            )));
        }

        if !self.input_dir.exists() {
            return Err(Error::config(format!(
                "Input folder does not exist: {}",
                self.input_dir.display()
            )));
        }

        if !self.input_dir.is_dir() {
            return Err(Error::config(format!(
                "Input path is not a folder: {}",
                self.input_dir.display()
            )));
        }

        if same_folder(&self.input_dir, &self.output_dir) {
            return Err(Error::config(
                "The input and output folders cannot be the same. \
                This would overwrite your original files.",
            ));
        }

        if self.processing_delay > Duration::from_secs(MAX_PROCESSING_DELAY_SECS) {
            return Err(Error::config(format!(
                "Processing delay must be at most {MAX_PROCESSING_DELAY_SECS} seconds"
            )));
        }

        FileFilter::new(&self.exclude)?;

        Ok(())
    }

    /// Returns the system prompt actually sent, including the thinking prefix.
    #[must_use]
    pub fn effective_system_prompt(&self) -> String {
        if self.thinking_mode {
            format!("{THINKING_INSTRUCTION}{THINKING_SEPARATOR}{}", self.system_prompt)
        } else {
            self.system_prompt.clone()
        }
    }

    /// Returns the output extension with a leading dot, or `None` to keep originals.
    #[must_use]
    pub fn normalized_extension(&self) -> Option<String> {
        self.output_extension.as_deref().and_then(normalize_extension)
    }
}

/// Trims an extension and ensures it starts with a dot. Blank means none.
#[must_use]
pub fn normalize_extension(ext: &str) -> Option<String> {
    let ext = ext.trim();
    if ext.is_empty() || ext == "." {
        return None;
    }
    if ext.starts_with('.') {
        Some(ext.to_string())
    } else {
        Some(format!(".{ext}"))
    }
}

fn same_folder(a: &Path, b: &Path) -> bool {
    fn resolve(p: &Path) -> Option<PathBuf> {
        p.canonicalize().ok().or_else(|| std::path::absolute(p).ok())
    }
    match (resolve(a), resolve(b)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            input_dir: PathBuf::new(),
            output_dir: PathBuf::new(),
            system_prompt: String::new(),
            model: DEFAULT_MODEL.to_string(),
            output_extension: None,
            processing_delay: DEFAULT_PROCESSING_DELAY,
            thinking_mode: false,
            process_subfolders: false,
            exclude: Vec::new(),
            dry_run: false,
            backup_existing: false,
        }
    }
}

/// Builder for creating a [`RunConfig`].
#[derive(Debug, Default)]
pub struct RunConfigBuilder {
    input_dir: Option<PathBuf>,
    output_dir: Option<PathBuf>,
    system_prompt: Option<String>,
    model: Option<String>,
    output_extension: Option<String>,
    processing_delay: Option<Duration>,
    thinking_mode: bool,
    process_subfolders: bool,
    exclude: Vec<String>,
    dry_run: bool,
    backup_existing: bool,
}

impl RunConfigBuilder {
    /// Sets the input folder.
    #[must_use]
    pub fn input_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.input_dir = Some(path.into());
        self
    }

    /// Sets the output folder.
    #[must_use]
    pub fn output_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(path.into());
        self
    }

    /// Sets the system prompt.
    #[must_use]
    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Sets the model name.
    #[must_use]
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Sets the replacement extension for output files.
    ///
    /// A leading dot is optional; a blank value keeps the original extensions.
    #[must_use]
    pub fn output_extension(mut self, ext: impl Into<String>) -> Self {
        self.output_extension = Some(ext.into());
        self
    }

    /// Sets the pause between two consecutive files.
    #[must_use]
    pub fn processing_delay(mut self, delay: Duration) -> Self {
        self.processing_delay = Some(delay);
        self
    }

    /// Enables or disables thinking mode.
    #[must_use]
    pub fn thinking_mode(mut self, enabled: bool) -> Self {
        self.thinking_mode = enabled;
        self
    }

    /// Enables or disables recursion into subfolders.
    #[must_use]
    pub fn process_subfolders(mut self, enabled: bool) -> Self {
        self.process_subfolders = enabled;
        self
    }

    /// Adds glob patterns for files or folders to skip.
    #[must_use]
    pub fn exclude<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude.extend(patterns.into_iter().map(Into::into));
        self
    }

    /// Enables dry run mode (no API calls, no file writes).
    #[must_use]
    pub fn dry_run(mut self, enabled: bool) -> Self {
        self.dry_run = enabled;
        self
    }

    /// Enables or disables backups of overwritten output files.
    #[must_use]
    pub fn backup_existing(mut self, enabled: bool) -> Self {
        self.backup_existing = enabled;
        self
    }

    /// Builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails.
    pub fn build(self) -> Result<RunConfig> {
        let config = RunConfig {
            input_dir: self.input_dir.unwrap_or_default(),
            output_dir: self.output_dir.unwrap_or_default(),
            system_prompt: self.system_prompt.unwrap_or_default(),
            model: self
                .model
                .map(|m| m.trim().to_string())
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            output_extension: self
                .output_extension
                .map(|e| e.trim().to_string())
                .filter(|e| !e.is_empty()),
            processing_delay: self.processing_delay.unwrap_or(DEFAULT_PROCESSING_DELAY),
            thinking_mode: self.thinking_mode,
            process_subfolders: self.process_subfolders,
            exclude: self.exclude,
            dry_run: self.dry_run,
            backup_existing: self.backup_existing,
        };

        config.validate()?;
        Ok(config)
    }
}
