//! # flatgem
//!
//! Batch-processes a folder of text files through a Gemini model, one
//! request per file, and writes each response to a mirrored output folder.
//!
//! ## Features
//!
//! - Pre-flight scan with warnings before any request is sent
//! - Optional recursion with mirrored folder structure and extension swap
//! - Pause, resume and stop between files
//! - Per-file failures logged without aborting the batch
//! - Persisted preferences and API key
//!
//! ## Quick Start
//!
//! ```no_run
//! use flatgem::{RunConfig, run};
//! use std::time::Duration;
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = RunConfig::builder()
//!     .input_dir("./chapters")
//!     .output_dir("./summaries")
//!     .system_prompt("Summarize this chapter in five sentences.")
//!     .output_extension(".md")
//!     .processing_delay(Duration::from_secs(10))
//!     .build()?;
//!
//! let summary = run(config, "YOUR_API_KEY")?;
//! println!("{}", summary.message());
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! 1. **Scanner**: lists input files and produces the pre-flight report
//! 2. **Client**: sends one `generateContent` request per file
//! 3. **Pipeline**: runs the batch, honouring the control flags
//! 4. **Writer**: persists each response under the output folder
//! 5. **Worker**: runs a pipeline on a background thread

#![warn(
    missing_docs,
    rust_2018_idioms,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    clippy::nursery
)]
#![allow(clippy::module_name_repetitions)]

mod client;
mod config;
mod control;
mod error;
mod file;
mod filter;
mod pipeline;
mod scanner;
mod settings;
mod worker;
mod writer;

pub use client::{
    DEFAULT_BASE_URL, FALLBACK_MODELS, GeminiClient, Generator, KeyStatus, available_models,
    default_model, model_hint, sort_models, validate_key,
};
pub use config::{
    DEFAULT_MODEL, MAX_PROCESSING_DELAY_SECS, RunConfig, RunConfigBuilder, THINKING_INSTRUCTION,
    normalize_extension,
};
pub use control::{PAUSE_POLL_INTERVAL, RunControl};
pub use error::{Error, Result};
pub use file::{NO_EXTENSION, extension_label};
pub use pipeline::{Pipeline, ProgressEvent, RunOutcome, RunSummary};
pub use scanner::{ScanReport, collect_files, preflight};
pub use settings::{DEFAULT_PROCESSING_DELAY_SECS, Preferences, Settings, SettingsStore};
pub use worker::{Worker, WorkerHandle};
pub use writer::output_path_for;

use std::sync::Arc;

/// Runs a whole batch on the current thread against the Gemini API.
///
/// # Errors
///
/// Returns an error if:
/// - Configuration is invalid
/// - The API key is blank
/// - The input folder cannot be read
///
/// Per-file failures are reported in the returned [`RunSummary`].
///
/// # Examples
///
/// ```no_run
/// use flatgem::{RunConfig, run};
///
/// # fn main() -> anyhow::Result<()> {
/// let config = RunConfig::builder()
///     .input_dir("in")
///     .output_dir("out")
///     .system_prompt("Translate to French.")
///     .build()?;
///
/// let summary = run(config, &std::env::var("GEMINI_API_KEY")?)?;
/// assert!(summary.is_success());
/// # Ok(())
/// # }
/// ```
pub fn run(config: RunConfig, api_key: &str) -> Result<RunSummary> {
    let client = GeminiClient::new(api_key, config.model.clone())?;
    Pipeline::new(config, Arc::new(client))?.run(&RunControl::new(), |_| {})
}
