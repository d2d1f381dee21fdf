//! Dry run example
//!
//! Shows which output files a run would write without sending any
//! request, so no API key is needed.

use flatgem::{Generator, Pipeline, ProgressEvent, RunConfig, RunControl};
use std::sync::Arc;

/// A dry run never asks the generator for anything.
struct Unused;

impl Generator for Unused {
    fn generate(&self, _system_prompt: &str, _content: &str) -> flatgem::Result<String> {
        Err(flatgem::Error::MissingApiKey)
    }
}

fn main() -> anyhow::Result<()> {
    let config = RunConfig::builder()
        .input_dir("./chapters")
        .output_dir("./summaries")
        .system_prompt("Summarize this chapter in five sentences.")
        .output_extension("md")
        .process_subfolders(true)
        .dry_run(true) // Enable dry-run mode
        .build()?;

    println!("Running in DRY RUN mode - no requests are sent\n");

    let summary = Pipeline::new(config, Arc::new(Unused))?.run(&RunControl::new(), |event| {
        if let ProgressEvent::Planned { input, output } = event {
            println!("  {} -> {}", input.display(), output.display());
        }
    })?;

    println!("\nWould have written {} files", summary.succeeded);

    Ok(())
}
