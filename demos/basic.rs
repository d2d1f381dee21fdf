//! Basic example of using flatgem as a library
//!
//! Sends every file in `./chapters` to Gemini and writes the responses
//! to `./summaries`. Reads the key from `GEMINI_API_KEY`.

use flatgem::RunConfig;
use std::time::Duration;

fn main() -> anyhow::Result<()> {
    let api_key = std::env::var("GEMINI_API_KEY")?;

    let config = RunConfig::builder()
        .input_dir("./chapters")
        .output_dir("./summaries")
        .system_prompt("Summarize this chapter in five sentences.")
        .output_extension(".md")
        .processing_delay(Duration::from_secs(5))
        .build()?;

    let summary = flatgem::run(config, &api_key)?;

    summary.print_summary();

    for line in &summary.errors {
        eprintln!("{line}");
    }

    println!("\n✓ {}", summary.message());
    println!("✓ Output written to: {}", summary.output_directory);

    Ok(())
}
