use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use flatgem::{
    DEFAULT_MODEL, Error, GeminiClient, Generator, KeyStatus, MAX_PROCESSING_DELAY_SECS, Pipeline,
    Preferences, ProgressEvent, RunConfig, RunControl, RunOutcome, ScanReport, SettingsStore,
    Worker, available_models, default_model, model_hint, preflight, validate_key,
};
use std::{
    io::{self, BufRead, Write},
    path::PathBuf,
    process::ExitCode,
    sync::Arc,
    thread,
    time::Duration,
};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(
    name = "flatgem",
    version,
    author,
    about = "Batch-process a folder of text files through Gemini",
    long_about = "Batch-process a folder of text files through Gemini.\n\n\
    Every file in the input folder is sent to the model together with a system prompt, \
    and the response is written to the output folder under the same relative path. \
    Settings used for a run are remembered for the next one.\n\n\
    USAGE EXAMPLES:\n  \
      # Summarize every chapter, writing Markdown files\n  \
      flatgem run --input ./chapters --output ./summaries --prompt \"Summarize.\" --ext md\n\n  \
      # Re-run with the remembered settings\n  \
      flatgem run\n\n  \
      # Inspect the input folder without sending anything\n  \
      flatgem scan --input ./chapters --subfolders\n\n  \
      # Store an API key after checking it\n  \
      flatgem check-key --api-key YOUR_KEY --save"
)]
struct Cli {
    /// Gemini API key (falls back to the saved key)
    #[arg(long, env = "GEMINI_API_KEY", hide_env_values = true, global = true)]
    api_key: Option<String>,

    /// Use this settings file instead of the platform default
    #[arg(long, value_name = "FILE", global = true)]
    settings_file: Option<PathBuf>,

    /// Verbose output (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Process every file of the input folder
    Run(RunArgs),

    /// Show the pre-flight report without processing anything
    Scan(ScanArgs),

    /// Check that the API key is accepted
    CheckKey {
        /// Save the key when it is valid
        #[arg(long)]
        save: bool,
    },

    /// List available models
    Models,

    /// Inspect or change saved settings
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
}

#[derive(Subcommand, Debug)]
enum SettingsAction {
    /// Print saved preferences
    Show,
    /// Print the settings file location
    Path,
    /// Save an API key
    SetKey {
        /// Key to store
        key: String,
    },
    /// Remove the saved API key
    ClearKey,
    /// Restore default preferences (the API key is kept)
    Reset,
}

#[derive(Args, Debug)]
struct FolderArgs {
    /// Folder with the files to process
    #[arg(short, long, value_name = "PATH")]
    input: Option<PathBuf>,

    /// Folder receiving the generated files
    #[arg(short, long, value_name = "PATH")]
    output: Option<PathBuf>,

    /// Also process files in subfolders
    #[arg(long, overrides_with = "no_subfolders")]
    subfolders: bool,

    /// Only process the top level of the input folder
    #[arg(long)]
    no_subfolders: bool,

    /// Glob pattern of files to skip (can be used multiple times)
    #[arg(long, value_name = "GLOB")]
    exclude: Vec<String>,
}

#[derive(Args, Debug)]
struct ScanArgs {
    #[command(flatten)]
    folders: FolderArgs,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    folders: FolderArgs,

    /// System prompt text
    #[arg(short, long, conflicts_with = "prompt_file")]
    prompt: Option<String>,

    /// Read the system prompt from a file
    #[arg(long, value_name = "FILE")]
    prompt_file: Option<PathBuf>,

    /// Model name
    #[arg(short, long)]
    model: Option<String>,

    /// Extension for output files, e.g. md (empty keeps the input's)
    #[arg(long, value_name = "EXT")]
    ext: Option<String>,

    /// Seconds to wait between files (0-300)
    #[arg(
        long,
        value_name = "SECONDS",
        value_parser = clap::value_parser!(u64).range(0..=MAX_PROCESSING_DELAY_SECS)
    )]
    delay: Option<u64>,

    /// Ask the model to reason before answering, returning only the result
    #[arg(long, overrides_with = "no_thinking")]
    thinking: bool,

    /// Disable thinking mode
    #[arg(long)]
    no_thinking: bool,

    /// Show what would be written without calling the API
    #[arg(long)]
    dry_run: bool,

    /// Keep a timestamped copy of output files before overwriting
    #[arg(long)]
    backup: bool,

    /// Start without confirming pre-flight warnings
    #[arg(short, long)]
    yes: bool,

    /// Write a JSON run report to this file
    #[arg(long, value_name = "FILE")]
    report: Option<PathBuf>,

    /// Do not remember the settings of this run
    #[arg(long)]
    no_save: bool,
}

fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    setup_tracing(cli.verbose)?;

    let store = match cli.settings_file {
        Some(path) => SettingsStore::at(path),
        None => SettingsStore::open().context("Failed to locate settings")?,
    };
    let api_key = cli.api_key.filter(|k| !k.trim().is_empty()).or_else(|| store.load_api_key());

    match cli.command {
        Command::Run(args) => run(&store, api_key, args),
        Command::Scan(args) => scan(&store, &args),
        Command::CheckKey { save } => check_key(&store, api_key, save),
        Command::Models => {
            list_models(api_key);
            Ok(ExitCode::SUCCESS)
        }
        Command::Settings { action } => settings(&store, action),
    }
}

fn run(store: &SettingsStore, api_key: Option<String>, args: RunArgs) -> anyhow::Result<ExitCode> {
    let prefs = store.load_preferences();
    let folders = resolve_folders(&args.folders, &prefs);

    let prompt = match (&args.prompt, &args.prompt_file) {
        (Some(text), _) => text.clone(),
        (None, Some(path)) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read prompt file {}", path.display()))?,
        (None, None) => prefs.prompt_text.clone(),
    };
    let model = args
        .model
        .clone()
        .or_else(|| Some(prefs.selected_model_name.clone()).filter(|m| !m.trim().is_empty()))
        .unwrap_or_else(|| DEFAULT_MODEL.to_string());

    let config = RunConfig::builder()
        .input_dir(folders.input)
        .output_dir(folders.output)
        .system_prompt(prompt)
        .model(model)
        .output_extension(args.ext.clone().unwrap_or_else(|| prefs.output_extension.clone()))
        .processing_delay(args.delay.map_or_else(|| prefs.processing_delay(), Duration::from_secs))
        .thinking_mode(flag(args.thinking, args.no_thinking, prefs.thinking_mode))
        .process_subfolders(folders.subfolders)
        .exclude(folders.exclude)
        .dry_run(args.dry_run)
        .backup_existing(args.backup)
        .build()
        .context("Invalid run settings")?;

    let report = preflight(
        &config.input_dir,
        &config.output_dir,
        config.process_subfolders,
        &config.exclude,
    )?;
    print_report(&report);

    if !report.has_files() {
        bail!("No files found in the input folder.");
    }
    if !report.warnings.is_empty() && !args.yes && !confirm("Continue anyway?")? {
        println!("Cancelled.");
        return Ok(ExitCode::SUCCESS);
    }

    let generator: Arc<dyn Generator> = match api_key {
        Some(key) => Arc::new(GeminiClient::new(&key, config.model.clone())?),
        None if config.dry_run => Arc::new(Offline),
        None => return Err(Error::MissingApiKey.into()),
    };

    let remembered = Preferences {
        prompt_text: config.system_prompt.clone(),
        input_path: config.input_dir.display().to_string(),
        output_path: config.output_dir.display().to_string(),
        output_extension: config.output_extension.clone().unwrap_or_default(),
        processing_delay: config.processing_delay.as_secs(),
        selected_model_name: config.model.clone(),
        thinking_mode: config.thinking_mode,
        process_subfolders: config.process_subfolders,
    };

    let pipeline = Pipeline::new(config, generator).context("Failed to create pipeline")?;
    let control = RunControl::new();
    spawn_command_reader(control.clone());

    let handle = Worker::spawn_with_control(pipeline, control)?;
    for event in handle.events() {
        render(&event);
    }
    let summary = handle.join().context("Processing failed")?;

    summary.print_summary();
    println!("{}", summary.message());
    if !summary.errors.is_empty() {
        println!("\nError log:");
        for line in &summary.errors {
            println!("  {line}");
        }
    }

    if let Some(path) = &args.report {
        summary.write_report(path).context("Failed to write run report")?;
    }

    if !args.no_save && summary.outcome != RunOutcome::NoFiles {
        store
            .save_preferences(&remembered)
            .context("Failed to save preferences")?;
    }

    Ok(if summary.failed > 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

fn scan(store: &SettingsStore, args: &ScanArgs) -> anyhow::Result<ExitCode> {
    let folders = resolve_folders(&args.folders, &store.load_preferences());
    if folders.input.as_os_str().is_empty() {
        bail!("No input folder given");
    }

    let report = preflight(
        &folders.input,
        &folders.output,
        folders.subfolders,
        &folders.exclude,
    )?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(ExitCode::SUCCESS)
}

fn check_key(
    store: &SettingsStore,
    api_key: Option<String>,
    save: bool,
) -> anyhow::Result<ExitCode> {
    let status = api_key.as_deref().map_or(KeyStatus::Missing, validate_key);
    println!("{}", status.message());

    if !status.is_valid() {
        return Ok(ExitCode::FAILURE);
    }
    if let Some(key) = api_key.filter(|_| save) {
        store.save_api_key(&key)?;
        println!("API key saved to {}", store.path().display());
    }
    Ok(ExitCode::SUCCESS)
}

fn list_models(api_key: Option<String>) {
    let models = available_models(api_key.as_deref().unwrap_or_default());
    let default = default_model(&models).map(ToString::to_string);

    for model in &models {
        let marker = if default.as_deref() == Some(model.as_str()) {
            "*"
        } else {
            " "
        };
        match model_hint(model) {
            Some(hint) => println!("{marker} {model:<40} {hint}"),
            None => println!("{marker} {model}"),
        }
    }
}

fn settings(store: &SettingsStore, action: SettingsAction) -> anyhow::Result<ExitCode> {
    match action {
        SettingsAction::Show => {
            let prefs = store.load_preferences();
            println!("Settings file: {}", store.path().display());
            println!(
                "API key: {}",
                if store.load_api_key().is_some() { "saved" } else { "not saved" }
            );
            println!("{}", serde_json::to_string_pretty(&prefs)?);
        }
        SettingsAction::Path => println!("{}", store.path().display()),
        SettingsAction::SetKey { key } => {
            store.save_api_key(&key)?;
            println!("API key saved.");
        }
        SettingsAction::ClearKey => {
            store.clear_api_key()?;
            println!("API key removed.");
        }
        SettingsAction::Reset => {
            store.reset_preferences()?;
            println!("Preferences reset.");
        }
    }
    Ok(ExitCode::SUCCESS)
}

struct Folders {
    input: PathBuf,
    output: PathBuf,
    subfolders: bool,
    exclude: Vec<String>,
}

fn resolve_folders(args: &FolderArgs, prefs: &Preferences) -> Folders {
    Folders {
        input: args
            .input
            .clone()
            .unwrap_or_else(|| PathBuf::from(&prefs.input_path)),
        output: args
            .output
            .clone()
            .unwrap_or_else(|| PathBuf::from(&prefs.output_path)),
        subfolders: flag(args.subfolders, args.no_subfolders, prefs.process_subfolders),
        exclude: args.exclude.clone(),
    }
}

const fn flag(on: bool, off: bool, saved: bool) -> bool {
    if on {
        true
    } else if off {
        false
    } else {
        saved
    }
}

fn print_report(report: &ScanReport) {
    println!("Files found:      {}", report.files_found);
    println!(
        "Subfolders:       {}",
        if report.subfolders_found { "yes" } else { "no" }
    );
    if !report.formats.is_empty() {
        let formats: Vec<_> = report.formats.iter().map(String::as_str).collect();
        println!("Formats:          {}", formats.join(", "));
    }
    if !report.warnings.is_empty() {
        println!("\nWarnings:");
        for warning in &report.warnings {
            println!("{warning}");
        }
    }
    println!();
}

fn confirm(question: &str) -> anyhow::Result<bool> {
    print!("{question} [y/N] ");
    io::stdout().flush()?;

    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
}

/// Reads pause/resume/stop commands from stdin until the process exits.
fn spawn_command_reader(control: RunControl) {
    thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            match line.trim().to_lowercase().as_str() {
                "p" | "pause" => control.pause(),
                "r" | "resume" => control.resume(),
                "s" | "stop" => {
                    println!("Stopping after the current file...");
                    control.stop();
                    break;
                }
                "" => {}
                other => println!("Unknown command '{other}'. Use p (pause), r (resume) or s (stop)."),
            }
        }
    });
}

fn render(event: &ProgressEvent) {
    match event {
        ProgressEvent::Started { total } => {
            println!("Processing {total} files. Commands: p = pause, r = resume, s = stop");
        }
        ProgressEvent::FileStarted { index, total, name } => {
            println!("Processing file {index}/{total}: {name}");
        }
        ProgressEvent::FileSucceeded { output, .. } => println!("  ✓ {}", output.display()),
        ProgressEvent::FileFailed { message, .. } => println!("  ✗ {message}"),
        ProgressEvent::Planned { output, .. } => println!("  → {}", output.display()),
        ProgressEvent::Paused => println!("Paused. Type r to resume or s to stop."),
        ProgressEvent::Resumed => println!("Resumed."),
        ProgressEvent::Finished(_) | ProgressEvent::Failed(_) => {}
    }
}

/// Stand-in used by dry runs without a key; a dry run never calls it.
struct Offline;

impl Generator for Offline {
    fn generate(&self, _system_prompt: &str, _content: &str) -> flatgem::Result<String> {
        Err(Error::MissingApiKey)
    }
}

fn setup_tracing(verbosity: u8) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbosity)));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .with_writer(io::stderr),
        )
        .init();

    Ok(())
}

const fn default_directive(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "flatgem=warn",
        1 => "flatgem=info",
        2 => "flatgem=debug",
        _ => "flatgem=trace",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_delay_range() {
        let ok = Cli::try_parse_from(["flatgem", "run", "--delay", "300"]);
        assert!(ok.is_ok());

        let too_long = Cli::try_parse_from(["flatgem", "run", "--delay", "301"]);
        assert!(too_long.is_err());
    }

    #[test]
    fn test_default_directive_by_verbosity() {
        assert_eq!(default_directive(0), "flatgem=warn");
        assert_eq!(default_directive(2), "flatgem=debug");
        assert_eq!(default_directive(9), "flatgem=trace");
    }
}
