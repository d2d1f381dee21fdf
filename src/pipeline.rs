use crate::{
    client::Generator,
    config::RunConfig,
    control::RunControl,
    error::{Error, Result},
    scanner::collect_files,
    writer::{OutputWriter, output_path_for},
};
use chrono::{DateTime, Local};
use serde::Serialize;
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{debug, info, instrument, warn};

/// Progress notifications emitted while a run executes.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// Files were collected and processing begins
    Started {
        /// Number of files in the batch
        total: usize,
    },

    /// A file is about to be sent (1-based index)
    FileStarted {
        /// Position of the file in the batch
        index: usize,
        /// Number of files in the batch
        total: usize,
        /// Path relative to the input folder
        name: String,
    },

    /// A file's output was written
    FileSucceeded {
        /// Position of the file in the batch
        index: usize,
        /// Written output path
        output: PathBuf,
    },

    /// A file failed; the run continues with the next one
    FileFailed {
        /// Position of the file in the batch
        index: usize,
        /// Error log line
        message: String,
    },

    /// Dry run mapping of one input file to its output path
    Planned {
        /// Input file
        input: PathBuf,
        /// Output path a real run would write
        output: PathBuf,
    },

    /// The run is waiting for a resume
    Paused,

    /// The run left the pause
    Resumed,

    /// The run ended; sent by the background worker
    Finished(RunSummary),

    /// The run could not start or aborted; sent by the background worker
    Failed(String),
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every file was attempted
    Completed,
    /// A stop request ended the run early
    Stopped,
    /// The input folder had nothing to process
    NoFiles,
}

/// Statistics and error log of a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    /// How the run ended
    pub outcome: RunOutcome,

    /// Files collected for the run
    pub total_files: usize,

    /// Files whose output was written (or planned, in a dry run)
    pub succeeded: usize,

    /// Files that failed
    pub failed: usize,

    /// One line per failed file: `File: <name> | <reason>`
    pub errors: Vec<String>,

    /// Output folder
    pub output_directory: String,

    /// Whether this was a dry run
    pub dry_run: bool,

    /// Start time
    pub started_at: DateTime<Local>,

    /// End time
    pub finished_at: DateTime<Local>,

    /// Total execution time
    pub duration: Duration,
}

impl RunSummary {
    /// Returns true when the run completed without failures.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcome != RunOutcome::Stopped && self.errors.is_empty()
    }

    /// One-line result for the user.
    #[must_use]
    pub fn message(&self) -> String {
        match self.outcome {
            RunOutcome::NoFiles => "Processing finished: No files to process.".to_string(),
            RunOutcome::Stopped => "Processing stopped by user.".to_string(),
            RunOutcome::Completed if self.errors.is_empty() => format!(
                "Successfully processed {} of {} files.",
                self.succeeded, self.total_files
            ),
            RunOutcome::Completed => format!(
                "Processing finished with issues. \nProcessed: {} | Failed: {}",
                self.succeeded,
                self.failed
            ),
        }
    }

    /// Writes the summary as pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the report file cannot be written.
    pub fn write_report(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        let file = fs::File::create(path).map_err(|e| Error::io(path, e))?;
        serde_json::to_writer_pretty(file, self)?;
        info!("Wrote run report to {}", path.display());
        Ok(())
    }

    /// Prints a human-readable summary to stdout.
    pub fn print_summary(&self) {
        println!("\n╔═══════════════════════════════════════════════════════╗");
        println!("║                Batch Run Summary                      ║");
        println!("╠═══════════════════════════════════════════════════════╣");
        println!(
            "║ Outcome:              {:>12}                    ║",
            format!("{:?}", self.outcome)
        );
        println!(
            "║ Files in batch:       {:>8}                        ║",
            self.total_files
        );
        println!(
            "║   - Succeeded:        {:>8}                        ║",
            self.succeeded
        );
        println!(
            "║   - Failed:           {:>8}                        ║",
            self.failed
        );
        println!("║ Output Directory:                                     ║");
        println!("║   {}", self.output_directory);
        println!(
            "║ Total time:           {:>8.2}s                       ║",
            self.duration.as_secs_f64()
        );
        if self.dry_run {
            println!("║ ⚠ Dry run: no requests sent, no files written         ║");
        }
        println!("╚═══════════════════════════════════════════════════════╝\n");
    }
}

/// Sequential batch runner: one request per input file.
pub struct Pipeline {
    config: RunConfig,
    generator: Arc<dyn Generator>,
    writer: OutputWriter,
    system_prompt: String,
    extension: Option<String>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Creates a pipeline sending requests through `generator`.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration validation fails.
    pub fn new(config: RunConfig, generator: Arc<dyn Generator>) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            system_prompt: config.effective_system_prompt(),
            extension: config.normalized_extension(),
            writer: OutputWriter::new(config.backup_existing),
            config,
            generator,
        })
    }

    /// Returns the run configuration.
    #[must_use]
    pub const fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Runs the batch, reporting progress through `on_event`.
    ///
    /// # Process
    ///
    /// 1. **Collect**: lists input files (top level or recursive)
    /// 2. **Loop**: per file, honours stop/pause, reads, generates, writes
    /// 3. **Pace**: sleeps the configured delay after each successful file
    ///
    /// Per-file failures are logged in the summary and never abort the run.
    ///
    /// # Errors
    ///
    /// Returns an error only if the input folder cannot be read.
    #[instrument(skip(self, control, on_event), fields(input = %self.config.input_dir.display()))]
    pub fn run(
        &self,
        control: &RunControl,
        mut on_event: impl FnMut(ProgressEvent),
    ) -> Result<RunSummary> {
        let started_at = Local::now();
        let start_time = Instant::now();

        let files = collect_files(
            &self.config.input_dir,
            self.config.process_subfolders,
            &self.config.exclude,
        )?;
        let total = files.len();

        let mut summary = RunSummary {
            outcome: RunOutcome::Completed,
            total_files: total,
            succeeded: 0,
            failed: 0,
            errors: Vec::new(),
            output_directory: self.config.output_dir.display().to_string(),
            dry_run: self.config.dry_run,
            started_at,
            finished_at: started_at,
            duration: Duration::ZERO,
        };

        if total == 0 {
            info!("No files to process");
            summary.outcome = RunOutcome::NoFiles;
            return Ok(Self::finish(summary, start_time));
        }

        info!(
            "Processing {} files with model {}{}",
            total,
            self.config.model,
            if self.config.dry_run { " (dry run)" } else { "" }
        );
        on_event(ProgressEvent::Started { total });

        for (i, file) in files.iter().enumerate() {
            if !control.is_running() || !Self::wait_if_paused(control, &mut on_event) {
                info!("Processing stopped by user after {} of {} files", i, total);
                summary.outcome = RunOutcome::Stopped;
                return Ok(Self::finish(summary, start_time));
            }

            let index = i + 1;
            let name = self.display_name(file);
            on_event(ProgressEvent::FileStarted {
                index,
                total,
                name: name.clone(),
            });

            if self.config.dry_run {
                let output = self.output_path(file);
                on_event(ProgressEvent::Planned {
                    input: file.clone(),
                    output,
                });
                summary.succeeded += 1;
                continue;
            }

            match self.process_file(file) {
                Ok(output) => {
                    info!("✓ [{}/{}] {} -> {}", index, total, name, output.display());
                    summary.succeeded += 1;
                    on_event(ProgressEvent::FileSucceeded { index, output });
                }
                Err(e) => {
                    let message = format!("File: {name} | {e}");
                    warn!("{}", message);
                    summary.failed += 1;
                    summary.errors.push(message.clone());
                    on_event(ProgressEvent::FileFailed { index, message });
                    // Only successful requests are paced.
                    continue;
                }
            }

            if index < total && !self.config.processing_delay.is_zero() {
                debug!("Waiting {:?} before the next file", self.config.processing_delay);
                // A stop during the delay is picked up at the top of the next iteration.
                let _ = control.sleep(self.config.processing_delay);
            }
        }

        info!(
            "Run complete: {} succeeded, {} failed",
            summary.succeeded,
            summary.failed
        );
        Ok(Self::finish(summary, start_time))
    }

    fn finish(mut summary: RunSummary, start_time: Instant) -> RunSummary {
        summary.finished_at = Local::now();
        summary.duration = start_time.elapsed();
        summary
    }

    fn wait_if_paused(control: &RunControl, on_event: &mut impl FnMut(ProgressEvent)) -> bool {
        if !control.is_paused() {
            return true;
        }

        info!("Processing paused");
        on_event(ProgressEvent::Paused);
        let keep_going = control.wait_while_paused();
        if keep_going {
            info!("Processing resumed");
            on_event(ProgressEvent::Resumed);
        }
        keep_going
    }

    /// Reads, generates and writes one file, returning the output path.
    fn process_file(&self, file: &Path) -> Result<PathBuf> {
        let content = fs::read_to_string(file).map_err(|e| Error::read(file, e))?;

        debug!("Sending to API: {}", file.display());
        let generated = self.generator.generate(&self.system_prompt, &content)?;

        let output = self.output_path(file);
        self.writer.write(&output, &generated)?;
        Ok(output)
    }

    fn output_path(&self, file: &Path) -> PathBuf {
        output_path_for(
            &self.config.input_dir,
            &self.config.output_dir,
            file,
            self.extension.as_deref(),
        )
    }

    fn display_name(&self, file: &Path) -> String {
        file.strip_prefix(&self.config.input_dir)
            .unwrap_or(file)
            .display()
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_fs::prelude::*;
    use std::sync::Mutex;

    /// Uppercases content and records every request.
    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(String, String)>>,
        fail_on: Option<&'static str>,
    }

    impl Recorder {
        fn failing_on(content: &'static str) -> Self {
            Self {
                fail_on: Some(content),
                ..Self::default()
            }
        }

        fn calls(&self) -> Vec<(String, String)> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl Generator for Recorder {
        fn generate(&self, system_prompt: &str, content: &str) -> Result<String> {
            self.calls
                .lock()
                .unwrap()
                .push((system_prompt.to_string(), content.to_string()));
            if self.fail_on == Some(content) {
                return Err(Error::api(Some(500), "internal error"));
            }
            Ok(content.to_uppercase())
        }
    }

    /// Runs a callback on the n-th request, then echoes.
    struct OnCall<F: Fn() + Send + Sync> {
        at: usize,
        seen: Mutex<usize>,
        action: F,
    }

    impl<F: Fn() + Send + Sync> Generator for OnCall<F> {
        fn generate(&self, _system_prompt: &str, content: &str) -> Result<String> {
            let mut seen = self.seen.lock().unwrap();
            *seen += 1;
            if *seen == self.at {
                (self.action)();
            }
            Ok(content.to_string())
        }
    }

    fn fixture() -> assert_fs::TempDir {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("in/a.txt").write_str("alpha").unwrap();
        temp.child("in/b.txt").write_str("beta").unwrap();
        temp.child("in/c.txt").write_str("gamma").unwrap();
        temp
    }

    fn config(temp: &assert_fs::TempDir) -> crate::config::RunConfigBuilder {
        RunConfig::builder()
            .input_dir(temp.child("in").path())
            .output_dir(temp.child("out").path())
            .system_prompt("Shout.")
            .processing_delay(Duration::ZERO)
    }

    #[test]
    fn test_pipeline_processes_all_files() {
        let temp = fixture();
        let generator = Arc::new(Recorder::default());
        let pipeline = Pipeline::new(config(&temp).build().unwrap(), generator.clone()).unwrap();

        let summary = pipeline.run(&RunControl::new(), |_| {}).unwrap();

        assert_eq!(summary.outcome, RunOutcome::Completed);
        assert_eq!(summary.total_files, 3);
        assert_eq!(summary.succeeded, 3);
        assert!(summary.is_success());
        assert_eq!(summary.message(), "Successfully processed 3 of 3 files.");
        temp.child("out/a.txt").assert("ALPHA");
        temp.child("out/c.txt").assert("GAMMA");

        let calls = generator.calls();
        assert_eq!(calls.len(), 3);
        assert!(calls.iter().all(|(prompt, _)| prompt == "Shout."));
    }

    #[test]
    fn test_pipeline_mirrors_subfolders_and_swaps_extension() {
        let temp = fixture();
        temp.child("in/part2/d.txt").write_str("delta").unwrap();

        let config = config(&temp)
            .process_subfolders(true)
            .output_extension("md")
            .build()
            .unwrap();
        let pipeline = Pipeline::new(config, Arc::new(Recorder::default())).unwrap();

        let summary = pipeline.run(&RunControl::new(), |_| {}).unwrap();

        assert_eq!(summary.succeeded, 4);
        temp.child("out/a.md").assert("ALPHA");
        temp.child("out/part2/d.md").assert("DELTA");
        assert!(!temp.child("out/a.txt").path().exists());
    }

    #[test]
    fn test_pipeline_failure_does_not_abort_batch() {
        let temp = fixture();
        let generator = Arc::new(Recorder::failing_on("beta"));
        let pipeline = Pipeline::new(config(&temp).build().unwrap(), generator.clone()).unwrap();

        let mut failed_events = 0;
        let summary = pipeline
            .run(&RunControl::new(), |event| {
                if matches!(event, ProgressEvent::FileFailed { index: 2, .. }) {
                    failed_events += 1;
                }
            })
            .unwrap();

        assert_eq!(summary.outcome, RunOutcome::Completed);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.failed, 1);
        assert!(summary.errors[0].starts_with("File: b.txt | "));
        assert!(summary.errors[0].contains("internal error"));
        assert_eq!(failed_events, 1);
        assert_eq!(generator.calls().len(), 3);
        assert!(!temp.child("out/b.txt").path().exists());
        temp.child("out/c.txt").assert("GAMMA");
        assert_eq!(
            summary.message(),
            "Processing finished with issues. \nProcessed: 2 | Failed: 1"
        );
    }

    #[test]
    fn test_pipeline_failed_file_skips_delay() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("in/a.txt").write_str("beta").unwrap();
        temp.child("in/b.txt").write_str("beta").unwrap();

        let config = config(&temp)
            .processing_delay(Duration::from_secs(2))
            .build()
            .unwrap();
        let pipeline = Pipeline::new(config, Arc::new(Recorder::failing_on("beta"))).unwrap();

        let start = Instant::now();
        let summary = pipeline.run(&RunControl::new(), |_| {}).unwrap();

        assert_eq!(summary.failed, 2);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_pipeline_delays_after_success() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("in/a.txt").write_str("alpha").unwrap();
        temp.child("in/b.txt").write_str("gamma").unwrap();

        let config = config(&temp)
            .processing_delay(Duration::from_millis(300))
            .build()
            .unwrap();
        let pipeline = Pipeline::new(config, Arc::new(Recorder::default())).unwrap();

        let start = Instant::now();
        let summary = pipeline.run(&RunControl::new(), |_| {}).unwrap();

        assert_eq!(summary.succeeded, 2);
        assert!(start.elapsed() >= Duration::from_millis(300));
    }

    #[test]
    fn test_pipeline_records_unreadable_file() {
        let temp = fixture();
        temp.child("in/blob.bin").write_binary(&[0xff, 0xfe, 0x00, 0x81]).unwrap();

        let pipeline =
            Pipeline::new(config(&temp).build().unwrap(), Arc::new(Recorder::default())).unwrap();
        let summary = pipeline.run(&RunControl::new(), |_| {}).unwrap();

        assert_eq!(summary.succeeded, 3);
        assert_eq!(summary.failed, 1);
        assert!(summary.errors[0].starts_with("File: blob.bin | Invalid UTF-8"));
    }

    #[test]
    fn test_pipeline_error_names_nested_file_by_relative_path() {
        let temp = fixture();
        temp.child("in/nested/blob.bin").write_binary(&[0xff, 0xfe]).unwrap();

        let config = config(&temp).process_subfolders(true).build().unwrap();
        let pipeline = Pipeline::new(config, Arc::new(Recorder::default())).unwrap();
        let summary = pipeline.run(&RunControl::new(), |_| {}).unwrap();

        let name = Path::new("nested").join("blob.bin");
        assert_eq!(summary.failed, 1);
        assert!(summary.errors[0].starts_with(&format!("File: {} | ", name.display())));
    }

    #[test]
    fn test_pipeline_stop_within_one_iteration() {
        let temp = fixture();
        let control = RunControl::new();
        let remote = control.clone();
        let generator = Arc::new(OnCall {
            at: 1,
            seen: Mutex::new(0),
            action: move || remote.stop(),
        });

        let pipeline = Pipeline::new(config(&temp).build().unwrap(), generator.clone()).unwrap();
        let summary = pipeline.run(&control, |_| {}).unwrap();

        assert_eq!(summary.outcome, RunOutcome::Stopped);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(*generator.seen.lock().unwrap(), 1);
        assert_eq!(summary.message(), "Processing stopped by user.");
        assert!(!summary.is_success());
        temp.child("out/a.txt").assert("alpha");
        assert!(!temp.child("out/b.txt").path().exists());
    }

    #[test]
    fn test_pipeline_stop_interrupts_delay() {
        let temp = fixture();
        let control = RunControl::new();
        let remote = control.clone();
        let generator = Arc::new(OnCall {
            at: 1,
            seen: Mutex::new(0),
            action: move || remote.stop(),
        });

        let config = config(&temp)
            .processing_delay(Duration::from_secs(60))
            .build()
            .unwrap();
        let pipeline = Pipeline::new(config, generator).unwrap();

        let start = Instant::now();
        let summary = pipeline.run(&control, |_| {}).unwrap();

        assert_eq!(summary.outcome, RunOutcome::Stopped);
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_pipeline_pause_suspends_without_terminating() {
        let temp = fixture();
        let control = RunControl::new().with_poll_interval(Duration::from_millis(5));
        let pauser = control.clone();
        let generator = Arc::new(OnCall {
            at: 1,
            seen: Mutex::new(0),
            action: move || pauser.pause(),
        });

        let resumer = control.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            resumer.resume();
        });

        let pipeline = Pipeline::new(config(&temp).build().unwrap(), generator.clone()).unwrap();
        let mut events = Vec::new();
        let summary = pipeline
            .run(&control, |event| events.push(format!("{event:?}")))
            .unwrap();
        handle.join().unwrap();

        assert_eq!(summary.outcome, RunOutcome::Completed);
        assert_eq!(summary.succeeded, 3);
        assert_eq!(*generator.seen.lock().unwrap(), 3);
        assert!(events.iter().any(|e| e == "Paused"));
        assert!(events.iter().any(|e| e == "Resumed"));
    }

    #[test]
    fn test_pipeline_stop_while_paused() {
        let temp = fixture();
        let control = RunControl::new().with_poll_interval(Duration::from_millis(5));
        control.pause();

        let stopper = control.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            stopper.stop();
        });

        let generator = Arc::new(Recorder::default());
        let pipeline = Pipeline::new(config(&temp).build().unwrap(), generator.clone()).unwrap();
        let summary = pipeline.run(&control, |_| {}).unwrap();
        handle.join().unwrap();

        assert_eq!(summary.outcome, RunOutcome::Stopped);
        assert!(generator.calls().is_empty());
    }

    #[test]
    fn test_pipeline_no_files() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("in").create_dir_all().unwrap();

        let pipeline =
            Pipeline::new(config(&temp).build().unwrap(), Arc::new(Recorder::default())).unwrap();
        let summary = pipeline.run(&RunControl::new(), |_| {}).unwrap();

        assert_eq!(summary.outcome, RunOutcome::NoFiles);
        assert_eq!(summary.message(), "Processing finished: No files to process.");
    }

    #[test]
    fn test_pipeline_dry_run() {
        let temp = fixture();
        let generator = Arc::new(Recorder::default());
        let config = config(&temp).dry_run(true).output_extension(".md").build().unwrap();
        let pipeline = Pipeline::new(config, generator.clone()).unwrap();

        let mut planned = Vec::new();
        let summary = pipeline
            .run(&RunControl::new(), |event| {
                if let ProgressEvent::Planned { output, .. } = event {
                    planned.push(output);
                }
            })
            .unwrap();

        assert_eq!(summary.succeeded, 3);
        assert!(summary.dry_run);
        assert!(generator.calls().is_empty());
        assert!(!temp.child("out").path().exists());
        assert_eq!(planned[0], temp.child("out").path().join("a.md"));
    }

    #[test]
    fn test_pipeline_thinking_mode_prompt() {
        let temp = fixture();
        let generator = Arc::new(Recorder::default());
        let config = config(&temp).thinking_mode(true).build().unwrap();
        let pipeline = Pipeline::new(config, generator.clone()).unwrap();

        pipeline.run(&RunControl::new(), |_| {}).unwrap();

        let (prompt, _) = &generator.calls()[0];
        assert!(prompt.starts_with(crate::config::THINKING_INSTRUCTION));
        assert!(prompt.ends_with("Shout."));
    }

    #[test]
    fn test_summary_report_written() {
        let temp = fixture();
        let pipeline =
            Pipeline::new(config(&temp).build().unwrap(), Arc::new(Recorder::default())).unwrap();
        let summary = pipeline.run(&RunControl::new(), |_| {}).unwrap();

        let report = temp.child("reports/run.json");
        summary.write_report(report.path()).unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(report.path()).unwrap()).unwrap();
        assert_eq!(json["outcome"], "completed");
        assert_eq!(json["succeeded"], 3);
    }
}
