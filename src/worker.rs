//! Runs a pipeline on a background thread and streams its progress.

use crate::{
    control::RunControl,
    error::{Error, Result},
    pipeline::{Pipeline, ProgressEvent, RunSummary},
};
use std::{
    sync::mpsc::{self, Receiver, TryRecvError},
    thread::{self, JoinHandle},
};
use tracing::{error, info};

/// Spawns background runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct Worker;

impl Worker {
    /// Starts `pipeline` on its own thread.
    ///
    /// Every [`ProgressEvent`] is forwarded over a channel; the last one is
    /// always [`ProgressEvent::Finished`] or [`ProgressEvent::Failed`].
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn spawn(pipeline: Pipeline) -> Result<WorkerHandle> {
        let control = RunControl::new();
        Self::spawn_with_control(pipeline, control)
    }

    /// Starts `pipeline` using an existing set of control flags.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn spawn_with_control(pipeline: Pipeline, control: RunControl) -> Result<WorkerHandle> {
        let (tx, rx) = mpsc::channel();
        let thread_control = control.clone();

        let handle = thread::Builder::new()
            .name("flatgem-worker".to_string())
            .spawn(move || {
                let events = tx.clone();
                // A dropped receiver only means nobody is listening anymore.
                let result = pipeline.run(&thread_control, |event| {
                    let _ = events.send(event);
                });

                match &result {
                    Ok(summary) => {
                        info!("{}", summary.message());
                        let _ = tx.send(ProgressEvent::Finished(summary.clone()));
                    }
                    Err(e) => {
                        error!("Processing failed: {}", e);
                        let _ = tx.send(ProgressEvent::Failed(e.to_string()));
                    }
                }
                result
            })
            .map_err(|e| Error::worker(format!("Failed to start worker thread: {e}")))?;

        info!("Worker started");
        Ok(WorkerHandle {
            control,
            events: rx,
            handle,
        })
    }
}

/// Controller side of a background run.
#[derive(Debug)]
pub struct WorkerHandle {
    control: RunControl,
    events: Receiver<ProgressEvent>,
    handle: JoinHandle<Result<RunSummary>>,
}

impl WorkerHandle {
    /// Flags shared with the running pipeline.
    #[must_use]
    pub const fn control(&self) -> &RunControl {
        &self.control
    }

    /// Requests a stop before the next file.
    pub fn stop(&self) {
        self.control.stop();
    }

    /// Suspends the run before the next file.
    pub fn pause(&self) {
        self.control.pause();
    }

    /// Resumes a paused run.
    pub fn resume(&self) {
        self.control.resume();
    }

    /// Blocking iterator over progress events; ends when the run ends.
    pub fn events(&self) -> impl Iterator<Item = ProgressEvent> + '_ {
        self.events.iter()
    }

    /// Drains the events available right now without blocking.
    #[must_use]
    pub fn try_events(&self) -> Vec<ProgressEvent> {
        let mut pending = Vec::new();
        loop {
            match self.events.try_recv() {
                Ok(event) => pending.push(event),
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }
        pending
    }

    /// Returns true once the background thread has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits for the run to end and returns its summary.
    ///
    /// # Errors
    ///
    /// Returns the pipeline's error, or an error if the worker thread panicked.
    pub fn join(self) -> Result<RunSummary> {
        self.handle
            .join()
            .map_err(|_| Error::worker("Worker thread panicked"))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{client::Generator, config::RunConfig, pipeline::RunOutcome};
    use assert_fs::prelude::*;
    use std::{sync::Arc, time::Duration};

    struct Echo;

    impl Generator for Echo {
        fn generate(&self, _system_prompt: &str, content: &str) -> Result<String> {
            Ok(format!("[{content}]"))
        }
    }

    fn pipeline(temp: &assert_fs::TempDir, delay: Duration) -> Pipeline {
        let config = RunConfig::builder()
            .input_dir(temp.child("in").path())
            .output_dir(temp.child("out").path())
            .system_prompt("Wrap.")
            .processing_delay(delay)
            .build()
            .unwrap();
        Pipeline::new(config, Arc::new(Echo)).unwrap()
    }

    #[test]
    fn test_worker_streams_events_and_finishes() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("in/one.txt").write_str("1").unwrap();
        temp.child("in/two.txt").write_str("2").unwrap();

        let handle = Worker::spawn(pipeline(&temp, Duration::ZERO)).unwrap();
        let events: Vec<_> = handle.events().collect();

        assert!(matches!(events.first(), Some(ProgressEvent::Started { total: 2 })));
        let started = events
            .iter()
            .filter(|e| matches!(e, ProgressEvent::FileStarted { .. }))
            .count();
        assert_eq!(started, 2);
        match events.last() {
            Some(ProgressEvent::Finished(summary)) => {
                assert_eq!(summary.outcome, RunOutcome::Completed);
                assert_eq!(summary.succeeded, 2);
            }
            other => panic!("unexpected last event: {other:?}"),
        }

        let summary = handle.join().unwrap();
        assert_eq!(summary.succeeded, 2);
        temp.child("out/two.txt").assert("[2]");
    }

    #[test]
    fn test_worker_stop_ends_run_early() {
        let temp = assert_fs::TempDir::new().unwrap();
        for i in 0..5 {
            temp.child(format!("in/{i}.txt")).write_str("x").unwrap();
        }

        let handle = Worker::spawn(pipeline(&temp, Duration::from_secs(30))).unwrap();
        for event in handle.events() {
            if matches!(event, ProgressEvent::FileSucceeded { .. }) {
                handle.stop();
                break;
            }
        }

        let summary = handle.join().unwrap();
        assert_eq!(summary.outcome, RunOutcome::Stopped);
        assert_eq!(summary.succeeded, 1);
    }

    #[test]
    fn test_worker_reports_unreadable_input() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("in").create_dir_all().unwrap();
        let pipeline = pipeline(&temp, Duration::ZERO);
        std::fs::remove_dir(temp.child("in").path()).unwrap();

        let handle = Worker::spawn(pipeline).unwrap();
        let events: Vec<_> = handle.events().collect();

        assert!(matches!(events.last(), Some(ProgressEvent::Failed(_))));
        assert!(handle.join().is_err());
    }

    struct Panics;

    impl Generator for Panics {
        fn generate(&self, _system_prompt: &str, _content: &str) -> Result<String> {
            panic!("generator failure");
        }
    }

    #[test]
    fn test_worker_panic_is_reported() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("in/one.txt").write_str("1").unwrap();

        let config = RunConfig::builder()
            .input_dir(temp.child("in").path())
            .output_dir(temp.child("out").path())
            .system_prompt("Wrap.")
            .build()
            .unwrap();
        let handle = Worker::spawn(Pipeline::new(config, Arc::new(Panics)).unwrap()).unwrap();

        let events: Vec<_> = handle.events().collect();
        assert!(!events.iter().any(|e| matches!(e, ProgressEvent::Finished(_))));

        let err = handle.join().unwrap_err();
        assert!(matches!(err, Error::Worker { .. }));
        assert!(err.to_string().contains("panicked"));
    }
}
