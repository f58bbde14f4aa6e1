//! Analysis dispatcher: gates and launches out-of-process analysis jobs and
//! drains their result files into the shared state.
//!
//! A job is triggered only when the feature window is full, no job is live
//! and the trigger cooldown has elapsed. Refused triggers are dropped, never
//! queued, and never touch the cooldown.

use crate::protocol::{write_json_atomic, AnalysisRequest, AnalysisResult, ExchangePaths};
use crate::state::{SharedStatePublisher, StateError};
use crate::window::FeatureWindow;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("failed to write request {path}: {source}")]
    Request {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to launch analyzer {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to publish result: {0}")]
    Publish(#[from] StateError),
}

/// A running analysis process.
pub trait JobHandle {
    /// OS process id, if there is one.
    fn id(&self) -> Option<u32>;
    /// Non-blocking exit probe.
    fn has_exited(&mut self) -> io::Result<bool>;
    fn kill(&mut self) -> io::Result<()>;
}

impl JobHandle for Child {
    fn id(&self) -> Option<u32> {
        Some(Child::id(self))
    }

    fn has_exited(&mut self) -> io::Result<bool> {
        Ok(self.try_wait()?.is_some())
    }

    fn kill(&mut self) -> io::Result<()> {
        Child::kill(self)?;
        // Reap so the process does not linger as a zombie.
        self.wait().map(|_| ())
    }
}

/// Starts analysis jobs for a request already written to `paths.request`.
pub trait JobLauncher {
    fn program(&self) -> &str;
    fn launch(&mut self, paths: &ExchangePaths) -> io::Result<Box<dyn JobHandle>>;
}

/// Spawns `program [args..] --request <path> --result <path>` with stdout and
/// stderr appended to the exchange log file.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    pub program: String,
    pub args: Vec<String>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

impl JobLauncher for ProcessLauncher {
    fn program(&self) -> &str {
        &self.program
    }

    fn launch(&mut self, paths: &ExchangePaths) -> io::Result<Box<dyn JobHandle>> {
        let log = OpenOptions::new().create(true).append(true).open(&paths.log)?;
        let child = Command::new(&self.program)
            .args(&self.args)
            .arg("--request")
            .arg(&paths.request)
            .arg("--result")
            .arg(&paths.result)
            .stdin(Stdio::null())
            .stdout(log.try_clone()?)
            .stderr(log)
            .spawn()?;
        Ok(Box::new(child))
    }
}

/// The single live analysis job.
struct AnalysisJob {
    subject_label: String,
    started_at: Instant,
    handle: Box<dyn JobHandle>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Triggered { subject_label: String, samples: usize },
    WindowFilling { len: usize, capacity: usize },
    JobRunning,
    CoolingDown { remaining: Duration },
}

#[derive(Debug, Clone, PartialEq)]
pub enum DrainOutcome {
    /// No result file present.
    Empty,
    /// Result merged into the shared state and removed.
    Published { ok: bool, run_id: Option<String> },
    /// Result could not be parsed and was removed.
    Discarded { reason: String },
}

pub struct AnalysisDispatcher {
    paths: ExchangePaths,
    launcher: Box<dyn JobLauncher>,
    cooldown: Duration,
    /// Kill a job running longer than this. `None` waits forever.
    timeout: Option<Duration>,
    last_trigger: Option<Instant>,
    job: Option<AnalysisJob>,
}

impl AnalysisDispatcher {
    pub fn new(
        paths: ExchangePaths,
        launcher: Box<dyn JobLauncher>,
        cooldown: Duration,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            paths,
            launcher,
            cooldown,
            timeout,
            last_trigger: None,
            job: None,
        }
    }

    pub fn paths(&self) -> &ExchangePaths {
        &self.paths
    }

    pub fn last_trigger(&self) -> Option<Instant> {
        self.last_trigger
    }

    /// Whether a job occupies the slot (as of the last probe).
    pub fn has_live_job(&self) -> bool {
        self.job.is_some()
    }

    /// Evaluate the gate and launch a job for the window's samples if it passes.
    pub fn try_dispatch(
        &mut self,
        window: &FeatureWindow,
        subject: &str,
        now: Instant,
    ) -> Result<DispatchOutcome, DispatchError> {
        if !window.is_full() {
            return Ok(DispatchOutcome::WindowFilling {
                len: window.len(),
                capacity: window.capacity(),
            });
        }

        if self.probe_job(now) {
            return Ok(DispatchOutcome::JobRunning);
        }

        if let Some(last) = self.last_trigger {
            let elapsed = now.saturating_duration_since(last);
            if elapsed <= self.cooldown {
                return Ok(DispatchOutcome::CoolingDown {
                    remaining: self.cooldown - elapsed,
                });
            }
        }

        let request = AnalysisRequest {
            subject_label: subject.to_string(),
            time_series_data: window.snapshot(),
        };
        write_json_atomic(&self.paths.request, &request).map_err(|source| DispatchError::Request {
            path: self.paths.request.clone(),
            source,
        })?;

        let handle = self.launcher.launch(&self.paths).map_err(|source| DispatchError::Launch {
            program: self.launcher.program().to_string(),
            source,
        })?;

        tracing::info!(
            subject = subject,
            samples = request.time_series_data.len(),
            pid = ?handle.id(),
            "analysis job started"
        );
        self.last_trigger = Some(now);
        self.job = Some(AnalysisJob {
            subject_label: request.subject_label,
            started_at: now,
            handle,
        });

        Ok(DispatchOutcome::Triggered {
            subject_label: subject.to_string(),
            samples: request.time_series_data.len(),
        })
    }

    /// Returns whether a job is still live, clearing the slot for exited or
    /// timed-out jobs.
    fn probe_job(&mut self, now: Instant) -> bool {
        let Some(job) = self.job.as_mut() else {
            return false;
        };

        match job.handle.has_exited() {
            Ok(false) => {}
            Ok(true) => {
                tracing::info!(subject = %job.subject_label, "analysis job finished");
                self.job = None;
                return false;
            }
            Err(e) => {
                tracing::warn!(subject = %job.subject_label, error = %e, "analysis job status unknown; releasing slot");
                if let Err(e) = job.handle.kill() {
                    tracing::warn!(error = %e, "failed to kill analysis job");
                }
                self.job = None;
                return false;
            }
        }

        let running = now.saturating_duration_since(job.started_at);
        match self.timeout {
            Some(limit) if running > limit => {
                if let Err(e) = job.handle.kill() {
                    tracing::warn!(error = %e, "failed to kill analysis job");
                }
                tracing::warn!(
                    subject = %job.subject_label,
                    running_secs = running.as_secs_f64(),
                    "analysis job timed out; killed"
                );
                self.job = None;
                false
            }
            _ => true,
        }
    }

    /// Consume the result file, if any, into `publisher`.
    ///
    /// The file is removed whether or not it parses, so a bad file can never
    /// block later results. A parse failure leaves the shared state untouched.
    pub fn drain_result(&mut self, publisher: &SharedStatePublisher) -> Result<DrainOutcome, DispatchError> {
        let path = &self.paths.result;
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(DrainOutcome::Empty),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "result file unreadable; discarding");
                remove_result(path);
                return Ok(DrainOutcome::Discarded { reason: e.to_string() });
            }
        };

        let result: AnalysisResult = match serde_json::from_str(&text) {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "result file unparseable; discarding");
                remove_result(path);
                return Ok(DrainOutcome::Discarded { reason: e.to_string() });
            }
        };

        let published = publisher.merge_and_publish(&result);
        remove_result(path);
        published?;

        let outcome = DrainOutcome::Published {
            ok: result.is_ok(),
            run_id: result.run_id().map(str::to_string),
        };
        match &result {
            AnalysisResult::Ok(report) => tracing::info!(
                run_id = ?report.run_id,
                concentration = %report.analysis.concentration,
                is_sleeping = report.analysis.is_sleeping,
                "analysis result published"
            ),
            AnalysisResult::Error(failure) => {
                tracing::warn!(run_id = ?failure.run_id, message = %failure.message, "analysis job reported an error")
            }
        }
        Ok(outcome)
    }
}

fn remove_result(path: &std::path::Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "failed to remove result file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FeatureSample;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    #[derive(Default)]
    struct JobState {
        exited: Cell<bool>,
        killed: Cell<bool>,
        status_error: Cell<bool>,
    }

    struct FakeHandle(Rc<JobState>);

    impl JobHandle for FakeHandle {
        fn id(&self) -> Option<u32> {
            None
        }
        fn has_exited(&mut self) -> io::Result<bool> {
            if self.0.status_error.get() {
                return Err(io::Error::new(io::ErrorKind::Other, "wait failed"));
            }
            Ok(self.0.exited.get())
        }
        fn kill(&mut self) -> io::Result<()> {
            self.0.killed.set(true);
            self.0.exited.set(true);
            Ok(())
        }
    }

    /// Records each launch; every job stays live until its state says otherwise.
    #[derive(Clone, Default)]
    struct FakeLauncher {
        jobs: Rc<RefCell<Vec<Rc<JobState>>>>,
    }

    impl JobLauncher for FakeLauncher {
        fn program(&self) -> &str {
            "fake"
        }
        fn launch(&mut self, _paths: &ExchangePaths) -> io::Result<Box<dyn JobHandle>> {
            let state = Rc::new(JobState::default());
            self.jobs.borrow_mut().push(state.clone());
            Ok(Box::new(FakeHandle(state)))
        }
    }

    fn full_window(n: usize) -> FeatureWindow {
        let mut w = FeatureWindow::new(n);
        for i in 0..n {
            w.append(FeatureSample {
                timestamp: i as f64,
                ear: 0.3,
                mar: 0.1,
                pitch: 0.0,
                yaw: 0.0,
                roll: 0.0,
            });
        }
        w
    }

    fn dispatcher(dir: &std::path::Path, launcher: FakeLauncher, timeout: Option<Duration>) -> AnalysisDispatcher {
        AnalysisDispatcher::new(
            ExchangePaths::in_dir(dir),
            Box::new(launcher),
            Duration::from_secs(5),
            timeout,
        )
    }

    #[test]
    fn test_waits_for_full_window() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = FakeLauncher::default();
        let mut d = dispatcher(dir.path(), launcher.clone(), None);
        let mut w = FeatureWindow::new(3);
        w.append(full_window(1).snapshot()[0].clone());

        let out = d.try_dispatch(&w, "alice", Instant::now()).unwrap();
        assert_eq!(out, DispatchOutcome::WindowFilling { len: 1, capacity: 3 });
        assert!(launcher.jobs.borrow().is_empty());
    }

    #[test]
    fn test_trigger_writes_ordered_request() {
        let dir = tempfile::tempdir().unwrap();
        let mut d = dispatcher(dir.path(), FakeLauncher::default(), None);
        let out = d.try_dispatch(&full_window(4), "alice", Instant::now()).unwrap();
        assert!(matches!(out, DispatchOutcome::Triggered { samples: 4, .. }));

        let text = fs::read_to_string(&d.paths().request).unwrap();
        let req: AnalysisRequest = serde_json::from_str(&text).unwrap();
        assert_eq!(req.subject_label, "alice");
        let times: Vec<f64> = req.time_series_data.iter().map(|s| s.timestamp).collect();
        assert_eq!(times, vec![0.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_refused_trigger_keeps_cooldown() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = FakeLauncher::default();
        let mut d = dispatcher(dir.path(), launcher.clone(), None);
        let w = full_window(2);
        let t0 = Instant::now();

        d.try_dispatch(&w, "alice", t0).unwrap();
        assert_eq!(d.last_trigger(), Some(t0));

        // Live job: refused, cooldown untouched.
        let out = d.try_dispatch(&w, "alice", t0 + Duration::from_secs(10)).unwrap();
        assert_eq!(out, DispatchOutcome::JobRunning);
        assert_eq!(d.last_trigger(), Some(t0));
        assert_eq!(launcher.jobs.borrow().len(), 1);

        // Job exits; a second trigger still waits out the cooldown.
        launcher.jobs.borrow()[0].exited.set(true);
        let out = d.try_dispatch(&w, "alice", t0 + Duration::from_secs(3)).unwrap();
        assert!(matches!(out, DispatchOutcome::CoolingDown { .. }));
        assert!(!d.has_live_job());

        let out = d.try_dispatch(&w, "alice", t0 + Duration::from_secs(6)).unwrap();
        assert!(matches!(out, DispatchOutcome::Triggered { .. }));
        assert_eq!(launcher.jobs.borrow().len(), 2);
    }

    #[test]
    fn test_watchdog_kills_hung_job() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = FakeLauncher::default();
        let mut d = dispatcher(dir.path(), launcher.clone(), Some(Duration::from_secs(20)));
        let w = full_window(2);
        let t0 = Instant::now();

        d.try_dispatch(&w, "alice", t0).unwrap();
        assert_eq!(
            d.try_dispatch(&w, "alice", t0 + Duration::from_secs(15)).unwrap(),
            DispatchOutcome::JobRunning
        );
        let out = d.try_dispatch(&w, "alice", t0 + Duration::from_secs(21)).unwrap();
        assert!(matches!(out, DispatchOutcome::Triggered { .. }));
        assert!(launcher.jobs.borrow()[0].killed.get());
    }

    #[test]
    fn test_status_error_kills_and_releases_job() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = FakeLauncher::default();
        let mut d = dispatcher(dir.path(), launcher.clone(), None);
        let w = full_window(2);
        let t0 = Instant::now();

        d.try_dispatch(&w, "alice", t0).unwrap();
        launcher.jobs.borrow()[0].status_error.set(true);
        let out = d.try_dispatch(&w, "alice", t0 + Duration::from_secs(6)).unwrap();
        assert!(matches!(out, DispatchOutcome::Triggered { .. }));
        assert!(launcher.jobs.borrow()[0].killed.get());
        assert_eq!(launcher.jobs.borrow().len(), 2);
    }

    #[test]
    fn test_hung_job_blocks_without_watchdog() {
        let dir = tempfile::tempdir().unwrap();
        let mut d = dispatcher(dir.path(), FakeLauncher::default(), None);
        let w = full_window(2);
        let t0 = Instant::now();
        d.try_dispatch(&w, "alice", t0).unwrap();
        let out = d.try_dispatch(&w, "alice", t0 + Duration::from_secs(3600)).unwrap();
        assert_eq!(out, DispatchOutcome::JobRunning);
    }

    #[test]
    fn test_drain_invalid_result_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let mut d = dispatcher(dir.path(), FakeLauncher::default(), None);
        let state_path = dir.path().join("state.json");
        fs::write(&state_path, r#"{"analysis":{"status":"ok"}}"#).unwrap();
        let publisher = SharedStatePublisher::new(&state_path);

        fs::write(&d.paths().result, "{\"status\": \"ok\", ").unwrap();
        let out = d.drain_result(&publisher).unwrap();
        assert!(matches!(out, DrainOutcome::Discarded { .. }));
        assert!(!d.paths().result.exists());
        assert_eq!(fs::read_to_string(&state_path).unwrap(), r#"{"analysis":{"status":"ok"}}"#);

        assert_eq!(d.drain_result(&publisher).unwrap(), DrainOutcome::Empty);
    }

    #[test]
    fn test_drain_publishes_and_removes() {
        let dir = tempfile::tempdir().unwrap();
        let mut d = dispatcher(dir.path(), FakeLauncher::default(), None);
        let publisher = SharedStatePublisher::new(dir.path().join("state.json"));

        fs::write(
            &d.paths().result,
            r#"{"status":"ok","run_id":"abc","analysis":{"concentration":"zone"}}"#,
        )
        .unwrap();
        let out = d.drain_result(&publisher).unwrap();
        assert_eq!(
            out,
            DrainOutcome::Published {
                ok: true,
                run_id: Some("abc".into())
            }
        );
        assert!(!d.paths().result.exists());
        assert_eq!(publisher.read()["analysis"]["analysis"]["concentration"], "zone");
    }
}
