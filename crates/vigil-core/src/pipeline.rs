//! Perception stage controller.
//!
//! ```text
//! SearchingSubject --body--> SearchingFace --faces identified--> TrackingFace
//!        ^                        |                                   |
//!        +------ no body ---------+                                   |
//!        +------------------- all trackers lost ----------------------+
//! ```
//!
//! Full identification (detection + embedding) runs once per approach;
//! the following frames are served by correlation trackers.

use crate::config::VigilConfig;
use crate::dispatch::{AnalysisDispatcher, DispatchOutcome, DrainOutcome, ProcessLauncher};
use crate::frame::{Frame, FrameSource, StreamError};
use crate::registry::{is_anonymous, IdentityRegistry, RegistryError, UNKNOWN_LABEL};
use crate::state::SharedStatePublisher;
use crate::store::IdentityStore;
use crate::tracker::{TrackerId, TrackerManager};
use crate::types::{BoundingBox, FaceMeasurements, FeatureSample};
use crate::vision::{LandmarkEstimator, TrackerFactory, Vision, VisionError};
use crate::window::FeatureWindow;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("frame stream failed: {0}")]
    Stream(#[from] StreamError),
    #[error("identity registry: {0}")]
    Registry(#[from] RegistryError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    SearchingSubject,
    SearchingFace,
    TrackingFace,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Stage::SearchingSubject => "searching_subject",
            Stage::SearchingFace => "searching_face",
            Stage::TrackingFace => "tracking_face",
        })
    }
}

/// Waiting hint for an overlay renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Indicator {
    SearchingPerson,
    ComeCloser,
}

impl Indicator {
    pub fn text(&self) -> &'static str {
        match self {
            Indicator::SearchingPerson => "Searching for person...",
            Indicator::ComeCloser => "Person found. Come closer...",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EyeState {
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MouthState {
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Facing {
    Front,
    Left,
    Right,
}

/// Cut-offs used to read measurements as eye, mouth and head states.
#[derive(Debug, Clone, Copy)]
pub struct ObservationThresholds {
    pub ear_closed: f32,
    pub mar_open: f32,
    pub yaw_facing: f32,
}

impl Default for ObservationThresholds {
    fn default() -> Self {
        Self {
            ear_closed: 0.20,
            mar_open: 0.5,
            yaw_facing: 15.0,
        }
    }
}

impl ObservationThresholds {
    pub fn eyes(&self, ear: f32) -> EyeState {
        if ear < self.ear_closed {
            EyeState::Closed
        } else {
            EyeState::Open
        }
    }

    pub fn mouth(&self, mar: f32) -> MouthState {
        if mar > self.mar_open {
            MouthState::Open
        } else {
            MouthState::Closed
        }
    }

    /// Positive yaw is the subject's head turned right.
    pub fn facing(&self, yaw: f32) -> Facing {
        if yaw > self.yaw_facing {
            Facing::Right
        } else if yaw < -self.yaw_facing {
            Facing::Left
        } else {
            Facing::Front
        }
    }
}

/// One labeled face measured in one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub tracker: TrackerId,
    pub label: String,
    pub bbox: BoundingBox,
    pub measurements: FaceMeasurements,
    pub eyes: EyeState,
    pub mouth: MouthState,
    pub facing: Facing,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    StageChanged { from: Stage, to: Stage },
    Identified { tracker: TrackerId, label: String, distance: f32 },
    Registered { name: String },
    /// First identification of a named subject in this run.
    Greeted { name: String, measurements: FaceMeasurements },
    TrackersLost { count: usize },
    /// Tracker dropped because its face could not be analyzed.
    TrackerEvicted { tracker: TrackerId, label: String },
}

/// Everything that happened while processing one frame.
#[derive(Debug, Clone)]
pub struct FrameReport {
    pub sequence: u64,
    /// Stage after this frame.
    pub stage: Stage,
    pub indicator: Option<Indicator>,
    pub observations: Vec<Observation>,
    pub events: Vec<PipelineEvent>,
    pub dispatch: Option<DispatchOutcome>,
    pub drain: Option<DrainOutcome>,
}

impl FrameReport {
    fn new(sequence: u64, stage: Stage) -> Self {
        Self {
            sequence,
            stage,
            indicator: None,
            observations: Vec::new(),
            events: Vec::new(),
            dispatch: None,
            drain: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub frames: u64,
    pub final_stage: Stage,
    pub jobs_triggered: u64,
    pub results_published: u64,
    pub results_discarded: u64,
}

pub struct Pipeline {
    stage: Stage,
    vision: Vision,
    registry: IdentityRegistry,
    trackers: TrackerManager,
    window: FeatureWindow,
    dispatcher: AnalysisDispatcher,
    publisher: SharedStatePublisher,
    thresholds: ObservationThresholds,
    greeted: HashSet<String>,
}

impl Pipeline {
    pub fn new(
        vision: Vision,
        registry: IdentityRegistry,
        trackers: TrackerManager,
        window: FeatureWindow,
        dispatcher: AnalysisDispatcher,
        publisher: SharedStatePublisher,
        thresholds: ObservationThresholds,
    ) -> Self {
        Self {
            stage: Stage::SearchingSubject,
            vision,
            registry,
            trackers,
            window,
            dispatcher,
            publisher,
            thresholds,
            greeted: HashSet::new(),
        }
    }

    /// Assemble a pipeline from configuration and enroll the identity store.
    pub fn from_config(
        config: &VigilConfig,
        mut vision: Vision,
        tracker_factory: Box<dyn TrackerFactory>,
    ) -> Result<Self, PipelineError> {
        let mut registry = IdentityRegistry::new(
            IdentityStore::new(config.store_dir()),
            config.registry_settings(),
            config.preprocessor(),
        )?;
        let landmarks: &mut dyn LandmarkEstimator = vision.landmarks.as_mut();
        let enrolled = registry.load_store(Some(landmarks), vision.embedder.as_mut())?;
        tracing::info!(identities = enrolled, "identity store loaded");

        let dispatcher = AnalysisDispatcher::new(
            config.exchange_paths(),
            Box::new(ProcessLauncher::new(
                config.analyzer_program.clone(),
                config.analyzer_args.clone(),
            )),
            config.analysis_cooldown(),
            config.analysis_timeout(),
        );

        Ok(Self::new(
            vision,
            registry,
            TrackerManager::new(tracker_factory, config.tracker_confidence_floor),
            FeatureWindow::new(config.window_capacity),
            dispatcher,
            SharedStatePublisher::new(config.state_path()),
            ObservationThresholds {
                ear_closed: config.ear_closed_threshold,
                mar_open: config.mar_open_threshold,
                yaw_facing: config.yaw_facing_threshold,
            },
        ))
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn registry(&self) -> &IdentityRegistry {
        &self.registry
    }

    pub fn trackers(&self) -> &TrackerManager {
        &self.trackers
    }

    pub fn window(&self) -> &FeatureWindow {
        &self.window
    }

    pub fn dispatcher(&self) -> &AnalysisDispatcher {
        &self.dispatcher
    }

    /// Process one frame. Per-face and per-file failures are logged and
    /// never escape.
    pub fn step(&mut self, frame: &Frame) -> FrameReport {
        let mut report = FrameReport::new(frame.sequence, self.stage);

        match self.stage {
            Stage::SearchingSubject => self.search_subject(frame, &mut report),
            Stage::SearchingFace => self.search_face(frame, &mut report),
            Stage::TrackingFace => self.track(frame, &mut report),
        }

        match self.dispatcher.drain_result(&self.publisher) {
            Ok(DrainOutcome::Empty) => {}
            Ok(outcome) => report.drain = Some(outcome),
            Err(e) => tracing::warn!(error = %e, "failed to publish analysis result"),
        }

        debug_assert!(self.stage != Stage::TrackingFace || !self.trackers.is_empty());
        debug_assert!(self.stage != Stage::SearchingSubject || self.trackers.is_empty());
        debug_assert!(self.window.len() <= self.window.capacity());

        report.stage = self.stage;
        report
    }

    /// Drive the pipeline until the source ends or `stop` is raised.
    pub fn run(&mut self, source: &mut dyn FrameSource, stop: &AtomicBool) -> Result<RunSummary, PipelineError> {
        self.run_with(source, stop, |_| {})
    }

    /// Like [`Pipeline::run`], handing every frame report to `on_report`.
    pub fn run_with<F>(
        &mut self,
        source: &mut dyn FrameSource,
        stop: &AtomicBool,
        mut on_report: F,
    ) -> Result<RunSummary, PipelineError>
    where
        F: FnMut(&FrameReport),
    {
        let mut summary = RunSummary {
            frames: 0,
            final_stage: self.stage,
            jobs_triggered: 0,
            results_published: 0,
            results_discarded: 0,
        };

        while !stop.load(Ordering::Relaxed) {
            let frame = match source.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    tracing::info!(frames = summary.frames, "frame stream ended");
                    break;
                }
                Err(e) => {
                    tracing::error!(error = %e, frames = summary.frames, "frame stream failed");
                    return Err(e.into());
                }
            };

            let report = self.step(&frame);
            summary.frames += 1;
            if matches!(report.dispatch, Some(DispatchOutcome::Triggered { .. })) {
                summary.jobs_triggered += 1;
            }
            match report.drain {
                Some(DrainOutcome::Published { .. }) => summary.results_published += 1,
                Some(DrainOutcome::Discarded { .. }) => summary.results_discarded += 1,
                _ => {}
            }
            on_report(&report);
        }

        summary.final_stage = self.stage;
        Ok(summary)
    }

    fn transition(&mut self, to: Stage, report: &mut FrameReport) {
        let from = self.stage;
        if from == to {
            return;
        }
        if to == Stage::SearchingSubject {
            self.trackers.reset();
        }
        tracing::info!(from = %from, to = %to, "stage changed");
        self.stage = to;
        report.events.push(PipelineEvent::StageChanged { from, to });
    }

    fn subject_present(&mut self, frame: &Frame) -> bool {
        match self.vision.body.detect(frame) {
            Ok(present) => present,
            Err(e) => {
                tracing::warn!(frame = frame.sequence, error = %e, "body detection failed");
                false
            }
        }
    }

    fn search_subject(&mut self, frame: &Frame, report: &mut FrameReport) {
        if self.subject_present(frame) {
            self.transition(Stage::SearchingFace, report);
        } else {
            report.indicator = Some(Indicator::SearchingPerson);
        }
    }

    fn search_face(&mut self, frame: &Frame, report: &mut FrameReport) {
        if self.identify(frame, report) > 0 {
            self.transition(Stage::TrackingFace, report);
        } else if !self.subject_present(frame) {
            self.transition(Stage::SearchingSubject, report);
        } else {
            report.indicator = Some(Indicator::ComeCloser);
        }
    }

    /// Full identification pass. Replaces every tracker with one per
    /// identified face and returns how many were started.
    fn identify(&mut self, frame: &Frame, report: &mut FrameReport) -> usize {
        self.trackers.reset();

        let faces = match self.vision.faces.detect(frame) {
            Ok(faces) => faces,
            Err(e) => {
                tracing::warn!(frame = frame.sequence, error = %e, "face detection failed");
                return 0;
            }
        };

        let mut started = 0;
        for bbox in faces {
            let measurements = match self.vision.landmarks.analyze(frame, &bbox) {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!(frame = frame.sequence, error = %e, "face analysis failed; skipping face");
                    continue;
                }
            };
            let embedding =
                match self
                    .registry
                    .embed_face(frame, &bbox, Some(&measurements), self.vision.embedder.as_mut())
                {
                    Ok(e) => e,
                    Err(e) => {
                        tracing::warn!(frame = frame.sequence, error = %e, "embedding failed; skipping face");
                        continue;
                    }
                };

            let matched = self.registry.match_embedding(&embedding);
            let label = match matched.identity {
                Some(name) => name,
                None => match self.registry.register_unknown(&embedding, frame, &bbox, frame.timestamp) {
                    Ok(Some(name)) => {
                        report.events.push(PipelineEvent::Registered { name: name.clone() });
                        name
                    }
                    Ok(None) => UNKNOWN_LABEL.to_string(),
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to register unknown face");
                        UNKNOWN_LABEL.to_string()
                    }
                },
            };

            let tracker = self.trackers.start(frame, &bbox, &label);
            started += 1;
            tracing::info!(label = %label, distance = matched.distance, tracker = %tracker, "face identified");
            report.events.push(PipelineEvent::Identified {
                tracker,
                label: label.clone(),
                distance: matched.distance,
            });

            if !is_anonymous(&label) && self.greeted.insert(label.clone()) {
                tracing::info!(
                    name = %label,
                    ear = measurements.ear,
                    mar = measurements.mar,
                    pitch = measurements.pitch,
                    yaw = measurements.yaw,
                    roll = measurements.roll,
                    "hello"
                );
                report.events.push(PipelineEvent::Greeted {
                    name: label.clone(),
                    measurements: measurements.clone(),
                });
            }

            report.observations.push(self.observe(tracker, label, bbox, measurements));
        }
        started
    }

    /// Tracking pass: follow existing faces, measure them and feed the
    /// primary subject's window.
    fn track(&mut self, frame: &Frame, report: &mut FrameReport) {
        let before = self.trackers.len();
        let live = self.trackers.advance(frame);
        if live.len() < before {
            report.events.push(PipelineEvent::TrackersLost {
                count: before - live.len(),
            });
        }

        let mut primary: Option<(String, FeatureSample)> = None;
        for face in live {
            let analyzed = self
                .vision
                .landmarks
                .analyze(frame, &face.bbox)
                .and_then(|m| if m.is_finite() { Ok(m) } else { Err(VisionError::NonFinite) });
            match analyzed {
                Ok(m) => {
                    if primary.is_none() {
                        primary = Some((face.label.clone(), FeatureSample::from_measurements(frame.epoch_seconds(), &m)));
                    }
                    let obs = self.observe(face.id, face.label, face.bbox, m);
                    tracing::debug!(
                        label = %obs.label,
                        ear = obs.measurements.ear,
                        mar = obs.measurements.mar,
                        yaw = obs.measurements.yaw,
                        eyes = ?obs.eyes,
                        mouth = ?obs.mouth,
                        facing = ?obs.facing,
                        "observation"
                    );
                    report.observations.push(obs);
                }
                Err(e) => {
                    tracing::warn!(tracker = %face.id, label = %face.label, error = %e, "face analysis failed; dropping tracker");
                    self.trackers.evict(face.id);
                    report.events.push(PipelineEvent::TrackerEvicted {
                        tracker: face.id,
                        label: face.label,
                    });
                }
            }
        }

        if let Some((label, sample)) = primary {
            self.window.append_for(&label, sample);
        }

        if self.trackers.is_empty() {
            self.transition(Stage::SearchingSubject, report);
            return;
        }

        let Some(subject) = self.window.subject().map(str::to_string) else {
            return;
        };
        match self.dispatcher.try_dispatch(&self.window, &subject, frame.timestamp) {
            Ok(outcome) => {
                if let DispatchOutcome::WindowFilling { len, capacity } = outcome {
                    tracing::debug!(len, capacity, "collecting features");
                }
                report.dispatch = Some(outcome);
            }
            Err(e) => tracing::warn!(error = %e, "failed to start analysis job"),
        }
    }

    fn observe(&self, tracker: TrackerId, label: String, bbox: BoundingBox, measurements: FaceMeasurements) -> Observation {
        Observation {
            tracker,
            eyes: self.thresholds.eyes(measurements.ear),
            mouth: self.thresholds.mouth(measurements.mar),
            facing: self.thresholds.facing(measurements.yaw),
            label,
            bbox,
            measurements,
        }
    }
}
