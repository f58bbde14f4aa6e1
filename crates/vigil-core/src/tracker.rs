//! Tracker manager: owns the live correlation trackers and their labels.

use crate::frame::Frame;
use crate::types::BoundingBox;
use crate::vision::{CorrelationTracker, TrackerFactory};

/// Stable id assigned to a tracker when it is started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackerId(pub u64);

impl std::fmt::Display for TrackerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Snapshot of one live tracked face after an advance.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedFace {
    pub id: TrackerId,
    pub bbox: BoundingBox,
    pub label: String,
    pub last_confidence: f32,
}

/// A tracker and the label it was bound to at creation, kept in one record.
struct Entry {
    id: TrackerId,
    label: String,
    tracker: Box<dyn CorrelationTracker>,
    bbox: BoundingBox,
    last_confidence: f32,
}

pub struct TrackerManager {
    factory: Box<dyn TrackerFactory>,
    entries: Vec<Entry>,
    next_id: u64,
    /// Trackers reporting a confidence below this are dropped.
    confidence_floor: f32,
}

impl TrackerManager {
    pub fn new(factory: Box<dyn TrackerFactory>, confidence_floor: f32) -> Self {
        Self {
            factory,
            entries: Vec::new(),
            next_id: 0,
            confidence_floor,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn confidence_floor(&self) -> f32 {
        self.confidence_floor
    }

    /// Start following `bbox` under `label`. The label is fixed for the tracker's lifetime.
    pub fn start(&mut self, frame: &Frame, bbox: &BoundingBox, label: &str) -> TrackerId {
        let mut tracker = self.factory.create();
        tracker.start(frame, bbox);

        let id = TrackerId(self.next_id);
        self.next_id += 1;
        self.entries.push(Entry {
            id,
            label: label.to_string(),
            tracker,
            bbox: *bbox,
            last_confidence: f32::INFINITY,
        });
        tracing::debug!(tracker = %id, label, "tracker started");
        id
    }

    /// Update every tracker against `frame`, evicting those below the floor.
    ///
    /// Survivors are returned in start order.
    pub fn advance(&mut self, frame: &Frame) -> Vec<TrackedFace> {
        let floor = self.confidence_floor;
        let mut live = Vec::with_capacity(self.entries.len());

        self.entries.retain_mut(|entry| {
            let confidence = entry.tracker.update(frame);
            if confidence.is_nan() || confidence < floor {
                tracing::info!(
                    tracker = %entry.id,
                    label = %entry.label,
                    confidence,
                    floor,
                    "tracker lost"
                );
                return false;
            }
            entry.bbox = entry.tracker.position();
            entry.last_confidence = confidence;
            live.push(TrackedFace {
                id: entry.id,
                bbox: entry.bbox,
                label: entry.label.clone(),
                last_confidence: confidence,
            });
            true
        });

        live
    }

    /// Drop one tracker, e.g. after its face failed landmark analysis.
    pub fn evict(&mut self, id: TrackerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != id);
        let removed = self.entries.len() != before;
        if removed {
            tracing::info!(tracker = %id, "tracker evicted");
        }
        removed
    }

    pub fn reset(&mut self) {
        if !self.entries.is_empty() {
            tracing::debug!(count = self.entries.len(), "trackers reset");
        }
        self.entries.clear();
    }

    pub fn label_of(&self, id: TrackerId) -> Option<&str> {
        self.entries.iter().find(|e| e.id == id).map(|e| e.label.as_str())
    }

    /// Current snapshots without advancing.
    pub fn faces(&self) -> Vec<TrackedFace> {
        self.entries
            .iter()
            .map(|e| TrackedFace {
                id: e.id,
                bbox: e.bbox,
                label: e.label.clone(),
                last_confidence: e.last_confidence,
            })
            .collect()
    }
}
