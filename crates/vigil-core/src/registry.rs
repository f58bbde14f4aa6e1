//! Identity registry: reference embeddings, nearest-identity matching and
//! runtime registration of persistent unknown faces.

use crate::frame::Frame;
use crate::preprocess::FacePreprocessor;
use crate::store::{generated_sequence, IdentityStore, StoreError, UNKNOWN_PREFIX};
use crate::types::{BoundingBox, Embedding, FaceMeasurements};
use crate::vision::{EmbeddingExtractor, LandmarkEstimator, VisionError};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Label given to a face that matched no identity and was not registered.
pub const UNKNOWN_LABEL: &str = "Unknown";

/// Anonymous labels (plain unknown or generated) never trigger a greeting.
pub fn is_anonymous(label: &str) -> bool {
    label.starts_with(UNKNOWN_LABEL)
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("identity already registered: {0}")]
    Duplicate(String),
    #[error("store: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityOrigin {
    /// Built from reference images at startup or by an operator.
    Enrolled,
    /// Registered at runtime from an unmatched face.
    Generated,
}

#[derive(Debug, Clone)]
pub struct Identity {
    pub name: String,
    pub reference: Embedding,
    pub origin: IdentityOrigin,
}

/// Outcome of matching one embedding against the registry.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    /// Matched identity name, `None` if nothing was under the threshold.
    pub identity: Option<String>,
    /// Distance to the nearest reference (`+inf` for an empty registry).
    pub distance: f32,
}

impl MatchResult {
    pub fn label(&self) -> &str {
        self.identity.as_deref().unwrap_or(UNKNOWN_LABEL)
    }
}

#[derive(Debug, Clone)]
pub struct RegistrySettings {
    /// A candidate matches when its nearest distance is strictly below this.
    pub match_threshold: f32,
    /// Minimum spacing between two runtime registrations.
    pub unknown_cooldown: Duration,
    /// Pixels of context kept around a face when persisting it.
    pub crop_padding: u32,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            match_threshold: 0.4,
            unknown_cooldown: Duration::from_secs(5),
            crop_padding: 20,
        }
    }
}

pub struct IdentityRegistry {
    identities: Vec<Identity>,
    store: IdentityStore,
    settings: RegistrySettings,
    preprocessor: FacePreprocessor,
    /// Next sequence number for a generated name; never decreases.
    next_sequence: u32,
    last_registration: Option<Instant>,
}

impl IdentityRegistry {
    /// Create an empty registry, seeding the generated-name counter from the store.
    pub fn new(
        store: IdentityStore,
        settings: RegistrySettings,
        preprocessor: FacePreprocessor,
    ) -> Result<Self, RegistryError> {
        let next_sequence = store.max_generated_sequence()? + 1;
        tracing::info!(
            root = %store.root().display(),
            next = %format!("{UNKNOWN_PREFIX}{next_sequence}"),
            "identity registry ready"
        );
        Ok(Self {
            identities: Vec::new(),
            store,
            settings,
            preprocessor,
            next_sequence,
            last_registration: None,
        })
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    pub fn identities(&self) -> &[Identity] {
        &self.identities
    }

    pub fn contains(&self, name: &str) -> bool {
        self.identities.iter().any(|i| i.name == name)
    }

    pub fn next_sequence(&self) -> u32 {
        self.next_sequence
    }

    pub fn store(&self) -> &IdentityStore {
        &self.store
    }

    /// Add an identity with a ready-made reference embedding.
    pub fn insert(&mut self, name: &str, reference: Embedding, origin: IdentityOrigin) -> Result<(), RegistryError> {
        if self.contains(name) {
            return Err(RegistryError::Duplicate(name.to_string()));
        }
        self.identities.push(Identity {
            name: name.to_string(),
            reference,
            origin,
        });
        Ok(())
    }

    /// Preprocess `face` and extract its embedding.
    ///
    /// Eye landmarks in `measurements`, when present, drive the alignment step.
    pub fn embed_face(
        &self,
        frame: &Frame,
        face: &BoundingBox,
        measurements: Option<&FaceMeasurements>,
        embedder: &mut dyn EmbeddingExtractor,
    ) -> Result<Embedding, VisionError> {
        let eyes = measurements.and_then(FaceMeasurements::eye_centers);
        let prepared = self
            .preprocessor
            .prepare(frame, face, eyes)
            .ok_or(VisionError::EmptyRegion)?;
        embedder.embed(&prepared, &BoundingBox::full(prepared.width, prepared.height))
    }

    /// Enroll `name` from reference images, averaging every embedding that
    /// could be extracted. Each image is treated as one whole face.
    ///
    /// Returns how many images contributed. Zero means nothing was registered.
    pub fn enroll(
        &mut self,
        name: &str,
        images: &[Frame],
        mut landmarks: Option<&mut dyn LandmarkEstimator>,
        embedder: &mut dyn EmbeddingExtractor,
    ) -> Result<usize, RegistryError> {
        if self.contains(name) {
            return Err(RegistryError::Duplicate(name.to_string()));
        }

        let mut embeddings = Vec::with_capacity(images.len());
        for (i, image) in images.iter().enumerate() {
            let whole = BoundingBox::full(image.width, image.height);
            let measurements = match landmarks.as_deref_mut() {
                Some(estimator) => estimator.analyze(image, &whole).ok(),
                None => None,
            };
            match self.embed_face(image, &whole, measurements.as_ref(), embedder) {
                Ok(e) => embeddings.push(e),
                Err(e) => tracing::warn!(name, image = i, error = %e, "skipping enrollment image"),
            }
        }

        let Some(reference) = Embedding::mean(&embeddings) else {
            tracing::warn!(name, images = images.len(), "no usable enrollment images; identity not registered");
            return Ok(0);
        };

        let origin = if generated_sequence(name).is_some() {
            IdentityOrigin::Generated
        } else {
            IdentityOrigin::Enrolled
        };
        self.insert(name, reference, origin)?;
        tracing::info!(name, images = embeddings.len(), "identity enrolled");
        Ok(embeddings.len())
    }

    /// Enroll every identity directory in the store. Unreadable images are skipped.
    ///
    /// Returns the number of identities registered.
    pub fn load_store(
        &mut self,
        mut landmarks: Option<&mut dyn LandmarkEstimator>,
        embedder: &mut dyn EmbeddingExtractor,
    ) -> Result<usize, RegistryError> {
        let mut registered = 0;
        for stored in self.store.scan()? {
            if stored.images.is_empty() {
                tracing::info!(name = %stored.name, "identity directory has no images");
                continue;
            }

            let frames: Vec<Frame> = stored
                .images
                .iter()
                .filter_map(|path| match Frame::from_path(path) {
                    Ok(f) => Some(f),
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "unreadable reference image");
                        None
                    }
                })
                .collect();

            match self.enroll(&stored.name, &frames, reborrow(&mut landmarks), embedder) {
                Ok(0) => {}
                Ok(_) => registered += 1,
                Err(RegistryError::Duplicate(name)) => {
                    tracing::warn!(name, "identity already registered; skipping store entry")
                }
                Err(e) => return Err(e),
            }
        }

        if self.is_empty() {
            tracing::warn!("no identities registered; every face will be unknown");
        }
        Ok(registered)
    }

    /// Find the nearest identity by Euclidean distance.
    ///
    /// Iterates in registration order and only replaces the best on a strictly
    /// smaller distance, so the earliest identity wins exact ties.
    pub fn match_embedding(&self, candidate: &Embedding) -> MatchResult {
        let mut best: Option<(usize, f32)> = None;
        for (i, identity) in self.identities.iter().enumerate() {
            let d = candidate.euclidean_distance(&identity.reference);
            if best.map_or(true, |(_, bd)| d < bd) {
                best = Some((i, d));
            }
        }

        match best {
            Some((i, d)) if d < self.settings.match_threshold => MatchResult {
                identity: Some(self.identities[i].name.clone()),
                distance: d,
            },
            Some((_, d)) => MatchResult {
                identity: None,
                distance: d,
            },
            None => MatchResult {
                identity: None,
                distance: f32::INFINITY,
            },
        }
    }

    /// Register an unmatched face under the next generated name.
    ///
    /// Returns `Ok(None)` while the global cooldown is running. On any
    /// persistence failure the registry and counter are left untouched.
    pub fn register_unknown(
        &mut self,
        embedding: &Embedding,
        frame: &Frame,
        face: &BoundingBox,
        now: Instant,
    ) -> Result<Option<String>, RegistryError> {
        if let Some(last) = self.last_registration {
            if now.saturating_duration_since(last) <= self.settings.unknown_cooldown {
                return Ok(None);
            }
        }

        let name = format!("{UNKNOWN_PREFIX}{}", self.next_sequence);
        if self.contains(&name) {
            return Err(RegistryError::Duplicate(name));
        }
        let crop = frame
            .crop(face, self.settings.crop_padding)
            .ok_or(StoreError::EmptyCrop)?;
        let path = self.store.save_face(&name, &crop)?;

        self.identities.push(Identity {
            name: name.clone(),
            reference: embedding.clone(),
            origin: IdentityOrigin::Generated,
        });
        self.next_sequence += 1;
        self.last_registration = Some(now);

        tracing::info!(name = %name, path = %path.display(), "registered new identity");
        Ok(Some(name))
    }
}

fn reborrow<'a>(
    estimator: &'a mut Option<&mut dyn LandmarkEstimator>,
) -> Option<&'a mut dyn LandmarkEstimator> {
    match estimator {
        Some(e) => Some(&mut **e),
        None => None,
    }
}
