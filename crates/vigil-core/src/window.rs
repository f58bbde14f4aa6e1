//! Fixed-capacity FIFO of feature samples for the primary tracked subject.

use crate::types::FeatureSample;
use std::collections::VecDeque;

#[derive(Debug, Clone)]
pub struct FeatureWindow {
    samples: VecDeque<FeatureSample>,
    capacity: usize,
    subject: Option<String>,
}

impl FeatureWindow {
    /// A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            subject: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.samples.len() == self.capacity
    }

    /// Label of the subject the current samples belong to.
    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    /// Append a sample, evicting the oldest when at capacity.
    pub fn append(&mut self, sample: FeatureSample) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    /// Append a sample for `subject`. A different subject than the one the
    /// window holds starts a fresh series.
    pub fn append_for(&mut self, subject: &str, sample: FeatureSample) {
        if self.subject.as_deref() != Some(subject) {
            if !self.samples.is_empty() {
                tracing::debug!(
                    from = self.subject.as_deref().unwrap_or(""),
                    to = subject,
                    dropped = self.samples.len(),
                    "feature window subject changed"
                );
            }
            self.samples.clear();
            self.subject = Some(subject.to_string());
        }
        self.append(sample);
    }

    /// Samples oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &FeatureSample> {
        self.samples.iter()
    }

    /// Owned copy of the samples, oldest first.
    pub fn snapshot(&self) -> Vec<FeatureSample> {
        self.samples.iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
        self.subject = None;
    }
}
