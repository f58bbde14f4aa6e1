//! Behavioral summary of one feature window.

use chrono::{DateTime, Utc};
use vigil_core::protocol::{AnalysisReport, AnalysisRequest, AnalysisSummary, Concentration, InputSummary, SeriesMetrics};
use vigil_core::types::FeatureSample;

/// Cut-offs for reading a series.
#[derive(Debug, Clone)]
pub struct AnalysisParams {
    /// EAR below this counts as eyes closed.
    pub ear_closed: f32,
    /// MAR above this counts as a yawn.
    pub mar_open: f32,
    /// |yaw| above this counts as looking away.
    pub yaw_away: f32,
    /// Closed runs up to this many samples are blinks; longer runs are not.
    pub blink_max_samples: usize,
    /// Eyes-closed ratio at or above which the subject is considered asleep.
    pub sleep_closed_ratio: f32,
}

impl Default for AnalysisParams {
    fn default() -> Self {
        Self {
            ear_closed: 0.20,
            mar_open: 0.5,
            yaw_away: 15.0,
            blink_max_samples: 3,
            sleep_closed_ratio: 0.7,
        }
    }
}

/// Blinks per minute above which focus is not "zone" level.
const ZONE_MAX_BLINKS_PER_MIN: f32 = 12.0;

pub fn analyze(request: &AnalysisRequest, params: &AnalysisParams, run_id: String, now: DateTime<Utc>) -> AnalysisReport {
    AnalysisReport {
        run_id: Some(run_id),
        processed_at: Some(now),
        analysis: summarize(&request.time_series_data, params),
        input_summary: Some(input_summary(request)),
        remote_run_id: None,
    }
}

/// Subject and latest EAR/MAR of the request, attached to every report.
pub fn input_summary(request: &AnalysisRequest) -> InputSummary {
    let latest = request.time_series_data.last();
    InputSummary {
        subject_label: request.subject_label.clone(),
        latest_ear: latest.map(|s| s.ear),
        latest_mar: latest.map(|s| s.mar),
    }
}

pub fn summarize(samples: &[FeatureSample], params: &AnalysisParams) -> AnalysisSummary {
    let Some(metrics) = metrics(samples, params) else {
        return AnalysisSummary::default();
    };

    let is_sleeping = metrics.eyes_closed_ratio >= params.sleep_closed_ratio;
    let concentration = if is_sleeping {
        Concentration::Low
    } else {
        concentration(samples, &metrics, params)
    };

    AnalysisSummary {
        is_sleeping,
        concentration,
        metrics: Some(metrics),
    }
}

fn metrics(samples: &[FeatureSample], params: &AnalysisParams) -> Option<SeriesMetrics> {
    let (first, last) = (samples.first()?, samples.last()?);
    let n = samples.len() as f32;

    let mean = |f: fn(&FeatureSample) -> f32| samples.iter().map(f).sum::<f32>() / n;
    let ratio = |pred: &dyn Fn(&FeatureSample) -> bool| samples.iter().filter(|s| pred(s)).count() as f32 / n;

    Some(SeriesMetrics {
        samples: samples.len(),
        duration_secs: (last.timestamp - first.timestamp).max(0.0),
        mean_ear: mean(|s| s.ear),
        mean_mar: mean(|s| s.mar),
        eyes_closed_ratio: ratio(&|s: &FeatureSample| s.ear < params.ear_closed),
        blinks: count_blinks(samples, params),
        yawn_ratio: ratio(&|s: &FeatureSample| s.mar > params.mar_open),
        mean_abs_yaw: mean(|s| s.yaw.abs()),
    })
}

/// Closed-eye runs short enough to be blinks. A run still open at the end of
/// the series is not counted.
fn count_blinks(samples: &[FeatureSample], params: &AnalysisParams) -> u32 {
    let mut blinks = 0;
    let mut run = 0usize;
    for s in samples {
        if s.ear < params.ear_closed {
            run += 1;
        } else {
            if run > 0 && run <= params.blink_max_samples {
                blinks += 1;
            }
            run = 0;
        }
    }
    blinks
}

fn concentration(samples: &[FeatureSample], m: &SeriesMetrics, params: &AnalysisParams) -> Concentration {
    let n = samples.len() as f32;
    let facing = samples.iter().filter(|s| s.yaw.abs() <= params.yaw_away).count() as f32 / n;
    let score = facing * (1.0 - m.eyes_closed_ratio) * (1.0 - m.yawn_ratio);

    let blink_rate = if m.duration_secs > 0.0 {
        m.blinks as f32 * 60.0 / m.duration_secs as f32
    } else {
        0.0
    };

    if score >= 0.9 && blink_rate <= ZONE_MAX_BLINKS_PER_MIN {
        Concentration::Zone
    } else if score >= 0.7 {
        Concentration::High
    } else if score >= 0.4 {
        Concentration::Medium
    } else {
        Concentration::Low
    }
}
