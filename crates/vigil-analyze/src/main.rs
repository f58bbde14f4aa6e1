use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use vigil_core::protocol::{write_json_atomic, AnalysisFailure, AnalysisReport, AnalysisRequest, AnalysisResult};

mod analysis;
mod remote;

use analysis::AnalysisParams;
use remote::{RemoteAnalyzer, RemoteConfig};

#[derive(Parser, Debug)]
#[command(name = "vigil-analyze", about = "Summarize a feature window into an analysis result")]
struct Cli {
    /// Request file written by the perception loop
    #[arg(long)]
    request: PathBuf,
    /// Where to write the result file
    #[arg(long)]
    result: PathBuf,
    /// EAR below this counts as eyes closed
    #[arg(long, default_value_t = 0.20)]
    ear_threshold: f32,
    /// MAR above this counts as a yawn
    #[arg(long, default_value_t = 0.5)]
    mar_threshold: f32,
    /// |yaw| in degrees above this counts as looking away
    #[arg(long, default_value_t = 15.0)]
    yaw_threshold: f32,
    /// Remote analysis endpoint; when set the request is relayed there
    #[arg(long, env = "VIGIL_ANALYSIS_URL")]
    server_url: Option<String>,
    /// Seconds to wait for the remote analysis server
    #[arg(long, default_value_t = 10.0)]
    server_timeout: f64,
    /// Summarize locally when the remote server fails instead of reporting an error
    #[arg(long)]
    local_fallback: bool,
}

impl Cli {
    fn params(&self) -> AnalysisParams {
        AnalysisParams {
            ear_closed: self.ear_threshold,
            mar_open: self.mar_threshold,
            yaw_away: self.yaw_threshold,
            ..Default::default()
        }
    }

    fn remote(&self) -> Option<RemoteConfig> {
        let url = self.server_url.as_deref()?.trim();
        if url.is_empty() {
            return None;
        }
        Some(RemoteConfig {
            url: url.to_string(),
            timeout: Duration::try_from_secs_f64(self.server_timeout).unwrap_or(Duration::from_secs(10)),
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let result = run(&cli).await;
    write_json_atomic(&cli.result, &result)
        .with_context(|| format!("failed to write result {}", cli.result.display()))?;
    tracing::info!(path = %cli.result.display(), ok = result.is_ok(), "result written");
    Ok(())
}

/// Produce a result for the request. A bad request or a failed remote call
/// yields an error result rather than no result at all.
async fn run(cli: &Cli) -> AnalysisResult {
    let run_id = uuid::Uuid::new_v4().to_string();
    tracing::info!(run_id = %run_id, request = %cli.request.display(), "analysis started");

    let request = match load_request(&cli.request) {
        Ok(request) => request,
        Err(e) => return failure(format!("{e:#}"), run_id),
    };

    let report = match cli.remote() {
        Some(config) => match relay(config, &request, run_id.clone()).await {
            Ok(report) => report,
            Err(e) if cli.local_fallback => {
                tracing::warn!(error = %format!("{e:#}"), "remote analysis failed; summarizing locally");
                analysis::analyze(&request, &cli.params(), run_id, Utc::now())
            }
            Err(e) => return failure(format!("{e:#}"), run_id),
        },
        None => analysis::analyze(&request, &cli.params(), run_id, Utc::now()),
    };

    tracing::info!(
        subject = %request.subject_label,
        samples = request.time_series_data.len(),
        concentration = %report.analysis.concentration,
        is_sleeping = report.analysis.is_sleeping,
        remote_run_id = report.remote_run_id.as_deref().unwrap_or("-"),
        "analysis complete"
    );
    AnalysisResult::Ok(report)
}

async fn relay(config: RemoteConfig, request: &AnalysisRequest, run_id: String) -> Result<AnalysisReport> {
    let remote = RemoteAnalyzer::new(config)?;
    let response = remote
        .analyze(request)
        .await
        .with_context(|| format!("remote analysis at {} failed", remote.url()))?;
    Ok(AnalysisReport {
        run_id: Some(run_id),
        processed_at: Some(Utc::now()),
        analysis: response.analysis,
        input_summary: Some(analysis::input_summary(request)),
        remote_run_id: response.run_id,
    })
}

fn failure(message: String, run_id: String) -> AnalysisResult {
    tracing::error!(error = %message, "analysis failed");
    AnalysisResult::Error(AnalysisFailure {
        message,
        run_id: Some(run_id),
        processed_at: Some(Utc::now()),
    })
}

fn load_request(path: &Path) -> Result<AnalysisRequest> {
    let text = std::fs::read_to_string(path).with_context(|| format!("failed to read request {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("failed to parse request {}", path.display()))
}
