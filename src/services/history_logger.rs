// History Logger
// Writes per-run token usage and processing details as JSON files

use crate::models::{LogFiles, ProcessingResult, Segment};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("failed to write history file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize history: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TokenUsageLog<'a> {
    timestamp: &'a str,
    run_id: &'a str,
    total_tokens: u64,
    prompt_tokens: u64,
    completion_tokens: u64,
    model: &'a str,
    text_length: usize,
    segment_count: usize,
    cost_estimate: f64,
    calls: u32,
    failed_calls: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProcessingLog<'a> {
    timestamp: &'a str,
    run_id: &'a str,
    input_text: &'a str,
    segments: &'a [Segment],
}

pub struct HistoryLogger {
    root: PathBuf,
}

impl HistoryLogger {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn write_json(path: &Path, value: &impl Serialize) -> Result<(), HistoryError> {
        let content = serde_json::to_string_pretty(value)?;
        fs::write(path, content).map_err(|source| HistoryError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Write both files for a finished run into
    /// `<root>/<timestamp>_<runId>/` and return their paths.
    pub fn log_run(
        &self,
        input_text: &str,
        result: &ProcessingResult,
    ) -> Result<LogFiles, HistoryError> {
        let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S").to_string();
        let run_id = result.summary.run_id.as_str();
        let run_dir = self.root.join(format!("{}_{}", timestamp, run_id));
        fs::create_dir_all(&run_dir).map_err(|source| HistoryError::Io {
            path: run_dir.clone(),
            source,
        })?;

        let usage_file = run_dir.join("token_usage.json");
        Self::write_json(
            &usage_file,
            &TokenUsageLog {
                timestamp: &timestamp,
                run_id,
                total_tokens: result.usage.total_tokens,
                prompt_tokens: result.usage.prompt_tokens,
                completion_tokens: result.usage.completion_tokens,
                model: &result.usage.model_name,
                text_length: result.summary.original_length,
                segment_count: result.summary.segment_count,
                cost_estimate: result.usage.cost_estimate,
                calls: result.usage.calls,
                failed_calls: result.usage.failed_calls,
            },
        )?;

        let processing_file = run_dir.join("processing_details.json");
        Self::write_json(
            &processing_file,
            &ProcessingLog {
                timestamp: &timestamp,
                run_id,
                input_text,
                segments: &result.segments,
            },
        )?;

        info!("[history] run={} logged to {}", run_id, run_dir.display());

        Ok(LogFiles {
            usage_log: usage_file.to_string_lossy().to_string(),
            processing_log: processing_file.to_string_lossy().to_string(),
        })
    }
}
