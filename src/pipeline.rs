//! Post-export pipeline invocation surface.
//!
//! The orchestrator's Finalize step hands the finished manifest to a
//! pipeline for optional inspection/fix/convert/validate passes. This crate
//! ships no real pipeline; [`NullPipeline`] gives the orchestrator a uniform
//! code path when the feature is disabled.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline timed out after {0:?}")]
    Timeout(Duration),
    #[error("pipeline step '{step}' failed: {message}")]
    StepFailed { step: String, message: String },
}

#[derive(Debug, Clone, Default)]
pub struct PipelineOptions {
    pub dry_run: bool,
    pub inspect: bool,
    pub fix: bool,
    pub convert: bool,
    pub validate: bool,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub ran: bool,
    pub steps_executed: Vec<String>,
    pub notes: Vec<String>,
}

impl PipelineOutcome {
    pub fn skipped() -> Self {
        Self {
            ran: false,
            steps_executed: Vec::new(),
            notes: vec!["pipeline disabled".to_string()],
        }
    }
}

#[async_trait]
pub trait PipelineInvoker: Send + Sync {
    async fn invoke(
        &self,
        manifest_path: &Path,
        opts: &PipelineOptions,
    ) -> Result<PipelineOutcome, PipelineError>;
}

/// No-op pipeline used when `enable_pipeline` is false or no concrete
/// pipeline has been wired in by the host application.
pub struct NullPipeline;

#[async_trait]
impl PipelineInvoker for NullPipeline {
    async fn invoke(
        &self,
        _manifest_path: &Path,
        _opts: &PipelineOptions,
    ) -> Result<PipelineOutcome, PipelineError> {
        Ok(PipelineOutcome::skipped())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_pipeline_reports_skipped() {
        let pipeline = NullPipeline;
        let outcome = pipeline
            .invoke(Path::new("manifest.json"), &PipelineOptions::default())
            .await
            .unwrap();
        assert!(!outcome.ran);
        assert!(outcome.steps_executed.is_empty());
    }
}
