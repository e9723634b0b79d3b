// ABOUTME: Per-side pipeline orchestration: calibrate, detect (concurrently), aggregate
// ABOUTME: Reports progress and log entries through injected callbacks

use irisscope_core::analysis::{IrisAnalysis, SideFailure, ZoneStatus};
use irisscope_core::config_manager::{AggregationConfig, PipelineConfig};
use irisscope_core::image::{IrisImage, Side};
use irisscope_core::questionnaire::QuestionnaireData;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::aggregator::FindingAggregator;
use crate::gateway::LlmGateway;
use crate::interpolate::TemplateVars;
use crate::progress::{LogCallback, LogLevel, PipelineReporter, ProgressCallback};
use crate::prompts::{PromptStore, StageId};
use crate::stage_executor::{ExecutorSettings, StageExecutor, StageInput};
use crate::stage_schemas::{DetectionResult, StageError, StageErrorCode, Step1Geo};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Pending,
    Calibrating,
    Detecting,
    Aggregating,
    Completed,
    /// Calibration judged the image unusable
    Rejected,
    Failed,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineState::Pending => "pending",
            PipelineState::Calibrating => "calibrating",
            PipelineState::Detecting => "detecting",
            PipelineState::Aggregating => "aggregating",
            PipelineState::Completed => "completed",
            PipelineState::Rejected => "rejected",
            PipelineState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{side} eye rejected by calibration (quality {quality}): {}", .reasons.join(", "))]
    Rejected {
        side: Side,
        codes: Vec<StageErrorCode>,
        reasons: Vec<String>,
        quality: f64,
    },

    #[error("{side} eye: {error}")]
    StageFailed {
        side: Side,
        #[source]
        error: StageError,
    },
}

impl PipelineError {
    pub fn side(&self) -> Side {
        match self {
            PipelineError::Rejected { side, .. } | PipelineError::StageFailed { side, .. } => *side,
        }
    }

    pub fn stage(&self) -> StageId {
        match self {
            PipelineError::Rejected { .. } => StageId::Step1Geo,
            PipelineError::StageFailed { error, .. } => error.stage,
        }
    }

    /// Primary error code
    pub fn code(&self) -> StageErrorCode {
        match self {
            PipelineError::Rejected { codes, .. } => codes
                .first()
                .copied()
                .unwrap_or(StageErrorCode::LowQuality),
            PipelineError::StageFailed { error, .. } => error.code,
        }
    }

    pub fn to_side_failure(&self) -> SideFailure {
        let message = match self {
            PipelineError::Rejected { reasons, .. } => reasons.join(", "),
            PipelineError::StageFailed { error, .. } => error.message.clone(),
        };
        SideFailure {
            side: self.side(),
            stage: self.stage().as_str().to_string(),
            code: self.code().as_str().to_string(),
            message,
        }
    }
}

/// Staged analysis of one iris image
pub struct IrisPipeline {
    executor: StageExecutor,
    aggregator: FindingAggregator,
    min_quality_score: f64,
}

impl IrisPipeline {
    pub fn new(
        gateway: Arc<dyn LlmGateway>,
        prompts: Arc<PromptStore>,
        pipeline: &PipelineConfig,
        aggregation: AggregationConfig,
    ) -> Self {
        Self {
            executor: StageExecutor::new(gateway, prompts, ExecutorSettings::from(pipeline)),
            aggregator: FindingAggregator::new(aggregation),
            min_quality_score: pipeline.min_quality_score,
        }
    }

    pub fn prompt_version(&self) -> &str {
        self.executor.prompts().version()
    }

    /// Run calibration, both detectors and aggregation for one side.
    pub async fn execute_pipeline(
        &self,
        image: &IrisImage,
        side: Side,
        questionnaire: &QuestionnaireData,
        progress: ProgressCallback,
        log: LogCallback,
    ) -> Result<IrisAnalysis, PipelineError> {
        let reporter = PipelineReporter::new(side, progress, log);
        let mut state = PipelineState::Pending;
        reporter.notify_started();

        if image.side != side {
            reporter.log(
                LogLevel::Warning,
                &format!(
                    "Image is tagged as {} eye, analysing it as {} eye",
                    image.side, side
                ),
            );
        }

        let vars = self.base_vars(image, side, questionnaire);
        let data_url = Some(image.data_url.clone());

        transition(side, &mut state, PipelineState::Calibrating);
        reporter.log(LogLevel::Info, "Calibrating iris geometry");
        let calibration_input = StageInput {
            vars: vars.clone(),
            image: data_url.clone(),
            calibration: None,
        };
        let geo = match self.calibrate(&calibration_input).await {
            Ok(geo) => geo,
            Err(error) => {
                transition(side, &mut state, PipelineState::Failed);
                return Err(self.stage_failed(&reporter, error));
            }
        };

        reporter.log(
            LogLevel::Info,
            &format!(
                "Calibration finished: ok={}, quality {:.0}",
                geo.ok, geo.quality.score
            ),
        );

        if let Some(rejection) = self.rejection(side, &geo) {
            transition(side, &mut state, PipelineState::Rejected);
            reporter.log(LogLevel::Error, &rejection.to_string());
            return Err(rejection);
        }
        reporter.log(
            LogLevel::Success,
            &format!("Image accepted (quality {:.0})", geo.quality.score),
        );
        reporter.notify_calibrated();

        let step1_json = serde_json::to_string(&geo).map_err(|e| {
            self.stage_failed(
                &reporter,
                StageError::new(StageId::Step1Geo, StageErrorCode::FormatFail, e.to_string()),
            )
        })?;
        let mut detection_vars = vars;
        detection_vars.insert("step1_json".to_string(), step1_json);
        let detection_input = StageInput {
            vars: detection_vars,
            image: data_url,
            calibration: Some(geo.clone()),
        };

        transition(side, &mut state, PipelineState::Detecting);
        let detections = tokio::try_join!(
            self.detect(StageId::Step2Structural, &detection_input, &reporter),
            self.detect(StageId::Step2Pigment, &detection_input, &reporter),
        );
        let (structural, pigment) = match detections {
            Ok(results) => results,
            Err(error) => {
                transition(side, &mut state, PipelineState::Failed);
                return Err(error);
            }
        };

        transition(side, &mut state, PipelineState::Aggregating);
        let analysis = self.aggregator.aggregate(&geo, &structural, &pigment, side);
        reporter.log(
            LogLevel::Success,
            &format!(
                "Analysis complete: {} concern, {} attention zones, {} artifacts, overall health {}",
                analysis.zones_with_status(ZoneStatus::Concern),
                analysis.zones_with_status(ZoneStatus::Attention),
                analysis.artifacts.len(),
                analysis.overall_health
            ),
        );
        reporter.notify_complete();
        transition(side, &mut state, PipelineState::Completed);

        Ok(analysis)
    }

    fn base_vars(&self, image: &IrisImage, side: Side, questionnaire: &QuestionnaireData) -> TemplateVars {
        let mut vars = TemplateVars::new();
        vars.insert("side".to_string(), side.as_str().to_string());
        vars.insert("image_hash".to_string(), image.image_hash());
        vars.insert("questionnaire".to_string(), questionnaire.prompt_summary());
        vars.insert("age".to_string(), questionnaire.age_text());
        vars.insert("sex".to_string(), questionnaire.sex_text().to_string());
        vars.insert("prompt_version".to_string(), self.prompt_version().to_string());
        vars
    }

    async fn calibrate(&self, input: &StageInput) -> Result<Step1Geo, StageError> {
        self.executor
            .run_stage(StageId::Step1Geo, input)
            .await?
            .into_calibration()
            .ok_or_else(|| {
                StageError::new(
                    StageId::Step1Geo,
                    StageErrorCode::FormatFail,
                    "calibration produced detection output",
                )
            })
    }

    async fn detect(
        &self,
        stage: StageId,
        input: &StageInput,
        reporter: &PipelineReporter,
    ) -> Result<DetectionResult, PipelineError> {
        let result = self
            .executor
            .run_stage(stage, input)
            .await
            .and_then(|output| {
                output.into_detection().ok_or_else(|| {
                    StageError::new(stage, StageErrorCode::FormatFail, "unexpected calibration output")
                })
            })
            .map_err(|error| self.stage_failed(reporter, error))?;

        reporter.log(
            LogLevel::Info,
            &format!("{}: {} findings", stage.display_name(), result.findings.len()),
        );
        reporter.notify_detection_done(stage);
        Ok(result)
    }

    fn rejection(&self, side: Side, geo: &Step1Geo) -> Option<PipelineError> {
        if !geo.ok {
            let mut reasons = geo.reject_reasons.clone();
            if reasons.is_empty() {
                reasons.push("calibration rejected the image".to_string());
            }
            return Some(PipelineError::Rejected {
                side,
                codes: geo.reject_codes(),
                reasons,
                quality: geo.quality.score,
            });
        }
        if self.min_quality_score > 0.0 && geo.quality.score < self.min_quality_score {
            return Some(PipelineError::Rejected {
                side,
                codes: vec![StageErrorCode::LowQuality],
                reasons: vec![format!(
                    "quality {:.0} below minimum {:.0}",
                    geo.quality.score, self.min_quality_score
                )],
                quality: geo.quality.score,
            });
        }
        None
    }

    fn stage_failed(&self, reporter: &PipelineReporter, error: StageError) -> PipelineError {
        reporter.log(
            LogLevel::Error,
            &format!(
                "{} failed [{}]: {}",
                error.stage.display_name(),
                error.code,
                error.message
            ),
        );
        PipelineError::StageFailed {
            side: reporter.side(),
            error,
        }
    }
}

fn transition(side: Side, state: &mut PipelineState, next: PipelineState) {
    debug!(side = side.as_str(), from = %state, to = %next, "Pipeline state transition");
    if matches!(next, PipelineState::Completed | PipelineState::Rejected | PipelineState::Failed) {
        info!(side = side.as_str(), state = %next, "Pipeline finished");
    }
    *state = next;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_maps_to_side_failure() {
        let error = PipelineError::Rejected {
            side: Side::Left,
            codes: vec![StageErrorCode::NoLimbus],
            reasons: vec!["NO_LIMBUS".to_string()],
            quality: 31.0,
        };
        let failure = error.to_side_failure();
        assert_eq!(failure.stage, "step1_geo");
        assert_eq!(failure.code, "NO_LIMBUS");
        assert!(error.to_string().contains("left eye rejected"));
    }

    #[test]
    fn test_stage_failure_keeps_stage_and_code() {
        let error = PipelineError::StageFailed {
            side: Side::Right,
            error: StageError::format(StageId::Step2Pigment, "bad json"),
        };
        assert_eq!(error.side(), Side::Right);
        assert_eq!(error.stage(), StageId::Step2Pigment);
        assert_eq!(error.code(), StageErrorCode::FormatFail);
        assert_eq!(error.to_side_failure().message, "bad json");
    }

    #[test]
    fn test_state_transition() {
        let mut state = PipelineState::Pending;
        transition(Side::Left, &mut state, PipelineState::Calibrating);
        assert_eq!(state, PipelineState::Calibrating);
        assert_eq!(PipelineState::Rejected.to_string(), "rejected");
    }
}
