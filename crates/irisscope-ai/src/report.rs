// ABOUTME: Combines the left and right pipeline outcomes into one AnalysisReport
// ABOUTME: Runs both sides concurrently and applies the partial-report policy

use chrono::Utc;
use irisscope_core::analysis::{AnalysisReport, BodySystem, IrisAnalysis, SystemScore};
use irisscope_core::config_manager::PartialReportPolicy;
use irisscope_core::image::{IrisImage, Side};
use irisscope_core::questionnaire::QuestionnaireData;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::pipeline::{IrisPipeline, PipelineError};
use crate::progress::{LogCallback, ProgressCallback};

/// Result of one side's pipeline run
pub type SideOutcome = Result<IrisAnalysis, PipelineError>;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("report requires both eyes: {0}")]
    SideFailed(#[source] PipelineError),

    #[error("no eye could be analysed (left: {left}; right: {right})")]
    NoCompletedSide {
        left: PipelineError,
        right: PipelineError,
    },
}

pub struct ReportAssembler {
    policy: PartialReportPolicy,
    prompt_version: String,
}

impl ReportAssembler {
    pub fn new(policy: PartialReportPolicy, prompt_version: impl Into<String>) -> Self {
        Self {
            policy,
            prompt_version: prompt_version.into(),
        }
    }

    pub fn policy(&self) -> PartialReportPolicy {
        self.policy
    }

    /// Run both sides concurrently. `callbacks` supplies the progress and log sinks per side.
    pub async fn analyze_both(
        &self,
        pipeline: &IrisPipeline,
        left: &IrisImage,
        right: &IrisImage,
        questionnaire: &QuestionnaireData,
        callbacks: &(dyn Fn(Side) -> (ProgressCallback, LogCallback) + Send + Sync),
    ) -> Result<AnalysisReport, ReportError> {
        let (left_progress, left_log) = callbacks(Side::Left);
        let (right_progress, right_log) = callbacks(Side::Right);

        let (left_outcome, right_outcome) = tokio::join!(
            pipeline.execute_pipeline(left, Side::Left, questionnaire, left_progress, left_log),
            pipeline.execute_pipeline(right, Side::Right, questionnaire, right_progress, right_log),
        );

        self.assemble(questionnaire, left_outcome, right_outcome)
    }

    /// Build the report. Failed sides are listed, never filled in.
    pub fn assemble(
        &self,
        questionnaire: &QuestionnaireData,
        left: SideOutcome,
        right: SideOutcome,
    ) -> Result<AnalysisReport, ReportError> {
        let (left_eye, right_eye, failures) = match (self.policy, left, right) {
            (_, Ok(l), Ok(r)) => (Some(l), Some(r), Vec::new()),
            (_, Err(l), Err(r)) => {
                return Err(match self.policy {
                    PartialReportPolicy::RequireBoth => ReportError::SideFailed(l),
                    PartialReportPolicy::AllowPartial => {
                        ReportError::NoCompletedSide { left: l, right: r }
                    }
                })
            }
            (PartialReportPolicy::RequireBoth, Err(e), Ok(_))
            | (PartialReportPolicy::RequireBoth, Ok(_), Err(e)) => {
                return Err(ReportError::SideFailed(e))
            }
            (PartialReportPolicy::AllowPartial, Ok(l), Err(e)) => {
                (Some(l), None, vec![e.to_side_failure()])
            }
            (PartialReportPolicy::AllowPartial, Err(e), Ok(r)) => {
                (None, Some(r), vec![e.to_side_failure()])
            }
        };

        for failure in &failures {
            warn!(
                side = failure.side.as_str(),
                stage = %failure.stage,
                code = %failure.code,
                "Assembling partial report without this side"
            );
        }

        let completed: Vec<&IrisAnalysis> = left_eye.iter().chain(right_eye.iter()).collect();
        let overall_health = mean_score(completed.iter().map(|a| a.overall_health));
        let system_scores = combine_system_scores(&completed);

        let report = AnalysisReport {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            prompt_version: self.prompt_version.clone(),
            questionnaire: questionnaire.clone(),
            left_eye,
            right_eye,
            failures,
            overall_health,
            system_scores,
        };
        info!(
            report_id = %report.id,
            overall_health = report.overall_health,
            partial = report.is_partial(),
            "Report assembled"
        );
        Ok(report)
    }
}

fn mean_score(scores: impl Iterator<Item = u8>) -> u8 {
    let (total, count) = scores.fold((0u32, 0u32), |(t, c), s| (t + u32::from(s), c + 1));
    if count == 0 {
        return 0;
    }
    (f64::from(total) / f64::from(count)).round() as u8
}

/// Per-system mean across sides; the description comes from the weaker side
fn combine_system_scores(analyses: &[&IrisAnalysis]) -> Vec<SystemScore> {
    BodySystem::ALL
        .iter()
        .filter_map(|&system| {
            let scores: Vec<&SystemScore> = analyses
                .iter()
                .filter_map(|a| a.system_scores.iter().find(|s| s.system == system))
                .collect();
            let weakest = scores.iter().min_by_key(|s| s.score)?;
            Some(SystemScore {
                system,
                score: mean_score(scores.iter().map(|s| s.score)),
                description: weakest.description.clone(),
            })
        })
        .collect()
}
