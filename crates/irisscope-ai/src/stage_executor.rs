// ABOUTME: Runs one LLM-backed stage: prerequisite check, prompt, gateway call, parse, validate
// ABOUTME: Owns the per-stage retry budget with exponential backoff and an inter-request delay

use irisscope_core::config_manager::PipelineConfig;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::gateway::{LlmGateway, LlmRequest};
use crate::interpolate::{interpolate, TemplateVars};
use crate::prompts::{PromptStore, StageId};
use crate::stage_schemas::{
    response_schema, DetectionResult, ErrorResult, StageError, StageErrorCode, StageOutput,
    StageSchema, Step1Geo,
};

/// Retry and pacing parameters
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorSettings {
    /// Retries after the first attempt
    pub stage_retries: u32,
    /// Slept before every gateway call
    pub request_delay: Duration,
    /// Backoff before retry `n` is `retry_backoff * 2^(n-1)`
    pub retry_backoff: Duration,
}

impl ExecutorSettings {
    pub fn attempts(&self) -> u32 {
        self.stage_retries.saturating_add(1)
    }

    fn backoff_before(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(16);
        self.retry_backoff.saturating_mul(1u32 << exponent)
    }
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self::from(&PipelineConfig::default())
    }
}

impl From<&PipelineConfig> for ExecutorSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            stage_retries: config.stage_retries,
            request_delay: Duration::from_millis(config.request_delay_ms),
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
        }
    }
}

/// Everything one stage invocation needs
#[derive(Debug, Clone, Default)]
pub struct StageInput {
    pub vars: TemplateVars,
    /// Image data URL
    pub image: Option<String>,
    /// Calibration result, required by detection stages
    pub calibration: Option<Step1Geo>,
}

pub struct StageExecutor {
    gateway: Arc<dyn LlmGateway>,
    prompts: Arc<PromptStore>,
    settings: ExecutorSettings,
}

impl StageExecutor {
    pub fn new(
        gateway: Arc<dyn LlmGateway>,
        prompts: Arc<PromptStore>,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            gateway,
            prompts,
            settings,
        }
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    pub fn prompts(&self) -> &PromptStore {
        &self.prompts
    }

    /// Execute `stage` with retries. Returns validated output or the last error.
    pub async fn run_stage(
        &self,
        stage: StageId,
        input: &StageInput,
    ) -> Result<StageOutput, StageError> {
        self.check_prerequisites(stage, input)?;

        let template = self
            .prompts
            .get(stage)
            .map_err(|e| StageError::new(stage, StageErrorCode::PrereqFail, e.to_string()))?;

        let request = LlmRequest {
            stage,
            prompt: interpolate(&template.text, &input.vars),
            json_mode: true,
            response_schema: Some(response_schema(stage)),
            image: input.image.clone(),
        };

        let attempts = self.settings.attempts();
        let mut attempt = 1;
        loop {
            if attempt > 1 {
                let backoff = self.settings.backoff_before(attempt - 1);
                if !backoff.is_zero() {
                    tokio::time::sleep(backoff).await;
                }
            }

            match self.attempt(stage, request.clone()).await {
                Ok(output) => {
                    debug!(
                        stage = stage.as_str(),
                        attempt,
                        checksum = %template.checksum,
                        "Stage completed"
                    );
                    return Ok(output);
                }
                Err(err) if err.can_retry && attempt < attempts => {
                    warn!(
                        stage = stage.as_str(),
                        attempt,
                        max_attempts = attempts,
                        code = %err.code,
                        "Stage attempt failed, retrying: {}",
                        err.message
                    );
                    attempt += 1;
                }
                Err(err) => {
                    warn!(
                        stage = stage.as_str(),
                        attempt,
                        code = %err.code,
                        "Stage failed: {}",
                        err.message
                    );
                    return Err(err);
                }
            }
        }
    }

    fn check_prerequisites(&self, stage: StageId, input: &StageInput) -> Result<(), StageError> {
        if stage.requires_calibration() {
            match &input.calibration {
                Some(geo) if geo.ok => {}
                Some(_) => {
                    return Err(StageError::new(
                        stage,
                        StageErrorCode::PrereqFail,
                        "calibration rejected the image",
                    ))
                }
                None => {
                    return Err(StageError::new(
                        stage,
                        StageErrorCode::PrereqFail,
                        "calibration result missing",
                    ))
                }
            }
        }
        if stage.requires_image() && input.image.is_none() {
            return Err(StageError::new(
                stage,
                StageErrorCode::PrereqFail,
                "image data missing",
            ));
        }
        Ok(())
    }

    async fn attempt(&self, stage: StageId, request: LlmRequest) -> Result<StageOutput, StageError> {
        if !self.settings.request_delay.is_zero() {
            tokio::time::sleep(self.settings.request_delay).await;
        }

        let text = self.gateway.call(request).await.map_err(|e| {
            let retryable = e.is_retryable();
            let err = StageError::new(stage, StageErrorCode::GatewayFail, e.to_string());
            if retryable {
                err.retryable()
            } else {
                err
            }
        })?;

        parse_output(stage, &text)
    }
}

/// Remove surrounding whitespace and one markdown code fence
pub fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string (```json) up to the first newline
    let body = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    body.trim_end()
        .strip_suffix("```")
        .unwrap_or(body)
        .trim()
}

/// Parse raw LLM text into the typed output for `stage`
pub fn parse_output(stage: StageId, text: &str) -> Result<StageOutput, StageError> {
    let body = strip_code_fence(text);
    let value: Value = serde_json::from_str(body)
        .map_err(|e| StageError::format(stage, format!("response is not JSON: {}", e)))?;

    if value.get("error").is_some() {
        let envelope: ErrorResult = serde_json::from_value(value)
            .map_err(|e| StageError::format(stage, format!("unreadable error envelope: {}", e)))?;
        return Err(envelope.into_stage_error(stage));
    }

    match stage {
        StageId::Step1Geo => decode::<Step1Geo>(stage, value).map(StageOutput::Calibration),
        StageId::Step2Structural | StageId::Step2Pigment => {
            decode::<DetectionResult>(stage, value).map(StageOutput::Detection)
        }
    }
}

fn decode<T: StageSchema>(stage: StageId, value: Value) -> Result<T, StageError> {
    let parsed: T = serde_json::from_value(value)
        .map_err(|e| StageError::format(stage, format!("schema mismatch: {}", e)))?;
    parsed
        .validate(stage)
        .map_err(|e| StageError::format(stage, format!("invalid output: {}", e)))?;
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::GatewayError;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    const GEO_OK: &str = r#"{"ok":true,"quality":{"score":80},"geo":{"pupil":{"cx":50,"cy":50,"r":10},"iris":{"cx":50,"cy":50,"r":40},"clockOffsetDeg":0},"rejectReasons":[]}"#;

    struct ScriptedGateway {
        replies: Mutex<VecDeque<Result<String, GatewayError>>>,
        requests: Mutex<Vec<LlmRequest>>,
    }

    impl ScriptedGateway {
        fn new(replies: Vec<Result<String, GatewayError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.requests.lock().len()
        }
    }

    #[async_trait]
    impl LlmGateway for ScriptedGateway {
        async fn call(&self, request: LlmRequest) -> Result<String, GatewayError> {
            self.requests.lock().push(request);
            self.replies
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(GatewayError::Fatal("script exhausted".to_string())))
        }
    }

    fn executor(gateway: Arc<ScriptedGateway>) -> StageExecutor {
        StageExecutor::new(
            gateway,
            Arc::new(PromptStore::new()),
            ExecutorSettings {
                stage_retries: 2,
                request_delay: Duration::ZERO,
                retry_backoff: Duration::ZERO,
            },
        )
    }

    fn image_input() -> StageInput {
        let mut vars = TemplateVars::new();
        vars.insert("side".to_string(), "left".to_string());
        StageInput {
            vars,
            image: Some("data:image/png;base64,AA".to_string()),
            calibration: None,
        }
    }

    #[test]
    fn test_strip_code_fence() {
        assert_eq!(strip_code_fence("  {\"a\":1}\n"), "{\"a\":1}");
        assert_eq!(strip_code_fence("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fence("```\n{\"a\":1}```  "), "{\"a\":1}");
    }

    #[test]
    fn test_backoff_doubles() {
        let settings = ExecutorSettings {
            stage_retries: 3,
            request_delay: Duration::ZERO,
            retry_backoff: Duration::from_millis(100),
        };
        assert_eq!(settings.attempts(), 4);
        assert_eq!(settings.backoff_before(1), Duration::from_millis(100));
        assert_eq!(settings.backoff_before(2), Duration::from_millis(200));
        assert_eq!(settings.backoff_before(3), Duration::from_millis(400));
    }

    #[test]
    fn test_reported_error_mapping() {
        let err = parse_output(
            StageId::Step1Geo,
            r#"{"error":{"code":"NO_LIMBUS","message":"eyelid","canRetry":false}}"#,
        )
        .unwrap_err();
        assert_eq!(err.code, StageErrorCode::NoLimbus);
        assert!(!err.can_retry);

        let err = parse_output(StageId::Step1Geo, r#"{"error":{"code":"WHATEVER"}}"#).unwrap_err();
        assert_eq!(err.code, StageErrorCode::FormatFail);
        assert!(err.can_retry);

        let err = parse_output(StageId::Step1Geo, r#"{"error":42}"#).unwrap_err();
        assert_eq!(err.code, StageErrorCode::FormatFail);
        assert!(err.can_retry);
    }

    #[tokio::test]
    async fn test_calibration_success_interpolates_prompt() {
        let gateway = ScriptedGateway::new(vec![Ok(format!("```json\n{}\n```", GEO_OK))]);
        let output = executor(gateway.clone())
            .run_stage(StageId::Step1Geo, &image_input())
            .await
            .unwrap();

        assert!(output.as_calibration().map(|g| g.ok).unwrap_or(false));
        let requests = gateway.requests.lock();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].json_mode);
        assert!(requests[0].response_schema.is_some());
        assert!(requests[0].prompt.contains("left eye"));
        assert!(!requests[0].prompt.contains("{{side}}"));
    }

    #[tokio::test]
    async fn test_detection_without_calibration_never_calls_gateway() {
        let gateway = ScriptedGateway::new(vec![Ok("{\"findings\":[]}".to_string())]);
        let err = executor(gateway.clone())
            .run_stage(StageId::Step2Structural, &image_input())
            .await
            .unwrap_err();
        assert_eq!(err.code, StageErrorCode::PrereqFail);
        assert_eq!(gateway.calls(), 0);
    }

    #[tokio::test]
    async fn test_format_failures_exhaust_retries() {
        let gateway = ScriptedGateway::new(vec![
            Ok("not json".to_string()),
            Ok("{\"ok\":true}".to_string()),
            Ok("still not json".to_string()),
            Ok(GEO_OK.to_string()),
        ]);
        let err = executor(gateway.clone())
            .run_stage(StageId::Step1Geo, &image_input())
            .await
            .unwrap_err();
        assert_eq!(err.code, StageErrorCode::FormatFail);
        assert_eq!(gateway.calls(), 3);
    }

    #[tokio::test]
    async fn test_transient_gateway_error_then_success() {
        let gateway = ScriptedGateway::new(vec![
            Err(GatewayError::Retryable("503".to_string())),
            Ok(GEO_OK.to_string()),
        ]);
        let output = executor(gateway.clone())
            .run_stage(StageId::Step1Geo, &image_input())
            .await;
        assert!(output.is_ok());
        assert_eq!(gateway.calls(), 2);
    }

    #[tokio::test]
    async fn test_fatal_gateway_error_not_retried() {
        let gateway = ScriptedGateway::new(vec![
            Err(GatewayError::Fatal("401 unauthorized".to_string())),
            Ok(GEO_OK.to_string()),
        ]);
        let err = executor(gateway.clone())
            .run_stage(StageId::Step1Geo, &image_input())
            .await
            .unwrap_err();
        assert_eq!(err.code, StageErrorCode::GatewayFail);
        assert!(!err.can_retry);
        assert_eq!(gateway.calls(), 1);
    }

    #[tokio::test]
    async fn test_non_retryable_model_error_stops_immediately() {
        let gateway = ScriptedGateway::new(vec![Ok(
            r#"{"error":{"stage":"step1_geo","code":"LOW_QUALITY","message":"blurry","canRetry":false}}"#
                .to_string(),
        )]);
        let err = executor(gateway.clone())
            .run_stage(StageId::Step1Geo, &image_input())
            .await
            .unwrap_err();
        assert_eq!(err.code, StageErrorCode::LowQuality);
        assert_eq!(gateway.calls(), 1);
    }

    #[tokio::test]
    async fn test_model_reported_format_error_is_retried() {
        let gateway = ScriptedGateway::new(vec![
            Ok(r#"{"error":"could not parse image"}"#.to_string()),
            Ok(GEO_OK.to_string()),
        ]);
        let output = executor(gateway.clone())
            .run_stage(StageId::Step1Geo, &image_input())
            .await
            .unwrap();
        assert!(output.as_calibration().is_some());
        assert_eq!(gateway.calls(), 2);
    }
}
