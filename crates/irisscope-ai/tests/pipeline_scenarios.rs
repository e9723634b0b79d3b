// End-to-end pipeline runs against a scripted LLM gateway

use async_trait::async_trait;
use irisscope_ai::{
    GatewayError, IrisPipeline, LlmGateway, LlmRequest, LogCallback, LogLevel, PipelineError,
    ProgressCallback, PromptStore, ReportAssembler, ReportError, StageErrorCode, StageId,
};
use irisscope_core::analysis::{BodySystem, ZoneStatus};
use irisscope_core::config_manager::{AggregationConfig, PartialReportPolicy, PipelineConfig};
use irisscope_core::image::{IrisImage, Side};
use irisscope_core::questionnaire::QuestionnaireData;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Barrier;

const GEO_OK: &str = r#"{"ok":true,"quality":{"score":84,"sharpness":0.9,"glare":0.1,"occlusion":0.05},"geo":{"pupil":{"cx":320,"cy":240,"r":45},"iris":{"cx":320,"cy":240,"r":150},"clockOffsetDeg":2.5},"rejectReasons":[]}"#;
const GEO_REJECTED: &str = r#"{"ok":false,"quality":{"score":28},"geo":null,"rejectReasons":["NO_LIMBUS"]}"#;
const NO_FINDINGS: &str = r#"{"findings":[]}"#;
const LACUNA: &str = r#"```json
{"findings":[{"type":"lacuna","minuteRange":[10,12],"ringRange":[2,4],"severity":"medium","confidence":0.9,"notes":"closed lacuna"}]}
```"#;

/// Per-stage queue of replies; a stage with an empty queue keeps repeating its last reply
#[derive(Default)]
struct ScriptedGateway {
    replies: Mutex<HashMap<(String, StageId), Vec<Result<String, GatewayError>>>>,
    calls: Mutex<Vec<(String, StageId, String)>>,
}

impl ScriptedGateway {
    fn script(self, side: &str, stage: StageId, replies: Vec<Result<String, GatewayError>>) -> Self {
        self.replies.lock().insert((side.to_string(), stage), replies);
        self
    }

    fn calls_for(&self, side: &str) -> Vec<StageId> {
        self.calls
            .lock()
            .iter()
            .filter(|(s, _, _)| s == side)
            .map(|(_, stage, _)| *stage)
            .collect()
    }

    fn prompts_for(&self, side: &str, stage: StageId) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter(|(s, st, _)| s == side && *st == stage)
            .map(|(_, _, prompt)| prompt.clone())
            .collect()
    }
}

fn side_of(prompt: &str) -> String {
    if prompt.contains("IMAGE: left eye") {
        "left".to_string()
    } else {
        "right".to_string()
    }
}

#[async_trait]
impl LlmGateway for ScriptedGateway {
    async fn call(&self, request: LlmRequest) -> Result<String, GatewayError> {
        let side = side_of(&request.prompt);
        self.calls
            .lock()
            .push((side.clone(), request.stage, request.prompt.clone()));
        let mut replies = self.replies.lock();
        let queue = replies
            .get_mut(&(side, request.stage))
            .ok_or_else(|| GatewayError::Fatal("no script for stage".to_string()))?;
        if queue.len() > 1 {
            return queue.remove(0);
        }
        match queue.first() {
            Some(Ok(text)) => Ok(text.clone()),
            Some(Err(e)) => Err(GatewayError::Retryable(e.to_string())),
            None => Err(GatewayError::Fatal("script exhausted".to_string())),
        }
    }
}

/// Detection replies are held until both detection stages have called in
struct RendezvousGateway {
    detections: Barrier,
    calls: Mutex<Vec<StageId>>,
}

impl RendezvousGateway {
    fn new() -> Self {
        Self {
            detections: Barrier::new(2),
            calls: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl LlmGateway for RendezvousGateway {
    async fn call(&self, request: LlmRequest) -> Result<String, GatewayError> {
        self.calls.lock().push(request.stage);
        match request.stage {
            StageId::Step1Geo => Ok(GEO_OK.to_string()),
            StageId::Step2Structural | StageId::Step2Pigment => {
                self.detections.wait().await;
                Ok(NO_FINDINGS.to_string())
            }
        }
    }
}

fn ok(text: &str) -> Result<String, GatewayError> {
    Ok(text.to_string())
}

fn pipeline(gateway: Arc<dyn LlmGateway>) -> IrisPipeline {
    let config = PipelineConfig {
        stage_retries: 2,
        request_delay_ms: 0,
        retry_backoff_ms: 0,
        min_quality_score: 0.0,
    };
    IrisPipeline::new(
        gateway,
        Arc::new(PromptStore::new()),
        &config,
        AggregationConfig::default(),
    )
}

fn image(side: Side) -> IrisImage {
    IrisImage::from_bytes(&[0x89, b'P', b'N', b'G', side as u8], "image/png", side).unwrap()
}

fn questionnaire() -> QuestionnaireData {
    QuestionnaireData {
        age: Some(42),
        ..Default::default()
    }
}

struct Sinks {
    progress: Arc<Mutex<Vec<u8>>>,
    logs: Arc<Mutex<Vec<(LogLevel, String)>>>,
}

impl Sinks {
    fn new() -> Self {
        Self {
            progress: Arc::new(Mutex::new(Vec::new())),
            logs: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn callbacks(&self) -> (ProgressCallback, LogCallback) {
        let progress = self.progress.clone();
        let logs = self.logs.clone();
        (
            Arc::new(move |_: &str, percent: u8| progress.lock().push(percent)),
            Arc::new(move |level: LogLevel, message: &str| {
                logs.lock().push((level, message.to_string()))
            }),
        )
    }
}

#[tokio::test]
async fn clean_image_produces_base_scores() {
    let gateway = Arc::new(
        ScriptedGateway::default()
            .script("left", StageId::Step1Geo, vec![ok(GEO_OK)])
            .script("left", StageId::Step2Structural, vec![ok(NO_FINDINGS)])
            .script("left", StageId::Step2Pigment, vec![ok(NO_FINDINGS)]),
    );
    let sinks = Sinks::new();
    let (progress, log) = sinks.callbacks();

    let analysis = pipeline(gateway.clone())
        .execute_pipeline(&image(Side::Left), Side::Left, &questionnaire(), progress, log)
        .await
        .unwrap();

    assert_eq!(analysis.side, Side::Left);
    assert_eq!(analysis.zones_with_status(ZoneStatus::Normal), 12);
    assert!(analysis.system_scores.iter().all(|s| s.score == 85));
    assert_eq!(analysis.overall_health, 85);
    assert_eq!(analysis.image_quality, 84.0);
    assert_eq!(gateway.calls_for("left").len(), 3);

    assert_eq!(*sinks.progress.lock(), vec![0, 35, 60, 85, 100]);
    let logs = sinks.logs.lock();
    assert!(logs.iter().any(|(_, m)| m.contains("quality 84")));
    assert!(logs.iter().any(|(_, m)| m.contains("0 findings")));
    assert!(logs.iter().all(|(level, _)| *level != LogLevel::Error));
}

#[tokio::test]
async fn detection_stages_run_concurrently() {
    let gateway = Arc::new(RendezvousGateway::new());
    let sinks = Sinks::new();
    let (progress, log) = sinks.callbacks();

    let pipeline = pipeline(gateway.clone());
    let left_image = image(Side::Left);
    let answers = questionnaire();
    let run = pipeline.execute_pipeline(
        &left_image,
        Side::Left,
        &answers,
        progress,
        log,
    );
    let analysis = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("detection stages waited on each other")
        .unwrap();

    assert_eq!(analysis.overall_health, 85);
    let calls = gateway.calls.lock();
    assert_eq!(calls.len(), 3);
    assert_eq!(calls[0], StageId::Step1Geo);
    assert!(calls.contains(&StageId::Step2Structural));
    assert!(calls.contains(&StageId::Step2Pigment));
    assert_eq!(*sinks.progress.lock(), vec![0, 35, 60, 85, 100]);
}

#[tokio::test]
async fn detection_prompts_embed_calibration_and_subject() {
    let gateway = Arc::new(
        ScriptedGateway::default()
            .script("right", StageId::Step1Geo, vec![ok(GEO_OK)])
            .script("right", StageId::Step2Structural, vec![ok(NO_FINDINGS)])
            .script("right", StageId::Step2Pigment, vec![ok(NO_FINDINGS)]),
    );
    let sinks = Sinks::new();
    let (progress, log) = sinks.callbacks();

    pipeline(gateway.clone())
        .execute_pipeline(&image(Side::Right), Side::Right, &questionnaire(), progress, log)
        .await
        .unwrap();

    let calibration = &gateway.prompts_for("right", StageId::Step1Geo)[0];
    assert!(calibration.contains("prompt v9"));
    assert!(!calibration.contains("{{"));

    let structural = &gateway.prompts_for("right", StageId::Step2Structural)[0];
    assert!(structural.contains("\"clockOffsetDeg\":2.5"));
    assert!(structural.contains("Age: 42"));

    let pigment = &gateway.prompts_for("right", StageId::Step2Pigment)[0];
    assert!(pigment.contains("Age 42, sex not specified."));
}

#[tokio::test]
async fn lacuna_in_zone_three_is_a_concern() {
    let gateway = Arc::new(
        ScriptedGateway::default()
            .script("left", StageId::Step1Geo, vec![ok(GEO_OK)])
            .script("left", StageId::Step2Structural, vec![ok(LACUNA)])
            .script("left", StageId::Step2Pigment, vec![ok(NO_FINDINGS)]),
    );
    let sinks = Sinks::new();
    let (progress, log) = sinks.callbacks();

    let analysis = pipeline(gateway)
        .execute_pipeline(&image(Side::Left), Side::Left, &questionnaire(), progress, log)
        .await
        .unwrap();

    assert_eq!(analysis.zones[2].status, ZoneStatus::Concern);
    assert_eq!(analysis.zones_with_status(ZoneStatus::Concern), 1);
    assert_eq!(analysis.zones_with_status(ZoneStatus::Normal), 11);
    assert_eq!(analysis.system_score(BodySystem::Digestive), Some(85));
    assert_eq!(analysis.system_score(BodySystem::Cardiovascular), Some(70));
    assert_eq!(analysis.overall_health, 75);
    assert_eq!(analysis.artifacts.len(), 1);
    assert_eq!(analysis.artifacts[0].kind, "lacuna");
}

#[tokio::test]
async fn rejected_calibration_skips_detection() {
    let gateway = Arc::new(
        ScriptedGateway::default()
            .script("left", StageId::Step1Geo, vec![ok(GEO_REJECTED)])
            .script("left", StageId::Step2Structural, vec![ok(NO_FINDINGS)])
            .script("left", StageId::Step2Pigment, vec![ok(NO_FINDINGS)]),
    );
    let sinks = Sinks::new();
    let (progress, log) = sinks.callbacks();

    let err = pipeline(gateway.clone())
        .execute_pipeline(&image(Side::Left), Side::Left, &questionnaire(), progress, log)
        .await
        .unwrap_err();

    match &err {
        PipelineError::Rejected { codes, quality, .. } => {
            assert_eq!(codes, &vec![StageErrorCode::NoLimbus]);
            assert_eq!(*quality, 28.0);
        }
        other => panic!("expected rejection, got {}", other),
    }
    assert_eq!(gateway.calls_for("left"), vec![StageId::Step1Geo]);
    assert!(!sinks.progress.lock().contains(&35));
    assert!(sinks.logs.lock().iter().any(|(l, _)| *l == LogLevel::Error));
}

#[tokio::test]
async fn minimum_quality_gate_rejects_accepted_image() {
    let gateway = Arc::new(
        ScriptedGateway::default().script("left", StageId::Step1Geo, vec![ok(GEO_OK)]),
    );
    let config = PipelineConfig {
        stage_retries: 0,
        retry_backoff_ms: 0,
        min_quality_score: 90.0,
        ..Default::default()
    };
    let pipeline = IrisPipeline::new(
        gateway.clone(),
        Arc::new(PromptStore::new()),
        &config,
        AggregationConfig::default(),
    );
    let sinks = Sinks::new();
    let (progress, log) = sinks.callbacks();

    let err = pipeline
        .execute_pipeline(&image(Side::Left), Side::Left, &questionnaire(), progress, log)
        .await
        .unwrap_err();
    assert_eq!(err.code(), StageErrorCode::LowQuality);
    assert_eq!(gateway.calls_for("left").len(), 1);
}

#[tokio::test]
async fn invalid_json_exhausts_retry_budget() {
    let gateway = Arc::new(
        ScriptedGateway::default()
            .script("left", StageId::Step1Geo, vec![ok(GEO_OK)])
            .script("left", StageId::Step2Structural, vec![ok("I think I see a lacuna")])
            .script("left", StageId::Step2Pigment, vec![ok(NO_FINDINGS)]),
    );
    let sinks = Sinks::new();
    let (progress, log) = sinks.callbacks();

    let err = pipeline(gateway.clone())
        .execute_pipeline(&image(Side::Left), Side::Left, &questionnaire(), progress, log)
        .await
        .unwrap_err();

    assert_eq!(err.code(), StageErrorCode::FormatFail);
    assert_eq!(err.stage(), StageId::Step2Structural);
    assert_eq!(gateway.prompts_for("left", StageId::Step2Structural).len(), 3);
    assert!(sinks
        .logs
        .lock()
        .iter()
        .any(|(l, m)| *l == LogLevel::Error && m.contains("FORMAT_FAIL")));
}

#[tokio::test]
async fn fatal_gateway_error_fails_without_retry() {
    let gateway = Arc::new(ScriptedGateway::default().script(
        "left",
        StageId::Step1Geo,
        vec![
            Err(GatewayError::Fatal("401 invalid api key".to_string())),
            ok(GEO_OK),
        ],
    ));
    let sinks = Sinks::new();
    let (progress, log) = sinks.callbacks();

    let err = pipeline(gateway.clone())
        .execute_pipeline(&image(Side::Left), Side::Left, &questionnaire(), progress, log)
        .await
        .unwrap_err();

    assert_eq!(err.code(), StageErrorCode::GatewayFail);
    assert_eq!(gateway.calls_for("left").len(), 1);
}

#[tokio::test]
async fn mismatched_image_side_is_logged() {
    let gateway = Arc::new(
        ScriptedGateway::default()
            .script("right", StageId::Step1Geo, vec![ok(GEO_OK)])
            .script("right", StageId::Step2Structural, vec![ok(NO_FINDINGS)])
            .script("right", StageId::Step2Pigment, vec![ok(NO_FINDINGS)]),
    );
    let sinks = Sinks::new();
    let (progress, log) = sinks.callbacks();

    let analysis = pipeline(gateway)
        .execute_pipeline(&image(Side::Left), Side::Right, &questionnaire(), progress, log)
        .await
        .unwrap();

    assert_eq!(analysis.side, Side::Right);
    assert!(sinks
        .logs
        .lock()
        .iter()
        .any(|(l, m)| *l == LogLevel::Warning && m.contains("tagged as left")));
}

fn both_sides_gateway(right_structural: &str) -> Arc<ScriptedGateway> {
    Arc::new(
        ScriptedGateway::default()
            .script("left", StageId::Step1Geo, vec![ok(GEO_OK)])
            .script("left", StageId::Step2Structural, vec![ok(LACUNA)])
            .script("left", StageId::Step2Pigment, vec![ok(NO_FINDINGS)])
            .script("right", StageId::Step1Geo, vec![ok(GEO_OK)])
            .script("right", StageId::Step2Structural, vec![ok(right_structural)])
            .script("right", StageId::Step2Pigment, vec![ok(NO_FINDINGS)]),
    )
}

#[tokio::test]
async fn report_combines_both_sides() {
    let gateway = both_sides_gateway(NO_FINDINGS);
    let pipeline = pipeline(gateway);
    let assembler = ReportAssembler::new(PartialReportPolicy::RequireBoth, pipeline.prompt_version());
    let sinks = Sinks::new();
    let callbacks = |_side: Side| sinks.callbacks();

    let report = assembler
        .analyze_both(
            &pipeline,
            &image(Side::Left),
            &image(Side::Right),
            &questionnaire(),
            &callbacks,
        )
        .await
        .unwrap();

    assert_eq!(report.prompt_version, "v9");
    assert!(report.failures.is_empty());
    assert_eq!(report.left_eye.as_ref().map(|a| a.overall_health), Some(75));
    assert_eq!(report.right_eye.as_ref().map(|a| a.overall_health), Some(85));
    assert_eq!(report.overall_health, 80);
}

#[tokio::test]
async fn partial_policy_decides_single_side_failures() {
    for (policy, accepted) in [
        (PartialReportPolicy::RequireBoth, false),
        (PartialReportPolicy::AllowPartial, true),
    ] {
        let pipeline = pipeline(both_sides_gateway("not json at all"));
        let assembler = ReportAssembler::new(policy, pipeline.prompt_version());
        let sinks = Sinks::new();
        let callbacks = |_side: Side| sinks.callbacks();

        let result = assembler
            .analyze_both(
                &pipeline,
                &image(Side::Left),
                &image(Side::Right),
                &questionnaire(),
                &callbacks,
            )
            .await;

        if accepted {
            let report = result.unwrap();
            assert!(report.right_eye.is_none());
            assert_eq!(report.failures.len(), 1);
            assert_eq!(report.failures[0].side, Side::Right);
            assert_eq!(report.failures[0].code, "FORMAT_FAIL");
            assert_eq!(report.overall_health, 75);
        } else {
            assert!(matches!(result, Err(ReportError::SideFailed(_))));
        }
    }
}
