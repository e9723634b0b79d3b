// ABOUTME: Typed output schemas for the calibration and detection stages
// ABOUTME: schemars-derived JSON schemas plus range/consistency validation of LLM output

use irisscope_core::analysis::Severity;
use schemars::{schema_for, JsonSchema};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

use crate::prompts::StageId;

pub const MAX_MINUTE: f64 = 60.0;
pub const MAX_RING: f64 = 12.0;

/// Image quality metrics reported by calibration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Quality {
    /// Overall quality, 0-100
    pub score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sharpness: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub glare: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub occlusion: Option<f64>,
}

/// Circle in image pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Circle {
    pub cx: f64,
    pub cy: f64,
    pub r: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Geometry {
    pub pupil: Circle,
    pub iris: Circle,
    /// Clockwise rotation between image up and anatomical 12 o'clock
    pub clock_offset_deg: f64,
}

/// Output of the `step1_geo` stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Step1Geo {
    /// Whether the image is usable for detection
    pub ok: bool,
    pub quality: Quality,
    /// Required when `ok` is true
    #[serde(default)]
    pub geo: Option<Geometry>,
    #[serde(default)]
    pub reject_reasons: Vec<String>,
}

impl Step1Geo {
    /// Rejection codes; free text and an empty list both become `LOW_QUALITY`.
    pub fn reject_codes(&self) -> Vec<StageErrorCode> {
        let mut codes: Vec<StageErrorCode> = Vec::new();
        for reason in &self.reject_reasons {
            let code = match StageErrorCode::parse(reason.trim()) {
                Some(code) if code.is_quality_gate() => code,
                _ => StageErrorCode::LowQuality,
            };
            if !codes.contains(&code) {
                codes.push(code);
            }
        }
        if codes.is_empty() {
            codes.push(StageErrorCode::LowQuality);
        }
        codes
    }
}

/// Every feature type the detectors may report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    Lacuna,
    Crypt,
    Defect,
    RadialFurrow,
    ContractionFurrow,
    LymphaticRosary,
    ScurfRim,
    Transversal,
    PigmentSpot,
    PigmentCloud,
    Heterochromia,
    SodiumRing,
}

impl FindingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FindingKind::Lacuna => "lacuna",
            FindingKind::Crypt => "crypt",
            FindingKind::Defect => "defect",
            FindingKind::RadialFurrow => "radial_furrow",
            FindingKind::ContractionFurrow => "contraction_furrow",
            FindingKind::LymphaticRosary => "lymphatic_rosary",
            FindingKind::ScurfRim => "scurf_rim",
            FindingKind::Transversal => "transversal",
            FindingKind::PigmentSpot => "pigment_spot",
            FindingKind::PigmentCloud => "pigment_cloud",
            FindingKind::Heterochromia => "heterochromia",
            FindingKind::SodiumRing => "sodium_ring",
        }
    }

    pub fn is_pigment(&self) -> bool {
        matches!(
            self,
            FindingKind::PigmentSpot
                | FindingKind::PigmentCloud
                | FindingKind::Heterochromia
                | FindingKind::SodiumRing
        )
    }
}

impl fmt::Display for FindingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum PigmentSize {
    Small,
    Medium,
    Large,
}

impl PigmentSize {
    pub fn severity(&self) -> Severity {
        match self {
            PigmentSize::Small => Severity::Low,
            PigmentSize::Medium => Severity::Medium,
            PigmentSize::Large => Severity::High,
        }
    }
}

/// A single detected iris feature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Finding {
    #[serde(rename = "type")]
    pub kind: FindingKind,
    /// Clock minutes `[start, end]`; `start > end` wraps through 12 o'clock
    pub minute_range: [f64; 2],
    /// Rings `[inner, outer]`, 0 = pupil edge, 12 = limbus
    pub ring_range: [f64; 2],
    /// Structural findings only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    /// Pigment findings only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<PigmentSize>,
    pub confidence: f64,
    #[serde(default)]
    pub notes: String,
}

impl Finding {
    /// Severity, or the size-derived severity for pigment findings
    pub fn effective_severity(&self) -> Severity {
        self.severity
            .or_else(|| self.size.map(|size| size.severity()))
            .unwrap_or(Severity::Low)
    }

    pub fn wraps(&self) -> bool {
        self.minute_range[0] > self.minute_range[1]
    }

    /// Non-wrapping minute spans covered by this finding
    pub fn minute_spans(&self) -> Vec<(f64, f64)> {
        let [start, end] = self.minute_range;
        if self.wraps() {
            vec![(start, MAX_MINUTE), (0.0, end)]
        } else {
            vec![(start, end)]
        }
    }

    fn validate(&self, stage: StageId) -> Result<(), String> {
        let in_range = |v: f64, max: f64| v.is_finite() && (0.0..=max).contains(&v);

        if !self.minute_range.iter().all(|m| in_range(*m, MAX_MINUTE)) {
            return Err(format!(
                "{}: minuteRange {:?} outside 0-60",
                self.kind, self.minute_range
            ));
        }
        let [inner, outer] = self.ring_range;
        if !in_range(inner, MAX_RING) || !in_range(outer, MAX_RING) || inner > outer {
            return Err(format!(
                "{}: ringRange {:?} must satisfy 0 <= inner <= outer <= 12",
                self.kind, self.ring_range
            ));
        }
        if !in_range(self.confidence, 1.0) {
            return Err(format!(
                "{}: confidence {} outside 0-1",
                self.kind, self.confidence
            ));
        }

        match stage {
            StageId::Step2Structural => {
                if self.kind.is_pigment() {
                    return Err(format!("{} is not a structural feature", self.kind));
                }
                if self.severity.is_none() {
                    return Err(format!("{}: structural finding without severity", self.kind));
                }
            }
            StageId::Step2Pigment => {
                if !self.kind.is_pigment() {
                    return Err(format!("{} is not a pigment feature", self.kind));
                }
                if self.size.is_none() {
                    return Err(format!("{}: pigment finding without size", self.kind));
                }
            }
            StageId::Step1Geo => return Err("calibration does not report findings".to_string()),
        }
        Ok(())
    }
}

/// Output of both detection stages
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DetectionResult {
    pub findings: Vec<Finding>,
}

/// Typed stage payload: parsed from LLM text, then checked before use.
pub trait StageSchema: DeserializeOwned + Serialize + JsonSchema {
    fn validate(&self, stage: StageId) -> Result<(), String>;
}

impl StageSchema for Step1Geo {
    fn validate(&self, _stage: StageId) -> Result<(), String> {
        let unit = |name: &str, v: Option<f64>| match v {
            Some(v) if !(v.is_finite() && (0.0..=1.0).contains(&v)) => {
                Err(format!("quality.{} {} outside 0-1", name, v))
            }
            _ => Ok(()),
        };

        let score = self.quality.score;
        if !(score.is_finite() && (0.0..=100.0).contains(&score)) {
            return Err(format!("quality.score {} outside 0-100", score));
        }
        unit("sharpness", self.quality.sharpness)?;
        unit("glare", self.quality.glare)?;
        unit("occlusion", self.quality.occlusion)?;

        if self.ok {
            let geo = self
                .geo
                .as_ref()
                .ok_or_else(|| "geo is required when ok=true".to_string())?;
            if !(geo.pupil.r > 0.0 && geo.iris.r > 0.0) {
                return Err("circle radii must be positive".to_string());
            }
            if geo.iris.r <= geo.pupil.r {
                return Err(format!(
                    "iris radius {} must exceed pupil radius {}",
                    geo.iris.r, geo.pupil.r
                ));
            }
            if !geo.clock_offset_deg.is_finite() {
                return Err("clockOffsetDeg must be finite".to_string());
            }
        }
        Ok(())
    }
}

impl StageSchema for DetectionResult {
    fn validate(&self, stage: StageId) -> Result<(), String> {
        self.findings
            .iter()
            .enumerate()
            .try_for_each(|(i, finding)| {
                finding
                    .validate(stage)
                    .map_err(|e| format!("findings[{}]: {}", i, e))
            })
    }
}

/// JSON schema of a stage's expected output
pub fn response_schema(stage: StageId) -> Value {
    match stage {
        StageId::Step1Geo => schema_for!(Step1Geo).to_value(),
        StageId::Step2Structural | StageId::Step2Pigment => {
            schema_for!(DetectionResult).to_value()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageErrorCode {
    /// Output was not valid JSON or did not match the schema
    FormatFail,
    /// A required upstream result was missing or unusable
    PrereqFail,
    LowQuality,
    NoLimbus,
    NoPupilEdge,
    /// The LLM could not be reached or refused the request
    GatewayFail,
}

impl StageErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageErrorCode::FormatFail => "FORMAT_FAIL",
            StageErrorCode::PrereqFail => "PREREQ_FAIL",
            StageErrorCode::LowQuality => "LOW_QUALITY",
            StageErrorCode::NoLimbus => "NO_LIMBUS",
            StageErrorCode::NoPupilEdge => "NO_PUPIL_EDGE",
            StageErrorCode::GatewayFail => "GATEWAY_FAIL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "FORMAT_FAIL" => Some(StageErrorCode::FormatFail),
            "PREREQ_FAIL" => Some(StageErrorCode::PrereqFail),
            "LOW_QUALITY" => Some(StageErrorCode::LowQuality),
            "NO_LIMBUS" => Some(StageErrorCode::NoLimbus),
            "NO_PUPIL_EDGE" => Some(StageErrorCode::NoPupilEdge),
            "GATEWAY_FAIL" => Some(StageErrorCode::GatewayFail),
            _ => None,
        }
    }

    /// Calibration rejections; the same image fails the same way every time
    pub fn is_quality_gate(&self) -> bool {
        matches!(
            self,
            StageErrorCode::LowQuality | StageErrorCode::NoLimbus | StageErrorCode::NoPupilEdge
        )
    }
}

impl fmt::Display for StageErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal failure of one stage
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[error("{stage} failed ({code}): {message}")]
pub struct StageError {
    pub stage: StageId,
    pub code: StageErrorCode,
    pub message: String,
    pub can_retry: bool,
}

impl StageError {
    pub fn new(stage: StageId, code: StageErrorCode, message: impl Into<String>) -> Self {
        Self {
            stage,
            code,
            message: message.into(),
            can_retry: false,
        }
    }

    pub fn retryable(mut self) -> Self {
        self.can_retry = true;
        self
    }

    pub fn format(stage: StageId, message: impl Into<String>) -> Self {
        Self::new(stage, StageErrorCode::FormatFail, message).retryable()
    }
}

/// `{ "error": ... }` envelope a model may return instead of stage output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResult {
    pub error: ReportedError,
}

/// Body of the error envelope: a bare message or `{ code, message, canRetry }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReportedError {
    Message(String),
    #[serde(rename_all = "camelCase")]
    Detailed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        can_retry: Option<bool>,
    },
}

impl ErrorResult {
    /// Unknown or missing codes become `FORMAT_FAIL`. Format and gateway
    /// failures stay retryable unless a known code says `canRetry: false`;
    /// quality-gate and prerequisite codes never retry.
    pub fn into_stage_error(self, stage: StageId) -> StageError {
        let (code, message, can_retry) = match self.error {
            ReportedError::Message(message) => (None, Some(message), None),
            ReportedError::Detailed {
                code,
                message,
                can_retry,
            } => (code.as_deref().and_then(StageErrorCode::parse), message, can_retry),
        };

        let can_retry = match code {
            Some(c) if c.is_quality_gate() || c == StageErrorCode::PrereqFail => false,
            Some(_) => can_retry.unwrap_or(true),
            None => true,
        };

        StageError {
            stage,
            code: code.unwrap_or(StageErrorCode::FormatFail),
            message: message
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| "model reported an error".to_string()),
            can_retry,
        }
    }
}

/// Successful, validated output of one stage
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StageOutput {
    Calibration(Step1Geo),
    Detection(DetectionResult),
}

impl StageOutput {
    pub fn as_calibration(&self) -> Option<&Step1Geo> {
        match self {
            StageOutput::Calibration(geo) => Some(geo),
            StageOutput::Detection(_) => None,
        }
    }

    pub fn into_detection(self) -> Option<DetectionResult> {
        match self {
            StageOutput::Detection(result) => Some(result),
            StageOutput::Calibration(_) => None,
        }
    }

    pub fn into_calibration(self) -> Option<Step1Geo> {
        match self {
            StageOutput::Calibration(geo) => Some(geo),
            StageOutput::Detection(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn structural(kind: &str) -> Value {
        json!({
            "type": kind,
            "minuteRange": [10, 12],
            "ringRange": [3, 5],
            "severity": "medium",
            "confidence": 0.7,
            "notes": "small opening"
        })
    }

    #[test]
    fn test_step1_schema_required_fields() {
        let schema = schema_for!(Step1Geo);
        let required = schema.as_value()["required"].clone();
        let required: Vec<String> = serde_json::from_value(required).unwrap();
        assert!(required.contains(&"ok".to_string()));
        assert!(required.contains(&"quality".to_string()));
        assert!(!required.contains(&"geo".to_string()));
    }

    #[test]
    fn test_detection_schema_lists_finding_types() {
        let text = response_schema(StageId::Step2Pigment).to_string();
        assert!(text.contains("minuteRange"));
        assert!(text.contains("sodium_ring"));
        assert!(text.contains("lymphatic_rosary"));
    }

    #[test]
    fn test_step1_validation() {
        let ok: Step1Geo = serde_json::from_value(json!({
            "ok": true,
            "quality": {"score": 82, "sharpness": 0.9},
            "geo": {
                "pupil": {"cx": 100, "cy": 100, "r": 20},
                "iris": {"cx": 100, "cy": 100, "r": 60},
                "clockOffsetDeg": 0
            },
            "rejectReasons": []
        }))
        .unwrap();
        assert!(ok.validate(StageId::Step1Geo).is_ok());

        let mut inverted = ok.clone();
        if let Some(geo) = inverted.geo.as_mut() {
            geo.iris.r = 10.0;
        }
        assert!(inverted.validate(StageId::Step1Geo).is_err());

        let mut missing = ok.clone();
        missing.geo = None;
        assert!(missing.validate(StageId::Step1Geo).is_err());

        let mut bad_score = ok;
        bad_score.quality.score = 140.0;
        assert!(bad_score.validate(StageId::Step1Geo).is_err());
    }

    #[test]
    fn test_rejected_calibration_needs_no_geometry() {
        let geo: Step1Geo = serde_json::from_value(json!({
            "ok": false,
            "quality": {"score": 22},
            "geo": null,
            "rejectReasons": ["NO_LIMBUS", "too dark", "LOW_QUALITY"]
        }))
        .unwrap();
        assert!(geo.validate(StageId::Step1Geo).is_ok());
        assert_eq!(
            geo.reject_codes(),
            vec![StageErrorCode::NoLimbus, StageErrorCode::LowQuality]
        );
    }

    #[test]
    fn test_structural_findings_require_severity() {
        let result: DetectionResult =
            serde_json::from_value(json!({"findings": [structural("lacuna")]})).unwrap();
        assert!(result.validate(StageId::Step2Structural).is_ok());
        // wrong detector
        assert!(result.validate(StageId::Step2Pigment).is_err());

        let mut no_severity = result;
        no_severity.findings[0].severity = None;
        assert!(no_severity.validate(StageId::Step2Structural).is_err());
    }

    #[test]
    fn test_unknown_finding_type_rejected() {
        let parsed: Result<DetectionResult, _> =
            serde_json::from_value(json!({"findings": [structural("halo")]}));
        assert!(parsed.is_err());
    }

    #[test]
    fn test_range_validation() {
        let mut finding: Finding = serde_json::from_value(structural("crypt")).unwrap();
        finding.ring_range = [6.0, 4.0];
        assert!(finding.validate(StageId::Step2Structural).is_err());

        finding.ring_range = [0.0, 12.0];
        finding.minute_range = [58.0, 61.0];
        assert!(finding.validate(StageId::Step2Structural).is_err());

        finding.minute_range = [58.0, 2.0];
        finding.confidence = 1.2;
        assert!(finding.validate(StageId::Step2Structural).is_err());

        finding.confidence = 1.0;
        assert!(finding.validate(StageId::Step2Structural).is_ok());
        assert!(finding.wraps());
        assert_eq!(finding.minute_spans(), vec![(58.0, 60.0), (0.0, 2.0)]);
    }

    #[test]
    fn test_pigment_size_maps_to_severity() {
        let finding: Finding = serde_json::from_value(json!({
            "type": "pigment_spot",
            "minuteRange": [20, 21],
            "ringRange": [8, 9],
            "size": "large",
            "confidence": 0.65
        }))
        .unwrap();
        assert!(finding.validate(StageId::Step2Pigment).is_ok());
        assert_eq!(finding.effective_severity(), Severity::High);
        assert_eq!(finding.notes, "");
    }

    #[test]
    fn test_error_envelope_bare_message_is_retryable_format_fail() {
        let envelope: ErrorResult =
            serde_json::from_value(json!({"error": "could not parse image"})).unwrap();
        let err = envelope.into_stage_error(StageId::Step1Geo);
        assert_eq!(err.code, StageErrorCode::FormatFail);
        assert_eq!(err.message, "could not parse image");
        assert!(err.can_retry);
    }

    #[test]
    fn test_error_envelope_retry_rules() {
        let decode = |value: serde_json::Value| {
            serde_json::from_value::<ErrorResult>(value)
                .unwrap()
                .into_stage_error(StageId::Step2Pigment)
        };

        let unknown = decode(json!({"error": {"code": "WHATEVER", "canRetry": false}}));
        assert_eq!(unknown.code, StageErrorCode::FormatFail);
        assert!(unknown.can_retry);

        let silent = decode(json!({"error": {"code": "FORMAT_FAIL"}}));
        assert!(silent.can_retry);

        let declined = decode(json!({"error": {"code": "GATEWAY_FAIL", "canRetry": false}}));
        assert_eq!(declined.code, StageErrorCode::GatewayFail);
        assert!(!declined.can_retry);

        let gate = decode(json!({"error": {"code": "NO_PUPIL_EDGE", "canRetry": true}}));
        assert_eq!(gate.code, StageErrorCode::NoPupilEdge);
        assert!(!gate.can_retry);

        let prereq = decode(json!({"error": {"code": "PREREQ_FAIL", "message": "no geo"}}));
        assert!(!prereq.can_retry);
        assert_eq!(prereq.message, "no geo");
    }

    #[test]
    fn test_error_result_wire_format() {
        let result = ErrorResult {
            error: ReportedError::Detailed {
                code: Some("FORMAT_FAIL".to_string()),
                message: Some("not json".to_string()),
                can_retry: Some(true),
            },
        };
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["error"]["code"], "FORMAT_FAIL");
        assert_eq!(value["error"]["canRetry"], true);
    }
}
