use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::image::Side;
use crate::questionnaire::QuestionnaireData;

/// Maximum length (in characters) of any display string in a report.
pub const DISPLAY_TEXT_LIMIT: usize = 60;

/// Number of clock sectors on the iris chart.
pub const ZONE_COUNT: usize = 12;

/// Upper bound on artifacts listed per eye.
pub const MAX_ARTIFACTS: usize = 5;

/// Lowest health score a report may show.
pub const MIN_HEALTH_SCORE: u8 = 30;

/// Truncate to at most `limit` Unicode scalar values.
pub fn truncate_display(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZoneStatus {
    Normal,
    Attention,
    Concern,
}

/// One 30 degree clock sector of the iris.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IrisZone {
    /// 1..=12, clockwise from 12 o'clock
    pub id: u8,
    pub name: String,
    pub organ: String,
    pub status: ZoneStatus,
    pub findings: String,
    /// Degrees, `[start, end]`
    pub angle: [u16; 2],
}

/// A top-ranked finding reshaped for display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    #[serde(rename = "type")]
    pub kind: String,
    /// Clock position, e.g. `"2:00-2:24"`
    pub location: String,
    pub description: String,
    pub severity: Severity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodySystem {
    Digestive,
    Immune,
    Nervous,
    Cardiovascular,
    Detox,
    Endocrine,
}

impl BodySystem {
    /// Fixed report order.
    pub const ALL: [BodySystem; 6] = [
        BodySystem::Digestive,
        BodySystem::Immune,
        BodySystem::Nervous,
        BodySystem::Cardiovascular,
        BodySystem::Detox,
        BodySystem::Endocrine,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BodySystem::Digestive => "digestive",
            BodySystem::Immune => "immune",
            BodySystem::Nervous => "nervous",
            BodySystem::Cardiovascular => "cardiovascular",
            BodySystem::Detox => "detox",
            BodySystem::Endocrine => "endocrine",
        }
    }
}

impl fmt::Display for BodySystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemScore {
    pub system: BodySystem,
    /// 30..=100
    pub score: u8,
    pub description: String,
}

/// Analysis of one eye, produced once per pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IrisAnalysis {
    pub side: Side,
    pub zones: Vec<IrisZone>,
    pub artifacts: Vec<Artifact>,
    pub overall_health: u8,
    pub system_scores: Vec<SystemScore>,
    /// Calibration quality score (0..=100) the analysis was based on
    pub image_quality: f64,
}

impl IrisAnalysis {
    pub fn zones_with_status(&self, status: ZoneStatus) -> usize {
        self.zones.iter().filter(|z| z.status == status).count()
    }

    pub fn system_score(&self, system: BodySystem) -> Option<u8> {
        self.system_scores
            .iter()
            .find(|s| s.system == system)
            .map(|s| s.score)
    }
}

/// Why one side did not produce an analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SideFailure {
    pub side: Side,
    /// Stage identifier, e.g. `step1_geo`
    pub stage: String,
    /// Machine-readable code, e.g. `FORMAT_FAIL`
    pub code: String,
    pub message: String,
}

/// Final report composed from the per-side analyses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisReport {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub prompt_version: String,
    pub questionnaire: QuestionnaireData,
    #[serde(default)]
    pub left_eye: Option<IrisAnalysis>,
    #[serde(default)]
    pub right_eye: Option<IrisAnalysis>,
    #[serde(default)]
    pub failures: Vec<SideFailure>,
    pub overall_health: u8,
    pub system_scores: Vec<SystemScore>,
}

impl AnalysisReport {
    pub fn analysis(&self, side: Side) -> Option<&IrisAnalysis> {
        match side {
            Side::Left => self.left_eye.as_ref(),
            Side::Right => self.right_eye.as_ref(),
        }
    }

    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }
}
