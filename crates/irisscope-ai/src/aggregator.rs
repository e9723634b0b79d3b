// ABOUTME: Maps calibration and detection output onto the 12-zone chart
// ABOUTME: Derives zone status, ranked artifacts, per-system scores and overall health

use irisscope_core::analysis::{
    truncate_display, Artifact, BodySystem, IrisAnalysis, IrisZone, Severity, SystemScore,
    ZoneStatus, DISPLAY_TEXT_LIMIT, MAX_ARTIFACTS, MIN_HEALTH_SCORE, ZONE_COUNT,
};
use irisscope_core::config_manager::AggregationConfig;
use irisscope_core::image::Side;

use crate::stage_schemas::{DetectionResult, Finding, Step1Geo, MAX_MINUTE};

pub const CLEAR_ZONE_TEXT: &str = "Visually clear";
pub const GOOD_CONDITION_TEXT: &str = "Good condition";

const MINUTES_PER_ZONE: f64 = MAX_MINUTE / ZONE_COUNT as f64;
const DEGREES_PER_ZONE: u16 = 30;

/// (name, organ) per zone id 1..=12
type ZoneChart = [(&'static str, &'static str); ZONE_COUNT];

const RIGHT_EYE_CHART: ZoneChart = [
    ("Head", "Brain"),
    ("Head", "Sinuses and sensory organs"),
    ("Thorax", "Lungs and bronchi"),
    ("Thorax", "Chest wall and thymus"),
    ("Abdomen", "Liver and gallbladder"),
    ("Abdomen", "Duodenum"),
    ("Abdomen", "Ascending colon"),
    ("Pelvis", "Kidney"),
    ("Pelvis", "Adrenal gland"),
    ("Upper abdomen", "Pancreas"),
    ("Neck", "Thyroid"),
    ("Head", "Pituitary"),
];

const LEFT_EYE_CHART: ZoneChart = [
    ("Head", "Pituitary"),
    ("Neck", "Thyroid"),
    ("Thorax", "Heart"),
    ("Upper abdomen", "Spleen"),
    ("Pelvis", "Adrenal gland"),
    ("Pelvis", "Kidney"),
    ("Abdomen", "Descending colon"),
    ("Abdomen", "Stomach"),
    ("Abdomen", "Pancreas tail"),
    ("Thorax", "Chest wall and thymus"),
    ("Thorax", "Lungs and bronchi"),
    ("Head", "Brain"),
];

fn chart(side: Side) -> &'static ZoneChart {
    match side {
        Side::Left => &LEFT_EYE_CHART,
        Side::Right => &RIGHT_EYE_CHART,
    }
}

/// Minute span `[start, end)` of zone `id` (1..=12)
pub fn zone_minutes(id: u8) -> (f64, f64) {
    let start = f64::from(id - 1) * MINUTES_PER_ZONE;
    (start, start + MINUTES_PER_ZONE)
}

/// True when any of the finding's spans touches the zone.
///
/// A span ending exactly on a zone's start counts for that zone; one starting
/// exactly on a zone's end does not, except at 60 which closes the last zone.
pub fn finding_overlaps_zone(finding: &Finding, id: u8) -> bool {
    let (zone_start, zone_end) = zone_minutes(id);
    finding.minute_spans().into_iter().any(|(start, end)| {
        let starts_before_end = start < zone_end || (zone_end >= MAX_MINUTE && start <= zone_end);
        starts_before_end && end >= zone_start
    })
}

/// `minute -> "H:MM"` on a 60-minute dial, 5 minutes per hour mark
pub fn minute_to_clock(minute: f64) -> String {
    let minute = minute.clamp(0.0, MAX_MINUTE);
    let mut hour = (minute / MINUTES_PER_ZONE).floor() as u32;
    let mut mins = ((minute % MINUTES_PER_ZONE) * 12.0).round() as u32;
    if mins >= 60 {
        hour += 1;
        mins = 0;
    }
    let hour = match hour % 12 {
        0 => 12,
        h => h,
    };
    format!("{}:{:02}", hour, mins)
}

fn describe_counts(concern: usize, attention: usize) -> String {
    let plural = |n: usize, word: &str| {
        if n == 1 {
            format!("{} {} zone", n, word)
        } else {
            format!("{} {} zones", n, word)
        }
    };
    match (concern, attention) {
        (0, 0) => GOOD_CONDITION_TEXT.to_string(),
        (c, 0) => plural(c, "concern"),
        (0, a) => plural(a, "attention"),
        (c, a) => format!("{}, {}", plural(c, "concern"), plural(a, "attention")),
    }
}

fn finding_label(finding: &Finding) -> String {
    let notes = finding.notes.trim();
    if notes.is_empty() {
        finding.kind.as_str().to_string()
    } else {
        format!("{} ({})", finding.kind.as_str(), notes)
    }
}

/// Pure, deterministic aggregation of one side's stage outputs
#[derive(Debug, Clone, Default)]
pub struct FindingAggregator {
    config: AggregationConfig,
}

impl FindingAggregator {
    pub fn new(config: AggregationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AggregationConfig {
        &self.config
    }

    pub fn aggregate(
        &self,
        geo: &Step1Geo,
        structural: &DetectionResult,
        pigment: &DetectionResult,
        side: Side,
    ) -> IrisAnalysis {
        let findings: Vec<&Finding> = structural
            .findings
            .iter()
            .chain(pigment.findings.iter())
            .collect();

        let zones = self.map_zones(&findings, side);
        let artifacts = self.select_artifacts(&findings);
        let system_scores = self.score_systems(&zones);
        let overall_health = self.overall_health(&system_scores, &zones);

        IrisAnalysis {
            side,
            zones,
            artifacts,
            overall_health,
            system_scores,
            image_quality: geo.quality.score,
        }
    }

    fn zone_status(&self, findings: &[&Finding]) -> ZoneStatus {
        if findings.is_empty() {
            return ZoneStatus::Normal;
        }
        let concern = findings.iter().any(|f| {
            f.effective_severity() == Severity::High || f.confidence > self.config.concern_confidence
        });
        if concern {
            ZoneStatus::Concern
        } else {
            ZoneStatus::Attention
        }
    }

    fn map_zones(&self, findings: &[&Finding], side: Side) -> Vec<IrisZone> {
        chart(side)
            .iter()
            .zip(1u8..)
            .map(|((name, organ), id)| {
                let hits: Vec<&Finding> = findings
                    .iter()
                    .copied()
                    .filter(|f| finding_overlaps_zone(f, id))
                    .collect();

                let text = if hits.is_empty() {
                    CLEAR_ZONE_TEXT.to_string()
                } else {
                    let labels: Vec<String> = hits.iter().take(2).map(|f| finding_label(f)).collect();
                    truncate_display(&labels.join("; "), DISPLAY_TEXT_LIMIT)
                };

                let start = u16::from(id - 1) * DEGREES_PER_ZONE;
                IrisZone {
                    id,
                    name: name.to_string(),
                    organ: organ.to_string(),
                    status: self.zone_status(&hits),
                    findings: text,
                    angle: [start, start + DEGREES_PER_ZONE],
                }
            })
            .collect()
    }

    fn select_artifacts(&self, findings: &[&Finding]) -> Vec<Artifact> {
        let mut ranked: Vec<&Finding> = findings
            .iter()
            .copied()
            .filter(|f| f.confidence >= self.config.min_artifact_confidence)
            .collect();
        // Stable: equal confidences keep structural-before-pigment order
        ranked.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

        ranked
            .into_iter()
            .take(self.config.max_artifacts.min(MAX_ARTIFACTS))
            .map(|f| {
                let [start, end] = f.minute_range;
                let description = if f.notes.trim().is_empty() {
                    f.kind.as_str().replace('_', " ")
                } else {
                    f.notes.trim().to_string()
                };
                Artifact {
                    kind: f.kind.as_str().to_string(),
                    location: format!("{}-{}", minute_to_clock(start), minute_to_clock(end)),
                    description: truncate_display(&description, DISPLAY_TEXT_LIMIT),
                    severity: f.effective_severity(),
                }
            })
            .collect()
    }

    fn clamp_score(&self, score: i32) -> u8 {
        let min = i32::from(self.config.min_score.max(MIN_HEALTH_SCORE));
        let max = i32::from(self.config.max_score);
        score.clamp(min, max.max(min)) as u8
    }

    fn score_systems(&self, zones: &[IrisZone]) -> Vec<SystemScore> {
        BodySystem::ALL
            .iter()
            .map(|&system| {
                let mapped = self.config.system_zones.zones_for(system);
                let status_count = |status: ZoneStatus| {
                    zones
                        .iter()
                        .filter(|z| mapped.contains(&z.id) && z.status == status)
                        .count()
                };
                let concern = status_count(ZoneStatus::Concern);
                let attention = status_count(ZoneStatus::Attention);

                let score = self
                    .config
                    .base_system_score
                    .saturating_sub(penalty(self.config.system_concern_penalty, concern))
                    .saturating_sub(penalty(self.config.system_attention_penalty, attention));

                SystemScore {
                    system,
                    score: self.clamp_score(score),
                    description: describe_counts(concern, attention),
                }
            })
            .collect()
    }

    fn overall_health(&self, scores: &[SystemScore], zones: &[IrisZone]) -> u8 {
        if scores.is_empty() {
            return self.clamp_score(self.config.base_system_score);
        }
        let total: u32 = scores.iter().map(|s| u32::from(s.score)).sum();
        let mean = (f64::from(total) / scores.len() as f64).round() as i32;

        let concern = zones.iter().filter(|z| z.status == ZoneStatus::Concern).count();
        let attention = zones
            .iter()
            .filter(|z| z.status == ZoneStatus::Attention)
            .count();

        self.clamp_score(
            mean.saturating_sub(penalty(self.config.overall_concern_penalty, concern))
                .saturating_sub(penalty(self.config.overall_attention_penalty, attention)),
        )
    }
}

fn penalty(per_zone: i32, zones: usize) -> i32 {
    per_zone.saturating_mul(i32::try_from(zones).unwrap_or(i32::MAX))
}
