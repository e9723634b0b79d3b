use serde::{Deserialize, Serialize};
use std::fmt::Write;

const NOT_SPECIFIED: &str = "not specified";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sex {
    Male,
    Female,
    Other,
}

impl Sex {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sex::Male => "male",
            Sex::Female => "female",
            Sex::Other => "other",
        }
    }
}

/// Demographic and lifestyle answers collected before an analysis.
///
/// Read-only input to the pipeline. Every field is optional; the prompt
/// summary renders missing answers as "not specified" so that two runs with
/// the same answers always produce the same prompt text.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionnaireData {
    #[serde(default)]
    pub age: Option<u32>,
    #[serde(default)]
    pub sex: Option<Sex>,
    /// Body weight in kilograms
    #[serde(default)]
    pub weight: Option<f64>,
    /// Height in centimetres
    #[serde(default)]
    pub height: Option<f64>,
    #[serde(default)]
    pub goals: Vec<String>,
    #[serde(default)]
    pub complaints: Vec<String>,
    #[serde(default)]
    pub sleep_hours: Option<f64>,
    /// Self-reported stress, 1 (none) to 10 (extreme)
    #[serde(default)]
    pub stress_level: Option<u8>,
    #[serde(default)]
    pub physical_activity: Option<String>,
    #[serde(default)]
    pub diet: Option<String>,
    /// Daily water intake in litres
    #[serde(default)]
    pub water_intake: Option<f64>,
    #[serde(default)]
    pub smoking: Option<bool>,
    #[serde(default)]
    pub alcohol: Option<String>,
    #[serde(default)]
    pub chronic_conditions: Vec<String>,
    #[serde(default)]
    pub medications: Vec<String>,
    #[serde(default)]
    pub allergies: Vec<String>,
}

impl QuestionnaireData {
    /// Body mass index, when both weight and height are present.
    pub fn bmi(&self) -> Option<f64> {
        match (self.weight, self.height) {
            (Some(w), Some(h)) if w > 0.0 && h > 0.0 => {
                let m = h / 100.0;
                Some((w / (m * m) * 10.0).round() / 10.0)
            }
            _ => None,
        }
    }

    pub fn age_text(&self) -> String {
        self.age
            .map(|a| a.to_string())
            .unwrap_or_else(|| NOT_SPECIFIED.to_string())
    }

    pub fn sex_text(&self) -> &'static str {
        self.sex.map(|s| s.as_str()).unwrap_or(NOT_SPECIFIED)
    }

    /// Stable, line-oriented rendering used as the `{{questionnaire}}` prompt variable.
    pub fn prompt_summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Age: {}", self.age_text());
        let _ = writeln!(out, "Sex: {}", self.sex_text());
        let _ = writeln!(out, "Weight (kg): {}", opt_num(self.weight));
        let _ = writeln!(out, "Height (cm): {}", opt_num(self.height));
        let _ = writeln!(out, "BMI: {}", opt_num(self.bmi()));
        let _ = writeln!(out, "Goals: {}", list(&self.goals));
        let _ = writeln!(out, "Complaints: {}", list(&self.complaints));
        let _ = writeln!(out, "Sleep (hours): {}", opt_num(self.sleep_hours));
        let _ = writeln!(
            out,
            "Stress (1-10): {}",
            self.stress_level
                .map(|s| s.to_string())
                .unwrap_or_else(|| NOT_SPECIFIED.to_string())
        );
        let _ = writeln!(
            out,
            "Physical activity: {}",
            opt_text(&self.physical_activity)
        );
        let _ = writeln!(out, "Diet: {}", opt_text(&self.diet));
        let _ = writeln!(out, "Water (l/day): {}", opt_num(self.water_intake));
        let _ = writeln!(
            out,
            "Smoking: {}",
            match self.smoking {
                Some(true) => "yes",
                Some(false) => "no",
                None => NOT_SPECIFIED,
            }
        );
        let _ = writeln!(out, "Alcohol: {}", opt_text(&self.alcohol));
        let _ = writeln!(
            out,
            "Chronic conditions: {}",
            list(&self.chronic_conditions)
        );
        let _ = writeln!(out, "Medications: {}", list(&self.medications));
        let _ = write!(out, "Allergies: {}", list(&self.allergies));
        out
    }
}

fn opt_num(v: Option<f64>) -> String {
    v.map(|n| n.to_string())
        .unwrap_or_else(|| NOT_SPECIFIED.to_string())
}

fn opt_text(v: &Option<String>) -> String {
    match v.as_deref().map(str::trim) {
        Some(s) if !s.is_empty() => s.to_string(),
        _ => NOT_SPECIFIED.to_string(),
    }
}

fn list(items: &[String]) -> String {
    let cleaned: Vec<&str> = items
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect();
    if cleaned.is_empty() {
        NOT_SPECIFIED.to_string()
    } else {
        cleaned.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_questionnaire_summary() {
        let q = QuestionnaireData::default();
        let summary = q.prompt_summary();
        assert!(summary.starts_with("Age: not specified\n"));
        assert!(summary.ends_with("Allergies: not specified"));
        assert!(!summary.contains("{{"));
    }

    #[test]
    fn test_bmi() {
        let q = QuestionnaireData {
            weight: Some(80.0),
            height: Some(180.0),
            ..Default::default()
        };
        assert_eq!(q.bmi(), Some(24.7));
        assert_eq!(QuestionnaireData::default().bmi(), None);
    }

    #[test]
    fn test_camel_case_deserialization() {
        let q: QuestionnaireData = serde_json::from_str(
            r#"{"age": 41, "sex": "female", "sleepHours": 6.5, "goals": ["energy", " "]}"#,
        )
        .unwrap();
        assert_eq!(q.age, Some(41));
        assert_eq!(q.sex, Some(Sex::Female));
        assert_eq!(q.sleep_hours, Some(6.5));
        assert!(q.prompt_summary().contains("Goals: energy\n"));
    }
}
