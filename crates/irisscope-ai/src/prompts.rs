// ABOUTME: Versioned, checksummed prompt template store for the analysis stages
// ABOUTME: Built-in v9 templates with optional per-stage overrides loaded from disk

use crate::stage_prompts::{
    PROMPT_VERSION, STEP1_GEO_PROMPT, STEP2_PIGMENT_PROMPT, STEP2_STRUCTURAL_PROMPT,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// LLM-backed pipeline stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    /// Geometry calibration and quality gate
    Step1Geo,
    /// Structural feature detection
    Step2Structural,
    /// Pigment feature detection
    Step2Pigment,
}

impl StageId {
    pub const ALL: [StageId; 3] = [
        StageId::Step1Geo,
        StageId::Step2Structural,
        StageId::Step2Pigment,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageId::Step1Geo => "step1_geo",
            StageId::Step2Structural => "step2_structural",
            StageId::Step2Pigment => "step2_pigment",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|stage| stage.as_str() == s)
    }

    /// Human-readable name used in progress events and logs
    pub fn display_name(&self) -> &'static str {
        match self {
            StageId::Step1Geo => "Geometry calibration",
            StageId::Step2Structural => "Structural detection",
            StageId::Step2Pigment => "Pigment detection",
        }
    }

    /// Detection stages only make sense on a calibrated, accepted image
    pub fn requires_calibration(&self) -> bool {
        !matches!(self, StageId::Step1Geo)
    }

    /// Every stage looks at the iris image
    pub fn requires_image(&self) -> bool {
        true
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("No prompt template registered for stage {0}")]
    Missing(StageId),

    #[error("Failed to read prompt override {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Prompt override for {0} is empty")]
    Empty(StageId),
}

/// A single stage template with its provenance
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromptTemplate {
    pub stage: StageId,
    pub version: String,
    pub text: String,
    /// First 12 hex chars of the SHA-256 of `text`
    pub checksum: String,
    /// True when the text came from an override instead of the built-in set
    pub overridden: bool,
}

impl PromptTemplate {
    fn new(stage: StageId, version: &str, text: String, overridden: bool) -> Self {
        let checksum = checksum(&text);
        Self {
            stage,
            version: version.to_string(),
            text,
            checksum,
            overridden,
        }
    }
}

pub fn checksum(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    digest
        .iter()
        .take(6)
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Read-only mapping from stage to template once constructed
#[derive(Debug, Clone)]
pub struct PromptStore {
    version: String,
    templates: HashMap<StageId, PromptTemplate>,
}

impl PromptStore {
    /// Store with the built-in templates
    pub fn new() -> Self {
        let mut templates = HashMap::new();
        for (stage, text) in [
            (StageId::Step1Geo, STEP1_GEO_PROMPT),
            (StageId::Step2Structural, STEP2_STRUCTURAL_PROMPT),
            (StageId::Step2Pigment, STEP2_PIGMENT_PROMPT),
        ] {
            templates.insert(
                stage,
                PromptTemplate::new(stage, PROMPT_VERSION, text.to_string(), false),
            );
        }
        Self {
            version: PROMPT_VERSION.to_string(),
            templates,
        }
    }

    /// Replace one stage's template
    pub fn with_override(mut self, stage: StageId, text: impl Into<String>) -> Self {
        let template = PromptTemplate::new(stage, &self.version, text.into(), true);
        debug!(
            "Prompt override for {}: checksum {}",
            stage, template.checksum
        );
        self.templates.insert(stage, template);
        self
    }

    /// Apply `<stage_id>.txt` overrides found in `dir`; missing files keep the built-ins.
    pub fn load_overrides(mut self, dir: &Path) -> Result<Self, PromptError> {
        for stage in StageId::ALL {
            let path = dir.join(format!("{}.txt", stage.as_str()));
            if !path.exists() {
                continue;
            }
            let text = std::fs::read_to_string(&path).map_err(|source| PromptError::Io {
                path: path.clone(),
                source,
            })?;
            if text.trim().is_empty() {
                return Err(PromptError::Empty(stage));
            }
            info!("Loaded prompt override {}", path.display());
            self = self.with_override(stage, text);
        }
        Ok(self)
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn get(&self, stage: StageId) -> Result<&PromptTemplate, PromptError> {
        self.templates
            .get(&stage)
            .ok_or(PromptError::Missing(stage))
    }

    /// All templates in stage order
    pub fn templates(&self) -> Vec<&PromptTemplate> {
        StageId::ALL
            .iter()
            .filter_map(|stage| self.templates.get(stage))
            .collect()
    }
}

impl Default for PromptStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpolate::placeholders;

    #[test]
    fn test_stage_id_round_trip() {
        for stage in StageId::ALL {
            assert_eq!(StageId::parse(stage.as_str()), Some(stage));
        }
        assert_eq!(StageId::parse("step3"), None);
        assert!(!StageId::Step1Geo.requires_calibration());
        assert!(StageId::Step2Pigment.requires_calibration());
    }

    #[test]
    fn test_builtin_templates_loaded() {
        let store = PromptStore::new();
        assert_eq!(store.version(), "v9");
        let templates = store.templates();
        assert_eq!(templates.len(), 3);
        for template in templates {
            assert_eq!(template.checksum.len(), 12);
            assert!(!template.overridden);
        }
    }

    #[test]
    fn test_detection_templates_embed_calibration() {
        let store = PromptStore::new();
        for stage in [StageId::Step2Structural, StageId::Step2Pigment] {
            let names = placeholders(&store.get(stage).unwrap().text);
            assert!(names.contains(&"step1_json".to_string()), "{}", stage);
        }
        let step1 = placeholders(&store.get(StageId::Step1Geo).unwrap().text);
        assert!(!step1.contains(&"step1_json".to_string()));
    }

    #[test]
    fn test_override_changes_checksum() {
        let store = PromptStore::new();
        let original = store.get(StageId::Step1Geo).unwrap().checksum.clone();
        let store = store.with_override(StageId::Step1Geo, "Return {\"ok\": false}");
        let template = store.get(StageId::Step1Geo).unwrap();
        assert!(template.overridden);
        assert_ne!(template.checksum, original);
        assert_eq!(template.checksum, checksum("Return {\"ok\": false}"));
    }

    #[test]
    fn test_load_overrides_from_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("step2_pigment.txt"), "pigment {{side}}").unwrap();
        let store = PromptStore::new().load_overrides(dir.path()).unwrap();
        assert!(store.get(StageId::Step2Pigment).unwrap().overridden);
        assert!(!store.get(StageId::Step1Geo).unwrap().overridden);

        std::fs::write(dir.path().join("step1_geo.txt"), "   ").unwrap();
        assert!(matches!(
            PromptStore::new().load_overrides(dir.path()),
            Err(PromptError::Empty(StageId::Step1Geo))
        ));
    }
}
