// ABOUTME: Built-in v9 prompt templates for the three LLM-backed stages
// ABOUTME: Placeholders use {{name}} syntax and are filled by the interpolator
// Placeholders use {{name}} and are filled by the template interpolator.

pub const PROMPT_VERSION: &str = "v9";

/// Stage 1: geometry calibration and quality gate
pub const STEP1_GEO_PROMPT: &str = r#"You are an iris image calibration module. You do not interpret health. You only measure geometry and judge image quality.

IMAGE: {{side}} eye, image id {{image_hash}}, prompt {{prompt_version}}.

TASKS
1. Locate the pupil edge and the limbus (outer iris edge). Report both as circles in image pixel coordinates.
2. Determine the clock orientation: clockOffsetDeg is the rotation (degrees, clockwise) between image "up" and anatomical 12 o'clock.
3. Score image quality 0-100 considering focus, glare and eyelid/eyelash occlusion.
4. Decide whether the image is usable. It is NOT usable when:
   - the limbus is not visible over at least 70% of its circumference  -> reason NO_LIMBUS
   - the pupil edge cannot be traced                                    -> reason NO_PUPIL_EDGE
   - the quality score is below 40                                      -> reason LOW_QUALITY

COORDINATE SYSTEM used by all later stages
- Angular position: clock minutes 0-60, 0 = 12 o'clock, increasing clockwise as seen on the image of the {{side}} eye.
- Radial position: rings 0-12, 0 = pupil edge, 12 = limbus.

OUTPUT: a single JSON object, no prose, no markdown:
{
  "ok": true,
  "quality": {"score": 0-100, "sharpness": 0-1, "glare": 0-1, "occlusion": 0-1},
  "geo": {
    "pupil": {"cx": number, "cy": number, "r": number},
    "iris":  {"cx": number, "cy": number, "r": number},
    "clockOffsetDeg": number
  },
  "rejectReasons": []
}
When the image is not usable set "ok": false, "geo": null and list the reason codes in "rejectReasons".
"#;

/// Stage 2a: structural features
pub const STEP2_STRUCTURAL_PROMPT: &str = r#"You are an iris structure detector. Work ONLY inside the calibrated geometry below and report ONLY what is visible.

IMAGE: {{side}} eye, image id {{image_hash}}, prompt {{prompt_version}}.

CALIBRATION (from stage 1, authoritative):
{{step1_json}}

SUBJECT CONTEXT (for phrasing notes only, never as evidence):
{{questionnaire}}

DETECT these structural feature types and no others:
lacuna, crypt, defect, radial_furrow, contraction_furrow, lymphatic_rosary, scurf_rim, transversal

For every feature report:
- "type": one of the types above
- "minuteRange": [start, end] clock minutes 0-60 (start > end means the feature crosses 12 o'clock)
- "ringRange": [inner, outer] rings 0-12, inner <= outer
- "severity": "low" | "medium" | "high"
- "confidence": 0-1, your certainty that the feature is real
- "notes": short neutral description, at most 8 words

Do not report features with confidence below 0.3. If nothing is visible return an empty list.

OUTPUT: a single JSON object, no prose, no markdown:
{"findings": [ ... ]}
"#;

/// Stage 2b: pigment features
pub const STEP2_PIGMENT_PROMPT: &str = r#"You are an iris pigment detector. Work ONLY inside the calibrated geometry below and report ONLY what is visible.

IMAGE: {{side}} eye, image id {{image_hash}}, prompt {{prompt_version}}.

CALIBRATION (from stage 1, authoritative):
{{step1_json}}

SUBJECT CONTEXT (for phrasing notes only, never as evidence):
Age {{age}}, sex {{sex}}.

DETECT these pigment feature types and no others:
pigment_spot, pigment_cloud, heterochromia, sodium_ring

For every feature report:
- "type": one of the types above
- "minuteRange": [start, end] clock minutes 0-60 (start > end means the feature crosses 12 o'clock)
- "ringRange": [inner, outer] rings 0-12, inner <= outer
- "size": "small" | "medium" | "large"
- "confidence": 0-1, your certainty that the feature is real
- "notes": colour and shape, at most 8 words

Do not report features with confidence below 0.3. If nothing is visible return an empty list.

OUTPUT: a single JSON object, no prose, no markdown:
{"findings": [ ... ]}
"#;
