use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::error::{IrisError, Result};

/// Which eye an image or analysis belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Left,
    Right,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Left => "left",
            Side::Right => "right",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An iris photograph encoded as a `data:` URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IrisImage {
    pub data_url: String,
    pub side: Side,
}

impl IrisImage {
    pub fn new(data_url: impl Into<String>, side: Side) -> Self {
        Self {
            data_url: data_url.into(),
            side,
        }
    }

    /// Encode raw image bytes as a base64 data URL.
    pub fn from_bytes(bytes: &[u8], mime_type: &str, side: Side) -> Result<Self> {
        if bytes.is_empty() {
            return Err(IrisError::InvalidImage("image is empty".to_string()));
        }
        if !mime_type.starts_with("image/") {
            return Err(IrisError::InvalidImage(format!(
                "unsupported mime type: {}",
                mime_type
            )));
        }
        let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
        Ok(Self::new(
            format!("data:{};base64,{}", mime_type, encoded),
            side,
        ))
    }

    /// Mime type declared in the data URL header, if any.
    pub fn mime_type(&self) -> Option<&str> {
        let rest = self.data_url.strip_prefix("data:")?;
        let header = rest.split(',').next()?;
        let mime = header.split(';').next()?;
        if mime.is_empty() {
            None
        } else {
            Some(mime)
        }
    }

    /// The encoded payload after the comma, or the whole string for bare payloads.
    pub fn payload(&self) -> &str {
        match self.data_url.split_once(',') {
            Some((_, payload)) if self.data_url.starts_with("data:") => payload,
            _ => &self.data_url,
        }
    }

    /// Content fingerprint used to keep prompts stable for an unchanged image.
    ///
    /// Not a security boundary: 64 bits of SHA-256 over the payload.
    pub fn image_hash(&self) -> String {
        let digest = Sha256::digest(self.payload().as_bytes());
        digest
            .iter()
            .take(8)
            .map(|b| format!("{:02x}", b))
            .collect()
    }
}
