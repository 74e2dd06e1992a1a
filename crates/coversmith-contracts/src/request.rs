use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    #[default]
    Standard,
    High,
}

impl QualityTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            QualityTier::Standard => "standard",
            QualityTier::High => "high",
        }
    }
}

impl fmt::Display for QualityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QualityTier {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "standard" => Ok(QualityTier::Standard),
            "high" => Ok(QualityTier::High),
            other => Err(format!(
                "unknown quality tier '{other}' (expected 'standard' or 'high')"
            )),
        }
    }
}

/// A validated generation request. Produced by the caller-facing shell,
/// consumed once by the materialization pipeline, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    pub format_key: String,
    #[serde(default)]
    pub quality: QualityTier,
    pub style: Option<String>,
    pub title: Option<String>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>, format_key: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            format_key: format_key.into(),
            quality: QualityTier::Standard,
            style: None,
            title: None,
        }
    }
}
