use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdvisoryCategory {
    /// The provider cannot produce the requested aspect ratio and a nearest
    /// supported ratio was requested instead.
    NativeMismatch,
    /// The ratio was honored but the provider's pixel dimensions differ
    /// from the preset's declared dimensions.
    DimensionDrift,
}

/// Warning attached to an outcome when actual output geometry diverges
/// from the requested preset. Computed once, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeometryAdvisory {
    pub category: AdvisoryCategory,
    pub message: String,
}

/// Terminal failure taxonomy for one materialization request. Every error
/// becomes an outcome value at the orchestrator boundary; nothing here
/// crosses into the caller-facing shell as a raw error.
#[derive(Debug, Clone, Error)]
pub enum GenerationError {
    #[error("provider '{provider}' is not configured (missing API credential)")]
    NotConfigured { provider: String },

    #[error("image generation failed: {message}")]
    Provider { message: String, retryable: bool },

    #[error("provider response contained no usable image data")]
    EmptyImageData,

    #[error("image was generated but could not be saved: {message}")]
    Write { message: String },

    #[error("invalid request: {message}")]
    InvalidInput { message: String },
}

impl GenerationError {
    pub fn kind(&self) -> &'static str {
        match self {
            GenerationError::NotConfigured { .. } => "not-configured",
            GenerationError::Provider { .. } => "provider-failure",
            GenerationError::EmptyImageData => "empty-image-data",
            GenerationError::Write { .. } => "write-failure",
            GenerationError::InvalidInput { .. } => "invalid-input",
        }
    }

    pub fn retryable(&self) -> bool {
        match self {
            GenerationError::Provider { retryable, .. } => *retryable,
            GenerationError::EmptyImageData => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeError {
    pub kind: String,
    pub message: String,
    pub retryable: bool,
}

impl From<&GenerationError> for OutcomeError {
    fn from(error: &GenerationError) -> Self {
        Self {
            kind: error.kind().to_string(),
            message: error.to_string(),
            retryable: error.retryable(),
        }
    }
}

/// The one-per-request terminal artifact record handed back to the shell.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MaterializationOutcome {
    pub success: bool,
    pub message: String,
    pub format_key: String,
    pub requested_width: u32,
    pub requested_height: u32,
    pub actual_width: Option<u32>,
    pub actual_height: Option<u32>,
    pub mime_type: Option<String>,
    pub saved_path: Option<String>,
    pub size_bytes: Option<u64>,
    pub file_size: Option<String>,
    pub sha256: Option<String>,
    pub advisory: Option<GeometryAdvisory>,
    #[serde(default)]
    pub warnings: Vec<String>,
    pub error: Option<OutcomeError>,
}

impl MaterializationOutcome {
    pub fn from_error(error: &GenerationError) -> Self {
        Self {
            success: false,
            message: error.to_string(),
            error: Some(OutcomeError::from(error)),
            ..Self::default()
        }
    }
}
