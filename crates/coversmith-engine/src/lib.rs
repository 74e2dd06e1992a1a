use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{SecondsFormat, Utc};
use coversmith_contracts::outcome::{
    AdvisoryCategory, GenerationError, GeometryAdvisory, MaterializationOutcome,
};
use coversmith_contracts::presets;
use coversmith_contracts::provenance::ProvenanceRecord;
use coversmith_contracts::request::{GenerationRequest, QualityTier};
use coversmith_contracts::sanitize::scrub_secrets;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

pub const OUTPUT_DIR_ENV: &str = "COVERSMITH_OUTPUT_DIR";
const DEFAULT_OUTPUT_DIR: &str = "generated-images";
const FILE_PREFIX: &str = "cover";

const SOFTWARE_NAME: &str = "coversmith";
const SOURCE_URL: &str = "https://github.com/coversmith/coversmith";

#[derive(Debug, Clone)]
pub struct ProviderImageRequest {
    pub prompt: String,
    pub aspect_ratio: String,
    pub width: u32,
    pub height: u32,
    pub quality: QualityTier,
    pub style: Option<String>,
}

/// Raw provider output. `data_base64` stays encoded until the orchestrator
/// decodes it; dimensions are optional because not every upstream reports
/// them.
#[derive(Debug, Clone)]
pub struct ProviderImage {
    pub data_base64: String,
    pub mime_type: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub model: String,
    pub metadata: Map<String, Value>,
    pub warnings: Vec<String>,
}

pub trait ImageProvider: Send + Sync {
    fn name(&self) -> &str;
    fn is_configured(&self) -> bool;
    fn supported_aspect_ratios(&self) -> &[&'static str];
    fn max_resolution(&self) -> (u32, u32);
    fn generate(&self, request: &ProviderImageRequest) -> Result<ProviderImage>;
}

#[derive(Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Box<dyn ImageProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P: ImageProvider + 'static>(&mut self, provider: P) {
        self.providers
            .insert(provider.name().to_string(), Box::new(provider));
    }

    pub fn get(&self, name: &str) -> Option<&dyn ImageProvider> {
        self.providers.get(name).map(|provider| provider.as_ref())
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }
}

/// Credentials and endpoints snapshotted from the environment once at
/// startup. Providers receive this by reference at construction; nothing
/// reads the environment after that.
#[derive(Debug, Clone, Default)]
pub struct ProviderConfig {
    pub gemini_api_key: Option<String>,
    pub gemini_api_base: String,
    pub gemini_model: String,
    pub openai_api_key: Option<String>,
    pub openai_api_base: String,
    pub openai_model: String,
}

impl ProviderConfig {
    pub fn from_env() -> Self {
        Self {
            gemini_api_key: non_empty_env("GEMINI_API_KEY")
                .or_else(|| non_empty_env("GOOGLE_API_KEY")),
            gemini_api_base: api_base_env(
                "GEMINI_API_BASE",
                "https://generativelanguage.googleapis.com/v1beta",
            ),
            gemini_model: non_empty_env("GEMINI_IMAGE_MODEL")
                .unwrap_or_else(|| "imagen-4.0-generate-001".to_string()),
            openai_api_key: non_empty_env("OPENAI_API_KEY"),
            openai_api_base: api_base_env("OPENAI_API_BASE", "https://api.openai.com/v1"),
            openai_model: non_empty_env("OPENAI_IMAGE_MODEL")
                .unwrap_or_else(|| "gpt-image-1".to_string()),
        }
    }

    /// Values that must never appear in surfaced text.
    pub fn secrets(&self) -> Vec<String> {
        [&self.gemini_api_key, &self.openai_api_key]
            .into_iter()
            .flatten()
            .cloned()
            .collect()
    }
}

pub fn default_provider_registry(config: &ProviderConfig) -> ProviderRegistry {
    let mut providers = ProviderRegistry::new();
    providers.register(DryrunProvider);
    providers.register(GeminiProvider::new(config));
    providers.register(OpenAiProvider::new(config));
    providers
}

/// Offline provider that synthesizes a deterministic solid-color PNG.
/// Always configured; used by tests and `--provider dryrun` smoke runs.
struct DryrunProvider;

impl DryrunProvider {
    const RATIOS: &'static [&'static str] =
        &["1:1", "3:4", "4:3", "9:16", "16:9", "3:2", "2:3"];
}

impl ImageProvider for DryrunProvider {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn is_configured(&self) -> bool {
        true
    }

    fn supported_aspect_ratios(&self) -> &[&'static str] {
        Self::RATIOS
    }

    fn max_resolution(&self) -> (u32, u32) {
        (4096, 4096)
    }

    fn generate(&self, request: &ProviderImageRequest) -> Result<ProviderImage> {
        let (r, g, b) = color_from_prompt(&request.prompt);
        let mut canvas = RgbImage::new(request.width.max(1), request.height.max(1));
        for pixel in canvas.pixels_mut() {
            *pixel = Rgb([r, g, b]);
        }
        let mut cursor = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(canvas)
            .write_to(&mut cursor, ImageFormat::Png)
            .context("dryrun PNG encode failed")?;

        let mut metadata = Map::new();
        metadata.insert("prompt".to_string(), json!(request.prompt));
        metadata.insert("aspect_ratio".to_string(), json!(request.aspect_ratio));

        Ok(ProviderImage {
            data_base64: BASE64.encode(cursor.into_inner()),
            mime_type: "image/png".to_string(),
            width: Some(request.width.max(1)),
            height: Some(request.height.max(1)),
            model: "dryrun-image-1".to_string(),
            metadata,
            warnings: Vec::new(),
        })
    }
}

struct GeminiProvider {
    api_base: String,
    api_key: Option<String>,
    model: String,
    http: HttpClient,
}

impl GeminiProvider {
    const RATIOS: &'static [&'static str] = &["1:1", "3:4", "4:3", "9:16", "16:9"];

    fn new(config: &ProviderConfig) -> Self {
        Self {
            api_base: config.gemini_api_base.clone(),
            api_key: config.gemini_api_key.clone(),
            model: config.gemini_model.clone(),
            http: HttpClient::new(),
        }
    }

    fn snap_aspect_ratio(raw: &str, warnings: &mut Vec<String>) -> String {
        let value = raw.trim().replace('/', ":");
        if Self::RATIOS.iter().any(|candidate| *candidate == value) {
            return value;
        }
        let target = ratio_value(&value).unwrap_or(1.0);
        let mut best = "1:1";
        let mut best_delta = f64::MAX;
        for candidate in Self::RATIOS {
            let Some(ratio) = ratio_value(candidate) else {
                continue;
            };
            let delta = (ratio - target).abs();
            if delta < best_delta {
                best = candidate;
                best_delta = delta;
            }
        }
        push_unique_warning(
            warnings,
            format!("Gemini aspect ratio '{raw}' snapped to {best}."),
        );
        best.to_string()
    }

    fn image_size_for(quality: QualityTier) -> &'static str {
        match quality {
            QualityTier::Standard => "1K",
            QualityTier::High => "2K",
        }
    }

    /// Best-effort estimate of the output dimensions for a given aspect
    /// ratio and size tier. The predict API does not report dimensions, so
    /// this stays isolated and replaceable should that change.
    fn estimated_dims(aspect_ratio: &str, quality: QualityTier) -> Option<(u32, u32)> {
        let long_edge: f64 = match quality {
            QualityTier::Standard => 1024.0,
            QualityTier::High => 2048.0,
        };
        let ratio = ratio_value(aspect_ratio)?;
        let (width, height) = if ratio >= 1.0 {
            (long_edge, long_edge / ratio)
        } else {
            (long_edge * ratio, long_edge)
        };
        let even = |value: f64| {
            let rounded = value.round() as u32;
            rounded - rounded % 2
        };
        Some((even(width), even(height)))
    }

    fn extract_prediction(response_payload: &Value) -> Option<(String, Option<String>)> {
        let predictions = response_payload.get("predictions").and_then(Value::as_array)?;
        for row in predictions {
            let Some(obj) = row.as_object() else {
                continue;
            };
            if let Some(encoded) = obj
                .get("bytesBase64Encoded")
                .or_else(|| obj.get("bytes_base64_encoded"))
                .and_then(Value::as_str)
            {
                let mime = obj
                    .get("mimeType")
                    .or_else(|| obj.get("mime_type"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                return Some((encoded.to_string(), mime));
            }
        }
        None
    }
}

impl ImageProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    fn supported_aspect_ratios(&self) -> &[&'static str] {
        Self::RATIOS
    }

    fn max_resolution(&self) -> (u32, u32) {
        (2048, 2048)
    }

    fn generate(&self, request: &ProviderImageRequest) -> Result<ProviderImage> {
        let Some(api_key) = self.api_key.as_deref() else {
            bail!("GEMINI_API_KEY or GOOGLE_API_KEY not set");
        };

        let mut warnings = Vec::new();
        let ratio = Self::snap_aspect_ratio(&request.aspect_ratio, &mut warnings);
        let image_size = Self::image_size_for(request.quality);
        let endpoint = format!("{}/models/{}:predict", self.api_base, self.model);

        let payload = json!({
            "instances": [{
                "prompt": compose_prompt(&request.prompt, request.style.as_deref()),
            }],
            "parameters": {
                "sampleCount": 1,
                "aspectRatio": ratio,
                "imageSize": image_size,
            },
        });
        let response = self
            .http
            .post(&endpoint)
            .query(&[("key", api_key)])
            .json(&payload)
            .send()
            .with_context(|| format!("Gemini request failed ({endpoint})"))?;
        let response_payload = response_json_or_error("Gemini", response)?;

        let Some((encoded, mime_type)) = Self::extract_prediction(&response_payload) else {
            bail!("Gemini returned no image predictions");
        };

        let dims = Self::estimated_dims(&ratio, request.quality);
        let mut metadata = Map::new();
        metadata.insert("aspect_ratio".to_string(), json!(ratio));
        metadata.insert("image_size".to_string(), json!(image_size));

        Ok(ProviderImage {
            data_base64: encoded,
            mime_type: mime_type.unwrap_or_else(|| "image/png".to_string()),
            width: dims.map(|(width, _)| width),
            height: dims.map(|(_, height)| height),
            model: self.model.clone(),
            metadata,
            warnings,
        })
    }
}

struct OpenAiProvider {
    api_base: String,
    api_key: Option<String>,
    model: String,
    http: HttpClient,
}

impl OpenAiProvider {
    const RATIOS: &'static [&'static str] = &["1:1", "3:2", "2:3"];

    fn new(config: &ProviderConfig) -> Self {
        Self {
            api_base: config.openai_api_base.clone(),
            api_key: config.openai_api_key.clone(),
            model: config.openai_model.clone(),
            http: HttpClient::new(),
        }
    }

    fn snap_size(width: u32, height: u32, warnings: &mut Vec<String>) -> (u32, u32) {
        const GRID: &[(u32, u32)] = &[(1024, 1024), (1536, 1024), (1024, 1536)];
        if GRID.contains(&(width, height)) {
            return (width, height);
        }
        let ratio = if height == 0 {
            1.0
        } else {
            width as f64 / height as f64
        };
        let snapped = if ratio > 1.2 {
            (1536, 1024)
        } else if ratio < 0.83 {
            (1024, 1536)
        } else {
            (1024, 1024)
        };
        push_unique_warning(
            warnings,
            format!(
                "OpenAI size {}x{} not supported; using {}x{}.",
                width, height, snapped.0, snapped.1
            ),
        );
        snapped
    }

    fn quality_for(quality: QualityTier) -> &'static str {
        match quality {
            QualityTier::Standard => "medium",
            QualityTier::High => "high",
        }
    }
}

impl ImageProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    fn supported_aspect_ratios(&self) -> &[&'static str] {
        Self::RATIOS
    }

    fn max_resolution(&self) -> (u32, u32) {
        (1536, 1536)
    }

    fn generate(&self, request: &ProviderImageRequest) -> Result<ProviderImage> {
        let Some(api_key) = self.api_key.as_deref() else {
            bail!("OPENAI_API_KEY not set");
        };

        let mut warnings = Vec::new();
        let (width, height) = Self::snap_size(request.width, request.height, &mut warnings);
        let endpoint = format!("{}/images/generations", self.api_base);
        let payload = json!({
            "model": self.model,
            "prompt": compose_prompt(&request.prompt, request.style.as_deref()),
            "n": 1,
            "size": format!("{width}x{height}"),
            "quality": Self::quality_for(request.quality),
        });
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(api_key)
            .json(&payload)
            .send()
            .with_context(|| format!("OpenAI request failed ({endpoint})"))?;
        let response_payload = response_json_or_error("OpenAI", response)?;

        let encoded = response_payload
            .get("data")
            .and_then(Value::as_array)
            .and_then(|rows| rows.first())
            .and_then(|row| row.get("b64_json"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let Some(encoded) = encoded else {
            bail!("OpenAI response returned no image data");
        };

        let mut metadata = Map::new();
        if let Some(usage) = response_payload.get("usage").cloned() {
            metadata.insert("usage".to_string(), usage);
        }

        Ok(ProviderImage {
            data_base64: encoded,
            mime_type: "image/png".to_string(),
            width: Some(width),
            height: Some(height),
            model: self.model.clone(),
            metadata,
            warnings,
        })
    }
}

/// HTTP failure carrying the status code so the orchestrator can classify
/// retryability after the error has been wrapped with context.
#[derive(Debug)]
pub struct HttpStatusError {
    pub status: u16,
    pub body: String,
}

impl fmt::Display for HttpStatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "upstream returned HTTP {}: {}", self.status, self.body)
    }
}

impl std::error::Error for HttpStatusError {}

fn response_json_or_error(provider: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().unwrap_or_default();
        return Err(anyhow::Error::new(HttpStatusError {
            status: status.as_u16(),
            body: truncate_text(&body, 512),
        }))
        .with_context(|| format!("{provider} request rejected"));
    }
    response
        .json()
        .with_context(|| format!("failed parsing {provider} JSON response"))
}

fn is_retryable_generation_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        if let Some(status_err) = cause.downcast_ref::<HttpStatusError>() {
            return matches!(status_err.status, 408 | 429) || status_err.status >= 500;
        }
        cause
            .downcast_ref::<reqwest::Error>()
            .map(|reqwest_err| {
                reqwest_err.is_timeout() || reqwest_err.is_connect() || reqwest_err.is_request()
            })
            .unwrap_or(false)
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedGeometry {
    pub width: u32,
    pub height: u32,
    pub advisory: Option<GeometryAdvisory>,
}

/// Reconciles a preset's declared geometry against what the provider
/// actually produced. Pure and total: missing information falls back to
/// the requested values, never to an error.
pub fn reconcile_geometry(
    requested_aspect: &str,
    requested_width: u32,
    requested_height: u32,
    native_aspect: bool,
    substituted_aspect: &str,
    actual: Option<(u32, u32)>,
) -> ResolvedGeometry {
    if !native_aspect {
        return ResolvedGeometry {
            width: requested_width,
            height: requested_height,
            advisory: Some(GeometryAdvisory {
                category: AdvisoryCategory::NativeMismatch,
                message: format!(
                    "The {requested_aspect} aspect ratio is not natively supported by the \
                     provider; {substituted_aspect} was requested instead. The saved image \
                     may need cropping or resizing to {requested_width}x{requested_height}."
                ),
            }),
        };
    }
    if let Some((actual_width, actual_height)) = actual {
        if (actual_width, actual_height) != (requested_width, requested_height) {
            return ResolvedGeometry {
                width: actual_width,
                height: actual_height,
                advisory: Some(GeometryAdvisory {
                    category: AdvisoryCategory::DimensionDrift,
                    message: format!(
                        "Provider returned {actual_width}x{actual_height} instead of the \
                         requested {requested_width}x{requested_height}."
                    ),
                }),
            };
        }
    }
    ResolvedGeometry {
        width: requested_width,
        height: requested_height,
        advisory: None,
    }
}

const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
const TEXT_CHUNK_TYPE: &[u8; 4] = b"tEXt";
const KEYWORD_MAX_LEN: usize = 79;

/// Splices provenance tEXt chunks into a PNG buffer immediately after the
/// IHDR chunk. Buffers that fail the signature check (or whose first chunk
/// is truncated) are returned unchanged: embedding is best-effort and must
/// never fail the save path.
pub fn embed_provenance(raw: &[u8], record: &ProvenanceRecord) -> Vec<u8> {
    let Some(splice_at) = ihdr_end_offset(raw) else {
        return raw.to_vec();
    };

    let mut inserted = Vec::new();
    for (keyword, value) in record.text_fields() {
        inserted.extend_from_slice(&text_chunk(keyword, value));
    }
    inserted.extend_from_slice(&text_chunk("Software", SOFTWARE_NAME));
    inserted.extend_from_slice(&text_chunk("Source", SOURCE_URL));

    let mut out = Vec::with_capacity(raw.len() + inserted.len());
    out.extend_from_slice(&raw[..splice_at]);
    out.extend_from_slice(&inserted);
    out.extend_from_slice(&raw[splice_at..]);
    out
}

/// Byte offset just past the IHDR chunk: signature, 4-byte length, 4-byte
/// type, declared data length, 4-byte CRC.
fn ihdr_end_offset(raw: &[u8]) -> Option<usize> {
    if raw.len() < PNG_SIGNATURE.len() + 8 || raw[..8] != PNG_SIGNATURE {
        return None;
    }
    let mut length_bytes = [0u8; 4];
    length_bytes.copy_from_slice(&raw[8..12]);
    let data_len = u32::from_be_bytes(length_bytes) as usize;
    let end = 8 + 4 + 4 + data_len + 4;
    (end <= raw.len()).then_some(end)
}

/// One tEXt chunk: big-endian data length, chunk type, Latin-1 keyword,
/// NUL separator, UTF-8 value, CRC32 over type and data.
fn text_chunk(keyword: &str, value: &str) -> Vec<u8> {
    let mut data = latin1_keyword(keyword);
    data.push(0);
    data.extend_from_slice(value.as_bytes());

    let mut chunk = Vec::with_capacity(12 + data.len());
    chunk.extend_from_slice(&(data.len() as u32).to_be_bytes());
    chunk.extend_from_slice(TEXT_CHUNK_TYPE);
    chunk.extend_from_slice(&data);

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(TEXT_CHUNK_TYPE);
    hasher.update(&data);
    chunk.extend_from_slice(&hasher.finalize().to_be_bytes());
    chunk
}

fn latin1_keyword(keyword: &str) -> Vec<u8> {
    keyword
        .chars()
        .map(|ch| if (ch as u32) <= 0xFF { ch as u8 } else { b'?' })
        .take(KEYWORD_MAX_LEN)
        .collect()
}

pub fn extension_for_mime(mime: &str) -> &'static str {
    match mime.trim().to_ascii_lowercase().as_str() {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/webp" => "webp",
        "image/gif" => "gif",
        _ => "png",
    }
}

fn generated_file_name(mime: &str) -> String {
    let stamp = Utc::now()
        .to_rfc3339_opts(SecondsFormat::Secs, true)
        .replace([':', '.'], "-");
    format!("{FILE_PREFIX}-{stamp}.{}", extension_for_mime(mime))
}

pub fn default_output_root() -> PathBuf {
    if let Some(root) = non_empty_env(OUTPUT_DIR_ENV) {
        return PathBuf::from(root);
    }
    PathBuf::from(DEFAULT_OUTPUT_DIR)
}

/// Determines the final absolute output path for a buffer of the given
/// MIME type. Directories (existing, or spelled with a trailing separator)
/// receive a generated filename; extensionless files gain the extension
/// implied by the MIME type.
pub fn resolve_output_path(supplied: Option<&str>, mime: &str) -> PathBuf {
    resolve_with_root(supplied, mime, &default_output_root())
}

fn resolve_with_root(supplied: Option<&str>, mime: &str, default_root: &Path) -> PathBuf {
    let resolved = match supplied.map(str::trim).filter(|raw| !raw.is_empty()) {
        None => default_root.join(generated_file_name(mime)),
        Some(raw) => {
            let path = PathBuf::from(raw);
            let spelled_as_dir =
                raw.ends_with('/') || raw.ends_with(std::path::MAIN_SEPARATOR);
            if path.is_dir() || spelled_as_dir {
                path.join(generated_file_name(mime))
            } else if path.extension().is_none() {
                path.with_extension(extension_for_mime(mime))
            } else {
                path
            }
        }
    };
    absolutize(resolved)
}

fn absolutize(path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        return path;
    }
    env::current_dir()
        .map(|cwd| cwd.join(&path))
        .unwrap_or(path)
}

/// Single whole-buffer write; parent directories are created idempotently.
/// A pre-existing file at the exact final path is overwritten.
pub fn write_image(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed creating {}", parent.display()))?;
    }
    fs::write(path, bytes).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

/// Runs the whole pipeline for one request: provider call, geometry
/// reconciliation, provenance embedding, output write. One terminal
/// outcome per request; no retries at this layer.
pub struct Materializer {
    providers: ProviderRegistry,
    provider_name: String,
    secrets: Vec<String>,
}

impl Materializer {
    pub fn new(config: &ProviderConfig, provider_name: impl Into<String>) -> Self {
        Self {
            providers: default_provider_registry(config),
            provider_name: provider_name.into(),
            secrets: config.secrets(),
        }
    }

    pub fn with_registry(
        providers: ProviderRegistry,
        provider_name: impl Into<String>,
        secrets: Vec<String>,
    ) -> Self {
        Self {
            providers,
            provider_name: provider_name.into(),
            secrets,
        }
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    pub fn materialize(
        &self,
        request: &GenerationRequest,
        output_path: Option<&str>,
    ) -> MaterializationOutcome {
        match self.run(request, output_path) {
            Ok(outcome) => outcome,
            Err(error) => {
                warn!(kind = error.kind(), "materialization failed: {error}");
                let mut outcome = MaterializationOutcome::from_error(&error);
                outcome.format_key = request.format_key.clone();
                if let Some(preset) = presets::lookup(&request.format_key) {
                    outcome.requested_width = preset.width;
                    outcome.requested_height = preset.height;
                }
                outcome
            }
        }
    }

    fn run(
        &self,
        request: &GenerationRequest,
        output_path: Option<&str>,
    ) -> std::result::Result<MaterializationOutcome, GenerationError> {
        if request.prompt.trim().is_empty() {
            return Err(GenerationError::InvalidInput {
                message: "prompt must not be empty".to_string(),
            });
        }
        let preset = presets::lookup(&request.format_key).ok_or_else(|| {
            GenerationError::InvalidInput {
                message: format!(
                    "unknown format '{}' (available: [{}])",
                    request.format_key,
                    presets::keys().join(", ")
                ),
            }
        })?;

        let provider = self.providers.get(&self.provider_name).ok_or_else(|| {
            GenerationError::InvalidInput {
                message: format!(
                    "provider '{}' not registered (available: [{}])",
                    self.provider_name,
                    self.providers.names().join(", ")
                ),
            }
        })?;
        if !provider.is_configured() {
            return Err(GenerationError::NotConfigured {
                provider: provider.name().to_string(),
            });
        }

        let mut warnings = Vec::new();
        let (max_width, max_height) = provider.max_resolution();
        if preset.width > max_width || preset.height > max_height {
            push_unique_warning(
                &mut warnings,
                format!(
                    "Requested {}x{} exceeds the provider maximum of {}x{}.",
                    preset.width, preset.height, max_width, max_height
                ),
            );
        }

        let aspect_to_request = if preset.native_aspect_ratio {
            preset.aspect_ratio.clone()
        } else {
            preset.provider_aspect_ratio.clone()
        };
        info!(
            provider = provider.name(),
            format = preset.key.as_str(),
            aspect = aspect_to_request.as_str(),
            "dispatching image generation"
        );

        let provider_request = ProviderImageRequest {
            prompt: request.prompt.clone(),
            aspect_ratio: aspect_to_request,
            width: preset.width,
            height: preset.height,
            quality: request.quality,
            style: request.style.clone(),
        };
        let image = provider.generate(&provider_request).map_err(|err| {
            GenerationError::Provider {
                message: scrub_secrets(&error_chain_text(&err, 2048), &self.secrets),
                retryable: is_retryable_generation_error(&err),
            }
        })?;
        for warning in &image.warnings {
            push_unique_warning(&mut warnings, warning.clone());
        }

        let encoded = image.data_base64.trim();
        if encoded.is_empty() {
            return Err(GenerationError::EmptyImageData);
        }
        let raw_bytes = BASE64
            .decode(encoded.as_bytes())
            .map_err(|_| GenerationError::EmptyImageData)?;
        if raw_bytes.is_empty() {
            return Err(GenerationError::EmptyImageData);
        }
        debug!(
            bytes = raw_bytes.len(),
            mime = image.mime_type.as_str(),
            "provider returned image"
        );

        let actual = match (image.width, image.height) {
            (Some(width), Some(height)) => Some((width, height)),
            _ => None,
        };
        let geometry = reconcile_geometry(
            &preset.aspect_ratio,
            preset.width,
            preset.height,
            preset.native_aspect_ratio,
            &preset.provider_aspect_ratio,
            actual,
        );

        let provenance = ProvenanceRecord {
            prompt: request.prompt.clone(),
            model: image.model.clone(),
            provider: provider.name().to_string(),
            format_key: preset.key.clone(),
            style: request.style.clone(),
            title: request.title.clone(),
            created_at: ProvenanceRecord::now_timestamp(),
        };
        let final_bytes = if image.mime_type.eq_ignore_ascii_case("image/png") {
            let embedded = embed_provenance(&raw_bytes, &provenance);
            debug!(
                added = embedded.len() - raw_bytes.len(),
                "embedded provenance chunks"
            );
            embedded
        } else {
            raw_bytes
        };

        let path = resolve_output_path(output_path, &image.mime_type);
        write_image(&path, &final_bytes).map_err(|err| GenerationError::Write {
            message: scrub_secrets(&error_chain_text(&err, 1024), &self.secrets),
        })?;
        info!(path = %path.display(), bytes = final_bytes.len(), "image saved");

        let size_bytes = final_bytes.len() as u64;
        Ok(MaterializationOutcome {
            success: true,
            message: format!(
                "Generated {} image ({}x{}) and saved it to {}",
                preset.key,
                geometry.width,
                geometry.height,
                path.display()
            ),
            format_key: preset.key.clone(),
            requested_width: preset.width,
            requested_height: preset.height,
            actual_width: Some(geometry.width),
            actual_height: Some(geometry.height),
            mime_type: Some(image.mime_type.clone()),
            saved_path: Some(path.to_string_lossy().to_string()),
            size_bytes: Some(size_bytes),
            file_size: Some(format_file_size(size_bytes)),
            sha256: Some(hex::encode(Sha256::digest(&final_bytes))),
            advisory: geometry.advisory,
            warnings,
            error: None,
        })
    }
}

fn compose_prompt(prompt: &str, style: Option<&str>) -> String {
    match style.map(str::trim).filter(|value| !value.is_empty()) {
        Some(style) => format!("{prompt}, {style} style"),
        None => prompt.to_string(),
    }
}

fn color_from_prompt(prompt: &str) -> (u8, u8, u8) {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    let digest = hasher.finalize();
    (digest[0], digest[1], digest[2])
}

fn ratio_value(raw: &str) -> Option<f64> {
    let (left_raw, right_raw) = raw.trim().split_once(':')?;
    let left = left_raw.trim().parse::<f64>().ok()?;
    let right = right_raw.trim().parse::<f64>().ok()?;
    if left <= 0.0 || right <= 0.0 {
        return None;
    }
    Some(left / right)
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn api_base_env(key: &str, default: &str) -> String {
    non_empty_env(key)
        .map(|value| value.trim_end_matches('/').to_string())
        .unwrap_or_else(|| default.to_string())
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if parts
            .last()
            .map(|existing| existing == trimmed)
            .unwrap_or(false)
        {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

fn push_unique_warning(warnings: &mut Vec<String>, message: String) {
    if message.trim().is_empty() {
        return;
    }
    if warnings.iter().any(|existing| existing == &message) {
        return;
    }
    warnings.push(message);
}

pub fn format_file_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    if bytes < KB {
        format!("{bytes} B")
    } else if bytes < MB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    }
}
