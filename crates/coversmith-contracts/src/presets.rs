use std::sync::OnceLock;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Declared target geometry for a publishing platform.
///
/// `native_aspect_ratio` records whether the default provider can produce
/// the declared ratio directly; when it cannot, `provider_aspect_ratio`
/// holds the nearest supported ratio that will be requested instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatPreset {
    pub key: String,
    pub width: u32,
    pub height: u32,
    pub aspect_ratio: String,
    pub native_aspect_ratio: bool,
    pub provider_aspect_ratio: String,
    pub description: String,
}

pub fn lookup(key: &str) -> Option<&'static FormatPreset> {
    preset_table().get(key.trim())
}

pub fn all() -> impl Iterator<Item = &'static FormatPreset> {
    preset_table().values()
}

pub fn keys() -> Vec<String> {
    preset_table().keys().cloned().collect()
}

fn preset_table() -> &'static IndexMap<String, FormatPreset> {
    static TABLE: OnceLock<IndexMap<String, FormatPreset>> = OnceLock::new();
    TABLE.get_or_init(default_presets)
}

fn default_presets() -> IndexMap<String, FormatPreset> {
    let mut map = IndexMap::new();

    let mut insert = |key: &str,
                      width: u32,
                      height: u32,
                      aspect_ratio: &str,
                      native_aspect_ratio: bool,
                      provider_aspect_ratio: &str,
                      description: &str| {
        map.insert(
            key.to_string(),
            FormatPreset {
                key: key.to_string(),
                width,
                height,
                aspect_ratio: aspect_ratio.to_string(),
                native_aspect_ratio,
                provider_aspect_ratio: provider_aspect_ratio.to_string(),
                description: description.to_string(),
            },
        );
    };

    insert(
        "ghost-banner",
        1200,
        675,
        "16:9",
        true,
        "16:9",
        "Ghost post feature image",
    );
    insert(
        "og-image",
        1200,
        630,
        "1.91:1",
        false,
        "16:9",
        "Open Graph link preview",
    );
    insert(
        "twitter-card",
        1200,
        675,
        "16:9",
        true,
        "16:9",
        "Twitter/X summary card",
    );
    insert(
        "instagram-square",
        1080,
        1080,
        "1:1",
        true,
        "1:1",
        "Instagram feed square",
    );
    insert(
        "instagram-portrait",
        1080,
        1350,
        "4:5",
        false,
        "3:4",
        "Instagram feed portrait",
    );
    insert(
        "pinterest-pin",
        1000,
        1500,
        "2:3",
        false,
        "3:4",
        "Pinterest standard pin",
    );
    insert(
        "youtube-thumbnail",
        1280,
        720,
        "16:9",
        true,
        "16:9",
        "YouTube video thumbnail",
    );
    insert(
        "linkedin-banner",
        1584,
        396,
        "4:1",
        false,
        "16:9",
        "LinkedIn profile banner",
    );
    insert(
        "story-vertical",
        1080,
        1920,
        "9:16",
        true,
        "9:16",
        "Instagram/TikTok story",
    );
    insert(
        "square-small",
        800,
        800,
        "1:1",
        true,
        "1:1",
        "Small square thumbnail",
    );

    map
}
