use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Generation-context fields embedded into the saved artifact.
///
/// Assembled once per request from the original request plus the provider
/// response; passed by value into the metadata codec and never persisted
/// anywhere except inside the written image.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProvenanceRecord {
    pub prompt: String,
    pub model: String,
    pub provider: String,
    pub format_key: String,
    pub style: Option<String>,
    pub title: Option<String>,
    pub created_at: String,
}

impl ProvenanceRecord {
    pub fn now_timestamp() -> String {
        Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
    }

    /// Keyword/value pairs in embedding order, skipping empty values.
    /// The order is part of the on-disk contract.
    pub fn text_fields(&self) -> Vec<(&'static str, &str)> {
        let candidates: [(&'static str, &str); 7] = [
            ("Description", &self.prompt),
            ("AI Model", &self.model),
            ("AI Provider", &self.provider),
            ("Format", &self.format_key),
            ("Style", self.style.as_deref().unwrap_or("")),
            ("Title", self.title.as_deref().unwrap_or("")),
            ("Creation Time", &self.created_at),
        ];
        candidates
            .into_iter()
            .filter(|(_, value)| !value.trim().is_empty())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use chrono::DateTime;

    use super::*;

    #[test]
    fn text_fields_keep_embedding_order_and_skip_empties() {
        let record = ProvenanceRecord {
            prompt: "sunset over the bay".to_string(),
            model: "imagen-4.0".to_string(),
            provider: "gemini".to_string(),
            format_key: "ghost-banner".to_string(),
            style: None,
            title: Some("Sunset".to_string()),
            created_at: "2026-08-23T10:00:00Z".to_string(),
        };
        let keywords: Vec<&str> = record
            .text_fields()
            .into_iter()
            .map(|(keyword, _)| keyword)
            .collect();
        assert_eq!(
            keywords,
            vec![
                "Description",
                "AI Model",
                "AI Provider",
                "Format",
                "Title",
                "Creation Time"
            ]
        );
    }

    #[test]
    fn empty_record_has_no_fields() {
        assert!(ProvenanceRecord::default().text_fields().is_empty());
    }

    #[test]
    fn timestamp_is_second_precision_rfc3339() {
        let stamp = ProvenanceRecord::now_timestamp();
        let parsed = DateTime::parse_from_rfc3339(&stamp).expect("timestamp should parse");
        assert_eq!(parsed.timestamp_subsec_nanos(), 0);
        assert!(stamp.ends_with('Z'));
    }
}
