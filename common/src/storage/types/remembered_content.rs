use uuid::Uuid;

use crate::stored_object;

/// How a capture entered the system.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Webpage,
    Selection,
    UserInput,
    RawText,
    FileUpload,
}

stored_object!(RememberedContent, "remembered_content", {
    source_type: SourceType,
    source_url: Option<String>,
    original_url: Option<String>,
    title: String,
    raw_content: String,
    clean_content: String,
    text_content: String,
    source_metadata: serde_json::Value,
    extraction_metadata: serde_json::Value,
    topic_id: Option<String>,
    embedding: Option<Vec<f32>>
});

impl RememberedContent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source_type: SourceType,
        source_url: Option<String>,
        original_url: Option<String>,
        title: String,
        raw_content: String,
        clean_content: String,
        text_content: String,
        source_metadata: serde_json::Value,
        extraction_metadata: serde_json::Value,
        topic_id: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            source_type,
            source_url,
            original_url,
            title,
            raw_content,
            clean_content,
            text_content,
            source_metadata,
            extraction_metadata,
            topic_id,
            embedding: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_sets_timestamps_and_id() {
        let content = RememberedContent::new(
            SourceType::RawText,
            None,
            None,
            "title".into(),
            "raw".into(),
            "clean".into(),
            "text".into(),
            serde_json::json!({}),
            serde_json::json!({}),
            None,
        );
        assert!(!content.id.is_empty());
        assert_eq!(content.created_at, content.updated_at);
        assert!(content.embedding.is_none());
    }
}
