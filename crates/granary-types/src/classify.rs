use serde::{Deserialize, Serialize};

/// Verdict on a successful call's content, evaluated in fixed order:
/// emptiness, minimum length, exact invalid markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentVerdict {
    Valid,
    Empty,
    TooShort,
    InvalidMarker,
}

impl ContentVerdict {
    pub fn is_valid(self) -> bool {
        matches!(self, ContentVerdict::Valid)
    }

    pub fn reason(self) -> &'static str {
        match self {
            ContentVerdict::Valid => "valid",
            ContentVerdict::Empty => "empty result",
            ContentVerdict::TooShort => "result below minimum length",
            ContentVerdict::InvalidMarker => "invalid-result marker",
        }
    }
}

/// Explicit, configurable classification rules for remote results.
///
/// `invalid_markers` are matched exactly against the trimmed content and
/// mean "retry later"; `permanent_markers` are matched as substrings of
/// error messages and mean "never retry".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultClassifier {
    #[serde(default = "default_invalid_markers")]
    pub invalid_markers: Vec<String>,
    #[serde(default = "default_permanent_markers")]
    pub permanent_markers: Vec<String>,
    #[serde(default = "default_min_content_len")]
    pub min_content_len: usize,
}

impl Default for ResultClassifier {
    fn default() -> Self {
        Self {
            invalid_markers: default_invalid_markers(),
            permanent_markers: default_permanent_markers(),
            min_content_len: default_min_content_len(),
        }
    }
}

impl ResultClassifier {
    pub fn classify_content(&self, content: &str) -> ContentVerdict {
        let trimmed = content.trim();
        if trimmed.is_empty() {
            return ContentVerdict::Empty;
        }
        if trimmed.len() < self.min_content_len {
            return ContentVerdict::TooShort;
        }
        if self.invalid_markers.iter().any(|m| trimmed == m.as_str()) {
            return ContentVerdict::InvalidMarker;
        }
        ContentVerdict::Valid
    }

    /// Whether an error message signals a policy rejection that must never
    /// be retried.
    pub fn is_permanent_rejection(&self, message: &str) -> bool {
        self.permanent_markers.iter().any(|m| message.contains(m))
    }

    /// Exact-match check used by the Clean sweep on persisted results.
    pub fn is_invalid_result(&self, result: &str) -> bool {
        self.invalid_markers.iter().any(|m| result == m.as_str())
    }
}

fn default_invalid_markers() -> Vec<String> {
    vec![
        "No relevant content found matching the query.".to_string(),
        "未找到与查询匹配的相关内容".to_string(),
    ]
}

fn default_permanent_markers() -> Vec<String> {
    vec!["inappropriate content".to_string()]
}

fn default_min_content_len() -> usize {
    10
}
