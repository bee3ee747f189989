//! Auxiliary labels derived from a summary.
//!
//! Both are lexical heuristics. The document type is a keyword scan and the
//! confidence score only measures summary length; neither reflects what the
//! worker actually understood. The classifier sits behind
//! [`DocumentClassifier`] so a real model can replace it.

/// Assigns a document type label to a summary.
pub trait DocumentClassifier: Send + Sync {
    fn classify(&self, summary: &str) -> String;
}

pub const GENERAL_DOCUMENT: &str = "General Document";

/// Ordered keyword scan over the lower-cased summary.
///
/// Specific disease names are checked first and reported capitalized. The
/// generic categories come after them, so "diabetes" beats "medical".
#[derive(Debug, Clone)]
pub struct KeywordClassifier {
    specific: Vec<String>,
    categories: Vec<(String, Vec<String>)>,
}

impl Default for KeywordClassifier {
    fn default() -> Self {
        let specific = [
            "cancer",
            "diabetes",
            "heart",
            "stroke",
            "pneumonia",
            "flu",
            "covid",
            "malaria",
            "dengue",
            "hypertension",
        ];
        let categories: [(&str, &[&str]); 3] = [
            ("Legal Document", &["court", "judge", "law", "legal"]),
            (
                "Medical Document",
                &["medical", "patient", "treatment", "diagnosis"],
            ),
            (
                "Research Document",
                &["research", "study", "experiment", "data"],
            ),
        ];

        Self {
            specific: specific.iter().map(|k| k.to_string()).collect(),
            categories: categories
                .iter()
                .map(|(label, keywords)| {
                    (
                        label.to_string(),
                        keywords.iter().map(|k| k.to_string()).collect(),
                    )
                })
                .collect(),
        }
    }
}

impl KeywordClassifier {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DocumentClassifier for KeywordClassifier {
    fn classify(&self, summary: &str) -> String {
        let lower = summary.to_lowercase();

        if let Some(keyword) = self.specific.iter().find(|k| lower.contains(k.as_str())) {
            return capitalize(keyword);
        }

        self.categories
            .iter()
            .find(|(_, keywords)| keywords.iter().any(|k| lower.contains(k.as_str())))
            .map(|(label, _)| label.clone())
            .unwrap_or_else(|| GENERAL_DOCUMENT.to_string())
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Word-count step function, in percent. Longer summaries score higher.
pub fn confidence_percent(summary: &str) -> u8 {
    const STEPS: [(usize, u8); 10] = [
        (400, 98),
        (300, 95),
        (200, 90),
        (150, 85),
        (100, 80),
        (75, 75),
        (50, 70),
        (30, 65),
        (20, 60),
        (10, 55),
    ];

    let words = summary.split_whitespace().count();
    STEPS
        .iter()
        .find(|(threshold, _)| words > *threshold)
        .map(|(_, score)| *score)
        .unwrap_or(50)
}

/// [`confidence_percent`] formatted as a percentage string.
pub fn confidence_score(summary: &str) -> String {
    format!("{}%", confidence_percent(summary))
}
