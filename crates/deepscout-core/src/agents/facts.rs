//! Pattern-based extraction of `label → number` facts from free text.

use once_cell::sync::Lazy;
use regex::Regex;

static SENTENCE_BREAK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:[.!?](?:\s+|$))|\n+").expect("sentence regex compiles"));

static FACT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(?P<label>[a-z][a-z0-9\- ]{1,60}?)(?:\s*[:=]\s*|\s+(?:is|was|are|were|of|at|reached|reaches|hit|hits|averaged|averages|rose to|fell to|stood at)\s+)(?:(?:about|around|approximately|nearly)\s+)?(?P<value>-?\d+(?:\.\d+)?)\s*(?P<unit>%|percent\b)?",
    )
    .expect("fact regex compiles")
});

static YEAR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?:19|20)\d{2}\b").expect("year regex compiles"));

const CONNECTIVES: &[&str] = &[
    "and", "or", "but", "while", "with", "as", "where", "which", "that", "when", "then", "so",
    "is", "was", "are", "were", "has", "have",
];
const PREPOSITIONS: &[&str] = &["in", "on", "for", "by", "during", "since", "from"];
const LEADING_NOISE: &[&str] = &[
    "the", "a", "an", "its", "their", "our", "this", "that", "these", "those", "average", "mean",
    "typical", "overall",
];
const MAX_LABEL_WORDS: usize = 4;

/// One numeric observation found in a sentence.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedFact {
    pub topic: String,
    /// The number as written, with `%` appended for percentages.
    pub raw_value: String,
    pub value: f64,
    pub unit: Option<String>,
    pub year: Option<i32>,
}

pub fn extract_facts(text: &str) -> Vec<ExtractedFact> {
    let mut facts = Vec::new();
    for sentence in SENTENCE_BREAK.split(text) {
        let sentence = sentence.trim();
        if sentence.is_empty() {
            continue;
        }
        for caps in FACT.captures_iter(sentence) {
            let (Some(label), Some(value)) = (caps.name("label"), caps.name("value")) else {
                continue;
            };
            let Some(topic) = normalize_label(label.as_str()) else {
                continue;
            };
            let Ok(number) = value.as_str().parse::<f64>() else {
                continue;
            };
            let unit = caps.name("unit").map(|_| "%".to_string());
            let raw_value = match unit {
                Some(_) => format!("{}%", value.as_str()),
                None => value.as_str().to_string(),
            };
            let year = YEAR
                .find_iter(sentence)
                .find(|m| m.end() <= value.start() || m.start() >= value.end())
                .and_then(|m| m.as_str().parse().ok());

            facts.push(ExtractedFact {
                topic,
                raw_value,
                value: number,
                unit,
                year,
            });
        }
    }
    facts
}

/// Reduce a captured label to a stable `snake_case` topic key.
///
/// Returns `None` when nothing meaningful is left.
pub fn normalize_label(raw: &str) -> Option<String> {
    let lowered = raw.to_lowercase();
    let words: Vec<&str> = lowered.split_whitespace().collect();

    let start = words
        .iter()
        .rposition(|w| CONNECTIVES.contains(w))
        .map_or(0, |idx| idx + 1);
    let clause = &words[start..];
    let end = clause
        .iter()
        .position(|w| PREPOSITIONS.contains(w))
        .unwrap_or(clause.len());
    let clause = &clause[..end];

    let kept: Vec<&str> = clause
        .iter()
        .copied()
        .skip_while(|w| LEADING_NOISE.contains(w))
        .map(|w| w.trim_matches('-'))
        .filter(|w| !w.is_empty() && !w.chars().all(|c| c.is_ascii_digit()))
        .collect();
    if kept.is_empty() {
        return None;
    }

    let tail = &kept[kept.len().saturating_sub(MAX_LABEL_WORDS)..];
    Some(tail.join("_"))
}
