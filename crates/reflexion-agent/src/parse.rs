//! Lenient parsing of structured model output.
//!
//! Every parser here returns a conservative default or `None` instead of an
//! error; the caller decides what "unparseable" means for its step.

use serde_json::Value;

/// Score used when an evaluation cannot be parsed.
pub const NEUTRAL_SCORE: f64 = 0.5;

/// Critique used when an evaluation cannot be parsed.
pub const PLACEHOLDER_CRITIQUE: &str = "Unable to parse the evaluation response.";

/// A parsed draft evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    /// Clamped to `[0, 1]`.
    pub score: f64,
    pub critique: String,
    /// `false` when the defaults were substituted.
    pub parsed: bool,
}

impl Evaluation {
    /// The neutral fallback evaluation.
    pub fn fallback() -> Self {
        Self {
            score: NEUTRAL_SCORE,
            critique: PLACEHOLDER_CRITIQUE.to_owned(),
            parsed: false,
        }
    }
}

/// Strip Markdown code fences around a JSON payload, if any.
pub fn extract_json_block(text: &str) -> &str {
    let trimmed = text.trim();

    if let Some(start) = trimmed.find("```json") {
        let json_start = start + "```json".len();
        if let Some(end) = trimmed[json_start..].find("```") {
            return trimmed[json_start..json_start + end].trim();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let json_start = start + 3;
        if let Some(end) = trimmed[json_start..].find("```") {
            return trimmed[json_start..json_start + end].trim();
        }
    }

    trimmed
}

/// Parse the first JSON value found in `text`, tolerating fences and prose
/// around a single object or array.
fn parse_json_lenient(text: &str) -> Option<Value> {
    let block = extract_json_block(text);
    if let Ok(v) = serde_json::from_str(block) {
        return Some(v);
    }

    for (open, close) in [('{', '}'), ('[', ']')] {
        if let (Some(start), Some(end)) = (block.find(open), block.rfind(close))
            && start < end
            && let Ok(v) = serde_json::from_str(&block[start..=end])
        {
            return Some(v);
        }
    }
    None
}

/// Parse `{"score": <0..1>, "critique": "..."}`.
///
/// Unparseable output yields [`Evaluation::fallback`]. A parsed object with a
/// missing or non-numeric score gets [`NEUTRAL_SCORE`], and a missing or
/// blank critique gets [`PLACEHOLDER_CRITIQUE`].
pub fn parse_evaluation(text: &str) -> Evaluation {
    let Some(Value::Object(obj)) = parse_json_lenient(text) else {
        return Evaluation::fallback();
    };

    let score = match obj.get("score") {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|s| s.is_finite())
    .unwrap_or(NEUTRAL_SCORE)
    .clamp(0.0, 1.0);

    let critique = obj
        .get("critique")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .unwrap_or(PLACEHOLDER_CRITIQUE)
        .to_owned();

    Evaluation {
        score,
        critique,
        parsed: true,
    }
}

/// Parse an ordered list of relevance verdicts.
///
/// Accepts a bare array or `{"verdicts": [...]}` whose items are booleans or
/// yes/no style strings. Returns `None` if the list is malformed or its
/// length differs from `expected`.
pub fn parse_verdicts(text: &str, expected: usize) -> Option<Vec<bool>> {
    let items = match parse_json_lenient(text)? {
        Value::Array(items) => items,
        Value::Object(mut obj) => match obj.remove("verdicts")? {
            Value::Array(items) => items,
            _ => return None,
        },
        _ => return None,
    };

    if items.len() != expected {
        return None;
    }

    items.iter().map(verdict).collect()
}

fn verdict(v: &Value) -> Option<bool> {
    match v {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "yes" | "y" | "true" | "relevant" => Some(true),
            "no" | "n" | "false" | "irrelevant" | "not relevant" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Parse a JSON array of strings, dropping blanks. `None` if not an array
/// of strings.
pub fn parse_string_list(text: &str) -> Option<Vec<String>> {
    let items = match parse_json_lenient(text)? {
        Value::Array(items) => items,
        Value::Object(mut obj) => match obj.remove("principles")? {
            Value::Array(items) => items,
            _ => return None,
        },
        _ => return None,
    };

    items
        .into_iter()
        .map(|v| v.as_str().map(|s| s.trim().to_owned()))
        .collect::<Option<Vec<_>>>()
        .map(|list| list.into_iter().filter(|s| !s.is_empty()).collect())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_strips_json_fence() {
        let text = "Here:\n```json\n{\"a\": 1}\n```\nthanks";
        assert_eq!(extract_json_block(text), "{\"a\": 1}");
    }

    #[test]
    fn extract_returns_raw_without_fence() {
        assert_eq!(extract_json_block("  [true]  "), "[true]");
    }

    #[test]
    fn evaluation_parses_and_clamps() {
        let e = parse_evaluation(r#"{"score": 1.4, "critique": "Too short."}"#);
        assert_eq!(e.score, 1.0);
        assert_eq!(e.critique, "Too short.");
        assert!(e.parsed);

        let e = parse_evaluation(r#"{"score": -2, "critique": ""}"#);
        assert_eq!(e.score, 0.0);
        assert_eq!(e.critique, PLACEHOLDER_CRITIQUE);
    }

    #[test]
    fn evaluation_without_critique_gets_placeholder() {
        let e = parse_evaluation(r#"{"score": 0.4}"#);
        assert!(e.parsed);
        assert!((e.score - 0.4).abs() < 1e-9);
        assert_eq!(e.critique, PLACEHOLDER_CRITIQUE);
    }

    #[test]
    fn evaluation_accepts_string_score_and_surrounding_prose() {
        let e = parse_evaluation(r#"Verdict: {"score": "0.65", "critique": "ok"} end"#);
        assert!((e.score - 0.65).abs() < 1e-9);
    }

    #[test]
    fn unparseable_evaluation_uses_fallback() {
        let e = parse_evaluation("I think it is pretty good, maybe 7/10.");
        assert_eq!(e, Evaluation::fallback());
        assert_eq!(e.score, NEUTRAL_SCORE);
    }

    #[test]
    fn evaluation_without_score_is_neutral() {
        let e = parse_evaluation(r#"{"critique": "missing structure"}"#);
        assert_eq!(e.score, NEUTRAL_SCORE);
        assert_eq!(e.critique, "missing structure");
    }

    #[test]
    fn verdicts_accept_bools_and_words() {
        assert_eq!(
            parse_verdicts(r#"[true, "no", "Yes"]"#, 3),
            Some(vec![true, false, true])
        );
        assert_eq!(
            parse_verdicts("```json\n{\"verdicts\": [false]}\n```", 1),
            Some(vec![false])
        );
    }

    #[test]
    fn verdict_length_mismatch_is_none() {
        assert_eq!(parse_verdicts("[true, false]", 3), None);
    }

    #[test]
    fn unknown_verdict_word_is_none() {
        assert_eq!(parse_verdicts(r#"["maybe"]"#, 1), None);
        assert_eq!(parse_verdicts("relevant, not relevant", 2), None);
    }

    #[test]
    fn string_list_drops_blanks() {
        assert_eq!(
            parse_string_list(r#"["Cite data.", " ", "Open strong."]"#),
            Some(vec!["Cite data.".to_string(), "Open strong.".to_string()])
        );
        assert_eq!(parse_string_list(r#"[1, 2]"#), None);
        assert_eq!(
            parse_string_list(r#"{"principles": ["x"]}"#),
            Some(vec!["x".to_string()])
        );
    }
}
