//! Parsing loosely-formatted capability responses.
//!
//! Tier responses arrive as fenced JSON, raw JSON, prose with labelled fields,
//! or nothing usable. Each maps onto one [`ParsedJudgement`] variant; a verdict
//! is never inferred from a bare string match.

use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

/// A verdict extracted from a tier response.
#[derive(Debug, Clone, PartialEq)]
pub struct Judgement {
    pub verified: bool,
    pub confidence: Option<u8>,
    pub reason: String,
    pub observed: Option<String>,
    pub expected: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedJudgement {
    /// JSON payload with an explicit verdict field
    Structured(Judgement),
    /// Labelled fields pulled from free text
    Unstructured { judgement: Judgement, raw: String },
    /// Nothing usable
    ParseFailed { raw: String },
}

fn fenced_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)```(?:json|JSON)?\s*(.*?)```").expect("valid regex")
    })
}

/// Find the first JSON object in `text`: fenced blocks first, then the first
/// balanced `{...}` span.
pub fn extract_json(text: &str) -> Option<Value> {
    for cap in fenced_re().captures_iter(text) {
        if let Some(body) = cap.get(1) {
            if let Ok(value) = serde_json::from_str::<Value>(body.as_str().trim()) {
                if value.is_object() || value.is_array() {
                    return Some(value);
                }
            }
        }
    }

    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        if value.is_object() || value.is_array() {
            return Some(value);
        }
    }

    let bytes = trimmed.as_bytes();
    let mut start = 0;
    while let Some(offset) = trimmed[start..].find('{') {
        let open = start + offset;
        if let Some(close) = matching_brace(bytes, open) {
            if let Ok(value) = serde_json::from_str::<Value>(&trimmed[open..=close]) {
                return Some(value);
            }
        }
        start = open + 1;
    }
    None
}

/// Index of the brace closing the one at `open`, skipping string contents.
fn matching_brace(bytes: &[u8], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(open) {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

fn parse_verdict_word(word: &str) -> Option<bool> {
    match word.trim().trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase().as_str() {
        "true" | "yes" | "pass" | "passed" | "success" | "verified" | "match" | "ok" => Some(true),
        "false" | "no" | "fail" | "failed" | "failure" | "unverified" | "mismatch" => Some(false),
        _ => None,
    }
}

/// Confidence as 0-100; fractions in (0, 1] are scaled.
fn normalize_confidence(value: f64) -> Option<u8> {
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    let scaled = if value <= 1.0 && value.fract() != 0.0 {
        value * 100.0
    } else {
        value
    };
    Some(scaled.round().min(100.0) as u8)
}

fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn first_field<'a>(obj: &'a serde_json::Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|k| obj.get(*k))
}

fn judgement_from_json(value: &Value) -> Option<Judgement> {
    let obj = value.as_object()?;

    let verified = match first_field(obj, &["verified", "success", "passed", "verdict"])? {
        Value::Bool(b) => *b,
        Value::String(s) => parse_verdict_word(s)?,
        _ => return None,
    };

    let confidence = obj
        .get("confidence")
        .and_then(|c| c.as_f64().or_else(|| c.as_str()?.trim().trim_end_matches('%').parse().ok()))
        .and_then(normalize_confidence);

    let reason = first_field(obj, &["reason", "reasoning", "explanation", "justification"])
        .and_then(value_text)
        .unwrap_or_default();

    let evidence = obj.get("evidence").and_then(Value::as_object);
    let nested = |keys: &[&str]| {
        first_field(obj, keys)
            .and_then(value_text)
            .or_else(|| evidence.and_then(|e| first_field(e, keys)).and_then(value_text))
    };

    Some(Judgement {
        verified,
        confidence,
        reason,
        observed: nested(&["observed", "observed_value", "actual"]),
        expected: nested(&["expected", "expected_value"]),
    })
}

fn label_re(label: &str) -> Regex {
    Regex::new(&format!(r"(?im)^[\s*\-]*(?:{})\**\s*[:=]\s*(.+?)\s*$", label))
        .expect("valid regex")
}

struct Labels {
    verdict: Regex,
    confidence: Regex,
    reason: Regex,
    observed: Regex,
    expected: Regex,
}

fn labels() -> &'static Labels {
    static LABELS: OnceLock<Labels> = OnceLock::new();
    LABELS.get_or_init(|| Labels {
        verdict: label_re("verified|verdict|result|success"),
        confidence: label_re("confidence"),
        reason: label_re("reason|reasoning|explanation|justification"),
        observed: label_re("observed|observed value|actual"),
        expected: label_re("expected|expected value"),
    })
}

fn capture<'t>(re: &Regex, text: &'t str) -> Option<&'t str> {
    re.captures(text).and_then(|c| c.get(1)).map(|m| m.as_str())
}

fn judgement_from_labels(text: &str) -> Option<Judgement> {
    let labels = labels();
    let verified = capture(&labels.verdict, text)
        .and_then(|v| v.split_whitespace().next())
        .and_then(parse_verdict_word)?;

    let confidence = capture(&labels.confidence, text)
        .and_then(|c| c.trim_end_matches('%').split_whitespace().next()?.parse::<f64>().ok())
        .and_then(normalize_confidence);

    let reason = capture(&labels.reason, text)
        .map(str::to_string)
        .unwrap_or_else(|| text.trim().to_string());

    Some(Judgement {
        verified,
        confidence,
        reason,
        observed: capture(&labels.observed, text).map(str::to_string),
        expected: capture(&labels.expected, text).map(str::to_string),
    })
}

/// Parse a tier response into a verdict.
pub fn parse_judgement(text: &str) -> ParsedJudgement {
    if let Some(judgement) = extract_json(text).as_ref().and_then(judgement_from_json) {
        return ParsedJudgement::Structured(judgement);
    }
    match judgement_from_labels(text) {
        Some(judgement) => ParsedJudgement::Unstructured {
            judgement,
            raw: text.to_string(),
        },
        None => ParsedJudgement::ParseFailed {
            raw: text.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fenced_json() {
        let text = "Here you go:\n```json\n{\"verified\": true, \"confidence\": 88, \"reason\": \"window visible\"}\n```";
        match parse_judgement(text) {
            ParsedJudgement::Structured(j) => {
                assert!(j.verified);
                assert_eq!(j.confidence, Some(88));
                assert_eq!(j.reason, "window visible");
            }
            other => panic!("expected structured, got {:?}", other),
        }
    }

    #[test]
    fn test_raw_json_embedded_in_prose() {
        let text = "I looked. {\"verified\": false, \"reason\": \"shows {error}\", \"evidence\": {\"observed\": \"-51\", \"expected\": 915}} done";
        match parse_judgement(text) {
            ParsedJudgement::Structured(j) => {
                assert!(!j.verified);
                assert_eq!(j.observed.as_deref(), Some("-51"));
                assert_eq!(j.expected.as_deref(), Some("915"));
            }
            other => panic!("expected structured, got {:?}", other),
        }
    }

    #[test]
    fn test_fractional_confidence_scaled() {
        let parsed = parse_judgement(r#"{"verdict": "pass", "confidence": 0.72}"#);
        match parsed {
            ParsedJudgement::Structured(j) => {
                assert!(j.verified);
                assert_eq!(j.confidence, Some(72));
            }
            other => panic!("expected structured, got {:?}", other),
        }
    }

    #[test]
    fn test_labelled_fields() {
        let text = "Verified: yes\nConfidence: 65%\nReason: the display shows 915\nObserved: 915";
        match parse_judgement(text) {
            ParsedJudgement::Unstructured { judgement, .. } => {
                assert!(judgement.verified);
                assert_eq!(judgement.confidence, Some(65));
                assert_eq!(judgement.reason, "the display shows 915");
                assert_eq!(judgement.observed.as_deref(), Some("915"));
            }
            other => panic!("expected unstructured, got {:?}", other),
        }
    }

    #[test]
    fn test_prose_without_verdict_fails() {
        // Positive-sounding prose is not a verdict
        let text = "The calculator looks great and everything seems successful.";
        assert!(matches!(
            parse_judgement(text),
            ParsedJudgement::ParseFailed { .. }
        ));
        assert!(matches!(
            parse_judgement(r#"{"reason": "no verdict"}"#),
            ParsedJudgement::ParseFailed { .. }
        ));
    }

    #[test]
    fn test_extract_json_plan_array() {
        let value = extract_json("```\n[{\"id\": \"1\"}]\n```").unwrap();
        assert!(value.is_array());
    }
}
