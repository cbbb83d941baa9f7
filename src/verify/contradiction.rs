//! Contradiction detection and semantic matching over judge justifications.
//!
//! A judge may claim success while quoting numbers that disagree ("displays
//! -51, matches expected 915"). Numeric disagreement between the observed and
//! expected value always vetoes a positive verdict.

use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;

const NUMBER: &str = r"-?\d[\d,]*(?:\.\d+)?";

struct Patterns {
    number: Regex,
    observed: Regex,
    expected: Regex,
    word: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        number: Regex::new(NUMBER).expect("valid regex"),
        observed: Regex::new(&format!(
            r#"(?i)\b(?:displays?|displaying|shows?|showing|reads?|reading|observed(?:\s+value)?|actual(?:\s+value)?|currently|value\s+is)\s*(?:of|is|as|:|=)?\s*["'`]?({})"#,
            NUMBER
        ))
        .expect("valid regex"),
        expected: Regex::new(&format!(
            r#"(?i)\bexpected(?:\s+(?:value|result|total|number))?\s*(?:of|is|was|:|=)?\s*["'`]?({})"#,
            NUMBER
        ))
        .expect("valid regex"),
        word: Regex::new(r"[a-z][a-z']+").expect("valid regex"),
    })
}

/// Parse a number, tolerating thousands separators.
fn to_number(raw: &str) -> Option<f64> {
    raw.replace(',', "").trim_end_matches('.').parse().ok()
}

/// The single number in `text`, if there is exactly one distinct value.
pub fn sole_number(text: &str) -> Option<String> {
    let mut found: Vec<&str> = patterns()
        .number
        .find_iter(text)
        .map(|m| m.as_str())
        .collect();
    found.dedup();
    let distinct: HashSet<String> = found
        .iter()
        .filter_map(|n| to_number(n))
        .map(|n| n.to_string())
        .collect();
    if distinct.len() == 1 {
        found.first().map(|n| n.to_string())
    } else {
        None
    }
}

/// Observed value quoted in a justification ("shows 42", "observed: 42").
///
/// When several values are quoted, the one closest to a mention of the
/// criterion's content words wins; with no such mention the reading is
/// ambiguous and nothing is returned.
pub fn observed_in(reason: &str, criterion: &str) -> Option<String> {
    let quoted: Vec<(usize, usize, String)> = patterns()
        .observed
        .captures_iter(reason)
        .filter_map(|c| {
            let whole = c.get(0)?;
            let value = c.get(1)?;
            Some((whole.start(), whole.end(), value.as_str().to_string()))
        })
        .collect();
    if quoted.len() <= 1 {
        return quoted.into_iter().next().map(|(_, _, value)| value);
    }

    let lower = reason.to_lowercase();
    let (words, _) = key_terms(criterion);
    let mentions: Vec<(usize, usize)> = patterns()
        .word
        .find_iter(&lower)
        .filter(|m| words.iter().any(|w| w == m.as_str()))
        .map(|m| (m.start(), m.end()))
        .collect();
    if mentions.is_empty() {
        return None;
    }

    let gap = |(start, end): (usize, usize), (m_start, m_end): (usize, usize)| {
        if m_end <= start {
            start - m_end
        } else if end <= m_start {
            m_start - end
        } else {
            0
        }
    };
    quoted
        .into_iter()
        .min_by_key(|(start, end, _)| {
            mentions
                .iter()
                .map(|m| gap((*start, *end), *m))
                .min()
                .unwrap_or(usize::MAX)
        })
        .map(|(_, _, value)| value)
}

/// Expected value quoted in a justification ("expected 915").
pub fn expected_in(reason: &str) -> Option<String> {
    patterns()
        .expected
        .captures(reason)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Outcome of comparing observed and expected values.
#[derive(Debug, Clone, PartialEq)]
pub struct ContradictionCheck {
    pub observed: Option<String>,
    pub expected: Option<String>,
    pub contradiction: bool,
}

/// Compare observed and expected values.
///
/// Observed comes from the evidence field or the justification; expected from
/// the evidence field, the justification, or the sole number in the
/// criterion. Only two numeric, unequal values count as a contradiction.
pub fn check(
    evidence_observed: Option<&str>,
    evidence_expected: Option<&str>,
    reason: &str,
    criterion: &str,
) -> ContradictionCheck {
    let observed = evidence_observed
        .map(str::to_string)
        .or_else(|| observed_in(reason, criterion));
    let expected = evidence_expected
        .map(str::to_string)
        .or_else(|| expected_in(reason))
        .or_else(|| sole_number(criterion));

    let numeric = |v: &Option<String>| v.as_deref().and_then(sole_number).and_then(|n| to_number(&n));
    let contradiction = match (numeric(&observed), numeric(&expected)) {
        (Some(o), Some(e)) => (o - e).abs() > 1e-9,
        _ => false,
    };

    ContradictionCheck {
        observed,
        expected,
        contradiction,
    }
}

const SUCCESS_WORDS: &[&str] = &[
    "matches", "match", "matching", "shows", "showing", "displays", "displayed", "displaying",
    "visible", "present", "correct", "correctly", "successfully", "success", "confirmed",
    "confirms", "appears", "open", "opened", "completed", "contains",
];

const FAILURE_WORDS: &[&str] = &[
    "not", "no", "fail", "failed", "fails", "failure", "error", "missing", "incorrect", "absent",
    "doesn't", "didn't", "isn't", "cannot", "can't", "unable", "instead", "wrong", "mismatch",
    "nothing", "blank", "empty",
];

const STOP_WORDS: &[&str] = &[
    "the", "and", "for", "with", "that", "this", "should", "must", "will", "are", "was", "has",
    "have", "been", "from", "into", "onto", "its", "it's", "then", "than", "there", "which",
    "when", "where", "window", "screen", "display", "shows", "show", "visible", "appears",
    "contain", "contains", "exist", "exists", "include", "includes",
];

/// Content words and numbers a justification should mention to count as
/// agreeing with `criterion`.
pub fn key_terms(criterion: &str) -> (Vec<String>, Vec<String>) {
    let lower = criterion.to_lowercase();
    let p = patterns();
    let words: Vec<String> = p
        .word
        .find_iter(&lower)
        .map(|m| m.as_str().to_string())
        .filter(|w| w.len() >= 3 && !STOP_WORDS.contains(&w.as_str()))
        .collect::<Vec<_>>();
    let mut seen = HashSet::new();
    let words = words.into_iter().filter(|w| seen.insert(w.clone())).collect();
    let numbers = p
        .number
        .find_iter(&lower)
        .filter_map(|m| to_number(m.as_str()))
        .map(|n| n.to_string())
        .collect();
    (words, numbers)
}

/// Whether `text` reads as a positive confirmation of `criterion`: success
/// vocabulary present, failure vocabulary absent, every criterion number
/// quoted and at least `ratio` of its content words mentioned.
pub fn semantic_match(text: &str, criterion: &str, ratio: f64) -> bool {
    let lower = text.to_lowercase();
    let p = patterns();
    let tokens: HashSet<&str> = p.word.find_iter(&lower).map(|m| m.as_str()).collect();

    if FAILURE_WORDS.iter().any(|w| tokens.contains(w)) {
        return false;
    }
    if !SUCCESS_WORDS.iter().any(|w| tokens.contains(w)) {
        return false;
    }

    let (words, numbers) = key_terms(criterion);
    let text_numbers: HashSet<String> = p
        .number
        .find_iter(&lower)
        .filter_map(|m| to_number(m.as_str()))
        .map(|n| n.to_string())
        .collect();
    if !numbers.iter().all(|n| text_numbers.contains(n)) {
        return false;
    }
    if words.is_empty() {
        return !numbers.is_empty();
    }
    let hits = words.iter().filter(|w| tokens.contains(w.as_str())).count();
    hits as f64 / words.len() as f64 >= ratio
}
