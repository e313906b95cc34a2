//! Sensitive-pattern screening applied before a sample is queued.
//!
//! Samples are serialized to text and matched against a fixed rule set.
//! A match drops the sample without telling the submitter which rule fired.

use regex::Regex;
use std::fmt::Write as _;
use std::sync::OnceLock;

/// Kind of sensitive data a rule looks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensitivePattern {
    PaymentCard,
    NationalId,
    Email,
}

struct Rule {
    pattern: SensitivePattern,
    regex: Regex,
}

fn rules() -> &'static [Rule] {
    static RULES: OnceLock<Vec<Rule>> = OnceLock::new();
    RULES.get_or_init(|| {
        let rule = |pattern, source: &str| Rule {
            pattern,
            regex: Regex::new(source).expect("privacy regex must compile"),
        };
        vec![
            // 13-19 digits, optionally grouped with spaces or dashes.
            rule(SensitivePattern::PaymentCard, r"\b(?:\d[ -]?){12,18}\d\b"),
            rule(SensitivePattern::NationalId, r"\b\d{3}-\d{2}-\d{4}\b"),
            rule(
                SensitivePattern::Email,
                r"(?i)\b[a-z0-9._%+-]+@[a-z0-9.-]+\.[a-z]{2,}\b",
            ),
        ]
    })
}

/// Stateless predicate over candidate training samples.
#[derive(Debug, Default, Clone, Copy)]
pub struct PrivacyGuard;

impl PrivacyGuard {
    pub fn new() -> Self {
        Self
    }

    /// False when the serialized features match any sensitive pattern.
    pub fn is_data_safe(&self, features: &[f32]) -> bool {
        self.first_match(&serialize_features(features)).is_none()
    }

    /// Like [`Self::is_data_safe`], also screening the label text.
    pub fn is_sample_safe(&self, features: &[f32], label: &str) -> bool {
        let mut text = serialize_features(features);
        text.push('|');
        text.push_str(label);
        self.first_match(&text).is_none()
    }

    pub fn first_match(&self, text: &str) -> Option<SensitivePattern> {
        rules()
            .iter()
            .find(|rule| rule.regex.is_match(text))
            .map(|rule| rule.pattern)
    }
}

/// `[v0,v1,...]` using `Debug` float formatting, which keeps integral
/// values below 1e16 as plain digit runs.
fn serialize_features(features: &[f32]) -> String {
    let mut out = String::with_capacity(features.len() * 8 + 2);
    out.push('[');
    for (idx, value) in features.iter().enumerate() {
        if idx > 0 {
            out.push(',');
        }
        let _ = write!(out, "{value:?}");
    }
    out.push(']');
    out
}
