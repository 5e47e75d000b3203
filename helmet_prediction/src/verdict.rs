use serde::Serialize;
use std::fmt;

/// Default confidence reported when there is nothing to average.
pub const NEUTRAL_CONFIDENCE: f64 = 0.5;

#[derive(Debug, Clone, PartialEq)]
pub struct DetectedObject {
    pub class_label: String,
    pub confidence: f64,
}

impl DetectedObject {
    pub fn new(class_label: impl Into<String>, confidence: f64) -> Self {
        Self {
            class_label: class_label.into(),
            confidence,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictLabel {
    Helmet,
    NoHelmet,
    Uncertain,
}

impl VerdictLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerdictLabel::Helmet => "helmet",
            VerdictLabel::NoHelmet => "no_helmet",
            VerdictLabel::Uncertain => "uncertain",
        }
    }
}

impl fmt::Display for VerdictLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a single prediction. Construct through [`Verdict::new`] so the
/// confidence is always clamped to `[0, 1]` and rounded to 3 decimals.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Verdict {
    label: VerdictLabel,
    confidence: f64,
}

impl Verdict {
    pub fn new(label: VerdictLabel, confidence: f64) -> Self {
        Self {
            label,
            confidence: round_confidence(confidence),
        }
    }

    pub fn uncertain() -> Self {
        Self::new(VerdictLabel::Uncertain, NEUTRAL_CONFIDENCE)
    }

    pub fn label(&self) -> VerdictLabel {
        self.label
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }
}

impl From<Verdict> for helmet_proto::Verdict {
    fn from(verdict: Verdict) -> Self {
        helmet_proto::Verdict {
            label: verdict.label.as_str().to_string(),
            confidence: verdict.confidence,
            timestamp: 0,
        }
    }
}

/// Rounds on the exact decimal expansion of `value`, ties to even, so
/// `0.1235` (stored as `0.12349999...`) becomes `0.123`.
fn round_confidence(value: f64) -> f64 {
    if !value.is_finite() {
        return NEUTRAL_CONFIDENCE;
    }
    format!("{:.3}", value.clamp(0.0, 1.0))
        .parse()
        .unwrap_or(NEUTRAL_CONFIDENCE)
}
