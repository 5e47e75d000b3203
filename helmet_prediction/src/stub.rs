use crate::verdict::{Verdict, VerdictLabel, NEUTRAL_CONFIDENCE};
use sha2::{Digest, Sha256};

const HELMET_THRESHOLD: f64 = 0.7;
const NO_HELMET_THRESHOLD: f64 = 0.3;

/// Content-hash verdict used when no detector is available.
///
/// The result depends on the bytes only, so it is stable across runs and
/// processes.
pub fn predict_stub(image_bytes: &[u8]) -> Verdict {
    let digest = Sha256::digest(image_bytes);
    let score = f64::from(u16::from_be_bytes([digest[0], digest[1]])) / f64::from(u16::MAX);

    tracing::debug!(
        "Stub prediction for digest {} with score {:.3}",
        hex::encode(&digest[..8]),
        score
    );

    if score > HELMET_THRESHOLD {
        Verdict::new(VerdictLabel::Helmet, score)
    } else if score < NO_HELMET_THRESHOLD {
        Verdict::new(VerdictLabel::NoHelmet, 1.0 - score)
    } else {
        Verdict::new(VerdictLabel::Uncertain, NEUTRAL_CONFIDENCE)
    }
}

#[derive(Debug, Clone)]
pub struct StubPredictor {
    seed: u64,
}

impl StubPredictor {
    pub fn new(seed: u64) -> Self {
        tracing::info!("Stub predictor configured with seed {}", seed);
        Self { seed }
    }

    /// The seed is kept for reporting only; verdicts never depend on it.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn predict(&self, image_bytes: &[u8]) -> Verdict {
        predict_stub(image_bytes)
    }
}

impl Default for StubPredictor {
    fn default() -> Self {
        Self::new(42)
    }
}
