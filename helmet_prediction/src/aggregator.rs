use crate::verdict::{DetectedObject, Verdict, VerdictLabel, NEUTRAL_CONFIDENCE};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Category {
    Person,
    Helmet,
    Other(String),
}

fn categorize(class_label: &str) -> Category {
    let label = class_label.to_lowercase();
    if label == "head" || label == "person" {
        Category::Person
    } else if label.contains("helmet") {
        Category::Helmet
    } else {
        Category::Other(label)
    }
}

/// Turns the detections of one image into a helmet verdict.
///
/// Every detection contributes to the confidence, but only persons and
/// helmets are counted: at least one person is needed for a decision, and
/// each person needs a matching helmet.
pub fn aggregate(detections: &[DetectedObject]) -> Verdict {
    let mut person_count = 0usize;
    let mut helmet_count = 0usize;
    let mut other_count = 0usize;

    for detection in detections {
        match categorize(&detection.class_label) {
            Category::Person => person_count += 1,
            Category::Helmet => helmet_count += 1,
            Category::Other(label) => {
                other_count += 1;
                tracing::trace!("Ignoring detection of class {}", label);
            }
        }
    }

    if other_count > 0 {
        tracing::debug!(
            "{} of {} detections are neither person nor helmet",
            other_count,
            detections.len()
        );
    }

    let violation_count = person_count.saturating_sub(helmet_count);
    let label = if person_count == 0 {
        VerdictLabel::Uncertain
    } else if violation_count > 0 {
        VerdictLabel::NoHelmet
    } else {
        VerdictLabel::Helmet
    };

    let confidence = if detections.is_empty() {
        NEUTRAL_CONFIDENCE
    } else {
        detections.iter().map(|d| d.confidence).sum::<f64>() / detections.len() as f64
    };

    Verdict::new(label, confidence)
}
