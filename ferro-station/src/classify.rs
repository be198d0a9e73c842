//! Threshold classification
//!
//! Pure, stateless pass/fail decision for a single shot. Classification is
//! computed once at ingestion and stored immutably on the shot; threshold
//! changes never reclassify history.

use ferro_common::types::{Channel, ShotOutcome, ThresholdSet};

/// Classify one shot's current against the active threshold for its channel.
///
/// Equal-to-threshold is a pass (boundary-inclusive).
pub fn classify(channel: Channel, current: f64, thresholds: &ThresholdSet) -> ShotOutcome {
    if current >= thresholds.threshold(channel) {
        ShotOutcome::Pass
    } else {
        ShotOutcome::Fail
    }
}
