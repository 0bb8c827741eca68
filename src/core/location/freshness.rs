//! Decides whether a newly delivered fix should replace the current one.

use log::{debug, warn};

use crate::core::bluetooth::constants::{ACCURACY_THRESHOLD_METERS, STALE_FIX_THRESHOLD_MS};
use crate::core::location::LocationSample;

/// Returns true when `candidate` should become the current fix.
///
/// Any fix beats no fix. A fix that is at most [`ACCURACY_THRESHOLD_METERS`]
/// worse than the held one is accepted as well. A much worse fix is only
/// accepted once the held fix is older than [`STALE_FIX_THRESHOLD_MS`].
/// The thresholds match observed camera-firmware behavior and are not to be
/// tuned.
pub fn should_accept(previous: Option<&LocationSample>, candidate: &LocationSample) -> bool {
    // Any location is better than none initially
    let Some(previous) = previous else {
        return true;
    };

    let accuracy_drop = candidate.accuracy_m - previous.accuracy_m;
    if accuracy_drop <= ACCURACY_THRESHOLD_METERS {
        return true;
    }

    let time_difference = candidate.fix_time_ms - previous.fix_time_ms;
    warn!("New fix is way less accurate than the held one, only updating if the held fix is stale");

    if time_difference > STALE_FIX_THRESHOLD_MS {
        debug!("Held fix is older than the staleness threshold, updating anyway");
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(accuracy_m: f64, fix_time_ms: i64) -> LocationSample {
        LocationSample {
            latitude: 48.1371,
            longitude: 11.5754,
            accuracy_m,
            fix_time_ms,
            provider: "fused".to_string(),
        }
    }

    #[test]
    fn first_fix_is_always_accepted() {
        assert!(should_accept(None, &sample(5000.0, 0)));
    }

    #[test]
    fn equal_or_better_accuracy_is_accepted_regardless_of_age() {
        let previous = sample(50.0, 0);
        assert!(should_accept(Some(&previous), &sample(50.0, 0)));
        assert!(should_accept(Some(&previous), &sample(5.0, 1)));
        // even a fix "older" than the held one
        assert!(should_accept(Some(&previous), &sample(10.0, -60_000)));
    }

    #[test]
    fn mildly_worse_accuracy_is_accepted() {
        let previous = sample(5.0, 0);
        assert!(should_accept(Some(&previous), &sample(205.0, 1000)));
    }

    #[test]
    fn much_worse_fix_is_rejected_until_the_held_one_goes_stale() {
        let previous = sample(5.0, 0);
        let five_minutes = 5 * 60 * 1000;

        assert!(!should_accept(Some(&previous), &sample(250.0, five_minutes)));
        assert!(should_accept(
            Some(&previous),
            &sample(250.0, five_minutes + 1)
        ));
    }
}
