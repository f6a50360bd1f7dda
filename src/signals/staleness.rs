// =============================================================================
// Staleness Discount -- half-life freshness beyond a per-source max age
// =============================================================================
//
//   discount(age) = 1                                  age <= max_age
//                 = 0.5 ^ ((age - max_age) / max_age)  age >  max_age
//
// Continuous at `max_age`, monotone non-increasing, and never zero: a stale
// input is down-weighted, never excluded.

/// Discount factor in (0, 1] for an input `age_ms` old.
pub fn staleness_discount(age_ms: i64, max_age_ms: i64) -> f64 {
    let max_age = max_age_ms.max(1);
    if age_ms <= max_age {
        return 1.0;
    }
    let excess = (age_ms - max_age) as f64 / max_age as f64;
    (-excess * std::f64::consts::LN_2).exp().max(f64::MIN_POSITIVE)
}

/// Whether an input `age_ms` old is still inside its fresh window.
pub fn is_fresh(age_ms: i64, max_age_ms: i64) -> bool {
    age_ms <= max_age_ms
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_inputs_are_not_discounted() {
        assert_eq!(staleness_discount(0, 1_000), 1.0);
        assert_eq!(staleness_discount(-50, 1_000), 1.0);
        assert_eq!(staleness_discount(1_000, 1_000), 1.0);
    }

    #[test]
    fn halves_every_max_age_past_the_limit() {
        assert!((staleness_discount(2_000, 1_000) - 0.5).abs() < 1e-12);
        assert!((staleness_discount(3_000, 1_000) - 0.25).abs() < 1e-12);
    }

    #[test]
    fn monotone_and_never_zero() {
        let mut prev = 1.0;
        for age in (0..200_000).step_by(997) {
            let d = staleness_discount(age, 1_000);
            assert!(d <= prev);
            assert!(d > 0.0);
            prev = d;
        }
        assert!(staleness_discount(i64::MAX, 1) > 0.0);
    }
}
