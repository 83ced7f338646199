use rand::Rng;

/// Scale applied to price and change fields before they are persisted.
pub const CENTS_PER_UNIT: f64 = 100.0;

pub fn now_ts() -> f64 {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    now.as_secs_f64()
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Quantize to integer cents, rounding half away from zero.
pub fn to_cents(value: f64) -> i64 {
    (value * CENTS_PER_UNIT).round() as i64
}

pub fn from_cents(cents: i64) -> f64 {
    cents as f64 / CENTS_PER_UNIT
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Multiplies `base` by a uniform factor in `[1 - pct/100, 1 + pct/100]`.
pub fn jitter(rng: &mut impl Rng, base: f64, pct: f64) -> f64 {
    if !(pct > 0.0) {
        return base;
    }
    let f = pct / 100.0;
    base * (1.0 + rng.random_range(-f..=f))
}

pub fn format_ts_ms(ts_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ts_ms)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ts_ms.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::SmallRng, SeedableRng};

    #[test]
    fn test_cents_round_trip_is_two_decimal_rounding() {
        assert_eq!(to_cents(1799.994), 179999);
        assert_eq!(to_cents(1799.995), 180000);
        assert_eq!(to_cents(-12.345), -1235);
        assert_eq!(from_cents(to_cents(0.92)), 0.92);
    }

    #[test]
    fn test_jitter_stays_inside_band() {
        let mut rng = SmallRng::seed_from_u64(7);
        for _ in 0..500 {
            let x = jitter(&mut rng, 2650.0, 0.5);
            assert!(x >= 2650.0 * 0.995 - 1e-9 && x <= 2650.0 * 1.005 + 1e-9);
        }
        assert_eq!(jitter(&mut rng, 10.0, 0.0), 10.0);
    }

    #[test]
    fn test_mean_empty_is_none() {
        assert_eq!(mean(&[]), None);
        assert_eq!(mean(&[1.0, 2.0, 3.0]), Some(2.0));
    }
}
