//! Amounts are kept in major units (NPR) everywhere except on the wire to
//! Khalti, which wants paisa. Conversion happens here and nowhere else.

use bigdecimal::{BigDecimal, ToPrimitive};

const MINOR_UNITS_PER_MAJOR: i64 = 100;

/// Exact paisa value of a major-unit amount, or `None` when the amount has
/// fractions of a paisa or does not fit in an `i64`.
pub fn to_minor_units(amount: &BigDecimal) -> Option<i64> {
    let minor = amount.clone() * BigDecimal::from(MINOR_UNITS_PER_MAJOR);
    if minor.with_scale(0) != minor {
        return None;
    }
    minor.to_i64()
}

pub fn from_minor_units(minor: i64) -> BigDecimal {
    BigDecimal::from(minor) / BigDecimal::from(MINOR_UNITS_PER_MAJOR)
}

/// Two-decimal rendering used on gateway forms, e.g. `500.00`.
pub fn format_major(amount: &BigDecimal) -> String {
    amount.with_scale(2).to_string()
}

/// A price is valid when it is positive with at most two decimal places.
pub fn validate_price(price: &BigDecimal) -> Result<(), String> {
    if price <= &BigDecimal::from(0) {
        return Err("must be greater than zero".to_string());
    }
    if price.with_scale(2) != *price {
        return Err("must have at most two decimal places".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(s: &str) -> BigDecimal {
        BigDecimal::from_str(s).unwrap()
    }

    #[test]
    fn test_to_minor_units_converts_once() {
        assert_eq!(to_minor_units(&dec("500")), Some(50_000));
        assert_eq!(to_minor_units(&dec("10.5")), Some(1_050));
        assert_eq!(to_minor_units(&dec("0.01")), Some(1));
    }

    #[test]
    fn test_to_minor_units_rejects_fractional_paisa() {
        assert_eq!(to_minor_units(&dec("10.005")), None);
    }

    #[test]
    fn test_minor_round_trip_is_numeric_identity() {
        assert_eq!(from_minor_units(50_000), dec("500"));
        assert_eq!(from_minor_units(1_050), dec("10.50"));
    }

    #[test]
    fn test_format_major() {
        assert_eq!(format_major(&dec("500")), "500.00");
        assert_eq!(format_major(&dec("12.5")), "12.50");
    }

    #[test]
    fn test_validate_price() {
        assert!(validate_price(&dec("500")).is_ok());
        assert!(validate_price(&dec("0")).is_err());
        assert!(validate_price(&dec("-1")).is_err());
        assert!(validate_price(&dec("1.234")).is_err());
    }
}
