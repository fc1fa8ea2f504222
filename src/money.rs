//! Money conversion
//!
//! All ledger amounts are `u64` minor units (cents). Client-facing
//! decimal strings are converted at the boundary through this module;
//! the core never handles floats.

use rust_decimal::prelude::*;
use thiserror::Error;

/// Decimal places of the ledger currency (minor units = cents).
pub const CURRENCY_DECIMALS: u32 = 2;

/// Money conversion errors
#[derive(Debug, Error)]
pub enum MoneyError {
    #[error("Precision overflow: provided {provided} decimals, max allowed {max}")]
    PrecisionOverflow { provided: u32, max: u32 },

    #[error("Amount must be positive")]
    InvalidAmount,

    #[error("Amount too large, would overflow")]
    Overflow,

    #[error("Invalid format: {0}")]
    InvalidFormat(String),
}

/// Convert a client decimal string (e.g. "12.50") to minor units.
///
/// Rejects negative, zero, and over-precise inputs; no silent truncation.
pub fn parse_amount(amount_str: &str) -> Result<u64, MoneyError> {
    let amount_str = amount_str.trim();
    if amount_str.is_empty() {
        return Err(MoneyError::InvalidFormat("empty string".into()));
    }

    let decimal = Decimal::from_str(amount_str)
        .map_err(|e| MoneyError::InvalidFormat(e.to_string()))?;
    parse_decimal(decimal)
}

/// Convert a validated `Decimal` to minor units.
pub fn parse_decimal(decimal: Decimal) -> Result<u64, MoneyError> {
    if decimal.is_sign_negative() || decimal.is_zero() {
        return Err(MoneyError::InvalidAmount);
    }

    let normalized = decimal.normalize();
    if normalized.scale() > CURRENCY_DECIMALS {
        return Err(MoneyError::PrecisionOverflow {
            provided: normalized.scale(),
            max: CURRENCY_DECIMALS,
        });
    }

    let multiplier = Decimal::from(10u64.pow(CURRENCY_DECIMALS));
    let result = normalized
        .checked_mul(multiplier)
        .ok_or(MoneyError::Overflow)?;

    result.to_u64().ok_or(MoneyError::Overflow)
}

/// Convert minor units to a display string ("1250" -> "12.50").
pub fn format_amount(value: u64) -> String {
    let divisor = 10u64.pow(CURRENCY_DECIMALS);
    format!(
        "{}.{:0width$}",
        value / divisor,
        value % divisor,
        width = CURRENCY_DECIMALS as usize
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_amount_basic() {
        assert_eq!(parse_amount("12.50").unwrap(), 1250);
        assert_eq!(parse_amount("100").unwrap(), 10000);
        assert_eq!(parse_amount("0.01").unwrap(), 1);
    }

    #[test]
    fn test_parse_amount_rejects_bad_input() {
        assert!(matches!(parse_amount("0"), Err(MoneyError::InvalidAmount)));
        assert!(matches!(
            parse_amount("-5"),
            Err(MoneyError::InvalidAmount)
        ));
        assert!(matches!(
            parse_amount("1.005"),
            Err(MoneyError::PrecisionOverflow { .. })
        ));
        assert!(matches!(
            parse_amount("abc"),
            Err(MoneyError::InvalidFormat(_))
        ));
        assert!(matches!(
            parse_amount(""),
            Err(MoneyError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_format_amount() {
        assert_eq!(format_amount(1250), "12.50");
        assert_eq!(format_amount(5), "0.05");
        assert_eq!(format_amount(0), "0.00");
    }

    #[test]
    fn test_parse_format_inverse() {
        let v = parse_amount("49.00").unwrap();
        assert_eq!(format_amount(v), "49.00");
    }
}
