//! Deterministic fixed-point price encoding
//!
//! Prices travel on the wire as `round_toward_zero(price * 1e18)` rendered
//! as a base-10 string with the lowest 6 digits forced to zero. The floor
//! bounds payload size and normalizes rounding across implementations.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Number of decimal digits the price is shifted by.
const QUANTIZATION_DECIMALS: usize = 18;
/// Trailing digits forced to zero in the quantized string.
const PRECISION_FLOOR_DIGITS: usize = 6;

/// Fixed-point, precision-floored decimal-string encoding of a price.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QuantizedPrice(pub String);

impl QuantizedPrice {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QuantizedPrice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Quantize a price into its wire string.
///
/// Works on the shortest decimal rendering of the float, shifted 18 digits
/// and truncated toward zero, so the same input always yields the same
/// string. Non-finite inputs quantize to "0".
pub fn quantize(price: f64) -> QuantizedPrice {
    if !price.is_finite() {
        return QuantizedPrice("0".to_string());
    }

    let rendered = format!("{}", price);
    let (negative, unsigned) = match rendered.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, rendered.as_str()),
    };

    let (int_part, frac_part) = match unsigned.split_once('.') {
        Some((i, f)) => (i, f),
        None => (unsigned, ""),
    };

    // Shift by 18 digits: pad the fraction out, truncate anything beyond.
    let mut digits = String::with_capacity(int_part.len() + QUANTIZATION_DECIMALS);
    digits.push_str(int_part);
    if frac_part.len() >= QUANTIZATION_DECIMALS {
        digits.push_str(&frac_part[..QUANTIZATION_DECIMALS]);
    } else {
        digits.push_str(frac_part);
        digits.push_str(&"0".repeat(QUANTIZATION_DECIMALS - frac_part.len()));
    }

    let trimmed = digits.trim_start_matches('0');
    let mut value = if trimmed.is_empty() {
        "0".to_string()
    } else if negative {
        format!("-{}", trimmed)
    } else {
        trimmed.to_string()
    };

    if value.len() > PRECISION_FLOOR_DIGITS {
        let cut = value.len() - PRECISION_FLOOR_DIGITS;
        value.truncate(cut);
        value.push_str(&"0".repeat(PRECISION_FLOOR_DIGITS));
    }

    QuantizedPrice(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantize_known_values() {
        assert_eq!(
            quantize(72147.681412670819).as_str(),
            "72147681412670819000000"
        );
        assert_eq!(quantize(3.33595034988).as_str(), "3335950349880000000");
    }

    #[test]
    fn quantize_round_numbers() {
        assert_eq!(quantize(1.0).as_str(), "1000000000000000000");
        assert_eq!(quantize(2.0).as_str(), "2000000000000000000");
        assert_eq!(quantize(60000.0).as_str(), "60000000000000000000000");
    }

    #[test]
    fn quantize_zero() {
        assert_eq!(quantize(0.0).as_str(), "0");
        assert_eq!(quantize(-0.0).as_str(), "0");
    }

    #[test]
    fn quantize_negative_keeps_sign() {
        assert_eq!(quantize(-1.0).as_str(), "-1000000000000000000");
        assert_eq!(
            quantize(-3.33595034988).as_str(),
            "-3335950349880000000"
        );
    }

    #[test]
    fn quantize_tiny_value_truncates_toward_zero() {
        // 1e-19 shifts to 0.1 which truncates to zero.
        assert_eq!(quantize(1e-19).as_str(), "0");
    }

    #[test]
    fn last_six_digits_are_always_zero() {
        for price in [
            0.1,
            1.5,
            3.33595034988,
            72147.681412670819,
            98765.4321,
            1e-6,
            123456789.123456789,
        ] {
            let q = quantize(price);
            assert!(q.as_str().len() > PRECISION_FLOOR_DIGITS);
            assert!(
                q.as_str().ends_with("000000"),
                "expected precision floor on {}: {}",
                price,
                q
            );
        }
    }

    #[test]
    fn quantize_is_deterministic() {
        let a = quantize(72147.681412670819);
        let b = quantize(72147.681412670819);
        assert_eq!(a, b);
    }
}
