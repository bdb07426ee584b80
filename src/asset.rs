//! Asset identifiers and fixed-point amount formatting
//!
//! Every amount in the engine is an unsigned integer count of base units. The
//! asset scale is the decimal exponent that turns base units into display
//! units, so `100` with scale `8` reads as `0.00000100`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Amount of base units
pub type Amount = u64;

/// Largest scale whose `10^scale` still fits in a `u64`
pub const MAX_ASSET_SCALE: u8 = 19;

/// Asset code and scale used on one side of a connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetDetails {
    /// Asset code, e.g. `BSV`
    pub code: String,
    /// Decimal exponent of the base unit
    pub scale: u8,
}

impl Default for AssetDetails {
    fn default() -> Self {
        Self {
            code: "BSV".to_string(),
            scale: 8,
        }
    }
}

impl AssetDetails {
    /// Create new asset details
    pub fn new<S: Into<String>>(code: S, scale: u8) -> Self {
        Self {
            code: code.into(),
            scale,
        }
    }

    /// Check that the scale can be represented
    pub fn is_valid(&self) -> bool {
        !self.code.is_empty() && self.scale <= MAX_ASSET_SCALE
    }

    /// Format an amount of base units as a decimal string without the code
    pub fn format_units(&self, amount: Amount) -> String {
        if self.scale == 0 {
            return amount.to_string();
        }
        let scale = u32::from(self.scale.min(MAX_ASSET_SCALE));
        let divisor = 10u64.pow(scale);
        format!(
            "{}.{:0width$}",
            amount / divisor,
            amount % divisor,
            width = scale as usize
        )
    }

    /// Format an amount with the asset code appended
    pub fn format(&self, amount: Amount) -> String {
        format!("{} {}", self.format_units(amount), self.code)
    }
}

impl fmt::Display for AssetDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (scale {})", self.code, self.scale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_default_asset() {
        let asset = AssetDetails::default();
        assert_eq!(asset.format(100), "0.00000100 BSV");
        assert_eq!(asset.format_units(123_456_789), "1.23456789");
    }

    #[test]
    fn test_format_zero_scale() {
        let asset = AssetDetails::new("XRP", 0);
        assert_eq!(asset.format_units(42), "42");
    }

    #[test]
    fn test_format_max_values() {
        let asset = AssetDetails::new("BIG", MAX_ASSET_SCALE);
        assert_eq!(asset.format_units(u64::MAX), "1.8446744073709551615");
        assert!(asset.is_valid());
        assert!(!AssetDetails::new("BIG", 20).is_valid());
        assert!(!AssetDetails::new("", 2).is_valid());
    }
}
