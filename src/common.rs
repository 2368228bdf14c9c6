use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

/// Postal address used for billing snapshots, tax lookup and dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct Address {
    #[validate(length(min = 1))]
    pub line1: String,
    #[serde(default)]
    pub line2: Option<String>,
    #[validate(length(min = 1))]
    pub city: String,
    pub state: String,
    #[validate(length(min = 3))]
    pub postal_code: String,
    pub country: String,
}

impl Address {
    pub fn to_json_string(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_json_str(raw: &str) -> Option<Self> {
        serde_json::from_str(raw).ok()
    }
}

/// A requested (item, quantity) pair. For mutation operations the quantity is
/// the desired resulting quantity, not a delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemSelection {
    pub item_id: Uuid,
    pub quantity: i32,
}

/// Converts a decimal major-unit amount to minor currency units (cents),
/// rounding half-up. Used only at the payment-processor boundary.
pub fn to_minor_units(amount: Decimal) -> i64 {
    (amount * dec!(100))
        .round()
        .to_i64()
        .unwrap_or(i64::MAX)
}

/// Converts minor currency units back to a decimal major-unit amount.
pub fn from_minor_units(minor: i64) -> Decimal {
    Decimal::from(minor) / dec!(100)
}
