use crate::{common::Address, config::CommerceConfig, errors::ServiceError};
use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::instrument;

/// External tax-rate lookup. Failure to obtain a rate is a hard failure for
/// the enclosing operation; no default rate is silently assumed.
#[async_trait]
pub trait TaxRateSource: Send + Sync {
    /// Returns the tax rate as a percentage (e.g. `8.25`) for the address.
    async fn rate_for(&self, address: &Address) -> Result<Decimal, ServiceError>;
}

/// A priced line used for total computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PricedLine {
    pub unit_price: Decimal,
    pub quantity: i32,
}

impl PricedLine {
    pub fn total(&self) -> Decimal {
        self.unit_price * Decimal::from(self.quantity)
    }
}

/// Computed totals for a set of lines. The delivery fee is not taxed; tax
/// applies to the item subtotal only, uniformly across all flows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Totals {
    pub subtotal: Decimal,
    /// Percentage, e.g. 8.25
    pub tax_rate: Decimal,
    pub tax_amount: Decimal,
    pub delivery_fee: Decimal,
    /// subtotal + tax + delivery fee
    pub total: Decimal,
}

/// How the delivery fee is assessed for a given order shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeeBasis {
    /// Weekly subscription: fee per selected day
    SubscriptionDays(u32),
    /// Single delivery order: one flat fee
    OneTimeDelivery,
    /// Pickup orders carry no delivery fee
    Pickup,
}

#[derive(Clone)]
pub struct PricingService {
    tax_source: Arc<dyn TaxRateSource>,
    config: CommerceConfig,
}

impl PricingService {
    pub fn new(tax_source: Arc<dyn TaxRateSource>, config: CommerceConfig) -> Self {
        Self { tax_source, config }
    }

    /// Delivery fee under the free-delivery threshold rule. The threshold is
    /// inclusive: a subtotal exactly at the threshold ships free.
    pub fn delivery_fee(&self, subtotal: Decimal, basis: FeeBasis) -> Decimal {
        if subtotal >= self.config.free_delivery_threshold {
            return Decimal::ZERO;
        }
        match basis {
            FeeBasis::SubscriptionDays(days) => self.config.delivery_fee * Decimal::from(days),
            FeeBasis::OneTimeDelivery => self.config.delivery_fee,
            FeeBasis::Pickup => Decimal::ZERO,
        }
    }

    /// Computes subtotal, tax and delivery fee for a set of priced lines.
    /// Lines with non-positive quantity are ignored.
    #[instrument(skip(self, lines))]
    pub async fn compute_totals(
        &self,
        lines: &[PricedLine],
        billing_address: &Address,
        basis: FeeBasis,
    ) -> Result<Totals, ServiceError> {
        let subtotal: Decimal = lines
            .iter()
            .filter(|l| l.quantity > 0)
            .map(PricedLine::total)
            .sum();

        let tax_rate = self.tax_source.rate_for(billing_address).await?;
        let tax_amount = (subtotal * tax_rate / dec!(100)).round_dp(2);
        let delivery_fee = self.delivery_fee(subtotal, basis);

        Ok(Totals {
            subtotal,
            tax_rate,
            tax_amount,
            delivery_fee,
            total: subtotal + tax_amount + delivery_fee,
        })
    }

    /// Tax on an incremental amount at a known rate, for mid-cycle item
    /// additions where the order's snapshot rate applies.
    pub fn tax_on(&self, amount: Decimal, tax_rate: Decimal) -> Decimal {
        (amount * tax_rate / dec!(100)).round_dp(2)
    }
}
