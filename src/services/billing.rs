use crate::{
    common::to_minor_units,
    entities::{order, subscription},
    errors::ServiceError,
    events::{Event, EventSender},
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Which billing cycle an amount update targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOffset {
    /// The currently billed cycle (the ACTIVE order)
    Current,
    /// The next, not-yet-billed cycle (the UPCOMING order)
    Next,
}

/// Request to open a recurring agreement with the processor.
#[derive(Debug, Clone)]
pub struct CreateAgreementRequest {
    pub customer_id: Uuid,
    pub payment_method: String,
    /// Recurring unit amount in minor currency units; tax is attached as a
    /// separate rate on the recurring line, never compounded into the amount
    pub amount_minor: i64,
    pub tax_rate: Decimal,
    pub currency: String,
    /// First billing date; when this is tomorrow the first invoice is charged
    /// immediately, otherwise the agreement anchors to the future date
    pub billing_anchor: NaiveDate,
}

#[derive(Debug, Clone)]
pub struct ProviderAgreement {
    pub subscription_id: String,
    pub price_id: String,
    /// Whether the first invoice was charged at creation
    pub charged_now: bool,
    pub current_period_end: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ChargeOutcome {
    pub charge_id: String,
    pub amount_minor: i64,
}

/// Contract the core requires from the payment processor's recurring-billing
/// surface. Every call reports a typed outcome; declines surface as
/// `ServiceError::PaymentDeclined` with the processor's sub-kind.
#[async_trait]
pub trait RecurringBillingProvider: Send + Sync {
    async fn create_agreement(
        &self,
        request: CreateAgreementRequest,
    ) -> Result<ProviderAgreement, ServiceError>;

    /// Full re-push of the recurring unit amount for one cycle. Always the
    /// authoritative order total, never an incremental patch.
    async fn update_agreement_amount(
        &self,
        subscription_id: &str,
        price_id: &str,
        amount_minor: i64,
        cycle: CycleOffset,
    ) -> Result<(), ServiceError>;

    /// One-off charge against a stored payment method. The idempotency key is
    /// client-generated and tied to the owning mutation.
    async fn charge(
        &self,
        customer_id: Uuid,
        payment_method: &str,
        amount_minor: i64,
        idempotency_key: &str,
    ) -> Result<ChargeOutcome, ServiceError>;

    /// Refund against the subscription's most recent invoice.
    async fn refund_latest_invoice(
        &self,
        subscription_id: &str,
        amount_minor: i64,
        idempotency_key: &str,
    ) -> Result<(), ServiceError>;

    /// Refund against a specific one-off charge.
    async fn refund_charge(
        &self,
        charge_id: &str,
        amount_minor: i64,
        idempotency_key: &str,
    ) -> Result<(), ServiceError>;

    async fn pause_collection(&self, subscription_id: &str) -> Result<(), ServiceError>;

    async fn resume_collection(&self, subscription_id: &str) -> Result<(), ServiceError>;

    async fn cancel(&self, subscription_id: &str, at_period_end: bool) -> Result<(), ServiceError>;
}

/// Keeps the externally billed recurring amount in lockstep with the local
/// order totals. The single sync point for every mutation: the amount is
/// re-derived from the authoritative `Order.total_amount` and re-pushed in
/// full, so processor-side drift cannot accumulate.
#[derive(Clone)]
pub struct BillingSyncService {
    provider: Arc<dyn RecurringBillingProvider>,
    event_sender: Arc<EventSender>,
}

impl BillingSyncService {
    pub fn new(
        provider: Arc<dyn RecurringBillingProvider>,
        event_sender: Arc<EventSender>,
    ) -> Self {
        Self {
            provider,
            event_sender,
        }
    }

    pub fn provider(&self) -> &Arc<dyn RecurringBillingProvider> {
        &self.provider
    }

    /// Pushes the billed amount for the cycle owning `order`. The billed
    /// amount is the pre-tax item total plus delivery fees; the tax rate rides
    /// on the recurring line separately.
    #[instrument(skip(self, sub, order), fields(subscription_id = %sub.id, order_id = %order.id))]
    pub async fn sync_billed_amount(
        &self,
        sub: &subscription::Model,
        order: &order::Model,
        cycle: CycleOffset,
    ) -> Result<(), ServiceError> {
        let amount_minor = to_minor_units(order.total_amount + order.delivery_fees);

        self.provider
            .update_agreement_amount(
                &sub.external_subscription_id,
                &sub.external_price_id,
                amount_minor,
                cycle,
            )
            .await?;

        info!(amount_minor, ?cycle, "recurring billed amount synced");

        if let Err(e) = self
            .event_sender
            .send(Event::BillingAmountSynced {
                subscription_id: sub.id,
                amount_minor,
                next_cycle: matches!(cycle, CycleOffset::Next),
            })
            .await
        {
            warn!(error = %e, "failed to emit billing sync event");
        }
        Ok(())
    }
}
