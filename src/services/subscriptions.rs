use crate::{
    common::{to_minor_units, Address, ItemSelection},
    config::CommerceConfig,
    db::DbPool,
    entities::{
        customer, order,
        order::{OrderStatus, PlanType},
        order_item, preference_order, preference_sub_order, sub_order,
        sub_order::{Fulfillment, SubOrderStatus},
        subscription,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::{
        billing::{BillingSyncService, CreateAgreementRequest, CycleOffset},
        catalog::{CatalogItem, CatalogSource},
        dispatch::{DeliveryDispatcher, DeliveryManifest},
        notifications::NotificationService,
        pricing::{FeeBasis, PricedLine, PricingService},
        wallet::{split_payment, PaymentSplit, WalletService},
    },
};
use chrono::{Datelike, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseTransaction, EntityTrait, ModelTrait, QueryFilter, Set,
    TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

/// One selected delivery day at subscription signup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaySelection {
    pub delivery_date: NaiveDate,
    pub slot_id: String,
    pub items: Vec<ItemSelection>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateSubscriptionRequest {
    pub customer_id: Uuid,
    #[validate(length(min = 1, message = "Payment method is required"))]
    pub payment_method: String,
    pub fulfillment: Fulfillment,
    #[validate(length(min = 1, max = 7, message = "Select between 1 and 7 delivery days"))]
    pub days: Vec<DaySelection>,
    pub coupon_code: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionCreated {
    pub subscription_id: Uuid,
    pub active_order_id: Uuid,
    pub upcoming_order_id: Uuid,
    /// Whether the first invoice was charged at signup
    pub charged_now: bool,
    pub weekly_total: Decimal,
    pub delivery_fees: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AddExtraItemsRequest {
    pub sub_order_id: Uuid,
    /// Desired resulting quantities; deltas against stored quantities must be
    /// non-negative
    #[validate(length(min = 1, message = "At least one item is required"))]
    pub items: Vec<ItemSelection>,
    pub use_wallet: bool,
    /// Charge the delta immediately; when false it rides on the next invoice
    /// through the recurring amount re-push
    pub pay_now: bool,
    pub save_to_upcoming: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddExtraItemsResult {
    pub sub_order_id: Uuid,
    pub amount_due: Decimal,
    pub wallet_used: Decimal,
    pub card_charged: Decimal,
    pub order_total: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct UpdateUpcomingItemsRequest {
    pub sub_order_id: Uuid,
    /// Desired resulting quantities; zero deletes the line
    #[validate(length(min = 1, message = "At least one item is required"))]
    pub items: Vec<ItemSelection>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipAction {
    Skip,
    Unskip,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemRefund {
    pub item_id: Uuid,
    /// Target cumulative refund quantity; a repeat call with the same target
    /// is a no-op
    pub refund_quantity: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundResult {
    pub sub_order_id: Uuid,
    pub refunded_amount: Decimal,
    pub sub_order_status: SubOrderStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelSubscriptionRequest {
    pub subscription_id: Uuid,
    pub reason: Option<String>,
    pub cancel_at_period_end: bool,
}

/// Owns the subscription order lifecycle: paired current/upcoming orders,
/// their daily sub-orders, and the reconciliation between local totals, the
/// wallet and the externally billed recurring amount.
///
/// Every mutation follows the same discipline: re-read persisted state inside
/// a transaction, validate status preconditions, make the payment call the
/// last step before commit (under a client-generated idempotency key), and
/// re-push the authoritative billed amount afterwards. Dispatch and
/// notification calls run after commit and never roll anything back.
#[derive(Clone)]
pub struct SubscriptionOrchestrator {
    db: Arc<DbPool>,
    pricing: Arc<PricingService>,
    wallet: Arc<WalletService>,
    billing: Arc<BillingSyncService>,
    catalog: Arc<dyn CatalogSource>,
    dispatcher: Arc<dyn DeliveryDispatcher>,
    notifications: Arc<NotificationService>,
    event_sender: Arc<EventSender>,
    config: CommerceConfig,
}

impl SubscriptionOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<DbPool>,
        pricing: Arc<PricingService>,
        wallet: Arc<WalletService>,
        billing: Arc<BillingSyncService>,
        catalog: Arc<dyn CatalogSource>,
        dispatcher: Arc<dyn DeliveryDispatcher>,
        notifications: Arc<NotificationService>,
        event_sender: Arc<EventSender>,
        config: CommerceConfig,
    ) -> Self {
        Self {
            db,
            pricing,
            wallet,
            billing,
            catalog,
            dispatcher,
            notifications,
            event_sender,
            config,
        }
    }

    // ------------------------------------------------------------------
    // CreateSubscription
    // ------------------------------------------------------------------

    /// Creates the recurring agreement and the paired ACTIVE/UPCOMING orders.
    ///
    /// The recurring amount equals the pre-tax item total plus delivery fees;
    /// tax rides on the agreement as a separate rate. When the billing anchor
    /// is tomorrow the processor charges the first invoice immediately,
    /// otherwise the agreement anchors to the future date uncharged.
    #[instrument(skip(self, request), fields(customer_id = %request.customer_id))]
    pub async fn create_subscription(
        &self,
        request: CreateSubscriptionRequest,
    ) -> Result<SubscriptionCreated, ServiceError> {
        request.validate()?;
        validate_distinct_dates(&request.days)?;

        let customer = self.load_customer(&*self.db, request.customer_id).await?;
        let billing_address = self.require_billing_address(&customer)?;

        let existing = subscription::Entity::find()
            .filter(subscription::Column::CustomerId.eq(customer.id))
            .filter(subscription::Column::IsActive.eq(true))
            .one(&*self.db)
            .await?;
        if let Some(active) = existing {
            return Err(ServiceError::DuplicateSubscription(format!(
                "customer already has active subscription {}",
                active.id
            )));
        }

        let catalog = self.load_catalog(&request.days).await?;
        for day in &request.days {
            for sel in &day.items {
                let item = catalog_item(&catalog, sel.item_id)?;
                ensure_quantity_in_bounds(item, sel.quantity)?;
            }
        }

        let lines: Vec<PricedLine> = request
            .days
            .iter()
            .flat_map(|d| d.items.iter())
            .map(|sel| PricedLine {
                unit_price: catalog[&sel.item_id].unit_price,
                quantity: sel.quantity,
            })
            .collect();

        let day_count = request.days.len() as u32;
        let totals = self
            .pricing
            .compute_totals(&lines, &billing_address, FeeBasis::SubscriptionDays(day_count))
            .await?;

        let first_delivery_date = request
            .days
            .iter()
            .map(|d| d.delivery_date)
            .min()
            .expect("validated non-empty");

        // Recurring amount: item total plus delivery fees, pre-tax
        let agreement = self
            .billing
            .provider()
            .create_agreement(CreateAgreementRequest {
                customer_id: customer.id,
                payment_method: request.payment_method.clone(),
                amount_minor: to_minor_units(totals.subtotal + totals.delivery_fee),
                tax_rate: totals.tax_rate,
                currency: self.config.currency.clone(),
                billing_anchor: first_delivery_date,
            })
            .await?;

        // The customer may already have been charged; from here on persistence
        // must run to completion, so retry transient failures instead of
        // abandoning them.
        let mut attempt = 0u32;
        let created = loop {
            match self
                .persist_signup(&request, &customer, &catalog, &totals, &agreement, first_delivery_date)
                .await
            {
                Ok(created) => break created,
                Err(e) if attempt < 2 && matches!(e, ServiceError::DatabaseError(_)) => {
                    attempt += 1;
                    warn!(error = %e, attempt, "signup persistence failed after payment, retrying");
                }
                Err(e) => {
                    error!(error = %e, "signup persistence failed after agreement creation");
                    return Err(e);
                }
            }
        };

        self.dispatch_active_order(created.active_order_id).await;

        self.emit(Event::SubscriptionCreated {
            subscription_id: created.subscription_id,
            customer_id: customer.id,
        })
        .await;
        self.emit(Event::OrderCreated(created.active_order_id)).await;
        self.emit(Event::OrderCreated(created.upcoming_order_id)).await;

        self.notifications
            .notify(
                "subscription_created",
                &customer.email,
                serde_json::json!({
                    "subscription_id": created.subscription_id,
                    "first_delivery_date": first_delivery_date,
                    "weekly_total": created.weekly_total,
                }),
            )
            .await;

        info!(subscription_id = %created.subscription_id, "subscription created");
        Ok(created)
    }

    async fn persist_signup(
        &self,
        request: &CreateSubscriptionRequest,
        customer: &customer::Model,
        catalog: &HashMap<Uuid, CatalogItem>,
        totals: &crate::services::pricing::Totals,
        agreement: &crate::services::billing::ProviderAgreement,
        first_delivery_date: NaiveDate,
    ) -> Result<SubscriptionCreated, ServiceError> {
        let txn = self.db.begin().await?;
        let now = Utc::now();
        let subscription_id = Uuid::new_v4();

        subscription::ActiveModel {
            id: Set(subscription_id),
            customer_id: Set(customer.id),
            external_subscription_id: Set(agreement.subscription_id.clone()),
            external_price_id: Set(agreement.price_id.clone()),
            is_active: Set(true),
            is_paused: Set(false),
            cancel_at_period_end: Set(false),
            first_delivery_date: Set(first_delivery_date),
            current_period_end: Set(agreement.current_period_end),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await?;

        let paid_now = if agreement.charged_now {
            totals.total
        } else {
            Decimal::ZERO
        };

        let active_order_id = self
            .insert_order_with_days(
                &txn,
                customer,
                Some(subscription_id),
                OrderStatus::Active,
                request,
                catalog,
                totals,
                paid_now,
                0,
            )
            .await?;
        let upcoming_order_id = self
            .insert_order_with_days(
                &txn,
                customer,
                Some(subscription_id),
                OrderStatus::Upcoming,
                request,
                catalog,
                totals,
                Decimal::ZERO,
                7,
            )
            .await?;

        // Seed the weekly preference template from the upcoming selection
        let preference_order_id = Uuid::new_v4();
        preference_order::ActiveModel {
            id: Set(preference_order_id),
            subscription_id: Set(subscription_id),
            customer_id: Set(customer.id),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await?;

        for day in &request.days {
            let weekday = day.delivery_date.weekday().num_days_from_monday() as i16;
            preference_sub_order::ActiveModel {
                id: Set(Uuid::new_v4()),
                preference_order_id: Set(preference_order_id),
                weekday: Set(weekday),
                slot_id: Set(day.slot_id.clone()),
                items: Set(serde_json::to_value(&day.items)
                    .map_err(|e| ServiceError::InternalError(e.to_string()))?),
                created_at: Set(now),
                updated_at: Set(now),
            }
            .insert(&txn)
            .await?;
        }

        txn.commit().await?;

        Ok(SubscriptionCreated {
            subscription_id,
            active_order_id,
            upcoming_order_id,
            charged_now: agreement.charged_now,
            weekly_total: totals.subtotal,
            delivery_fees: totals.delivery_fee,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn insert_order_with_days(
        &self,
        txn: &DatabaseTransaction,
        customer: &customer::Model,
        subscription_id: Option<Uuid>,
        status: OrderStatus,
        request: &CreateSubscriptionRequest,
        catalog: &HashMap<Uuid, CatalogItem>,
        totals: &crate::services::pricing::Totals,
        paid_amount: Decimal,
        day_offset: i64,
    ) -> Result<Uuid, ServiceError> {
        let now = Utc::now();
        let order_id = Uuid::new_v4();

        order::ActiveModel {
            id: Set(order_id),
            order_number: Set(order_number()),
            customer_id: Set(customer.id),
            subscription_id: Set(subscription_id),
            plan_type: Set(PlanType::Subscription),
            status: Set(status),
            total_amount: Set(totals.subtotal),
            paid_amount: Set(paid_amount),
            delivery_fees: Set(totals.delivery_fee),
            tax_rate: Set(totals.tax_rate),
            currency: Set(self.config.currency.clone()),
            billing_address: Set(customer.billing_address.clone()),
            shipping_address: Set(customer
                .shipping_address
                .clone()
                .or_else(|| customer.billing_address.clone())),
            coupon_code: Set(request.coupon_code.clone()),
            charge_reference: Set(None),
            version: Set(1),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(txn)
        .await?;

        for day in &request.days {
            let sub_order_id = Uuid::new_v4();
            let day_total: Decimal = day
                .items
                .iter()
                .map(|sel| catalog[&sel.item_id].unit_price * Decimal::from(sel.quantity))
                .sum();

            sub_order::ActiveModel {
                id: Set(sub_order_id),
                sub_order_number: Set(sub_order_number()),
                order_id: Set(order_id),
                delivery_date: Set(day.delivery_date + Duration::days(day_offset)),
                slot_id: Set(day.slot_id.clone()),
                fulfillment: Set(request.fulfillment),
                status: Set(SubOrderStatus::Accepted),
                total: Set(day_total),
                dispatch_reference: Set(None),
                created_at: Set(now),
                updated_at: Set(now),
            }
            .insert(txn)
            .await?;

            for sel in &day.items {
                let item = &catalog[&sel.item_id];
                order_item::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    sub_order_id: Set(sub_order_id),
                    item_id: Set(sel.item_id),
                    name: Set(item.name.clone()),
                    quantity: Set(sel.quantity),
                    refund_quantity: Set(0),
                    unit_price: Set(item.unit_price),
                    created_at: Set(now),
                    updated_at: Set(now),
                }
                .insert(txn)
                .await?;
            }
        }

        Ok(order_id)
    }

    // ------------------------------------------------------------------
    // AddExtraItems
    // ------------------------------------------------------------------

    /// Adds items to an ACTIVE sub-order. With `pay_now` the delta plus tax is
    /// collected immediately via a wallet/card split; otherwise nothing is
    /// charged here and the delta rides on the next invoice through the billed
    /// amount re-push. With `save_to_upcoming` the same delta is mirrored onto
    /// the matching UPCOMING sub-order (same weekday, 7 days later) and the
    /// preference template, and both cycles' billed amounts are synced.
    #[instrument(skip(self, request), fields(sub_order_id = %request.sub_order_id))]
    pub async fn add_extra_items(
        &self,
        request: AddExtraItemsRequest,
    ) -> Result<AddExtraItemsResult, ServiceError> {
        request.validate()?;

        let txn = self.db.begin().await?;

        let (sub, order) = self
            .load_sub_order(&txn, request.sub_order_id, OrderStatus::Active)
            .await?;
        ensure_sub_order_status(&sub, SubOrderStatus::Accepted)?;

        let customer = self.load_customer(&txn, order.customer_id).await?;
        let existing = sub
            .find_related(order_item::Entity)
            .all(&txn)
            .await?;
        let catalog = self.load_catalog_for_items(&request.items).await?;

        let deltas = compute_increment_deltas(&request.items, &existing, &catalog)?;
        let delta_total: Decimal = deltas.iter().map(|d| d.value()).sum();
        if delta_total <= Decimal::ZERO {
            return Err(ServiceError::ValidationError(
                "no additional quantities requested".into(),
            ));
        }

        let (amount_due, split) = if request.pay_now {
            let tax = self.pricing.tax_on(delta_total, order.tax_rate);
            let due = delta_total + tax;
            let balance = self.wallet.balance(&txn, customer.id).await?;
            let split = split_payment(
                balance,
                due,
                request.use_wallet,
                self.config.min_chargeable_amount,
            );
            (due, split)
        } else {
            // Deferred: the sync below re-pushes the grown total, so the
            // processor collects it with the next invoice, tax as the
            // agreement's rate.
            (Decimal::ZERO, PaymentSplit::card_only(Decimal::ZERO))
        };

        apply_item_deltas(&txn, sub.id, &deltas, &catalog).await?;

        let new_sub_total = sub.total + delta_total;
        let mut sub_am: sub_order::ActiveModel = sub.clone().into();
        sub_am.total = Set(new_sub_total);
        sub_am.updated_at = Set(Utc::now());
        sub_am.update(&txn).await?;

        // Retrying the same resulting quantities yields an empty delta and
        // never reaches the processor, so the key only has to be unique per
        // mutation.
        let idempotency_key = format!("add-items:{}:{}", sub.id, Uuid::new_v4().simple());
        let new_order_total = order.total_amount + delta_total;
        update_order_guarded(
            &txn,
            &order,
            order::ActiveModel {
                total_amount: Set(new_order_total),
                paid_amount: Set(order.paid_amount + amount_due),
                ..Default::default()
            },
        )
        .await?;

        if request.save_to_upcoming {
            self.mirror_delta_to_upcoming(&txn, &order, &sub, &deltas, &catalog)
                .await?;
        }

        if split.wallet_deduction > Decimal::ZERO {
            self.wallet
                .debit(
                    &txn,
                    customer.id,
                    split.wallet_deduction,
                    &format!("Extra items on {}", sub.sub_order_number),
                    Some(order.id),
                    Some(sub.id),
                )
                .await?;
        }

        // Card call is the last step before commit; wallet-covered payments
        // skip the processor entirely.
        if split.card_amount > Decimal::ZERO {
            self.billing
                .provider()
                .charge(
                    customer.id,
                    "default",
                    to_minor_units(split.card_amount),
                    &idempotency_key,
                )
                .await?;
        }

        txn.commit().await?;

        self.sync_cycles(order.subscription_id, request.save_to_upcoming)
            .await;
        self.redispatch_sub_order(sub.id).await;

        self.emit(Event::ItemsAdded {
            sub_order_id: sub.id,
            amount_paid: amount_due,
            saved_to_upcoming: request.save_to_upcoming,
        })
        .await;
        if split.wallet_deduction > Decimal::ZERO {
            self.emit(Event::WalletDebited {
                customer_id: customer.id,
                amount: split.wallet_deduction,
            })
            .await;
        }

        self.notifications
            .notify(
                "items_added",
                &customer.email,
                serde_json::json!({
                    "sub_order": sub.sub_order_number,
                    "amount": amount_due,
                }),
            )
            .await;

        Ok(AddExtraItemsResult {
            sub_order_id: sub.id,
            amount_due,
            wallet_used: split.wallet_deduction,
            card_charged: split.card_amount,
            order_total: new_order_total,
        })
    }

    /// Applies the same item delta to the matching upcoming sub-order (same
    /// weekday, 7 days later) and to the preference template.
    async fn mirror_delta_to_upcoming(
        &self,
        txn: &DatabaseTransaction,
        active_order: &order::Model,
        active_sub: &sub_order::Model,
        deltas: &[ItemDelta],
        catalog: &HashMap<Uuid, CatalogItem>,
    ) -> Result<(), ServiceError> {
        let subscription_id = active_order.subscription_id.ok_or_else(|| {
            ServiceError::InvalidOperation("order has no owning subscription".into())
        })?;

        let (upcoming, sub_orders) = self
            .project_cycle(txn, subscription_id, CycleOffset::Next)
            .await?;

        // Only an Accepted day can take the mirrored delta; a Skipped day has
        // already been compensated through the wallet.
        let target_date = active_sub.delivery_date + Duration::days(7);
        let Some(target) = sub_orders
            .iter()
            .find(|s| s.delivery_date == target_date && s.status == SubOrderStatus::Accepted)
        else {
            warn!(%target_date, "no accepted upcoming sub-order to mirror onto");
            return Ok(());
        };

        apply_item_deltas(txn, target.id, deltas, catalog).await?;

        let delta_total: Decimal = deltas.iter().map(|d| d.value()).sum();
        let mut target_am: sub_order::ActiveModel = target.clone().into();
        target_am.total = Set(target.total + delta_total);
        target_am.updated_at = Set(Utc::now());
        target_am.update(txn).await?;

        update_order_guarded(
            txn,
            &upcoming,
            order::ActiveModel {
                total_amount: Set(upcoming.total_amount + delta_total),
                ..Default::default()
            },
        )
        .await?;

        self.update_preference_manifest(txn, subscription_id, target_date, |items| {
            for delta in deltas {
                match items.iter_mut().find(|i| i.item_id == delta.item_id) {
                    Some(entry) => entry.quantity += delta.quantity,
                    None => items.push(ItemSelection {
                        item_id: delta.item_id,
                        quantity: delta.quantity,
                    }),
                }
            }
        })
        .await
    }

    // ------------------------------------------------------------------
    // UpdateUpcomingItems
    // ------------------------------------------------------------------

    /// Rewrites an UPCOMING sub-order's quantities. No payment is taken now;
    /// only the next cycle's billed amount changes. Lines whose resulting
    /// quantity is zero are deleted rather than retained at zero.
    #[instrument(skip(self, request), fields(sub_order_id = %request.sub_order_id))]
    pub async fn update_upcoming_items(
        &self,
        request: UpdateUpcomingItemsRequest,
    ) -> Result<Decimal, ServiceError> {
        request.validate()?;

        let txn = self.db.begin().await?;

        let (sub, order) = self
            .load_sub_order(&txn, request.sub_order_id, OrderStatus::Upcoming)
            .await?;
        ensure_sub_order_status(&sub, SubOrderStatus::Accepted)?;

        let existing = sub.find_related(order_item::Entity).all(&txn).await?;
        let catalog = self.load_catalog_for_items(&request.items).await?;
        let now = Utc::now();

        for sel in &request.items {
            let item = catalog_item(&catalog, sel.item_id)?;
            if sel.quantity < 0 {
                return Err(ServiceError::ValidationError(format!(
                    "negative quantity for item {}",
                    sel.item_id
                )));
            }
            if sel.quantity > 0 {
                ensure_quantity_in_bounds(item, sel.quantity)?;
            }

            match existing.iter().find(|e| e.item_id == sel.item_id) {
                Some(line) if sel.quantity == 0 => {
                    order_item::Entity::delete_by_id(line.id).exec(&txn).await?;
                }
                Some(line) if line.quantity != sel.quantity => {
                    let mut am: order_item::ActiveModel = line.clone().into();
                    am.quantity = Set(sel.quantity);
                    am.updated_at = Set(now);
                    am.update(&txn).await?;
                }
                Some(_) => {}
                None if sel.quantity > 0 => {
                    order_item::ActiveModel {
                        id: Set(Uuid::new_v4()),
                        sub_order_id: Set(sub.id),
                        item_id: Set(sel.item_id),
                        name: Set(item.name.clone()),
                        quantity: Set(sel.quantity),
                        refund_quantity: Set(0),
                        unit_price: Set(item.unit_price),
                        created_at: Set(now),
                        updated_at: Set(now),
                    }
                    .insert(&txn)
                    .await?;
                }
                None => {}
            }
        }

        let new_sub_total = self.recompute_sub_order_total(&txn, &sub).await?;
        let new_order_total = self
            .recompute_order_totals(&txn, &order, FeeBasisHint::Subscription)
            .await?;

        let target_date = sub.delivery_date;
        if let Some(subscription_id) = order.subscription_id {
            let final_items = sub_order::Entity::find_by_id(sub.id)
                .one(&txn)
                .await?
                .ok_or_else(|| ServiceError::NotFound("Sub-order vanished".into()))?
                .find_related(order_item::Entity)
                .all(&txn)
                .await?;
            let manifest: Vec<ItemSelection> = final_items
                .iter()
                .map(|i| ItemSelection {
                    item_id: i.item_id,
                    quantity: i.quantity,
                })
                .collect();
            self.update_preference_manifest(&txn, subscription_id, target_date, |items| {
                *items = manifest.clone();
            })
            .await?;
        }

        txn.commit().await?;

        self.sync_cycles_for(order.subscription_id, CycleOffset::Next)
            .await;

        self.emit(Event::UpcomingItemsUpdated {
            sub_order_id: sub.id,
            new_total: new_sub_total,
        })
        .await;

        Ok(new_order_total)
    }

    // ------------------------------------------------------------------
    // Skip / Unskip
    // ------------------------------------------------------------------

    /// Skips a day (crediting the wallet with its unrefunded value) or
    /// reverses a skip (debiting the wallet, which must cover the amount).
    /// Only allowed outside the action-cutoff window.
    #[instrument(skip(self), fields(sub_order_id = %sub_order_id, ?action))]
    pub async fn skip_unskip(
        &self,
        sub_order_id: Uuid,
        action: SkipAction,
    ) -> Result<SubOrderStatus, ServiceError> {
        let txn = self.db.begin().await?;

        let sub = sub_order::Entity::find_by_id(sub_order_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Sub-order {} not found", sub_order_id)))?;
        let order = self.load_order(&txn, sub.order_id).await?;
        if order.status != OrderStatus::Active && order.status != OrderStatus::Upcoming {
            return Err(ServiceError::Conflict(format!(
                "order {} is no longer mutable",
                order.order_number
            )));
        }

        self.ensure_outside_cutoff(sub.delivery_date)?;

        let items = sub.find_related(order_item::Entity).all(&txn).await?;
        let amount: Decimal = items.iter().map(|i| i.unrefunded_value()).sum();
        let customer = self.load_customer(&txn, order.customer_id).await?;

        let new_status = match action {
            SkipAction::Skip => {
                ensure_sub_order_status(&sub, SubOrderStatus::Accepted)?;
                self.wallet
                    .credit(
                        &txn,
                        customer.id,
                        amount,
                        &format!("Skipped {}", sub.sub_order_number),
                        Some(order.id),
                        Some(sub.id),
                    )
                    .await?;
                SubOrderStatus::Skipped
            }
            SkipAction::Unskip => {
                ensure_sub_order_status(&sub, SubOrderStatus::Skipped)?;
                self.wallet
                    .debit(
                        &txn,
                        customer.id,
                        amount,
                        &format!("Unskipped {}", sub.sub_order_number),
                        Some(order.id),
                        Some(sub.id),
                    )
                    .await?;
                SubOrderStatus::Accepted
            }
        };

        let mut sub_am: sub_order::ActiveModel = sub.clone().into();
        sub_am.status = Set(new_status);
        sub_am.updated_at = Set(Utc::now());
        sub_am.update(&txn).await?;

        txn.commit().await?;

        // Billing is untouched by a skip (the wallet credit compensates the
        // already-billed amount), but the sync point still runs so the
        // external amount is re-derived after every mutation.
        self.sync_cycles_for(
            order.subscription_id,
            if order.status == OrderStatus::Active {
                CycleOffset::Current
            } else {
                CycleOffset::Next
            },
        )
        .await;

        if order.status == OrderStatus::Active {
            match action {
                SkipAction::Skip => {
                    if let Some(reference) = sub.dispatch_reference.as_deref() {
                        if let Err(e) = self.dispatcher.cancel_delivery(reference).await {
                            warn!(error = %e, "failed to cancel dispatched delivery for skip");
                        }
                    }
                }
                SkipAction::Unskip => self.redispatch_sub_order(sub.id).await,
            }
        }

        match action {
            SkipAction::Skip => {
                self.emit(Event::SubOrderSkipped {
                    sub_order_id: sub.id,
                    credited: amount,
                })
                .await;
                self.emit(Event::WalletCredited {
                    customer_id: customer.id,
                    amount,
                })
                .await;
            }
            SkipAction::Unskip => {
                self.emit(Event::SubOrderUnskipped {
                    sub_order_id: sub.id,
                    debited: amount,
                })
                .await;
                self.emit(Event::WalletDebited {
                    customer_id: customer.id,
                    amount,
                })
                .await;
            }
        }

        Ok(new_status)
    }

    // ------------------------------------------------------------------
    // SwitchDeliveryDate
    // ------------------------------------------------------------------

    /// Moves a sub-order to a new date and slot, items unchanged. The target
    /// date must be free within the order and outside the cutoff window.
    #[instrument(skip(self), fields(order_id = %order_id, sub_order_id = %sub_order_id, %to_date))]
    pub async fn switch_delivery_date(
        &self,
        order_id: Uuid,
        sub_order_id: Uuid,
        to_date: NaiveDate,
        to_slot_id: String,
    ) -> Result<(), ServiceError> {
        let txn = self.db.begin().await?;

        let order = self.load_order(&txn, order_id).await?;
        if order.status != OrderStatus::Active && order.status != OrderStatus::Upcoming {
            return Err(ServiceError::Conflict(format!(
                "order {} is no longer mutable",
                order.order_number
            )));
        }

        let sub_orders = order.find_related(sub_order::Entity).all(&txn).await?;
        let sub = sub_orders
            .iter()
            .find(|s| s.id == sub_order_id)
            .cloned()
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Sub-order {} not found in order", sub_order_id))
            })?;
        ensure_sub_order_status(&sub, SubOrderStatus::Accepted)?;

        self.ensure_outside_cutoff(sub.delivery_date)?;
        self.ensure_outside_cutoff(to_date)?;

        let occupied = sub_orders
            .iter()
            .any(|s| s.delivery_date == to_date && s.status != SubOrderStatus::Cancelled);
        if occupied {
            return Err(ServiceError::Conflict(format!(
                "a delivery already exists on {}",
                to_date
            )));
        }

        let from_date = sub.delivery_date;
        let mut sub_am: sub_order::ActiveModel = sub.clone().into();
        sub_am.delivery_date = Set(to_date);
        sub_am.slot_id = Set(to_slot_id);
        sub_am.updated_at = Set(Utc::now());
        sub_am.update(&txn).await?;

        update_order_guarded(&txn, &order, <order::ActiveModel as std::default::Default>::default()).await?;

        txn.commit().await?;

        if order.status == OrderStatus::Active {
            self.redispatch_sub_order(sub.id).await;
        }

        self.emit(Event::DeliveryDateSwitched {
            sub_order_id: sub.id,
            from_date,
            to_date,
        })
        .await;

        Ok(())
    }

    // ------------------------------------------------------------------
    // RemoveDay
    // ------------------------------------------------------------------

    /// Deletes a day from an UPCOMING order. At least one day must remain.
    /// Totals and the delivery fee are recomputed and the next cycle's billed
    /// amount re-pushed.
    #[instrument(skip(self), fields(order_id = %order_id, sub_order_id = %sub_order_id))]
    pub async fn remove_day(&self, order_id: Uuid, sub_order_id: Uuid) -> Result<Decimal, ServiceError> {
        let txn = self.db.begin().await?;

        let order = self.load_order(&txn, order_id).await?;
        if order.status != OrderStatus::Upcoming {
            return Err(ServiceError::Conflict(
                "days can only be removed from an upcoming order".into(),
            ));
        }

        let sub_orders = order.find_related(sub_order::Entity).all(&txn).await?;
        let remaining = sub_orders
            .iter()
            .filter(|s| s.status != SubOrderStatus::Cancelled)
            .count();
        if remaining <= 1 {
            return Err(ServiceError::Conflict("at least one day required".into()));
        }

        let sub = sub_orders
            .iter()
            .find(|s| s.id == sub_order_id)
            .cloned()
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Sub-order {} not found in order", sub_order_id))
            })?;

        self.ensure_outside_cutoff(sub.delivery_date)?;

        order_item::Entity::delete_many()
            .filter(order_item::Column::SubOrderId.eq(sub.id))
            .exec(&txn)
            .await?;
        sub_order::Entity::delete_by_id(sub.id).exec(&txn).await?;

        let new_total = self
            .recompute_order_totals(&txn, &order, FeeBasisHint::Subscription)
            .await?;

        txn.commit().await?;

        self.sync_cycles_for(order.subscription_id, CycleOffset::Next)
            .await;

        self.emit(Event::DayRemoved {
            order_id: order.id,
            sub_order_id: sub.id,
        })
        .await;

        Ok(new_total)
    }

    // ------------------------------------------------------------------
    // Refunds
    // ------------------------------------------------------------------

    /// Per-item partial refund. Targets are cumulative refund quantities, so a
    /// second call with the same targets refunds nothing.
    #[instrument(skip(self, refunds), fields(sub_order_id = %sub_order_id))]
    pub async fn refund_items(
        &self,
        sub_order_id: Uuid,
        refunds: Vec<ItemRefund>,
    ) -> Result<RefundResult, ServiceError> {
        if refunds.is_empty() {
            return Err(ServiceError::ValidationError(
                "at least one refund line is required".into(),
            ));
        }

        let txn = self.db.begin().await?;

        let sub = sub_order::Entity::find_by_id(sub_order_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Sub-order {} not found", sub_order_id)))?;
        if matches!(sub.status, SubOrderStatus::Cancelled) {
            return Err(ServiceError::Conflict(
                "cancelled sub-orders cannot be refunded".into(),
            ));
        }
        let order = self.load_order(&txn, sub.order_id).await?;
        let items = sub.find_related(order_item::Entity).all(&txn).await?;

        let mut refund_value = Decimal::ZERO;
        let mut updates: Vec<(order_item::Model, i32)> = Vec::new();
        let mut key_parts: Vec<String> = Vec::new();

        for refund in &refunds {
            let line = items
                .iter()
                .find(|i| i.item_id == refund.item_id)
                .ok_or_else(|| {
                    ServiceError::NotFound(format!("Item {} not on sub-order", refund.item_id))
                })?;
            if refund.refund_quantity > line.quantity {
                return Err(ServiceError::ValidationError(format!(
                    "refund quantity {} exceeds ordered quantity {}",
                    refund.refund_quantity, line.quantity
                )));
            }
            let delta = refund.refund_quantity - line.refund_quantity;
            if delta > 0 {
                refund_value += line.unit_price * Decimal::from(delta);
                updates.push((line.clone(), refund.refund_quantity));
            }
            key_parts.push(format!("{}={}", refund.item_id, refund.refund_quantity));
        }

        if refund_value.is_zero() {
            // Everything already refunded to these targets; idempotent no-op.
            return Ok(RefundResult {
                sub_order_id,
                refunded_amount: Decimal::ZERO,
                sub_order_status: sub.status,
            });
        }

        let now = Utc::now();
        for (line, target) in &updates {
            let mut am: order_item::ActiveModel = line.clone().into();
            am.refund_quantity = Set(*target);
            am.updated_at = Set(now);
            am.update(&txn).await?;
        }

        let fully_refunded = items.iter().all(|line| {
            updates
                .iter()
                .find(|(l, _)| l.id == line.id)
                .map(|(_, target)| *target == line.quantity)
                .unwrap_or(line.refund_quantity == line.quantity)
        });

        let new_status = if fully_refunded {
            SubOrderStatus::Refunded
        } else {
            sub.status
        };
        if new_status != sub.status {
            let mut sub_am: sub_order::ActiveModel = sub.clone().into();
            sub_am.status = Set(new_status);
            sub_am.updated_at = Set(now);
            sub_am.update(&txn).await?;
        }

        key_parts.sort();
        let idempotency_key = format!("refund-items:{}:{}", sub.id, key_parts.join(","));
        self.execute_refund(&txn, &order, refund_value, &idempotency_key)
            .await?;

        txn.commit().await?;

        self.emit(Event::RefundIssued {
            sub_order_id: sub.id,
            amount: refund_value,
        })
        .await;

        Ok(RefundResult {
            sub_order_id,
            refunded_amount: refund_value,
            sub_order_status: new_status,
        })
    }

    /// Refunds the remaining unrefunded value of a sub-order and marks it
    /// REFUNDED. Calling it again refunds nothing.
    #[instrument(skip(self), fields(sub_order_id = %sub_order_id))]
    pub async fn refund_full_amount(&self, sub_order_id: Uuid) -> Result<RefundResult, ServiceError> {
        let txn = self.db.begin().await?;

        let sub = sub_order::Entity::find_by_id(sub_order_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Sub-order {} not found", sub_order_id)))?;
        if matches!(sub.status, SubOrderStatus::Cancelled) {
            return Err(ServiceError::Conflict(
                "cancelled sub-orders cannot be refunded".into(),
            ));
        }
        let order = self.load_order(&txn, sub.order_id).await?;
        let items = sub.find_related(order_item::Entity).all(&txn).await?;

        let remaining: Decimal = items.iter().map(|i| i.unrefunded_value()).sum();
        if remaining.is_zero() {
            return Ok(RefundResult {
                sub_order_id,
                refunded_amount: Decimal::ZERO,
                sub_order_status: sub.status,
            });
        }

        let now = Utc::now();
        for line in &items {
            if line.refund_quantity < line.quantity {
                let mut am: order_item::ActiveModel = line.clone().into();
                am.refund_quantity = Set(line.quantity);
                am.updated_at = Set(now);
                am.update(&txn).await?;
            }
        }

        let mut sub_am: sub_order::ActiveModel = sub.clone().into();
        sub_am.status = Set(SubOrderStatus::Refunded);
        sub_am.updated_at = Set(now);
        sub_am.update(&txn).await?;

        let idempotency_key = format!("refund-full:{}", sub.id);
        self.execute_refund(&txn, &order, remaining, &idempotency_key)
            .await?;

        txn.commit().await?;

        self.emit(Event::RefundIssued {
            sub_order_id: sub.id,
            amount: remaining,
        })
        .await;

        Ok(RefundResult {
            sub_order_id,
            refunded_amount: remaining,
            sub_order_status: SubOrderStatus::Refunded,
        })
    }

    /// Issues the processor refund for a sub-order's value. Subscription
    /// orders refund against the latest invoice; one-time orders against the
    /// stored charge. Local state is only committed if the refund succeeds.
    async fn execute_refund(
        &self,
        txn: &DatabaseTransaction,
        order: &order::Model,
        amount: Decimal,
        idempotency_key: &str,
    ) -> Result<(), ServiceError> {
        let amount_minor = to_minor_units(amount);
        let result = match order.plan_type {
            PlanType::Subscription => {
                let sub = self.load_subscription_for_order(txn, order).await?;
                self.billing
                    .provider()
                    .refund_latest_invoice(
                        &sub.external_subscription_id,
                        amount_minor,
                        idempotency_key,
                    )
                    .await
            }
            PlanType::OneTime => {
                let charge = order.charge_reference.as_deref().ok_or_else(|| {
                    ServiceError::RefundFailed("order has no charge reference".into())
                })?;
                self.billing
                    .provider()
                    .refund_charge(charge, amount_minor, idempotency_key)
                    .await
            }
        };

        result.map_err(|e| match e {
            ServiceError::RefundFailed(_) => e,
            other => ServiceError::RefundFailed(other.to_string()),
        })
    }

    // ------------------------------------------------------------------
    // Pause / Resume
    // ------------------------------------------------------------------

    /// Pauses collection for the next cycle. Requires the configured notice
    /// before the next billing date and an unpaused agreement. Order rows are
    /// not touched.
    #[instrument(skip(self), fields(subscription_id = %subscription_id))]
    pub async fn pause_upcoming(&self, subscription_id: Uuid) -> Result<(), ServiceError> {
        let sub = self.load_subscription(subscription_id).await?;
        if sub.is_paused {
            return Err(ServiceError::Conflict("subscription already paused".into()));
        }
        self.ensure_pause_notice(&sub)?;

        self.billing
            .provider()
            .pause_collection(&sub.external_subscription_id)
            .await?;

        let mut am: subscription::ActiveModel = sub.clone().into();
        am.is_paused = Set(true);
        am.updated_at = Set(Utc::now());
        am.update(&*self.db).await?;

        self.emit(Event::UpcomingPaused(subscription_id)).await;
        Ok(())
    }

    /// Resumes a paused agreement, under the same notice window.
    #[instrument(skip(self), fields(subscription_id = %subscription_id))]
    pub async fn resume_upcoming(&self, subscription_id: Uuid) -> Result<(), ServiceError> {
        let sub = self.load_subscription(subscription_id).await?;
        if !sub.is_paused {
            return Err(ServiceError::Conflict("subscription is not paused".into()));
        }
        self.ensure_pause_notice(&sub)?;

        self.billing
            .provider()
            .resume_collection(&sub.external_subscription_id)
            .await?;

        let mut am: subscription::ActiveModel = sub.clone().into();
        am.is_paused = Set(false);
        am.updated_at = Set(Utc::now());
        am.update(&*self.db).await?;

        self.emit(Event::UpcomingResumed(subscription_id)).await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // CancelSubscription
    // ------------------------------------------------------------------

    /// Cancels at period end (scheduled, notified) or immediately (refund of
    /// the last invoice minus tax; only within the signup window).
    #[instrument(skip(self, request), fields(subscription_id = %request.subscription_id))]
    pub async fn cancel_subscription(
        &self,
        request: CancelSubscriptionRequest,
    ) -> Result<(), ServiceError> {
        let sub = self.load_subscription(request.subscription_id).await?;
        let customer = self.load_customer(&*self.db, sub.customer_id).await?;

        if request.cancel_at_period_end {
            if sub.cancel_at_period_end {
                return Err(ServiceError::Conflict(
                    "subscription is already scheduled for cancellation".into(),
                ));
            }

            self.billing
                .provider()
                .cancel(&sub.external_subscription_id, true)
                .await?;

            let mut am: subscription::ActiveModel = sub.clone().into();
            am.cancel_at_period_end = Set(true);
            am.updated_at = Set(Utc::now());
            am.update(&*self.db).await?;

            self.emit(Event::SubscriptionCancelled {
                subscription_id: sub.id,
                at_period_end: true,
            })
            .await;
            self.notifications
                .notify(
                    "subscription_cancel_scheduled",
                    &customer.email,
                    serde_json::json!({
                        "subscription_id": sub.id,
                        "reason": request.reason,
                    }),
                )
                .await;
            return Ok(());
        }

        if sub.cancel_at_period_end {
            return Err(ServiceError::Conflict(
                "subscription is already scheduled for cancellation".into(),
            ));
        }

        let window = Duration::hours(self.config.immediate_cancel_window_hours);
        if Utc::now() > sub.created_at + window {
            return Err(ServiceError::Conflict(
                "immediate cancellation window has expired".into(),
            ));
        }

        // Refund the last invoice's paid amount minus tax: the pre-tax item
        // total plus delivery fees, capped at what was actually collected.
        let txn = self.db.begin().await?;
        let (active_order, active_subs) = self
            .project_cycle(&txn, sub.id, CycleOffset::Current)
            .await?;
        let (upcoming_order, _) = self.project_cycle(&txn, sub.id, CycleOffset::Next).await?;

        let refund_amount = (active_order.total_amount + active_order.delivery_fees)
            .min(active_order.paid_amount);
        if refund_amount > Decimal::ZERO {
            self.billing
                .provider()
                .refund_latest_invoice(
                    &sub.external_subscription_id,
                    to_minor_units(refund_amount),
                    &format!("cancel-refund:{}", sub.id),
                )
                .await
                .map_err(|e| ServiceError::RefundFailed(e.to_string()))?;
        }

        self.billing
            .provider()
            .cancel(&sub.external_subscription_id, false)
            .await?;

        let now = Utc::now();
        let mut sub_am: subscription::ActiveModel = sub.clone().into();
        sub_am.is_active = Set(false);
        sub_am.updated_at = Set(now);
        sub_am.update(&txn).await?;

        for order_model in [&active_order, &upcoming_order] {
            let mut am: order::ActiveModel = (*order_model).clone().into();
            am.status = Set(OrderStatus::Cancelled);
            am.updated_at = Set(now);
            am.update(&txn).await?;
        }

        let all_subs = {
            let mut subs = active_subs.clone();
            let upcoming_subs = upcoming_order
                .find_related(sub_order::Entity)
                .all(&txn)
                .await?;
            subs.extend(upcoming_subs);
            subs
        };
        for s in &all_subs {
            if !s.status.is_terminal() {
                let mut am: sub_order::ActiveModel = s.clone().into();
                am.status = Set(SubOrderStatus::Cancelled);
                am.updated_at = Set(now);
                am.update(&txn).await?;
            }
        }

        txn.commit().await?;

        for s in &active_subs {
            if let Some(reference) = s.dispatch_reference.as_deref() {
                if let Err(e) = self.dispatcher.cancel_delivery(reference).await {
                    warn!(error = %e, sub_order_id = %s.id, "failed to cancel dispatched delivery");
                }
            }
        }

        self.emit(Event::SubscriptionCancelled {
            subscription_id: sub.id,
            at_period_end: false,
        })
        .await;
        self.emit(Event::OrderCancelled(active_order.id)).await;
        self.emit(Event::OrderCancelled(upcoming_order.id)).await;

        self.notifications
            .notify(
                "subscription_cancelled",
                &customer.email,
                serde_json::json!({
                    "subscription_id": sub.id,
                    "refunded": refund_amount,
                    "reason": request.reason,
                }),
            )
            .await;

        Ok(())
    }

    // ------------------------------------------------------------------
    // Cycle projection & shared helpers
    // ------------------------------------------------------------------

    /// Resolves the order (and its sub-orders) for one cycle of a
    /// subscription: offset Current = the ACTIVE order, Next = the UPCOMING
    /// one. Both cycles are mutated through this single path.
    pub async fn project_cycle<C: sea_orm::ConnectionTrait>(
        &self,
        conn: &C,
        subscription_id: Uuid,
        cycle: CycleOffset,
    ) -> Result<(order::Model, Vec<sub_order::Model>), ServiceError> {
        let status = match cycle {
            CycleOffset::Current => OrderStatus::Active,
            CycleOffset::Next => OrderStatus::Upcoming,
        };
        let order = order::Entity::find()
            .filter(order::Column::SubscriptionId.eq(subscription_id))
            .filter(order::Column::Status.eq(status))
            .one(conn)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!(
                    "no {:?} order for subscription {}",
                    status, subscription_id
                ))
            })?;
        let subs = order.find_related(sub_order::Entity).all(conn).await?;
        Ok((order, subs))
    }

    async fn load_sub_order(
        &self,
        txn: &DatabaseTransaction,
        sub_order_id: Uuid,
        expected_order_status: OrderStatus,
    ) -> Result<(sub_order::Model, order::Model), ServiceError> {
        let sub = sub_order::Entity::find_by_id(sub_order_id)
            .one(txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Sub-order {} not found", sub_order_id)))?;
        let order = self.load_order(txn, sub.order_id).await?;
        if order.plan_type != PlanType::Subscription {
            return Err(ServiceError::InvalidOperation(
                "operation applies to subscription orders only".into(),
            ));
        }
        if order.status != expected_order_status {
            return Err(ServiceError::Conflict(format!(
                "order {} is {:?}, expected {:?}",
                order.order_number, order.status, expected_order_status
            )));
        }
        Ok((sub, order))
    }

    async fn load_order<C: sea_orm::ConnectionTrait>(
        &self,
        conn: &C,
        order_id: Uuid,
    ) -> Result<order::Model, ServiceError> {
        order::Entity::find_by_id(order_id)
            .one(conn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))
    }

    async fn load_customer<C: sea_orm::ConnectionTrait>(
        &self,
        conn: &C,
        customer_id: Uuid,
    ) -> Result<customer::Model, ServiceError> {
        customer::Entity::find_by_id(customer_id)
            .one(conn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Customer {} not found", customer_id)))
    }

    async fn load_subscription(&self, id: Uuid) -> Result<subscription::Model, ServiceError> {
        let sub = subscription::Entity::find_by_id(id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Subscription {} not found", id)))?;
        if !sub.is_active {
            return Err(ServiceError::Conflict(format!(
                "subscription {} is not active",
                id
            )));
        }
        Ok(sub)
    }

    async fn load_subscription_for_order(
        &self,
        txn: &DatabaseTransaction,
        order: &order::Model,
    ) -> Result<subscription::Model, ServiceError> {
        let id = order.subscription_id.ok_or_else(|| {
            ServiceError::InvalidOperation("order has no owning subscription".into())
        })?;
        subscription::Entity::find_by_id(id)
            .one(txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Subscription {} not found", id)))
    }

    fn require_billing_address(
        &self,
        customer: &customer::Model,
    ) -> Result<Address, ServiceError> {
        customer
            .billing_address
            .as_deref()
            .and_then(Address::from_json_str)
            .ok_or_else(|| {
                ServiceError::ValidationError("customer has no billing address on file".into())
            })
    }

    async fn load_catalog(
        &self,
        days: &[DaySelection],
    ) -> Result<HashMap<Uuid, CatalogItem>, ServiceError> {
        let ids: Vec<Uuid> = days
            .iter()
            .flat_map(|d| d.items.iter().map(|i| i.item_id))
            .collect();
        self.catalog.lookup(&ids).await
    }

    async fn load_catalog_for_items(
        &self,
        items: &[ItemSelection],
    ) -> Result<HashMap<Uuid, CatalogItem>, ServiceError> {
        let ids: Vec<Uuid> = items.iter().map(|i| i.item_id).collect();
        self.catalog.lookup(&ids).await
    }

    /// Recomputes a sub-order's total from its final item rows.
    async fn recompute_sub_order_total(
        &self,
        txn: &DatabaseTransaction,
        sub: &sub_order::Model,
    ) -> Result<Decimal, ServiceError> {
        let items = order_item::Entity::find()
            .filter(order_item::Column::SubOrderId.eq(sub.id))
            .all(txn)
            .await?;
        let total: Decimal = items.iter().map(|i| i.line_total()).sum();
        let mut am: sub_order::ActiveModel = sub.clone().into();
        am.total = Set(total);
        am.updated_at = Set(Utc::now());
        am.update(txn).await?;
        Ok(total)
    }

    /// Recomputes an order's total and delivery fee from its surviving
    /// sub-orders and bumps its version.
    async fn recompute_order_totals(
        &self,
        txn: &DatabaseTransaction,
        order: &order::Model,
        _basis: FeeBasisHint,
    ) -> Result<Decimal, ServiceError> {
        let subs = sub_order::Entity::find()
            .filter(sub_order::Column::OrderId.eq(order.id))
            .all(txn)
            .await?;
        let live: Vec<&sub_order::Model> = subs
            .iter()
            .filter(|s| s.status != SubOrderStatus::Cancelled)
            .collect();
        let total: Decimal = live.iter().map(|s| s.total).sum();
        let fee = self
            .pricing
            .delivery_fee(total, FeeBasis::SubscriptionDays(live.len() as u32));

        update_order_guarded(
            txn,
            order,
            order::ActiveModel {
                total_amount: Set(total),
                delivery_fees: Set(fee),
                ..Default::default()
            },
        )
        .await?;
        Ok(total)
    }

    async fn update_preference_manifest<F>(
        &self,
        txn: &DatabaseTransaction,
        subscription_id: Uuid,
        for_date: NaiveDate,
        mutate: F,
    ) -> Result<(), ServiceError>
    where
        F: FnOnce(&mut Vec<ItemSelection>),
    {
        let Some(pref) = preference_order::Entity::find()
            .filter(preference_order::Column::SubscriptionId.eq(subscription_id))
            .one(txn)
            .await?
        else {
            warn!(%subscription_id, "no preference template for subscription");
            return Ok(());
        };

        let weekday = for_date.weekday().num_days_from_monday() as i16;
        let Some(day) = preference_sub_order::Entity::find()
            .filter(preference_sub_order::Column::PreferenceOrderId.eq(pref.id))
            .filter(preference_sub_order::Column::Weekday.eq(weekday))
            .one(txn)
            .await?
        else {
            warn!(weekday, "no preference day to mirror onto");
            return Ok(());
        };

        let mut items: Vec<ItemSelection> =
            serde_json::from_value(day.items.clone()).unwrap_or_default();
        mutate(&mut items);
        items.retain(|i| i.quantity > 0);

        let mut am: preference_sub_order::ActiveModel = day.into();
        am.items = Set(serde_json::to_value(&items)
            .map_err(|e| ServiceError::InternalError(e.to_string()))?);
        am.updated_at = Set(Utc::now());
        am.update(txn).await?;
        Ok(())
    }

    /// Actions within the cutoff window before a delivery are disallowed.
    fn ensure_outside_cutoff(&self, date: NaiveDate) -> Result<(), ServiceError> {
        let cutoff = Utc::now() + Duration::hours(self.config.action_cutoff_hours);
        let day_start = date
            .and_hms_opt(0, 0, 0)
            .expect("midnight is always valid")
            .and_utc();
        if day_start <= cutoff {
            return Err(ServiceError::Conflict(format!(
                "{} is within the {}h action cutoff",
                date, self.config.action_cutoff_hours
            )));
        }
        Ok(())
    }

    fn ensure_pause_notice(&self, sub: &subscription::Model) -> Result<(), ServiceError> {
        let notice = Duration::hours(self.config.pause_notice_hours);
        if Utc::now() + notice >= sub.current_period_end {
            return Err(ServiceError::Conflict(format!(
                "requires at least {}h notice before the next billing date",
                self.config.pause_notice_hours
            )));
        }
        Ok(())
    }

    /// Post-commit billed-amount sync for one cycle; failures are logged, the
    /// local order total stays the source of truth and the next mutation will
    /// re-push it.
    async fn sync_cycles_for(&self, subscription_id: Option<Uuid>, cycle: CycleOffset) {
        let Some(subscription_id) = subscription_id else {
            return;
        };
        let sub = match subscription::Entity::find_by_id(subscription_id)
            .one(&*self.db)
            .await
        {
            Ok(Some(s)) => s,
            Ok(None) => return,
            Err(e) => {
                error!(error = %e, "failed to load subscription for billing sync");
                return;
            }
        };
        match self.project_cycle(&*self.db, subscription_id, cycle).await {
            Ok((order_model, _)) => {
                if let Err(e) = self
                    .billing
                    .sync_billed_amount(&sub, &order_model, cycle)
                    .await
                {
                    error!(error = %e, ?cycle, "billed amount sync failed; will be re-pushed on next mutation");
                }
            }
            Err(e) => error!(error = %e, ?cycle, "cycle projection failed during billing sync"),
        }
    }

    async fn sync_cycles(&self, subscription_id: Option<Uuid>, include_next: bool) {
        self.sync_cycles_for(subscription_id, CycleOffset::Current)
            .await;
        if include_next {
            self.sync_cycles_for(subscription_id, CycleOffset::Next)
                .await;
        }
    }

    /// Creates logistics deliveries for every sub-order of a freshly created
    /// ACTIVE order and stores the returned references. Best-effort.
    async fn dispatch_active_order(&self, order_id: Uuid) {
        let order = match order::Entity::find_by_id(order_id).one(&*self.db).await {
            Ok(Some(o)) => o,
            _ => return,
        };
        let subs = match order.find_related(sub_order::Entity).all(&*self.db).await {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "failed to load sub-orders for dispatch");
                return;
            }
        };
        for sub in subs {
            let items = match sub.find_related(order_item::Entity).all(&*self.db).await {
                Ok(i) => i,
                Err(e) => {
                    error!(error = %e, "failed to load items for dispatch");
                    continue;
                }
            };
            let manifest = DeliveryManifest::from_models(&order, &sub, &items);
            match self.dispatcher.create_delivery(&manifest).await {
                Ok(reference) => {
                    let mut am: sub_order::ActiveModel = sub.into();
                    am.dispatch_reference = Set(Some(reference));
                    am.updated_at = Set(Utc::now());
                    if let Err(e) = am.update(&*self.db).await {
                        error!(error = %e, "failed to store dispatch reference");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "delivery dispatch failed; order remains committed");
                }
            }
        }
    }

    /// Re-sends a sub-order's manifest to logistics (create if never
    /// dispatched, update otherwise). Best-effort, post-commit.
    async fn redispatch_sub_order(&self, sub_order_id: Uuid) {
        let sub = match sub_order::Entity::find_by_id(sub_order_id)
            .one(&*self.db)
            .await
        {
            Ok(Some(s)) => s,
            _ => return,
        };
        let order = match order::Entity::find_by_id(sub.order_id).one(&*self.db).await {
            Ok(Some(o)) => o,
            _ => return,
        };
        let items = match sub.find_related(order_item::Entity).all(&*self.db).await {
            Ok(i) => i,
            Err(_) => return,
        };
        let manifest = DeliveryManifest::from_models(&order, &sub, &items);

        match sub.dispatch_reference.as_deref() {
            Some(reference) => {
                if let Err(e) = self.dispatcher.update_delivery(reference, &manifest).await {
                    warn!(error = %e, "delivery re-dispatch failed; order remains committed");
                }
            }
            None => match self.dispatcher.create_delivery(&manifest).await {
                Ok(reference) => {
                    let mut am: sub_order::ActiveModel = sub.into();
                    am.dispatch_reference = Set(Some(reference));
                    am.updated_at = Set(Utc::now());
                    if let Err(e) = am.update(&*self.db).await {
                        error!(error = %e, "failed to store dispatch reference");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "delivery dispatch failed; order remains committed");
                }
            },
        }
    }

    async fn emit(&self, event: Event) {
        if let Err(e) = self.event_sender.send(event).await {
            warn!(error = %e, "failed to emit event");
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum FeeBasisHint {
    Subscription,
}

/// A validated, priced non-negative quantity increment for one item.
#[derive(Debug, Clone)]
struct ItemDelta {
    item_id: Uuid,
    quantity: i32,
    unit_price: Decimal,
}

impl ItemDelta {
    fn value(&self) -> Decimal {
        self.unit_price * Decimal::from(self.quantity)
    }
}

/// Computes strictly non-negative quantity deltas for AddExtraItems. The
/// requested quantities are resulting quantities; reductions are rejected
/// wholesale before any payment is attempted.
fn compute_increment_deltas(
    requested: &[ItemSelection],
    existing: &[order_item::Model],
    catalog: &HashMap<Uuid, CatalogItem>,
) -> Result<Vec<ItemDelta>, ServiceError> {
    let mut deltas = Vec::new();
    for sel in requested {
        let item = catalog_item(catalog, sel.item_id)?;
        let current = existing
            .iter()
            .find(|e| e.item_id == sel.item_id)
            .map(|e| e.quantity)
            .unwrap_or(0);
        let delta = sel.quantity - current;
        if delta < 0 {
            return Err(ServiceError::ValidationError(format!(
                "quantity for {} cannot be reduced here (current {}, requested {})",
                item.name, current, sel.quantity
            )));
        }
        if delta == 0 {
            continue;
        }
        ensure_quantity_in_bounds(item, sel.quantity)?;

        // Deltas on an existing line are priced at the line's stored unit
        // price so one line never mixes prices; new lines take catalog price.
        let unit_price = existing
            .iter()
            .find(|e| e.item_id == sel.item_id)
            .map(|e| e.unit_price)
            .unwrap_or(item.unit_price);

        deltas.push(ItemDelta {
            item_id: sel.item_id,
            quantity: delta,
            unit_price,
        });
    }
    Ok(deltas)
}

/// Upserts item rows for a set of increments: existing lines grow in place,
/// new lines are inserted at the delta's price.
async fn apply_item_deltas(
    txn: &DatabaseTransaction,
    sub_order_id: Uuid,
    deltas: &[ItemDelta],
    catalog: &HashMap<Uuid, CatalogItem>,
) -> Result<(), ServiceError> {
    let now = Utc::now();
    let existing = order_item::Entity::find()
        .filter(order_item::Column::SubOrderId.eq(sub_order_id))
        .all(txn)
        .await?;

    for delta in deltas {
        match existing.iter().find(|e| e.item_id == delta.item_id) {
            Some(line) => {
                let mut am: order_item::ActiveModel = line.clone().into();
                am.quantity = Set(line.quantity + delta.quantity);
                am.updated_at = Set(now);
                am.update(txn).await?;
            }
            None => {
                let name = catalog
                    .get(&delta.item_id)
                    .map(|c| c.name.clone())
                    .unwrap_or_else(|| delta.item_id.to_string());
                order_item::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    sub_order_id: Set(sub_order_id),
                    item_id: Set(delta.item_id),
                    name: Set(name),
                    quantity: Set(delta.quantity),
                    refund_quantity: Set(0),
                    unit_price: Set(delta.unit_price),
                    created_at: Set(now),
                    updated_at: Set(now),
                }
                .insert(txn)
                .await?;
            }
        }
    }
    Ok(())
}

/// Conditional order update: only succeeds while the row still carries the
/// version read in this transaction. A mismatch means a concurrent writer got
/// there first, so the caller's totals are stale.
async fn update_order_guarded<C: sea_orm::ConnectionTrait>(
    conn: &C,
    current: &order::Model,
    mut changes: order::ActiveModel,
) -> Result<(), ServiceError> {
    changes.id = Set(current.id);
    changes.version = Set(current.version + 1);
    changes.updated_at = Set(Utc::now());
    let result = order::Entity::update_many()
        .set(changes)
        .filter(order::Column::Id.eq(current.id))
        .filter(order::Column::Version.eq(current.version))
        .exec(conn)
        .await?;
    if result.rows_affected == 0 {
        return Err(ServiceError::ConcurrentModification(current.id));
    }
    Ok(())
}

fn catalog_item(
    catalog: &HashMap<Uuid, CatalogItem>,
    item_id: Uuid,
) -> Result<&CatalogItem, ServiceError> {
    catalog
        .get(&item_id)
        .ok_or_else(|| ServiceError::NotFound(format!("Item {} not in catalog", item_id)))
}

fn ensure_quantity_in_bounds(item: &CatalogItem, quantity: i32) -> Result<(), ServiceError> {
    if !item.quantity_in_bounds(quantity) {
        return Err(ServiceError::QuantityOutOfRange(format!(
            "{}: {} outside [{}, {}]",
            item.name, quantity, item.min_quantity, item.max_quantity
        )));
    }
    Ok(())
}

fn ensure_sub_order_status(
    sub: &sub_order::Model,
    expected: SubOrderStatus,
) -> Result<(), ServiceError> {
    if sub.status != expected {
        return Err(ServiceError::Conflict(format!(
            "sub-order {} is {:?}, expected {:?}",
            sub.sub_order_number, sub.status, expected
        )));
    }
    Ok(())
}

fn validate_distinct_dates(days: &[DaySelection]) -> Result<(), ServiceError> {
    let mut seen = std::collections::HashSet::new();
    for day in days {
        if !seen.insert(day.delivery_date) {
            return Err(ServiceError::ValidationError(format!(
                "duplicate delivery date {}",
                day.delivery_date
            )));
        }
        if day.items.is_empty() {
            return Err(ServiceError::ValidationError(format!(
                "no items selected for {}",
                day.delivery_date
            )));
        }
    }
    Ok(())
}

fn order_number() -> String {
    use rand::Rng;
    format!("ORD-{:08}", rand::thread_rng().gen_range(0..100_000_000u32))
}

fn sub_order_number() -> String {
    use rand::Rng;
    format!("DBH-{:08}", rand::thread_rng().gen_range(0..100_000_000u32))
}
