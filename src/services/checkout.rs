use crate::{
    common::{to_minor_units, Address, ItemSelection},
    config::CommerceConfig,
    db::DbPool,
    entities::{
        customer, order,
        order::{OrderStatus, PlanType},
        order_item, sub_order,
        sub_order::{Fulfillment, SubOrderStatus},
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::{
        billing::BillingSyncService,
        catalog::{CatalogItem, CatalogSource},
        dispatch::{DeliveryDispatcher, DeliveryManifest},
        notifications::NotificationService,
        pricing::{FeeBasis, PricedLine, PricingService},
        wallet::{split_payment, WalletService},
    },
};
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, EntityTrait, Set, TransactionTrait};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PlaceOneTimeOrderRequest {
    pub customer_id: Uuid,
    #[validate(length(min = 1, message = "At least one item is required"))]
    pub items: Vec<ItemSelection>,
    pub fulfillment: Fulfillment,
    pub delivery_date: NaiveDate,
    pub slot_id: String,
    pub use_wallet: bool,
    #[validate(length(min = 1, message = "Payment method is required"))]
    pub payment_method: String,
    /// Client-supplied idempotency key for the card charge; generated when
    /// absent.
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OneTimeOrderPlaced {
    pub order_id: Uuid,
    pub order_number: String,
    pub sub_order_id: Uuid,
    pub total: Decimal,
    pub wallet_used: Decimal,
    pub card_charged: Decimal,
}

/// Single-delivery checkout: one order, one sub-order, paid in full at
/// placement via the wallet/card split. No recurring agreement is involved;
/// refunds run against the stored charge reference.
#[derive(Clone)]
pub struct CheckoutService {
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

impl CheckoutService {
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

    #[instrument(skip(self, request), fields(customer_id = %request.customer_id))]
    pub async fn place_one_time_order(
        &self,
        request: PlaceOneTimeOrderRequest,
    ) -> Result<OneTimeOrderPlaced, ServiceError> {
        request.validate()?;

        let customer = customer::Entity::find_by_id(request.customer_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Customer {} not found", request.customer_id))
            })?;
        let billing_address = customer
            .billing_address
            .as_deref()
            .and_then(Address::from_json_str)
            .ok_or_else(|| {
                ServiceError::ValidationError("customer has no billing address on file".into())
            })?;

        let ids: Vec<Uuid> = request.items.iter().map(|i| i.item_id).collect();
        let catalog = self.catalog.lookup(&ids).await?;
        let lines = priced_lines(&request.items, &catalog)?;

        let basis = match request.fulfillment {
            Fulfillment::Delivery => FeeBasis::OneTimeDelivery,
            Fulfillment::Pickup => FeeBasis::Pickup,
        };
        let totals = self
            .pricing
            .compute_totals(&lines, &billing_address, basis)
            .await?;
        if totals.total <= Decimal::ZERO {
            return Err(ServiceError::ValidationError(
                "order total must be positive".into(),
            ));
        }

        let txn = self.db.begin().await?;
        let now = Utc::now();
        let order_id = Uuid::new_v4();
        let sub_order_id = Uuid::new_v4();
        let order_number = {
            use rand::Rng;
            format!("ORD-{:08}", rand::thread_rng().gen_range(0..100_000_000u32))
        };
        let sub_order_number = {
            use rand::Rng;
            format!("DBH-{:08}", rand::thread_rng().gen_range(0..100_000_000u32))
        };

        let balance = self.wallet.balance(&txn, customer.id).await?;
        let split = split_payment(
            balance,
            totals.total,
            request.use_wallet,
            self.config.min_chargeable_amount,
        );

        if split.wallet_deduction > Decimal::ZERO {
            self.wallet
                .debit(
                    &txn,
                    customer.id,
                    split.wallet_deduction,
                    &format!("One-time order {}", order_number),
                    Some(order_id),
                    Some(sub_order_id),
                )
                .await?;
        }

        // Card call last before commit, under the order's idempotency key
        let charge_reference = if split.card_amount > Decimal::ZERO {
            let key = request
                .idempotency_key
                .clone()
                .unwrap_or_else(|| format!("checkout:{}", order_id));
            let outcome = self
                .billing
                .provider()
                .charge(
                    customer.id,
                    &request.payment_method,
                    to_minor_units(split.card_amount),
                    &key,
                )
                .await?;
            Some(outcome.charge_id)
        } else {
            None
        };

        order::ActiveModel {
            id: Set(order_id),
            order_number: Set(order_number.clone()),
            customer_id: Set(customer.id),
            subscription_id: Set(None),
            plan_type: Set(PlanType::OneTime),
            status: Set(OrderStatus::Active),
            total_amount: Set(totals.subtotal),
            paid_amount: Set(totals.total),
            delivery_fees: Set(totals.delivery_fee),
            tax_rate: Set(totals.tax_rate),
            currency: Set(self.config.currency.clone()),
            billing_address: Set(customer.billing_address.clone()),
            shipping_address: Set(customer
                .shipping_address
                .clone()
                .or_else(|| customer.billing_address.clone())),
            coupon_code: Set(None),
            charge_reference: Set(charge_reference),
            version: Set(1),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await?;

        sub_order::ActiveModel {
            id: Set(sub_order_id),
            sub_order_number: Set(sub_order_number.clone()),
            order_id: Set(order_id),
            delivery_date: Set(request.delivery_date),
            slot_id: Set(request.slot_id.clone()),
            fulfillment: Set(request.fulfillment),
            status: Set(SubOrderStatus::Accepted),
            total: Set(totals.subtotal),
            dispatch_reference: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await?;

        for sel in &request.items {
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
            .insert(&txn)
            .await?;
        }

        txn.commit().await?;

        self.dispatch(order_id, sub_order_id).await;

        if let Err(e) = self.event_sender.send(Event::OrderCreated(order_id)).await {
            warn!(error = %e, "failed to emit event");
        }
        if split.wallet_deduction > Decimal::ZERO {
            if let Err(e) = self
                .event_sender
                .send(Event::WalletDebited {
                    customer_id: customer.id,
                    amount: split.wallet_deduction,
                })
                .await
            {
                warn!(error = %e, "failed to emit event");
            }
        }

        self.notifications
            .notify(
                "order_placed",
                &customer.email,
                serde_json::json!({
                    "order_number": order_number,
                    "delivery_date": request.delivery_date,
                    "total": totals.total,
                }),
            )
            .await;

        info!(%order_id, "one-time order placed");
        Ok(OneTimeOrderPlaced {
            order_id,
            order_number,
            sub_order_id,
            total: totals.total,
            wallet_used: split.wallet_deduction,
            card_charged: split.card_amount,
        })
    }

    async fn dispatch(&self, order_id: Uuid, sub_order_id: Uuid) {
        let Ok(Some(order)) = order::Entity::find_by_id(order_id).one(&*self.db).await else {
            return;
        };
        let Ok(Some(sub)) = sub_order::Entity::find_by_id(sub_order_id)
            .one(&*self.db)
            .await
        else {
            return;
        };
        let items = match sea_orm::ModelTrait::find_related(&sub, order_item::Entity)
            .all(&*self.db)
            .await
        {
            Ok(i) => i,
            Err(_) => return,
        };

        let manifest = DeliveryManifest::from_models(&order, &sub, &items);
        match self.dispatcher.create_delivery(&manifest).await {
            Ok(reference) => {
                let mut am: sub_order::ActiveModel = sub.into();
                am.dispatch_reference = Set(Some(reference));
                am.updated_at = Set(Utc::now());
                if let Err(e) = am.update(&*self.db).await {
                    warn!(error = %e, "failed to store dispatch reference");
                }
            }
            Err(e) => {
                warn!(error = %e, "delivery dispatch failed; order remains committed");
            }
        }
    }
}

fn priced_lines(
    items: &[ItemSelection],
    catalog: &HashMap<Uuid, CatalogItem>,
) -> Result<Vec<PricedLine>, ServiceError> {
    items
        .iter()
        .map(|sel| {
            let item = catalog
                .get(&sel.item_id)
                .ok_or_else(|| ServiceError::NotFound(format!("Item {} not in catalog", sel.item_id)))?;
            if !item.quantity_in_bounds(sel.quantity) {
                return Err(ServiceError::QuantityOutOfRange(format!(
                    "{}: {} outside [{}, {}]",
                    item.name, sel.quantity, item.min_quantity, item.max_quantity
                )));
            }
            Ok(PricedLine {
                unit_price: item.unit_price,
                quantity: sel.quantity,
            })
        })
        .collect()
}
