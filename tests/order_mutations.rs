mod common;

use chrono::NaiveDate;
use common::*;
use dabbah_api::{
    common::ItemSelection,
    entities::{
        customer, order, order_item, preference_sub_order, sub_order,
        sub_order::SubOrderStatus, transaction_history,
    },
    errors::ServiceError,
    services::catalog::CatalogItem,
    services::subscriptions::{
        AddExtraItemsRequest, CreateSubscriptionRequest, DaySelection, SkipAction,
        SubscriptionCreated, UpdateUpcomingItemsRequest,
    },
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, Set};
use uuid::Uuid;

struct Ctx {
    h: TestHarness,
    customer: customer::Model,
    item1: CatalogItem,
    item2: CatalogItem,
    created: SubscriptionCreated,
}

/// Two items over two days: 2 x 12.00 on day +4, 3 x 10.00 on day +6.
/// Subtotal 54.00, fees 10.00, 10% tax, nothing charged up front.
async fn signup(wallet: Decimal) -> Ctx {
    let item1 = catalog_item("Paneer Dabbah", dec!(12.00), 1, 10);
    let item2 = catalog_item("Veggie Dabbah", dec!(10.00), 1, 10);
    let h = setup(vec![item1.clone(), item2.clone()]).await;
    let customer = seed_customer(&h.db, wallet).await;

    let created = h
        .services
        .subscriptions
        .create_subscription(CreateSubscriptionRequest {
            customer_id: customer.id,
            payment_method: "pm_card_visa".into(),
            fulfillment: sub_order::Fulfillment::Delivery,
            days: vec![
                DaySelection {
                    delivery_date: future_date(4),
                    slot_id: "lunch".into(),
                    items: vec![ItemSelection {
                        item_id: item1.id,
                        quantity: 2,
                    }],
                },
                DaySelection {
                    delivery_date: future_date(6),
                    slot_id: "dinner".into(),
                    items: vec![ItemSelection {
                        item_id: item2.id,
                        quantity: 3,
                    }],
                },
            ],
            coupon_code: None,
        })
        .await
        .unwrap();

    Ctx {
        h,
        customer,
        item1,
        item2,
        created,
    }
}

async fn day_sub_order(
    db: &sea_orm::DatabaseConnection,
    order_id: Uuid,
    date: NaiveDate,
) -> sub_order::Model {
    sub_order::Entity::find()
        .filter(sub_order::Column::OrderId.eq(order_id))
        .filter(sub_order::Column::DeliveryDate.eq(date))
        .one(db)
        .await
        .unwrap()
        .expect("sub-order for date")
}

async fn wallet_balance(db: &sea_orm::DatabaseConnection, customer_id: Uuid) -> Decimal {
    customer::Entity::find_by_id(customer_id)
        .one(db)
        .await
        .unwrap()
        .unwrap()
        .wallet_balance
}

async fn reload_order(db: &sea_orm::DatabaseConnection, id: Uuid) -> order::Model {
    order::Entity::find_by_id(id).one(db).await.unwrap().unwrap()
}

// ---------------------------------------------------------------------------
// AddExtraItems
// ---------------------------------------------------------------------------

#[tokio::test]
async fn add_extra_items_splits_between_wallet_and_card() {
    let ctx = signup(dec!(10.00)).await;
    let sub = day_sub_order(&ctx.h.db, ctx.created.active_order_id, future_date(4)).await;

    // Raise item1 from 2 to 4: delta 2 x 12.00 = 24.00, tax 2.40, due 26.40.
    // Wallet covers 10.00, card takes 16.40.
    let result = ctx
        .h
        .services
        .subscriptions
        .add_extra_items(AddExtraItemsRequest {
            sub_order_id: sub.id,
            items: vec![ItemSelection {
                item_id: ctx.item1.id,
                quantity: 4,
            }],
            use_wallet: true,
            pay_now: true,
            save_to_upcoming: false,
        })
        .await
        .unwrap();

    assert_eq!(result.amount_due, dec!(26.40));
    assert_eq!(result.wallet_used, dec!(10.00));
    assert_eq!(result.card_charged, dec!(16.40));
    assert_eq!(result.order_total, dec!(78.00));

    assert_eq!(wallet_balance(&ctx.h.db, ctx.customer.id).await, dec!(0));

    let charges = ctx.h.provider.charges.lock().unwrap();
    assert_eq!(charges.len(), 1);
    assert_eq!(charges[0].amount_minor, 1640);
    assert!(charges[0].idempotency_key.starts_with("add-items:"));
    drop(charges);

    let active = reload_order(&ctx.h.db, ctx.created.active_order_id).await;
    assert_eq!(active.total_amount, dec!(78.00));
    assert_eq!(active.paid_amount, dec!(26.40));
    assert_eq!(active.version, 2);

    let updated_sub = sub_order::Entity::find_by_id(sub.id)
        .one(&*ctx.h.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(updated_sub.total, dec!(48.00));

    // Wallet debit is mirrored in the transaction ledger
    let ledger = transaction_history::Entity::find()
        .filter(transaction_history::Column::CustomerId.eq(ctx.customer.id))
        .all(&*ctx.h.db)
        .await
        .unwrap();
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger[0].amount, dec!(10.00));

    // Current cycle billed amount re-pushed: 78.00 + 10.00 fees
    let current = ctx.h.provider.amount_updates_for_cycle(false);
    assert_eq!(current.last().unwrap().amount_minor, 8800);
}

#[tokio::test]
async fn add_extra_items_mirrors_delta_to_upcoming() {
    let ctx = signup(dec!(0)).await;
    let sub = day_sub_order(&ctx.h.db, ctx.created.active_order_id, future_date(4)).await;

    ctx.h
        .services
        .subscriptions
        .add_extra_items(AddExtraItemsRequest {
            sub_order_id: sub.id,
            items: vec![ItemSelection {
                item_id: ctx.item1.id,
                quantity: 4,
            }],
            use_wallet: false,
            pay_now: true,
            save_to_upcoming: true,
        })
        .await
        .unwrap();

    // The matching upcoming day is a week after the active one
    let mirrored =
        day_sub_order(&ctx.h.db, ctx.created.upcoming_order_id, future_date(4 + 7)).await;
    assert_eq!(mirrored.total, dec!(48.00));

    let mirrored_line = order_item::Entity::find()
        .filter(order_item::Column::SubOrderId.eq(mirrored.id))
        .filter(order_item::Column::ItemId.eq(ctx.item1.id))
        .one(&*ctx.h.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(mirrored_line.quantity, 4);

    let upcoming = reload_order(&ctx.h.db, ctx.created.upcoming_order_id).await;
    assert_eq!(upcoming.total_amount, dec!(78.00));

    // Both cycles synced at 78.00 + 10.00
    let next = ctx.h.provider.amount_updates_for_cycle(true);
    assert_eq!(next.last().unwrap().amount_minor, 8800);
    let current = ctx.h.provider.amount_updates_for_cycle(false);
    assert_eq!(current.last().unwrap().amount_minor, 8800);

    // Preference template follows the saved change
    let prefs = preference_sub_order::Entity::find()
        .all(&*ctx.h.db)
        .await
        .unwrap();
    let manifest: Vec<ItemSelection> = prefs
        .iter()
        .find_map(|p| {
            let items: Vec<ItemSelection> = serde_json::from_value(p.items.clone()).unwrap();
            items
                .iter()
                .any(|i| i.item_id == ctx.item1.id)
                .then_some(items)
        })
        .unwrap();
    assert!(manifest
        .iter()
        .any(|i| i.item_id == ctx.item1.id && i.quantity == 4));
}

#[tokio::test]
async fn add_extra_items_rejects_quantity_reductions() {
    let ctx = signup(dec!(0)).await;
    let sub = day_sub_order(&ctx.h.db, ctx.created.active_order_id, future_date(4)).await;

    let err = ctx
        .h
        .services
        .subscriptions
        .add_extra_items(AddExtraItemsRequest {
            sub_order_id: sub.id,
            items: vec![ItemSelection {
                item_id: ctx.item1.id,
                quantity: 1, // currently 2
            }],
            use_wallet: false,
            pay_now: true,
            save_to_upcoming: false,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::ValidationError(_)));
    assert_eq!(ctx.h.provider.charge_count(), 0);
}

#[tokio::test]
async fn add_extra_items_declined_charge_changes_nothing() {
    let ctx = signup(dec!(0)).await;
    let sub = day_sub_order(&ctx.h.db, ctx.created.active_order_id, future_date(4)).await;
    ctx.h
        .provider
        .decline_charges
        .store(true, std::sync::atomic::Ordering::SeqCst);

    let err = ctx
        .h
        .services
        .subscriptions
        .add_extra_items(AddExtraItemsRequest {
            sub_order_id: sub.id,
            items: vec![ItemSelection {
                item_id: ctx.item1.id,
                quantity: 4,
            }],
            use_wallet: false,
            pay_now: true,
            save_to_upcoming: false,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::PaymentDeclined { .. }));

    // Transaction rolled back: totals and quantities untouched
    let active = reload_order(&ctx.h.db, ctx.created.active_order_id).await;
    assert_eq!(active.total_amount, dec!(54.00));
    assert_eq!(active.version, 1);
    let line = order_item::Entity::find()
        .filter(order_item::Column::SubOrderId.eq(sub.id))
        .one(&*ctx.h.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(line.quantity, 2);
}

#[tokio::test]
async fn add_extra_items_requires_active_order() {
    let ctx = signup(dec!(0)).await;
    let upcoming_sub =
        day_sub_order(&ctx.h.db, ctx.created.upcoming_order_id, future_date(4 + 7)).await;

    let err = ctx
        .h
        .services
        .subscriptions
        .add_extra_items(AddExtraItemsRequest {
            sub_order_id: upcoming_sub.id,
            items: vec![ItemSelection {
                item_id: ctx.item1.id,
                quantity: 4,
            }],
            use_wallet: false,
            pay_now: true,
            save_to_upcoming: false,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Conflict(_)));
}

#[tokio::test]
async fn add_extra_items_can_defer_payment_to_the_next_invoice() {
    let ctx = signup(dec!(10.00)).await;
    let sub = day_sub_order(&ctx.h.db, ctx.created.active_order_id, future_date(4)).await;

    let result = ctx
        .h
        .services
        .subscriptions
        .add_extra_items(AddExtraItemsRequest {
            sub_order_id: sub.id,
            items: vec![ItemSelection {
                item_id: ctx.item1.id,
                quantity: 4,
            }],
            use_wallet: true,
            pay_now: false,
            save_to_upcoming: false,
        })
        .await
        .unwrap();

    // Nothing is collected now; the delta lands on the recurring amount
    assert_eq!(result.amount_due, dec!(0));
    assert_eq!(result.wallet_used, dec!(0));
    assert_eq!(result.card_charged, dec!(0));
    assert_eq!(ctx.h.provider.charge_count(), 0);
    assert_eq!(wallet_balance(&ctx.h.db, ctx.customer.id).await, dec!(10.00));

    let active = reload_order(&ctx.h.db, ctx.created.active_order_id).await;
    assert_eq!(active.total_amount, dec!(78.00));
    assert_eq!(active.paid_amount, dec!(0));

    // 78.00 + 10.00 fees re-pushed for collection with the next invoice
    let current = ctx.h.provider.amount_updates_for_cycle(false);
    assert_eq!(current.last().unwrap().amount_minor, 8800);
}

#[tokio::test]
async fn repeated_additions_use_distinct_charge_keys() {
    let ctx = signup(dec!(0)).await;
    let sub = day_sub_order(&ctx.h.db, ctx.created.active_order_id, future_date(4)).await;

    for quantity in [4, 6] {
        ctx.h
            .services
            .subscriptions
            .add_extra_items(AddExtraItemsRequest {
                sub_order_id: sub.id,
                items: vec![ItemSelection {
                    item_id: ctx.item1.id,
                    quantity,
                }],
                use_wallet: false,
                pay_now: true,
                save_to_upcoming: false,
            })
            .await
            .unwrap();
    }

    // Two separate mutations must not share a processor idempotency key
    let charges = ctx.h.provider.charges.lock().unwrap();
    assert_eq!(charges.len(), 2);
    assert_ne!(charges[0].idempotency_key, charges[1].idempotency_key);
}

#[tokio::test]
async fn saved_deltas_skip_skipped_upcoming_days() {
    let ctx = signup(dec!(0)).await;
    let active_sub = day_sub_order(&ctx.h.db, ctx.created.active_order_id, future_date(4)).await;
    let upcoming_sub =
        day_sub_order(&ctx.h.db, ctx.created.upcoming_order_id, future_date(4 + 7)).await;

    ctx.h
        .services
        .subscriptions
        .skip_unskip(upcoming_sub.id, SkipAction::Skip)
        .await
        .unwrap();

    ctx.h
        .services
        .subscriptions
        .add_extra_items(AddExtraItemsRequest {
            sub_order_id: active_sub.id,
            items: vec![ItemSelection {
                item_id: ctx.item1.id,
                quantity: 4,
            }],
            use_wallet: false,
            pay_now: true,
            save_to_upcoming: true,
        })
        .await
        .unwrap();

    // The skipped day was already compensated through the wallet, so the
    // saved delta must not inflate it
    let untouched = sub_order::Entity::find_by_id(upcoming_sub.id)
        .one(&*ctx.h.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(untouched.status, SubOrderStatus::Skipped);
    assert_eq!(untouched.total, dec!(24.00));
    let line = order_item::Entity::find()
        .filter(order_item::Column::SubOrderId.eq(upcoming_sub.id))
        .one(&*ctx.h.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(line.quantity, 2);

    let upcoming = reload_order(&ctx.h.db, ctx.created.upcoming_order_id).await;
    assert_eq!(upcoming.total_amount, dec!(54.00));
    let active = reload_order(&ctx.h.db, ctx.created.active_order_id).await;
    assert_eq!(active.total_amount, dec!(78.00));
}

// ---------------------------------------------------------------------------
// UpdateUpcomingItems
// ---------------------------------------------------------------------------

#[tokio::test]
async fn update_upcoming_items_recomputes_totals_without_charging() {
    let ctx = signup(dec!(0)).await;
    let sub = day_sub_order(&ctx.h.db, ctx.created.upcoming_order_id, future_date(6 + 7)).await;

    // Drop item2 from 3 to 1: day total 10.00, order 24.00 + 10.00 = 34.00
    ctx.h
        .services
        .subscriptions
        .update_upcoming_items(UpdateUpcomingItemsRequest {
            sub_order_id: sub.id,
            items: vec![ItemSelection {
                item_id: ctx.item2.id,
                quantity: 1,
            }],
        })
        .await
        .unwrap();

    let upcoming = reload_order(&ctx.h.db, ctx.created.upcoming_order_id).await;
    assert_eq!(upcoming.total_amount, dec!(34.00));
    assert_eq!(upcoming.delivery_fees, dec!(10.00));

    // No money moves for upcoming edits
    assert_eq!(ctx.h.provider.charge_count(), 0);
    assert_eq!(wallet_balance(&ctx.h.db, ctx.customer.id).await, dec!(0));

    // Only the next cycle's billed amount changes: 34.00 + 10.00
    let next = ctx.h.provider.amount_updates_for_cycle(true);
    assert_eq!(next.last().unwrap().amount_minor, 4400);
}

#[tokio::test]
async fn update_upcoming_items_zero_quantity_deletes_the_line() {
    let ctx = signup(dec!(0)).await;
    let sub = day_sub_order(&ctx.h.db, ctx.created.upcoming_order_id, future_date(6 + 7)).await;

    ctx.h
        .services
        .subscriptions
        .update_upcoming_items(UpdateUpcomingItemsRequest {
            sub_order_id: sub.id,
            items: vec![ItemSelection {
                item_id: ctx.item2.id,
                quantity: 0,
            }],
        })
        .await
        .unwrap();

    let lines = order_item::Entity::find()
        .filter(order_item::Column::SubOrderId.eq(sub.id))
        .all(&*ctx.h.db)
        .await
        .unwrap();
    assert!(lines.is_empty());

    let updated_sub = sub_order::Entity::find_by_id(sub.id)
        .one(&*ctx.h.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(updated_sub.total, dec!(0));
}

#[tokio::test]
async fn update_upcoming_items_rejects_active_sub_orders() {
    let ctx = signup(dec!(0)).await;
    let active_sub = day_sub_order(&ctx.h.db, ctx.created.active_order_id, future_date(4)).await;

    let err = ctx
        .h
        .services
        .subscriptions
        .update_upcoming_items(UpdateUpcomingItemsRequest {
            sub_order_id: active_sub.id,
            items: vec![ItemSelection {
                item_id: ctx.item1.id,
                quantity: 5,
            }],
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Conflict(_)));
}

// ---------------------------------------------------------------------------
// Skip / Unskip
// ---------------------------------------------------------------------------

#[tokio::test]
async fn skip_credits_wallet_and_unskip_takes_it_back() {
    let ctx = signup(dec!(0)).await;
    let sub = day_sub_order(&ctx.h.db, ctx.created.active_order_id, future_date(4)).await;

    let status = ctx
        .h
        .services
        .subscriptions
        .skip_unskip(sub.id, SkipAction::Skip)
        .await
        .unwrap();
    assert_eq!(status, SubOrderStatus::Skipped);
    assert_eq!(wallet_balance(&ctx.h.db, ctx.customer.id).await, dec!(24.00));

    // Order totals are untouched; the wallet credit is the compensation
    let active = reload_order(&ctx.h.db, ctx.created.active_order_id).await;
    assert_eq!(active.total_amount, dec!(54.00));

    let status = ctx
        .h
        .services
        .subscriptions
        .skip_unskip(sub.id, SkipAction::Unskip)
        .await
        .unwrap();
    assert_eq!(status, SubOrderStatus::Accepted);
    assert_eq!(wallet_balance(&ctx.h.db, ctx.customer.id).await, dec!(0));
}

#[tokio::test]
async fn unskip_fails_when_wallet_cannot_cover_the_day() {
    let ctx = signup(dec!(0)).await;
    let sub = day_sub_order(&ctx.h.db, ctx.created.active_order_id, future_date(4)).await;

    ctx.h
        .services
        .subscriptions
        .skip_unskip(sub.id, SkipAction::Skip)
        .await
        .unwrap();

    // Spend the credit elsewhere
    let customer = customer::Entity::find_by_id(ctx.customer.id)
        .one(&*ctx.h.db)
        .await
        .unwrap()
        .unwrap();
    let mut am: customer::ActiveModel = customer.into();
    am.wallet_balance = Set(dec!(5.00));
    am.update(&*ctx.h.db).await.unwrap();

    let err = ctx
        .h
        .services
        .subscriptions
        .skip_unskip(sub.id, SkipAction::Unskip)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::InsufficientWalletBalance(_)));

    // Still skipped
    let still = sub_order::Entity::find_by_id(sub.id)
        .one(&*ctx.h.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(still.status, SubOrderStatus::Skipped);
}

#[tokio::test]
async fn skip_inside_cutoff_window_is_rejected() {
    let item = catalog_item("Paneer Dabbah", dec!(12.00), 1, 10);
    let h = setup(vec![item.clone()]).await;
    let customer = seed_customer(&h.db, dec!(0)).await;

    let created = h
        .services
        .subscriptions
        .create_subscription(CreateSubscriptionRequest {
            customer_id: customer.id,
            payment_method: "pm_card_visa".into(),
            fulfillment: sub_order::Fulfillment::Delivery,
            days: vec![DaySelection {
                delivery_date: future_date(1),
                slot_id: "lunch".into(),
                items: vec![ItemSelection {
                    item_id: item.id,
                    quantity: 1,
                }],
            }],
            coupon_code: None,
        })
        .await
        .unwrap();

    let sub = day_sub_order(&h.db, created.active_order_id, future_date(1)).await;
    let err = h
        .services
        .subscriptions
        .skip_unskip(sub.id, SkipAction::Skip)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Conflict(_)));
}

// ---------------------------------------------------------------------------
// SwitchDeliveryDate
// ---------------------------------------------------------------------------

#[tokio::test]
async fn switch_to_an_occupied_date_conflicts() {
    let ctx = signup(dec!(0)).await;
    let sub = day_sub_order(&ctx.h.db, ctx.created.active_order_id, future_date(4)).await;

    let err = ctx
        .h
        .services
        .subscriptions
        .switch_delivery_date(ctx.created.active_order_id, sub.id, future_date(6), "dinner".into())
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Conflict(_)));
}

#[tokio::test]
async fn switch_moves_the_day_and_redispatches() {
    let ctx = signup(dec!(0)).await;
    let sub = day_sub_order(&ctx.h.db, ctx.created.active_order_id, future_date(4)).await;

    ctx.h
        .services
        .subscriptions
        .switch_delivery_date(ctx.created.active_order_id, sub.id, future_date(5), "dinner".into())
        .await
        .unwrap();

    let moved = sub_order::Entity::find_by_id(sub.id)
        .one(&*ctx.h.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(moved.delivery_date, future_date(5));
    assert_eq!(moved.slot_id, "dinner");
    // Items stay as they were
    assert_eq!(moved.total, dec!(24.00));

    // Logistics got the updated schedule for the existing reference
    let updated = ctx.h.dispatcher.updated.lock().unwrap();
    assert_eq!(updated.len(), 1);
    assert_eq!(updated[0].1.delivery_date, future_date(5));
}

// ---------------------------------------------------------------------------
// RemoveDay
// ---------------------------------------------------------------------------

#[tokio::test]
async fn remove_day_recomputes_totals_and_fees() {
    let ctx = signup(dec!(0)).await;
    let sub = day_sub_order(&ctx.h.db, ctx.created.upcoming_order_id, future_date(4 + 7)).await;

    // Removing the 24.00 day leaves 30.00 and one delivery: fee drops to 5.00
    let new_total = ctx
        .h
        .services
        .subscriptions
        .remove_day(ctx.created.upcoming_order_id, sub.id)
        .await
        .unwrap();
    assert_eq!(new_total, dec!(30.00));

    let upcoming = reload_order(&ctx.h.db, ctx.created.upcoming_order_id).await;
    assert_eq!(upcoming.delivery_fees, dec!(5.00));

    assert!(sub_order::Entity::find_by_id(sub.id)
        .one(&*ctx.h.db)
        .await
        .unwrap()
        .is_none());

    let next = ctx.h.provider.amount_updates_for_cycle(true);
    assert_eq!(next.last().unwrap().amount_minor, 3500);
}

#[tokio::test]
async fn removing_the_last_day_is_rejected() {
    let ctx = signup(dec!(0)).await;
    let first = day_sub_order(&ctx.h.db, ctx.created.upcoming_order_id, future_date(4 + 7)).await;
    let second = day_sub_order(&ctx.h.db, ctx.created.upcoming_order_id, future_date(6 + 7)).await;

    ctx.h
        .services
        .subscriptions
        .remove_day(ctx.created.upcoming_order_id, first.id)
        .await
        .unwrap();

    let err = ctx
        .h
        .services
        .subscriptions
        .remove_day(ctx.created.upcoming_order_id, second.id)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Conflict(_)));
}

#[tokio::test]
async fn remove_day_only_applies_to_upcoming_orders() {
    let ctx = signup(dec!(0)).await;
    let sub = day_sub_order(&ctx.h.db, ctx.created.active_order_id, future_date(4)).await;

    let err = ctx
        .h
        .services
        .subscriptions
        .remove_day(ctx.created.active_order_id, sub.id)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Conflict(_)));
}
