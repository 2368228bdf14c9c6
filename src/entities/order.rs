use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A billing-period container holding one week's (or one instance's)
/// deliveries and their aggregate amount.
///
/// For a subscription order, `total_amount` always equals the sum of its
/// non-cancelled sub-orders' totals, and the billed recurring amount for the
/// owning subscription tracks `total_amount + delivery_fees`.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "orders")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub order_number: String,
    pub customer_id: Uuid,
    #[sea_orm(nullable)]
    pub subscription_id: Option<Uuid>,
    pub plan_type: PlanType,
    pub status: OrderStatus,
    /// Pre-tax sum of the sub-orders' totals
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub total_amount: Decimal,
    /// Amount actually collected for this order, tax inclusive
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub paid_amount: Decimal,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub delivery_fees: Decimal,
    /// Tax rate percentage applied at creation time
    #[sea_orm(column_type = "Decimal(Some((8, 4)))")]
    pub tax_rate: Decimal,
    pub currency: String,
    /// Billing address snapshot, copied at creation time, immutable thereafter
    #[sea_orm(nullable)]
    pub billing_address: Option<String>,
    #[sea_orm(nullable)]
    pub shipping_address: Option<String>,
    #[sea_orm(nullable)]
    pub coupon_code: Option<String>,
    /// Processor's charge id for a one-time order, used for later refunds
    #[sea_orm(nullable)]
    pub charge_reference: Option<String>,
    /// Optimistic-concurrency token, bumped on every content mutation
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::customer::Entity",
        from = "Column::CustomerId",
        to = "super::customer::Column::Id"
    )]
    Customer,
    #[sea_orm(
        belongs_to = "super::subscription::Entity",
        from = "Column::SubscriptionId",
        to = "super::subscription::Column::Id"
    )]
    Subscription,
    #[sea_orm(has_many = "super::sub_order::Entity")]
    SubOrders,
}

impl Related<super::customer::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Customer.def()
    }
}

impl Related<super::subscription::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Subscription.def()
    }
}

impl Related<super::sub_order::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::SubOrders.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

/// Billing plan for an order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
pub enum PlanType {
    #[sea_orm(string_value = "onetime")]
    OneTime,
    #[sea_orm(string_value = "subscription")]
    Subscription,
}

/// Order status enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
pub enum OrderStatus {
    /// Currently billed and being fulfilled this cycle
    #[sea_orm(string_value = "active")]
    Active,
    /// Next cycle, not yet billed, still mutable
    #[sea_orm(string_value = "upcoming")]
    Upcoming,
    #[sea_orm(string_value = "cancelled")]
    Cancelled,
    #[sea_orm(string_value = "refunded")]
    Refunded,
}
