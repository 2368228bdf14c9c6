use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A line item belonging to exactly one sub-order.
///
/// `refund_quantity <= quantity` always; refunding increases it and never
/// decreases the stored quantity.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "order_items")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub sub_order_id: Uuid,
    /// Catalog item id
    pub item_id: Uuid,
    pub name: String,
    pub quantity: i32,
    pub refund_quantity: i32,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub unit_price: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Model {
    /// Pre-tax value of the not-yet-refunded portion of this line.
    pub fn unrefunded_value(&self) -> Decimal {
        self.unit_price * Decimal::from(self.quantity - self.refund_quantity)
    }

    /// Pre-tax value of the full line, ignoring refunds.
    pub fn line_total(&self) -> Decimal {
        self.unit_price * Decimal::from(self.quantity)
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::sub_order::Entity",
        from = "Column::SubOrderId",
        to = "super::sub_order::Column::Id"
    )]
    SubOrder,
}

impl Related<super::sub_order::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::SubOrder.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
