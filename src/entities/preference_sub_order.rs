use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One weekday's default selection within a preference template. The item
/// manifest is a JSON array of `{item_id, quantity}` pairs mirroring the
/// upcoming order's items for the same weekday.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "preference_sub_orders")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub preference_order_id: Uuid,
    /// 0 = Monday .. 6 = Sunday, matching `chrono::Weekday::num_days_from_monday`
    pub weekday: i16,
    pub slot_id: String,
    #[sea_orm(column_type = "Json")]
    pub items: Json,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::preference_order::Entity",
        from = "Column::PreferenceOrderId",
        to = "super::preference_order::Column::Id"
    )]
    PreferenceOrder,
}

impl Related<super::preference_order::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::PreferenceOrder.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
