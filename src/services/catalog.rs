use crate::errors::ServiceError;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use uuid::Uuid;

/// Current catalog data for a sellable item.
#[derive(Debug, Clone)]
pub struct CatalogItem {
    pub id: Uuid,
    pub name: String,
    pub unit_price: Decimal,
    pub min_quantity: i32,
    pub max_quantity: i32,
}

impl CatalogItem {
    /// Whether a resulting per-item quantity is orderable. Zero is allowed
    /// only where the operation deletes the line outright.
    pub fn quantity_in_bounds(&self, quantity: i32) -> bool {
        quantity >= self.min_quantity && quantity <= self.max_quantity
    }
}

/// External catalog/pricing source. Supplies unit prices, display names and
/// per-item order quantity bounds.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    /// Resolves the given item ids. Unknown ids are simply absent from the
    /// returned map; callers decide whether that is an error.
    async fn lookup(&self, item_ids: &[Uuid]) -> Result<HashMap<Uuid, CatalogItem>, ServiceError>;
}
