use crate::{
    common::Address,
    entities::sub_order::{self, Fulfillment},
    entities::{order, order_item},
    errors::ServiceError,
};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One line of the item manifest sent to the logistics system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestItem {
    pub item_id: Uuid,
    pub name: String,
    pub quantity: i32,
}

/// Everything logistics needs to schedule one day's delivery or pickup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryManifest {
    pub sub_order_id: Uuid,
    pub sub_order_number: String,
    pub address: Option<Address>,
    pub delivery_date: NaiveDate,
    pub slot_id: String,
    pub fulfillment: Fulfillment,
    pub items: Vec<ManifestItem>,
}

impl DeliveryManifest {
    /// Builds a manifest from persisted rows. Skipped/refunded quantities are
    /// kept as stored; logistics works off the ordered quantities.
    pub fn from_models(
        order: &order::Model,
        sub: &sub_order::Model,
        items: &[order_item::Model],
    ) -> Self {
        Self {
            sub_order_id: sub.id,
            sub_order_number: sub.sub_order_number.clone(),
            address: order
                .shipping_address
                .as_deref()
                .and_then(Address::from_json_str),
            delivery_date: sub.delivery_date,
            slot_id: sub.slot_id.clone(),
            fulfillment: sub.fulfillment,
            items: items
                .iter()
                .map(|i| ManifestItem {
                    item_id: i.item_id,
                    name: i.name.clone(),
                    quantity: i.quantity,
                })
                .collect(),
        }
    }
}

/// External logistics/dispatch contract. Calls happen after the owning
/// database transaction commits; failures are logged and surfaced as
/// `ExternalServiceError` but never roll back a committed mutation.
#[async_trait]
pub trait DeliveryDispatcher: Send + Sync {
    /// Schedules a new delivery/pickup; returns the external order reference
    /// used for later edits.
    async fn create_delivery(&self, manifest: &DeliveryManifest) -> Result<String, ServiceError>;

    async fn update_delivery(
        &self,
        reference: &str,
        manifest: &DeliveryManifest,
    ) -> Result<(), ServiceError>;

    async fn cancel_delivery(&self, reference: &str) -> Result<(), ServiceError>;
}
