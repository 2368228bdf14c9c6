#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{Duration, NaiveDate, Utc};
use dabbah_api::{
    common::{Address, ItemSelection},
    config::AppConfig,
    entities::{
        customer, order, order_item, preference_order, preference_sub_order, sub_order,
        subscription, transaction_history,
    },
    errors::{DeclineKind, ServiceError},
    events::{event_channel, Event},
    services::{
        billing::{
            ChargeOutcome, CreateAgreementRequest, CycleOffset, ProviderAgreement,
            RecurringBillingProvider,
        },
        catalog::{CatalogItem, CatalogSource},
        dispatch::{DeliveryDispatcher, DeliveryManifest},
        notifications::NotificationSender,
        pricing::TaxRateSource,
    },
    CoreServices, ExternalAdapters,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sea_orm::{
    ActiveModelTrait, ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbBackend,
    Schema, Set,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Fresh in-memory database with the full schema.
pub async fn setup_test_db() -> Arc<DatabaseConnection> {
    let mut options = ConnectOptions::new("sqlite::memory:".to_string());
    options.max_connections(1).sqlx_logging(false);
    let db = Database::connect(options)
        .await
        .expect("in-memory sqlite should connect");

    let schema = Schema::new(DbBackend::Sqlite);
    let backend = db.get_database_backend();

    macro_rules! create {
        ($entity:expr) => {
            db.execute(backend.build(&schema.create_table_from_entity($entity)))
                .await
                .expect("schema creation should succeed");
        };
    }
    create!(customer::Entity);
    create!(subscription::Entity);
    create!(order::Entity);
    create!(sub_order::Entity);
    create!(order_item::Entity);
    create!(preference_order::Entity);
    create!(preference_sub_order::Entity);
    create!(transaction_history::Entity);

    Arc::new(db)
}

// ---------------------------------------------------------------------------
// Mock payment processor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RecordedAmountUpdate {
    pub subscription_id: String,
    pub amount_minor: i64,
    pub next_cycle: bool,
}

#[derive(Debug, Clone)]
pub struct RecordedCharge {
    pub amount_minor: i64,
    pub idempotency_key: String,
}

#[derive(Debug, Clone)]
pub struct RecordedRefund {
    pub target: String,
    pub amount_minor: i64,
    pub idempotency_key: String,
}

/// Records every processor call and can be told to decline charges or fail
/// refunds.
#[derive(Default)]
pub struct MockBillingProvider {
    pub agreements: Mutex<Vec<CreateAgreementRequest>>,
    pub amount_updates: Mutex<Vec<RecordedAmountUpdate>>,
    pub charges: Mutex<Vec<RecordedCharge>>,
    pub refunds: Mutex<Vec<RecordedRefund>>,
    pub paused: Mutex<Vec<String>>,
    pub resumed: Mutex<Vec<String>>,
    pub cancelled: Mutex<Vec<(String, bool)>>,
    pub decline_charges: AtomicBool,
    pub fail_refunds: AtomicBool,
    charge_seq: AtomicU64,
}

impl MockBillingProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn last_amount_update(&self) -> Option<RecordedAmountUpdate> {
        self.amount_updates.lock().unwrap().last().cloned()
    }

    pub fn amount_updates_for_cycle(&self, next_cycle: bool) -> Vec<RecordedAmountUpdate> {
        self.amount_updates
            .lock()
            .unwrap()
            .iter()
            .filter(|u| u.next_cycle == next_cycle)
            .cloned()
            .collect()
    }

    pub fn charge_count(&self) -> usize {
        self.charges.lock().unwrap().len()
    }

    pub fn refund_count(&self) -> usize {
        self.refunds.lock().unwrap().len()
    }
}

#[async_trait]
impl RecurringBillingProvider for MockBillingProvider {
    async fn create_agreement(
        &self,
        request: CreateAgreementRequest,
    ) -> Result<ProviderAgreement, ServiceError> {
        if self.decline_charges.load(Ordering::SeqCst) {
            return Err(ServiceError::PaymentDeclined {
                kind: DeclineKind::CardDeclined,
                message: "insufficient funds".into(),
            });
        }
        let charged_now =
            request.billing_anchor == Utc::now().date_naive() + Duration::days(1);
        let agreement = ProviderAgreement {
            subscription_id: format!("sub_{}", Uuid::new_v4().simple()),
            price_id: format!("price_{}", Uuid::new_v4().simple()),
            charged_now,
            current_period_end: Utc::now() + Duration::days(7),
        };
        self.agreements.lock().unwrap().push(request);
        Ok(agreement)
    }

    async fn update_agreement_amount(
        &self,
        subscription_id: &str,
        _price_id: &str,
        amount_minor: i64,
        cycle: CycleOffset,
    ) -> Result<(), ServiceError> {
        self.amount_updates.lock().unwrap().push(RecordedAmountUpdate {
            subscription_id: subscription_id.to_string(),
            amount_minor,
            next_cycle: cycle == CycleOffset::Next,
        });
        Ok(())
    }

    async fn charge(
        &self,
        _customer_id: Uuid,
        _payment_method: &str,
        amount_minor: i64,
        idempotency_key: &str,
    ) -> Result<ChargeOutcome, ServiceError> {
        if self.decline_charges.load(Ordering::SeqCst) {
            return Err(ServiceError::PaymentDeclined {
                kind: DeclineKind::CardDeclined,
                message: "insufficient funds".into(),
            });
        }
        self.charges.lock().unwrap().push(RecordedCharge {
            amount_minor,
            idempotency_key: idempotency_key.to_string(),
        });
        let seq = self.charge_seq.fetch_add(1, Ordering::SeqCst);
        Ok(ChargeOutcome {
            charge_id: format!("ch_{seq}"),
            amount_minor,
        })
    }

    async fn refund_latest_invoice(
        &self,
        subscription_id: &str,
        amount_minor: i64,
        idempotency_key: &str,
    ) -> Result<(), ServiceError> {
        if self.fail_refunds.load(Ordering::SeqCst) {
            return Err(ServiceError::RefundFailed("invoice not settled".into()));
        }
        self.refunds.lock().unwrap().push(RecordedRefund {
            target: subscription_id.to_string(),
            amount_minor,
            idempotency_key: idempotency_key.to_string(),
        });
        Ok(())
    }

    async fn refund_charge(
        &self,
        charge_id: &str,
        amount_minor: i64,
        idempotency_key: &str,
    ) -> Result<(), ServiceError> {
        if self.fail_refunds.load(Ordering::SeqCst) {
            return Err(ServiceError::RefundFailed("charge not settled".into()));
        }
        self.refunds.lock().unwrap().push(RecordedRefund {
            target: charge_id.to_string(),
            amount_minor,
            idempotency_key: idempotency_key.to_string(),
        });
        Ok(())
    }

    async fn pause_collection(&self, subscription_id: &str) -> Result<(), ServiceError> {
        self.paused.lock().unwrap().push(subscription_id.to_string());
        Ok(())
    }

    async fn resume_collection(&self, subscription_id: &str) -> Result<(), ServiceError> {
        self.resumed.lock().unwrap().push(subscription_id.to_string());
        Ok(())
    }

    async fn cancel(&self, subscription_id: &str, at_period_end: bool) -> Result<(), ServiceError> {
        self.cancelled
            .lock()
            .unwrap()
            .push((subscription_id.to_string(), at_period_end));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Mock catalog / tax / dispatch / notifications
// ---------------------------------------------------------------------------

pub struct MockCatalog {
    items: HashMap<Uuid, CatalogItem>,
}

impl MockCatalog {
    pub fn with_items(items: Vec<CatalogItem>) -> Arc<Self> {
        Arc::new(Self {
            items: items.into_iter().map(|i| (i.id, i)).collect(),
        })
    }
}

#[async_trait]
impl CatalogSource for MockCatalog {
    async fn lookup(&self, item_ids: &[Uuid]) -> Result<HashMap<Uuid, CatalogItem>, ServiceError> {
        Ok(item_ids
            .iter()
            .filter_map(|id| self.items.get(id).cloned().map(|i| (*id, i)))
            .collect())
    }
}

pub struct FixedTax(pub Decimal);

#[async_trait]
impl TaxRateSource for FixedTax {
    async fn rate_for(&self, _address: &Address) -> Result<Decimal, ServiceError> {
        Ok(self.0)
    }
}

#[derive(Default)]
pub struct MockDispatcher {
    pub created: Mutex<Vec<DeliveryManifest>>,
    pub updated: Mutex<Vec<(String, DeliveryManifest)>>,
    pub cancelled: Mutex<Vec<String>>,
    seq: AtomicU64,
}

impl MockDispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }
}

#[async_trait]
impl DeliveryDispatcher for MockDispatcher {
    async fn create_delivery(&self, manifest: &DeliveryManifest) -> Result<String, ServiceError> {
        self.created.lock().unwrap().push(manifest.clone());
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        Ok(format!("disp_{seq}"))
    }

    async fn update_delivery(
        &self,
        reference: &str,
        manifest: &DeliveryManifest,
    ) -> Result<(), ServiceError> {
        self.updated
            .lock()
            .unwrap()
            .push((reference.to_string(), manifest.clone()));
        Ok(())
    }

    async fn cancel_delivery(&self, reference: &str) -> Result<(), ServiceError> {
        self.cancelled.lock().unwrap().push(reference.to_string());
        Ok(())
    }
}

#[derive(Default)]
pub struct MockNotifier {
    pub sent: Mutex<Vec<(String, String)>>,
}

impl MockNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn templates(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|(t, _)| t.clone()).collect()
    }
}

#[async_trait]
impl NotificationSender for MockNotifier {
    async fn send(
        &self,
        template: &str,
        recipient: &str,
        _payload: serde_json::Value,
    ) -> Result<(), ServiceError> {
        self.sent
            .lock()
            .unwrap()
            .push((template.to_string(), recipient.to_string()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

pub struct TestHarness {
    pub db: Arc<DatabaseConnection>,
    pub services: CoreServices,
    pub provider: Arc<MockBillingProvider>,
    pub dispatcher: Arc<MockDispatcher>,
    pub notifier: Arc<MockNotifier>,
    pub events: mpsc::Receiver<Event>,
}

/// Wires the full service graph against mocks. Tax is a flat 10% so expected
/// amounts stay easy to read.
pub async fn setup(catalog_items: Vec<CatalogItem>) -> TestHarness {
    let db = setup_test_db().await;
    let config = AppConfig::new("sqlite::memory:".into(), "test".into());
    let provider = MockBillingProvider::new();
    let dispatcher = MockDispatcher::new();
    let notifier = MockNotifier::new();
    let (event_sender, events) = event_channel(256);

    let adapters = ExternalAdapters {
        billing_provider: provider.clone(),
        catalog: MockCatalog::with_items(catalog_items),
        tax_source: Arc::new(FixedTax(dec!(10))),
        dispatcher: dispatcher.clone(),
        notification_sender: notifier.clone(),
    };
    let services = CoreServices::build(db.clone(), &config, adapters, Arc::new(event_sender));

    TestHarness {
        db,
        services,
        provider,
        dispatcher,
        notifier,
        events,
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub fn test_address() -> Address {
    Address {
        line1: "12 Spice Lane".into(),
        line2: None,
        city: "Austin".into(),
        state: "TX".into(),
        postal_code: "78701".into(),
        country: "US".into(),
    }
}

pub async fn seed_customer(db: &DatabaseConnection, wallet_balance: Decimal) -> customer::Model {
    let now = Utc::now();
    customer::ActiveModel {
        id: Set(Uuid::new_v4()),
        email: Set(format!("{}@example.com", Uuid::new_v4().simple())),
        name: Set("Priya Test".into()),
        phone: Set(None),
        wallet_balance: Set(wallet_balance),
        billing_address: Set(Some(test_address().to_json_string())),
        shipping_address: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(db)
    .await
    .expect("customer insert should succeed")
}

pub fn catalog_item(name: &str, price: Decimal, min: i32, max: i32) -> CatalogItem {
    CatalogItem {
        id: Uuid::new_v4(),
        name: name.into(),
        unit_price: price,
        min_quantity: min,
        max_quantity: max,
    }
}

/// A date safely outside the 48h action cutoff.
pub fn future_date(days_ahead: i64) -> NaiveDate {
    Utc::now().date_naive() + Duration::days(days_ahead)
}

pub fn selection(item: &CatalogItem, quantity: i32) -> ItemSelection {
    ItemSelection {
        item_id: item.id,
        quantity,
    }
}
