//! Subscription order lifecycle and billing reconciliation core for a weekly
//! meal-delivery service.
//!
//! Customers subscribe to recurring weekly deliveries; each subscription owns
//! a pair of orders (the ACTIVE cycle being fulfilled and the UPCOMING cycle
//! being edited), each split into per-day sub-orders. The crate keeps the
//! externally billed recurring amount reconciled with the local order totals
//! across every mutation: item additions, upcoming edits, skips, date
//! switches, day removals, refunds, pause/resume and cancellation.
//!
//! External systems (payment processor, catalog, tax lookup, logistics,
//! notifications) are reached through traits in [`services`]; production
//! adapters live with the callers that wire a [`CoreServices`].

pub mod common;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod logging;
pub mod services;

use crate::{
    config::AppConfig,
    db::DbPool,
    events::EventSender,
    services::{
        billing::{BillingSyncService, RecurringBillingProvider},
        catalog::CatalogSource,
        checkout::CheckoutService,
        dispatch::DeliveryDispatcher,
        notifications::{NotificationSender, NotificationService},
        pricing::{PricingService, TaxRateSource},
        subscriptions::SubscriptionOrchestrator,
        wallet::WalletService,
    },
};
use std::sync::Arc;

/// The external adapters a deployment must supply.
pub struct ExternalAdapters {
    pub billing_provider: Arc<dyn RecurringBillingProvider>,
    pub catalog: Arc<dyn CatalogSource>,
    pub tax_source: Arc<dyn TaxRateSource>,
    pub dispatcher: Arc<dyn DeliveryDispatcher>,
    pub notification_sender: Arc<dyn NotificationSender>,
}

/// Fully wired service graph, shared by whatever surface hosts the core.
#[derive(Clone)]
pub struct CoreServices {
    pub subscriptions: Arc<SubscriptionOrchestrator>,
    pub checkout: Arc<CheckoutService>,
    pub wallet: Arc<WalletService>,
    pub billing: Arc<BillingSyncService>,
    pub pricing: Arc<PricingService>,
}

impl CoreServices {
    pub fn build(
        db: Arc<DbPool>,
        config: &AppConfig,
        adapters: ExternalAdapters,
        event_sender: Arc<EventSender>,
    ) -> Self {
        let commerce = config.commerce.clone();

        let pricing = Arc::new(PricingService::new(adapters.tax_source, commerce.clone()));
        let wallet = Arc::new(WalletService::new());
        let billing = Arc::new(BillingSyncService::new(
            adapters.billing_provider,
            event_sender.clone(),
        ));
        let notifications = Arc::new(NotificationService::new(adapters.notification_sender));

        let subscriptions = Arc::new(SubscriptionOrchestrator::new(
            db.clone(),
            pricing.clone(),
            wallet.clone(),
            billing.clone(),
            adapters.catalog.clone(),
            adapters.dispatcher.clone(),
            notifications.clone(),
            event_sender.clone(),
            commerce.clone(),
        ));
        let checkout = Arc::new(CheckoutService::new(
            db,
            pricing.clone(),
            wallet.clone(),
            billing.clone(),
            adapters.catalog,
            adapters.dispatcher,
            notifications,
            event_sender,
            commerce,
        ));

        Self {
            subscriptions,
            checkout,
            wallet,
            billing,
            pricing,
        }
    }
}
