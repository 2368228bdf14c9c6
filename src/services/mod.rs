pub mod billing;
pub mod catalog;
pub mod checkout;
pub mod dispatch;
pub mod notifications;
pub mod pricing;
pub mod subscriptions;
pub mod wallet;

pub use billing::{BillingSyncService, CycleOffset, RecurringBillingProvider};
pub use catalog::{CatalogItem, CatalogSource};
pub use checkout::CheckoutService;
pub use dispatch::{DeliveryDispatcher, DeliveryManifest};
pub use notifications::{NotificationSender, NotificationService};
pub use pricing::{PricingService, TaxRateSource};
pub use subscriptions::SubscriptionOrchestrator;
pub use wallet::{split_payment, PaymentSplit, WalletService};
