pub mod customer;
pub mod order;
pub mod order_item;
pub mod preference_order;
pub mod preference_sub_order;
pub mod sub_order;
pub mod subscription;
pub mod transaction_history;

pub use customer::Entity as Customer;
pub use order::Entity as Order;
pub use order_item::Entity as OrderItem;
pub use preference_order::Entity as PreferenceOrder;
pub use preference_sub_order::Entity as PreferenceSubOrder;
pub use sub_order::Entity as SubOrder;
pub use subscription::Entity as Subscription;
pub use transaction_history::Entity as TransactionHistory;
