use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }
}

/// Creates a bounded event channel pair.
pub fn event_channel(buffer: usize) -> (EventSender, mpsc::Receiver<Event>) {
    let (tx, rx) = mpsc::channel(buffer);
    (EventSender::new(tx), rx)
}

// Events emitted by the order lifecycle core after a mutation commits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    // Subscription lifecycle
    SubscriptionCreated {
        subscription_id: Uuid,
        customer_id: Uuid,
    },
    SubscriptionCancelled {
        subscription_id: Uuid,
        at_period_end: bool,
    },
    UpcomingPaused(Uuid),
    UpcomingResumed(Uuid),

    // Order / sub-order mutations
    OrderCreated(Uuid),
    OrderCancelled(Uuid),
    SubOrderSkipped {
        sub_order_id: Uuid,
        credited: Decimal,
    },
    SubOrderUnskipped {
        sub_order_id: Uuid,
        debited: Decimal,
    },
    ItemsAdded {
        sub_order_id: Uuid,
        amount_paid: Decimal,
        saved_to_upcoming: bool,
    },
    UpcomingItemsUpdated {
        sub_order_id: Uuid,
        new_total: Decimal,
    },
    DeliveryDateSwitched {
        sub_order_id: Uuid,
        from_date: NaiveDate,
        to_date: NaiveDate,
    },
    DayRemoved {
        order_id: Uuid,
        sub_order_id: Uuid,
    },

    // Money movements
    WalletDebited {
        customer_id: Uuid,
        amount: Decimal,
    },
    WalletCredited {
        customer_id: Uuid,
        amount: Decimal,
    },
    RefundIssued {
        sub_order_id: Uuid,
        amount: Decimal,
    },
    BillingAmountSynced {
        subscription_id: Uuid,
        amount_minor: i64,
        next_cycle: bool,
    },
}
