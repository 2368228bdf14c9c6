use crate::{
    entities::{customer, transaction_history},
    errors::ServiceError,
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::sea_query::Expr;
use sea_orm::{ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, Set};
use tracing::{info, instrument};
use uuid::Uuid;

pub use crate::entities::transaction_history::TransactionKind;

/// How an amount due is split between the stored wallet balance and the card.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaymentSplit {
    pub wallet_deduction: Decimal,
    pub card_amount: Decimal,
}

impl PaymentSplit {
    pub fn card_only(amount: Decimal) -> Self {
        Self {
            wallet_deduction: Decimal::ZERO,
            card_amount: amount,
        }
    }

    /// True when the wallet covers the whole amount and no processor call is
    /// needed.
    pub fn wallet_covers_all(&self) -> bool {
        self.card_amount.is_zero()
    }
}

/// Splits an amount due between wallet and card, respecting the processor's
/// minimum chargeable amount.
///
/// The wallet absorbs as much as it can, except that a remainder strictly
/// between zero and `min_chargeable` is never left for the card: the wallet
/// deduction is reduced so the card takes at least the minimum. The reverse
/// (rounding the remainder into the wallet) is never done.
pub fn split_payment(
    wallet_balance: Decimal,
    amount_due: Decimal,
    use_wallet: bool,
    min_chargeable: Decimal,
) -> PaymentSplit {
    if amount_due <= Decimal::ZERO {
        return PaymentSplit::card_only(Decimal::ZERO);
    }
    if !use_wallet || wallet_balance <= Decimal::ZERO {
        return PaymentSplit::card_only(amount_due);
    }

    let mut wallet_deduction = wallet_balance.min(amount_due);
    let mut card_amount = amount_due - wallet_deduction;

    if card_amount > Decimal::ZERO && card_amount < min_chargeable {
        let reduced = amount_due - min_chargeable;
        if reduced >= Decimal::ZERO {
            wallet_deduction = reduced;
            card_amount = min_chargeable;
        } else {
            // The whole amount is below the processor floor; nothing the
            // wallet can do about it, send it to the card untouched.
            wallet_deduction = Decimal::ZERO;
            card_amount = amount_due;
        }
    }

    PaymentSplit {
        wallet_deduction,
        card_amount,
    }
}

/// Wallet ledger. Every balance mutation happens through a conditional update
/// on the previously read balance and is paired with an append-only
/// transaction-history row in the same database transaction.
#[derive(Clone, Default)]
pub struct WalletService;

impl WalletService {
    pub fn new() -> Self {
        Self
    }

    /// Debits the customer's wallet. Fails with `InsufficientWalletBalance`
    /// when the balance cannot cover the amount; the balance never goes
    /// negative.
    #[instrument(skip(self, conn), fields(customer_id = %customer_id, amount = %amount))]
    pub async fn debit<C: ConnectionTrait>(
        &self,
        conn: &C,
        customer_id: Uuid,
        amount: Decimal,
        description: &str,
        order_id: Option<Uuid>,
        sub_order_id: Option<Uuid>,
    ) -> Result<Decimal, ServiceError> {
        if amount < Decimal::ZERO {
            return Err(ServiceError::ValidationError(
                "debit amount must be non-negative".into(),
            ));
        }
        if amount.is_zero() {
            let current = self.balance(conn, customer_id).await?;
            return Ok(current);
        }

        let current = self.balance(conn, customer_id).await?;
        if current < amount {
            return Err(ServiceError::InsufficientWalletBalance(format!(
                "balance {} cannot cover {}",
                current, amount
            )));
        }

        let new_balance = current - amount;
        self.apply_balance(conn, customer_id, current, new_balance)
            .await?;
        self.record(
            conn,
            customer_id,
            TransactionKind::Debit,
            amount,
            description,
            order_id,
            sub_order_id,
        )
        .await?;

        info!(new_balance = %new_balance, "wallet debited");
        Ok(new_balance)
    }

    /// Credits the customer's wallet and records the ledger entry.
    #[instrument(skip(self, conn), fields(customer_id = %customer_id, amount = %amount))]
    pub async fn credit<C: ConnectionTrait>(
        &self,
        conn: &C,
        customer_id: Uuid,
        amount: Decimal,
        description: &str,
        order_id: Option<Uuid>,
        sub_order_id: Option<Uuid>,
    ) -> Result<Decimal, ServiceError> {
        if amount < Decimal::ZERO {
            return Err(ServiceError::ValidationError(
                "credit amount must be non-negative".into(),
            ));
        }
        if amount.is_zero() {
            let current = self.balance(conn, customer_id).await?;
            return Ok(current);
        }

        let current = self.balance(conn, customer_id).await?;
        let new_balance = current + amount;
        self.apply_balance(conn, customer_id, current, new_balance)
            .await?;
        self.record(
            conn,
            customer_id,
            TransactionKind::Credit,
            amount,
            description,
            order_id,
            sub_order_id,
        )
        .await?;

        info!(new_balance = %new_balance, "wallet credited");
        Ok(new_balance)
    }

    /// Current wallet balance.
    pub async fn balance<C: ConnectionTrait>(
        &self,
        conn: &C,
        customer_id: Uuid,
    ) -> Result<Decimal, ServiceError> {
        let customer = customer::Entity::find_by_id(customer_id)
            .one(conn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Customer {} not found", customer_id)))?;
        Ok(customer.wallet_balance)
    }

    /// Conditional balance update: only succeeds if the stored balance still
    /// equals the one read in this transaction. A mismatch means a concurrent
    /// writer got there first.
    async fn apply_balance<C: ConnectionTrait>(
        &self,
        conn: &C,
        customer_id: Uuid,
        expected: Decimal,
        new_balance: Decimal,
    ) -> Result<(), ServiceError> {
        let result = customer::Entity::update_many()
            .col_expr(customer::Column::WalletBalance, Expr::value(new_balance))
            .col_expr(customer::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(customer::Column::Id.eq(customer_id))
            .filter(customer::Column::WalletBalance.eq(expected))
            .exec(conn)
            .await?;

        if result.rows_affected == 0 {
            return Err(ServiceError::ConcurrentModification(customer_id));
        }
        Ok(())
    }

    async fn record<C: ConnectionTrait>(
        &self,
        conn: &C,
        customer_id: Uuid,
        kind: TransactionKind,
        amount: Decimal,
        description: &str,
        order_id: Option<Uuid>,
        sub_order_id: Option<Uuid>,
    ) -> Result<(), ServiceError> {
        let entry = transaction_history::ActiveModel {
            id: Set(Uuid::new_v4()),
            customer_id: Set(customer_id),
            order_id: Set(order_id),
            sub_order_id: Set(sub_order_id),
            kind: Set(kind),
            amount: Set(amount),
            description: Set(description.to_string()),
            created_at: Set(Utc::now()),
        };
        entry.insert(conn).await?;
        Ok(())
    }
}
