//! Data models for the Rentvault booking/escrow/wallet core

use rand::Rng;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::types::chrono::{DateTime, Utc};
use uuid::Uuid;

/// Property status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "property_status", rename_all = "snake_case")]
pub enum PropertyStatus {
    Active,
    PendingBooking,
    Rented,
    Inactive,
}

impl sqlx::postgres::PgHasArrayType for PropertyStatus {
    fn array_type_info() -> sqlx::postgres::PgTypeInfo {
        sqlx::postgres::PgTypeInfo::with_name("_property_status")
    }
}

/// Property model
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Property {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub title: String,
    /// Monthly rent
    pub amount: Decimal,
    pub currency: String,
    pub status: PropertyStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Unit status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "unit_status", rename_all = "snake_case")]
pub enum UnitStatus {
    Available,
    PendingBooking,
    Rented,
    Inactive,
    Rejected,
    Suspended,
    PendingReview,
}

/// Rentable unit of a property
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Unit {
    pub id: Uuid,
    pub property_id: Uuid,
    pub label: String,
    pub amount: Decimal,
    pub status: UnitStatus,
    pub renter_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Booking status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "booking_status", rename_all = "snake_case")]
pub enum BookingStatus {
    Requested,
    Declined,
    Pending,
    PendingPayment,
    Confirmed,
    Completed,
    Cancelled,
}

impl BookingStatus {
    /// Whether this status admits no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BookingStatus::Declined | BookingStatus::Completed | BookingStatus::Cancelled
        )
    }

    /// The fixed transition graph for bookings. Cancellation is reachable
    /// from every non-terminal state; everything else moves forward only.
    pub fn can_transition(self, to: BookingStatus) -> bool {
        use BookingStatus::*;
        match (self, to) {
            (Requested, PendingPayment) | (Requested, Declined) => true,
            (Pending, Confirmed) => true,
            (PendingPayment, Confirmed) => true,
            (Confirmed, Completed) => true,
            (from, Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// Booking model
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Booking {
    pub id: Uuid,
    pub renter_id: Uuid,
    pub property_id: Uuid,
    pub start_date: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
    /// Base rent for the booked period, excluding the platform fee
    pub amount: Decimal,
    pub status: BookingStatus,
    pub escrow_transaction_id: Option<Uuid>,
    pub requested_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Escrow transaction types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "transaction_type", rename_all = "snake_case")]
pub enum TransactionType {
    RentPayment,
    Withdrawal,
    EscrowRelease,
    Refund,
}

/// Escrow transaction status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "transaction_status", rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Held,
    Released,
    Cancelled,
    Failed,
    Completed,
}

impl TransactionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransactionStatus::Released
                | TransactionStatus::Cancelled
                | TransactionStatus::Failed
                | TransactionStatus::Completed
        )
    }

    /// Monotonic status graph for escrow legs. Held funds normally end in
    /// Released; the cancel-with-refund flow is the one path that takes a
    /// held leg to Cancelled.
    pub fn can_transition(self, to: TransactionStatus) -> bool {
        use TransactionStatus::*;
        match (self, to) {
            (Pending, Held) | (Pending, Cancelled) | (Pending, Failed) => true,
            // Withdrawals confirm from Pending without passing through Held.
            (Pending, Completed) => true,
            (Held, Released) | (Held, Cancelled) => true,
            _ => false,
        }
    }
}

/// One money movement tied to a booking or a withdrawal
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Transaction {
    pub id: Uuid,
    pub transaction_type: TransactionType,
    /// Always a positive magnitude; direction comes from the type
    pub amount: Decimal,
    pub currency: String,
    pub status: TransactionStatus,
    /// Gateway-correlatable, globally unique
    pub reference: String,
    pub user_id: Uuid,
    pub booking_id: Option<Uuid>,
    pub metadata: serde_json::Value,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Free-form transaction bookkeeping carried in the `metadata` JSONB column.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionMetadata {
    pub base_amount: Option<Decimal>,
    pub platform_fee: Option<Decimal>,
    pub retry_count: u32,
    pub last_retry: Option<DateTime<Utc>>,
    pub gateway_reference: Option<String>,
    pub payment_url: Option<String>,
    pub last_error: Option<String>,
    pub payment_method: Option<String>,
    pub payout_details: Option<serde_json::Value>,
    pub approved_by: Option<Uuid>,
}

impl TransactionMetadata {
    /// Lenient read: malformed or missing metadata degrades to defaults
    /// rather than poisoning the row.
    pub fn from_value(value: &serde_json::Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_default()
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Wallet ledger entry types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "wallet_transaction_type", rename_all = "snake_case")]
pub enum WalletTransactionType {
    Deposit,
    Withdrawal,
    EscrowRelease,
    Refund,
}

impl WalletTransactionType {
    /// Deposits, refunds and escrow releases credit the wallet; everything
    /// else debits it.
    pub fn is_credit(self) -> bool {
        matches!(
            self,
            WalletTransactionType::Deposit
                | WalletTransactionType::Refund
                | WalletTransactionType::EscrowRelease
        )
    }
}

/// Wallet ledger entry status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "wallet_transaction_status", rename_all = "snake_case")]
pub enum WalletTransactionStatus {
    Pending,
    Completed,
    Failed,
}

/// Per-user wallet holding a running balance
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Wallet {
    pub id: Uuid,
    pub user_id: Uuid,
    pub balance: Decimal,
    pub currency: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Immutable ledger entry backing a wallet's balance
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct WalletTransaction {
    pub id: Uuid,
    pub wallet_id: Uuid,
    pub amount: Decimal,
    pub transaction_type: WalletTransactionType,
    pub status: WalletTransactionStatus,
    pub reference: String,
    pub description: String,
    pub related_transaction_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// API response wrapper; callers must check `success` before trusting `data`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub message: String,
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn ok(message: impl Into<String>, data: T) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
        }
    }
}

/// Generate a globally unique, gateway-correlatable reference.
pub fn new_reference(prefix: &str) -> String {
    let nonce: u32 = rand::thread_rng().gen_range(0..1_000_000);
    format!("{}_{}{:06}", prefix, Uuid::new_v4().simple(), nonce)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn booking_graph_moves_forward_only() {
        use BookingStatus::*;
        assert!(Requested.can_transition(PendingPayment));
        assert!(Requested.can_transition(Declined));
        assert!(Pending.can_transition(Confirmed));
        assert!(PendingPayment.can_transition(Confirmed));
        assert!(Confirmed.can_transition(Completed));

        // No skipping a required predecessor
        assert!(!Requested.can_transition(Confirmed));
        assert!(!Requested.can_transition(Completed));
        assert!(!Pending.can_transition(Completed));
        assert!(!PendingPayment.can_transition(Completed));
        assert!(!Confirmed.can_transition(PendingPayment));
    }

    #[test]
    fn cancellation_reachable_from_every_non_terminal_state() {
        use BookingStatus::*;
        for from in [Requested, Pending, PendingPayment, Confirmed] {
            assert!(from.can_transition(Cancelled), "{:?} should cancel", from);
        }
        for from in [Declined, Completed, Cancelled] {
            assert!(!from.can_transition(Cancelled), "{:?} is terminal", from);
        }
    }

    #[test]
    fn terminal_booking_states_admit_nothing() {
        use BookingStatus::*;
        let all = [
            Requested,
            Declined,
            Pending,
            PendingPayment,
            Confirmed,
            Completed,
            Cancelled,
        ];
        for from in [Declined, Completed, Cancelled] {
            for to in all {
                assert!(!from.can_transition(to));
            }
        }
    }

    #[test]
    fn escrow_leg_status_is_monotonic() {
        use TransactionStatus::*;
        assert!(Pending.can_transition(Held));
        assert!(Held.can_transition(Released));
        assert!(Pending.can_transition(Cancelled));
        assert!(Pending.can_transition(Failed));
        assert!(Held.can_transition(Cancelled)); // refund path

        assert!(!Held.can_transition(Pending));
        assert!(!Released.can_transition(Held));
        assert!(!Cancelled.can_transition(Pending));
        assert!(!Failed.can_transition(Held));
        assert!(!Released.can_transition(Cancelled));
    }

    #[test]
    fn ledger_entry_direction_follows_type() {
        assert!(WalletTransactionType::Deposit.is_credit());
        assert!(WalletTransactionType::Refund.is_credit());
        assert!(WalletTransactionType::EscrowRelease.is_credit());
        assert!(!WalletTransactionType::Withdrawal.is_credit());
    }

    #[test]
    fn references_are_unique_and_prefixed() {
        let a = new_reference("rvp");
        let b = new_reference("rvp");
        assert!(a.starts_with("rvp_"));
        assert_ne!(a, b);
    }

    #[test]
    fn metadata_round_trips_and_tolerates_garbage() {
        let meta = TransactionMetadata {
            retry_count: 2,
            gateway_reference: Some("gw_123".into()),
            ..Default::default()
        };
        let back = TransactionMetadata::from_value(&meta.to_value());
        assert_eq!(back.retry_count, 2);
        assert_eq!(back.gateway_reference.as_deref(), Some("gw_123"));

        let garbage = serde_json::json!("not an object");
        assert_eq!(TransactionMetadata::from_value(&garbage).retry_count, 0);
    }
}
