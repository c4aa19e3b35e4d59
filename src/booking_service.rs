//! Booking state machine - request, approval, payment, confirmation,
//! completion, cancellation.
//!
//! Every transition is a database transaction guarded by an optimistic
//! status predicate, so concurrent callers serialize on the booking row and
//! a lost race surfaces as a clean state error instead of a silent
//! overwrite. The booking row, its units, and its escrow transaction always
//! move together.
//!
//! Ordering with the payment gateway: the booking and its escrow
//! transaction COMMIT FIRST; the gateway initialize call runs afterwards
//! with its own timeout and never inside an open database transaction. A
//! failed initialize leaves a pending leg that `retry_payment` or the
//! payment verifier reconciles, and the expiry sweeper cancels abandoned
//! ones.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::{PgPool, Postgres, Transaction as PgTransaction};
use std::sync::Arc;
use uuid::Uuid;

use crate::errors::{CoreError, CoreResult};
use crate::fees::PlatformFeeService;
use crate::gateway::{from_minor_units, GatewayPaymentStatus, PaymentGateway};
use crate::listings;
use crate::models::{
    new_reference, Booking, BookingStatus, PropertyStatus, Transaction, TransactionMetadata,
    TransactionStatus, TransactionType, Unit, Wallet, WalletTransaction,
    WalletTransactionStatus, WalletTransactionType,
};
use crate::notifications::{Notification, NotificationKind, NotificationSink};
use crate::wallet_service::WalletService;

const DEFAULT_CURRENCY: &str = "NGN";

/// Days billed when the renter gives no end date.
const DEFAULT_RENTAL_DAYS: i64 = 30;

#[derive(Debug, Deserialize)]
pub struct CreateBookingRequestInput {
    pub property_id: Uuid,
    pub unit_ids: Vec<Uuid>,
    pub start_date: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct CreateBookingInput {
    pub property_id: Uuid,
    pub unit_ids: Vec<Uuid>,
    pub start_date: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
    /// Payer email forwarded to the gateway checkout
    pub email: String,
}

/// Price breakdown computed at booking time.
#[derive(Debug, Clone, Serialize)]
pub struct BookingQuote {
    pub base_amount: Decimal,
    pub platform_fee: Decimal,
    pub total_amount: Decimal,
}

#[derive(Debug, Serialize)]
pub struct CreateBookingOutcome {
    pub booking: Booking,
    pub transaction: Transaction,
    pub quote: BookingQuote,
    /// Absent when the gateway call failed after commit; the payment can be
    /// re-initialized via `retry_payment`.
    pub payment_url: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RespondOutcome {
    pub booking: Booking,
    /// Present when the request was accepted: the pending escrow leg the
    /// renter must now pay.
    pub transaction: Option<Transaction>,
}

#[derive(Debug, Serialize)]
pub struct BookingConfirmation {
    pub booking: Booking,
    pub transaction: Transaction,
}

#[derive(Debug, Serialize)]
pub struct EscrowReleaseOutcome {
    pub transaction: Transaction,
    pub wallet: Wallet,
    pub ledger_entry: WalletTransaction,
}

#[derive(Debug, Serialize)]
pub struct PaymentRetry {
    pub reference: String,
    pub authorization_url: String,
    pub amount: Decimal,
}

#[derive(Debug, Serialize)]
pub struct BookingDetail {
    pub booking: Booking,
    pub units: Vec<Unit>,
}

/// Billable days for a stay; open-ended bookings bill one default period.
pub fn rental_days(start: DateTime<Utc>, end: Option<DateTime<Utc>>) -> i64 {
    match end {
        Some(end) => (end - start).num_days().max(1),
        None => DEFAULT_RENTAL_DAYS,
    }
}

/// Pro-rated base rent: monthly amount over 30 days, times billed days.
pub fn base_amount(monthly_amount: Decimal, days: i64) -> Decimal {
    (monthly_amount / dec!(30) * Decimal::from(days)).round_dp(2)
}

pub struct BookingService {
    pool: PgPool,
    gateway: Arc<dyn PaymentGateway>,
    notifier: Arc<dyn NotificationSink>,
    fees: PlatformFeeService,
}

impl BookingService {
    pub fn new(
        pool: PgPool,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn NotificationSink>,
        fees: PlatformFeeService,
    ) -> Self {
        Self {
            pool,
            gateway,
            notifier,
            fees,
        }
    }

    fn quote(&self, monthly_amount: Decimal, days: i64) -> BookingQuote {
        let base = base_amount(monthly_amount, days);
        let fee = self.fees.platform_fee(base);
        BookingQuote {
            base_amount: base,
            platform_fee: fee,
            total_amount: base + fee,
        }
    }

    /// Renter asks the owner for a booking. Creates the booking in
    /// REQUESTED with its unit join rows; units are NOT held yet - they are
    /// claimed when the payment confirms.
    pub async fn create_booking_request(
        &self,
        renter_id: Uuid,
        input: CreateBookingRequestInput,
    ) -> CoreResult<Booking> {
        let property = listings::get_property(&self.pool, input.property_id).await?;
        if property.status != PropertyStatus::Active {
            return Err(CoreError::invalid_state("Property is not open for booking"));
        }
        if property.owner_id == renter_id {
            return Err(CoreError::Authorization(
                "You cannot book your own property".to_string(),
            ));
        }

        let units =
            listings::get_units_for_property(&self.pool, input.property_id, &input.unit_ids)
                .await?;
        listings::ensure_units_available(&units)?;

        let holds = listings::count_active_holds(&self.pool, &input.unit_ids, None).await?;
        if holds > 0 {
            return Err(CoreError::Conflict(
                "Unit is already held by another booking".to_string(),
            ));
        }

        let days = rental_days(input.start_date, input.end_date);
        let base = base_amount(property.amount, days);

        let mut tx = self.pool.begin().await?;
        let booking = insert_booking(
            &mut tx,
            renter_id,
            &input.property_id,
            input.start_date,
            input.end_date,
            base,
            BookingStatus::Requested,
        )
        .await?;
        insert_booking_units(&mut tx, booking.id, &input.unit_ids).await?;
        tx.commit().await?;

        self.notifier
            .notify(Notification {
                user_id: property.owner_id,
                title: "New booking request".to_string(),
                message: format!("You have a new booking request for {}", property.title),
                kind: NotificationKind::BookingRequest,
                data: json!({ "booking_id": booking.id }),
            })
            .await;

        Ok(booking)
    }

    /// Owner accepts or declines a booking request. Acceptance moves the
    /// booking to PENDING_PAYMENT and creates the pending escrow leg the
    /// renter will pay against.
    pub async fn respond_to_booking_request(
        &self,
        booking_id: Uuid,
        lister_id: Uuid,
        accept: bool,
    ) -> CoreResult<RespondOutcome> {
        let booking = self.get_booking(booking_id).await?;
        let property = listings::get_property(&self.pool, booking.property_id).await?;
        if property.owner_id != lister_id {
            return Err(CoreError::Authorization(
                "Only the property owner can respond to this request".to_string(),
            ));
        }

        let target = if accept {
            BookingStatus::PendingPayment
        } else {
            BookingStatus::Declined
        };

        let mut tx = self.pool.begin().await?;

        // Optimistic check: only one response wins; a second caller sees a
        // clean state error.
        let updated = sqlx::query_as::<_, Booking>(
            r#"
            UPDATE bookings
            SET status = $1, updated_at = NOW()
            WHERE id = $2 AND status = 'requested'
            RETURNING *
            "#,
        )
        .bind(target)
        .bind(booking_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| CoreError::invalid_state("Booking request has already been handled"))?;

        let transaction = if accept {
            let quote = self.quote_for_booking(&updated);
            let transaction = insert_escrow_transaction(
                &mut tx,
                updated.renter_id,
                Some(updated.id),
                quote.total_amount,
                &quote,
            )
            .await?;
            sqlx::query(
                "UPDATE bookings SET escrow_transaction_id = $1, updated_at = NOW() WHERE id = $2",
            )
            .bind(transaction.id)
            .bind(updated.id)
            .execute(&mut *tx)
            .await?;
            Some(transaction)
        } else {
            None
        };

        tx.commit().await?;

        let message = if accept {
            "Your booking request was accepted. Please complete payment."
        } else {
            "Your booking request was declined."
        };
        self.notifier
            .notify(Notification {
                user_id: updated.renter_id,
                title: "Booking request update".to_string(),
                message: message.to_string(),
                kind: NotificationKind::BookingResponse,
                data: json!({ "booking_id": updated.id, "accepted": accept }),
            })
            .await;

        Ok(RespondOutcome {
            booking: updated,
            transaction,
        })
    }

    /// Direct-payment booking: booking, escrow leg, and unit claims commit
    /// in one transaction, then the gateway checkout is initialized.
    pub async fn create_booking(
        &self,
        renter_id: Uuid,
        input: CreateBookingInput,
    ) -> CoreResult<CreateBookingOutcome> {
        let property = listings::get_property(&self.pool, input.property_id).await?;
        if property.status != PropertyStatus::Active {
            return Err(CoreError::invalid_state("Property is not open for booking"));
        }
        if property.owner_id == renter_id {
            return Err(CoreError::Authorization(
                "You cannot book your own property".to_string(),
            ));
        }

        let units =
            listings::get_units_for_property(&self.pool, input.property_id, &input.unit_ids)
                .await?;
        listings::ensure_units_available(&units)?;

        let days = rental_days(input.start_date, input.end_date);
        let quote = self.quote(property.amount, days);

        let mut tx = self.pool.begin().await?;
        let booking = insert_booking(
            &mut tx,
            renter_id,
            &input.property_id,
            input.start_date,
            input.end_date,
            quote.base_amount,
            BookingStatus::Pending,
        )
        .await?;
        insert_booking_units(&mut tx, booking.id, &input.unit_ids).await?;

        let transaction = insert_escrow_transaction(
            &mut tx,
            renter_id,
            Some(booking.id),
            quote.total_amount,
            &quote,
        )
        .await?;
        sqlx::query(
            "UPDATE bookings SET escrow_transaction_id = $1, updated_at = NOW() WHERE id = $2",
        )
        .bind(transaction.id)
        .bind(booking.id)
        .execute(&mut *tx)
        .await?;

        listings::claim_property(&mut tx, property.id).await?;
        listings::claim_units(&mut tx, property.id, &input.unit_ids).await?;
        tx.commit().await?;

        // Gateway step runs after commit, outside any transaction; failure
        // here leaves a pending leg the verifier/retry flow will pick up.
        let payment_url = match self
            .gateway
            .initialize_payment(&input.email, quote.total_amount, &transaction.reference)
            .await
        {
            Ok(session) => {
                self.attach_payment_session(
                    transaction.id,
                    &session.authorization_url,
                    session.gateway_reference.as_deref(),
                )
                .await;
                Some(session.authorization_url)
            }
            Err(err) => {
                tracing::warn!(
                    booking_id = %booking.id,
                    reference = %transaction.reference,
                    error = %err,
                    "payment initialization failed after commit; leaving for retry"
                );
                None
            }
        };

        self.notifier
            .notify(Notification {
                user_id: property.owner_id,
                title: "New booking".to_string(),
                message: format!("A renter is booking {}", property.title),
                kind: NotificationKind::BookingRequest,
                data: json!({ "booking_id": booking.id }),
            })
            .await;

        Ok(CreateBookingOutcome {
            booking,
            transaction,
            quote,
            payment_url,
        })
    }

    /// Confirm a payment by its gateway reference on behalf of the paying
    /// user. Idempotent: confirming an already-held payment is a no-op
    /// returning the confirmed state.
    pub async fn confirm_booking_payment(
        &self,
        reference: &str,
        user_id: Uuid,
    ) -> CoreResult<BookingConfirmation> {
        self.confirm_by_reference(reference, Some(user_id)).await
    }

    /// Shared confirmation routine for the request path and the payment
    /// verifier (which passes no expected user).
    pub async fn confirm_by_reference(
        &self,
        reference: &str,
        expected_user: Option<Uuid>,
    ) -> CoreResult<BookingConfirmation> {
        let transaction = self.get_transaction_by_reference(reference).await?;

        if let Some(user_id) = expected_user {
            if transaction.user_id != user_id {
                return Err(CoreError::Authorization(
                    "You do not own this payment".to_string(),
                ));
            }
        }

        let booking_id = transaction
            .booking_id
            .ok_or_else(|| CoreError::invalid_state("Payment is not tied to a booking"))?;
        let booking = self.get_booking(booking_id).await?;

        // Second confirmation of a settled payment is benign.
        if matches!(
            transaction.status,
            TransactionStatus::Held | TransactionStatus::Released
        ) && matches!(
            booking.status,
            BookingStatus::Confirmed | BookingStatus::Completed
        ) {
            return Ok(BookingConfirmation {
                booking,
                transaction,
            });
        }

        if transaction.status != TransactionStatus::Pending {
            return Err(CoreError::invalid_state(
                "Payment is not awaiting confirmation",
            ));
        }
        if !matches!(
            booking.status,
            BookingStatus::Pending | BookingStatus::PendingPayment
        ) {
            return Err(CoreError::invalid_state("Booking is not awaiting payment"));
        }

        // Network verification happens before, and never inside, the
        // database transaction below.
        let verification = self.gateway.verify_payment(reference).await?;
        if verification.status != GatewayPaymentStatus::Success {
            return Err(CoreError::PaymentVerification(
                "Payment was not successful".to_string(),
            ));
        }
        let paid = from_minor_units(verification.amount_minor);
        if paid != transaction.amount {
            return Err(CoreError::PaymentVerification(
                "Payment amount mismatch".to_string(),
            ));
        }

        let mut metadata = TransactionMetadata::from_value(&transaction.metadata);
        if metadata.gateway_reference.is_none() {
            metadata.gateway_reference = verification.gateway_reference.clone();
        }

        let mut tx = self.pool.begin().await?;

        let held = sqlx::query_as::<_, Transaction>(
            r#"
            UPDATE transactions
            SET status = 'held', metadata = $1, processed_at = $2, updated_at = NOW()
            WHERE id = $3 AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(metadata.to_value())
        .bind(Utc::now())
        .bind(transaction.id)
        .fetch_optional(&mut *tx)
        .await?;

        let held = match held {
            Some(held) => held,
            // A concurrent confirmation won the race; report its outcome.
            None => {
                drop(tx);
                let transaction = self.get_transaction_by_reference(reference).await?;
                let booking = self.get_booking(booking_id).await?;
                if transaction.status == TransactionStatus::Held
                    && booking.status == BookingStatus::Confirmed
                {
                    return Ok(BookingConfirmation {
                        booking,
                        transaction,
                    });
                }
                return Err(CoreError::invalid_state(
                    "Payment is not awaiting confirmation",
                ));
            }
        };

        let confirmed = sqlx::query_as::<_, Booking>(
            r#"
            UPDATE bookings
            SET status = 'confirmed', escrow_transaction_id = $1, updated_at = NOW()
            WHERE id = $2 AND status IN ('pending', 'pending_payment')
            RETURNING *
            "#,
        )
        .bind(held.id)
        .bind(booking_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| CoreError::invalid_state("Booking is not awaiting payment"))?;

        listings::rent_units(&mut tx, booking_id, confirmed.renter_id).await?;
        listings::set_property_status(
            &mut tx,
            confirmed.property_id,
            &[PropertyStatus::Active, PropertyStatus::PendingBooking],
            PropertyStatus::Rented,
        )
        .await?;

        tx.commit().await?;

        let property = listings::get_property(&self.pool, confirmed.property_id).await?;
        self.notifier
            .notify(Notification {
                user_id: confirmed.renter_id,
                title: "Payment confirmed".to_string(),
                message: format!("Your booking for {} is confirmed", property.title),
                kind: NotificationKind::PaymentConfirmed,
                data: json!({ "booking_id": confirmed.id }),
            })
            .await;
        self.notifier
            .notify(Notification {
                user_id: property.owner_id,
                title: "Booking paid".to_string(),
                message: format!("Payment received for {}", property.title),
                kind: NotificationKind::PaymentConfirmed,
                data: json!({ "booking_id": confirmed.id }),
            })
            .await;

        Ok(BookingConfirmation {
            booking: confirmed,
            transaction: held,
        })
    }

    /// Close out a confirmed booking. The property returns to ACTIVE; the
    /// units keep their RENTED status and renter until the tenancy is ended
    /// through the separate unit-release flow.
    pub async fn complete_booking(
        &self,
        booking_id: Uuid,
        user_id: Uuid,
    ) -> CoreResult<Booking> {
        let booking = self.get_booking(booking_id).await?;
        let property = listings::get_property(&self.pool, booking.property_id).await?;
        if user_id != booking.renter_id && user_id != property.owner_id {
            return Err(CoreError::Authorization(
                "Only the renter or the property owner can complete a booking".to_string(),
            ));
        }

        let mut tx = self.pool.begin().await?;
        let completed = sqlx::query_as::<_, Booking>(
            r#"
            UPDATE bookings
            SET status = 'completed', updated_at = NOW()
            WHERE id = $1 AND status = 'confirmed'
            RETURNING *
            "#,
        )
        .bind(booking_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| CoreError::invalid_state("Booking is not confirmed"))?;

        listings::set_property_status(
            &mut tx,
            completed.property_id,
            &[PropertyStatus::Rented, PropertyStatus::PendingBooking],
            PropertyStatus::Active,
        )
        .await?;
        tx.commit().await?;

        for target in [completed.renter_id, property.owner_id] {
            self.notifier
                .notify(Notification {
                    user_id: target,
                    title: "Booking completed".to_string(),
                    message: format!("The booking for {} is complete", property.title),
                    kind: NotificationKind::BookingCompleted,
                    data: json!({ "booking_id": completed.id }),
                })
                .await;
        }

        Ok(completed)
    }

    /// Release held escrow funds to the property owner's wallet. The status
    /// transition and the wallet credit are one database transaction: if
    /// the credit fails, the leg stays HELD.
    pub async fn release_escrow(
        &self,
        booking_id: Uuid,
        admin_id: Uuid,
    ) -> CoreResult<EscrowReleaseOutcome> {
        let booking = self.get_booking(booking_id).await?;
        if booking.status != BookingStatus::Completed {
            return Err(CoreError::invalid_state("Booking is not completed"));
        }
        let transaction_id = booking
            .escrow_transaction_id
            .ok_or_else(|| CoreError::invalid_state("Booking has no escrow transaction"))?;
        let transaction = self.get_transaction(transaction_id).await?;
        if transaction.status != TransactionStatus::Held {
            return Err(CoreError::invalid_state("Escrow is not held"));
        }

        let property = listings::get_property(&self.pool, booking.property_id).await?;
        let mut metadata = TransactionMetadata::from_value(&transaction.metadata);
        metadata.approved_by = Some(admin_id);
        // The owner receives the base rent; the platform fee stays behind.
        let payout = metadata.base_amount.unwrap_or(booking.amount);

        let mut tx = self.pool.begin().await?;
        let released = sqlx::query_as::<_, Transaction>(
            r#"
            UPDATE transactions
            SET status = 'released', metadata = $1, processed_at = $2, updated_at = NOW()
            WHERE id = $3 AND status = 'held'
            RETURNING *
            "#,
        )
        .bind(metadata.to_value())
        .bind(Utc::now())
        .bind(transaction_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| CoreError::invalid_state("Escrow is not held"))?;

        let (wallet, ledger_entry) = WalletService::apply_balance_change(
            &mut tx,
            property.owner_id,
            payout,
            WalletTransactionType::EscrowRelease,
            WalletTransactionStatus::Completed,
            &format!("Escrow release for booking {}", booking.id),
            Some(released.id),
        )
        .await?;
        tx.commit().await?;

        self.notifier
            .notify(Notification {
                user_id: property.owner_id,
                title: "Escrow released".to_string(),
                message: format!("{} has been credited to your wallet", payout),
                kind: NotificationKind::EscrowReleased,
                data: json!({ "booking_id": booking.id, "amount": payout }),
            })
            .await;

        Ok(EscrowReleaseOutcome {
            transaction: released,
            wallet,
            ledger_entry,
        })
    }

    /// Cancel a non-terminal booking: frees its units, cancels pending
    /// legs, and refunds the renter when a held escrow exists.
    pub async fn cancel_booking(&self, booking_id: Uuid, user_id: Uuid) -> CoreResult<Booking> {
        let booking = self.get_booking(booking_id).await?;
        let property = listings::get_property(&self.pool, booking.property_id).await?;
        if user_id != booking.renter_id && user_id != property.owner_id {
            return Err(CoreError::Authorization(
                "Only the renter or the property owner can cancel a booking".to_string(),
            ));
        }
        if booking.status.is_terminal() {
            return Err(CoreError::invalid_state("Booking is already closed"));
        }

        let mut tx = self.pool.begin().await?;
        let cancelled = sqlx::query_as::<_, Booking>(
            r#"
            UPDATE bookings
            SET status = 'cancelled', updated_at = NOW()
            WHERE id = $1
              AND status IN ('requested', 'pending', 'pending_payment', 'confirmed')
            RETURNING *
            "#,
        )
        .bind(booking_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| CoreError::invalid_state("Booking is already closed"))?;

        listings::release_units(&mut tx, booking_id).await?;
        listings::set_property_status(
            &mut tx,
            cancelled.property_id,
            &[PropertyStatus::PendingBooking, PropertyStatus::Rented],
            PropertyStatus::Active,
        )
        .await?;

        sqlx::query(
            r#"
            UPDATE transactions
            SET status = 'cancelled', updated_at = NOW()
            WHERE booking_id = $1 AND status = 'pending'
            "#,
        )
        .bind(booking_id)
        .execute(&mut *tx)
        .await?;

        // A confirmed booking holds renter money in escrow; cancelling it
        // refunds the full paid amount in the same transaction.
        if let Some(escrow_id) = cancelled.escrow_transaction_id {
            let refunded = sqlx::query_as::<_, Transaction>(
                r#"
                UPDATE transactions
                SET status = 'cancelled', updated_at = NOW()
                WHERE id = $1 AND status = 'held'
                RETURNING *
                "#,
            )
            .bind(escrow_id)
            .fetch_optional(&mut *tx)
            .await?;

            if let Some(refunded) = refunded {
                WalletService::apply_balance_change(
                    &mut tx,
                    cancelled.renter_id,
                    refunded.amount,
                    WalletTransactionType::Refund,
                    WalletTransactionStatus::Completed,
                    &format!("Refund for cancelled booking {}", cancelled.id),
                    Some(refunded.id),
                )
                .await?;
            }
        }

        tx.commit().await?;

        for target in [cancelled.renter_id, property.owner_id] {
            self.notifier
                .notify(Notification {
                    user_id: target,
                    title: "Booking cancelled".to_string(),
                    message: format!("The booking for {} was cancelled", property.title),
                    kind: NotificationKind::BookingCancelled,
                    data: json!({ "booking_id": cancelled.id }),
                })
                .await;
        }

        Ok(cancelled)
    }

    /// Re-initialize the gateway checkout for an unpaid booking, reusing
    /// the pending escrow leg or minting a fresh one when the previous leg
    /// is terminal.
    pub async fn retry_payment(
        &self,
        booking_id: Uuid,
        user_id: Uuid,
        email: &str,
    ) -> CoreResult<PaymentRetry> {
        let booking = self.get_booking(booking_id).await?;
        if booking.renter_id != user_id {
            return Err(CoreError::Authorization(
                "Only the renter can pay for this booking".to_string(),
            ));
        }
        if !matches!(
            booking.status,
            BookingStatus::Pending | BookingStatus::PendingPayment
        ) {
            return Err(CoreError::invalid_state("Booking is not awaiting payment"));
        }

        let existing = match booking.escrow_transaction_id {
            Some(id) => Some(self.get_transaction(id).await?),
            None => None,
        };

        let transaction = match existing {
            Some(t) if t.status == TransactionStatus::Pending => t,
            // The previous leg failed or was cancelled; mint a new one.
            _ => {
                let quote = self.quote_for_booking(&booking);
                let mut tx = self.pool.begin().await?;
                let transaction = insert_escrow_transaction(
                    &mut tx,
                    booking.renter_id,
                    Some(booking.id),
                    quote.total_amount,
                    &quote,
                )
                .await?;
                sqlx::query(
                    "UPDATE bookings SET escrow_transaction_id = $1, updated_at = NOW() WHERE id = $2",
                )
                .bind(transaction.id)
                .bind(booking.id)
                .execute(&mut *tx)
                .await?;
                tx.commit().await?;
                transaction
            }
        };

        let session = self
            .gateway
            .initialize_payment(email, transaction.amount, &transaction.reference)
            .await?;
        self.attach_payment_session(
            transaction.id,
            &session.authorization_url,
            session.gateway_reference.as_deref(),
        )
        .await;

        Ok(PaymentRetry {
            reference: transaction.reference,
            authorization_url: session.authorization_url,
            amount: transaction.amount,
        })
    }

    pub async fn get_user_booking_by_id(
        &self,
        booking_id: Uuid,
        user_id: Uuid,
    ) -> CoreResult<BookingDetail> {
        let booking = self.get_booking(booking_id).await?;
        let property = listings::get_property(&self.pool, booking.property_id).await?;
        if user_id != booking.renter_id && user_id != property.owner_id {
            return Err(CoreError::Authorization(
                "You do not have access to this booking".to_string(),
            ));
        }

        let units = sqlx::query_as::<_, Unit>(
            r#"
            SELECT u.* FROM units u
            JOIN booking_units bu ON bu.unit_id = u.id
            WHERE bu.booking_id = $1
            "#,
        )
        .bind(booking_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(BookingDetail { booking, units })
    }

    /// Requests awaiting a response across all of the lister's properties.
    pub async fn get_host_booking_requests(&self, lister_id: Uuid) -> CoreResult<Vec<Booking>> {
        let bookings = sqlx::query_as::<_, Booking>(
            r#"
            SELECT b.* FROM bookings b
            JOIN properties p ON p.id = b.property_id
            WHERE p.owner_id = $1 AND b.status = 'requested'
            ORDER BY b.requested_at DESC
            "#,
        )
        .bind(lister_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(bookings)
    }

    pub async fn get_renter_bookings(&self, renter_id: Uuid) -> CoreResult<Vec<Booking>> {
        let bookings = sqlx::query_as::<_, Booking>(
            "SELECT * FROM bookings WHERE renter_id = $1 ORDER BY requested_at DESC",
        )
        .bind(renter_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(bookings)
    }

    // ===== Internal lookups =====

    async fn get_booking(&self, booking_id: Uuid) -> CoreResult<Booking> {
        sqlx::query_as::<_, Booking>("SELECT * FROM bookings WHERE id = $1")
            .bind(booking_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| CoreError::not_found("Booking not found"))
    }

    async fn get_transaction(&self, transaction_id: Uuid) -> CoreResult<Transaction> {
        sqlx::query_as::<_, Transaction>("SELECT * FROM transactions WHERE id = $1")
            .bind(transaction_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| CoreError::not_found("Transaction not found"))
    }

    async fn get_transaction_by_reference(&self, reference: &str) -> CoreResult<Transaction> {
        sqlx::query_as::<_, Transaction>("SELECT * FROM transactions WHERE reference = $1")
            .bind(reference)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| CoreError::not_found("Payment not found"))
    }

    fn quote_for_booking(&self, booking: &Booking) -> BookingQuote {
        let fee = self.fees.platform_fee(booking.amount);
        BookingQuote {
            base_amount: booking.amount,
            platform_fee: fee,
            total_amount: booking.amount + fee,
        }
    }

    /// Best-effort: record the checkout URL on the pending leg. Losing this
    /// write only costs the stored URL, never correctness.
    async fn attach_payment_session(
        &self,
        transaction_id: Uuid,
        authorization_url: &str,
        gateway_reference: Option<&str>,
    ) {
        let result = sqlx::query_as::<_, Transaction>(
            "SELECT * FROM transactions WHERE id = $1 AND status = 'pending'",
        )
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await;

        let Ok(Some(transaction)) = result else {
            return;
        };
        let mut metadata = TransactionMetadata::from_value(&transaction.metadata);
        metadata.payment_url = Some(authorization_url.to_string());
        if let Some(reference) = gateway_reference {
            metadata.gateway_reference = Some(reference.to_string());
        }

        if let Err(err) = sqlx::query(
            "UPDATE transactions SET metadata = $1, updated_at = NOW() WHERE id = $2 AND status = 'pending'",
        )
        .bind(metadata.to_value())
        .bind(transaction_id)
        .execute(&self.pool)
        .await
        {
            tracing::warn!(error = %err, %transaction_id, "failed to store payment session");
        }
    }
}

/// Insert a booking row.
async fn insert_booking(
    tx: &mut PgTransaction<'_, Postgres>,
    renter_id: Uuid,
    property_id: &Uuid,
    start_date: DateTime<Utc>,
    end_date: Option<DateTime<Utc>>,
    amount: Decimal,
    status: BookingStatus,
) -> CoreResult<Booking> {
    let booking = sqlx::query_as::<_, Booking>(
        r#"
        INSERT INTO bookings (
            id, renter_id, property_id, start_date, end_date, amount,
            status, escrow_transaction_id, requested_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, NULL, NOW(), NOW())
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(renter_id)
    .bind(property_id)
    .bind(start_date)
    .bind(end_date)
    .bind(amount)
    .bind(status)
    .fetch_one(&mut **tx)
    .await?;
    Ok(booking)
}

async fn insert_booking_units(
    tx: &mut PgTransaction<'_, Postgres>,
    booking_id: Uuid,
    unit_ids: &[Uuid],
) -> CoreResult<()> {
    sqlx::query(
        "INSERT INTO booking_units (booking_id, unit_id) SELECT $1, UNNEST($2::uuid[])",
    )
    .bind(booking_id)
    .bind(unit_ids)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Insert the pending escrow leg for a rent payment, bookkeeping the fee
/// split in metadata.
async fn insert_escrow_transaction(
    tx: &mut PgTransaction<'_, Postgres>,
    user_id: Uuid,
    booking_id: Option<Uuid>,
    total_amount: Decimal,
    quote: &BookingQuote,
) -> CoreResult<Transaction> {
    let metadata = TransactionMetadata {
        base_amount: Some(quote.base_amount),
        platform_fee: Some(quote.platform_fee),
        ..Default::default()
    };

    let transaction = sqlx::query_as::<_, Transaction>(
        r#"
        INSERT INTO transactions (
            id, transaction_type, amount, currency, status, reference,
            user_id, booking_id, metadata, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW(), NOW())
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(TransactionType::RentPayment)
    .bind(total_amount)
    .bind(DEFAULT_CURRENCY)
    .bind(TransactionStatus::Pending)
    .bind(new_reference("rvp"))
    .bind(user_id)
    .bind(booking_id)
    .bind(metadata.to_value())
    .fetch_one(&mut **tx)
    .await?;
    Ok(transaction)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::testing::FakeGateway;
    use crate::gateway::{to_minor_units, GatewayVerification};
    use crate::models::{Property, UnitStatus};
    use crate::notifications::testing::RecordingNotificationSink;
    use crate::test_support as support;

    #[test]
    fn open_ended_stays_bill_one_month() {
        let start = Utc::now();
        assert_eq!(rental_days(start, None), 30);
    }

    #[test]
    fn dated_stays_bill_actual_days() {
        let start = Utc::now();
        let end = start + chrono::Duration::days(10);
        assert_eq!(rental_days(start, Some(end)), 10);

        // Same-day stays still bill one day
        assert_eq!(rental_days(start, Some(start)), 1);
    }

    #[test]
    fn base_amount_is_prorated_monthly_rent() {
        assert_eq!(base_amount(dec!(30_000), 10), dec!(10_000));
        assert_eq!(base_amount(dec!(30_000), 30), dec!(30_000));
        assert_eq!(base_amount(dec!(45_000), 1), dec!(1_500));
    }

    #[tokio::test]
    async fn quote_adds_platform_fee_on_top_of_base() {
        let service = BookingService::new(
            sqlx::PgPool::connect_lazy("postgres://localhost/unused").unwrap(),
            Arc::new(FakeGateway::new()),
            Arc::new(RecordingNotificationSink::new()),
            PlatformFeeService::new(500),
        );

        // 30000/month for 10 days at a 5% fee
        let quote = service.quote(dec!(30_000), 10);
        assert_eq!(quote.base_amount, dec!(10_000));
        assert_eq!(quote.platform_fee, dec!(500));
        assert_eq!(quote.total_amount, dec!(10_500));
    }

    async fn fetch_unit(pool: &PgPool, unit_id: Uuid) -> Unit {
        sqlx::query_as("SELECT * FROM units WHERE id = $1")
            .bind(unit_id)
            .fetch_one(pool)
            .await
            .unwrap()
    }

    async fn fetch_property(pool: &PgPool, property_id: Uuid) -> Property {
        sqlx::query_as("SELECT * FROM properties WHERE id = $1")
            .bind(property_id)
            .fetch_one(pool)
            .await
            .unwrap()
    }

    fn direct_input(property_id: Uuid, unit_id: Uuid, days: i64) -> CreateBookingInput {
        let start = Utc::now();
        CreateBookingInput {
            property_id,
            unit_ids: vec![unit_id],
            start_date: start,
            end_date: Some(start + chrono::Duration::days(days)),
            email: "renter@example.com".to_string(),
        }
    }

    #[tokio::test]
    #[ignore] // Requires Postgres
    async fn end_to_end_booking_escrow_release() {
        let h = support::harness().await;
        let owner = Uuid::new_v4();
        let renter = Uuid::new_v4();
        let admin = Uuid::new_v4();
        let (property, units) =
            support::seed_property(&h.pool, owner, dec!(30_000), 1).await;

        let outcome = h
            .bookings
            .create_booking(renter, direct_input(property.id, units[0].id, 10))
            .await
            .unwrap();
        assert_eq!(outcome.quote.base_amount, dec!(10_000));
        assert_eq!(outcome.quote.platform_fee, dec!(500));
        assert_eq!(outcome.transaction.amount, dec!(10_500));
        assert!(outcome.payment_url.is_some());
        assert_eq!(outcome.booking.status, BookingStatus::Pending);
        assert_eq!(
            fetch_unit(&h.pool, units[0].id).await.status,
            UnitStatus::PendingBooking
        );

        h.gateway
            .succeed_with_amount(&outcome.transaction.reference, dec!(10_500));
        let confirmation = h
            .bookings
            .confirm_booking_payment(&outcome.transaction.reference, renter)
            .await
            .unwrap();
        assert_eq!(confirmation.booking.status, BookingStatus::Confirmed);
        assert_eq!(confirmation.transaction.status, TransactionStatus::Held);

        let unit = fetch_unit(&h.pool, units[0].id).await;
        assert_eq!(unit.status, UnitStatus::Rented);
        assert_eq!(unit.renter_id, Some(renter));
        assert_eq!(
            fetch_property(&h.pool, property.id).await.status,
            PropertyStatus::Rented
        );

        let completed = h
            .bookings
            .complete_booking(confirmation.booking.id, renter)
            .await
            .unwrap();
        assert_eq!(completed.status, BookingStatus::Completed);
        assert_eq!(
            fetch_property(&h.pool, property.id).await.status,
            PropertyStatus::Active
        );
        // Completion does not free the unit; that is a separate flow.
        assert_eq!(
            fetch_unit(&h.pool, units[0].id).await.status,
            UnitStatus::Rented
        );

        let release = h.bookings.release_escrow(completed.id, admin).await.unwrap();
        assert_eq!(release.transaction.status, TransactionStatus::Released);
        // The owner receives the base rent; the fee stays with the platform.
        assert_eq!(release.wallet.balance, dec!(10_000));
        assert_eq!(
            release.ledger_entry.transaction_type,
            WalletTransactionType::EscrowRelease
        );

        // A second release finds no held escrow.
        let err = h.bookings.release_escrow(completed.id, admin).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidState(_)));
    }

    #[tokio::test]
    #[ignore] // Requires Postgres
    async fn gateway_failure_after_commit_leaves_recoverable_booking() {
        use std::sync::atomic::Ordering;

        let h = support::harness().await;
        let owner = Uuid::new_v4();
        let renter = Uuid::new_v4();
        let (property, units) =
            support::seed_property(&h.pool, owner, dec!(30_000), 1).await;

        // Booking and escrow leg commit even though the checkout call dies.
        h.gateway.fail_initialize.store(true, Ordering::SeqCst);
        let outcome = h
            .bookings
            .create_booking(renter, direct_input(property.id, units[0].id, 10))
            .await
            .unwrap();
        assert!(outcome.payment_url.is_none());
        assert_eq!(outcome.booking.status, BookingStatus::Pending);
        assert_eq!(outcome.transaction.status, TransactionStatus::Pending);
        assert!(h.gateway.initialized_references().is_empty());

        // Once the gateway recovers, retry picks up the same leg.
        h.gateway.fail_initialize.store(false, Ordering::SeqCst);
        let retry = h
            .bookings
            .retry_payment(outcome.booking.id, renter, "renter@example.com")
            .await
            .unwrap();
        assert_eq!(retry.reference, outcome.transaction.reference);
        assert!(h
            .gateway
            .initialized_references()
            .contains(&retry.reference));
    }

    #[tokio::test]
    #[ignore] // Requires Postgres
    async fn confirming_twice_is_benign() {
        let h = support::harness().await;
        let owner = Uuid::new_v4();
        let renter = Uuid::new_v4();
        let (property, units) =
            support::seed_property(&h.pool, owner, dec!(30_000), 1).await;

        let outcome = h
            .bookings
            .create_booking(renter, direct_input(property.id, units[0].id, 10))
            .await
            .unwrap();
        h.gateway
            .succeed_with_amount(&outcome.transaction.reference, dec!(10_500));

        let first = h
            .bookings
            .confirm_booking_payment(&outcome.transaction.reference, renter)
            .await
            .unwrap();
        let second = h
            .bookings
            .confirm_booking_payment(&outcome.transaction.reference, renter)
            .await
            .unwrap();

        assert_eq!(second.booking.status, BookingStatus::Confirmed);
        assert_eq!(second.transaction.status, TransactionStatus::Held);
        assert_eq!(second.transaction.processed_at, first.transaction.processed_at);
    }

    #[tokio::test]
    #[ignore] // Requires Postgres
    async fn amount_mismatch_leaves_state_unchanged() {
        let h = support::harness().await;
        let owner = Uuid::new_v4();
        let renter = Uuid::new_v4();
        let (property, units) =
            support::seed_property(&h.pool, owner, dec!(30_000), 1).await;

        let outcome = h
            .bookings
            .create_booking(renter, direct_input(property.id, units[0].id, 10))
            .await
            .unwrap();

        // Gateway reports success but for the wrong amount.
        h.gateway.set_verification(
            &outcome.transaction.reference,
            GatewayVerification {
                status: GatewayPaymentStatus::Success,
                amount_minor: to_minor_units(dec!(10_499)),
                gateway_reference: None,
            },
        );

        let err = h
            .bookings
            .confirm_booking_payment(&outcome.transaction.reference, renter)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::PaymentVerification(_)));

        // Safe to retry: nothing moved.
        let booking = h
            .bookings
            .get_user_booking_by_id(outcome.booking.id, renter)
            .await
            .unwrap();
        assert_eq!(booking.booking.status, BookingStatus::Pending);
        assert_eq!(
            fetch_unit(&h.pool, units[0].id).await.status,
            UnitStatus::PendingBooking
        );
    }

    #[tokio::test]
    #[ignore] // Requires Postgres
    async fn request_flow_reaches_confirmed() {
        let h = support::harness().await;
        let owner = Uuid::new_v4();
        let renter = Uuid::new_v4();
        let (property, units) =
            support::seed_property(&h.pool, owner, dec!(30_000), 2).await;

        let start = Utc::now();
        let booking = h
            .bookings
            .create_booking_request(
                renter,
                CreateBookingRequestInput {
                    property_id: property.id,
                    unit_ids: vec![units[0].id],
                    start_date: start,
                    end_date: Some(start + chrono::Duration::days(10)),
                },
            )
            .await
            .unwrap();
        assert_eq!(booking.status, BookingStatus::Requested);
        // Requests do not hold units.
        assert_eq!(
            fetch_unit(&h.pool, units[0].id).await.status,
            UnitStatus::Available
        );

        // Only the owner may respond.
        let err = h
            .bookings
            .respond_to_booking_request(booking.id, renter, true)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Authorization(_)));

        let outcome = h
            .bookings
            .respond_to_booking_request(booking.id, owner, true)
            .await
            .unwrap();
        assert_eq!(outcome.booking.status, BookingStatus::PendingPayment);
        let transaction = outcome.transaction.unwrap();
        assert_eq!(transaction.amount, dec!(10_500));

        // A second response loses the optimistic check.
        let err = h
            .bookings
            .respond_to_booking_request(booking.id, owner, false)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidState(_)));

        // The same unit cannot be requested while this booking holds it.
        let err = h
            .bookings
            .create_booking_request(
                Uuid::new_v4(),
                CreateBookingRequestInput {
                    property_id: property.id,
                    unit_ids: vec![units[0].id],
                    start_date: start,
                    end_date: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));

        let retry = h
            .bookings
            .retry_payment(booking.id, renter, "renter@example.com")
            .await
            .unwrap();
        assert_eq!(retry.reference, transaction.reference);
        assert!(!retry.authorization_url.is_empty());

        h.gateway.succeed_with_amount(&retry.reference, dec!(10_500));
        let confirmation = h
            .bookings
            .confirm_booking_payment(&retry.reference, renter)
            .await
            .unwrap();
        assert_eq!(confirmation.booking.status, BookingStatus::Confirmed);
        assert_eq!(
            fetch_unit(&h.pool, units[0].id).await.status,
            UnitStatus::Rented
        );
    }

    #[tokio::test]
    #[ignore] // Requires Postgres
    async fn declined_request_is_terminal() {
        let h = support::harness().await;
        let owner = Uuid::new_v4();
        let renter = Uuid::new_v4();
        let (property, units) =
            support::seed_property(&h.pool, owner, dec!(30_000), 1).await;

        let booking = h
            .bookings
            .create_booking_request(
                renter,
                CreateBookingRequestInput {
                    property_id: property.id,
                    unit_ids: vec![units[0].id],
                    start_date: Utc::now(),
                    end_date: None,
                },
            )
            .await
            .unwrap();

        let outcome = h
            .bookings
            .respond_to_booking_request(booking.id, owner, false)
            .await
            .unwrap();
        assert_eq!(outcome.booking.status, BookingStatus::Declined);
        assert!(outcome.transaction.is_none());

        let err = h
            .bookings
            .cancel_booking(booking.id, renter)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidState(_)));
    }

    #[tokio::test]
    #[ignore] // Requires Postgres
    async fn cancelling_confirmed_booking_refunds_renter() {
        let h = support::harness().await;
        let owner = Uuid::new_v4();
        let renter = Uuid::new_v4();
        let (property, units) =
            support::seed_property(&h.pool, owner, dec!(30_000), 1).await;

        let outcome = h
            .bookings
            .create_booking(renter, direct_input(property.id, units[0].id, 10))
            .await
            .unwrap();
        h.gateway
            .succeed_with_amount(&outcome.transaction.reference, dec!(10_500));
        h.bookings
            .confirm_booking_payment(&outcome.transaction.reference, renter)
            .await
            .unwrap();

        let cancelled = h
            .bookings
            .cancel_booking(outcome.booking.id, renter)
            .await
            .unwrap();
        assert_eq!(cancelled.status, BookingStatus::Cancelled);

        // The unit is freed and the renter got the full paid amount back.
        let unit = fetch_unit(&h.pool, units[0].id).await;
        assert_eq!(unit.status, UnitStatus::Available);
        assert_eq!(unit.renter_id, None);

        let wallet = h.wallets.get_wallet(renter).await.unwrap();
        assert_eq!(wallet.balance, dec!(10_500));
    }
}
