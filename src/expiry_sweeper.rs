//! Expired-booking sweeper.
//!
//! Bookings abandoned before payment sit in PENDING/PENDING_PAYMENT holding
//! units hostage. Past the configured threshold this worker cancels them,
//! returns their units to AVAILABLE, and cancels their pending escrow legs.
//! Each booking is swept in its own database transaction so one failure
//! never blocks the rest of the batch.

use chrono::Utc;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::errors::CoreResult;
use crate::listings;
use crate::models::{Booking, PropertyStatus};

/// Cap on bookings swept per cycle; the rest wait for the next tick.
const BATCH_LIMIT: i64 = 200;

pub struct ExpiredBookingSweeper {
    pool: PgPool,
    interval: Duration,
    threshold: chrono::Duration,
    shutdown: watch::Sender<bool>,
}

impl ExpiredBookingSweeper {
    pub fn new(pool: PgPool, interval: Duration, threshold: chrono::Duration) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            pool,
            interval,
            threshold,
            shutdown,
        }
    }

    /// Spawn the polling loop. The returned handle completes after
    /// [`Self::stop`] is called.
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        let mut stop = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                interval_secs = self.interval.as_secs(),
                threshold_hours = self.threshold.num_hours(),
                "expired-booking sweeper started"
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match self.run_once().await {
                            Ok(swept) => info!(swept, "booking sweep complete"),
                            Err(err) => error!(error = %err, "booking sweep failed"),
                        }
                    }
                    _ = stop.changed() => break,
                }
            }

            info!("expired-booking sweeper stopped");
        })
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    /// One sweep pass; returns how many bookings were cancelled.
    pub async fn run_once(&self) -> CoreResult<usize> {
        let cutoff = Utc::now() - self.threshold;
        let expired = sqlx::query_as::<_, Booking>(
            r#"
            SELECT * FROM bookings
            WHERE status IN ('pending', 'pending_payment')
              AND COALESCE(updated_at, requested_at) < $1
            ORDER BY updated_at ASC
            LIMIT $2
            "#,
        )
        .bind(cutoff)
        .bind(BATCH_LIMIT)
        .fetch_all(&self.pool)
        .await?;

        let mut swept = 0;
        for booking in expired {
            match self.sweep_one(&booking).await {
                Ok(true) => {
                    info!(booking_id = %booking.id, "expired booking cancelled");
                    swept += 1;
                }
                // Lost the race to a payment or another replica; fine.
                Ok(false) => {}
                Err(err) => {
                    warn!(booking_id = %booking.id, error = %err, "sweep deferred to next cycle");
                }
            }
        }

        Ok(swept)
    }

    /// Cancel one expired booking atomically: booking, units, and pending
    /// escrow legs move together or not at all.
    async fn sweep_one(&self, booking: &Booking) -> CoreResult<bool> {
        let mut tx = self.pool.begin().await?;

        let cancelled = sqlx::query_as::<_, Booking>(
            r#"
            UPDATE bookings
            SET status = 'cancelled', updated_at = NOW()
            WHERE id = $1 AND status IN ('pending', 'pending_payment')
            RETURNING *
            "#,
        )
        .bind(booking.id)
        .fetch_optional(&mut *tx)
        .await?;

        if cancelled.is_none() {
            return Ok(false);
        }

        listings::release_units(&mut tx, booking.id).await?;
        // Only unwind a hold this booking created; a property RENTED by a
        // confirmed booking is not touched.
        listings::set_property_status(
            &mut tx,
            booking.property_id,
            &[PropertyStatus::PendingBooking],
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
        .bind(booking.id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }
}
