//! Property and unit availability tracking.
//!
//! The claim/release helpers are status-guarded UPDATEs designed to run
//! inside a booking transition's database transaction: a claim that matches
//! fewer rows than expected means another booking got there first, and the
//! caller rolls the whole transition back.

use sqlx::{PgPool, Postgres, Transaction as PgTransaction};
use uuid::Uuid;

use crate::errors::{CoreError, CoreResult};
use crate::models::{Property, PropertyStatus, Unit, UnitStatus};

pub async fn get_property(pool: &PgPool, property_id: Uuid) -> CoreResult<Property> {
    sqlx::query_as::<_, Property>("SELECT * FROM properties WHERE id = $1")
        .bind(property_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| CoreError::not_found("Property not found"))
}

/// Fetch the requested units, verifying each exists and belongs to the
/// property.
pub async fn get_units_for_property(
    pool: &PgPool,
    property_id: Uuid,
    unit_ids: &[Uuid],
) -> CoreResult<Vec<Unit>> {
    let units = sqlx::query_as::<_, Unit>(
        "SELECT * FROM units WHERE id = ANY($1) AND property_id = $2",
    )
    .bind(unit_ids)
    .bind(property_id)
    .fetch_all(pool)
    .await?;

    if units.len() != unit_ids.len() {
        return Err(CoreError::not_found("One or more units not found"));
    }

    Ok(units)
}

/// Count units among `unit_ids` currently held by another pending or active
/// booking.
pub async fn count_active_holds(
    pool: &PgPool,
    unit_ids: &[Uuid],
    exclude_booking: Option<Uuid>,
) -> CoreResult<i64> {
    let (count,): (i64,) = sqlx::query_as(
        r#"
        SELECT COUNT(*)
        FROM booking_units bu
        JOIN bookings b ON b.id = bu.booking_id
        WHERE bu.unit_id = ANY($1)
          AND b.status IN ('pending', 'pending_payment', 'confirmed')
          AND ($2::uuid IS NULL OR b.id != $2)
        "#,
    )
    .bind(unit_ids)
    .bind(exclude_booking)
    .fetch_one(pool)
    .await?;

    Ok(count)
}

/// Move every requested unit from AVAILABLE into PENDING_BOOKING. Fails with
/// a conflict when any unit has been taken since validation.
pub async fn claim_units(
    tx: &mut PgTransaction<'_, Postgres>,
    property_id: Uuid,
    unit_ids: &[Uuid],
) -> CoreResult<()> {
    let result = sqlx::query(
        r#"
        UPDATE units
        SET status = 'pending_booking', updated_at = NOW()
        WHERE id = ANY($1) AND property_id = $2 AND status = 'available'
        "#,
    )
    .bind(unit_ids)
    .bind(property_id)
    .execute(&mut **tx)
    .await?;

    if result.rows_affected() != unit_ids.len() as u64 {
        return Err(CoreError::Conflict("Unit no longer available".to_string()));
    }

    Ok(())
}

/// Move the property from ACTIVE into PENDING_BOOKING.
pub async fn claim_property(
    tx: &mut PgTransaction<'_, Postgres>,
    property_id: Uuid,
) -> CoreResult<()> {
    let result = sqlx::query(
        r#"
        UPDATE properties
        SET status = 'pending_booking', updated_at = NOW()
        WHERE id = $1 AND status = 'active'
        "#,
    )
    .bind(property_id)
    .execute(&mut **tx)
    .await?;

    if result.rows_affected() == 0 {
        return Err(CoreError::Conflict(
            "Property no longer available".to_string(),
        ));
    }

    Ok(())
}

/// Mark a confirmed booking's units as RENTED by the renter. Units may come
/// from either flow: AVAILABLE (request flow, never pre-claimed) or
/// PENDING_BOOKING (direct flow). A shortfall means a racing booking won.
pub async fn rent_units(
    tx: &mut PgTransaction<'_, Postgres>,
    booking_id: Uuid,
    renter_id: Uuid,
) -> CoreResult<u64> {
    let expected: (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM booking_units WHERE booking_id = $1")
            .bind(booking_id)
            .fetch_one(&mut **tx)
            .await?;

    let result = sqlx::query(
        r#"
        UPDATE units
        SET status = 'rented', renter_id = $2, updated_at = NOW()
        WHERE id IN (SELECT unit_id FROM booking_units WHERE booking_id = $1)
          AND status IN ('available', 'pending_booking')
        "#,
    )
    .bind(booking_id)
    .bind(renter_id)
    .execute(&mut **tx)
    .await?;

    if result.rows_affected() != expected.0 as u64 {
        return Err(CoreError::Conflict("Unit no longer available".to_string()));
    }

    Ok(result.rows_affected())
}

pub async fn set_property_status(
    tx: &mut PgTransaction<'_, Postgres>,
    property_id: Uuid,
    from: &[PropertyStatus],
    to: PropertyStatus,
) -> CoreResult<bool> {
    let result = sqlx::query(
        r#"
        UPDATE properties
        SET status = $2, updated_at = NOW()
        WHERE id = $1 AND status = ANY($3)
        "#,
    )
    .bind(property_id)
    .bind(to)
    .bind(from)
    .execute(&mut **tx)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Return a booking's held units to AVAILABLE. Only units still in
/// PENDING_BOOKING or RENTED are touched; already-freed units stay put.
pub async fn release_units(
    tx: &mut PgTransaction<'_, Postgres>,
    booking_id: Uuid,
) -> CoreResult<u64> {
    let result = sqlx::query(
        r#"
        UPDATE units
        SET status = 'available', renter_id = NULL, updated_at = NOW()
        WHERE id IN (SELECT unit_id FROM booking_units WHERE booking_id = $1)
          AND status IN ('pending_booking', 'rented')
        "#,
    )
    .bind(booking_id)
    .execute(&mut **tx)
    .await?;

    Ok(result.rows_affected())
}

/// Require every unit to be AVAILABLE right now (read-side validation before
/// a booking request is created).
pub fn ensure_units_available(units: &[Unit]) -> CoreResult<()> {
    for unit in units {
        if unit.status != UnitStatus::Available {
            return Err(CoreError::Conflict(format!(
                "Unit {} is not available",
                unit.label
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn unit(status: UnitStatus) -> Unit {
        Unit {
            id: Uuid::new_v4(),
            property_id: Uuid::new_v4(),
            label: "A1".to_string(),
            amount: dec!(30_000),
            status,
            renter_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn available_units_pass_validation() {
        let units = vec![unit(UnitStatus::Available), unit(UnitStatus::Available)];
        assert!(ensure_units_available(&units).is_ok());
    }

    #[test]
    fn held_or_inactive_units_are_conflicts() {
        for status in [
            UnitStatus::PendingBooking,
            UnitStatus::Rented,
            UnitStatus::Inactive,
            UnitStatus::Suspended,
        ] {
            let units = vec![unit(UnitStatus::Available), unit(status)];
            let err = ensure_units_available(&units).unwrap_err();
            assert!(matches!(err, CoreError::Conflict(_)), "{:?}", status);
        }
    }
}
