//! Route definitions for the Rentvault API

use axum::{
    routing::{get, post},
    Router,
};

use crate::app_state::AppState;
use crate::handlers::*;

// Booking routes
pub fn booking_routes() -> Router<AppState> {
    Router::new()
        .route("/api/bookings", post(create_booking))
        .route("/api/bookings/requests", post(create_booking_request))
        .route(
            "/api/bookings/requests/:id/respond",
            post(respond_to_booking_request),
        )
        .route("/api/bookings/payments/confirm", post(confirm_booking_payment))
        .route("/api/bookings/:id", get(get_user_booking_by_id))
        .route("/api/bookings/:id/complete", post(complete_booking))
        .route("/api/bookings/:id/cancel", post(cancel_booking))
        .route("/api/bookings/:id/retry-payment", post(retry_payment))
        .route("/api/bookings/:id/release-escrow", post(release_escrow))
        .route("/api/bookings/host/:lister_id", get(get_host_booking_requests))
        .route("/api/bookings/renter/:renter_id", get(get_renter_bookings))
}

// Wallet routes
pub fn wallet_routes() -> Router<AppState> {
    Router::new()
        .route("/api/wallets/:user_id", get(get_wallet))
        .route(
            "/api/wallets/:user_id/transactions",
            get(get_wallet_transactions),
        )
        .route("/api/wallets/withdrawals", post(request_withdrawal))
        .route(
            "/api/wallets/withdrawals/:id/approve",
            post(approve_withdrawal),
        )
}
