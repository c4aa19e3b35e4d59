//! Application state shared across handlers

use std::sync::Arc;

use axum::extract::FromRef;

use crate::booking_service::BookingService;
use crate::wallet_service::WalletService;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub booking_service: Arc<BookingService>,
    pub wallet_service: Arc<WalletService>,
}

impl AppState {
    pub fn new(booking_service: Arc<BookingService>, wallet_service: Arc<WalletService>) -> Self {
        Self {
            booking_service,
            wallet_service,
        }
    }
}

impl FromRef<AppState> for Arc<BookingService> {
    fn from_ref(app_state: &AppState) -> Self {
        app_state.booking_service.clone()
    }
}

impl FromRef<AppState> for Arc<WalletService> {
    fn from_ref(app_state: &AppState) -> Self {
        app_state.wallet_service.clone()
    }
}
