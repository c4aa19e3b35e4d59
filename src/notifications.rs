//! Notification sink.
//!
//! The booking and wallet services publish domain events through an injected
//! sink rather than a process-global bus, so tests can substitute a
//! recording implementation. Delivery is fire-and-forget: a failed or slow
//! sink must never roll back the financial transition that triggered it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationKind {
    BookingRequest,
    BookingResponse,
    PaymentConfirmed,
    BookingCompleted,
    BookingCancelled,
    EscrowReleased,
    WithdrawalRequested,
    WithdrawalApproved,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub user_id: Uuid,
    pub title: String,
    pub message: String,
    pub kind: NotificationKind,
    pub data: Value,
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, notification: Notification);
}

/// Default sink: structured log lines. The real delivery pipeline (email,
/// push, in-app) lives outside this core and consumes the same interface.
pub struct TracingNotificationSink;

#[async_trait]
impl NotificationSink for TracingNotificationSink {
    async fn notify(&self, notification: Notification) {
        tracing::info!(
            user_id = %notification.user_id,
            kind = ?notification.kind,
            title = %notification.title,
            "notification"
        );
    }
}
