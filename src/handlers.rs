//! API handlers - thin axum glue over the booking and wallet services.
//!
//! Every response is the uniform `{success, message, data}` wrapper; domain
//! failures map onto status codes through the error taxonomy.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;

use crate::app_state::AppState;
use crate::booking_service::{
    BookingConfirmation, BookingDetail, CreateBookingInput, CreateBookingOutcome,
    CreateBookingRequestInput, EscrowReleaseOutcome, PaymentRetry, RespondOutcome,
};
use crate::errors::CoreError;
use crate::models::{ApiResponse, Booking, Transaction, Wallet, WalletTransaction};
use crate::wallet_service::WithdrawalRequest;

type HandlerResult<T> = Result<Json<ApiResponse<T>>, (StatusCode, Json<ApiResponse<T>>)>;

fn reject<T>(err: CoreError) -> (StatusCode, Json<ApiResponse<T>>) {
    (err.status_code(), Json(ApiResponse::failure(err.to_string())))
}

fn bad_request<T>(message: String) -> (StatusCode, Json<ApiResponse<T>>) {
    (StatusCode::BAD_REQUEST, Json(ApiResponse::failure(message)))
}

// ===== Booking handlers =====

#[derive(Debug, Deserialize, Validate)]
pub struct CreateBookingRequestBody {
    pub renter_id: Uuid,
    pub property_id: Uuid,
    #[validate(length(min = 1, message = "at least one unit is required"))]
    pub unit_ids: Vec<Uuid>,
    pub start_date: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
}

pub async fn create_booking_request(
    State(state): State<AppState>,
    Json(body): Json<CreateBookingRequestBody>,
) -> HandlerResult<Booking> {
    if let Err(e) = body.validate() {
        return Err(bad_request(format!("Validation error: {}", e)));
    }

    let input = CreateBookingRequestInput {
        property_id: body.property_id,
        unit_ids: body.unit_ids,
        start_date: body.start_date,
        end_date: body.end_date,
    };
    match state
        .booking_service
        .create_booking_request(body.renter_id, input)
        .await
    {
        Ok(booking) => Ok(Json(ApiResponse::ok("Booking request created", booking))),
        Err(err) => Err(reject(err)),
    }
}

#[derive(Debug, Deserialize)]
pub struct RespondBody {
    pub lister_id: Uuid,
    pub accept: bool,
}

pub async fn respond_to_booking_request(
    State(state): State<AppState>,
    Path(booking_id): Path<Uuid>,
    Json(body): Json<RespondBody>,
) -> HandlerResult<RespondOutcome> {
    match state
        .booking_service
        .respond_to_booking_request(booking_id, body.lister_id, body.accept)
        .await
    {
        Ok(outcome) => {
            let message = if body.accept {
                "Booking request accepted"
            } else {
                "Booking request declined"
            };
            Ok(Json(ApiResponse::ok(message, outcome)))
        }
        Err(err) => Err(reject(err)),
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateBookingBody {
    pub renter_id: Uuid,
    pub property_id: Uuid,
    #[validate(length(min = 1, message = "at least one unit is required"))]
    pub unit_ids: Vec<Uuid>,
    pub start_date: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
    #[validate(email)]
    pub email: String,
}

pub async fn create_booking(
    State(state): State<AppState>,
    Json(body): Json<CreateBookingBody>,
) -> HandlerResult<CreateBookingOutcome> {
    if let Err(e) = body.validate() {
        return Err(bad_request(format!("Validation error: {}", e)));
    }

    let input = CreateBookingInput {
        property_id: body.property_id,
        unit_ids: body.unit_ids,
        start_date: body.start_date,
        end_date: body.end_date,
        email: body.email,
    };
    match state
        .booking_service
        .create_booking(body.renter_id, input)
        .await
    {
        Ok(outcome) => Ok(Json(ApiResponse::ok("Booking created", outcome))),
        Err(err) => Err(reject(err)),
    }
}

#[derive(Debug, Deserialize)]
pub struct ConfirmPaymentBody {
    pub reference: String,
    pub user_id: Uuid,
}

pub async fn confirm_booking_payment(
    State(state): State<AppState>,
    Json(body): Json<ConfirmPaymentBody>,
) -> HandlerResult<BookingConfirmation> {
    match state
        .booking_service
        .confirm_booking_payment(&body.reference, body.user_id)
        .await
    {
        Ok(confirmation) => Ok(Json(ApiResponse::ok("Payment confirmed", confirmation))),
        Err(err) => Err(reject(err)),
    }
}

#[derive(Debug, Deserialize)]
pub struct ActorBody {
    pub user_id: Uuid,
}

pub async fn complete_booking(
    State(state): State<AppState>,
    Path(booking_id): Path<Uuid>,
    Json(body): Json<ActorBody>,
) -> HandlerResult<Booking> {
    match state
        .booking_service
        .complete_booking(booking_id, body.user_id)
        .await
    {
        Ok(booking) => Ok(Json(ApiResponse::ok("Booking completed", booking))),
        Err(err) => Err(reject(err)),
    }
}

pub async fn cancel_booking(
    State(state): State<AppState>,
    Path(booking_id): Path<Uuid>,
    Json(body): Json<ActorBody>,
) -> HandlerResult<Booking> {
    match state
        .booking_service
        .cancel_booking(booking_id, body.user_id)
        .await
    {
        Ok(booking) => Ok(Json(ApiResponse::ok("Booking cancelled", booking))),
        Err(err) => Err(reject(err)),
    }
}

#[derive(Debug, Deserialize)]
pub struct ReleaseEscrowBody {
    pub admin_id: Uuid,
}

pub async fn release_escrow(
    State(state): State<AppState>,
    Path(booking_id): Path<Uuid>,
    Json(body): Json<ReleaseEscrowBody>,
) -> HandlerResult<EscrowReleaseOutcome> {
    match state
        .booking_service
        .release_escrow(booking_id, body.admin_id)
        .await
    {
        Ok(outcome) => Ok(Json(ApiResponse::ok("Escrow released", outcome))),
        Err(err) => Err(reject(err)),
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct RetryPaymentBody {
    pub user_id: Uuid,
    #[validate(email)]
    pub email: String,
}

pub async fn retry_payment(
    State(state): State<AppState>,
    Path(booking_id): Path<Uuid>,
    Json(body): Json<RetryPaymentBody>,
) -> HandlerResult<PaymentRetry> {
    if let Err(e) = body.validate() {
        return Err(bad_request(format!("Validation error: {}", e)));
    }

    match state
        .booking_service
        .retry_payment(booking_id, body.user_id, &body.email)
        .await
    {
        Ok(retry) => Ok(Json(ApiResponse::ok("Payment initialized", retry))),
        Err(err) => Err(reject(err)),
    }
}

#[derive(Debug, Deserialize)]
pub struct ActorQuery {
    pub user_id: Uuid,
}

pub async fn get_user_booking_by_id(
    State(state): State<AppState>,
    Path(booking_id): Path<Uuid>,
    Query(query): Query<ActorQuery>,
) -> HandlerResult<BookingDetail> {
    match state
        .booking_service
        .get_user_booking_by_id(booking_id, query.user_id)
        .await
    {
        Ok(detail) => Ok(Json(ApiResponse::ok("Booking found", detail))),
        Err(err) => Err(reject(err)),
    }
}

pub async fn get_host_booking_requests(
    State(state): State<AppState>,
    Path(lister_id): Path<Uuid>,
) -> HandlerResult<Vec<Booking>> {
    match state
        .booking_service
        .get_host_booking_requests(lister_id)
        .await
    {
        Ok(bookings) => Ok(Json(ApiResponse::ok("Booking requests", bookings))),
        Err(err) => Err(reject(err)),
    }
}

pub async fn get_renter_bookings(
    State(state): State<AppState>,
    Path(renter_id): Path<Uuid>,
) -> HandlerResult<Vec<Booking>> {
    match state.booking_service.get_renter_bookings(renter_id).await {
        Ok(bookings) => Ok(Json(ApiResponse::ok("Bookings", bookings))),
        Err(err) => Err(reject(err)),
    }
}

// ===== Wallet handlers =====

pub async fn get_wallet(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> HandlerResult<Wallet> {
    match state.wallet_service.get_wallet(user_id).await {
        Ok(wallet) => Ok(Json(ApiResponse::ok("Wallet found", wallet))),
        Err(err) => Err(reject(err)),
    }
}

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

pub async fn get_wallet_transactions(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Query(query): Query<PageQuery>,
) -> HandlerResult<Vec<WalletTransaction>> {
    match state
        .wallet_service
        .get_wallet_transactions(user_id, query.page, query.limit)
        .await
    {
        Ok(entries) => Ok(Json(ApiResponse::ok("Wallet transactions", entries))),
        Err(err) => Err(reject(err)),
    }
}

#[derive(Debug, Deserialize)]
pub struct WithdrawalBody {
    pub user_id: Uuid,
    pub amount: Decimal,
    pub payment_method: String,
    #[serde(default)]
    pub details: serde_json::Value,
}

pub async fn request_withdrawal(
    State(state): State<AppState>,
    Json(body): Json<WithdrawalBody>,
) -> HandlerResult<WithdrawalRequest> {
    match state
        .wallet_service
        .request_withdrawal(body.user_id, body.amount, &body.payment_method, body.details)
        .await
    {
        Ok(request) => Ok(Json(ApiResponse::ok("Withdrawal requested", request))),
        Err(err) => Err(reject(err)),
    }
}

#[derive(Debug, Deserialize)]
pub struct ApproveWithdrawalBody {
    pub admin_id: Uuid,
}

pub async fn approve_withdrawal(
    State(state): State<AppState>,
    Path(transaction_id): Path<Uuid>,
    Json(body): Json<ApproveWithdrawalBody>,
) -> HandlerResult<Transaction> {
    match state
        .wallet_service
        .approve_withdrawal(transaction_id, body.admin_id)
        .await
    {
        Ok(transaction) => Ok(Json(ApiResponse::ok("Withdrawal approved", transaction))),
        Err(err) => Err(reject(err)),
    }
}
