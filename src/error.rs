use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use log::error;
use serde_json::json;

use crate::models::{BookingId, BookingStatus};

pub type Result<T> = std::result::Result<T, BookingError>;

#[derive(Debug, thiserror::Error)]
pub enum BookingError {
    #[error("{0}")]
    Validation(String),

    #[error("This pandit is already booked for the selected date. Please choose another date or another pandit.")]
    Conflict { existing_booking_id: BookingId },

    #[error("Customer not registered. Please sign up first.")]
    NotRegistered,

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("This pandit is currently not available for bookings")]
    ProviderUnavailable,

    #[error("Invalid status `{0}`. Must be one of: {valid}", valid = BookingStatus::valid_values())]
    InvalidStatus(String),

    #[error("Cannot move a booking from {from} to {to}")]
    InvalidTransition {
        from: BookingStatus,
        to: BookingStatus,
    },

    #[error("Email or phone already registered")]
    AlreadyRegistered,

    #[error("storage failure: {0}")]
    Storage(#[from] sqlx::Error),
}

impl BookingError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            BookingError::Validation(_)
            | BookingError::NotRegistered
            | BookingError::ProviderUnavailable
            | BookingError::InvalidStatus(_)
            | BookingError::AlreadyRegistered => StatusCode::BAD_REQUEST,
            BookingError::NotFound(_) => StatusCode::NOT_FOUND,
            BookingError::Conflict { .. } | BookingError::InvalidTransition { .. } => {
                StatusCode::CONFLICT
            }
            BookingError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for BookingError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = match &self {
            BookingError::Conflict { existing_booking_id } => json!({
                "success": false,
                "message": self.to_string(),
                "conflict": true,
                "existing_booking_id": existing_booking_id,
            }),
            BookingError::Storage(e) => {
                error!("Request failed on storage: {}", e);
                json!({
                    "success": false,
                    "message": "Internal server error",
                })
            }
            _ => json!({
                "success": false,
                "message": self.to_string(),
            }),
        };
        (status, Json(body)).into_response()
    }
}
