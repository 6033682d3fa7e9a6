// =============================================================================
// ERROR MODULE
// =============================================================================
// This module defines the HTTP-facing error type and its responses.
//
// LEARNING NOTES:
// - Domain code returns typed errors (CheckoutError, StoreError); they are
//   turned into HTTP responses only here, at the boundary
// - thiserror derives Display; #[from] derives the conversions
//
// ERROR HANDLING PHILOSOPHY:
// - Shopper mistakes (empty cart, not enough stock) are explained in full:
//   which product, how many are left
// - Infrastructure failures are logged with their cause and answered with a
//   generic "please try again"
// =============================================================================

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::checkout::CheckoutError;
use crate::models::ErrorResponse;

const TRY_AGAIN: &str = "Something went wrong while processing your request. Please try again.";

#[derive(Debug, Error)]
pub enum AppError {
    // -------------------------------------------------------------------------
    // INFRASTRUCTURE ERRORS
    // -------------------------------------------------------------------------
    /// Database query failed
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    // -------------------------------------------------------------------------
    // BUSINESS LOGIC ERRORS
    // -------------------------------------------------------------------------
    /// Checkout refused or failed; the cart reuses the stock variants
    #[error(transparent)]
    Checkout(#[from] CheckoutError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// Account-only operation attempted as a guest
    #[error("User not logged in")]
    Unauthorized,

    // -------------------------------------------------------------------------
    // INTERNAL ERRORS
    // -------------------------------------------------------------------------
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        self.parts().0
    }

    /// Status, machine code, shopper-facing message and optional details.
    fn parts(&self) -> (StatusCode, &'static str, String, Option<String>) {
        match self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone(), None),

            AppError::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone(), None)
            }

            AppError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "UNAUTHORIZED",
                self.to_string(),
                None,
            ),

            AppError::Checkout(err) => checkout_parts(err),

            // 500s: don't expose internal details
            AppError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "DATABASE_ERROR",
                TRY_AGAIN.to_string(),
                None,
            ),

            AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                TRY_AGAIN.to_string(),
                None,
            ),
        }
    }
}

fn checkout_parts(err: &CheckoutError) -> (StatusCode, &'static str, String, Option<String>) {
    match err {
        CheckoutError::EmptyCart => (StatusCode::BAD_REQUEST, "EMPTY_CART", err.to_string(), None),

        CheckoutError::InvalidQuantity { product_id, .. } => (
            StatusCode::BAD_REQUEST,
            "INVALID_QUANTITY",
            err.to_string(),
            Some(format!("product_id={}", product_id)),
        ),

        CheckoutError::ProductUnavailable { product_id } => (
            StatusCode::NOT_FOUND,
            "PRODUCT_UNAVAILABLE",
            err.to_string(),
            Some(format!("product_id={}", product_id)),
        ),

        CheckoutError::OutOfStock { product_id, .. } => (
            StatusCode::CONFLICT,
            "OUT_OF_STOCK",
            err.to_string(),
            Some(format!("product_id={}", product_id)),
        ),

        CheckoutError::InsufficientStock {
            product_id,
            available,
            ..
        } => (
            StatusCode::CONFLICT,
            "INSUFFICIENT_STOCK",
            err.to_string(),
            Some(format!("product_id={}, available={}", product_id, available)),
        ),

        CheckoutError::Persistence(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "CHECKOUT_FAILED",
            TRY_AGAIN.to_string(),
            None,
        ),
    }
}

// =============================================================================
// HTTP RESPONSE CONVERSION
// =============================================================================
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code, message, details) = self.parts();

        // Server-side failures keep their cause in the logs only
        if status.is_server_error() {
            tracing::error!(error_code, cause = %self, "Request failed");
        } else {
            tracing::warn!(error_code, message = %message, "Request rejected");
        }

        let body = match details {
            Some(details) => ErrorResponse::with_details(error_code, message, details),
            None => ErrorResponse::new(error_code, message),
        };

        (status, Json(body)).into_response()
    }
}

/// A convenient alias for Results that use our error type.
pub type AppResult<T> = Result<T, AppError>;

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}
