use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde::Serialize;
use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum ShareError {
    #[error("{0}")]
    Validation(String),

    #[error("file size exceeds the {limit} byte limit")]
    PayloadTooLarge { limit: u64 },

    #[error("recipient email does not belong to a registered user")]
    UnknownRecipient,

    #[error("authentication required")]
    Unauthenticated,

    #[error("malformed download token")]
    MalformedToken,

    #[error("no share matches the download token")]
    NotFound,

    #[error("download token has expired")]
    Expired,

    #[error("download token has been revoked")]
    Revoked,

    #[error("caller is not authorized for this share")]
    Forbidden,

    #[error("share not found")]
    UnknownShare,

    #[error("user not found")]
    UnknownUser,

    #[error("ciphertext failed authentication")]
    Integrity,

    #[error("blob {0} is missing for an active share")]
    StorageInconsistency(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("cipher error: {0}")]
    Crypto(#[from] openssl::error::ErrorStack),
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    success: bool,
    error: &'a str,
}

impl ShareError {
    /// Message that is safe to hand to an external caller.
    pub fn public_message(&self) -> String {
        match self {
            ShareError::Validation(msg) => msg.clone(),
            ShareError::PayloadTooLarge { limit } => format!(
                "File size exceeds the {}MB limit.",
                limit / (1024 * 1024)
            ),
            ShareError::UnknownRecipient => {
                "Recipient email does not belong to a registered user.".to_string()
            }
            ShareError::Unauthenticated => "Authentication required. Please log in.".to_string(),
            ShareError::MalformedToken => "Invalid download link format.".to_string(),
            ShareError::NotFound => "Invalid or expired download link.".to_string(),
            ShareError::Expired => "Download link has expired.".to_string(),
            ShareError::Revoked => "Download link is no longer available.".to_string(),
            ShareError::Forbidden => {
                "Access denied. You are not authorized to access this resource.".to_string()
            }
            ShareError::UnknownShare => "File record not found.".to_string(),
            ShareError::UnknownUser => "User not found.".to_string(),
            ShareError::StorageInconsistency(_) => {
                "File unavailable. Please contact support.".to_string()
            }
            ShareError::Integrity
            | ShareError::Io(_)
            | ShareError::Store(_)
            | ShareError::Crypto(_) => "An internal server error occurred.".to_string(),
        }
    }
}

impl ResponseError for ShareError {
    fn status_code(&self) -> StatusCode {
        match self {
            ShareError::Validation(_) | ShareError::MalformedToken => StatusCode::BAD_REQUEST,
            ShareError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ShareError::UnknownRecipient
            | ShareError::NotFound
            | ShareError::UnknownShare
            | ShareError::UnknownUser => StatusCode::NOT_FOUND,
            ShareError::Unauthenticated => StatusCode::UNAUTHORIZED,
            ShareError::Expired | ShareError::Revoked => StatusCode::GONE,
            ShareError::Forbidden => StatusCode::FORBIDDEN,
            ShareError::StorageInconsistency(_) => StatusCode::SERVICE_UNAVAILABLE,
            ShareError::Integrity
            | ShareError::Io(_)
            | ShareError::Store(_)
            | ShareError::Crypto(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let message = self.public_message();
        HttpResponse::build(self.status_code()).json(ErrorBody {
            success: false,
            error: &message,
        })
    }
}
