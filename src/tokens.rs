use chrono::{Duration, NaiveDateTime, Utc};
use sodiumoxide::randombytes::randombytes_into;

use crate::error::ShareError;
use crate::models::ShareRecord;

/// 256 bits of entropy per token.
pub const TOKEN_BYTES: usize = 32;
pub const TOKEN_LEN: usize = TOKEN_BYTES * 2;

const LOG_PREFIX_LEN: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: NaiveDateTime,
}

#[derive(Debug, Clone)]
pub struct TokenIssuer {
    lifetime: Duration,
}

impl TokenIssuer {
    pub fn new(lifetime: Duration) -> Self {
        TokenIssuer { lifetime }
    }

    pub fn lifetime_hours(&self) -> i64 {
        self.lifetime.num_hours()
    }

    pub fn issue_at(&self, issued_at: NaiveDateTime) -> IssuedToken {
        IssuedToken {
            token: generate_token(),
            expires_at: issued_at + self.lifetime,
        }
    }
}

pub fn now() -> NaiveDateTime {
    Utc::now().naive_utc()
}

pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    randombytes_into(&mut bytes);
    hex::encode(bytes)
}

/// Exactly `TOKEN_LEN` lowercase hex characters. Checked before any lookup.
pub fn is_well_formed(token: &str) -> bool {
    token.len() == TOKEN_LEN
        && token
            .bytes()
            .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Token shortened for log lines.
pub fn log_prefix(token: &str) -> String {
    let prefix: String = token.chars().take(LOG_PREFIX_LEN).collect();
    format!("{}...", prefix)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Authorized,
    Expired,
    Revoked,
    Forbidden,
}

impl Access {
    pub fn into_result(self) -> Result<(), ShareError> {
        match self {
            Access::Authorized => Ok(()),
            Access::Expired => Err(ShareError::Expired),
            Access::Revoked => Err(ShareError::Revoked),
            Access::Forbidden => Err(ShareError::Forbidden),
        }
    }
}

/// Identity is checked first, so a caller who is not the recipient learns
/// nothing about whether the share is still live.
pub fn check_access(record: &ShareRecord, caller_email: &str, at: NaiveDateTime) -> Access {
    if record.recipient_email != caller_email {
        return Access::Forbidden;
    }
    if record.download_token.is_none() {
        return Access::Revoked;
    }
    match record.token_expires_at {
        Some(expires_at) if expires_at < at => Access::Expired,
        _ => Access::Authorized,
    }
}
