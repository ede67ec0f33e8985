//! Caller identity as asserted by the session layer in front of this service.

use actix_web::dev::Payload;
use actix_web::http::HeaderMap;
use actix_web::{FromRequest, HttpRequest};
use futures::future::{ready, Ready};

use crate::error::ShareError;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_EMAIL_HEADER: &str = "x-user-email";
pub const USER_ROLE_HEADER: &str = "x-user-role";

const ADMIN_ROLE: &str = "admin";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub id: String,
    pub email: String,
    pub role: String,
}

impl Caller {
    pub fn is_admin(&self) -> bool {
        self.role == ADMIN_ROLE
    }

    fn from_headers(headers: &HeaderMap) -> Option<Caller> {
        let read = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        Some(Caller {
            id: read(USER_ID_HEADER)?,
            email: read(USER_EMAIL_HEADER)?,
            role: read(USER_ROLE_HEADER)
                .map(|r| r.to_lowercase())
                .unwrap_or_else(|| "user".to_string()),
        })
    }
}

impl FromRequest for Caller {
    type Error = ShareError;
    type Future = Ready<Result<Self, Self::Error>>;
    type Config = ();

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        ready(Caller::from_headers(req.headers()).ok_or(ShareError::Unauthenticated))
    }
}

/// Best guess at the originating client address, for the activity log.
pub fn client_ip(req: &HttpRequest) -> String {
    let headers = req.headers();
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    if let Some(first) = header("x-forwarded-for")
        .and_then(|xff| xff.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
    {
        return first.to_string();
    }

    for name in &["x-real-ip", "cf-connecting-ip", "true-client-ip"] {
        if let Some(ip) = header(name) {
            return ip.to_string();
        }
    }

    if let Some(ip) = header("forwarded").and_then(forwarded_for) {
        return ip;
    }

    req.peer_addr()
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Extracts `for=` from an RFC 7239 `Forwarded` header.
fn forwarded_for(value: &str) -> Option<String> {
    value
        .split(|c| c == ';' || c == ',')
        .map(str::trim)
        .find_map(|pair| {
            let (key, ip) = pair.split_at(pair.find('=')?);
            if key.trim().eq_ignore_ascii_case("for") {
                Some(ip[1..].trim().trim_matches('"').to_string())
            } else {
                None
            }
        })
        .filter(|ip| !ip.is_empty())
}
