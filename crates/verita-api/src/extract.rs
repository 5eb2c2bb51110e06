//! Caller identity
//!
//! Authentication happens at the gateway, which forwards the identity it
//! established in `x-verita-*` headers. A request without a user id is anonymous.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use uuid::Uuid;

use verita_core::models::{Caller, UserCategory};
use verita_core::AppError;

use crate::error::HttpAppError;

pub const USER_ID_HEADER: &str = "x-verita-user-id";
pub const USER_CATEGORY_HEADER: &str = "x-verita-user-category";
pub const EMAIL_HEADER: &str = "x-verita-email";
pub const ROLE_LEVEL_HEADER: &str = "x-verita-role-level";
pub const API_KEY_HEADER: &str = "x-verita-api-key";

#[derive(Debug, Clone)]
pub struct CallerIdentity(pub Caller);

impl CallerIdentity {
    /// Key for per-caller rate limit logs.
    pub fn subject(&self) -> String {
        let caller = &self.0;
        match (caller.user_id, caller.api_key_id) {
            (Some(user_id), _) => format!("user:{}", user_id),
            (None, Some(key_id)) => format!("key:{}", key_id),
            (None, None) => "anonymous".to_string(),
        }
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Result<Option<&'a str>, HttpAppError> {
    match headers.get(name) {
        None => Ok(None),
        Some(value) => value
            .to_str()
            .map(|v| Some(v.trim()).filter(|v| !v.is_empty()))
            .map_err(|_| {
                HttpAppError::from(AppError::BadRequest(format!("{} is not valid text", name)))
            }),
    }
}

fn uuid_header(headers: &HeaderMap, name: &str) -> Result<Option<Uuid>, HttpAppError> {
    header(headers, name)?
        .map(|v| {
            Uuid::parse_str(v).map_err(|_| {
                HttpAppError::from(AppError::BadRequest(format!("{} must be a UUID", name)))
            })
        })
        .transpose()
}

pub fn caller_from_headers(headers: &HeaderMap) -> Result<Caller, HttpAppError> {
    let user_id = uuid_header(headers, USER_ID_HEADER)?;
    let api_key_id = uuid_header(headers, API_KEY_HEADER)?;

    let category = match header(headers, USER_CATEGORY_HEADER)? {
        Some(raw) => raw
            .to_lowercase()
            .parse()
            .map_err(|e: anyhow::Error| AppError::BadRequest(e.to_string()))?,
        None if api_key_id.is_some() => UserCategory::Api,
        None if user_id.is_some() => UserCategory::Registered,
        None => UserCategory::Anonymous,
    };

    let role_level = match header(headers, ROLE_LEVEL_HEADER)? {
        Some(raw) => raw.parse().map_err(|_| {
            AppError::BadRequest(format!("{} must be a number", ROLE_LEVEL_HEADER))
        })?,
        None if user_id.is_some() => 1,
        None => 0,
    };

    Ok(Caller {
        user_id,
        email: header(headers, EMAIL_HEADER)?.map(str::to_lowercase),
        role_level,
        api_key_id,
        category,
    })
}

impl<S> FromRequestParts<S> for CallerIdentity
where
    S: Send + Sync,
{
    type Rejection = HttpAppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        caller_from_headers(&parts.headers).map(CallerIdentity)
    }
}
