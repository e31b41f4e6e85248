//! Authentication header helpers for wiring vendor credentials into the
//! underlying `reqwest` client builders.

use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};

/// Header the target platform reads to act on behalf of another user.
pub const AS_USER_HEADER: &str = "As-User";

/// `Authorization: Token <token>` as expected by the source listing API.
pub(crate) fn token_headers(token: &str) -> Result<HeaderMap> {
    authorization_headers("Token", token)
}

/// `Authorization: Bearer <token>` as expected by the target storage API.
pub(crate) fn bearer_headers(token: &str) -> Result<HeaderMap> {
    authorization_headers("Bearer", token)
}

/// Header pair that scopes a target request to the given user.
pub(crate) fn as_user_header(user_id: &str) -> Result<(HeaderName, HeaderValue)> {
    let value = HeaderValue::from_str(user_id)
        .with_context(|| format!("invalid user id {user_id:?} for {AS_USER_HEADER} header"))?;
    Ok((HeaderName::from_static("as-user"), value))
}

fn authorization_headers(scheme: &str, token: &str) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    let mut value = HeaderValue::from_str(&format!("{scheme} {}", token.trim()))
        .context("failed to build Authorization header")?;
    value.set_sensitive(true);
    headers.insert(AUTHORIZATION, value);
    Ok(headers)
}
