const MAX_ERROR_BODY_CHARS: usize = 512;

/// Failure classes surfaced by the vendor HTTP clients.
///
/// Carried inside `anyhow::Error`; callers recover the class with
/// `downcast_ref::<ApiError>()`.
#[derive(Debug)]
pub enum ApiError {
    Timeout {
        method: &'static str,
    },
    Forbidden {
        method: &'static str,
        body: String,
    },
    Status {
        method: &'static str,
        status: u16,
        body: String,
    },
}

impl ApiError {
    pub(crate) fn from_status(method: &'static str, status: u16, body: String) -> Self {
        let body = truncate_body(body);
        if status == 403 {
            ApiError::Forbidden { method, body }
        } else {
            ApiError::Status {
                method,
                status,
                body,
            }
        }
    }

    /// HTTP status behind the error, when one was received.
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Timeout { .. } => None,
            ApiError::Forbidden { .. } => Some(403),
            ApiError::Status { status, .. } => Some(*status),
        }
    }

    /// True when `err` is a permission-denied response from either platform.
    pub fn is_forbidden(err: &anyhow::Error) -> bool {
        matches!(err.downcast_ref::<ApiError>(), Some(ApiError::Forbidden { .. }))
    }

    pub(crate) fn has_status(err: &anyhow::Error, status: u16) -> bool {
        err.downcast_ref::<ApiError>()
            .and_then(ApiError::status)
            .is_some_and(|actual| actual == status)
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::Timeout { method } => write!(f, "{method} request timed out"),
            ApiError::Forbidden { method, body } => {
                write!(f, "{method} request was forbidden (status 403): {body}")
            }
            ApiError::Status {
                method,
                status,
                body,
            } => write!(f, "{method} request failed with status {status}: {body}"),
        }
    }
}

impl std::error::Error for ApiError {}

fn truncate_body(body: String) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() <= MAX_ERROR_BODY_CHARS {
        return trimmed.to_owned();
    }
    let mut short: String = trimmed.chars().take(MAX_ERROR_BODY_CHARS).collect();
    short.push_str("...");
    short
}
