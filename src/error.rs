use hyper::StatusCode;
use std::time::Duration;
use thiserror::Error;

/// Proxy error taxonomy. Every variant maps onto an Anthropic-format error
/// object (`kind`) and an HTTP status (`status`).
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("upstream error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("upstream overloaded: {0}")]
    Overloaded(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("http error: {0}")]
    Http(String),
}

impl Error {
    /// The Anthropic wire error type for this variant.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidRequest(_) | Error::Json(_) => "invalid_request_error",
            Error::Authentication(_) => "authentication_error",
            Error::Permission(_) => "permission_error",
            Error::NotFound(_) => "not_found_error",
            Error::RateLimited(_) => "rate_limit_error",
            Error::Overloaded(_) => "overloaded_error",
            Error::Timeout(_) => "timeout_error",
            Error::Api { .. } | Error::Io(_) | Error::Http(_) => "api_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Error::InvalidRequest(_) | Error::Json(_) => StatusCode::BAD_REQUEST,
            Error::Authentication(_) => StatusCode::UNAUTHORIZED,
            Error::Permission(_) => StatusCode::FORBIDDEN,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            Error::Overloaded(_) => StatusCode::from_u16(529).unwrap_or(StatusCode::BAD_GATEWAY),
            Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::Api { .. } | Error::Io(_) | Error::Http(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

/// Map a downstream HTTP status + body preview to a proxy error.
pub fn map_upstream_status(status: u16, message: &str) -> Error {
    match status {
        400 => Error::InvalidRequest(message.to_string()),
        401 => Error::Authentication(message.to_string()),
        403 => Error::Permission(message.to_string()),
        404 => Error::NotFound(message.to_string()),
        429 => Error::RateLimited(message.to_string()),
        529 => Error::Overloaded(message.to_string()),
        503 if message.contains("overloaded") => Error::Overloaded(message.to_string()),
        _ => Error::Api {
            status,
            message: message.to_string(),
        },
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_strings() {
        assert_eq!(
            Error::InvalidRequest("x".into()).kind(),
            "invalid_request_error"
        );
        assert_eq!(
            Error::Authentication("x".into()).kind(),
            "authentication_error"
        );
        assert_eq!(Error::RateLimited("x".into()).kind(), "rate_limit_error");
        assert_eq!(
            Error::Api {
                status: 500,
                message: "x".into()
            }
            .kind(),
            "api_error"
        );
        assert_eq!(
            Error::Timeout(Duration::from_secs(1)).kind(),
            "timeout_error"
        );
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(Error::InvalidRequest("x".into()).status(), 400);
        assert_eq!(Error::Authentication("x".into()).status(), 401);
        assert_eq!(Error::Permission("x".into()).status(), 403);
        assert_eq!(Error::NotFound("x".into()).status(), 404);
        assert_eq!(Error::RateLimited("x".into()).status(), 429);
        assert_eq!(Error::Overloaded("x".into()).status().as_u16(), 529);
        assert_eq!(Error::Timeout(Duration::from_secs(5)).status(), 504);
        assert_eq!(
            Error::Api {
                status: 500,
                message: "x".into()
            }
            .status(),
            502
        );
    }

    #[test]
    fn test_map_upstream_status() {
        assert!(matches!(
            map_upstream_status(401, "bad key"),
            Error::Authentication(_)
        ));
        assert!(matches!(
            map_upstream_status(404, "no model"),
            Error::NotFound(_)
        ));
        assert!(matches!(
            map_upstream_status(429, "slow down"),
            Error::RateLimited(_)
        ));
        assert!(matches!(
            map_upstream_status(529, "busy"),
            Error::Overloaded(_)
        ));
        assert!(matches!(
            map_upstream_status(503, "server overloaded"),
            Error::Overloaded(_)
        ));
        assert!(matches!(
            map_upstream_status(500, "boom"),
            Error::Api { status: 500, .. }
        ));
    }
}
