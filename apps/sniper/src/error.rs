use serde::Serialize;

/// The upstream API error taxonomy (spec.md §4.A, §7). Every non-2xx response
/// is classified into one of these before it reaches the Coordinator's state
/// machine — raw HTTP errors never escape `api_client`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiErrorKind {
    /// HTTP 500 with an empty or `{}` body — the anti-bot edge.
    WafBlocked,
    /// HTTP 500 with a non-empty JSON body.
    ServerError,
    /// HTTP 412.
    SoldOut,
    /// HTTP 429.
    RateLimited,
    /// HTTP 401/403/419.
    AuthFailed,
    /// `getDetails` succeeded but omitted a book token.
    NoBookToken,
    /// The ISP proxy pool had nothing to offer within the acquire timeout.
    NoProxyAvailable,
    /// `tryClaimSlot` lost the race; not really an error, just a signal to
    /// advance to the next slot.
    AlreadyClaimed,
    Unknown,
}

/// A classified upstream API error, carrying enough of the raw response to
/// log and to decide WAF vs. server-error.
#[derive(Debug, Clone)]
pub struct ApiError {
    pub kind: ApiErrorKind,
    pub status: u16,
    pub code: Option<String>,
    pub raw_body: String,
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} (status {})", self.kind, self.status)
    }
}

impl std::error::Error for ApiError {}

impl ApiError {
    /// spec.md §4.A classification table.
    pub fn classify(status: u16, code: Option<String>, raw_body: String) -> Self {
        let body_is_empty = raw_body.trim().is_empty() || raw_body.trim() == "{}";
        let kind = match status {
            500 if body_is_empty => ApiErrorKind::WafBlocked,
            500 => ApiErrorKind::ServerError,
            412 => ApiErrorKind::SoldOut,
            429 => ApiErrorKind::RateLimited,
            401 | 403 | 419 => ApiErrorKind::AuthFailed,
            _ => ApiErrorKind::Unknown,
        };
        Self {
            kind,
            status,
            code,
            raw_body,
        }
    }
}

/// Fatal/startup errors (spec.md §7: "missing required configuration at
/// startup, failure to bootstrap the Store"). Propagated with `?` up to
/// `main`, which maps them to exit code 1.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("missing or invalid configuration: {0}")]
    Config(String),
    #[error("failed to bootstrap store: {0}")]
    StoreBootstrap(#[from] sqlx::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_waf_block_on_empty_500() {
        let e = ApiError::classify(500, None, String::new());
        assert_eq!(e.kind, ApiErrorKind::WafBlocked);
        let e = ApiError::classify(500, None, "{}".to_string());
        assert_eq!(e.kind, ApiErrorKind::WafBlocked);
    }

    #[test]
    fn classifies_server_error_on_nonempty_500() {
        let e = ApiError::classify(500, None, r#"{"message":"boom"}"#.to_string());
        assert_eq!(e.kind, ApiErrorKind::ServerError);
    }

    #[test]
    fn classifies_sold_out_rate_limited_auth() {
        assert_eq!(ApiError::classify(412, None, String::new()).kind, ApiErrorKind::SoldOut);
        assert_eq!(ApiError::classify(429, None, String::new()).kind, ApiErrorKind::RateLimited);
        assert_eq!(ApiError::classify(401, None, String::new()).kind, ApiErrorKind::AuthFailed);
        assert_eq!(ApiError::classify(403, None, String::new()).kind, ApiErrorKind::AuthFailed);
        assert_eq!(ApiError::classify(419, None, String::new()).kind, ApiErrorKind::AuthFailed);
    }

    #[test]
    fn classifies_everything_else_unknown() {
        assert_eq!(ApiError::classify(418, None, String::new()).kind, ApiErrorKind::Unknown);
    }
}
