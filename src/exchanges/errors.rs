// =============================================================================
// Normalized exchange error taxonomy
// =============================================================================
//
// Every venue speaks its own dialect of failure. Raw errors are classified
// into one normalized kind as early as possible; the execution engine and the
// API layer only ever see the normalized form.
// =============================================================================

use serde::{Deserialize, Serialize};

/// Venue-independent error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeErrorKind {
    /// Connection resets, timeouts, 5xx. Retried with backoff.
    TransientNetwork,
    /// 429 or venue-specific throttle codes. Retried after a delay.
    RateLimited,
    /// Bad or missing API credentials. Terminal at the adapter.
    Auth,
    InsufficientBalance,
    NotionalTooSmall,
    Precision,
    InvalidSymbol,
    MissingCredentials,
    ConnectionFailed,
    /// Rate out of bounds, crossed book, stale timestamp. Record dropped.
    DataValidation,
    Internal,
    Unknown,
}

impl ExchangeErrorKind {
    /// Whether the retry wrapper should attempt the operation again.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientNetwork | Self::RateLimited)
    }

    /// Operator-facing message for the API layer.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::TransientNetwork => "Temporary network problem talking to the exchange",
            Self::RateLimited => "Exchange rate limit hit; the request was throttled",
            Self::Auth => "Exchange rejected the API credentials",
            Self::InsufficientBalance => "Insufficient balance on the exchange",
            Self::NotionalTooSmall => "Order notional below the exchange minimum",
            Self::Precision => "Order size or price precision rejected by the exchange",
            Self::InvalidSymbol => "Symbol is not tradable on this exchange",
            Self::MissingCredentials => "No credentials configured for this exchange",
            Self::ConnectionFailed => "Could not connect to the exchange",
            Self::DataValidation => "Exchange data failed validation and was dropped",
            Self::Internal => "Internal error",
            Self::Unknown => "Unclassified exchange error",
        }
    }
}

impl std::fmt::Display for ExchangeErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::TransientNetwork => "transient_network",
            Self::RateLimited => "rate_limited",
            Self::Auth => "auth",
            Self::InsufficientBalance => "insufficient_balance",
            Self::NotionalTooSmall => "notional_too_small",
            Self::Precision => "precision",
            Self::InvalidSymbol => "invalid_symbol",
            Self::MissingCredentials => "missing_credentials",
            Self::ConnectionFailed => "connection_failed",
            Self::DataValidation => "data_validation",
            Self::Internal => "internal",
            Self::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// A classified failure from one venue.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
#[error("{venue}: {kind}: {message}")]
pub struct ExchangeError {
    pub kind: ExchangeErrorKind,
    pub venue: String,
    pub message: String,
}

impl ExchangeError {
    pub fn new(kind: ExchangeErrorKind, venue: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            venue: venue.into(),
            message: message.into(),
        }
    }

    pub fn transient(venue: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ExchangeErrorKind::TransientNetwork, venue, message)
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }

    /// Classify a reqwest failure: timeouts and connection errors are
    /// transient, everything else is unknown.
    pub fn from_http(venue: &str, err: &reqwest::Error) -> Self {
        let kind = if err.is_timeout() || err.is_connect() || err.is_request() {
            ExchangeErrorKind::TransientNetwork
        } else {
            ExchangeErrorKind::Unknown
        };
        Self::new(kind, venue, err.to_string())
    }

    /// Classify an HTTP status + body using the venue's error-code table.
    pub fn from_status(
        venue: &str,
        status: reqwest::StatusCode,
        body: &serde_json::Value,
        code_table: &[(&str, ExchangeErrorKind)],
    ) -> Self {
        let body_code = body
            .get("code")
            .map(|c| c.to_string().trim_matches('"').to_string())
            .or_else(|| {
                body.get("retCode")
                    .map(|c| c.to_string().trim_matches('"').to_string())
            })
            .unwrap_or_default();

        let kind = if status.as_u16() == 429 {
            ExchangeErrorKind::RateLimited
        } else if status.as_u16() == 401 || status.as_u16() == 403 {
            ExchangeErrorKind::Auth
        } else if status.is_server_error() {
            ExchangeErrorKind::TransientNetwork
        } else {
            code_table
                .iter()
                .find(|(code, _)| *code == body_code)
                .map(|(_, kind)| *kind)
                .unwrap_or(ExchangeErrorKind::Unknown)
        };

        Self::new(kind, venue, format!("HTTP {status}: {body}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_kinds() {
        assert!(ExchangeErrorKind::TransientNetwork.is_transient());
        assert!(ExchangeErrorKind::RateLimited.is_transient());
        assert!(!ExchangeErrorKind::Auth.is_transient());
        assert!(!ExchangeErrorKind::InsufficientBalance.is_transient());
    }

    #[test]
    fn status_classification_prefers_http_semantics() {
        let body = serde_json::json!({});
        let err = ExchangeError::from_status(
            "binance_futures",
            reqwest::StatusCode::TOO_MANY_REQUESTS,
            &body,
            &[],
        );
        assert_eq!(err.kind, ExchangeErrorKind::RateLimited);

        let err = ExchangeError::from_status(
            "binance_futures",
            reqwest::StatusCode::UNAUTHORIZED,
            &body,
            &[],
        );
        assert_eq!(err.kind, ExchangeErrorKind::Auth);

        let err = ExchangeError::from_status(
            "binance_futures",
            reqwest::StatusCode::BAD_GATEWAY,
            &body,
            &[],
        );
        assert_eq!(err.kind, ExchangeErrorKind::TransientNetwork);
    }

    #[test]
    fn status_classification_falls_back_to_code_table() {
        let table: &[(&str, ExchangeErrorKind)] =
            &[("-2019", ExchangeErrorKind::InsufficientBalance)];
        let body = serde_json::json!({"code": -2019, "msg": "Margin is insufficient."});
        let err = ExchangeError::from_status(
            "binance_futures",
            reqwest::StatusCode::BAD_REQUEST,
            &body,
            table,
        );
        assert_eq!(err.kind, ExchangeErrorKind::InsufficientBalance);
    }

    #[test]
    fn unknown_code_maps_to_unknown() {
        let body = serde_json::json!({"code": -9999});
        let err =
            ExchangeError::from_status("binance_futures", reqwest::StatusCode::BAD_REQUEST, &body, &[]);
        assert_eq!(err.kind, ExchangeErrorKind::Unknown);
    }
}
