//! Classified error taxonomy for the transport, REST client and engines.
//!
//! Every fault the crate can surface is mapped into one [`ErrorKind`]. The
//! kind drives retry policy independently of whatever underlying library
//! produced the fault.

use std::fmt;

use thiserror::Error;

/// Coarse classification used by callers (and by the crate's own retry
/// policies) to decide whether a fault is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Local invariant violation, or HTTP 400.
    Validation,
    /// HTTP 401/403, or an auth response denied without a recognizable
    /// credential/clock-skew pattern.
    Auth,
    /// The auth request's deadline fired before a response arrived.
    AuthTimeout,
    /// Auth failure matched a bad-credentials text pattern. Disables
    /// auto-relogin until credentials are replaced.
    BadCredentials,
    /// Auth failure matched a clock-skew text pattern. Disables
    /// auto-relogin until the skew configuration is adjusted.
    ClockSkew,
    /// HTTP 429. Carries a `retry_after_ms` hint when available.
    RateLimit,
    /// HTTP 409: the exchange rejected the order itself.
    OrderRejected,
    /// HTTP 5xx, or a WS close code indicating the exchange is unhealthy.
    ExchangeDown,
    /// Local network fault: connect/send failure, abort, timeout.
    Network,
    /// Unmapped cause.
    Unknown,
}

impl ErrorKind {
    /// Whether a caller issuing a single request may retry on this kind.
    pub fn retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::AuthTimeout
                | ErrorKind::RateLimit
                | ErrorKind::ExchangeDown
                | ErrorKind::Network
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Auth => "auth",
            ErrorKind::AuthTimeout => "auth_timeout",
            ErrorKind::BadCredentials => "bad_credentials",
            ErrorKind::ClockSkew => "clock_skew",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::OrderRejected => "order_rejected",
            ErrorKind::ExchangeDown => "exchange_down",
            ErrorKind::Network => "network",
            ErrorKind::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// A classified error with an optional HTTP status, an optional
/// `Retry-After` hint (rate limit only), and a message carrying whatever
/// detail the origin (server body, library error) provided.
#[derive(Error, Debug)]
#[error("{kind}: {message}")]
pub struct Error {
    pub kind: ErrorKind,
    pub message: String,
    pub http_status: Option<u16>,
    pub retry_after_ms: Option<u64>,
    #[source]
    pub cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            http_status: None,
            retry_after_ms: None,
            cause: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    pub fn with_retry_after_ms(mut self, ms: u64) -> Self {
        self.retry_after_ms = Some(ms);
        self
    }

    pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn retryable(&self) -> bool {
        self.kind.retryable()
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::new(ErrorKind::Network, e.to_string()).with_cause(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::new(ErrorKind::Unknown, e.to_string()).with_cause(e)
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        let kind = if e.is_timeout() || e.is_connect() {
            ErrorKind::Network
        } else {
            ErrorKind::Unknown
        };
        Error::new(kind, e.to_string()).with_cause(e)
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::new(ErrorKind::Validation, e.to_string()).with_cause(e)
    }
}

/// Maps a WebSocket close code to the fault it represents.
///
/// `1000` is a terminal, non-erroring close: the transport must not
/// reconnect. Every other code (`1006`, `1011`, vendor-specific, ...) is
/// treated as abnormal and classified `ExchangeDown` so the transport's
/// reconnect loop picks it up.
pub fn classify_close_code(code: u16) -> Option<Error> {
    if code == 1000 {
        return None;
    }
    Some(Error::new(
        ErrorKind::ExchangeDown,
        format!("abnormal close code {code}"),
    ))
}

/// Classifies a textual auth-denial message from the server into a handful
/// of recognized pattern families.
pub fn classify_auth_failure(message: &str) -> ErrorKind {
    let lower = message.to_ascii_lowercase();
    const BAD_CREDENTIALS: &[&str] = &[
        "signature not valid",
        "invalid api key",
        "invalid api secret",
        "unauthorized",
        "forbidden",
        "permission denied",
        "bad credentials",
    ];
    const CLOCK_SKEW: &[&str] = &[
        "timestamp",
        "expired",
        "too far in the future",
        "too far in the past",
        "clock skew",
    ];
    if BAD_CREDENTIALS.iter().any(|p| lower.contains(p)) {
        ErrorKind::BadCredentials
    } else if CLOCK_SKEW.iter().any(|p| lower.contains(p)) {
        ErrorKind::ClockSkew
    } else {
        ErrorKind::Auth
    }
}

pub type Result<T> = std::result::Result<T, Error>;
