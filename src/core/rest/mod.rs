//! Signed REST client.

use std::time::Duration;

use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use crate::app::Credentials;
use crate::error::{Error, ErrorKind, Result};
use crate::time::skewed_expires;

use crate::core::transport::auth::sign;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(8);
const ERROR_BODY_TRUNCATE_BYTES: usize = 2048;

#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub auth: bool,
    pub body: Option<Value>,
    pub query: Vec<(String, String)>,
    pub timeout: Option<Duration>,
}

pub struct RestClient {
    http: Client,
    base_url: String,
    credentials: Option<Credentials>,
    auth_expires_skew_sec: i64,
    truncate_error_bodies: bool,
}

impl RestClient {
    pub fn new(base_url: impl Into<String>, credentials: Option<Credentials>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into(),
            credentials,
            auth_expires_skew_sec: 60,
            truncate_error_bodies: true,
        }
    }

    pub fn with_auth_expires_skew_sec(mut self, skew: i64) -> Self {
        self.auth_expires_skew_sec = skew;
        self
    }

    pub fn with_error_body_truncation(mut self, truncate: bool) -> Self {
        self.truncate_error_bodies = truncate;
        self
    }

    /// Issues one request, applying signing when requested and mapping the
    /// response to a classified error. Without credentials, an auth request
    /// fails locally before any network call.
    pub async fn request(&self, method: Method, path: &str, opts: RequestOptions) -> Result<Value> {
        if opts.auth && self.credentials.is_none() {
            return Err(Error::new(
                ErrorKind::Auth,
                "authenticated request issued without credentials",
            ));
        }

        let path_with_query = path_with_query(path, &opts.query)?;
        let url = format!("{}{}", self.base_url, path_with_query);
        let body_json = opts
            .body
            .as_ref()
            .map(|b| b.to_string())
            .unwrap_or_default();

        let mut builder = self
            .http
            .request(method.clone(), &url)
            .timeout(opts.timeout.unwrap_or(DEFAULT_TIMEOUT))
            .header("accept", "application/json");

        if opts.body.is_some() {
            builder = builder.header("content-type", "application/json").body(body_json.clone());
        }

        if opts.auth {
            let creds = self.credentials.as_ref().expect("checked above");
            let expires = skewed_expires(self.auth_expires_skew_sec);
            let payload = format!("{}{}{}{}", method.as_str(), path_with_query, expires, body_json);
            let signature = sign(&creds.api_secret, &payload);
            builder = builder
                .header("api-key", &creds.api_key)
                .header("api-expires", expires.to_string())
                .header("api-signature", signature);
        }

        let response = builder.send().await.map_err(map_transport_error)?;
        let status = response.status();

        if status.is_success() {
            let bytes = response.bytes().await.map_err(map_transport_error)?;
            return match serde_json::from_slice::<Value>(&bytes) {
                Ok(value) => Ok(value),
                Err(e) => {
                    warn!(error = %e, "response body did not parse as JSON");
                    Ok(Value::Null)
                }
            };
        }

        let retry_after_ms = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after_ms);

        let body_text = response.text().await.unwrap_or_default();
        let message = self.extract_error_message(&body_text);

        let error = self.classify_status(status, message);
        Err(match retry_after_ms {
            Some(ms) => error.with_retry_after_ms(ms),
            None => error,
        })
    }

    fn classify_status(&self, status: StatusCode, message: String) -> Error {
        let kind = match status.as_u16() {
            400 => ErrorKind::Validation,
            401 | 403 => ErrorKind::Auth,
            409 => ErrorKind::OrderRejected,
            429 => ErrorKind::RateLimit,
            500..=599 => ErrorKind::ExchangeDown,
            _ => ErrorKind::Unknown,
        };
        Error::new(kind, message).with_status(status.as_u16())
    }

    fn extract_error_message(&self, body: &str) -> String {
        let parsed: Option<Value> = serde_json::from_str(body).ok();
        let message = parsed
            .as_ref()
            .and_then(|v| v.get("error"))
            .and_then(|e| e.get("message"))
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| body.to_string());

        if !self.truncate_error_bodies && message.len() > ERROR_BODY_TRUNCATE_BYTES {
            debug!(len = message.len(), "error body exceeds truncation length but truncation disabled");
        }
        if self.truncate_error_bodies && message.len() > ERROR_BODY_TRUNCATE_BYTES {
            message.chars().take(ERROR_BODY_TRUNCATE_BYTES).collect()
        } else {
            message
        }
    }
}

fn map_transport_error(e: reqwest::Error) -> Error {
    if e.is_timeout() || e.is_connect() {
        Error::new(ErrorKind::Network, e.to_string()).with_cause(e)
    } else {
        Error::new(ErrorKind::Unknown, e.to_string()).with_cause(e)
    }
}

/// Builds the request-line path-plus-query BitMEX signs over: the path is
/// joined against a throwaway base so `Url` can own percent-encoding, then
/// split back out since signing covers only the path and query, never the
/// scheme or host.
fn path_with_query(path: &str, query: &[(String, String)]) -> Result<String> {
    if query.is_empty() {
        return Ok(path.to_string());
    }
    let mut url = Url::parse(&format!("http://rest.invalid{path}"))?;
    url.query_pairs_mut().extend_pairs(query);
    let mut out = url.path().to_string();
    if let Some(q) = url.query() {
        out.push('?');
        out.push_str(q);
    }
    Ok(out)
}

/// Parses a `Retry-After` header as either whole seconds or an HTTP-date
/// (RFC 1123 format, e.g. `Sun, 06 Nov 1994 08:49:37 GMT`).
fn parse_retry_after_ms(value: &str) -> Option<u64> {
    if let Ok(secs) = value.trim().parse::<u64>() {
        return Some(secs * 1000);
    }
    let target = chrono::DateTime::parse_from_rfc2822(value.trim()).ok()?;
    let now = chrono::Utc::now();
    let delta = target.with_timezone(&chrono::Utc) - now;
    delta.num_milliseconds().try_into().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_with_query_encodes_spaces_and_colons() {
        let out = path_with_query("/instrument/active", &[("filter".into(), "a b:c".into())]).unwrap();
        assert_eq!(out, "/instrument/active?filter=a+b%3Ac");
    }

    #[test]
    fn path_with_query_encodes_reserved_characters() {
        let out = path_with_query("/order", &[("filter".into(), "a&b=c#d".into())]).unwrap();
        assert_eq!(out, "/order?filter=a%26b%3Dc%23d");
    }

    #[test]
    fn path_without_query_is_unchanged() {
        assert_eq!(path_with_query("/order", &[]).unwrap(), "/order");
    }

    #[test]
    fn retry_after_parses_whole_seconds() {
        assert_eq!(parse_retry_after_ms("5"), Some(5000));
    }
}
