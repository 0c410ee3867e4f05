//! Error types for Rally API calls.
//!
//! Raw failures (transport errors, HTTP status codes, WSAPI `Errors` arrays)
//! are classified once, at the HTTP boundary, into an [`ErrorKind`].

use reqwest::StatusCode;

pub type ApiResult<T> = Result<T, ApiError>;

/// Category of an API failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
  /// Target entity does not exist
  NotFound,
  /// API key rejected
  AuthFailed,
  /// Network, timeout, or server-side failure; the only retryable kind
  Transport,
  /// Request rejected by the server (bad field, bad query, ...)
  Validation,
  /// Response body could not be understood
  Decode,
}

/// An error returned by the Rally API layer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ApiError {
  pub kind: ErrorKind,
  pub message: String,
}

impl ApiError {
  pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
    Self {
      kind,
      message: message.into(),
    }
  }

  pub fn not_found(message: impl Into<String>) -> Self {
    Self::new(ErrorKind::NotFound, message)
  }

  pub fn auth(message: impl Into<String>) -> Self {
    Self::new(ErrorKind::AuthFailed, message)
  }

  pub fn transport(message: impl Into<String>) -> Self {
    Self::new(ErrorKind::Transport, message)
  }

  pub fn validation(message: impl Into<String>) -> Self {
    Self::new(ErrorKind::Validation, message)
  }

  pub fn decode(message: impl Into<String>) -> Self {
    Self::new(ErrorKind::Decode, message)
  }

  /// Classify a non-success HTTP response.
  pub fn from_status(status: StatusCode, body: &str) -> Self {
    let detail = if body.trim().is_empty() {
      status.canonical_reason().unwrap_or("no body").to_string()
    } else {
      body.trim().chars().take(300).collect()
    };
    let message = format!("HTTP {}: {}", status.as_u16(), detail);

    match status {
      StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Self::auth(message),
      StatusCode::NOT_FOUND => Self::not_found(message),
      StatusCode::TOO_MANY_REQUESTS => Self::transport(message),
      s if s.is_server_error() => Self::transport(message),
      _ if is_auth_message(&message) => Self::auth(message),
      _ => Self::validation(message),
    }
  }

  pub fn is_retryable(&self) -> bool {
    self.kind == ErrorKind::Transport
  }

  pub fn is_auth(&self) -> bool {
    self.kind == ErrorKind::AuthFailed
  }

  /// Text suitable for a status line.
  pub fn user_message(&self) -> String {
    match self.kind {
      ErrorKind::AuthFailed => "Authentication failed: check your Rally API key".to_string(),
      _ => self.message.clone(),
    }
  }
}

impl From<reqwest::Error> for ApiError {
  fn from(err: reqwest::Error) -> Self {
    if let Some(status) = err.status() {
      return Self::from_status(status, "");
    }
    if err.is_timeout() {
      return Self::transport(format!("Request timed out: {}", err));
    }
    if err.is_decode() {
      return Self::decode(format!("Failed to decode response: {}", err));
    }
    // The text embeds the request URL, so it is never scanned for auth markers
    Self::transport(format!("Request failed: {}", err))
  }
}

impl From<serde_json::Error> for ApiError {
  fn from(err: serde_json::Error) -> Self {
    Self::decode(format!("Failed to parse response: {}", err))
  }
}

/// Whether an error message carries an authentication marker.
///
/// `401` only counts as a whole word, so ids like `US401` or a
/// `start=401` parameter do not match.
pub fn is_auth_message(message: &str) -> bool {
  let lower = message.to_lowercase();
  lower.contains("unauthorized")
    || lower
      .split_whitespace()
      .any(|word| word.trim_matches(|c: char| !c.is_ascii_alphanumeric()) == "401")
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_auth_marker_detection() {
    assert!(is_auth_message("HTTP 401 returned"));
    assert!(is_auth_message("Not Authorized: Unauthorized access"));
    assert!(!is_auth_message("connection reset by peer"));
  }

  #[test]
  fn test_auth_marker_ignores_embedded_digits() {
    assert!(!is_auth_message("error sending request for url (http://x/hierarchicalrequirement?query=(FormattedID = \"US401\"))"));
    assert!(!is_auth_message("GET /defect?start=401&pagesize=200"));
    assert!(!is_auth_message("ObjectID 840123"));
    assert!(is_auth_message("Error: 401 Full authentication is required"));
    assert!(is_auth_message("HTTP status (401)"));
  }

  #[test]
  fn test_from_status_reads_auth_marker_in_body() {
    let err = ApiError::from_status(StatusCode::BAD_REQUEST, "Not Authorized: 401");
    assert_eq!(err.kind, ErrorKind::AuthFailed);
    let err = ApiError::from_status(StatusCode::BAD_REQUEST, "Invalid ObjectID 84012");
    assert_eq!(err.kind, ErrorKind::Validation);
  }

  #[test]
  fn test_from_status_classifies() {
    let cases = [
      (StatusCode::UNAUTHORIZED, ErrorKind::AuthFailed),
      (StatusCode::FORBIDDEN, ErrorKind::AuthFailed),
      (StatusCode::NOT_FOUND, ErrorKind::NotFound),
      (StatusCode::BAD_REQUEST, ErrorKind::Validation),
      (StatusCode::TOO_MANY_REQUESTS, ErrorKind::Transport),
      (StatusCode::BAD_GATEWAY, ErrorKind::Transport),
    ];
    for (status, kind) in cases {
      assert_eq!(ApiError::from_status(status, "").kind, kind, "{}", status);
    }
  }

  #[test]
  fn test_only_transport_is_retryable() {
    assert!(ApiError::transport("timeout").is_retryable());
    assert!(!ApiError::validation("bad field").is_retryable());
    assert!(!ApiError::auth("nope").is_retryable());
  }

  #[test]
  fn test_user_message_for_auth() {
    let err = ApiError::auth("HTTP 401: Unauthorized");
    assert!(err.user_message().contains("Authentication failed"));
    assert_eq!(err.to_string(), "HTTP 401: Unauthorized");
  }
}
