//! Shared constants for structured API errors.
//!
//! Anthropic-style envelopes carry a string `type`, OpenAI-style envelopes a
//! numeric `code` derived from the HTTP status.

use std::fmt;

pub const ERROR_TYPE_API: &str = "api_error";
pub const ERROR_TYPE_INVALID_REQUEST: &str = "invalid_request_error";
pub const ERROR_TYPE_AUTHENTICATION: &str = "authentication_error";
pub const ERROR_TYPE_INSUFFICIENT_QUOTA: &str = "insufficient_quota";
pub const ERROR_TYPE_NOT_FOUND: &str = "not_found_error";

/// Suffix appended to `status * 1000` in OpenAI-style error codes (401 -> 401001).
pub const OPENAI_ERROR_CODE_SUFFIX: u32 = 1;

pub const LOG_MESSAGE_INSUFFICIENT_QUOTA: &str = "Insufficient quota";
pub const LOG_MESSAGE_NO_CONFIG: &str = "No configuration available";

/// Broad classification of a gateway failure, used to pick envelope fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidRequest,
    Authentication,
    InsufficientQuota,
    NotFound,
    Api,
}

impl ErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidRequest => ERROR_TYPE_INVALID_REQUEST,
            Self::Authentication => ERROR_TYPE_AUTHENTICATION,
            Self::InsufficientQuota => ERROR_TYPE_INSUFFICIENT_QUOTA,
            Self::NotFound => ERROR_TYPE_NOT_FOUND,
            Self::Api => ERROR_TYPE_API,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// OpenAI-style numeric error code for an HTTP status.
pub const fn openai_error_code(status: u16) -> u32 {
    status as u32 * 1000 + OPENAI_ERROR_CODE_SUFFIX
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_strings() {
        assert_eq!(ErrorKind::Authentication.as_str(), "authentication_error");
        assert_eq!(ErrorKind::InsufficientQuota.to_string(), "insufficient_quota");
        assert_eq!(ErrorKind::NotFound.as_str(), "not_found_error");
    }

    #[test]
    fn test_openai_error_code() {
        assert_eq!(openai_error_code(401), 401001);
        assert_eq!(openai_error_code(402), 402001);
        assert_eq!(openai_error_code(500), 500001);
    }
}
