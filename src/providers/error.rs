use serde::Deserialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ApiError>;

/// Error code the API returns when a post no longer exists.
pub const CODE_NO_STATUS: i64 = 144;
const CODE_RATE_LIMITED: i64 = 88;
// page does not exist, user not found, suspended, blocked, not authorized
const ACCOUNT_UNAVAILABLE_CODES: [i64; 5] = [34, 50, 63, 136, 179];

#[derive(Debug, Clone, Error)]
pub enum ApiError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("API error (status {status}): {message}")]
    Api {
        status: u16,
        codes: Vec<i64>,
        message: String,
    },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Stream disconnected: {0}")]
    Disconnected(String),
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    errors: Vec<ErrorEntry>,
}

#[derive(Debug, Deserialize)]
struct ErrorEntry {
    code: Option<i64>,
    #[serde(default)]
    message: String,
}

impl ApiError {
    /// Build an error from a non-success HTTP response body. Payloads without
    /// a recognisable `errors[].code` produce an error with no codes.
    pub fn from_body(status: u16, body: &str) -> Self {
        let parsed = serde_json::from_str::<ErrorBody>(body).ok();
        let (codes, message) = match parsed {
            Some(parsed) if !parsed.errors.is_empty() => (
                parsed.errors.iter().filter_map(|e| e.code).collect(),
                parsed
                    .errors
                    .iter()
                    .map(|e| e.message.as_str())
                    .collect::<Vec<_>>()
                    .join("; "),
            ),
            _ => (Vec::new(), body.to_string()),
        };
        ApiError::Api {
            status,
            codes,
            message,
        }
    }

    pub fn codes(&self) -> &[i64] {
        match self {
            ApiError::Api { codes, .. } => codes,
            _ => &[],
        }
    }

    pub fn has_code(&self, code: i64) -> bool {
        self.codes().contains(&code)
    }

    pub fn is_not_found(&self) -> bool {
        self.has_code(CODE_NO_STATUS)
    }

    /// Suspended, protected or deleted account.
    pub fn is_account_unavailable(&self) -> bool {
        match self {
            ApiError::Api { status, codes, .. } => {
                matches!(status, 401 | 403 | 404)
                    || codes.iter().any(|c| ACCOUNT_UNAVAILABLE_CODES.contains(c))
            }
            _ => false,
        }
    }

    /// Worth another attempt: the request never completed or the server failed.
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::Network(_) => true,
            ApiError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        match self {
            ApiError::Api { status, codes, .. } => {
                *status == 429 || codes.contains(&CODE_RATE_LIMITED)
            }
            _ => false,
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        ApiError::Network(err.to_string())
    }
}

impl From<reqwest_oauth1::Error> for ApiError {
    fn from(err: reqwest_oauth1::Error) -> Self {
        ApiError::Network(err.to_string())
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::Parse(err.to_string())
    }
}
