//! HTTP client for the dbvault API
//!
//! Wraps reqwest with the bearer token and maps failures onto the CLI's
//! exit-code taxonomy: validation errors from the API are usage errors (2),
//! auth rejections are 3, an unreachable API is 4.

use serde_json::Value;

/// CLI exit codes beyond success/failure.
pub const EXIT_USAGE: u8 = 2;
pub const EXIT_AUTH: u8 = 3;
pub const EXIT_UPSTREAM: u8 = 4;
pub const EXIT_PARTIAL: u8 = 5;

#[derive(Debug)]
pub enum ApiError {
    /// The API could not be reached at all.
    Unreachable(String),
    /// 401/403 from the API.
    Auth(String),
    /// Any other API-level error, with the wire code and message.
    Api { status: u16, message: String },
    Other(String),
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::Unreachable(msg) => write!(f, "API unreachable: {}", msg),
            ApiError::Auth(msg) => write!(f, "authentication failed: {}", msg),
            ApiError::Api { status, message } => write!(f, "API error ({}): {}", status, message),
            ApiError::Other(msg) => f.write_str(msg),
        }
    }
}

impl std::error::Error for ApiError {}

impl ApiError {
    pub fn exit_code(&self) -> u8 {
        match self {
            ApiError::Unreachable(_) => EXIT_UPSTREAM,
            ApiError::Auth(_) => EXIT_AUTH,
            ApiError::Api { status, .. } if *status < 500 => EXIT_USAGE,
            _ => 1,
        }
    }
}

pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl ApiClient {
    pub fn new(base_url: String, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    async fn execute(&self, builder: reqwest::RequestBuilder) -> Result<Value, ApiError> {
        let response = builder.send().await.map_err(|e| {
            if e.is_connect() || e.is_timeout() {
                ApiError::Unreachable(e.to_string())
            } else {
                ApiError::Other(e.to_string())
            }
        })?;

        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);

        if status.is_success() {
            return Ok(body);
        }
        let message = body["message"]
            .as_str()
            .unwrap_or(status.canonical_reason().unwrap_or("request failed"))
            .to_string();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(ApiError::Auth(message));
        }
        Err(ApiError::Api {
            status: status.as_u16(),
            message,
        })
    }

    pub async fn get(&self, path: &str) -> Result<Value, ApiError> {
        self.execute(self.request(reqwest::Method::GET, path)).await
    }

    pub async fn post(&self, path: &str, body: Value) -> Result<Value, ApiError> {
        self.execute(self.request(reqwest::Method::POST, path).json(&body))
            .await
    }
}
