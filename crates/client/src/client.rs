//! Retry and auth-refresh state machine around [`HttpTransport`].

use std::time::Duration;

use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{ApiError, ApiResult, ErrorCode};
use crate::secrets::SecretStore;
use crate::transport::{HttpRequest, HttpResponse, HttpTransport, Method, TransportError};

pub const DEFAULT_BACKEND_URL: &str = "https://alttext-ai-backend.onrender.com";
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const GENERATE_TIMEOUT: Duration = Duration::from_secs(90);
pub const MAX_BACKOFF: Duration = Duration::from_secs(4);

const REFRESH_ENDPOINT: &str = "/auth/refresh";
const EXPIRED_TOKEN_CODES: [&str; 2] = ["token_expired", "invalid_token"];

const GENERATE_TIMEOUT_MESSAGE: &str = "The image generation is taking longer than expected. \
     This may happen with large images or during high server load. Please try again.";
const TIMEOUT_MESSAGE: &str =
    "The server is taking too long to respond. Please try again in a few minutes.";
const UNREACHABLE_MESSAGE: &str =
    "Unable to reach the server. Please check your internet connection and try again.";
const NOT_FOUND_MESSAGE: &str = "This feature is not yet available. \
     Please contact support for assistance or try again later.";
const PASSWORD_RESET_NOT_FOUND_MESSAGE: &str = "Password reset is not available yet. \
     Please contact support for assistance or try again later.";
const DEFAULT_ERROR_MESSAGE: &str = "API request failed";

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Backend base URL, without trailing slash
    pub base_url: String,
    /// This site's public URL (sent as `X-Site-URL`, hashed into the site id)
    pub site_url: String,
    /// Attempts per request when the caller does not override it
    pub max_retries: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BACKEND_URL.to_string(),
            site_url: "http://localhost".to_string(),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl ClientConfig {
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_site_url(mut self, site_url: impl Into<String>) -> Self {
        self.site_url = site_url.into();
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// Per-request options.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub timeout: Option<Duration>,
    pub retries: Option<u32>,
    /// Site identity and credentials; off for anonymous endpoints
    pub include_auth_headers: bool,
    /// Sent as `X-WP-User-ID`
    pub user_id: Option<u64>,
    /// Override same-named default headers
    pub extra_headers: Vec<(String, String)>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            retries: None,
            include_auth_headers: true,
            user_id: None,
            extra_headers: Vec::new(),
        }
    }
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn without_auth(mut self) -> Self {
        self.include_auth_headers = false;
        self
    }

    pub fn user_id(mut self, user_id: u64) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_headers.push((name.into(), value.into()));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthMode {
    Anonymous,
    LicenseKey,
    Bearer,
}

/// Backend client.
///
/// Share it behind an `Arc`; all state lives in the [`SecretStore`].
pub struct ApiClient<T> {
    transport: T,
    secrets: SecretStore,
    config: ClientConfig,
}

impl<T: HttpTransport> ApiClient<T> {
    pub fn new(transport: T, secrets: SecretStore, config: ClientConfig) -> Self {
        Self {
            transport,
            secrets,
            config,
        }
    }

    pub fn secrets(&self) -> &SecretStore {
        &self.secrets
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn site_id(&self) -> String {
        self.secrets.site_id(&self.config.site_url)
    }

    /// Issue one logical request.
    ///
    /// Transport failures and retryable HTTP errors are retried with
    /// `min(4, 2^n)` second backoff until the attempt budget is spent. A 401
    /// carrying an expired-token code on a bearer request triggers one
    /// refresh; a successful refresh re-attempts without spending budget.
    #[instrument(skip(self, data, options), fields(source = "api"))]
    pub async fn request(
        &self,
        endpoint: &str,
        method: Method,
        data: Option<&Value>,
        options: RequestOptions,
    ) -> ApiResult<Value> {
        let url = self.url_for(endpoint);
        let timeout = timeout_for_endpoint(endpoint, options.timeout);
        let max_attempts = options.retries.unwrap_or(self.config.max_retries).max(1);
        let body = match data {
            Some(data) if method.has_body() => Some(data.to_string()),
            _ => None,
        };

        let (mut headers, mut auth) = self.build_headers(&options);
        let mut refreshed = false;
        let mut attempt: u32 = 0;

        loop {
            debug!(attempt = attempt + 1, max_attempts, "sending API request");
            let request = HttpRequest {
                method,
                url: url.clone(),
                headers: headers.clone(),
                body: body.clone(),
                timeout,
            };

            let error = match self.transport.send(request).await {
                Err(err) => {
                    let error = normalize_transport_error(&err, endpoint);
                    warn!(
                        attempt = attempt + 1,
                        code = %error.code(),
                        error = %err,
                        "API transport error"
                    );
                    error
                }
                Ok(response) => {
                    let payload = decode_body(&response);
                    if response.status < 400 {
                        if attempt > 0 {
                            info!(
                                attempts = attempt + 1,
                                status = response.status,
                                "API request recovered after retry"
                            );
                        }
                        return Ok(payload);
                    }

                    if response.status == 401
                        && auth == AuthMode::Bearer
                        && !refreshed
                        && signals_expired_token(&payload)
                    {
                        refreshed = true;
                        if self.refresh_token().await {
                            info!("bearer token refreshed, re-attempting request");
                            (headers, auth) = self.build_headers(&options);
                            continue;
                        }
                        self.secrets.clear_token();
                        warn!("token refresh failed, re-authentication required");
                        return Err(ApiError::auth_required());
                    }

                    let error = normalize_http_error(&payload, response.status, endpoint);
                    warn!(
                        attempt = attempt + 1,
                        status = response.status,
                        code = %error.code(),
                        "API returned an error"
                    );
                    error
                }
            };

            if attempt + 1 >= max_attempts || !error.is_retryable() {
                if error.is_retryable() {
                    error!(
                        attempts = attempt + 1,
                        code = %error.code(),
                        "API request failed after retries"
                    );
                }
                return Err(error);
            }
            let delay = backoff_delay(attempt);
            debug!(delay_secs = delay.as_secs(), "backing off before retry");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// One attempt at `POST /auth/refresh`; stores the new token on success.
    async fn refresh_token(&self) -> bool {
        let (headers, _) = self.build_headers(&RequestOptions::default());
        let request = HttpRequest {
            method: Method::Post,
            url: self.url_for(REFRESH_ENDPOINT),
            headers,
            body: None,
            timeout: DEFAULT_TIMEOUT,
        };

        match self.transport.send(request).await {
            Ok(response) if response.status < 400 => {
                let payload = decode_body(&response);
                match payload.get("token").and_then(Value::as_str) {
                    Some(token) if !token.is_empty() => {
                        self.secrets.set_token(token);
                        true
                    }
                    _ => {
                        warn!("refresh response carried no token");
                        false
                    }
                }
            }
            Ok(response) => {
                debug!(status = response.status, "token refresh rejected");
                false
            }
            Err(err) => {
                debug!(error = %err, "token refresh transport error");
                false
            }
        }
    }

    fn url_for(&self, endpoint: &str) -> String {
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            endpoint.trim_start_matches('/')
        )
    }

    /// License key wins over the bearer token.
    fn build_headers(&self, options: &RequestOptions) -> (Vec<(String, String)>, AuthMode) {
        let mut headers = vec![("Content-Type".to_string(), "application/json".to_string())];
        let mut auth = AuthMode::Anonymous;

        if options.include_auth_headers {
            headers.push(("X-Site-Hash".to_string(), self.site_id()));
            headers.push(("X-Site-URL".to_string(), self.config.site_url.clone()));
            if let Some(user_id) = options.user_id.filter(|id| *id > 0) {
                headers.push(("X-WP-User-ID".to_string(), user_id.to_string()));
            }
            if let Some(license_key) = self.secrets.license_key() {
                headers.push(("X-License-Key".to_string(), license_key));
                auth = AuthMode::LicenseKey;
            } else if let Some(token) = self.secrets.token() {
                headers.push(("Authorization".to_string(), format!("Bearer {token}")));
                auth = AuthMode::Bearer;
            }
        }

        for (name, value) in &options.extra_headers {
            headers.retain(|(existing, _)| !existing.eq_ignore_ascii_case(name));
            headers.push((name.clone(), value.clone()));
        }
        (headers, auth)
    }
}

/// Explicit override, else 90s for generation endpoints, else 30s.
pub fn timeout_for_endpoint(endpoint: &str, explicit: Option<Duration>) -> Duration {
    match explicit {
        Some(timeout) => timeout,
        None if endpoint.contains("/generate") => GENERATE_TIMEOUT,
        None => DEFAULT_TIMEOUT,
    }
}

/// Delay after the `attempt`-th failure (0-based): 1s, 2s, 4s, 4s, ...
pub fn backoff_delay(attempt: u32) -> Duration {
    let secs = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    Duration::from_secs(secs).min(MAX_BACKOFF)
}

fn decode_body(response: &HttpResponse) -> Value {
    if response.body.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str(&response.body).unwrap_or_else(|_| Value::String(response.body.clone()))
}

fn signals_expired_token(payload: &Value) -> bool {
    payload
        .get("code")
        .and_then(Value::as_str)
        .is_some_and(|code| EXPIRED_TOKEN_CODES.contains(&code))
}

fn normalize_transport_error(err: &TransportError, endpoint: &str) -> ApiError {
    let text = err.to_string().to_lowercase();
    let timed_out = matches!(err, TransportError::Timeout(_))
        || text.contains("timeout")
        || text.contains("timed out");
    let unreachable = matches!(err, TransportError::Connect(_))
        || text.contains("could not resolve")
        || text.contains("resolve host");

    if timed_out {
        let message = if endpoint.contains("/generate") {
            GENERATE_TIMEOUT_MESSAGE
        } else {
            TIMEOUT_MESSAGE
        };
        ApiError::new(ErrorCode::Timeout, message)
    } else if unreachable {
        ApiError::new(ErrorCode::Unreachable, UNREACHABLE_MESSAGE)
    } else {
        ApiError::new(ErrorCode::Api, err.to_string())
    }
}

fn normalize_http_error(payload: &Value, status: u16, endpoint: &str) -> ApiError {
    if status == 404 && looks_like_router_404(payload) {
        let password_endpoint =
            endpoint.contains("forgot-password") || endpoint.contains("reset-password");
        let message = if password_endpoint {
            PASSWORD_RESET_NOT_FOUND_MESSAGE
        } else {
            NOT_FOUND_MESSAGE
        };
        return ApiError::new(ErrorCode::EndpointNotFound, message).with_status(status);
    }

    let code = payload.get("code").and_then(Value::as_str).unwrap_or_default();
    let message = payload
        .get("error")
        .and_then(Value::as_str)
        .or_else(|| payload.get("message").and_then(Value::as_str))
        .unwrap_or(DEFAULT_ERROR_MESSAGE);

    if status >= 500 {
        error!(status, code, endpoint, "API server error");
    }
    ApiError::new(ErrorCode::from_backend(code), message).with_status(status)
}

fn looks_like_router_404(payload: &Value) -> bool {
    match payload {
        Value::String(body) => {
            let lower = body.to_lowercase();
            lower.contains("<html") || body.contains("Cannot POST") || body.contains("Cannot GET")
        }
        _ => false,
    }
}
