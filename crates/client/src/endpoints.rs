//! Typed helpers for the backend's routes.

use serde_json::{Value, json};

use optti_core::EntityId;

use crate::client::{ApiClient, GENERATE_TIMEOUT, RequestOptions};
use crate::error::ApiResult;
use crate::transport::{HttpTransport, Method};

/// Input for `POST /api/generate`.
///
/// `image` is the already-prepared image payload (URL or encoded data);
/// preparing it is the caller's job.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub entity_id: EntityId,
    pub image: Value,
    pub context: Value,
    pub regenerate: bool,
    /// Sent as `X-WP-User-ID` when set
    pub user_id: Option<u64>,
}

impl GenerateRequest {
    pub fn new(entity_id: EntityId, image: Value) -> Self {
        Self {
            entity_id,
            image,
            context: json!({}),
            regenerate: false,
            user_id: None,
        }
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    pub fn regenerate(mut self, regenerate: bool) -> Self {
        self.regenerate = regenerate;
        self
    }

    pub fn user_id(mut self, user_id: u64) -> Self {
        self.user_id = Some(user_id);
        self
    }
}

impl<T: HttpTransport> ApiClient<T> {
    /// Log in and keep the returned token, profile and license key.
    pub async fn login(&self, email: &str, password: &str) -> ApiResult<Value> {
        let body = json!({ "email": email, "password": password });
        let response = self
            .request("/auth/login", Method::Post, Some(&body), RequestOptions::new())
            .await?;
        self.store_session(&response);
        Ok(response)
    }

    pub async fn register(&self, email: &str, password: &str) -> ApiResult<Value> {
        let body = json!({ "email": email, "password": password });
        let response = self
            .request("/auth/register", Method::Post, Some(&body), RequestOptions::new())
            .await?;
        self.store_session(&response);
        Ok(response)
    }

    pub async fn get_user_info(&self) -> ApiResult<Value> {
        self.request("/auth/user", Method::Get, None, RequestOptions::new())
            .await
    }

    pub async fn forgot_password(&self, email: &str) -> ApiResult<Value> {
        let body = json!({ "email": email, "siteUrl": self.config().site_url });
        self.request(
            "/auth/forgot-password",
            Method::Post,
            Some(&body),
            RequestOptions::new().without_auth(),
        )
        .await
    }

    pub async fn reset_password(
        &self,
        email: &str,
        token: &str,
        new_password: &str,
    ) -> ApiResult<Value> {
        let body = json!({ "email": email, "token": token, "newPassword": new_password });
        self.request(
            "/auth/reset-password",
            Method::Post,
            Some(&body),
            RequestOptions::new().without_auth(),
        )
        .await
    }

    pub async fn get_usage(&self) -> ApiResult<Value> {
        self.request("/usage", Method::Get, None, RequestOptions::new())
            .await
    }

    pub async fn validate_license(&self, license_key: &str) -> ApiResult<Value> {
        let body = json!({
            "license_key": license_key,
            "site_id": self.site_id(),
            "site_url": self.config().site_url,
        });
        self.request("/license/validate", Method::Post, Some(&body), RequestOptions::new())
            .await
    }

    /// Activate a license for this site and remember it on success.
    pub async fn activate_license(&self, license_key: &str, fingerprint: &str) -> ApiResult<Value> {
        let body = json!({
            "license_key": license_key,
            "site_id": self.site_id(),
            "site_url": self.config().site_url,
            "fingerprint": fingerprint,
        });
        let response = self
            .request("/license/activate", Method::Post, Some(&body), RequestOptions::new())
            .await?;
        self.secrets().set_license_key(license_key);
        if let Some(license) = response.get("license").or_else(|| response.get("data")) {
            self.secrets().set_license_data(license);
        }
        Ok(response)
    }

    /// Deactivate a license; the stored key is forgotten on success.
    pub async fn deactivate_license(&self, license_key: &str) -> ApiResult<Value> {
        let body = json!({ "license_key": license_key, "site_id": self.site_id() });
        let response = self
            .request("/license/deactivate", Method::Post, Some(&body), RequestOptions::new())
            .await?;
        if self.secrets().license_key().as_deref() == Some(license_key) {
            self.secrets().set_license_key("");
        }
        Ok(response)
    }

    pub async fn get_subscription_info(&self) -> ApiResult<Value> {
        self.request("/billing/subscription", Method::Get, None, RequestOptions::new())
            .await
    }

    pub async fn get_billing_info(&self) -> ApiResult<Value> {
        self.request("/billing/info", Method::Get, None, RequestOptions::new())
            .await
    }

    /// Public plan catalogue; sent without credentials.
    pub async fn get_plans(&self) -> ApiResult<Value> {
        self.request(
            "/billing/plans",
            Method::Get,
            None,
            RequestOptions::new().without_auth(),
        )
        .await
    }

    pub async fn create_checkout_session(
        &self,
        price_id: &str,
        success_url: &str,
        cancel_url: &str,
    ) -> ApiResult<Value> {
        let body = json!({
            "priceId": price_id,
            "successUrl": success_url,
            "cancelUrl": cancel_url,
        });
        self.request("/billing/checkout", Method::Post, Some(&body), RequestOptions::new())
            .await
    }

    pub async fn create_customer_portal_session(&self, return_url: &str) -> ApiResult<Value> {
        let body = json!({ "returnUrl": return_url });
        self.request("/billing/portal", Method::Post, Some(&body), RequestOptions::new())
            .await
    }

    /// Ask the backend to describe one image.
    pub async fn generate_alt_text(&self, request: &GenerateRequest) -> ApiResult<Value> {
        let site_hash = self.site_id();
        let image_id = request.entity_id.to_string();
        let body = json!({
            "image_data": request.image,
            "context": request.context,
            "regenerate": request.regenerate,
            "timestamp": chrono::Utc::now().timestamp(),
            "image_id": image_id,
            "attachment_id": image_id,
            "siteHash": site_hash,
            "site_id": site_hash,
        });

        let mut options = RequestOptions::new()
            .timeout(GENERATE_TIMEOUT)
            .header("X-Image-ID", image_id.clone())
            .header("X-Attachment-ID", image_id)
            .header("X-Site-Hash", site_hash);
        if let Some(user_id) = request.user_id {
            options = options.user_id(user_id);
        }
        self.request("/api/generate", Method::Post, Some(&body), options)
            .await
    }

    fn store_session(&self, response: &Value) {
        let Some(token) = response.get("token").and_then(Value::as_str) else {
            return;
        };
        self.secrets().set_token(token);
        if let Some(user) = response.get("user") {
            self.secrets().set_user_data(user);
            if let Some(license_key) = user.get("license_key").and_then(Value::as_str) {
                self.secrets().set_license_key(license_key);
            }
        }
    }
}

/// Pull the generated alt text out of a generation response.
pub fn extract_alt_text(response: &Value) -> Option<&str> {
    ["alt_text", "altText"]
        .iter()
        .find_map(|key| response.get(*key).and_then(Value::as_str))
        .or_else(|| response.get("data").and_then(|d| d.get("alt_text")).and_then(Value::as_str))
        .map(str::trim)
        .filter(|text| !text.is_empty())
}
