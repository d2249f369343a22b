//! Client for the Optti backend.
//!
//! [`ApiClient::request`] wraps every outbound call in a retry and
//! auth-refresh state machine and hands callers a single [`ApiResult`]:
//! the decoded body or a typed [`ApiError`].
//!
//! - transport failures and 5xx responses are retried with capped
//!   exponential backoff;
//! - a 401 signalling an expired bearer token triggers one refresh, after
//!   which the request is re-attempted without consuming a retry;
//! - license-key authentication always wins over the bearer token and is
//!   never refreshed.

pub mod client;
pub mod endpoints;
pub mod error;
pub mod secrets;
pub mod transport;

pub use client::{ApiClient, ClientConfig, RequestOptions};
pub use endpoints::{GenerateRequest, extract_alt_text};
pub use error::{ApiError, ApiResult, ErrorClass, ErrorCode};
pub use secrets::{InMemoryOptionStore, OptionStore, SecretCipher, SecretStore};
pub use transport::{
    HttpRequest, HttpResponse, HttpTransport, Method, ReqwestTransport, TransportError,
};
