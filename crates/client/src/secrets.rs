//! Credential storage with best-effort encryption at rest.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Marks a value written by [`SecretCipher::encrypt`].
pub const ENCRYPTION_PREFIX: &str = "enc:";

pub const TOKEN_KEY: &str = "optti_jwt_token";
pub const USER_KEY: &str = "optti_user_data";
pub const SITE_ID_KEY: &str = "optti_site_id";
pub const LICENSE_KEY_KEY: &str = "optti_license_key";
pub const LICENSE_DATA_KEY: &str = "optti_license_data";

const IV_LEN: usize = 16;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Named string options (the site's key/value settings table).
pub trait OptionStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: String);
    fn delete(&self, key: &str);
}

/// Process-local option store.
#[derive(Debug, Default)]
pub struct InMemoryOptionStore {
    values: RwLock<HashMap<String, String>>,
}

impl InMemoryOptionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl OptionStore for InMemoryOptionStore {
    fn get(&self, key: &str) -> Option<String> {
        let values = self.values.read().unwrap_or_else(|p| p.into_inner());
        values.get(key).cloned()
    }

    fn set(&self, key: &str, value: String) {
        let mut values = self.values.write().unwrap_or_else(|p| p.into_inner());
        values.insert(key.to_string(), value);
    }

    fn delete(&self, key: &str) {
        let mut values = self.values.write().unwrap_or_else(|p| p.into_inner());
        values.remove(key);
    }
}

/// AES-256-CBC with a random IV, stored as `enc:` + base64(iv || ciphertext).
#[derive(Clone)]
pub struct SecretCipher {
    key: [u8; 32],
}

impl std::fmt::Debug for SecretCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretCipher").finish_non_exhaustive()
    }
}

impl SecretCipher {
    /// Key is the first 32 hex characters of SHA-256(`salt`).
    pub fn from_salt(salt: &str) -> Self {
        let hex = format!("{:x}", Sha256::digest(salt.as_bytes()));
        let mut key = [0u8; 32];
        key.copy_from_slice(&hex.as_bytes()[..32]);
        Self { key }
    }

    /// Encrypt `plain`. Falls back to the plaintext if the cipher cannot
    /// be initialised; an empty input stays empty.
    pub fn encrypt(&self, plain: &str) -> String {
        if plain.is_empty() {
            return String::new();
        }
        let iv: [u8; IV_LEN] = rand::random();
        let Ok(cipher) = Aes256CbcEnc::new_from_slices(&self.key, &iv) else {
            return plain.to_string();
        };
        let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plain.as_bytes());

        let mut payload = Vec::with_capacity(IV_LEN + ciphertext.len());
        payload.extend_from_slice(&iv);
        payload.extend_from_slice(&ciphertext);
        format!("{ENCRYPTION_PREFIX}{}", STANDARD.encode(payload))
    }

    /// Decrypt a stored value.
    ///
    /// Values without the prefix are legacy plaintext and returned as-is.
    /// Any decoding or decryption failure yields an empty string.
    pub fn decrypt(&self, stored: &str) -> String {
        let Some(encoded) = stored.strip_prefix(ENCRYPTION_PREFIX) else {
            return stored.to_string();
        };
        let Ok(payload) = STANDARD.decode(encoded) else {
            return String::new();
        };
        if payload.len() <= IV_LEN {
            return String::new();
        }
        let (iv, ciphertext) = payload.split_at(IV_LEN);
        let Ok(cipher) = Aes256CbcDec::new_from_slices(&self.key, iv) else {
            return String::new();
        };
        cipher
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .ok()
            .and_then(|plain| String::from_utf8(plain).ok())
            .unwrap_or_default()
    }
}

/// Credentials and site identity on top of an [`OptionStore`].
///
/// Token and license key are encrypted when a cipher is configured.
#[derive(Clone)]
pub struct SecretStore {
    options: Arc<dyn OptionStore>,
    cipher: Option<SecretCipher>,
}

impl SecretStore {
    pub fn new(options: Arc<dyn OptionStore>, cipher: Option<SecretCipher>) -> Self {
        Self { options, cipher }
    }

    /// Store without encryption at rest.
    pub fn plaintext(options: Arc<dyn OptionStore>) -> Self {
        Self::new(options, None)
    }

    pub fn token(&self) -> Option<String> {
        self.read_secret(TOKEN_KEY)
    }

    /// Store a bearer token; an empty token clears it.
    pub fn set_token(&self, token: &str) {
        if token.is_empty() {
            self.clear_token();
        } else {
            self.write_secret(TOKEN_KEY, token);
        }
    }

    /// Forget the bearer token and the user profile that came with it.
    pub fn clear_token(&self) {
        self.options.delete(TOKEN_KEY);
        self.options.delete(USER_KEY);
    }

    pub fn license_key(&self) -> Option<String> {
        self.read_secret(LICENSE_KEY_KEY)
    }

    /// Store a license key; an empty key also removes the license data.
    pub fn set_license_key(&self, license_key: &str) {
        if license_key.is_empty() {
            self.options.delete(LICENSE_KEY_KEY);
            self.options.delete(LICENSE_DATA_KEY);
        } else {
            self.write_secret(LICENSE_KEY_KEY, license_key);
        }
    }

    pub fn license_data(&self) -> Option<Value> {
        self.read_json(LICENSE_DATA_KEY)
    }

    pub fn set_license_data(&self, data: &Value) {
        self.options.set(LICENSE_DATA_KEY, data.to_string());
    }

    pub fn user_data(&self) -> Option<Value> {
        self.read_json(USER_KEY)
    }

    pub fn set_user_data(&self, data: &Value) {
        self.options.set(USER_KEY, data.to_string());
    }

    /// A license (key and data) or a bearer token.
    pub fn is_authenticated(&self) -> bool {
        (self.license_key().is_some() && self.license_data().is_some()) || self.token().is_some()
    }

    /// Stable site identifier, derived from `site_url` on first use.
    pub fn site_id(&self, site_url: &str) -> String {
        if let Some(existing) = self.options.get(SITE_ID_KEY).filter(|v| !v.is_empty()) {
            return existing;
        }
        let digest = format!("{:x}", Sha256::digest(site_url.as_bytes()));
        let site_id = digest[..32].to_string();
        self.options.set(SITE_ID_KEY, site_id.clone());
        site_id
    }

    /// Copy credentials saved under `legacy_prefix` (e.g. `beepbeepai_`)
    /// into the current keys where those are still empty.
    pub fn migrate_legacy(&self, legacy_prefix: &str) -> usize {
        let mut migrated = 0;
        for (suffix, current) in [
            ("jwt_token", TOKEN_KEY),
            ("user_data", USER_KEY),
            ("license_key", LICENSE_KEY_KEY),
            ("license_data", LICENSE_DATA_KEY),
        ] {
            let legacy_key = format!("{legacy_prefix}{suffix}");
            let Some(value) = self.options.get(&legacy_key).filter(|v| !v.is_empty()) else {
                continue;
            };
            if self.options.get(current).is_some_and(|v| !v.is_empty()) {
                continue;
            }
            self.options.set(current, value);
            migrated += 1;
        }
        if migrated > 0 {
            tracing::info!(source = "api", migrated, legacy_prefix, "migrated legacy credentials");
        }
        migrated
    }

    fn read_secret(&self, key: &str) -> Option<String> {
        let stored = self.options.get(key)?;
        let value = match &self.cipher {
            Some(cipher) => cipher.decrypt(&stored),
            None => stored,
        };
        (!value.is_empty()).then_some(value)
    }

    fn write_secret(&self, key: &str, value: &str) {
        let stored = match &self.cipher {
            Some(cipher) => cipher.encrypt(value),
            None => value.to_string(),
        };
        self.options.set(key, stored);
    }

    fn read_json(&self, key: &str) -> Option<Value> {
        let raw = self.options.get(key)?;
        match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Null) => None,
            Ok(value) => Some(value),
            Err(_) => Some(Value::String(raw)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> (SecretStore, Arc<InMemoryOptionStore>) {
        let options = InMemoryOptionStore::arc();
        let store = SecretStore::new(options.clone(), Some(SecretCipher::from_salt("auth-salt")));
        (store, options)
    }

    #[test]
    fn cipher_round_trips_with_random_iv() {
        let cipher = SecretCipher::from_salt("salt");
        let a = cipher.encrypt("license-123");
        let b = cipher.encrypt("license-123");
        assert!(a.starts_with(ENCRYPTION_PREFIX));
        assert_ne!(a, b);
        assert_eq!(cipher.decrypt(&a), "license-123");
        assert_eq!(cipher.decrypt(&b), "license-123");
    }

    #[test]
    fn decrypt_passes_legacy_plaintext_through() {
        let cipher = SecretCipher::from_salt("salt");
        assert_eq!(cipher.decrypt("plain-token"), "plain-token");
        assert_eq!(cipher.decrypt(""), "");
    }

    #[test]
    fn decrypt_failures_degrade_to_empty() {
        let cipher = SecretCipher::from_salt("salt");
        assert_eq!(cipher.decrypt("enc:not base64!!"), "");
        assert_eq!(cipher.decrypt(&format!("enc:{}", STANDARD.encode([1u8; 16]))), "");

        let other = SecretCipher::from_salt("different-salt").encrypt("secret");
        let decrypted = cipher.decrypt(&other);
        assert_ne!(decrypted, "secret");
    }

    #[test]
    fn token_is_encrypted_at_rest() {
        let (store, options) = store();
        store.set_token("jwt-abc");
        let raw = options.get(TOKEN_KEY).unwrap();
        assert!(raw.starts_with(ENCRYPTION_PREFIX));
        assert_eq!(store.token().as_deref(), Some("jwt-abc"));

        store.set_user_data(&json!({"email": "a@b.c"}));
        store.clear_token();
        assert_eq!(store.token(), None);
        assert_eq!(store.user_data(), None);
    }

    #[test]
    fn empty_license_key_removes_license_data() {
        let (store, _) = store();
        store.set_license_key("key-1");
        store.set_license_data(&json!({"plan": "pro"}));
        assert!(store.is_authenticated());

        store.set_license_key("");
        assert_eq!(store.license_key(), None);
        assert_eq!(store.license_data(), None);
        assert!(!store.is_authenticated());
    }

    #[test]
    fn license_key_without_data_is_not_authenticated() {
        let (store, _) = store();
        store.set_license_key("key-1");
        assert!(!store.is_authenticated());
        store.set_token("jwt");
        assert!(store.is_authenticated());
    }

    #[test]
    fn site_id_is_generated_once() {
        let (store, options) = store();
        let id = store.site_id("https://example.com");
        assert_eq!(id.len(), 32);
        assert_eq!(store.site_id("https://other.example"), id);
        assert_eq!(options.get(SITE_ID_KEY), Some(id));
    }

    #[test]
    fn legacy_credentials_are_migrated_without_overwriting() {
        let (store, options) = store();
        options.set("beepbeepai_jwt_token", "legacy-jwt".into());
        options.set("beepbeepai_license_key", "legacy-key".into());
        store.set_license_key("current-key");

        assert_eq!(store.migrate_legacy("beepbeepai_"), 1);
        assert_eq!(store.token().as_deref(), Some("legacy-jwt"));
        assert_eq!(store.license_key().as_deref(), Some("current-key"));
    }
}
