//! HMAC-SHA256 signing for presigned download URLs.
//!
//! A grant is `GET {public_url}/download/{key}?expires={unix}&signature={sig}`
//! where `sig` is the URL-safe base64 HMAC of `GET\n{key}\n{expires}`. Nothing
//! is stored; expiry is checked when the URL is presented.

use std::{sync::Arc, time::Duration};

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;
use url::Url;

type HmacSha256 = Hmac<Sha256>;

const DOWNLOAD_PATH: &str = "download";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("download link has expired")]
    Expired,
    #[error("download link signature is invalid")]
    Invalid,
}

#[derive(Clone)]
pub struct UrlSigner {
    secret: Arc<[u8]>,
    public_url: Url,
}

impl UrlSigner {
    pub fn new(secret: impl AsRef<[u8]>, public_url: Url) -> Self {
        Self {
            secret: Arc::from(secret.as_ref()),
            public_url,
        }
    }

    /// Issue a read grant for `key` valid for `ttl` from now.
    pub fn presign_get(&self, key: &str, ttl: Duration) -> String {
        let ttl = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        let expires = Utc::now().timestamp().saturating_add(ttl);
        self.presign_get_until(key, expires)
    }

    pub fn presign_get_until(&self, key: &str, expires: i64) -> String {
        let mut url = self.public_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .push(DOWNLOAD_PATH)
                .extend(key.split('/'));
        }
        url.query_pairs_mut()
            .clear()
            .append_pair("expires", &expires.to_string())
            .append_pair("signature", &self.sign(key, expires));
        url.into()
    }

    /// Check a presented grant. Signature comparison is constant-time.
    pub fn verify(&self, key: &str, expires: i64, signature: &str) -> Result<(), SignatureError> {
        let provided = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| SignatureError::Invalid)?;
        self.mac(key, expires)
            .verify_slice(&provided)
            .map_err(|_| SignatureError::Invalid)?;
        if expires < Utc::now().timestamp() {
            return Err(SignatureError::Expired);
        }
        Ok(())
    }

    fn sign(&self, key: &str, expires: i64) -> String {
        URL_SAFE_NO_PAD.encode(self.mac(key, expires).finalize().into_bytes())
    }

    fn mac(&self, key: &str, expires: i64) -> HmacSha256 {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC can take key of any size");
        mac.update(format!("GET\n{}\n{}", key, expires).as_bytes());
        mac
    }
}
