//! Stateless, time-bounded access tokens. A token binds a digest of the API
//! key to a validity window and is signed with HMAC-SHA256. There is no
//! revocation list: validity depends only on the signature and the clock.
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

// Bytes of the API key digest embedded in the token
const KEY_DIGEST_LEN: usize = 12;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum TokenError {
    #[error("token secret rejected")]
    InvalidSecret,
    #[error("malformed token")]
    Malformed,
    #[error("token signature does not verify")]
    BadSignature,
    #[error("token was issued for a different API key")]
    WrongKey,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenStatus {
    Valid,
    NotYetValid,
    Expired,
}

#[derive(Clone)]
pub struct TokenSigner {
    mac: HmacSha256,
}

impl TokenSigner {
    pub fn new(secret: &[u8]) -> Result<Self, TokenError> {
        let mac = HmacSha256::new_from_slice(secret).map_err(|_| TokenError::InvalidSecret)?;
        Ok(TokenSigner { mac })
    }

    fn key_digest(api_key: &str) -> String {
        let digest = Sha256::digest(api_key.as_bytes());
        URL_SAFE_NO_PAD.encode(&digest[..KEY_DIGEST_LEN])
    }

    fn sign(&self, payload: &[u8]) -> Vec<u8> {
        let mut mac = self.mac.clone();
        mac.update(payload);
        mac.finalize().into_bytes().to_vec()
    }

    /// Mints a token for `api_key` valid in `[not_before, expires)`.
    pub fn mint(&self, api_key: &str, not_before: DateTime<Utc>, expires: DateTime<Utc>) -> String {
        let payload = format!(
            "{}.{}.{}",
            Self::key_digest(api_key),
            not_before.timestamp_millis(),
            expires.timestamp_millis()
        );
        let signature = self.sign(payload.as_bytes());
        format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(payload.as_bytes()),
            URL_SAFE_NO_PAD.encode(signature)
        )
    }

    /// Checks `token` against `api_key` at `now`. Structural problems are
    /// errors; a well-formed token outside its window reports its status.
    pub fn verify(
        &self,
        token: &str,
        api_key: &str,
        now: DateTime<Utc>,
    ) -> Result<TokenStatus, TokenError> {
        let (encoded_payload, encoded_signature) =
            token.split_once('.').ok_or(TokenError::Malformed)?;
        let payload = URL_SAFE_NO_PAD
            .decode(encoded_payload)
            .map_err(|_| TokenError::Malformed)?;
        let signature = URL_SAFE_NO_PAD
            .decode(encoded_signature)
            .map_err(|_| TokenError::Malformed)?;

        let mut mac = self.mac.clone();
        mac.update(&payload);
        mac.verify_slice(&signature)
            .map_err(|_| TokenError::BadSignature)?;

        let payload = String::from_utf8(payload).map_err(|_| TokenError::Malformed)?;
        let mut parts = payload.split('.');
        let (Some(digest), Some(not_before), Some(expires), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(TokenError::Malformed);
        };
        let not_before: i64 = not_before.parse().map_err(|_| TokenError::Malformed)?;
        let expires: i64 = expires.parse().map_err(|_| TokenError::Malformed)?;

        if digest != Self::key_digest(api_key) {
            return Err(TokenError::WrongKey);
        }

        let now = now.timestamp_millis();
        if now < not_before {
            Ok(TokenStatus::NotYetValid)
        } else if now >= expires {
            Ok(TokenStatus::Expired)
        } else {
            Ok(TokenStatus::Valid)
        }
    }

    /// True only for a well-formed token, bound to `api_key`, inside its window.
    pub fn is_valid(&self, token: &str, api_key: &str, now: DateTime<Utc>) -> bool {
        match self.verify(token, api_key, now) {
            Ok(TokenStatus::Valid) => true,
            Ok(status) => {
                tracing::debug!(?status, "access token outside its validity window");
                false
            }
            Err(err) => {
                tracing::debug!(error = %err, "access token rejected");
                false
            }
        }
    }
}
