//! Signed upload state tokens.
//!
//! Between chunks the client carries the upload's state in the `_state` query
//! parameter. The token is `base64url(HMAC-SHA256(key, json) ++ json)`, so the
//! registry keeps no per-upload session and tampered tokens are rejected before
//! their contents are looked at.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE;
use hmac::{Hmac, Mac};
use secret::Secret;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::RegistryError;

type HmacSha256 = Hmac<Sha256>;

const MAC_LEN: usize = 32;

/// Where an upload stands, as seen by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobUploadState {
    /// Repository the upload belongs to.
    pub path: String,
    /// Upload id.
    pub uuid: String,
    /// Bytes received so far.
    pub offset: u64,
}

/// Why a token was refused.
#[derive(Debug, thiserror::Error)]
pub enum UploadTokenError {
    /// Not base64url.
    #[error("upload state is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),

    /// Shorter than a MAC.
    #[error("upload state is truncated")]
    Truncated,

    /// MAC did not verify.
    #[error("upload state signature is invalid")]
    Signature,

    /// Verified, but not a state document.
    #[error("upload state payload is invalid: {0}")]
    Payload(#[from] serde_json::Error),

    /// The signing key was unusable.
    #[error("upload state key is invalid")]
    Key,
}

impl From<UploadTokenError> for RegistryError {
    fn from(error: UploadTokenError) -> Self {
        match error {
            UploadTokenError::Key => RegistryError::Internal(error.to_string()),
            other => RegistryError::BlobUploadInvalid(other.to_string()),
        }
    }
}

/// Packs and unpacks upload state with a process-wide key.
#[derive(Debug, Clone)]
pub struct UploadTokens {
    key: Secret,
}

impl UploadTokens {
    /// Sign tokens with `key`.
    pub fn new(key: Secret) -> Self {
        Self { key }
    }

    fn mac(&self) -> Result<HmacSha256, UploadTokenError> {
        HmacSha256::new_from_slice(self.key.as_bytes()).map_err(|_| UploadTokenError::Key)
    }

    /// Sign and encode a state.
    pub fn pack(&self, state: &BlobUploadState) -> Result<String, UploadTokenError> {
        let payload = serde_json::to_vec(state)?;
        let mut mac = self.mac()?;
        mac.update(&payload);

        let mut token = mac.finalize().into_bytes().to_vec();
        token.extend_from_slice(&payload);
        Ok(URL_SAFE.encode(token))
    }

    /// Verify and decode a state.
    pub fn unpack(&self, token: &str) -> Result<BlobUploadState, UploadTokenError> {
        let raw = URL_SAFE.decode(token)?;
        if raw.len() < MAC_LEN {
            return Err(UploadTokenError::Truncated);
        }
        let (signature, payload) = raw.split_at(MAC_LEN);

        let mut mac = self.mac()?;
        mac.update(payload);
        mac.verify_slice(signature)
            .map_err(|_| UploadTokenError::Signature)?;

        Ok(serde_json::from_slice(payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> BlobUploadState {
        BlobUploadState {
            path: "acme/docker/app".into(),
            uuid: "c0ffee".into(),
            offset: 100,
        }
    }

    #[test]
    fn unpacks_what_it_packed() {
        let tokens = UploadTokens::new(Secret::from("key"));
        let token = tokens.pack(&state()).unwrap();
        assert_eq!(tokens.unpack(&token).unwrap(), state());
    }

    #[test]
    fn rejects_tampering() {
        let tokens = UploadTokens::new(Secret::from("key"));
        let token = tokens.pack(&state()).unwrap();

        let mut raw = URL_SAFE.decode(&token).unwrap();
        let last = raw.len() - 2;
        raw[last] ^= 0x01;
        let tampered = URL_SAFE.encode(raw);
        assert!(matches!(tokens.unpack(&tampered), Err(UploadTokenError::Signature)));
    }

    #[test]
    fn rejects_other_keys() {
        let token = UploadTokens::new(Secret::from("one")).pack(&state()).unwrap();
        assert!(matches!(
            UploadTokens::new(Secret::from("two")).unpack(&token),
            Err(UploadTokenError::Signature)
        ));
    }

    #[test]
    fn rejects_garbage() {
        let tokens = UploadTokens::new(Secret::from("key"));
        assert!(matches!(tokens.unpack("!!"), Err(UploadTokenError::Encoding(_))));
        assert!(matches!(
            tokens.unpack(&URL_SAFE.encode(b"short")),
            Err(UploadTokenError::Truncated)
        ));
    }
}
