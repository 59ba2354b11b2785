use std::fmt;

use aes_gcm::aead::KeyInit;
use aes_gcm::Aes256Gcm;
use base64::prelude::*;

use execflow_core::error::CryptoError;

/// Key length in bytes (AES-256).
pub const KEY_LEN: usize = 32;

/// Pre-shared symmetric key, imported from its base64 form.
///
/// Keys are provisioned out-of-band; this type only imports them.
#[derive(Clone)]
pub struct SharedKey {
    cipher: Aes256Gcm,
}

impl SharedKey {
    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        let bytes = BASE64_STANDARD
            .decode(encoded.trim())
            .map_err(|e| CryptoError::KeyImportFailure(format!("invalid base64: {e}")))?;
        Self::from_bytes(&bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != KEY_LEN {
            return Err(CryptoError::KeyImportFailure(format!(
                "expected {KEY_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let cipher = Aes256Gcm::new_from_slice(bytes)
            .map_err(|e| CryptoError::KeyImportFailure(e.to_string()))?;
        Ok(Self { cipher })
    }

    pub(crate) fn cipher(&self) -> &Aes256Gcm {
        &self.cipher
    }
}

impl fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedKey(<redacted>)")
    }
}
