//! Authenticated encryption of dispatch payloads.
//!
//! Every [`encrypt`] call draws a fresh 96-bit nonce from the OS RNG. The
//! API takes no nonce argument, so a caller cannot reuse one under the same key.

use aes_gcm::aead::{Aead, AeadCore, OsRng, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use execflow_core::error::CryptoError;

use crate::key::SharedKey;

/// Nonce length in bytes (96 bits).
pub const NONCE_LEN: usize = 12;

/// Ciphertext plus the nonce and associated data needed to open it.
///
/// Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    ciphertext: Vec<u8>,
    nonce: [u8; NONCE_LEN],
    associated_data: Vec<u8>,
}

/// Transport form: each field standard base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireEnvelope {
    pub c: String,
    pub n: String,
    pub a: String,
}

impl Envelope {
    pub fn ciphertext(&self) -> &[u8] {
        &self.ciphertext
    }

    pub fn nonce(&self) -> &[u8; NONCE_LEN] {
        &self.nonce
    }

    pub fn associated_data(&self) -> &[u8] {
        &self.associated_data
    }

    pub fn to_wire(&self) -> WireEnvelope {
        WireEnvelope {
            c: BASE64_STANDARD.encode(&self.ciphertext),
            n: BASE64_STANDARD.encode(self.nonce),
            a: BASE64_STANDARD.encode(&self.associated_data),
        }
    }

    /// Serialized `{"c": .., "n": .., "a": ..}` document.
    pub fn to_json(&self) -> String {
        // A struct of three strings always serializes.
        serde_json::to_string(&self.to_wire()).unwrap_or_default()
    }

    pub fn from_wire(wire: &WireEnvelope) -> Result<Self, CryptoError> {
        let ciphertext = decode_field("c", &wire.c)?;
        let nonce_bytes = decode_field("n", &wire.n)?;
        let associated_data = decode_field("a", &wire.a)?;

        let nonce: [u8; NONCE_LEN] = nonce_bytes.as_slice().try_into().map_err(|_| {
            CryptoError::MalformedEnvelope(format!(
                "nonce must be {NONCE_LEN} bytes, got {}",
                nonce_bytes.len()
            ))
        })?;

        Ok(Self {
            ciphertext,
            nonce,
            associated_data,
        })
    }

    pub fn from_json(json: &str) -> Result<Self, CryptoError> {
        let wire: WireEnvelope = serde_json::from_str(json)
            .map_err(|e| CryptoError::MalformedEnvelope(e.to_string()))?;
        Self::from_wire(&wire)
    }
}

fn decode_field(name: &str, value: &str) -> Result<Vec<u8>, CryptoError> {
    BASE64_STANDARD
        .decode(value)
        .map_err(|e| CryptoError::MalformedEnvelope(format!("field '{name}': {e}")))
}

/// Encrypt `plaintext` under `key`, binding `associated_data` to the ciphertext.
pub fn encrypt(
    key: &SharedKey,
    plaintext: &[u8],
    associated_data: &[u8],
) -> Result<Envelope, CryptoError> {
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = key
        .cipher()
        .encrypt(
            &nonce,
            Payload {
                msg: plaintext,
                aad: associated_data,
            },
        )
        .map_err(|_| CryptoError::EncryptFailure)?;

    debug!(
        plaintext_len = plaintext.len(),
        aad_len = associated_data.len(),
        "Sealed envelope"
    );

    let mut nonce_bytes = [0u8; NONCE_LEN];
    nonce_bytes.copy_from_slice(nonce.as_slice());

    Ok(Envelope {
        ciphertext,
        nonce: nonce_bytes,
        associated_data: associated_data.to_vec(),
    })
}

/// Open an envelope. Any tampering yields [`CryptoError::TagMismatch`] and no output.
pub fn decrypt(envelope: &Envelope, key: &SharedKey) -> Result<Vec<u8>, CryptoError> {
    let nonce = Nonce::from_slice(&envelope.nonce);
    key.cipher()
        .decrypt(
            nonce,
            Payload {
                msg: &envelope.ciphertext,
                aad: &envelope.associated_data,
            },
        )
        .map_err(|_| {
            warn!("Envelope failed authentication");
            CryptoError::TagMismatch
        })
}

pub fn decrypt_to_string(envelope: &Envelope, key: &SharedKey) -> Result<String, CryptoError> {
    let bytes = decrypt(envelope, key)?;
    String::from_utf8(bytes).map_err(|_| CryptoError::InvalidUtf8)
}
