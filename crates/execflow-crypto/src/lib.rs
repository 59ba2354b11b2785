pub mod envelope;
pub mod key;

pub use envelope::{decrypt, decrypt_to_string, encrypt, Envelope, WireEnvelope, NONCE_LEN};
pub use key::{SharedKey, KEY_LEN};
