//! AEAD layer: AES-256-GCM keyed per message.
//!
//! Key and nonce come from the message-key expansion, so the nonce is
//! deterministic and each (key, nonce) pair is used exactly once.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};

use crate::crypto::kdf;
use crate::crypto::keys::MessageKey;
use crate::error::{Error, Result};

pub(crate) fn encrypt(message_key: &MessageKey, aad: &[u8], plaintext: &[u8]) -> Vec<u8> {
    let material = kdf::aead_material(message_key);
    let cipher = Aes256Gcm::new_from_slice(material.key.as_ref())
        .expect("derived key is 32 bytes");
    let nonce = Nonce::from_slice(&material.iv[..12]);
    cipher
        .encrypt(nonce, Payload { msg: plaintext, aad })
        .expect("AES-GCM encryption is infallible for in-memory buffers")
}

pub(crate) fn decrypt(message_key: &MessageKey, aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    let material = kdf::aead_material(message_key);
    let cipher = Aes256Gcm::new_from_slice(material.key.as_ref())
        .expect("derived key is 32 bytes");
    let nonce = Nonce::from_slice(&material.iv[..12]);
    cipher
        .decrypt(nonce, Payload { msg: ciphertext, aad })
        .map_err(|_| Error::AuthenticationFailed)
}
