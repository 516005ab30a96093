//! Cryptographic primitives (§4.1)
//!
//! Event signing/verification and NIP-44 conversation encryption are
//! delegated to the `nostr` crate, which implements the NIP-01 canonical
//! id and BIP-340 Schnorr signatures and the NIP-44 v2 envelope. This
//! module adds the at-rest wrapping scheme (§3's key record storage)
//! that NIP-44 doesn't cover: PBKDF2-derived AES-256-GCM encryption of
//! key material, plus the constant-time comparison used for the admin
//! secret (§4.6).

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use hmac::Hmac;
use nostr::prelude::*;
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::{Result, SignetError};

/// Iterations for PBKDF2-HMAC-SHA256 wrapping of key material (§4.1).
pub const PBKDF2_ITERATIONS: u32 = 600_000;
/// Salt length for the wrap key derivation.
pub const SALT_LEN: usize = 16;
/// AES-GCM IV length.
pub const IV_LEN: usize = 12;

/// Ciphertext + IV pair produced by [`aes_gcm_wrap`].
#[derive(Debug, Clone)]
pub struct WrappedSecret {
    pub iv: [u8; IV_LEN],
    pub ciphertext: Vec<u8>,
}

/// Compute the NIP-01 canonical event id and a BIP-340 Schnorr signature
/// over it, returning a fully signed [`Event`].
pub fn sign_event(keys: &Keys, builder: EventBuilder) -> Result<Event> {
    builder
        .sign_with_keys(keys)
        .map_err(|e| SignetError::NostrError(e.to_string()))
}

/// Verify that an event's signature matches its id and pubkey.
pub fn verify_event(event: &Event) -> bool {
    event.verify().is_ok()
}

/// NIP-44 v2 encrypt: derive the conversation key from the ECDH shared
/// x-coordinate, derive per-message keys via HKDF with a random nonce,
/// encrypt with ChaCha20, authenticate with HMAC-SHA256, pad per the
/// NIP-44 rule, and base64-encode `{version, nonce, ciphertext, mac}`.
pub fn nip44_encrypt(sender_priv: &SecretKey, recipient_pub: &PublicKey, plaintext: &str) -> Result<String> {
    nip44::encrypt(sender_priv, recipient_pub, plaintext, nip44::Version::V2)
        .map_err(|_| SignetError::CryptoFailure)
}

/// NIP-44 v2 decrypt. Fails with [`SignetError::InvalidCiphertext`] if the
/// version isn't 2, the MAC doesn't match, or the padding is malformed.
pub fn nip44_decrypt(receiver_priv: &SecretKey, sender_pub: &PublicKey, payload: &str) -> Result<String> {
    nip44::decrypt(receiver_priv, sender_pub, payload).map_err(|_| SignetError::InvalidCiphertext)
}

/// Derive a 32-byte wrap key from `passphrase` via PBKDF2-HMAC-SHA256 with
/// the given salt and [`PBKDF2_ITERATIONS`] rounds.
fn derive_wrap_key(passphrase: &str, salt: &[u8]) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2::pbkdf2::<Hmac<Sha256>>(passphrase.as_bytes(), salt, PBKDF2_ITERATIONS, &mut key)
        .expect("32-byte output is always a valid PBKDF2 length");
    key
}

/// Encrypt `plaintext` (the raw 32-byte secret key) under a passphrase-derived
/// key. Returns the salt, a random IV, and the ciphertext with the GCM tag
/// appended.
pub fn aes_gcm_wrap(passphrase: &str, plaintext: &[u8]) -> Result<(Vec<u8>, WrappedSecret)> {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    let key_bytes = derive_wrap_key(passphrase, &salt);

    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
    let nonce = Nonce::from_slice(&iv);
    let ciphertext = cipher
        .encrypt(nonce, Payload { msg: plaintext, aad: &[] })
        .map_err(|_| SignetError::CryptoFailure)?;

    Ok((salt.to_vec(), WrappedSecret { iv, ciphertext }))
}

/// Undo [`aes_gcm_wrap`]. Fails with [`SignetError::InvalidPassphrase`] on a
/// GCM tag mismatch (wrong passphrase or corrupted record).
pub fn aes_gcm_unwrap(passphrase: &str, salt: &[u8], wrapped: &WrappedSecret) -> Result<Vec<u8>> {
    let key_bytes = derive_wrap_key(passphrase, salt);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
    let nonce = Nonce::from_slice(&wrapped.iv);
    cipher
        .decrypt(nonce, Payload { msg: &wrapped.ciphertext, aad: &[] })
        .map_err(|_| SignetError::InvalidPassphrase)
}

/// Constant-time byte comparison, used for admin-secret validation (§4.6)
/// so that timing doesn't leak how many leading bytes matched.
pub fn timing_safe_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_unwrap_roundtrip() {
        let secret = [7u8; 32];
        let (salt, wrapped) = aes_gcm_wrap("hunter2", &secret).unwrap();
        let recovered = aes_gcm_unwrap("hunter2", &salt, &wrapped).unwrap();
        assert_eq!(recovered, secret);
    }

    #[test]
    fn unwrap_wrong_passphrase_fails() {
        let secret = [7u8; 32];
        let (salt, wrapped) = aes_gcm_wrap("hunter2", &secret).unwrap();
        let err = aes_gcm_unwrap("wrong", &salt, &wrapped).unwrap_err();
        assert!(matches!(err, SignetError::InvalidPassphrase));
    }

    #[test]
    fn timing_safe_eq_matches() {
        assert!(timing_safe_eq(b"abc123", b"abc123"));
        assert!(!timing_safe_eq(b"abc123", b"abc124"));
        assert!(!timing_safe_eq(b"short", b"longer-string"));
    }

    #[test]
    fn nip44_roundtrip() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let ciphertext = nip44_encrypt(alice.secret_key(), &bob.public_key(), "gm").unwrap();
        let plaintext = nip44_decrypt(bob.secret_key(), &alice.public_key(), &ciphertext).unwrap();
        assert_eq!(plaintext, "gm");
    }

    #[test]
    fn nip44_decrypt_rejects_garbage() {
        let bob = Keys::generate();
        let alice = Keys::generate();
        let err = nip44_decrypt(bob.secret_key(), &alice.public_key(), "not-base64-payload!!").unwrap_err();
        assert!(matches!(err, SignetError::InvalidCiphertext));
    }
}
