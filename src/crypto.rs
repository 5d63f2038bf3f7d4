//! Authenticated symmetric primitives for the bench↔lab link
//!
//! AES-256-CBC with PKCS#7 padding for confidentiality, HMAC-SHA256 for
//! authenticity. Both keys are independent 32-byte values, provisioned as
//! 64-char hex strings in the bench configuration.
//!
//! - `encrypt` prefixes a fresh random 16-byte IV; the same plaintext never
//!   produces the same ciphertext twice.
//! - `verify` uses the MAC implementation's constant-time comparison; the
//!   tag is never compared with `==`.
//!
//! The primitives are pure and stateless; framing, sequence numbers and
//! replay protection live in [`crate::protocol`].

#![forbid(unsafe_code)]

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type HmacSha256 = Hmac<Sha256>;

/// AES block / IV size in bytes.
pub const IV_LEN: usize = 16;
/// HMAC-SHA256 tag size in bytes.
pub const TAG_LEN: usize = 32;
/// Key size in bytes for both AES-256 and HMAC-SHA256.
pub const KEY_LEN: usize = 32;

/// Failures in the crypto primitives.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("key must be {KEY_LEN} bytes, got {0}")]
    BadKeyLength(usize),
    #[error("encrypted input too short: {0} bytes")]
    TooShort(usize),
    #[error("decryption failed (bad padding or corrupted ciphertext)")]
    DecryptFailed,
}

fn check_key(key: &[u8]) -> Result<(), CryptoError> {
    if key.len() != KEY_LEN {
        return Err(CryptoError::BadKeyLength(key.len()));
    }
    Ok(())
}

/// Encrypt `plaintext` with AES-256-CBC under `key`.
///
/// Returns `IV (16 bytes) ‖ ciphertext` with PKCS#7 padding, IV drawn from
/// the OS RNG per call.
pub fn encrypt(plaintext: &[u8], key: &[u8]) -> Result<Vec<u8>, CryptoError> {
    check_key(key)?;
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);

    let cipher = Aes256CbcEnc::new_from_slices(key, &iv)
        .map_err(|_| CryptoError::BadKeyLength(key.len()))?;
    let ct = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let mut out = Vec::with_capacity(IV_LEN + ct.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ct);
    Ok(out)
}

/// Decrypt an IV-prefixed AES-256-CBC message produced by [`encrypt`].
pub fn decrypt(encrypted: &[u8], key: &[u8]) -> Result<Vec<u8>, CryptoError> {
    check_key(key)?;
    // 16-byte IV plus at least one cipher block.
    if encrypted.len() < IV_LEN * 2 {
        return Err(CryptoError::TooShort(encrypted.len()));
    }
    let (iv, ct) = encrypted.split_at(IV_LEN);
    if ct.len() % IV_LEN != 0 {
        return Err(CryptoError::DecryptFailed);
    }
    let cipher = Aes256CbcDec::new_from_slices(key, iv)
        .map_err(|_| CryptoError::BadKeyLength(key.len()))?;
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(ct)
        .map_err(|_| CryptoError::DecryptFailed)
}

/// Compute a 32-byte HMAC-SHA256 tag over `data`.
pub fn sign(data: &[u8], key: &[u8]) -> Result<[u8; TAG_LEN], CryptoError> {
    check_key(key)?;
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| CryptoError::BadKeyLength(key.len()))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

/// Verify a tag produced by [`sign`]. Constant-time comparison.
pub fn verify(data: &[u8], tag: &[u8], key: &[u8]) -> Result<bool, CryptoError> {
    check_key(key)?;
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| CryptoError::BadKeyLength(key.len()))?;
    mac.update(data);
    Ok(mac.verify_slice(tag).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    const AES_KEY: [u8; 32] = [0xa1; 32];
    const HMAC_KEY: [u8; 32] = [0xf1; 32];

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let plaintext = b"calibration bench secure link";
        let enc = encrypt(plaintext, &AES_KEY).unwrap();
        let dec = decrypt(&enc, &AES_KEY).unwrap();
        assert_eq!(dec, plaintext);
    }

    #[test]
    fn fresh_iv_per_encryption() {
        let plaintext = b"same message";
        let a = encrypt(plaintext, &AES_KEY).unwrap();
        let b = encrypt(plaintext, &AES_KEY).unwrap();
        assert_ne!(a, b);
        assert_ne!(&a[..IV_LEN], &b[..IV_LEN]);
    }

    #[test]
    fn decrypt_wrong_key_fails() {
        let enc = encrypt(b"secret", &AES_KEY).unwrap();
        let wrong = [0u8; 32];
        assert!(decrypt(&enc, &wrong).is_err());
    }

    #[test]
    fn decrypt_short_input_fails() {
        assert!(matches!(
            decrypt(&[0u8; 16], &AES_KEY),
            Err(CryptoError::TooShort(16))
        ));
    }

    #[test]
    fn bad_key_length_rejected() {
        assert!(matches!(
            encrypt(b"x", &[0u8; 16]),
            Err(CryptoError::BadKeyLength(16))
        ));
    }

    #[test]
    fn mac_sign_and_verify() {
        let data = b"header and ciphertext";
        let tag = sign(data, &HMAC_KEY).unwrap();
        assert_eq!(tag.len(), TAG_LEN);
        assert!(verify(data, &tag, &HMAC_KEY).unwrap());
    }

    #[test]
    fn tampered_data_or_tag_fails_verification() {
        let data = b"authentic payload";
        let tag = sign(data, &HMAC_KEY).unwrap();
        assert!(!verify(b"authentic payloaD", &tag, &HMAC_KEY).unwrap());

        let mut bad_tag = tag;
        bad_tag[0] ^= 0x01;
        assert!(!verify(data, &bad_tag, &HMAC_KEY).unwrap());
    }
}
