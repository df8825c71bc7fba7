use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use sha2::Sha256;
use std::io::Read;
use std::path::Path;
use thiserror::Error;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type Aes192CbcEnc = cbc::Encryptor<aes::Aes192>;
type Aes192CbcDec = cbc::Decryptor<aes::Aes192>;

#[derive(Debug, Error)]
#[error("decrypt failed: {0}")]
pub struct DecryptError(pub String);

/// HMAC-SHA256 of `msg` under `key`.
pub fn hmac_sha256(key: &[u8], msg: &[u8]) -> [u8; 32] {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(msg);
    mac.finalize().into_bytes().into()
}

/// Base64 (standard alphabet, padded) encode.
pub fn b64_encode(data: &[u8]) -> String {
    BASE64.encode(data)
}

/// Base64 (standard alphabet, padded) decode.
pub fn b64_decode(data: &str) -> Result<Vec<u8>, DecryptError> {
    BASE64
        .decode(data.trim())
        .map_err(|e| DecryptError(format!("base64: {e}")))
}

// Key/IV derivation shared by the platform's payload ciphers: the IV is
// always the first 16 bytes of the secret; `partial_secret` selects
// 128-bit keying (first 16 bytes), otherwise the key is 192-bit (first
// 24 bytes). Short secrets are zero-padded.
fn derive_key_iv(secret: &str, partial_secret: bool) -> (Vec<u8>, [u8; 16]) {
    let bytes = secret.as_bytes();
    let key_len = if partial_secret { 16 } else { 24 };
    let mut key = vec![0u8; key_len];
    let n = bytes.len().min(key_len);
    key[..n].copy_from_slice(&bytes[..n]);

    let mut iv = [0u8; 16];
    let n = bytes.len().min(16);
    iv[..n].copy_from_slice(&bytes[..n]);
    (key, iv)
}

/// AES-CBC encrypt with PKCS7 padding, keyed from `secret` as the
/// platform derives it.
pub fn aes_cbc_encrypt(plain: &[u8], secret: &str, partial_secret: bool) -> Vec<u8> {
    let (key, iv) = derive_key_iv(secret, partial_secret);
    if partial_secret {
        Aes128CbcEnc::new_from_slices(&key, &iv)
            .expect("derived key/iv are correctly sized")
            .encrypt_padded_vec_mut::<Pkcs7>(plain)
    } else {
        Aes192CbcEnc::new_from_slices(&key, &iv)
            .expect("derived key/iv are correctly sized")
            .encrypt_padded_vec_mut::<Pkcs7>(plain)
    }
}

/// AES-CBC decrypt with PKCS7 padding, keyed from `secret`.
pub fn aes_cbc_decrypt(
    cipher: &[u8],
    secret: &str,
    partial_secret: bool,
) -> Result<Vec<u8>, DecryptError> {
    let (key, iv) = derive_key_iv(secret, partial_secret);
    let plain = if partial_secret {
        Aes128CbcDec::new_from_slices(&key, &iv)
            .expect("derived key/iv are correctly sized")
            .decrypt_padded_vec_mut::<Pkcs7>(cipher)
    } else {
        Aes192CbcDec::new_from_slices(&key, &iv)
            .expect("derived key/iv are correctly sized")
            .decrypt_padded_vec_mut::<Pkcs7>(cipher)
    };
    plain.map_err(|e| DecryptError(format!("aes-cbc: {e}")))
}

/// Decode a base64 ciphertext the platform produced (registration
/// secrets, OTA URLs): base64 → AES-CBC → right-trim control bytes.
pub fn aes_decode_string(
    secret: &str,
    encoded: &str,
    partial_secret: bool,
) -> Result<String, DecryptError> {
    let cipher = b64_decode(encoded)?;
    let mut plain = aes_cbc_decrypt(&cipher, secret, partial_secret)?;
    while let Some(&last) = plain.last() {
        if last <= 0x20 {
            plain.pop();
        } else {
            break;
        }
    }
    String::from_utf8(plain).map_err(|e| DecryptError(format!("utf-8: {e}")))
}

/// Lowercase hex MD5 of a byte slice.
pub fn md5_hex(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Lowercase hex MD5 of a file, read in 1 KiB blocks.
pub fn md5_file_hex(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Md5::new();
    let mut buf = [0u8; 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
