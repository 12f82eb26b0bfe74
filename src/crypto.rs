/*!
Crypto things
*/
use ring::aead::BoundKey;

use crate::{se, CONFIG};

/// An encrypted value and the nonce it was sealed with,
/// both hex encoded so they can live in a cookie or a column.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct Enc {
    pub value: String,
    pub nonce: String,
}

/// Encrypt `s` with the application key, generating a fresh nonce.
pub fn encrypt(s: &str) -> crate::Result<Enc> {
    let nonce = new_nonce()?;
    let sealed = encrypt_bytes(s.as_bytes(), &nonce, CONFIG.enc_key.as_bytes())?;
    Ok(Enc {
        value: hex::encode(&sealed),
        nonce: hex::encode(&nonce),
    })
}

/// Decrypt an `Enc` produced by `encrypt` back to the original string.
pub fn decrypt(enc: &Enc) -> crate::Result<String> {
    let nonce = hex::decode(&enc.nonce).map_err(|e| se!("nonce hex decode error {}", e))?;
    let mut value = hex::decode(&enc.value).map_err(|e| se!("value hex decode error {}", e))?;
    let opened = decrypt_bytes(value.as_mut_slice(), &nonce, CONFIG.enc_key.as_bytes())?;
    String::from_utf8(opened.to_vec()).map_err(|e| se!("decrypted value is not utf8 {}", e))
}

/// ring requires an implementor of `NonceSequence`,
/// which if a wrapping trait around `ring::aead::Nonce`.
/// We have to make a wrapper that can pass ownership
/// of the nonce exactly once.
struct OneNonceSequence {
    inner: Option<ring::aead::Nonce>,
}
impl OneNonceSequence {
    fn new(inner: ring::aead::Nonce) -> Self {
        Self { inner: Some(inner) }
    }
}

impl ring::aead::NonceSequence for OneNonceSequence {
    fn advance(&mut self) -> std::result::Result<ring::aead::Nonce, ring::error::Unspecified> {
        self.inner.take().ok_or(ring::error::Unspecified)
    }
}

/// Return a `Vec` of secure random bytes of size `n`
fn rand_bytes(n: usize) -> crate::Result<Vec<u8>> {
    use ring::rand::SecureRandom;
    let mut buf = vec![0; n];
    let sysrand = ring::rand::SystemRandom::new();
    sysrand
        .fill(&mut buf)
        .map_err(|_| se!("error getting random bytes"))?;
    Ok(buf)
}

fn new_nonce() -> crate::Result<Vec<u8>> {
    rand_bytes(12)
}

/// Encrypt `bytes` with the given `nonce` and `pass`
///
/// `bytes` are encrypted using AES_256_GCM, `nonce` is expected to be
/// 12-bytes, and `pass` 32-bytes
fn encrypt_bytes(bytes: &[u8], nonce: &[u8], pass: &[u8]) -> crate::Result<Vec<u8>> {
    let alg = &ring::aead::AES_256_GCM;
    let nonce = ring::aead::Nonce::try_assume_unique_for_key(nonce)
        .map_err(|_| se!("encryption nonce not unique"))?;
    let nonce = OneNonceSequence::new(nonce);
    let key =
        ring::aead::UnboundKey::new(alg, pass).map_err(|_| se!("error building sealing key"))?;
    let mut key = ring::aead::SealingKey::new(key, nonce);
    let mut in_out = bytes.to_vec();
    key.seal_in_place_append_tag(ring::aead::Aad::empty(), &mut in_out)
        .map_err(|_| se!("failed encrypting bytes"))?;
    Ok(in_out)
}

/// Decrypt `bytes` with the given `nonce` and `pass`
///
/// `bytes` are decrypted using AES_256_GCM, `nonce` is expected to be
/// 12-bytes, and `pass` 32-bytes
fn decrypt_bytes<'a>(bytes: &'a mut [u8], nonce: &[u8], pass: &[u8]) -> crate::Result<&'a [u8]> {
    let alg = &ring::aead::AES_256_GCM;
    let nonce = ring::aead::Nonce::try_assume_unique_for_key(nonce)
        .map_err(|_| se!("decryption nonce not unique"))?;
    let nonce = OneNonceSequence::new(nonce);
    let key =
        ring::aead::UnboundKey::new(alg, pass).map_err(|_| se!("error building opening key"))?;
    let mut key = ring::aead::OpeningKey::new(key, nonce);
    let out_slice = key
        .open_in_place(ring::aead::Aad::empty(), bytes)
        .map_err(|_| se!("failed decrypting bytes"))?;
    Ok(out_slice)
}
