//! Signed boot file URLs.
//!
//! Booter file ids must not appear on the wire unsigned, so the HTTP file
//! endpoint only accepts ids wrapped in an authenticated-encryption envelope:
//! `base64-urlsafe(nonce || seal(id, nonce, key))`. The key is generated
//! fresh for every serve, so signed URLs never outlive the process.
//!
//! XChaCha20-Poly1305 is authenticated encryption. In theory symmetric
//! authentication alone would do, but a sealed box is simple to use and hard
//! to get wrong, and the overhead is trivial at this payload size.

use base64::prelude::*;
use chacha20poly1305::aead::{Aead, OsRng};
use chacha20poly1305::{AeadCore, KeyInit, XChaCha20Poly1305, XNonce};

use crate::booter::FileId;
use crate::error::BootError;

/// Key for signing boot file URLs, generated per serve.
pub type SigningKey = [u8; 32];

const NONCE_LEN: usize = 24;
const TAG_LEN: usize = 16;

/// Generate a fresh signing key.
pub fn generate_key() -> SigningKey {
    XChaCha20Poly1305::generate_key(&mut OsRng).into()
}

/// Seal a file id into an opaque, tamper-evident URL component.
pub fn sign_id(id: &FileId, key: &SigningKey) -> Result<String, BootError> {
    let cipher = XChaCha20Poly1305::new(key.into());
    let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);

    let mut out = nonce.to_vec();
    let sealed = cipher
        .encrypt(&nonce, id.as_str().as_bytes())
        .map_err(|_| BootError::Io(std::io::Error::other("sealing boot file id failed")))?;
    out.extend_from_slice(&sealed);

    Ok(BASE64_URL_SAFE.encode(out))
}

/// Recover the file id from a signed URL component.
///
/// Fails with [`BootError::SignatureInvalid`] on any tampering, truncation,
/// or key mismatch.
pub fn open_id(signed: &str, key: &SigningKey) -> Result<FileId, BootError> {
    let blob = BASE64_URL_SAFE
        .decode(signed)
        .map_err(|_| BootError::SignatureInvalid)?;
    if blob.len() < NONCE_LEN + TAG_LEN {
        return Err(BootError::SignatureInvalid);
    }

    let cipher = XChaCha20Poly1305::new(key.into());
    let nonce = XNonce::from_slice(&blob[..NONCE_LEN]);
    let plain = cipher
        .decrypt(nonce, &blob[NONCE_LEN..])
        .map_err(|_| BootError::SignatureInvalid)?;

    let id = String::from_utf8(plain).map_err(|_| BootError::SignatureInvalid)?;
    Ok(FileId::from(id))
}
