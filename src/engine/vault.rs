use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer};

use crate::{Error, Result};

/// AES-GCM nonce size in bytes (96 bits).
const NONCE_SIZE: usize = 12;

/// Encrypts a plaintext string using AES-256-GCM and a 32-byte key.
///
/// Returns a lowercase hex string containing a fresh random nonce followed
/// by the ciphertext and authentication tag.
pub fn encrypt(plaintext: &str, key: &[u8]) -> Result<String> {
    if key.len() != 32 {
        return Err(Error::InvalidKeySize(key.len()));
    }
    let cipher =
        Aes256Gcm::new_from_slice(key).map_err(|_| Error::InvalidKeySize(key.len()))?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext.as_bytes())
        .map_err(|e| Error::Internal(format!("encryption failed: {e}")))?;

    let mut combined = nonce.to_vec();
    combined.extend_from_slice(&ciphertext);
    Ok(hex::encode(combined))
}

/// Decrypts a hex-encoded ciphertext produced by [`encrypt`].
///
/// Authentication failure is reported as a single opaque error; wrong key
/// and tampered data are indistinguishable on purpose.
pub fn decrypt(cipher_hex: &str, key: &[u8]) -> Result<String> {
    if key.len() != 32 {
        return Err(Error::InvalidKeySize(key.len()));
    }
    let combined = hex::decode(cipher_hex).map_err(Error::MalformedHex)?;
    if combined.len() < NONCE_SIZE {
        return Err(Error::CiphertextTooShort);
    }

    let cipher =
        Aes256Gcm::new_from_slice(key).map_err(|_| Error::InvalidKeySize(key.len()))?;
    let (nonce_bytes, ciphertext) = combined.split_at(NONCE_SIZE);
    let nonce = Nonce::from_slice(nonce_bytes);

    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| Error::DecryptionFailed)?;
    String::from_utf8(plaintext).map_err(|e| Error::Internal(format!("invalid utf-8: {e}")))
}

/// Generates a self-signed TLS certificate for the daemon.
///
/// The certificate is ephemeral: a new one is minted at every startup and
/// clients skip verification. It exists for confidentiality on the wire,
/// not for authentication.
pub fn generate_self_signed_cert(
) -> Result<(CertificateDer<'static>, PrivatePkcs8KeyDer<'static>)> {
    let mut params =
        rcgen::CertificateParams::new(vec!["celerix-store".to_string(), "localhost".to_string()])
            .map_err(|e| Error::Tls(e.to_string()))?;
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, "celerix-store");

    let key_pair = rcgen::KeyPair::generate().map_err(|e| Error::Tls(e.to_string()))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| Error::Tls(e.to_string()))?;

    Ok((
        cert.der().clone(),
        PrivatePkcs8KeyDer::from(key_pair.serialize_der()),
    ))
}
