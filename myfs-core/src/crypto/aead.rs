//! Authenticated encryption for payloads, tables, and wrapped keys.
//!
//! Every sealed segment is framed as `nonce(12) || ciphertext || tag(16)`
//! with a fresh random nonce. Associated data binds each ciphertext to its
//! logical role so a segment cannot be replayed in another position.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};

use crate::error::{MyfsError, MyfsResult};
use crate::format::{KEY_SIZE, NONCE_SIZE, SEAL_OVERHEAD};

use super::random_bytes;

/// Builds the associated data for a sealed segment: a role label followed by
/// optional context bytes (volume id or entry salt).
#[must_use]
pub fn role_aad(label: &[u8], context: &[u8]) -> Vec<u8> {
    let mut aad = Vec::with_capacity(label.len() + context.len());
    aad.extend_from_slice(label);
    aad.extend_from_slice(context);
    aad
}

/// Seals a plaintext under a 256-bit key, returning the framed blob.
///
/// # Errors
///
/// Returns an I/O-kind error on cipher failure; with well-formed inputs the
/// cipher cannot fail.
pub fn seal(key: &[u8; KEY_SIZE], aad: &[u8], plaintext: &[u8]) -> MyfsResult<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new_from_slice(key).expect("key length is always 32");
    let nonce_bytes: [u8; NONCE_SIZE] = random_bytes();
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(
            nonce,
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| MyfsError::io("sealing segment", std::io::Error::other("aead failure")))?;

    let mut framed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    framed.extend_from_slice(&nonce_bytes);
    framed.extend_from_slice(&ciphertext);
    Ok(framed)
}

/// Opens a framed blob sealed by [`seal`].
///
/// # Errors
///
/// Returns [`MyfsError::AuthFailed`] on any failure; a wrong key and a
/// tampered blob are indistinguishable at this boundary.
pub fn open(key: &[u8; KEY_SIZE], aad: &[u8], framed: &[u8]) -> MyfsResult<Vec<u8>> {
    if framed.len() < SEAL_OVERHEAD {
        return Err(MyfsError::AuthFailed);
    }
    let cipher = ChaCha20Poly1305::new_from_slice(key).expect("key length is always 32");
    let nonce = Nonce::from_slice(&framed[..NONCE_SIZE]);

    cipher
        .decrypt(
            nonce,
            Payload {
                msg: &framed[NONCE_SIZE..],
                aad,
            },
        )
        .map_err(|_| MyfsError::AuthFailed)
}

/// Seals with an explicit nonce. Used only for the header tag, whose nonce
/// is stored in a dedicated header field.
///
/// # Errors
///
/// Returns an I/O-kind error on cipher failure.
pub fn seal_with_nonce(
    key: &[u8; KEY_SIZE],
    nonce_bytes: &[u8; NONCE_SIZE],
    aad: &[u8],
    plaintext: &[u8],
) -> MyfsResult<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new_from_slice(key).expect("key length is always 32");
    cipher
        .encrypt(
            Nonce::from_slice(nonce_bytes),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| MyfsError::io("sealing header tag", std::io::Error::other("aead failure")))
}

/// Opens a segment sealed by [`seal_with_nonce`].
///
/// # Errors
///
/// Returns [`MyfsError::AuthFailed`] on any failure.
pub fn open_with_nonce(
    key: &[u8; KEY_SIZE],
    nonce_bytes: &[u8; NONCE_SIZE],
    aad: &[u8],
    ciphertext: &[u8],
) -> MyfsResult<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new_from_slice(key).expect("key length is always 32");
    cipher
        .decrypt(
            Nonce::from_slice(nonce_bytes),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| MyfsError::AuthFailed)
}
