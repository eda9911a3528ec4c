//! Data stream crypto session: HKDF-SHA-512 key derivation plus
//! ChaCha20-Poly1305 with monotonically increasing counter nonces.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use chacha20poly1305::aead::AeadInPlace;
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce, Tag};
use hkdf::Hkdf;
use sha2::Sha512;

use super::Error;

// Contexts are named from the accessory's point of view: "Read" is what the
// controller reads, i.e. our send direction.
const ACCESSORY_TO_CONTROLLER_INFO: &[u8] = b"HDS-Read-Encryption-Key";
const CONTROLLER_TO_ACCESSORY_INFO: &[u8] = b"HDS-Write-Encryption-Key";

pub struct HdsSession {
    encrypt_key: [u8; 32],
    decrypt_key: [u8; 32],
    encrypt_count: u64,
    decrypt_count: u64,
}

impl HdsSession {
    /// Derives the two direction keys from the pair-verify shared key and the
    /// concatenated salts. Counters start at zero and are never reset.
    pub fn new(
        controller_key_salt: &[u8],
        accessory_key_salt: &[u8],
        shared_key: &[u8; 32],
    ) -> Result<Self, Error> {
        let mut salt = Vec::with_capacity(controller_key_salt.len() + accessory_key_salt.len());
        salt.extend_from_slice(controller_key_salt);
        salt.extend_from_slice(accessory_key_salt);

        Ok(Self {
            encrypt_key: derive_key(shared_key, &salt, ACCESSORY_TO_CONTROLLER_INFO)?,
            decrypt_key: derive_key(shared_key, &salt, CONTROLLER_TO_ACCESSORY_INFO)?,
            encrypt_count: 0,
            decrypt_count: 0,
        })
    }

    pub fn encrypt(&mut self, plaintext: &[u8], aad: &[u8]) -> Result<(Vec<u8>, [u8; 16]), Error> {
        let nonce = nonce_for(self.encrypt_count);
        self.encrypt_count = self
            .encrypt_count
            .checked_add(1)
            .ok_or(Error::NonceExhausted)?;

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.encrypt_key));
        let mut buf = plaintext.to_vec();
        let tag = cipher
            .encrypt_in_place_detached(Nonce::from_slice(&nonce), aad, &mut buf)
            .map_err(|_| Error::Crypto)?;

        Ok((buf, tag.into()))
    }

    pub fn decrypt(
        &mut self,
        ciphertext: &[u8],
        auth_tag: &[u8; 16],
        aad: &[u8],
    ) -> Result<Vec<u8>, Error> {
        let nonce = nonce_for(self.decrypt_count);
        self.decrypt_count = self
            .decrypt_count
            .checked_add(1)
            .ok_or(Error::NonceExhausted)?;

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.decrypt_key));
        let mut buf = ciphertext.to_vec();
        cipher
            .decrypt_in_place_detached(
                Nonce::from_slice(&nonce),
                aad,
                &mut buf,
                Tag::from_slice(auth_tag),
            )
            .map_err(|_| Error::Crypto)?;

        Ok(buf)
    }

    #[cfg(test)]
    pub fn set_send_counter(&mut self, value: u64) {
        self.encrypt_count = value;
    }

    /// The controller's view of the same session, for tests: directions and
    /// counters swap.
    #[cfg(test)]
    pub fn swapped(self) -> Self {
        Self {
            encrypt_key: self.decrypt_key,
            decrypt_key: self.encrypt_key,
            encrypt_count: self.decrypt_count,
            decrypt_count: self.encrypt_count,
        }
    }
}

/// The 64-bit counter forms the low bytes of the 96-bit IETF nonce.
fn nonce_for(count: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&count.to_le_bytes());
    nonce
}

fn derive_key(ikm: &[u8], salt: &[u8], info: &[u8]) -> Result<[u8; 32], Error> {
    let hk = Hkdf::<Sha512>::new(Some(salt), ikm);
    let mut okm = [0u8; 32];
    hk.expand(info, &mut okm).map_err(|_| Error::Crypto)?;
    Ok(okm)
}
