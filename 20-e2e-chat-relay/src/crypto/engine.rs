//! X25519 sealed-box encryption.
//!
//! Each message gets a fresh ephemeral key. The symmetric key is derived
//! with HKDF-SHA256 from the X25519 shared secret, salted with both public
//! keys, and the text is sealed with ChaCha20-Poly1305.
//!
//! Ciphertext blob: `base64(ephemeral_public || nonce || sealed)`.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce, aead::Aead};
use hkdf::Hkdf;
use rand::{RngCore, rngs::OsRng};
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey, StaticSecret};

use super::CryptoError;
use crate::message::PublicKey;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KDF_INFO: &[u8] = b"e2e-chat-relay-message-v1";

pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519PublicKey::from(&secret);
        Self {
            secret,
            public: PublicKey::new(STANDARD.encode(public.as_bytes())),
        }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn decrypt(&self, ciphertext: &str) -> Result<String, CryptoError> {
        let blob = STANDARD
            .decode(ciphertext)
            .map_err(|_| CryptoError::MalformedCiphertext)?;
        if blob.len() < KEY_LEN + NONCE_LEN + TAG_LEN {
            return Err(CryptoError::MalformedCiphertext);
        }

        let (ephemeral, rest) = blob.split_at(KEY_LEN);
        let (nonce, sealed) = rest.split_at(NONCE_LEN);
        let ephemeral = X25519PublicKey::from(to_key_bytes(ephemeral)?);
        let own = X25519PublicKey::from(&self.secret);

        let shared = self.secret.diffie_hellman(&ephemeral);
        let cipher = derive_cipher(shared.as_bytes(), &ephemeral, &own)?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| CryptoError::Decryption)?;

        String::from_utf8(plaintext).map_err(|_| CryptoError::Decryption)
    }
}

pub fn encrypt(text: &str, recipient: &PublicKey) -> Result<String, CryptoError> {
    let recipient = parse_public_key(recipient)?;
    let ephemeral_secret = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral = X25519PublicKey::from(&ephemeral_secret);

    let shared = ephemeral_secret.diffie_hellman(&recipient);
    let cipher = derive_cipher(shared.as_bytes(), &ephemeral, &recipient)?;

    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let sealed = cipher
        .encrypt(Nonce::from_slice(&nonce), text.as_bytes())
        .map_err(|_| CryptoError::Encryption)?;

    let mut blob = Vec::with_capacity(KEY_LEN + NONCE_LEN + sealed.len());
    blob.extend_from_slice(ephemeral.as_bytes());
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&sealed);
    Ok(STANDARD.encode(blob))
}

fn parse_public_key(key: &PublicKey) -> Result<X25519PublicKey, CryptoError> {
    let bytes = STANDARD
        .decode(key.as_str())
        .map_err(|_| CryptoError::InvalidKey)?;
    Ok(X25519PublicKey::from(to_key_bytes(&bytes)?))
}

fn to_key_bytes(bytes: &[u8]) -> Result<[u8; KEY_LEN], CryptoError> {
    bytes.try_into().map_err(|_| CryptoError::InvalidKey)
}

fn derive_cipher(
    shared: &[u8],
    ephemeral: &X25519PublicKey,
    recipient: &X25519PublicKey,
) -> Result<ChaCha20Poly1305, CryptoError> {
    let mut salt = [0u8; KEY_LEN * 2];
    salt[..KEY_LEN].copy_from_slice(ephemeral.as_bytes());
    salt[KEY_LEN..].copy_from_slice(recipient.as_bytes());

    let hk = Hkdf::<Sha256>::new(Some(&salt[..]), shared);
    let mut key = [0u8; KEY_LEN];
    hk.expand(KDF_INFO, &mut key)
        .map_err(|_| CryptoError::KeyDerivation)?;
    Ok(ChaCha20Poly1305::new(Key::from_slice(&key)))
}
