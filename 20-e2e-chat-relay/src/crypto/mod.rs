//! End-to-end encryption for chat clients.
//!
//! Key material lives on a dedicated worker thread ([`worker`]). The rest of
//! the client talks to it only through [`CryptoClient`], which correlates
//! requests and responses by id.

pub mod engine;
pub mod worker;

use thiserror::Error;

pub use worker::{CryptoClient, RequestId};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("public key is not a valid x25519 key")]
    InvalidKey,
    #[error("ciphertext is not a valid sealed message")]
    MalformedCiphertext,
    #[error("encryption failed")]
    Encryption,
    #[error("decryption failed")]
    Decryption,
    #[error("key derivation failed")]
    KeyDerivation,
    #[error("no keypair has been generated yet")]
    NoKeypair,
    #[error("crypto worker is not running")]
    WorkerUnavailable,
    #[error("crypto worker answered request {0} with the wrong reply")]
    UnexpectedReply(RequestId),
}
