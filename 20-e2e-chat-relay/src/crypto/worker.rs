//! Crypto worker thread and the handle used to talk to it.
//!
//! The worker owns the keypair and executes one request at a time. Callers
//! never touch key material; they post a request tagged with the next id
//! from a per-client counter and await the matching response. A router task
//! resolves each pending request exactly once and forgets it.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    thread,
};

use anyhow::{Context, Result};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::{
    CryptoError,
    engine::{self, KeyPair},
};
use crate::message::PublicKey;

pub type RequestId = u64;

#[derive(Debug)]
enum Operation {
    GenerateKeys,
    Encrypt { text: String, recipient: PublicKey },
    Decrypt { ciphertext: String },
}

#[derive(Debug)]
enum Reply {
    Keys(PublicKey),
    Ciphertext(String),
    Plaintext(String),
}

type Outcome = Result<Reply, CryptoError>;

struct Request {
    id: RequestId,
    operation: Operation,
}

struct Response {
    id: RequestId,
    outcome: Outcome,
}

type PendingRequests = Arc<Mutex<HashMap<RequestId, oneshot::Sender<Outcome>>>>;

/// Cloneable handle to the crypto worker. Clones share one id counter.
#[derive(Clone)]
pub struct CryptoClient {
    requests: mpsc::UnboundedSender<Request>,
    pending: PendingRequests,
    next_id: Arc<AtomicU64>,
}

impl CryptoClient {
    /// Starts the worker thread and the response router.
    ///
    /// Must be called from within a Tokio runtime. The worker stops once
    /// every clone of the handle has been dropped.
    pub fn spawn() -> Result<Self> {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (response_tx, response_rx) = mpsc::unbounded_channel();

        thread::Builder::new()
            .name("crypto-worker".to_string())
            .spawn(move || run_worker(request_rx, response_tx))
            .context("failed to spawn crypto worker")?;

        let pending = PendingRequests::default();
        tokio::spawn(route_responses(response_rx, Arc::clone(&pending)));

        Ok(Self {
            requests: request_tx,
            pending,
            next_id: Arc::new(AtomicU64::new(1)),
        })
    }

    /// Generates a fresh keypair, replacing any previous one.
    pub async fn generate_keys(&self) -> Result<PublicKey, CryptoError> {
        match self.request(Operation::GenerateKeys).await? {
            (_, Reply::Keys(key)) => Ok(key),
            (id, _) => Err(CryptoError::UnexpectedReply(id)),
        }
    }

    pub async fn encrypt(&self, text: String, recipient: PublicKey) -> Result<String, CryptoError> {
        match self.request(Operation::Encrypt { text, recipient }).await? {
            (_, Reply::Ciphertext(ciphertext)) => Ok(ciphertext),
            (id, _) => Err(CryptoError::UnexpectedReply(id)),
        }
    }

    pub async fn decrypt(&self, ciphertext: String) -> Result<String, CryptoError> {
        match self.request(Operation::Decrypt { ciphertext }).await? {
            (_, Reply::Plaintext(text)) => Ok(text),
            (id, _) => Err(CryptoError::UnexpectedReply(id)),
        }
    }

    /// Number of requests still waiting for the worker.
    pub fn in_flight(&self) -> usize {
        lock(&self.pending).len()
    }

    async fn request(&self, operation: Operation) -> Result<(RequestId, Reply), CryptoError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        lock(&self.pending).insert(id, reply_tx);

        if self.requests.send(Request { id, operation }).is_err() {
            lock(&self.pending).remove(&id);
            return Err(CryptoError::WorkerUnavailable);
        }

        let reply = reply_rx
            .await
            .map_err(|_| CryptoError::WorkerUnavailable)??;
        Ok((id, reply))
    }
}

fn lock(
    pending: &PendingRequests,
) -> MutexGuard<'_, HashMap<RequestId, oneshot::Sender<Outcome>>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

fn run_worker(
    mut requests: mpsc::UnboundedReceiver<Request>,
    responses: mpsc::UnboundedSender<Response>,
) {
    let mut keys = None;
    while let Some(Request { id, operation }) = requests.blocking_recv() {
        let outcome = execute(&mut keys, operation);
        if responses.send(Response { id, outcome }).is_err() {
            break;
        }
    }
    debug!("crypto worker stopped");
}

fn execute(keys: &mut Option<KeyPair>, operation: Operation) -> Outcome {
    match operation {
        Operation::GenerateKeys => {
            let pair = KeyPair::generate();
            let public = pair.public_key().clone();
            *keys = Some(pair);
            Ok(Reply::Keys(public))
        }
        Operation::Encrypt { text, recipient } => {
            engine::encrypt(&text, &recipient).map(Reply::Ciphertext)
        }
        Operation::Decrypt { ciphertext } => keys
            .as_ref()
            .ok_or(CryptoError::NoKeypair)?
            .decrypt(&ciphertext)
            .map(Reply::Plaintext),
    }
}

async fn route_responses(
    mut responses: mpsc::UnboundedReceiver<Response>,
    pending: PendingRequests,
) {
    while let Some(Response { id, outcome }) = responses.recv().await {
        let waiter = lock(&pending).remove(&id);
        match waiter {
            // A closed receiver means the caller stopped waiting.
            Some(waiter) => {
                let _ = waiter.send(outcome);
            }
            None => warn!(id, "crypto response without a pending request"),
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::future::join_all;

    use super::*;

    #[tokio::test]
    async fn worker_round_trips_text() {
        let crypto = CryptoClient::spawn().expect("spawn worker");
        let key = crypto.generate_keys().await.expect("keys");

        let ciphertext = crypto
            .encrypt("hi".into(), key.clone())
            .await
            .expect("encrypt");
        assert_ne!(ciphertext, "hi");
        assert_eq!(crypto.decrypt(ciphertext).await.expect("decrypt"), "hi");
        assert_eq!(crypto.in_flight(), 0);
    }

    #[tokio::test]
    async fn decrypt_needs_a_keypair() {
        let crypto = CryptoClient::spawn().expect("spawn worker");
        let result = crypto.decrypt("AAAA".into()).await;
        assert_eq!(result, Err(CryptoError::NoKeypair));
    }

    #[tokio::test]
    async fn concurrent_requests_resolve_to_their_own_callers() {
        let crypto = CryptoClient::spawn().expect("spawn worker");
        let key = crypto.generate_keys().await.expect("keys");
        let texts: Vec<String> = (0..32).map(|i| format!("message {i}")).collect();

        let sealed = join_all(
            texts
                .iter()
                .map(|text| crypto.encrypt(text.clone(), key.clone())),
        )
        .await;
        let opened = join_all(
            sealed
                .into_iter()
                .map(|ciphertext| crypto.decrypt(ciphertext.expect("encrypt"))),
        )
        .await;

        let opened: Vec<String> = opened
            .into_iter()
            .map(|text| text.expect("decrypt"))
            .collect();
        assert_eq!(opened, texts);
        assert_eq!(crypto.in_flight(), 0);
    }

    #[tokio::test]
    async fn request_ids_are_never_reused_across_clones() {
        let crypto = CryptoClient::spawn().expect("spawn worker");
        let clone = crypto.clone();
        let key = crypto.generate_keys().await.expect("keys");
        clone.encrypt("a".into(), key.clone()).await.expect("encrypt");
        crypto.encrypt("b".into(), key).await.expect("encrypt");

        assert_eq!(crypto.next_id.load(Ordering::Relaxed), 4);
        assert_eq!(clone.in_flight(), 0);
    }

    #[tokio::test]
    async fn regenerating_keys_replaces_the_old_pair() {
        let crypto = CryptoClient::spawn().expect("spawn worker");
        let old = crypto.generate_keys().await.expect("keys");
        let ciphertext = crypto
            .encrypt("for the old key".into(), old.clone())
            .await
            .expect("encrypt");

        let new = crypto.generate_keys().await.expect("keys");
        assert_ne!(old, new);
        assert_eq!(
            crypto.decrypt(ciphertext).await,
            Err(CryptoError::Decryption)
        );
    }
}
