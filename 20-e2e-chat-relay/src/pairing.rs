//! Client-side pairing state machine.
//!
//! [`PairingController`] owns the whole client [`AppState`] and changes it
//! only in response to an [`Input`]. It performs no I/O: every side effect
//! (crypto round trips, connecting, emitting events) is returned as an
//! [`Effect`] for the driver to carry out, and the driver reports the result
//! back as another `Input`.
//!
//! ```text
//! Init -> KeyGenerating -> Connecting -> Joining -> JoinedNoPeer <-> Paired
//!                                  (any) -- transport lost --> Disconnected
//! ```

use chrono::{DateTime, Local};
use clap::ValueEnum;
use tracing::{debug, info};

use crate::message::{ChatMessage, ClientEvent, PublicKey, ServerEvent};

/// Key generation is retried once before giving up.
const MAX_KEYGEN_ATTEMPTS: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    KeyGenerating,
    Connecting,
    Joining,
    JoinedNoPeer,
    Paired,
    Disconnected,
}

/// What happens to drafts written while no peer key is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum UnpairedPolicy {
    /// Echo locally, never transmit.
    #[default]
    Drop,
    /// Hold in the outbox and send once a peer key arrives.
    Queue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayMessage {
    pub text: String,
    pub sender: Option<PublicKey>,
    pub direction: Direction,
}

#[derive(Debug, Clone)]
pub struct Notification {
    pub message: String,
    pub timestamp: DateTime<Local>,
}

#[derive(Debug, Clone)]
pub struct AppState {
    phase: Phase,
    origin_key: Option<PublicKey>,
    destination_key: Option<PublicKey>,
    room: Option<String>,
    messages: Vec<DisplayMessage>,
    notifications: Vec<Notification>,
    outbox: Vec<String>,
    discarded: usize,
}

impl AppState {
    fn new() -> Self {
        Self {
            phase: Phase::Init,
            origin_key: None,
            destination_key: None,
            room: None,
            messages: Vec::new(),
            notifications: Vec::new(),
            outbox: Vec::new(),
            discarded: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn origin_key(&self) -> Option<&PublicKey> {
        self.origin_key.as_ref()
    }

    pub fn destination_key(&self) -> Option<&PublicKey> {
        self.destination_key.as_ref()
    }

    pub fn room(&self) -> Option<&str> {
        self.room.as_deref()
    }

    pub fn messages(&self) -> &[DisplayMessage] {
        &self.messages
    }

    pub fn notifications(&self) -> &[Notification] {
        &self.notifications
    }

    /// Drafts waiting for a peer key under [`UnpairedPolicy::Queue`].
    pub fn outbox(&self) -> &[String] {
        &self.outbox
    }

    /// Messages dropped because they were addressed to someone else.
    pub fn discarded(&self) -> usize {
        self.discarded
    }

    pub fn is_connected(&self) -> bool {
        matches!(
            self.phase,
            Phase::Joining | Phase::JoinedNoPeer | Phase::Paired
        )
    }

    fn notify(&mut self, message: impl Into<String>) {
        let message = message.into();
        debug!(%message, "notification");
        self.notifications.push(Notification {
            message,
            timestamp: Local::now(),
        });
    }
}

/// Things the controller learns about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Start,
    KeysGenerated(PublicKey),
    Connected,
    /// The relay could not be reached; carries the address tried.
    ConnectFailed(String),
    Server(ServerEvent),
    Encrypted {
        ciphertext: String,
        recipient: PublicKey,
    },
    Decrypted {
        text: String,
        sender: Option<PublicKey>,
    },
    CryptoFailed(String),
    Disconnected,
}

/// Work the controller asks the driver to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    GenerateKeys,
    Connect,
    Emit(ClientEvent),
    Encrypt { text: String, recipient: PublicKey },
    Decrypt { message: ChatMessage },
}

#[derive(Debug, Clone, Default)]
pub struct PairingConfig {
    /// Room name sent with `JOIN`. The relay may ignore it.
    pub room: Option<String>,
    pub unpaired: UnpairedPolicy,
}

#[derive(Debug, Clone)]
pub struct PairingController {
    config: PairingConfig,
    state: AppState,
    keygen_attempts: u32,
}

impl PairingController {
    pub fn new(config: PairingConfig) -> Self {
        Self {
            config,
            state: AppState::new(),
            keygen_attempts: 0,
        }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn handle(&mut self, input: Input) -> Vec<Effect> {
        match input {
            Input::Start => self.on_start(),
            Input::KeysGenerated(key) => self.on_keys_generated(key),
            Input::Connected => self.on_connected(),
            Input::ConnectFailed(server) => self.on_connect_failed(server),
            Input::Server(event) => self.on_server_event(event),
            Input::Encrypted {
                ciphertext,
                recipient,
            } => self.on_encrypted(ciphertext, recipient),
            Input::Decrypted { text, sender } => self.on_decrypted(text, sender),
            Input::CryptoFailed(reason) => self.on_crypto_failed(reason),
            Input::Disconnected => self.on_disconnected(),
        }
    }

    /// Sends a draft. The plaintext is echoed locally before encryption.
    pub fn send_message(&mut self, draft: &str) -> Vec<Effect> {
        if draft.is_empty() {
            return Vec::new();
        }

        self.state.messages.push(DisplayMessage {
            text: draft.to_string(),
            sender: self.state.origin_key.clone(),
            direction: Direction::Outgoing,
        });

        match (&self.state.destination_key, self.config.unpaired) {
            (Some(recipient), _) => vec![Effect::Encrypt {
                text: draft.to_string(),
                recipient: recipient.clone(),
            }],
            (None, UnpairedPolicy::Queue) => {
                self.state.outbox.push(draft.to_string());
                Vec::new()
            }
            (None, UnpairedPolicy::Drop) => {
                debug!("no peer key yet; message stays local");
                Vec::new()
            }
        }
    }

    fn on_start(&mut self) -> Vec<Effect> {
        if self.state.phase != Phase::Init {
            return Vec::new();
        }
        self.state.phase = Phase::KeyGenerating;
        self.keygen_attempts = 1;
        self.state.notify("Welcome! Generating a new keypair now.");
        vec![Effect::GenerateKeys]
    }

    fn on_keys_generated(&mut self, key: PublicKey) -> Vec<Effect> {
        self.state.origin_key = Some(key);
        self.state.notify("Keypair Generated");
        if self.state.phase != Phase::KeyGenerating {
            return Vec::new();
        }
        self.state.phase = Phase::Connecting;
        vec![Effect::Connect]
    }

    fn on_connected(&mut self) -> Vec<Effect> {
        self.state.phase = Phase::Joining;
        self.state.notify("Connected To Server.");
        vec![Effect::Emit(ClientEvent::Join(self.config.room.clone()))]
    }

    fn on_connect_failed(&mut self, server: String) -> Vec<Effect> {
        info!(%server, "could not reach relay");
        self.state.phase = Phase::Disconnected;
        self.state.notify(format!("Connection Failed - {server}"));
        Vec::new()
    }

    fn on_server_event(&mut self, event: ServerEvent) -> Vec<Effect> {
        match event {
            ServerEvent::RoomJoined(room) => self.on_room_joined(room),
            ServerEvent::NewConnection => self.on_new_connection(),
            ServerEvent::Message(message) => self.on_message(message),
            ServerEvent::PublicKey(key) => self.on_public_key(key),
            ServerEvent::UserDisconnected => self.on_user_disconnected(),
            ServerEvent::Error(reason) => {
                self.state.notify(format!("Server Error - {reason}"));
                Vec::new()
            }
        }
    }

    fn on_room_joined(&mut self, room: String) -> Vec<Effect> {
        info!(%room, "joined room");
        self.state.notify(format!("Joined Room - {room}"));
        self.state.room = Some(room);
        self.state.phase = if self.state.destination_key.is_some() {
            Phase::Paired
        } else {
            Phase::JoinedNoPeer
        };
        self.emit_public_key()
    }

    fn on_new_connection(&mut self) -> Vec<Effect> {
        self.state.notify("Another user joined the room.");
        self.emit_public_key()
    }

    fn on_public_key(&mut self, key: PublicKey) -> Vec<Effect> {
        self.state
            .notify(format!("Public Key Received - {}", key.snippet()));
        self.state.destination_key = Some(key.clone());
        self.state.phase = Phase::Paired;

        std::mem::take(&mut self.state.outbox)
            .into_iter()
            .map(|text| Effect::Encrypt {
                text,
                recipient: key.clone(),
            })
            .collect()
    }

    fn on_user_disconnected(&mut self) -> Vec<Effect> {
        let snippet = self
            .state
            .destination_key
            .take()
            .map(|key| key.snippet().to_string())
            .unwrap_or_default();
        self.state.notify(format!("User Disconnected - {snippet}"));
        if self.state.phase == Phase::Paired {
            self.state.phase = Phase::JoinedNoPeer;
        }
        Vec::new()
    }

    fn on_message(&mut self, message: ChatMessage) -> Vec<Effect> {
        let addressed_to_us = self
            .state
            .origin_key
            .as_ref()
            .is_some_and(|own| message.is_addressed_to(own));
        if !addressed_to_us {
            self.state.discarded += 1;
            debug!("discarding message addressed to another key");
            return Vec::new();
        }
        vec![Effect::Decrypt { message }]
    }

    fn on_encrypted(&mut self, ciphertext: String, recipient: PublicKey) -> Vec<Effect> {
        let Some(sender) = self.state.origin_key.clone() else {
            return Vec::new();
        };
        if !self.state.is_connected() {
            self.state.notify("Message not sent - connection lost");
            return Vec::new();
        }
        vec![Effect::Emit(ClientEvent::Message(ChatMessage::sealed(
            ciphertext, sender, recipient,
        )))]
    }

    fn on_decrypted(&mut self, text: String, sender: Option<PublicKey>) -> Vec<Effect> {
        self.state.messages.push(DisplayMessage {
            text,
            sender,
            direction: Direction::Incoming,
        });
        Vec::new()
    }

    fn on_crypto_failed(&mut self, reason: String) -> Vec<Effect> {
        self.state.notify(format!("Crypto Error - {reason}"));
        if self.state.phase != Phase::KeyGenerating {
            return Vec::new();
        }
        if self.keygen_attempts < MAX_KEYGEN_ATTEMPTS {
            self.keygen_attempts += 1;
            self.state.notify("Retrying key generation.");
            return vec![Effect::GenerateKeys];
        }
        self.state.phase = Phase::Init;
        self.state
            .notify("Key generation failed. Restart the client to try again.");
        Vec::new()
    }

    fn on_disconnected(&mut self) -> Vec<Effect> {
        if self.state.phase == Phase::Disconnected {
            return Vec::new();
        }
        info!("lost connection to relay");
        self.state.phase = Phase::Disconnected;
        self.state.destination_key = None;
        self.state.notify("Lost Connection");
        Vec::new()
    }

    fn emit_public_key(&self) -> Vec<Effect> {
        self.state
            .origin_key
            .clone()
            .map(|key| Effect::Emit(ClientEvent::PublicKey(key)))
            .into_iter()
            .collect()
    }
}
