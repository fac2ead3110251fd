use std::{fmt, io};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// Offset of the human-readable key snippet inside a serialized key.
pub const KEY_SNIPPET_OFFSET: usize = 400;
pub const KEY_SNIPPET_LEN: usize = 16;

/// Serialized public key blob. The relay forwards it without looking inside.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct PublicKey(String);

impl PublicKey {
    pub fn new(blob: impl Into<String>) -> Self {
        Self(blob.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn snippet(&self) -> &str {
        key_snippet(&self.0)
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.snippet())
    }
}

/// Short window of a serialized key for eyeball comparison.
///
/// Reads `KEY_SNIPPET_LEN` bytes at byte offset `KEY_SNIPPET_OFFSET`. Keys too
/// short for that window show their last `KEY_SNIPPET_LEN` bytes instead.
/// Serialized keys are base64, so bytes and characters coincide.
pub fn key_snippet(key: &str) -> &str {
    if let Some(snippet) = key.get(KEY_SNIPPET_OFFSET..KEY_SNIPPET_OFFSET + KEY_SNIPPET_LEN) {
        return snippet;
    }
    let start = key.len().saturating_sub(KEY_SNIPPET_LEN);
    key.get(start..).unwrap_or(key)
}

/// Chat payload. `text` is ciphertext when `sender` and `recipient` are set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<PublicKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<PublicKey>,
}

impl ChatMessage {
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            sender: None,
            recipient: None,
        }
    }

    pub fn sealed(ciphertext: impl Into<String>, sender: PublicKey, recipient: PublicKey) -> Self {
        Self {
            text: ciphertext.into(),
            sender: Some(sender),
            recipient: Some(recipient),
        }
    }

    pub fn is_addressed_to(&self, key: &PublicKey) -> bool {
        self.recipient.as_ref() == Some(key)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientEvent {
    /// Requested room name; the relay's room policy decides whether it counts.
    Join(Option<String>),
    Message(ChatMessage),
    PublicKey(PublicKey),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerEvent {
    RoomJoined(String),
    NewConnection,
    Message(ChatMessage),
    PublicKey(PublicKey),
    UserDisconnected,
    Error(String),
}

/// One decoded line from the wire.
#[derive(Debug)]
pub enum Frame<T> {
    Event(T),
    /// The line was not a valid envelope; the stream itself is still usable.
    Malformed(String),
}

pub async fn read_frame<R, T>(reader: &mut R) -> io::Result<Option<Frame<T>>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    // Simple line-oriented framing keeps interoperability with netcat-style tools.
    let mut line = Vec::new();
    loop {
        line.clear();
        let bytes = reader.read_until(b'\n', &mut line).await?;
        if bytes == 0 {
            return Ok(None);
        }

        let text = match std::str::from_utf8(&line) {
            Ok(text) => text,
            Err(err) => return Ok(Some(Frame::Malformed(format!("invalid utf-8: {err}")))),
        };
        let trimmed = text.trim_end_matches(LINE_ENDINGS);
        if trimmed.is_empty() {
            continue;
        }

        return Ok(Some(match serde_json::from_str(trimmed) {
            Ok(event) => Frame::Event(event),
            Err(err) => Frame::Malformed(err.to_string()),
        }));
    }
}

pub async fn read_message<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    match read_frame(reader).await? {
        Some(Frame::Event(message)) => Ok(Some(message)),
        Some(Frame::Malformed(reason)) => Err(io::Error::new(io::ErrorKind::InvalidData, reason)),
        None => Ok(None),
    }
}

pub async fn write_message<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    // Encode to JSON once, append a newline delimiter, and flush so peers get timely updates.
    let mut encoded = serde_json::to_vec(message).map_err(to_io_error)?;
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

fn to_io_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}
