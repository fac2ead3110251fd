//! End-to-end encrypted chat over an untrusted relay.
//!
//! See `README.md` for usage and the JSON line protocol. The relay only
//! routes opaque frames between sessions in the same room; every message
//! body is sealed for one recipient key before it leaves the client.
//!
//! - [`cli`] parses the command-line interface for server and client modes.
//! - [`message`] defines the wire events plus helpers for framed reads and
//!   writes.
//! - [`registry`] and [`relay`] hold the room membership table and the
//!   routing rules, free of any I/O.
//! - [`server`] accepts TCP connections and feeds a single dispatcher task
//!   that owns the relay state.
//! - [`crypto`] runs key generation, sealing and opening on a worker thread
//!   that alone holds the private key.
//! - [`pairing`] is the client state machine, and [`client`] drives it
//!   against a socket, the crypto worker and the terminal.
//! - [`console`] parses terminal commands.

pub mod cli;
pub mod client;
pub mod console;
pub mod crypto;
pub mod message;
pub mod pairing;
pub mod registry;
pub mod relay;
pub mod server;
