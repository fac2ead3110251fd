use std::net::SocketAddr;

use clap::{Args, Parser, Subcommand};

use crate::{
    client::ClientConfig,
    pairing::{PairingConfig, UnpairedPolicy},
    registry::DEFAULT_ROOM,
    relay::RoomPolicy,
    server::RelayConfig,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay server, accepting TCP connections.
    Server(ServerArgs),
    /// Connect to a relay and chat with the paired peer.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Socket address the relay should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:3000")]
    pub listen: SocketAddr,

    /// Port to bind, replacing the port given in `--listen`.
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,

    /// Room every session is assigned to unless the policy honors requests.
    #[arg(long, default_value = DEFAULT_ROOM)]
    pub default_room: String,

    #[arg(long, value_enum, default_value_t = RoomPolicy::Assigned)]
    pub room_policy: RoomPolicy,
}

impl ServerArgs {
    pub fn listen_addr(&self) -> SocketAddr {
        let mut addr = self.listen;
        if let Some(port) = self.port {
            addr.set_port(port);
        }
        addr
    }

    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            default_room: self.default_room.clone(),
            room_policy: self.room_policy,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Address of the relay to connect to.
    #[arg(long, default_value = "127.0.0.1:3000")]
    pub server: SocketAddr,

    /// Room to request when joining. Only honored by relays using the `requested` policy.
    #[arg(long)]
    pub room: Option<String>,

    /// What to do with messages written before a peer key is known.
    #[arg(long, value_enum, default_value_t = UnpairedPolicy::Drop)]
    pub unpaired: UnpairedPolicy,
}

impl ClientArgs {
    pub fn config(&self) -> ClientConfig {
        ClientConfig {
            server: self.server,
            pairing: PairingConfig {
                room: self.room.clone(),
                unpaired: self.unpaired,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_args(args: &[&str]) -> ServerArgs {
        let cli = Cli::try_parse_from(["e2e_chat_relay", "server"].iter().chain(args))
            .expect("valid server args");
        match cli.command {
            Command::Server(args) => args,
            other => panic!("expected server command, got {other:?}"),
        }
    }

    #[test]
    fn port_overrides_listen_port() {
        let args = server_args(&["--listen", "0.0.0.0:3000", "--port", "4100"]);
        assert_eq!(args.listen_addr(), "0.0.0.0:4100".parse().unwrap());
    }

    #[test]
    fn server_defaults_to_assigned_room() {
        let args = server_args(&["--listen", "127.0.0.1:3000"]);
        let config = args.relay_config();
        assert_eq!(config.default_room, "DEFAULT");
        assert_eq!(config.room_policy, RoomPolicy::Assigned);
    }

    #[test]
    fn client_policies_parse_from_flags() {
        let cli = Cli::try_parse_from([
            "e2e_chat_relay",
            "client",
            "--room",
            "lobby",
            "--unpaired",
            "queue",
        ])
        .expect("valid client args");
        let Command::Client(args) = cli.command else {
            panic!("expected client command");
        };
        let config = args.config();
        assert_eq!(config.pairing.room.as_deref(), Some("lobby"));
        assert_eq!(config.pairing.unpaired, UnpairedPolicy::Queue);
        assert_eq!(config.server, "127.0.0.1:3000".parse().unwrap());
    }
}
