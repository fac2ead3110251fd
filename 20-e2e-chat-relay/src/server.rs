use std::{collections::HashMap, future::Future, net::SocketAddr};

use anyhow::{Result, anyhow};
use tokio::{
    io::{AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream, tcp::OwnedWriteHalf},
    select,
    sync::mpsc,
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    message::{ClientEvent, Frame, ServerEvent, read_frame, write_message},
    registry::{RoomRegistry, SessionId},
    relay::{Inbound, Relay, RoomPolicy},
};

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub default_room: String,
    pub room_policy: RoomPolicy,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            default_room: crate::registry::DEFAULT_ROOM.to_string(),
            room_policy: RoomPolicy::default(),
        }
    }
}

pub struct RelayServer {
    listener: TcpListener,
    config: RelayConfig,
}

impl RelayServer {
    pub fn new(listener: TcpListener, config: RelayConfig) -> Self {
        Self { listener, config }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let RelayServer { listener, config } = self;
        let relay = Relay::new(RoomRegistry::new(config.default_room), config.room_policy);
        let (commands, inbox) = mpsc::unbounded_channel();
        let dispatcher = tokio::spawn(run_dispatcher(relay, inbox));
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    handle_shutdown(&commands);
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &commands);
                }
            }
        }

        dispatcher
            .await
            .map_err(|err| anyhow!("relay dispatcher failed: {err}"))
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

/// Messages from connection tasks to the dispatcher.
#[derive(Debug)]
enum Command {
    Open {
        session: SessionId,
        outbox: mpsc::UnboundedSender<ServerEvent>,
    },
    Dispatch {
        session: SessionId,
        inbound: Inbound,
    },
    Shutdown,
}

type CommandSender = mpsc::UnboundedSender<Command>;

fn handle_shutdown(commands: &CommandSender) {
    info!("relay shutting down");
    if commands.send(Command::Shutdown).is_err() {
        debug!("relay dispatcher already stopped");
    }
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    commands: &CommandSender,
) {
    match result {
        Ok((stream, peer)) => spawn_connection_handler(stream, peer, commands),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_connection_handler(stream: TcpStream, peer: SocketAddr, commands: &CommandSender) {
    let commands = commands.clone();
    tokio::spawn(async move {
        if let Err(err) = handle_connection(stream, peer, commands).await {
            warn!(peer = %peer, error = ?err, "client connection closed with error");
        }
    });
}

/// Owns the relay state. Every event runs to completion before the next one
/// is taken, so the registry needs no locking.
async fn run_dispatcher(mut relay: Relay, mut inbox: mpsc::UnboundedReceiver<Command>) {
    let mut outboxes: HashMap<SessionId, mpsc::UnboundedSender<ServerEvent>> = HashMap::new();

    while let Some(command) = inbox.recv().await {
        match command {
            Command::Open { session, outbox } => {
                outboxes.insert(session.clone(), outbox);
                relay.handle(&session, Inbound::Connected);
                debug!(sessions = relay.session_count(), "session opened");
            }
            Command::Dispatch { session, inbound } => {
                let disconnected = matches!(inbound, Inbound::Disconnected);
                for delivery in relay.handle(&session, inbound) {
                    deliver(&outboxes, &delivery.to, delivery.event);
                }
                if disconnected {
                    outboxes.remove(&session);
                    debug!(sessions = relay.session_count(), "session closed");
                }
            }
            Command::Shutdown => {
                let notice = ServerEvent::Error("relay shutting down".to_string());
                for (session, outbox) in outboxes.drain() {
                    if outbox.send(notice.clone()).is_err() {
                        debug!(%session, "session already closed");
                    }
                }
                break;
            }
        }
    }
}

fn deliver(
    outboxes: &HashMap<SessionId, mpsc::UnboundedSender<ServerEvent>>,
    to: &SessionId,
    event: ServerEvent,
) {
    match outboxes.get(to) {
        Some(outbox) => {
            if outbox.send(event).is_err() {
                debug!(session = %to, "dropping event for closed session");
            }
        }
        None => debug!(session = %to, "dropping event for unknown session"),
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    commands: CommandSender,
) -> Result<()> {
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let session = SessionId::generate();
    let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
    commands
        .send(Command::Open {
            session: session.clone(),
            outbox: outbox_tx,
        })
        .map_err(|_| anyhow!("relay dispatcher stopped"))?;
    info!(%peer, %session, "client connected");

    let writer_task = spawn_writer(writer, outbox_rx, session.clone());
    let result = run_client_session(&session, &mut reader, &commands).await;

    cleanup_client_disconnect(&commands, session, peer);
    if let Err(err) = writer_task.await {
        debug!(error = ?err, "writer task ended abnormally");
    }
    result
}

async fn run_client_session<R>(
    session: &SessionId,
    reader: &mut R,
    commands: &CommandSender,
) -> Result<()>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    while let Some(frame) = read_frame::<_, ClientEvent>(reader).await? {
        let inbound = match frame {
            Frame::Event(event) => Inbound::Event(event),
            Frame::Malformed(reason) => Inbound::Malformed(reason),
        };
        let dispatched = commands.send(Command::Dispatch {
            session: session.clone(),
            inbound,
        });
        if dispatched.is_err() {
            break;
        }
    }
    Ok(())
}

/// Drains a session's outbox onto its socket until the dispatcher drops it.
fn spawn_writer(
    mut writer: OwnedWriteHalf,
    mut outbox: mpsc::UnboundedReceiver<ServerEvent>,
    session: SessionId,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = outbox.recv().await {
            if let Err(err) = write_message(&mut writer, &event).await {
                debug!(%session, ?err, "failed to deliver event to client");
                break;
            }
        }
        if let Err(err) = writer.shutdown().await {
            debug!(%session, ?err, "failed to shut down client writer");
        }
    })
}

fn cleanup_client_disconnect(commands: &CommandSender, session: SessionId, peer: SocketAddr) {
    info!(%peer, %session, "client disconnected");
    let dispatched = commands.send(Command::Dispatch {
        session,
        inbound: Inbound::Disconnected,
    });
    if dispatched.is_err() {
        debug!("relay dispatcher already stopped");
    }
}
