use std::{future::Future, net::SocketAddr, time::Duration};

use anyhow::{Context, Result};
use e2e_chat_relay::{
    client::{ChatClient, ClientConfig},
    crypto::{CryptoClient, CryptoError},
    message::{ClientEvent, ServerEvent, read_message, write_message},
    pairing::{
        AppState, Direction, Input, PairingConfig, PairingController, Phase, UnpairedPolicy,
    },
    server::{RelayConfig, RelayServer},
};
use tokio::{
    io::BufReader,
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::oneshot,
    time::timeout,
};

const WAIT: Duration = Duration::from_secs(3);
const QUIET_PERIOD: Duration = Duration::from_millis(200);

async fn start_relay() -> Result<(SocketAddr, oneshot::Sender<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let server = RelayServer::new(listener, RelayConfig::default());
    let addr = server.local_addr()?;
    let (shutdown, shutdown_rx) = oneshot::channel::<()>();
    tokio::spawn(server.run_until(async move {
        let _ = shutdown_rx.await;
    }));
    Ok((addr, shutdown))
}

fn chat_client(addr: SocketAddr, unpaired: UnpairedPolicy) -> Result<ChatClient> {
    let config = ClientConfig {
        server: addr,
        pairing: PairingConfig {
            room: None,
            unpaired,
        },
    };
    Ok(ChatClient::new(config, CryptoClient::spawn()?))
}

async fn within<T>(what: &str, future: impl Future<Output = Result<T>>) -> Result<T> {
    timeout(WAIT, future)
        .await
        .with_context(|| format!("timed out: {what}"))?
}

fn received(state: &AppState, text: &str) -> bool {
    state
        .messages()
        .iter()
        .any(|message| message.direction == Direction::Incoming && message.text == text)
}

/// A third party on the raw protocol that never announces a key.
struct Eavesdropper {
    reader: BufReader<OwnedReadHalf>,
    _writer: OwnedWriteHalf,
}

impl Eavesdropper {
    async fn join(addr: SocketAddr) -> Result<Self> {
        let (reader, mut writer) = TcpStream::connect(addr).await?.into_split();
        write_message(&mut writer, &ClientEvent::Join(None)).await?;
        let mut this = Self {
            reader: BufReader::new(reader),
            _writer: writer,
        };
        let joined = this.next_event().await?;
        assert_eq!(joined, ServerEvent::RoomJoined("DEFAULT".into()));
        Ok(this)
    }

    async fn next_event(&mut self) -> Result<ServerEvent> {
        timeout(WAIT, read_message::<_, ServerEvent>(&mut self.reader))
            .await
            .context("timed out waiting for relay event")??
            .context("relay closed the connection")
    }

    /// Skips key announcements until something else arrives.
    async fn next_non_key_event(&mut self) -> Result<ServerEvent> {
        loop {
            match self.next_event().await? {
                ServerEvent::PublicKey(_) | ServerEvent::NewConnection => continue,
                other => return Ok(other),
            }
        }
    }

    async fn assert_no_message(&mut self) {
        let deadline = tokio::time::Instant::now() + QUIET_PERIOD;
        while let Ok(next) =
            tokio::time::timeout_at(deadline, read_message::<_, ServerEvent>(&mut self.reader))
                .await
        {
            if let Ok(Some(ServerEvent::Message(message))) = next {
                panic!("unexpected message relayed: {message:?}");
            }
            if !matches!(next, Ok(Some(_))) {
                break;
            }
        }
    }
}

#[tokio::test]
async fn paired_clients_exchange_messages_a_third_party_cannot_read() -> Result<()> {
    let (addr, shutdown) = start_relay().await?;
    let mut x = chat_client(addr, UnpairedPolicy::Drop)?;
    let mut y = chat_client(addr, UnpairedPolicy::Drop)?;

    x.start().await;
    y.start().await;
    within("pairing", async {
        tokio::try_join!(
            x.run_until(|state| state.phase() == Phase::Paired),
            y.run_until(|state| state.phase() == Phase::Paired),
        )
    })
    .await?;

    let x_key = x.state().origin_key().cloned().context("x key")?;
    let y_key = y.state().origin_key().cloned().context("y key")?;
    assert_eq!(x.state().destination_key(), Some(&y_key));
    assert_eq!(y.state().destination_key(), Some(&x_key));

    let mut z = Eavesdropper::join(addr).await?;

    x.send("meet at noon").await;
    within("x flushes", async {
        x.flush().await;
        Ok(())
    })
    .await?;
    within("y receives", y.run_until(|state| received(state, "meet at noon"))).await?;
    assert_eq!(
        y.state().messages().last().and_then(|m| m.sender.as_ref()),
        Some(&x_key)
    );

    let intercepted = match z.next_non_key_event().await? {
        ServerEvent::Message(message) => message,
        other => panic!("expected the relayed message, got {other:?}"),
    };
    assert_eq!(intercepted.sender.as_ref(), Some(&x_key));
    assert_eq!(intercepted.recipient.as_ref(), Some(&y_key));
    assert!(!intercepted.text.contains("meet at noon"));

    let z_crypto = CryptoClient::spawn()?;
    let z_key = z_crypto.generate_keys().await?;
    assert_eq!(
        z_crypto.decrypt(intercepted.text.clone()).await,
        Err(CryptoError::Decryption)
    );

    let mut z_controller = PairingController::new(PairingConfig::default());
    z_controller.handle(Input::Start);
    z_controller.handle(Input::KeysGenerated(z_key));
    z_controller.handle(Input::Connected);
    z_controller.handle(Input::Server(ServerEvent::RoomJoined("DEFAULT".into())));
    let effects = z_controller.handle(Input::Server(ServerEvent::Message(intercepted)));
    assert!(effects.is_empty());
    assert!(z_controller.state().messages().is_empty());
    assert_eq!(z_controller.state().discarded(), 1);

    let _ = shutdown.send(());
    Ok(())
}

#[tokio::test]
async fn departure_unpairs_and_later_drafts_stay_local() -> Result<()> {
    let (addr, shutdown) = start_relay().await?;
    let mut x = chat_client(addr, UnpairedPolicy::Drop)?;
    let mut y = chat_client(addr, UnpairedPolicy::Drop)?;

    x.start().await;
    y.start().await;
    within("pairing", async {
        tokio::try_join!(
            x.run_until(|state| state.phase() == Phase::Paired),
            y.run_until(|state| state.phase() == Phase::Paired),
        )
    })
    .await?;
    let mut z = Eavesdropper::join(addr).await?;

    x.close().await;
    within("x notices", x.run_until(|state| state.phase() == Phase::Disconnected)).await?;
    assert_eq!(x.state().destination_key(), None);

    within("y unpairs", y.run_until(|state| state.destination_key().is_none())).await?;
    assert_eq!(y.state().phase(), Phase::JoinedNoPeer);
    assert!(
        y.state()
            .notifications()
            .iter()
            .any(|n| n.message.starts_with("User Disconnected - "))
    );
    assert_eq!(z.next_non_key_event().await?, ServerEvent::UserDisconnected);

    y.send("anyone there?").await;
    within("y flushes", async {
        y.flush().await;
        Ok(())
    })
    .await?;
    assert_eq!(
        y.state().messages().last().map(|m| (m.direction, m.text.as_str())),
        Some((Direction::Outgoing, "anyone there?"))
    );
    z.assert_no_message().await;

    let _ = shutdown.send(());
    Ok(())
}

#[tokio::test]
async fn queued_drafts_are_delivered_once_a_peer_arrives() -> Result<()> {
    let (addr, shutdown) = start_relay().await?;
    let mut x = chat_client(addr, UnpairedPolicy::Queue)?;

    x.start().await;
    within("x joins", x.run_until(|state| state.phase() == Phase::JoinedNoPeer)).await?;
    x.send("sent before you arrived").await;
    assert_eq!(x.state().outbox(), &["sent before you arrived"]);

    let mut y = chat_client(addr, UnpairedPolicy::Drop)?;
    y.start().await;
    within("pairing", async {
        tokio::try_join!(
            x.run_until(|state| state.phase() == Phase::Paired),
            y.run_until(|state| state.phase() == Phase::Paired),
        )
    })
    .await?;
    assert!(x.state().outbox().is_empty());

    within("x flushes", async {
        x.flush().await;
        Ok(())
    })
    .await?;
    within(
        "y receives",
        y.run_until(|state| received(state, "sent before you arrived")),
    )
    .await?;

    let _ = shutdown.send(());
    Ok(())
}
