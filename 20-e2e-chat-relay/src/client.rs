use std::{collections::VecDeque, net::SocketAddr};

use anyhow::{Result, bail};
use futures::{FutureExt, StreamExt, future::BoxFuture, stream::FuturesUnordered};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    sync::mpsc,
};
use tracing::{debug, info, warn};

use crate::{
    cli::ClientArgs,
    console::{ConsoleCommand, HELP},
    crypto::CryptoClient,
    message::{ChatMessage, ClientEvent, Frame, ServerEvent, read_frame, write_message},
    pairing::{
        AppState, Direction, Effect, Input, Notification, PairingConfig, PairingController,
    },
};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server: SocketAddr,
    pub pairing: PairingConfig,
}

/// Drives a [`PairingController`] against a live relay connection.
///
/// Server events and finished crypto requests are the two sources of input.
/// Crypto requests run concurrently, so a slow decrypt never holds up the
/// next event from the relay.
pub struct ChatClient {
    controller: PairingController,
    crypto: CryptoClient,
    server: SocketAddr,
    writer: Option<OwnedWriteHalf>,
    events: Option<mpsc::UnboundedReceiver<ServerEvent>>,
    in_flight: FuturesUnordered<BoxFuture<'static, Input>>,
}

impl ChatClient {
    pub fn new(config: ClientConfig, crypto: CryptoClient) -> Self {
        Self {
            controller: PairingController::new(config.pairing),
            crypto,
            server: config.server,
            writer: None,
            events: None,
            in_flight: FuturesUnordered::new(),
        }
    }

    pub fn state(&self) -> &AppState {
        self.controller.state()
    }

    /// Kicks off key generation. Connecting follows once the key arrives.
    pub async fn start(&mut self) {
        self.apply(Input::Start).await
    }

    pub async fn send(&mut self, draft: &str) {
        let effects = self.controller.send_message(draft);
        self.run_effects(effects).await
    }

    /// Whether any input can still arrive.
    pub fn is_active(&self) -> bool {
        self.events.is_some() || !self.in_flight.is_empty()
    }

    /// Waits for the next input. Cancel safe; only call while [`Self::is_active`].
    pub async fn next_input(&mut self) -> Input {
        let input = select! {
            Some(input) = self.in_flight.next(), if !self.in_flight.is_empty() => input,
            event = next_event(&mut self.events) => match event {
                Some(event) => Input::Server(event),
                None => Input::Disconnected,
            },
        };
        if input == Input::Disconnected {
            self.events = None;
        }
        input
    }

    /// Processes one input. Returns `false` when nothing is left to wait for.
    pub async fn step(&mut self) -> bool {
        if !self.is_active() {
            return false;
        }
        let input = self.next_input().await;
        self.apply(input).await;
        true
    }

    /// Applies inputs until no crypto request is outstanding, so drafts
    /// already handed to the worker reach the relay.
    pub async fn flush(&mut self) {
        while !self.in_flight.is_empty() {
            self.step().await;
        }
    }

    pub async fn run_until<P>(&mut self, done: P) -> Result<()>
    where
        P: Fn(&AppState) -> bool,
    {
        while !done(self.state()) {
            if !self.step().await {
                bail!("client went idle before reaching the expected state");
            }
        }
        Ok(())
    }

    pub async fn apply(&mut self, input: Input) {
        let effects = self.controller.handle(input);
        self.run_effects(effects).await
    }

    /// Closes the write side; the relay then drops the session.
    pub async fn close(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            if let Err(error) = writer.shutdown().await {
                warn!(?error, "failed to shutdown client writer cleanly");
            }
        }
    }

    async fn run_effects(&mut self, effects: Vec<Effect>) {
        let mut queue = VecDeque::from(effects);
        while let Some(effect) = queue.pop_front() {
            if let Some(input) = self.execute(effect).await {
                queue.extend(self.controller.handle(input));
            }
        }
    }

    async fn execute(&mut self, effect: Effect) -> Option<Input> {
        match effect {
            Effect::GenerateKeys => {
                let crypto = self.crypto.clone();
                self.in_flight.push(
                    async move {
                        match crypto.generate_keys().await {
                            Ok(key) => Input::KeysGenerated(key),
                            Err(err) => Input::CryptoFailed(err.to_string()),
                        }
                    }
                    .boxed(),
                );
                None
            }
            Effect::Connect => Some(self.connect().await),
            Effect::Emit(event) => self.emit(&event).await,
            Effect::Encrypt { text, recipient } => {
                let crypto = self.crypto.clone();
                self.in_flight.push(
                    async move {
                        match crypto.encrypt(text, recipient.clone()).await {
                            Ok(ciphertext) => Input::Encrypted {
                                ciphertext,
                                recipient,
                            },
                            Err(err) => Input::CryptoFailed(err.to_string()),
                        }
                    }
                    .boxed(),
                );
                None
            }
            Effect::Decrypt { message } => {
                let ChatMessage { text, sender, .. } = message;
                let crypto = self.crypto.clone();
                self.in_flight.push(
                    async move {
                        match crypto.decrypt(text).await {
                            Ok(text) => Input::Decrypted { text, sender },
                            Err(err) => Input::CryptoFailed(err.to_string()),
                        }
                    }
                    .boxed(),
                );
                None
            }
        }
    }

    async fn connect(&mut self) -> Input {
        let stream = match TcpStream::connect(self.server).await {
            Ok(stream) => stream,
            Err(error) => {
                warn!(server = %self.server, ?error, "failed to connect to relay");
                return Input::ConnectFailed(self.server.to_string());
            }
        };

        info!("connected to {}", self.server);

        let (reader, writer) = stream.into_split();
        self.events = Some(spawn_reader(reader));
        self.writer = Some(writer);
        Input::Connected
    }

    async fn emit(&mut self, event: &ClientEvent) -> Option<Input> {
        let Some(writer) = self.writer.as_mut() else {
            debug!(?event, "not connected; dropping outbound event");
            return None;
        };
        if let Err(error) = write_message(writer, event).await {
            warn!(?error, "failed to send event to relay");
            self.writer = None;
            return Some(Input::Disconnected);
        }
        None
    }
}

async fn next_event(events: &mut Option<mpsc::UnboundedReceiver<ServerEvent>>) -> Option<ServerEvent> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

/// Forwards decoded relay events until the connection closes.
fn spawn_reader(reader: OwnedReadHalf) -> mpsc::UnboundedReceiver<ServerEvent> {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        loop {
            match read_frame::<_, ServerEvent>(&mut reader).await {
                Ok(Some(Frame::Event(event))) => {
                    if events_tx.send(event).is_err() {
                        break;
                    }
                }
                Ok(Some(Frame::Malformed(reason))) => {
                    warn!(%reason, "ignoring malformed frame from relay");
                }
                Ok(None) => break,
                Err(error) => {
                    debug!(?error, "relay connection read failed");
                    break;
                }
            }
        }
    });
    events_rx
}

pub async fn run(args: ClientArgs) -> Result<()> {
    let crypto = CryptoClient::spawn()?;
    let mut client = ChatClient::new(args.config(), crypto);
    let mut renderer = Renderer::default();

    client.start().await;
    renderer.render(client.state()).await?;

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    run_client_loop(&mut client, &mut renderer, &mut stdin).await?;
    client.flush().await;
    client.close().await;

    Ok(())
}

enum Action {
    Input(Input),
    Line(Option<String>),
}

async fn run_client_loop(
    client: &mut ChatClient,
    renderer: &mut Renderer,
    stdin: &mut io::Lines<BufReader<io::Stdin>>,
) -> Result<()> {
    loop {
        let action = select! {
            input = client.next_input(), if client.is_active() => Action::Input(input),
            line = stdin.next_line() => Action::Line(line?),
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        };

        match action {
            Action::Input(input) => client.apply(input).await,
            Action::Line(None) => break,
            Action::Line(Some(line)) => {
                if !handle_stdin_input(&line, client).await? {
                    break;
                }
            }
        }
        renderer.render(client.state()).await?;
    }
    Ok(())
}

async fn handle_stdin_input(line: &str, client: &mut ChatClient) -> Result<bool> {
    let command = match ConsoleCommand::parse(line) {
        Ok(command) => command,
        Err(error) => {
            write_stderr(&format!("!!! {error}")).await?;
            return Ok(true);
        }
    };

    match command {
        ConsoleCommand::Say(text) => client.send(&text).await,
        ConsoleCommand::Key => {
            let snippet = client
                .state()
                .origin_key()
                .map_or("(not generated yet)", |key| key.snippet());
            write_stdout(&format!("*** your key: {snippet}")).await?;
        }
        ConsoleCommand::Status => write_stdout(&describe_status(client.state())).await?,
        ConsoleCommand::Help => write_stdout(HELP).await?,
        ConsoleCommand::Quit => {
            write_stdout("*** leaving chat").await?;
            return Ok(false);
        }
    }
    Ok(true)
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

fn describe_status(state: &AppState) -> String {
    format!(
        "*** phase: {:?}, room: {}, peer key: {}, queued: {}, ignored: {}",
        state.phase(),
        state.room().unwrap_or("-"),
        state.destination_key().map_or("none", |key| key.snippet()),
        state.outbox().len(),
        state.discarded(),
    )
}

/// Prints whatever was appended to the state since the last render.
#[derive(Default)]
struct Renderer {
    notifications: usize,
    messages: usize,
}

impl Renderer {
    async fn render(&mut self, state: &AppState) -> io::Result<()> {
        for notification in &state.notifications()[self.notifications..] {
            write_stdout(&notification_line(notification)).await?;
        }
        self.notifications = state.notifications().len();

        for message in &state.messages()[self.messages..] {
            let author = match (message.direction, &message.sender) {
                (Direction::Outgoing, _) => "you",
                (Direction::Incoming, Some(sender)) => sender.snippet(),
                (Direction::Incoming, None) => "peer",
            };
            write_stdout(&format!("<{author}> {}", message.text)).await?;
        }
        self.messages = state.messages().len();
        Ok(())
    }
}

fn notification_line(notification: &Notification) -> String {
    format!(
        "[{}] *** {}",
        notification.timestamp.format("%H:%M:%S"),
        notification.message
    )
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}
