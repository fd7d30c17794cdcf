use anyhow::{Context, Result};
use futures::{Sink, SinkExt, Stream, StreamExt};
use thiserror::Error;
use tokio::{
    io::{self, AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
    sync::mpsc,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        self,
        client::IntoClientRequest,
        http::HeaderValue,
        protocol::{frame::coding::CloseCode, CloseFrame},
        Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    cli::ClientArgs,
    message::{ChatLine, DisplayName},
    server::USERNAME_HEADER,
    task_group::TaskGroup,
};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Input lines that end the session.
pub const QUIT_COMMANDS: &[&str] = &[":q", "/quit"];

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("server closed the connection: {reason}")]
    ServerClosed { reason: String },
    #[error("connection lost: {0}")]
    Transport(#[from] tungstenite::Error),
    #[error("failed to read input: {0}")]
    Input(#[from] io::Error),
}

/// What the session hands to whoever renders it.
#[derive(Debug)]
pub enum ClientEvent {
    Chat(ChatLine),
    Failed(ClientError),
}

pub async fn run(args: ClientArgs) -> Result<()> {
    let name = DisplayName::parse(&args.name)?;
    let socket = connect(&args.url, &name).await?;
    info!(url = %args.url, %name, "connected");

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let input = BufReader::new(tokio::io::stdin());
    let session = tokio::spawn(run_session(socket, input, events_tx));

    render(events_rx).await?;
    session.await.context("chat session panicked")?;

    Ok(())
}

/// Opens the WebSocket, sending `name` in the username header. A client-error
/// response from the server is turned into an error carrying its body.
pub async fn connect(url: &str, name: &DisplayName) -> Result<WsStream> {
    let mut request = url
        .into_client_request()
        .with_context(|| format!("invalid server url {url}"))?;
    let value = HeaderValue::from_str(name.as_str()).context("name is not a valid header value")?;
    request.headers_mut().insert(USERNAME_HEADER, value);

    match connect_async(request).await {
        Ok((socket, _response)) => Ok(socket),
        Err(tungstenite::Error::Http(response)) => {
            let body = response
                .body()
                .as_deref()
                .map(String::from_utf8_lossy)
                .unwrap_or_default();
            anyhow::bail!(
                "server rejected connection ({}): {}",
                response.status(),
                body.trim()
            )
        }
        Err(err) => Err(err).with_context(|| format!("failed to connect to {url}")),
    }
}

/// Runs the receive and send halves of one connection as a task group.
///
/// Chat lines from the server arrive on `events` as they are decoded. If the
/// group stops with an error, that error is delivered last as
/// [`ClientEvent::Failed`]; the channel then closes.
pub async fn run_session<S, I>(socket: S, input: I, events: mpsc::UnboundedSender<ClientEvent>)
where
    S: Stream<Item = Result<Message, tungstenite::Error>>
        + Sink<Message, Error = tungstenite::Error>
        + Send
        + 'static,
    I: AsyncBufRead + Unpin + Send + 'static,
{
    let (sink, stream) = socket.split();
    let inbound = events.clone();

    let group = TaskGroup::new();
    group.spawn(move |cancel| receive(stream, inbound, cancel));
    group.spawn(move |cancel| send(sink, input, cancel));

    if let Err(err) = group.wait().await {
        let _ = events.send(ClientEvent::Failed(err));
    }
}

async fn receive<St>(
    mut stream: St,
    events: mpsc::UnboundedSender<ClientEvent>,
    cancel: CancellationToken,
) -> Result<(), ClientError>
where
    St: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            next = stream.next() => next,
        };

        match next {
            Some(Ok(Message::Text(frame))) => match ChatLine::parse(&frame) {
                Some(line) => {
                    if events.send(ClientEvent::Chat(line)).is_err() {
                        // Nobody is rendering any more.
                        return Ok(());
                    }
                }
                None => warn!(%frame, "ignoring malformed frame"),
            },
            Some(Ok(Message::Close(frame))) => {
                let reason = frame.map(|frame| frame.reason.into_owned()).unwrap_or_default();
                return Err(ClientError::ServerClosed { reason });
            }
            // Pings are answered by tungstenite.
            Some(Ok(_)) => {}
            Some(Err(err)) => return Err(err.into()),
            None => {
                return Err(ClientError::ServerClosed {
                    reason: "connection dropped".to_string(),
                })
            }
        }
    }
}

async fn send<Si, I>(mut sink: Si, input: I, cancel: CancellationToken) -> Result<(), ClientError>
where
    Si: Sink<Message, Error = tungstenite::Error> + Unpin,
    I: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };

        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        if QUIT_COMMANDS.contains(&text) {
            break;
        }
        sink.send(Message::Text(text.to_string())).await?;
    }

    let farewell = CloseFrame {
        code: CloseCode::Normal,
        reason: "leaving chat".into(),
    };
    sink.send(Message::Close(Some(farewell))).await?;
    cancel.cancel();
    Ok(())
}

async fn render(mut events: mpsc::UnboundedReceiver<ClientEvent>) -> io::Result<()> {
    while let Some(event) = events.recv().await {
        match event {
            ClientEvent::Chat(ChatLine { from, text }) => {
                write_stdout(&format!("<{from}> {text}")).await?
            }
            ClientEvent::Failed(err) => write_stderr(&format!("!!! {err}")).await?,
        }
    }
    write_stdout("*** leaving chat").await
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
