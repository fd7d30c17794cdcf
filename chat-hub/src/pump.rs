//! Per-connection I/O: one reader and one writer sharing a [`TaskGroup`].
//!
//! The reader turns inbound text frames into [`ChatMessage`]s for the hub and
//! watches a read deadline that only pongs push forward. The writer drains the
//! client's outbound queue and sends a ping every `ping_period`, which is
//! shorter than the read deadline so every deadline window sees at least one
//! probe. Whichever half stops first cancels the other; [`Pump::run`] then
//! unregisters the client and returns the first error.
//!
//! The pump is generic over any frame sink and stream so it can be driven by
//! an upgraded axum socket in production and by in-memory channels in tests.

use std::{error::Error as StdError, sync::Arc, time::Duration};

use axum::extract::ws::{close_code, CloseFrame, Message};
use futures::{Sink, SinkExt, Stream, StreamExt};
use thiserror::Error;
use tokio::{
    sync::mpsc,
    time::{self, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    hub::{Client, ClientHandle, HubClosed, HubHandle, OUTBOUND_CAPACITY},
    message::{ChatMessage, ClientId, DisplayName},
    task_group::TaskGroup,
};

/// Largest inbound frame accepted, in bytes.
pub const MAX_MESSAGE_SIZE: usize = 512;

/// Time allowed to write a single frame to the peer.
pub const WRITE_WAIT: Duration = Duration::from_secs(10);

/// Time allowed between pongs before the peer is considered gone.
pub const PONG_WAIT: Duration = Duration::from_secs(60);

/// Keepalive interval. Must be less than `PONG_WAIT`.
pub const PING_PERIOD: Duration = Duration::from_secs(PONG_WAIT.as_secs() * 9 / 10);

pub type BoxError = Box<dyn StdError + Send + Sync>;

#[derive(Debug, Clone)]
pub struct PumpConfig {
    pub max_message_size: usize,
    pub write_wait: Duration,
    pub pong_wait: Duration,
    pub ping_period: Duration,
    pub outbound_capacity: usize,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            max_message_size: MAX_MESSAGE_SIZE,
            write_wait: WRITE_WAIT,
            pong_wait: PONG_WAIT,
            ping_period: PING_PERIOD,
            outbound_capacity: OUTBOUND_CAPACITY,
        }
    }
}

impl PumpConfig {
    /// Sets the read deadline and keeps the keepalive at 9/10 of it.
    pub fn with_pong_wait(mut self, pong_wait: Duration) -> Self {
        self.pong_wait = pong_wait;
        self.ping_period = pong_wait * 9 / 10;
        self
    }
}

#[derive(Debug, Error)]
pub enum PumpError {
    #[error("frame of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { size: usize, limit: usize },
    #[error("no pong received within {0:?}")]
    ReadTimeout(Duration),
    #[error("write did not complete within {0:?}")]
    WriteTimeout(Duration),
    #[error("peer closed the connection (code {code:?}, reason {reason:?})")]
    PeerClosed { code: Option<u16>, reason: String },
    #[error("connection ended without a close frame")]
    Disconnected,
    #[error("client was removed from the hub")]
    Unregistered,
    #[error("transport error: {0}")]
    Transport(#[source] BoxError),
    #[error(transparent)]
    HubClosed(#[from] HubClosed),
}

impl PumpError {
    /// Expected ways for a session to end: a normal close from the peer or
    /// removal by the hub.
    pub fn is_clean(&self) -> bool {
        matches!(
            self,
            PumpError::PeerClosed {
                code: Some(close_code::NORMAL),
                ..
            } | PumpError::Unregistered
        )
    }

    fn peer_closed(frame: Option<CloseFrame<'static>>) -> Self {
        match frame {
            Some(frame) => PumpError::PeerClosed {
                code: Some(frame.code),
                reason: frame.reason.into_owned(),
            },
            None => PumpError::PeerClosed {
                code: None,
                reason: String::new(),
            },
        }
    }
}

pub struct Pump {
    client: Client,
    handle: ClientHandle,
    hub: HubHandle,
    config: PumpConfig,
}

impl Pump {
    pub fn new(name: DisplayName, hub: HubHandle, config: PumpConfig) -> Self {
        let (client, handle) = Client::new(name, config.outbound_capacity);
        Self {
            client,
            handle,
            hub,
            config,
        }
    }

    pub fn id(&self) -> ClientId {
        self.client.id()
    }

    /// Registers the client, runs the reader and writer until one of them
    /// stops, then unregisters. Both halves of the socket are dropped before
    /// this returns. If the hub cannot take the unregister within
    /// `write_wait`, it is left to finish in the background.
    pub async fn run<Si, St, E>(self, mut sink: Si, stream: St) -> Result<(), PumpError>
    where
        Si: Sink<Message> + Unpin + Send + 'static,
        Si::Error: Into<BoxError>,
        St: Stream<Item = Result<Message, E>> + Unpin + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        let Pump {
            client,
            handle,
            hub,
            config,
        } = self;
        let (id, name, outbound) = client.into_parts();

        let reader = Reader {
            id,
            name: name.clone(),
            hub: hub.clone(),
            max_message_size: config.max_message_size,
            pong_wait: config.pong_wait,
        };
        let writer = Writer {
            id,
            outbound,
            write_wait: config.write_wait,
            ping_period: config.ping_period,
        };

        if let Err(err) = hub.register(handle).await {
            warn!(client_id = %id, error = %err, "could not join chat room");
            writer.close(&mut sink, "chat room unavailable").await;
            return Err(err.into());
        }
        info!(client_id = %id, %name, "client connected");

        let group = TaskGroup::new();
        group.spawn(move |cancel| reader.run(stream, cancel));
        group.spawn(move |cancel| writer.run(sink, cancel));
        let result = group.wait().await;

        match &result {
            Ok(()) => info!(client_id = %id, "connection closed"),
            Err(err) if err.is_clean() => info!(client_id = %id, reason = %err, "connection closed"),
            Err(err) => warn!(client_id = %id, error = %err, "connection closed abnormally"),
        }

        // A hub stuck on a slow recipient must not pin this connection open;
        // the request stays queued and completes once the hub catches up.
        let unregister = tokio::spawn(async move { hub.unregister(id).await });
        match time::timeout(config.write_wait, unregister).await {
            Ok(Ok(Ok(()))) => {}
            Ok(_) => debug!(client_id = %id, "hub already stopped; nothing to unregister"),
            Err(_) => warn!(client_id = %id, "hub busy; unregister left pending"),
        }

        result
    }
}

struct Reader {
    id: ClientId,
    name: DisplayName,
    hub: HubHandle,
    max_message_size: usize,
    pong_wait: Duration,
}

impl Reader {
    async fn run<St, E>(self, mut stream: St, cancel: CancellationToken) -> Result<(), PumpError>
    where
        St: Stream<Item = Result<Message, E>> + Unpin,
        E: Into<BoxError>,
    {
        let mut deadline = Instant::now() + self.pong_wait;

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                next = time::timeout_at(deadline, stream.next()) => next,
            };

            let message = match next {
                Err(_) => return Err(PumpError::ReadTimeout(self.pong_wait)),
                Ok(None) => return Err(PumpError::Disconnected),
                Ok(Some(Err(err))) => return Err(PumpError::Transport(err.into())),
                Ok(Some(Ok(message))) => message,
            };

            match message {
                Message::Text(text) => {
                    self.check_size(text.len())?;
                    // The hub may be stalled behind another recipient.
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        forwarded = self.forward(&text) => forwarded?,
                    }
                }
                Message::Binary(data) => {
                    self.check_size(data.len())?;
                    warn!(client_id = %self.id, len = data.len(), "ignoring non-text frame");
                }
                Message::Pong(_) => deadline = Instant::now() + self.pong_wait,
                // The transport answers pings itself.
                Message::Ping(_) => {}
                Message::Close(frame) => return Err(PumpError::peer_closed(frame)),
            }
        }
    }

    fn check_size(&self, size: usize) -> Result<(), PumpError> {
        if size > self.max_message_size {
            return Err(PumpError::FrameTooLarge {
                size,
                limit: self.max_message_size,
            });
        }
        Ok(())
    }

    async fn forward(&self, raw: &str) -> Result<(), PumpError> {
        let text = raw.trim();
        if text.is_empty() {
            debug!(client_id = %self.id, "dropping empty message");
            return Ok(());
        }

        debug!(client_id = %self.id, text, "received message");
        self.hub
            .broadcast(ChatMessage::new(self.id, self.name.clone(), text))
            .await?;
        Ok(())
    }
}

struct Writer {
    id: ClientId,
    outbound: mpsc::Receiver<Arc<ChatMessage>>,
    write_wait: Duration,
    ping_period: Duration,
}

impl Writer {
    async fn run<Si>(mut self, mut sink: Si, cancel: CancellationToken) -> Result<(), PumpError>
    where
        Si: Sink<Message> + Unpin,
        Si::Error: Into<BoxError>,
    {
        let mut keepalive = time::interval_at(Instant::now() + self.ping_period, self.ping_period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.close(&mut sink, "connection closing").await;
                    return Ok(());
                }
                next = self.outbound.recv() => match next {
                    Some(message) => {
                        if message.from() == self.id {
                            continue;
                        }
                        self.write(&mut sink, Message::Text(message.to_frame())).await?;
                    }
                    None => {
                        self.close(&mut sink, "closing chat room").await;
                        return Err(PumpError::Unregistered);
                    }
                },
                _ = keepalive.tick() => {
                    self.write(&mut sink, Message::Ping(Vec::new())).await?;
                }
            }
        }
    }

    async fn write<Si>(&self, sink: &mut Si, message: Message) -> Result<(), PumpError>
    where
        Si: Sink<Message> + Unpin,
        Si::Error: Into<BoxError>,
    {
        match time::timeout(self.write_wait, sink.send(message)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(PumpError::Transport(err.into())),
            Err(_) => Err(PumpError::WriteTimeout(self.write_wait)),
        }
    }

    /// Best effort: the peer may already be gone.
    async fn close<Si>(&self, sink: &mut Si, reason: &'static str)
    where
        Si: Sink<Message> + Unpin,
        Si::Error: Into<BoxError>,
    {
        let frame = CloseFrame {
            code: close_code::NORMAL,
            reason: reason.into(),
        };
        if let Err(err) = self.write(sink, Message::Close(Some(frame))).await {
            debug!(client_id = %self.id, error = %err, "close frame not delivered");
        }
    }
}
