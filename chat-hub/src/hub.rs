//! The hub owns the set of connected clients.
//!
//! The client map lives inside a single task and is reachable only through
//! [`HubHandle`]. Register, unregister and broadcast requests travel over one
//! command channel, so the loop handles them strictly one at a time and no
//! iteration over the map ever overlaps a mutation.
//!
//! Broadcast awaits each recipient's outbound queue in turn. A recipient whose
//! queue is full holds up every other client, and registration traffic, until
//! its writer drains. That tradeoff is kept on purpose; the only relief is that
//! a recipient whose writer already exited fails the send at once and is
//! dropped from the map.

use std::{collections::HashMap, sync::Arc};

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::message::{ChatMessage, ClientId, DisplayName};

pub const COMMAND_CAPACITY: usize = 64;

pub const OUTBOUND_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("hub is no longer running")]
pub struct HubClosed;

/// The pump's side of a connection: identity plus the receiving end of its
/// outbound queue.
#[derive(Debug)]
pub struct Client {
    id: ClientId,
    name: DisplayName,
    outbound: mpsc::Receiver<Arc<ChatMessage>>,
}

/// The hub's side of a connection. Holds the only sender of the outbound
/// queue, so dropping it is what closes the queue.
#[derive(Debug)]
pub struct ClientHandle {
    id: ClientId,
    outbound: mpsc::Sender<Arc<ChatMessage>>,
}

impl Client {
    /// Creates a fresh client with a bounded outbound queue.
    pub fn new(name: DisplayName, capacity: usize) -> (Client, ClientHandle) {
        let id = ClientId::next();
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        let client = Client {
            id,
            name,
            outbound: outbound_rx,
        };
        let handle = ClientHandle {
            id,
            outbound: outbound_tx,
        };
        (client, handle)
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn name(&self) -> &DisplayName {
        &self.name
    }

    /// Next message routed to this client, or `None` once the hub has closed
    /// the queue.
    pub async fn recv(&mut self) -> Option<Arc<ChatMessage>> {
        self.outbound.recv().await
    }

    pub(crate) fn into_parts(self) -> (ClientId, DisplayName, mpsc::Receiver<Arc<ChatMessage>>) {
        (self.id, self.name, self.outbound)
    }
}

impl ClientHandle {
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Waits for room on the outbound queue. Fails only once the pump's
    /// writer has dropped its receiver.
    pub(crate) async fn deliver(&self, message: Arc<ChatMessage>) -> Result<(), Arc<ChatMessage>> {
        self.outbound.send(message).await.map_err(|err| err.0)
    }
}

#[derive(Debug)]
enum HubCommand {
    Register(ClientHandle),
    Unregister(ClientId),
    Broadcast(ChatMessage),
}

/// Cloneable entry point to a running [`Hub`].
#[derive(Debug, Clone)]
pub struct HubHandle {
    commands: mpsc::Sender<HubCommand>,
}

impl HubHandle {
    pub async fn register(&self, client: ClientHandle) -> Result<(), HubClosed> {
        self.send(HubCommand::Register(client)).await
    }

    /// Removes the client and closes its outbound queue. Unknown ids are
    /// ignored, so calling this twice is harmless.
    pub async fn unregister(&self, id: ClientId) -> Result<(), HubClosed> {
        self.send(HubCommand::Unregister(id)).await
    }

    pub async fn broadcast(&self, message: ChatMessage) -> Result<(), HubClosed> {
        self.send(HubCommand::Broadcast(message)).await
    }

    async fn send(&self, command: HubCommand) -> Result<(), HubClosed> {
        self.commands.send(command).await.map_err(|_| HubClosed)
    }
}

pub struct Hub {
    clients: HashMap<ClientId, ClientHandle>,
    commands: mpsc::Receiver<HubCommand>,
}

impl Hub {
    pub fn new() -> (Hub, HubHandle) {
        Self::with_capacity(COMMAND_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> (Hub, HubHandle) {
        let (commands_tx, commands_rx) = mpsc::channel(capacity);
        let hub = Hub {
            clients: HashMap::new(),
            commands: commands_rx,
        };
        (hub, HubHandle { commands: commands_tx })
    }

    /// Starts the hub on the runtime and returns a handle to it.
    pub fn spawn() -> HubHandle {
        let (hub, handle) = Self::new();
        tokio::spawn(hub.run());
        handle
    }

    /// Processes commands until every [`HubHandle`] has been dropped.
    pub async fn run(mut self) {
        while let Some(command) = self.commands.recv().await {
            match command {
                HubCommand::Register(client) => self.register(client),
                HubCommand::Unregister(id) => self.unregister(id),
                HubCommand::Broadcast(message) => self.broadcast(message).await,
            }
        }
        debug!(clients = self.clients.len(), "hub stopped");
    }

    fn register(&mut self, client: ClientHandle) {
        let id = client.id;
        if self.clients.insert(id, client).is_some() {
            warn!(client_id = %id, "client registered twice; replaced previous handle");
        }
        info!(client_id = %id, clients = self.clients.len(), "client registered");
    }

    fn unregister(&mut self, id: ClientId) {
        // Dropping the handle drops the only sender and closes the queue.
        match self.clients.remove(&id) {
            Some(_) => info!(client_id = %id, clients = self.clients.len(), "client unregistered"),
            None => debug!(client_id = %id, "unregister for unknown client ignored"),
        }
    }

    async fn broadcast(&mut self, message: ChatMessage) {
        let sender = message.from();
        let message = Arc::new(message);
        let mut stale = Vec::new();

        for (id, client) in &self.clients {
            if *id == sender {
                continue;
            }
            if client.deliver(Arc::clone(&message)).await.is_err() {
                stale.push(*id);
            }
        }

        for id in stale {
            warn!(client_id = %id, "outbound queue gone; dropping client");
            self.clients.remove(&id);
        }
    }
}
