use std::time::Duration;

use anyhow::Result;
use chat_hub::{
    hub::{Client, ClientHandle, Hub, OUTBOUND_CAPACITY},
    message::{ChatMessage, ClientId, DisplayName},
};
use tokio::time::timeout;

const RECV_TIMEOUT: Duration = Duration::from_secs(1);

fn new_client(name: &str) -> (Client, ClientHandle) {
    let name = DisplayName::parse(name).expect("test names are valid");
    Client::new(name, OUTBOUND_CAPACITY)
}

fn message_from(client: &Client, text: &str) -> ChatMessage {
    ChatMessage::new(client.id(), client.name().clone(), text)
}

#[tokio::test]
async fn broadcast_reaches_every_other_registered_client() -> Result<()> {
    let hub = Hub::spawn();
    let mut clients = Vec::new();
    for name in ["ann", "ben", "cat", "dan", "eve"] {
        let (client, handle) = new_client(name);
        hub.register(handle).await?;
        clients.push(client);
    }

    let sender = 2;
    hub.broadcast(message_from(&clients[sender], "hello room"))
        .await?;

    for (index, client) in clients.iter_mut().enumerate() {
        if index == sender {
            continue;
        }
        let received = timeout(RECV_TIMEOUT, client.recv())
            .await?
            .expect("queue stays open while registered");
        assert_eq!(received.text(), "hello room");
        assert_eq!(received.name().as_str(), "cat");
    }

    // Anything queued for the sender would be its own message.
    let follow_up = message_from(&clients[0], "sentinel");
    hub.broadcast(follow_up).await?;
    let next = timeout(RECV_TIMEOUT, clients[sender].recv())
        .await?
        .expect("sender still registered");
    assert_eq!(next.text(), "sentinel");

    Ok(())
}

#[tokio::test]
async fn clients_outside_the_hub_receive_nothing() -> Result<()> {
    let hub = Hub::spawn();
    let (speaker, speaker_handle) = new_client("speaker");
    let (mut listener, listener_handle) = new_client("listener");
    let (mut leaver, leaver_handle) = new_client("leaver");
    let (mut stranger, _stranger_handle) = new_client("stranger");

    hub.register(speaker_handle).await?;
    hub.register(listener_handle).await?;
    hub.register(leaver_handle).await?;
    hub.unregister(leaver.id()).await?;

    hub.broadcast(message_from(&speaker, "members only")).await?;

    let received = timeout(RECV_TIMEOUT, listener.recv())
        .await?
        .expect("listener is registered");
    assert_eq!(received.text(), "members only");

    assert!(leaver.recv().await.is_none(), "queue closed on unregister");
    assert!(
        timeout(Duration::from_millis(50), stranger.recv()).await.is_err(),
        "never-registered client must not receive broadcasts"
    );

    Ok(())
}

#[tokio::test]
async fn unregister_is_idempotent() -> Result<()> {
    let hub = Hub::spawn();
    let (mut client, handle) = new_client("twice");
    let (other, other_handle) = new_client("other");
    let id = client.id();

    hub.register(handle).await?;
    hub.register(other_handle).await?;
    hub.unregister(id).await?;
    hub.unregister(id).await?;
    hub.unregister(ClientId::next()).await?;

    assert!(client.recv().await.is_none());

    // The hub is still serving after the redundant requests.
    let (mut late, late_handle) = new_client("late");
    hub.register(late_handle).await?;
    hub.broadcast(message_from(&other, "still here")).await?;
    let received = timeout(RECV_TIMEOUT, late.recv())
        .await?
        .expect("late joiner is registered");
    assert_eq!(received.text(), "still here");

    Ok(())
}

#[tokio::test]
async fn hub_stops_when_every_handle_is_dropped() -> Result<()> {
    let (hub, handle) = Hub::new();
    let running = tokio::spawn(hub.run());
    let (mut client, client_handle) = new_client("last");

    handle.register(client_handle).await?;
    drop(handle);

    timeout(RECV_TIMEOUT, running).await??;
    assert!(client.recv().await.is_none());

    Ok(())
}
