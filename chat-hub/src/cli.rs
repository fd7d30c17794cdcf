use std::net::SocketAddr;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the chat server, accepting WebSocket connections on /chat.
    Serve(ServeArgs),
    /// Connect to a server and chat from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Socket address the server should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:8080")]
    pub listen: SocketAddr,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Display name shown to other participants. Must not contain ':'.
    #[arg(long)]
    pub name: String,

    /// WebSocket URL of the chat endpoint.
    #[arg(long, default_value = "ws://127.0.0.1:8080/chat")]
    pub url: String,
}
