use anyhow::Result;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use chat_hub::{
    cli::{Cli, Command},
    client,
    hub::Hub,
    pump::PumpConfig,
    server::{Server, CHAT_PATH},
};

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => {
            let listener = TcpListener::bind(args.listen).await?;
            let hub = Hub::spawn();
            let config = PumpConfig::default();
            info!(
                max_message_size = config.max_message_size,
                write_wait = ?config.write_wait,
                pong_wait = ?config.pong_wait,
                ping_period = ?config.ping_period,
                "connection limits"
            );
            let server = Server::new(listener, hub, config);
            let addr = server.local_addr()?;
            info!("chat server listening on ws://{}{}", addr, CHAT_PATH);
            if let Err(err) = server.run_until_ctrl_c().await {
                warn!("server exited with error: {err:?}");
                return Err(err);
            }
        }
        Command::Client(args) => client::run(args).await?,
    }

    Ok(())
}
