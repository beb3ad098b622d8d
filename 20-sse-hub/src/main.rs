use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use sse_hub::{
    Client, ClientConfig, Hub, HubConfig,
    cli::{Cli, Command, ListenArgs, ServeArgs},
    server,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => serve(args).await?,
        Command::Listen(args) => listen(args).await,
    }

    Ok(())
}

async fn serve(args: ServeArgs) -> Result<()> {
    let listener = TcpListener::bind(args.listen).await?;
    let hub = Hub::new(HubConfig {
        mailbox_capacity: args.mailbox_capacity,
        ..HubConfig::default()
    });
    let addr = listener.local_addr()?;
    info!("hub listening on {}", addr);
    if let Err(err) = server::run_until_ctrl_c(listener, hub).await {
        warn!("hub exited with error: {err:?}");
        return Err(err);
    }
    Ok(())
}

async fn listen(args: ListenArgs) {
    let client = Client::new(
        ClientConfig::new(args.url).reconnect_delay(Duration::from_millis(args.reconnect_delay_ms)),
    );

    for event in args.events {
        client.subscribe_event(event, |message| {
            let id = if message.id.is_empty() { "-" } else { &message.id };
            println!("[{id}] {}: {}", message.event, message.data.trim_end());
        });
    }
    client.on_connect(|| println!("*** connected"));
    client.on_disconnect(|reason| println!("*** disconnected: {reason}"));
    client.on_exit(|| println!("*** stopped"));

    let stopper = client.clone();
    tokio::spawn(async move {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!(?error, "ctrl-c handler failed");
        }
        stopper.stop();
    });

    client.start().await;
}
