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
    /// Run an event-stream hub over HTTP.
    Serve(ServeArgs),
    /// Follow an event stream and print the events it delivers.
    Listen(ListenArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Socket address the hub should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:8080")]
    pub listen: SocketAddr,

    /// Messages queued per subscriber before broadcasts to it are dropped.
    #[arg(long, default_value_t = 32)]
    pub mailbox_capacity: usize,
}

#[derive(Args, Debug, Clone)]
pub struct ListenArgs {
    /// Event stream to follow.
    #[arg(long, default_value = "http://127.0.0.1:8080/events")]
    pub url: String,

    /// Event names to print. Repeat the flag for several events.
    #[arg(long = "event", default_values_t = [String::from("ping")])]
    pub events: Vec<String>,

    /// Milliseconds to wait before reconnecting.
    #[arg(long, default_value_t = 3000)]
    pub reconnect_delay_ms: u64,
}
