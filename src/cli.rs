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
    /// Run the relay server, accepting control and broadcast connections.
    Server(ServerArgs),
    /// Connect to a relay server and chat interactively.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Socket address for the request/reply control channel. Use port 0
    /// for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:5555")]
    pub control: SocketAddr,

    /// Socket address for the fan-out broadcast channel.
    #[arg(long, default_value = "127.0.0.1:5556")]
    pub broadcast: SocketAddr,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// User id sent with every request.
    #[arg(long, default_value = "anon")]
    pub user: String,

    /// Control endpoint of the server.
    #[arg(long, default_value = "127.0.0.1:5555")]
    pub control: SocketAddr,

    /// Broadcast endpoint of the server.
    #[arg(long, default_value = "127.0.0.1:5556")]
    pub broadcast: SocketAddr,
}
