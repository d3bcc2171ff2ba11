use std::{net::SocketAddr, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::server::HubConfig;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the broadcast hub, accepting WebSocket clients on /ws/{client_id}.
    Serve(ServeArgs),
    /// Connect to a hub and relay stdin lines as chat messages.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Socket address the hub should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:8000")]
    pub listen: SocketAddr,

    /// Longest a broadcast waits on any single recipient, in milliseconds.
    #[arg(long, default_value_t = 5000)]
    pub send_timeout_ms: u64,

    /// Outbound frames buffered per connection.
    #[arg(long, default_value_t = 64, value_parser = clap::value_parser!(u32).range(1..))]
    pub outbound_capacity: u32,
}

impl ServeArgs {
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            send_timeout: Duration::from_millis(self.send_timeout_ms),
            outbound_capacity: self.outbound_capacity as usize,
            ..HubConfig::default()
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Identifier shown to other participants. Not checked for uniqueness.
    #[arg(long)]
    pub id: String,

    /// Address of the hub to connect to.
    #[arg(long, default_value = "127.0.0.1:8000")]
    pub server: SocketAddr,
}

impl ClientArgs {
    pub fn url(&self) -> String {
        format!("ws://{}/ws/{}", self.server, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_defaults_match_hub_defaults() {
        let cli = Cli::parse_from(["broadcast_hub", "serve"]);
        let Command::Serve(args) = cli.command else {
            panic!("expected serve command");
        };

        let config = args.hub_config();
        let defaults = HubConfig::default();
        assert_eq!(config.send_timeout, defaults.send_timeout);
        assert_eq!(config.outbound_capacity, defaults.outbound_capacity);
    }

    #[test]
    fn zero_outbound_capacity_is_rejected() {
        let parsed = Cli::try_parse_from(["broadcast_hub", "serve", "--outbound-capacity", "0"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn client_url_carries_the_id_as_a_path_segment() {
        let cli = Cli::parse_from([
            "broadcast_hub",
            "client",
            "--id",
            "alice",
            "--server",
            "127.0.0.1:9000",
        ]);
        let Command::Client(args) = cli.command else {
            panic!("expected client command");
        };

        assert_eq!(args.url(), "ws://127.0.0.1:9000/ws/alice");
    }
}
