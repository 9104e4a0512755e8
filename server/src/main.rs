use clap::Parser;
use log::{error, info};
use protocol::items::GameSettings;
use protocol::NetConfig;
use server::network::Server;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server IP address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Server port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Update packets sent per second to each client
    #[arg(short, long, default_value = "20")]
    tick_rate: u32,

    /// Maximum number of connected players
    #[arg(short, long, default_value = "64")]
    max_clients: usize,

    /// Seconds of silence before a client is dropped
    #[arg(long, default_value = "5")]
    timeout: u64,

    /// Unacknowledged packets newer than this count as lost
    #[arg(long, default_value = "10")]
    loss_threshold: u16,

    /// Let players pick a team
    #[arg(long)]
    team_selection: bool,

    /// Allow players to damage each other
    #[arg(long)]
    pvp: bool,
}

impl Args {
    fn net_config(&self) -> NetConfig {
        let mut config = NetConfig {
            tick_interval: Duration::from_secs_f64(1.0 / f64::from(self.tick_rate.max(1))),
            connection_timeout: Duration::from_secs(self.timeout),
            ..Default::default()
        };
        config.reliability.loss_threshold = self.loss_threshold;
        config
    }

    fn settings(&self) -> GameSettings {
        GameSettings {
            pvp: self.pvp,
            team_selection: self.team_selection,
            max_players: u16::try_from(self.max_clients).unwrap_or(u16::MAX),
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let address = format!("{}:{}", args.host, args.port);

    info!("Starting server on {} at {}Hz", address, args.tick_rate);

    let mut server = Server::new(&address, args.net_config(), args.max_clients)
        .await?
        .with_settings(args.settings());
    let handle = server.handle();

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, shutting down gracefully...");
                handle.shutdown();
            }
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
    });

    server.run().await?;

    Ok(())
}
