use clap::Parser;
use client::network::Client;
use log::info;
use protocol::{NetConfig, Vector2};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:8080")]
    server: String,

    /// Name shown to other players
    #[arg(short, long, default_value = "player")]
    username: String,

    /// Update packets sent per second
    #[arg(short, long, default_value = "20")]
    tick_rate: u32,

    /// Seconds of silence before giving up on the server
    #[arg(long, default_value = "5")]
    timeout: u64,

    /// Scene to enter after logging in
    #[arg(long)]
    scene: Option<String>,
}

impl Args {
    fn net_config(&self) -> NetConfig {
        NetConfig {
            tick_interval: Duration::from_secs_f64(1.0 / f64::from(self.tick_rate.max(1))),
            connection_timeout: Duration::from_secs(self.timeout),
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

    info!("Starting client...");
    info!("Connecting to: {}", args.server);

    let client = Client::new(&args.server, &args.username, args.net_config()).await?;
    let connection = client.connect().await?;

    if let Some(scene) = &args.scene {
        connection.enter_scene(scene, Vector2::default());
    }
    info!("Type a line to chat, /quit to leave");

    connection.run().await?;

    Ok(())
}
