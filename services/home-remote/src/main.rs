use clap::{Parser, Subcommand};
use home_remote::{load_config, Config, ConnectionEvent, DeviceState, RemoteClient, SessionStatus};
use serde_json::Value;
use std::path::PathBuf;
use tracing::{debug, info, warn, Level};

#[derive(Parser)]
#[command(name = "home-remote")]
#[command(about = "Session and live-update client for a home remote-control backend")]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Backend base URL (overrides the configuration file)
    #[arg(long)]
    base_url: Option<String>,

    /// Log level
    #[arg(short, long, default_value = "info", value_parser = clap::value_parser!(Level))]
    log_level: Level,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Verify the session and print the profile
    Verify,

    /// Keep the live connection open and log updates until Ctrl+C
    Monitor,

    /// POST a JSON command to the backend
    Send {
        /// Resource path, e.g. /api/remote
        path: String,

        /// JSON body
        body: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(args.log_level)
        .init();

    debug!(
        "Parsed command line arguments: config={:?}, base_url={:?}, log_level={:?}",
        args.config, args.base_url, args.log_level
    );

    let mut config = match &args.config {
        Some(path) => {
            debug!("Loading configuration from {:?}", path);
            load_config(path)?
        }
        None => Config::default(),
    };
    if let Some(base_url) = args.base_url {
        config.server.base_url = base_url;
    }

    let client = RemoteClient::builder(config).build()?;

    match args.command {
        Commands::Verify => run_verify(&client).await?,
        Commands::Monitor => run_monitor(&client).await?,
        Commands::Send { path, body } => run_send(&client, &path, &body).await?,
    }

    client.shutdown().await;
    Ok(())
}

async fn run_verify(client: &RemoteClient) -> Result<(), Box<dyn std::error::Error>> {
    let status = client.start().await?;
    println!("Session: {}", status);
    if let Some(profile) = client.device_state().profile {
        println!("Profile: {}", serde_json::to_string_pretty(&profile)?);
    }
    Ok(())
}

async fn run_monitor(client: &RemoteClient) -> Result<(), Box<dyn std::error::Error>> {
    let status = client.start().await?;
    if status != SessionStatus::Authenticated {
        warn!("Session is {}; waiting for it to become authenticated", status);
    }

    info!("Monitoring live updates (press Ctrl+C to stop)...");

    let mut events = client.subscribe_connection().await?;
    let mut devices = client.subscribe_devices();
    let mut session = client.subscribe_session();

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(event) => print_event(&event),
                    Err(e) => {
                        debug!("Event receiver error: {}", e);
                        break;
                    }
                }
            }
            changed = devices.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = devices.borrow_and_update().clone();
                print_state(&state);
            }
            changed = session.changed() => {
                if changed.is_err() {
                    break;
                }
                let status = *session.borrow_and_update();
                info!("Session: {}", status);
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
        }
    }

    Ok(())
}

async fn run_send(
    client: &RemoteClient,
    path: &str,
    body: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let command: Value = serde_json::from_str(body)?;

    let status = client.start().await?;
    if status != SessionStatus::Authenticated {
        warn!("Session is {}; the command will likely be rejected", status);
    }

    let response = client.send_command(path, &command).await?;
    println!("{} {}", response.status, response.body);
    Ok(())
}

fn print_event(event: &ConnectionEvent) {
    match event {
        ConnectionEvent::Connecting { generation } => {
            info!("Event: Connecting (attempt {})", generation);
        }
        ConnectionEvent::Opened { generation } => {
            info!("Event: Opened (attempt {})", generation);
        }
        ConnectionEvent::Closed {
            generation,
            code,
            reason,
        } => {
            info!(
                "Event: Closed (attempt {}, code {:?}) {}",
                generation, code, reason
            );
        }
        ConnectionEvent::ReconnectScheduled { delay } => {
            info!("Event: Reconnecting in {:?}", delay);
        }
        ConnectionEvent::Unauthorized => {
            warn!("Event: Unauthorized, live updates stopped");
        }
        ConnectionEvent::Disposed => {
            info!("Event: Disposed");
        }
    }
}

fn print_state(state: &DeviceState) {
    info!(
        "Devices: temperature={:?} humidity={:?} switch_bots={} checkers={}",
        state.temperature,
        state.humidity,
        state.switch_bot_list.len(),
        state.checker_list.len()
    );
}
