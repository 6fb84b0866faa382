mod settings;

use clap::{Parser, Subcommand};
use realtime::prelude::*;
use settings::Settings;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "tracker")]
#[command(about = "Watch live fleet positions over the realtime channel")]
struct Cli {
    /// TOML settings file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// JSON file holding the stored credential
    #[arg(long, global = true)]
    credentials: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store the bearer token used to authenticate the channel
    Login {
        #[arg(short, long)]
        token: String,
    },
    /// Forget the stored bearer token
    Logout,
    /// Stream positions, status changes and events until interrupted
    Watch {
        /// Device to subscribe to (repeatable)
        #[arg(short, long = "device")]
        devices: Vec<String>,
        /// Server base URL, overrides the settings file and TRACKER_SOCKET_URL
        #[arg(long)]
        url: Option<String>,
    },
    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref())?;
    let credentials_path = settings.credentials_path(cli.credentials);
    let credentials = Arc::new(FileCredentialStore::new(credentials_path));
    let key = settings.realtime.credential_key.clone();

    match cli.command {
        Commands::Login { token } => {
            if token.trim().is_empty() {
                return Err("Token cannot be empty".into());
            }
            credentials.set_item(&key, token.trim()).await?;
            println!("Token stored in {}", credentials.path().display());
        }
        Commands::Logout => {
            credentials.delete_item(&key).await?;
            println!("Token removed from {}", credentials.path().display());
        }
        Commands::Watch { devices, url } => {
            let settings = settings.with_base_url(url);
            settings.validate()?;
            let devices = if devices.is_empty() {
                settings.devices.clone()
            } else {
                devices
            };
            watch(settings.realtime, credentials, devices).await?;
        }
        Commands::Config => {
            print!("{}", settings.to_toml()?);
        }
    }

    Ok(())
}

async fn watch(
    config: RealtimeConfig,
    credentials: Arc<FileCredentialStore>,
    devices: Vec<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    if credentials.get_item(&config.credential_key).await?.is_none() {
        warn!(
            "No token in {}, run `tracker login --token <token>` first",
            credentials.path().display()
        );
    }

    info!("Watching {} via {}", describe(&devices), config.base_url);
    let channel = RealtimeChannel::new(config, credentials)?;

    let _positions = channel.on_position_update(|position: &PositionUpdate| {
        println!(
            "[{}] {} at {:.5}, {:.5} ({:.1} km/h, {:.0}°)",
            position.timestamp,
            position.device_id,
            position.latitude,
            position.longitude,
            position.speed,
            position.course
        );
    });
    let _statuses = channel.on_device_status(|status: &DeviceStatus| {
        println!("[{}] {} is {}", status.timestamp, status.device_id, status.status);
    });
    let _events = channel.on_event(|event: &EventNotification| {
        println!(
            "[{}] {} {}: {}",
            event.timestamp, event.device_id, event.event_type, event.message
        );
    });

    let mut state = channel.connection_state();
    let mut subscribed = false;
    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);

    loop {
        tokio::select! {
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let connected = *state.borrow_and_update();
                if !connected {
                    warn!("Connection lost");
                    continue;
                }
                info!("Connected");
                // The channel replays these itself after a reconnection.
                if !subscribed {
                    for device_id in &devices {
                        channel.subscribe_to_device(device_id.clone());
                    }
                    subscribed = true;
                }
            }
            result = &mut interrupt => {
                result?;
                info!("Interrupted, closing channel");
                break;
            }
        }
    }

    channel.close().await;
    Ok(())
}

fn describe(devices: &[String]) -> String {
    if devices.is_empty() {
        "no devices".to_string()
    } else {
        devices.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_watch() {
        let cli = Cli::try_parse_from([
            "tracker",
            "--config",
            "tracker.toml",
            "watch",
            "-d",
            "truck-7",
            "--device",
            "van-2",
            "--url",
            "https://fleet.example.com",
        ])
        .unwrap();

        assert_eq!(cli.config, Some(PathBuf::from("tracker.toml")));
        match cli.command {
            Commands::Watch { devices, url } => {
                assert_eq!(devices, vec!["truck-7", "van-2"]);
                assert_eq!(url.as_deref(), Some("https://fleet.example.com"));
            }
            _ => panic!("expected watch command"),
        }
    }

    #[test]
    fn test_cli_global_flags_after_subcommand() {
        let cli =
            Cli::try_parse_from(["tracker", "login", "--token", "abc", "--credentials", "c.json"])
                .unwrap();

        assert_eq!(cli.credentials, Some(PathBuf::from("c.json")));
        assert!(matches!(cli.command, Commands::Login { token } if token == "abc"));
    }

    #[test]
    fn test_login_requires_token() {
        assert!(Cli::try_parse_from(["tracker", "login"]).is_err());
    }

    #[test]
    fn test_describe_devices() {
        assert_eq!(describe(&[]), "no devices");
        assert_eq!(
            describe(&["a".to_string(), "b".to_string()]),
            "a, b"
        );
    }
}
