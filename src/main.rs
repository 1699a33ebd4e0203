use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use proctor_engine::api::{HttpApi, ProctorApi};
use proctor_engine::config::ServerConfig;
use proctor_engine::registry::qr_payload;
use proctor_engine::serve;
use proctor_engine::types::{DeviceRole, RoleConfig};

#[derive(Parser, Debug)]
#[command(author, version, about = "Interview proctoring server and operator tools")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RecordingAction {
    On,
    Off,
    Status,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the proctoring HTTP server
    Serve {
        /// Path to config file (TOML format)
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Create a session and print its join tokens
    CreateSession {
        /// Base URL of the proctoring server
        #[arg(short, long)]
        server: String,

        /// Mint a token for a phone joining as side camera
        #[arg(long)]
        secondary: bool,

        /// Do not mint a reviewer token
        #[arg(long)]
        no_reviewer: bool,
    },
    /// Show or change a session's recording flag
    Recording {
        #[arg(short, long)]
        server: String,

        /// Device credential of a primary or reviewer device
        #[arg(short, long)]
        credential: String,

        #[arg(value_enum, default_value = "status")]
        action: RecordingAction,
    },
    /// Print a session's integrity report
    Report {
        #[arg(short, long)]
        server: String,

        #[arg(long)]
        session: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    match args.command {
        Command::Serve { config } => {
            let config = ServerConfig::load(&config)?;
            serve::serve(config).await?;
        }
        Command::CreateSession {
            server,
            secondary,
            no_reviewer,
        } => {
            let api = HttpApi::new(&server)?;
            let created = api
                .create_session(RoleConfig {
                    secondary,
                    reviewer: !no_reviewer,
                })
                .await?;
            println!("Session: {}", created.session.session_id);
            for token in &created.session.join_tokens {
                println!("  {:<9} {}", token.role.as_str(), token.token);
            }
            // the server only builds the QR link when it knows its public URL
            let qr = created.secondary_qr.or_else(|| {
                created
                    .session
                    .token_for(DeviceRole::Secondary)
                    .map(|token| qr_payload(&server, token))
            });
            if let Some(qr) = qr {
                println!("Secondary QR payload: {}", qr);
            }
        }
        Command::Recording {
            server,
            credential,
            action,
        } => {
            let api = HttpApi::new(&server)?;
            let recording = match action {
                RecordingAction::On => api.set_recording(&credential, true).await?,
                RecordingAction::Off => api.set_recording(&credential, false).await?,
                RecordingAction::Status => api.get_recording(&credential).await?,
            };
            println!("Recording: {}", if recording { "on" } else { "off" });
        }
        Command::Report { server, session } => {
            let api = HttpApi::new(&server)?;
            let report = api.session_report(&session).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(())
}
