mod daemon;
mod secrets;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use soul_config::EngineConfig;

#[derive(Debug, Parser)]
#[command(name = "soul", version, about = "A persistent personal-agent daemon")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start the engine (daemonized unless --foreground).
    Start {
        #[arg(long)]
        foreground: bool,
    },
    /// Stop a running engine.
    Stop,
    /// Show engine status from the pulse and mood files.
    Status,
    /// Encrypt .env to .env.enc using SOUL_SECRET_KEY.
    EncryptEnv,
    /// Decrypt .env.enc back to .env.
    DecryptEnv,
    /// Re-encrypt .env.enc under SOUL_SECRET_KEY_NEW.
    RotateKey,
}

fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let config = EngineConfig::load_from("soul.toml")?;

    match cli.command {
        Commands::Start { foreground } => {
            if foreground || std::env::var("SOUL_DAEMON_PROCESS").as_deref() == Ok("1") {
                daemon::run_engine_process(config)
            } else {
                daemon::daemon_start(&config)
            }
        }
        Commands::Stop => daemon::daemon_stop(&config),
        Commands::Status => daemon::daemon_status(&config),
        Commands::EncryptEnv => secrets::encrypt_env(&config),
        Commands::DecryptEnv => secrets::decrypt_env(&config),
        Commands::RotateKey => secrets::rotate_key(&config),
    }
}
