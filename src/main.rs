use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use filecast::{Config, FileReceiver, FileSender};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "filecast")]
#[command(about = "Reliable one-to-many UDP file broadcast")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "filecast.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Broadcast files to every listening receiver
    Send {
        /// Broadcast address (default 255.255.255.255)
        #[arg(long)]
        baddr: Option<String>,

        /// Port to listen on for acknowledgment replies (default 9000)
        #[arg(long)]
        port: Option<u16>,

        /// Artificial chance of dropping inbound ACKs, 0-100 (default 0)
        #[arg(long, value_parser = clap::value_parser!(u8).range(0..=100))]
        drop: Option<u8>,

        /// Files to broadcast, in order
        #[arg(value_name = "FILE", required = true)]
        files: Vec<PathBuf>,
    },
    /// Receive broadcast files into a directory
    Recv {
        /// The sender's reply port (default 9000)
        #[arg(long)]
        port: Option<u16>,

        /// Artificial chance of dropping inbound datagrams, 0-100 (default 0)
        #[arg(long, value_parser = clap::value_parser!(u8).range(0..=100))]
        drop: Option<u8>,

        /// Output directory for received files (default ./downloads)
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();
    let config = match Config::load_or_create(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!(path = %cli.config.display(), error = %e, "cannot load configuration");
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command {
        Commands::Send {
            baddr,
            port,
            drop,
            files,
        } => {
            let mut sender_config = config.sender;
            if let Some(baddr) = baddr {
                sender_config.broadcast_addr = baddr;
            }
            if let Some(port) = port {
                sender_config.listen_port = port;
            }
            if let Some(drop) = drop {
                sender_config.drop_chance = drop;
            }
            run_sender(sender_config, files).await
        }
        Commands::Recv { port, drop, out } => {
            let mut receiver_config = config.receiver;
            if let Some(port) = port {
                receiver_config.sender_port = port;
            }
            if let Some(drop) = drop {
                receiver_config.drop_chance = drop;
            }
            if let Some(out) = out {
                receiver_config.output_dir = out.to_string_lossy().into_owned();
            }
            match FileReceiver::new(receiver_config) {
                Ok(receiver) => receiver.run().await,
                Err(e) => Err(e),
            }
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "terminating");
            ExitCode::FAILURE
        }
    }
}

async fn run_sender(
    config: filecast::SenderConfig,
    files: Vec<PathBuf>,
) -> Result<(), filecast::TransferError> {
    let (sender, done) = FileSender::new(config).await?;
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping after the current file");
            done.signal();
        }
    });
    sender.run(files).await
}
