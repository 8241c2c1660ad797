mod cmd;

use anyhow::Result as AnyhowResult;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "scriptnet")]
#[command(about = "Runs script-style network sessions over sandboxed descriptors", long_about = None)]
struct Args {
    /// Session options file (JSON)
    #[arg(long, global = true, value_name = "FILE")]
    options: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Echo everything received on accepted connections
    Serve {
        /// Address to listen on (`*` for every address family)
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Port to listen on
        #[arg(long)]
        port: u16,

        /// Connections beyond this count are closed right away
        #[arg(long, default_value_t = 16)]
        max_clients: usize,
    },
    /// Send a message and print the first reply
    Send {
        /// Host to connect to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Port to connect to
        #[arg(long)]
        port: u16,

        /// Message to send
        message: String,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(args: Args) -> AnyhowResult<()> {
    let options = cmd::load_options(args.options.as_deref())?;

    match args.command {
        Commands::Serve {
            host,
            port,
            max_clients,
        } => cmd::handle_serve_command(options, host, port, max_clients).await,
        Commands::Send {
            host,
            port,
            message,
        } => {
            let mut stdout = std::io::stdout();
            cmd::handle_send_command(&mut stdout, options, host, port, message).await
        }
    }
}

#[tokio::main]
async fn main() {
    init_tracing();
    let args = Args::parse();

    if let Err(e) = run(args).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
